use std::collections::{HashMap, HashSet};

use crate::ir::instr::reshape_rank;
use crate::ir::view::disjoint;
use crate::ir::{dependency, BaseId, Instruction, Opcode};

/// A node of the fused loop tree: a leaf instruction or a nested loop.
#[derive(Debug, Clone)]
pub enum Block {
    Instr(Instruction),
    Loop(LoopBlock),
}

impl Block {
    pub fn as_instr(&self) -> Option<&Instruction> {
        match self {
            Block::Instr(i) => Some(i),
            Block::Loop(_) => None,
        }
    }

    pub fn as_loop(&self) -> Option<&LoopBlock> {
        match self {
            Block::Instr(_) => None,
            Block::Loop(l) => Some(l),
        }
    }
}

/// A loop over one axis. Rank −1 is the kernel root; its `size` is unused.
#[derive(Debug, Clone)]
pub struct LoopBlock {
    pub rank: i64,
    pub size: i64,
    pub children: Vec<Block>,
    /// Bases whose whole lifetime is inside this loop; candidates for
    /// scalar temporaries instead of kernel parameters.
    pub local_temps: HashSet<BaseId>,
}

impl LoopBlock {
    pub fn kernel_root() -> Self {
        LoopBlock { rank: -1, size: 1, children: Vec::new(), local_temps: HashSet::new() }
    }

    /// Every instruction in the subtree, dependency order preserved.
    pub fn all_instrs(&self) -> Vec<&Instruction> {
        let mut out = Vec::new();
        self.collect_instrs(&mut out);
        out
    }

    fn collect_instrs<'a>(&'a self, out: &mut Vec<&'a Instruction>) {
        for child in &self.children {
            match child {
                Block::Instr(i) => out.push(i),
                Block::Loop(l) => l.collect_instrs(out),
            }
        }
    }

    /// Leaf instructions sitting directly in this loop.
    pub fn local_instrs(&self) -> impl Iterator<Item = &Instruction> {
        self.children.iter().filter_map(|b| b.as_instr())
    }

    pub fn is_system_only(&self) -> bool {
        self.all_instrs().iter().all(|i| i.opcode.is_system())
    }

    pub fn references(&self, base: BaseId) -> bool {
        self.all_instrs().iter().any(|i| i.bases().any(|b| b == base))
    }

    /// True when an accumulation in the subtree folds along `rank`; such a
    /// loop must run sequentially.
    pub fn has_accumulate_along(&self, rank: i64) -> bool {
        self.all_instrs()
            .iter()
            .any(|i| i.opcode.is_accumulation() && i.sweep_axis() == Some(rank))
    }

    pub fn uses_random(&self) -> bool {
        self.all_instrs().iter().any(|i| i.opcode == Opcode::Random)
    }
}

enum Fit {
    Yes,
    No(Instruction),
}

/// Arrange a pruned, constructor-stamped instruction list into nested
/// loops. Instructions join the open loop when their shape matches (or can
/// be retiled to match) and no dependency would be reordered; otherwise a
/// sibling loop opens. System instructions are placed without constraints:
/// a FREE lands next to the last use of its base so temp lifetimes stay
/// visible.
pub fn build_block_tree(instrs: Vec<Instruction>) -> LoopBlock {
    let mut root = LoopBlock::kernel_root();
    for instr in instrs {
        if instr.opcode.is_system() {
            place_system(&mut root, instr);
            continue;
        }
        let fit = match root.children.last_mut() {
            Some(Block::Loop(open)) => try_add(open, instr),
            _ => Fit::No(instr),
        };
        if let Fit::No(instr) = fit {
            let shape = instr.dominant_shape();
            root.children.push(new_nest(instr, &shape, 0));
        }
    }
    compute_local_temps(&mut root);
    root
}

/// Try to fuse `instr` into the open loop nest.
fn try_add(open: &mut LoopBlock, instr: Instruction) -> Fit {
    let rank = open.rank as usize;
    let shape = instr.dominant_shape();
    let instr = if shape.get(rank) == Some(&open.size) {
        instr
    } else if can_retile(&instr) {
        match reshape_rank(&instr, rank, open.size) {
            Ok(retiled) => retiled,
            Err(_) => return Fit::No(instr),
        }
    } else {
        return Fit::No(instr);
    };
    for earlier in open.all_instrs() {
        if !fusible(earlier, &instr) {
            log::debug!("fusion: \"{instr}\" opens a new block (conflict with \"{earlier}\")");
            return Fit::No(instr);
        }
    }
    let shape = instr.dominant_shape();
    place(open, instr, &shape);
    Fit::Yes
}

fn can_retile(instr: &Instruction) -> bool {
    !instr.opcode.is_sweep()
        && !matches!(instr.opcode, Opcode::Gather | Opcode::Scatter | Opcode::CondScatter)
}

/// Two leaves may share a loop level iff executing them in one iteration
/// cannot reorder a read-after-write: every overlap between one side's
/// output and the other's operands must be the identical access, and a
/// sweep result must never be consumed inside the loop that folds it.
fn fusible(earlier: &Instruction, later: &Instruction) -> bool {
    if !dependency(earlier, later) {
        return true;
    }
    if earlier.opcode.is_sweep() {
        if let Some(out) = earlier.operands[0].view() {
            if later.views().any(|v| !disjoint(out, v)) {
                return false;
            }
        }
    }
    if later.opcode.is_sweep() {
        if let Some(out) = later.operands[0].view() {
            if earlier.views().any(|v| !disjoint(out, v)) {
                return false;
            }
        }
    }
    aligned_overlaps(earlier, later) && aligned_overlaps(later, earlier)
}

/// Every view of `reader` overlapping `writer`'s output is the same
/// element-for-element access.
fn aligned_overlaps(writer: &Instruction, reader: &Instruction) -> bool {
    let Some(out) = writer.operands.first().and_then(|o| o.view()) else {
        return true;
    };
    reader.views().all(|v| disjoint(out, v) || v.same_access(out))
}

/// Chain of loops from `from_rank` to the instruction's innermost axis.
fn new_nest(instr: Instruction, shape: &[i64], from_rank: usize) -> Block {
    let mut node = Block::Instr(instr);
    for r in (from_rank..shape.len()).rev() {
        node = Block::Loop(LoopBlock {
            rank: r as i64,
            size: shape[r],
            children: vec![node],
            local_temps: HashSet::new(),
        });
    }
    node
}

/// Descend the open nest, reusing matching inner loops and appending the
/// leaf at its innermost rank.
fn place(lp: &mut LoopBlock, instr: Instruction, shape: &[i64]) {
    let r = lp.rank as usize;
    if shape.len() == r + 1 {
        lp.children.push(Block::Instr(instr));
        return;
    }
    if let Some(Block::Loop(inner)) = lp.children.last_mut() {
        if inner.size == shape[r + 1] {
            place(inner, instr, shape);
            return;
        }
    }
    lp.children.push(new_nest(instr, shape, r + 1));
}

fn place_system(root: &mut LoopBlock, instr: Instruction) {
    if let Some(base) = instr.operands.first().and_then(|o| o.view()).map(|v| v.base) {
        if let Some(Block::Loop(open)) = root.children.last_mut() {
            if open.references(base) {
                open.children.push(Block::Instr(instr));
                return;
            }
        }
    }
    root.children.push(Block::Instr(instr));
}

/// A base constructed and freed inside one top-level loop, and untouched
/// everywhere else, is a local temp of that loop.
fn compute_local_temps(root: &mut LoopBlock) {
    let mut access: HashMap<BaseId, HashSet<usize>> = HashMap::new();
    let mut constructed: HashMap<BaseId, usize> = HashMap::new();
    let mut freed: HashMap<BaseId, usize> = HashMap::new();
    for (group, child) in root.children.iter().enumerate() {
        let instrs: Vec<&Instruction> = match child {
            Block::Instr(i) => vec![i],
            Block::Loop(l) => l.all_instrs(),
        };
        for instr in instrs {
            for base in instr.bases() {
                access.entry(base).or_default().insert(group);
            }
            if instr.opcode == Opcode::Free {
                if let Some(v) = instr.operands[0].view() {
                    freed.insert(v.base, group);
                }
            } else if instr.constructor {
                if let Some(v) = instr.out_view() {
                    constructed.entry(v.base).or_insert(group);
                }
            }
        }
    }
    for (base, groups) in &access {
        let (Some(&c), Some(&f)) = (constructed.get(base), freed.get(base)) else {
            continue;
        };
        if c == f && groups.len() == 1 && groups.contains(&c) {
            if let Some(Block::Loop(l)) = root.children.get_mut(c) {
                l.local_temps.insert(*base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Operand, View};
    use crate::passes::prune::stamp_constructors;

    fn v(base: usize, shape: &[i64]) -> Operand {
        Operand::View(View::contiguous(BaseId(base), shape))
    }

    fn add(out: usize, lhs: usize, rhs: usize, shape: &[i64]) -> Instruction {
        Instruction::new(Opcode::Add, vec![v(out, shape), v(lhs, shape), v(rhs, shape)])
    }

    fn tree(mut instrs: Vec<Instruction>) -> LoopBlock {
        stamp_constructors(&mut instrs);
        build_block_tree(instrs)
    }

    #[test]
    fn matching_shapes_share_one_loop() {
        let root = tree(vec![add(2, 0, 1, &[4]), add(3, 2, 2, &[4])]);
        assert_eq!(root.children.len(), 1);
        let lp = root.children[0].as_loop().unwrap();
        assert_eq!((lp.rank, lp.size), (0, 4));
        assert_eq!(lp.local_instrs().count(), 2);
    }

    #[test]
    fn mismatched_shapes_open_a_sibling() {
        let root = tree(vec![add(2, 0, 1, &[4]), add(5, 3, 4, &[5])]);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn flat_instruction_is_retiled_into_open_nest() {
        let a = add(2, 0, 1, &[4, 3]);
        let b = add(5, 3, 4, &[12]);
        let root = tree(vec![a, b]);
        assert_eq!(root.children.len(), 1);
        let outer = root.children[0].as_loop().unwrap();
        assert_eq!(outer.size, 4);
        let inner = outer.children[0].as_loop().unwrap();
        assert_eq!(inner.size, 3);
        assert_eq!(inner.local_instrs().count(), 2);
    }

    #[test]
    fn misaligned_overlap_opens_a_sibling() {
        // b = a + a, then c reads b through a shifted window.
        let write = add(1, 0, 0, &[8]);
        let shifted = View { base: BaseId(1), start: 1, shape: vec![7], stride: vec![1] };
        let read = Instruction::new(
            Opcode::Add,
            vec![v(2, &[7]), Operand::View(shifted.clone()), Operand::View(shifted)],
        );
        let root = tree(vec![write, read]);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn reduction_result_is_not_consumed_in_its_loop() {
        let sum = Instruction::sweep(
            Opcode::AddReduce,
            View::flat(BaseId(1), 1),
            View::flat(BaseId(0), 8),
            0,
        );
        let scale = add(2, 1, 1, &[1]);
        let root = tree(vec![sum, scale]);
        assert_eq!(root.children.len(), 2);
        let lp = root.children[0].as_loop().unwrap();
        assert_eq!(lp.size, 8);
        assert!(lp.local_instrs().next().unwrap().opcode.is_reduction());
    }

    #[test]
    fn dependency_order_is_preserved() {
        let instrs =
            vec![add(2, 0, 1, &[4]), add(3, 2, 0, &[4]), add(4, 3, 2, &[4])];
        let root = tree(instrs.clone());
        let leaves = root.all_instrs();
        for a in 0..leaves.len() {
            for b in (a + 1)..leaves.len() {
                if dependency(leaves[a], leaves[b]) {
                    let pa = instrs.iter().position(|i| i.operands == leaves[a].operands);
                    let pb = instrs.iter().position(|i| i.operands == leaves[b].operands);
                    assert!(pa < pb);
                }
            }
        }
    }

    #[test]
    fn free_inside_loop_makes_a_local_temp() {
        let c_to_free = Instruction::new(
            Opcode::Free,
            vec![Operand::View(View::flat(BaseId(2), 4))],
        );
        let root = tree(vec![add(2, 0, 1, &[4]), add(3, 2, 2, &[4]), c_to_free]);
        assert_eq!(root.children.len(), 1);
        let lp = root.children[0].as_loop().unwrap();
        assert_eq!(lp.local_temps, HashSet::from([BaseId(2)]));
    }

    #[test]
    fn system_only_tree() {
        let root =
            tree(vec![Instruction::new(Opcode::Free, vec![v(0, &[4])])]);
        assert!(root.is_system_only());
    }
}
