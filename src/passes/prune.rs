use std::collections::HashSet;

use crate::ir::{BaseId, Instruction, Opcode};

/// Result of batch pruning: the retained instructions and the bases whose
/// FREE was hoisted out because nothing in the batch computes on them.
#[derive(Debug)]
pub struct Pruned {
    pub instrs: Vec<Instruction>,
    pub frees: HashSet<BaseId>,
}

/// Drop NONE and TALLY, and hoist any FREE whose base is not touched by a
/// retained instruction so no dead kernel code is generated for transient
/// buffers. FREEs of computed bases stay in the stream; they mark temp
/// lifetimes for the fuser.
pub fn prune(batch: Vec<Instruction>) -> Pruned {
    let mut computes: HashSet<BaseId> = HashSet::new();
    let mut instrs = Vec::with_capacity(batch.len());
    let mut frees = HashSet::new();
    for instr in batch {
        match instr.opcode {
            Opcode::Free
                if instr
                    .operands
                    .first()
                    .and_then(|o| o.view())
                    .is_some_and(|v| !computes.contains(&v.base)) =>
            {
                frees.insert(instr.operands[0].view().unwrap().base);
            }
            Opcode::Noop | Opcode::Tally => {}
            _ => {
                computes.extend(instr.bases());
                instrs.push(instr);
            }
        }
    }
    log::debug!("prune: retained {} instructions, hoisted {} frees", instrs.len(), frees.len());
    Pruned { instrs, frees }
}

/// Stamp the `constructor` flag in one left-to-right sweep: true on the
/// first instruction that writes a base within this batch. Every operand
/// base is recorded as seen, reads included.
pub fn stamp_constructors(instrs: &mut [Instruction]) {
    let mut seen: HashSet<BaseId> = HashSet::new();
    for (seq, instr) in instrs.iter_mut().enumerate() {
        instr.seq = seq as u32;
        instr.constructor = false;
        for (o, view) in instr.operands.iter().enumerate().filter_map(|(o, op)| {
            op.view().map(|v| (o, v))
        }) {
            if o == 0 && !seen.contains(&view.base) {
                instr.constructor = true;
            }
            seen.insert(view.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Operand, View};

    fn free(base: usize, nelem: i64) -> Instruction {
        Instruction::new(Opcode::Free, vec![Operand::View(View::flat(BaseId(base), nelem))])
    }

    fn add(out: usize, lhs: usize, rhs: usize) -> Instruction {
        let v = |b: usize| Operand::View(View::flat(BaseId(b), 4));
        Instruction::new(Opcode::Add, vec![v(out), v(lhs), v(rhs)])
    }

    #[test]
    fn unused_free_is_hoisted() {
        // FREE b0; c = a + a — b0 lands in the frees set, the kernel only
        // ever sees a and c.
        let pruned = prune(vec![free(0, 16), add(2, 1, 1)]);
        assert_eq!(pruned.instrs.len(), 1);
        assert_eq!(pruned.frees, HashSet::from([BaseId(0)]));
    }

    #[test]
    fn computed_free_is_retained() {
        let pruned = prune(vec![add(2, 1, 1), free(2, 4)]);
        assert_eq!(pruned.instrs.len(), 2);
        assert!(pruned.frees.is_empty());
    }

    #[test]
    fn noop_and_tally_are_dropped() {
        let batch = vec![
            Instruction::new(Opcode::Noop, vec![]),
            add(2, 0, 1),
            Instruction::new(Opcode::Tally, vec![]),
        ];
        let pruned = prune(batch);
        assert_eq!(pruned.instrs.len(), 1);
        assert_eq!(pruned.instrs[0].opcode, Opcode::Add);
    }

    #[test]
    fn constructor_marks_first_write_only() {
        let mut instrs = vec![add(2, 0, 1), add(2, 2, 1), add(3, 2, 0)];
        stamp_constructors(&mut instrs);
        assert!(instrs[0].constructor);
        assert!(!instrs[1].constructor);
        assert!(instrs[2].constructor);
        assert_eq!(instrs[2].seq, 2);
    }

    #[test]
    fn read_before_write_is_not_a_constructor() {
        // b3 appears as input before it is ever an output.
        let mut instrs = vec![add(2, 3, 1), add(3, 0, 1)];
        stamp_constructors(&mut instrs);
        assert!(instrs[0].constructor);
        assert!(!instrs[1].constructor);
    }
}
