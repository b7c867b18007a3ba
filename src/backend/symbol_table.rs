use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::common::ElemType;
use crate::ir::view::disjoint;
use crate::ir::{BaseArena, BaseId, Constant, Instruction, Opcode, View};
use crate::passes::{Block, LoopBlock};

/// Per-kernel identifier assignment: which bases become parameters and
/// under which dense id, which views get offset/stride arguments and
/// lifted index expressions, which constants ride along as arguments, and
/// which bases must stay arrays.
#[derive(Debug)]
pub struct SymbolTable {
    params: IndexMap<BaseId, usize>,
    temps: HashSet<BaseId>,
    always_array: HashSet<BaseId>,
    offset_stride: IndexMap<View, usize>,
    idx: IndexMap<View, usize>,
    consts: IndexMap<u32, (usize, Constant)>,
    dtypes: HashMap<BaseId, ElemType>,
}

impl SymbolTable {
    /// Scan the block tree once and assign every id in first-seen order.
    ///
    /// A base is "always array" when an extension method has written it,
    /// when it is aliased by overlapping non-identical views, when it is
    /// the randomly-accessed side of a gather or scatter, or when it
    /// holds more elements than the scalar-replacement threshold. Local
    /// temps keep their scalar status only when every access in the
    /// kernel is the identical element per iteration.
    pub fn build(root: &LoopBlock, arena: &BaseArena, sr_threshold: usize) -> SymbolTable {
        let instrs: Vec<&Instruction> =
            root.all_instrs().into_iter().filter(|i| !i.opcode.is_system()).collect();

        let mut dtypes = HashMap::new();
        let mut views_of: HashMap<BaseId, Vec<&View>> = HashMap::new();
        for instr in &instrs {
            for view in instr.views() {
                dtypes.insert(view.base, arena.get(view.base).dtype);
                let known = views_of.entry(view.base).or_default();
                if !known.contains(&view) {
                    known.push(view);
                }
            }
        }

        let mut always_array: HashSet<BaseId> = HashSet::new();
        for (&base, views) in &views_of {
            if arena.get(base).extension_written || arena.get(base).nelem > sr_threshold {
                always_array.insert(base);
                continue;
            }
            'pairs: for i in 0..views.len() {
                for j in i + 1..views.len() {
                    let (u, v) = (views[i], views[j]);
                    if !u.same_access(v) && !disjoint(u, v) {
                        always_array.insert(base);
                        break 'pairs;
                    }
                }
            }
        }
        for instr in &instrs {
            match instr.opcode {
                Opcode::Gather => {
                    if let Some(v) = instr.operands[1].view() {
                        always_array.insert(v.base);
                    }
                }
                Opcode::Scatter | Opcode::CondScatter => {
                    if let Some(v) = instr.operands[0].view() {
                        always_array.insert(v.base);
                    }
                }
                _ => {}
            }
        }

        let mut temps: HashSet<BaseId> = HashSet::new();
        for child in &root.children {
            let Block::Loop(lp) = child else { continue };
            for &base in &lp.local_temps {
                if always_array.contains(&base) {
                    continue;
                }
                let uniform = views_of
                    .get(&base)
                    .is_some_and(|vs| vs.windows(2).all(|w| w[0].same_access(w[1])));
                if uniform {
                    temps.insert(base);
                }
            }
        }
        // An accumulation reads its own previous output element; the
        // output must stay addressable.
        for instr in &instrs {
            if instr.opcode.is_accumulation() {
                if let Some(v) = instr.operands[0].view() {
                    temps.remove(&v.base);
                }
            }
        }

        let mut params: IndexMap<BaseId, usize> = IndexMap::new();
        let mut offset_stride: IndexMap<View, usize> = IndexMap::new();
        let mut idx: IndexMap<View, usize> = IndexMap::new();
        let mut consts: IndexMap<u32, (usize, Constant)> = IndexMap::new();
        for instr in &instrs {
            for view in instr.views() {
                if temps.contains(&view.base) {
                    continue;
                }
                if !params.contains_key(&view.base) {
                    params.insert(view.base, params.len());
                }
                if !offset_stride.contains_key(view) {
                    offset_stride.insert(view.clone(), offset_stride.len());
                    idx.insert(view.clone(), idx.len());
                }
            }
            if let Some(c) = instr.constant {
                let as_kernel_arg = !instr.opcode.is_sweep()
                    && instr.opcode != Opcode::Random
                    && c.dtype() != ElemType::R123;
                if as_kernel_arg {
                    consts.insert(instr.seq, (consts.len(), c));
                }
            }
        }

        SymbolTable { params, temps, always_array, offset_stride, idx, consts, dtypes }
    }

    /// Parameter bases in dense-id order.
    pub fn params(&self) -> impl Iterator<Item = BaseId> + '_ {
        self.params.keys().copied()
    }

    pub fn base_id(&self, base: BaseId) -> Option<usize> {
        self.params.get(&base).copied()
    }

    pub fn is_temp(&self, base: BaseId) -> bool {
        self.temps.contains(&base)
    }

    pub fn is_always_array(&self, base: BaseId) -> bool {
        self.always_array.contains(&base)
    }

    pub fn dtype(&self, base: BaseId) -> ElemType {
        self.dtypes[&base]
    }

    /// Views passed as `uint64 offset` plus per-axis `uint64 stride`
    /// kernel arguments, in id order.
    pub fn offset_stride_views(&self) -> impl Iterator<Item = &View> {
        self.offset_stride.keys()
    }

    pub fn offset_strides_id(&self, view: &View) -> Option<usize> {
        self.offset_stride.get(view).copied()
    }

    pub fn idx_id(&self, view: &View) -> Option<usize> {
        self.idx.get(view).copied()
    }

    /// Kernel-argument constants in id order.
    pub fn consts(&self) -> impl Iterator<Item = (usize, &Constant)> {
        self.consts.values().map(|(id, c)| (*id, c))
    }

    pub fn const_id(&self, seq: u32) -> Option<usize> {
        self.consts.get(&seq).map(|(id, _)| *id)
    }

    /// Element type of operand `i`: the base's type for views, the
    /// embedded constant's for constant operands.
    pub fn operand_type(&self, instr: &Instruction, i: usize) -> ElemType {
        match instr.operands[i].view() {
            Some(v) => self.dtype(v.base),
            None => instr
                .constant
                .map(|c| c.dtype())
                .unwrap_or_else(|| self.operand_type(instr, 0)),
        }
    }
}
