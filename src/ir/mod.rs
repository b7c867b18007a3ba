pub mod instr;
pub mod random123;
pub mod view;

pub use instr::{
    dependency, reshape_rank, sweep_identity, Constant, Instruction, Opcode, Operand,
    EXT_OPCODE_BASE,
};
pub use view::{disjoint, Base, BaseArena, BaseId, View};
