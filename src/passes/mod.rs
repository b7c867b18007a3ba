pub mod fusion;
pub mod prune;

pub use fusion::{build_block_tree, Block, LoopBlock};
pub use prune::{prune, stamp_constructors, Pruned};
