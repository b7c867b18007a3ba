pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod runtime;
pub mod store;

pub use compiler::ExternalCompiler;
pub use config::Config;
pub use dispatch::{DispatchTag, Envelope};
pub use engine::{Engine, ExtMethodFn};
pub use runtime::Runtime;
pub use store::{KernelFn, ObjectStore};
