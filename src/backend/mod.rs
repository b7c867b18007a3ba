pub mod emitter;
pub mod opencl;
pub mod openmp;
pub mod scope;
pub mod symbol_table;

use crate::common::ElemType;
use crate::ir::Constant;
use crate::passes::LoopBlock;

pub use emitter::emit_kernel;
pub use opencl::OpenclBackend;
pub use openmp::OpenmpBackend;
pub use scope::Scope;
pub use symbol_table::SymbolTable;

/// Which dialect the emitter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// CPU-threaded C dialect with OpenMP work sharing.
    Openmp,
    /// Data-parallel device dialect (OpenCL style).
    Opencl,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "openmp" => Ok(BackendKind::Openmp),
            "device" | "opencl" => Ok(BackendKind::Opencl),
            other => Err(format!("unknown backend \"{other}\"")),
        }
    }
}

/// How the CPU dialect annotates the outermost fusible loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelAnnotation {
    Sequential,
    #[default]
    ParallelFor,
    ParallelForSimd,
}

impl std::str::FromStr for ParallelAnnotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "sequential" => Ok(ParallelAnnotation::Sequential),
            "parallel-for" => Ok(ParallelAnnotation::ParallelFor),
            "parallel-for-simd" => Ok(ParallelAnnotation::ParallelForSimd),
            other => Err(format!("unknown parallel annotation \"{other}\"")),
        }
    }
}

/// Everything the backend-agnostic walker needs from a dialect: type and
/// constant spelling, loop heads, and the source preamble. One
/// implementation per backend.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    fn is_device(&self) -> bool {
        self.kind() == BackendKind::Opencl
    }

    /// Flag summary baked into the source header, and thereby into the
    /// cache key.
    fn flags(&self) -> String;

    /// Target spelling of an element type.
    fn write_type(&self, dtype: ElemType) -> &'static str;

    /// Restrict qualifier on array parameters.
    fn restrict_kw(&self) -> &'static str;

    /// Address-space qualifier before array parameters.
    fn array_qualifier(&self) -> &'static str;

    /// Headers, macros and helpers at the top of every kernel source.
    fn preamble(&self, uses_random: bool, out: &mut String);

    /// Literal spelling of a constant.
    fn write_constant(&self, c: &Constant) -> String;

    /// Open the loop over `lp.rank`; returns how many braces were opened
    /// (the walker closes them).
    fn loop_head(&self, lp: &LoopBlock, parallel: bool, indent: &str, out: &mut String) -> usize;

    /// Whether the outermost fusible loop should run concurrently.
    fn wants_parallel(&self) -> bool;
}

/// "float" or "double": the scalar carrier of a complex type, used as the
/// first argument of the device complex macros.
pub fn complex_scalar(dtype: ElemType) -> &'static str {
    if dtype == ElemType::Complex64 {
        "float"
    } else {
        "double"
    }
}
