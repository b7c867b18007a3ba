use std::fmt;

use crate::common::{ElemType, Error, Result};
use crate::ir::view::{disjoint, reshape_view, BaseId, View};

/// Opcode ids at or above this value are extension methods dispatched
/// through the registered-extension protocol instead of kernel emission.
pub const EXT_OPCODE_BASE: u32 = 512;

/// The operation table. Reductions fold along one sweep axis,
/// accumulations prefix-fold along it; both carry the axis as a constant
/// operand. System ops never produce kernel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // Elementwise binary
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Mod,
    Remainder,
    Maximum,
    Minimum,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LeftShift,
    RightShift,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Arctan2,
    // Elementwise unary
    Identity,
    LogicalNot,
    Invert,
    Absolute,
    Sign,
    Sqrt,
    Exp,
    Exp2,
    Expm1,
    Log,
    Log2,
    Log10,
    Log1p,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Arcsin,
    Arccos,
    Arctan,
    Arcsinh,
    Arccosh,
    Arctanh,
    Floor,
    Ceil,
    Trunc,
    Rint,
    Isnan,
    Isinf,
    Isfinite,
    Conj,
    Real,
    Imag,
    // Reductions
    AddReduce,
    MultiplyReduce,
    MinimumReduce,
    MaximumReduce,
    BitwiseAndReduce,
    BitwiseOrReduce,
    BitwiseXorReduce,
    LogicalAndReduce,
    LogicalOrReduce,
    LogicalXorReduce,
    // Accumulations
    AddAccumulate,
    MultiplyAccumulate,
    // Data movement and sources
    Gather,
    Scatter,
    CondScatter,
    Range,
    Random,
    // System
    Free,
    #[strum(to_string = "NONE")]
    Noop,
    Tally,
    Sync,
    /// Registered extension method; executed outside fused kernels.
    #[strum(to_string = "ExtMethod")]
    Extension(u32),
}

/// Core opcodes in wire order. `Opcode::code` / `Opcode::from_code` index
/// into this table; extension methods live at `EXT_OPCODE_BASE + id`.
const CORE_OPCODES: &[Opcode] = &[
    Opcode::Add,
    Opcode::Subtract,
    Opcode::Multiply,
    Opcode::Divide,
    Opcode::Power,
    Opcode::Mod,
    Opcode::Remainder,
    Opcode::Maximum,
    Opcode::Minimum,
    Opcode::BitwiseAnd,
    Opcode::BitwiseOr,
    Opcode::BitwiseXor,
    Opcode::LeftShift,
    Opcode::RightShift,
    Opcode::LogicalAnd,
    Opcode::LogicalOr,
    Opcode::LogicalXor,
    Opcode::Greater,
    Opcode::GreaterEqual,
    Opcode::Less,
    Opcode::LessEqual,
    Opcode::Equal,
    Opcode::NotEqual,
    Opcode::Arctan2,
    Opcode::Identity,
    Opcode::LogicalNot,
    Opcode::Invert,
    Opcode::Absolute,
    Opcode::Sign,
    Opcode::Sqrt,
    Opcode::Exp,
    Opcode::Exp2,
    Opcode::Expm1,
    Opcode::Log,
    Opcode::Log2,
    Opcode::Log10,
    Opcode::Log1p,
    Opcode::Sin,
    Opcode::Cos,
    Opcode::Tan,
    Opcode::Sinh,
    Opcode::Cosh,
    Opcode::Tanh,
    Opcode::Arcsin,
    Opcode::Arccos,
    Opcode::Arctan,
    Opcode::Arcsinh,
    Opcode::Arccosh,
    Opcode::Arctanh,
    Opcode::Floor,
    Opcode::Ceil,
    Opcode::Trunc,
    Opcode::Rint,
    Opcode::Isnan,
    Opcode::Isinf,
    Opcode::Isfinite,
    Opcode::Conj,
    Opcode::Real,
    Opcode::Imag,
    Opcode::AddReduce,
    Opcode::MultiplyReduce,
    Opcode::MinimumReduce,
    Opcode::MaximumReduce,
    Opcode::BitwiseAndReduce,
    Opcode::BitwiseOrReduce,
    Opcode::BitwiseXorReduce,
    Opcode::LogicalAndReduce,
    Opcode::LogicalOrReduce,
    Opcode::LogicalXorReduce,
    Opcode::AddAccumulate,
    Opcode::MultiplyAccumulate,
    Opcode::Gather,
    Opcode::Scatter,
    Opcode::CondScatter,
    Opcode::Range,
    Opcode::Random,
    Opcode::Free,
    Opcode::Noop,
    Opcode::Tally,
    Opcode::Sync,
];

impl Opcode {
    /// Fixed operand count, or `None` for extension methods (the front
    /// end decides their arity).
    pub fn num_operands(&self) -> Option<usize> {
        use Opcode::*;
        Some(match self {
            Noop | Tally => 0,
            Free | Sync | Range => 1,
            Identity | LogicalNot | Invert | Absolute | Sign | Sqrt | Exp | Exp2 | Expm1
            | Log | Log2 | Log10 | Log1p | Sin | Cos | Tan | Sinh | Cosh | Tanh | Arcsin
            | Arccos | Arctan | Arcsinh | Arccosh | Arctanh | Floor | Ceil | Trunc | Rint
            | Isnan | Isinf | Isfinite | Conj | Real | Imag | Random => 2,
            Add | Subtract | Multiply | Divide | Power | Mod | Remainder | Maximum | Minimum
            | BitwiseAnd | BitwiseOr | BitwiseXor | LeftShift | RightShift | LogicalAnd
            | LogicalOr | LogicalXor | Greater | GreaterEqual | Less | LessEqual | Equal
            | NotEqual | Arctan2 | Gather | Scatter => 3,
            AddReduce | MultiplyReduce | MinimumReduce | MaximumReduce | BitwiseAndReduce
            | BitwiseOrReduce | BitwiseXorReduce | LogicalAndReduce | LogicalOrReduce
            | LogicalXorReduce | AddAccumulate | MultiplyAccumulate => 3,
            CondScatter => 4,
            Extension(_) => return None,
        })
    }

    pub fn is_reduction(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddReduce | MultiplyReduce | MinimumReduce | MaximumReduce | BitwiseAndReduce
                | BitwiseOrReduce | BitwiseXorReduce | LogicalAndReduce | LogicalOrReduce
                | LogicalXorReduce
        )
    }

    pub fn is_accumulation(&self) -> bool {
        matches!(self, Opcode::AddAccumulate | Opcode::MultiplyAccumulate)
    }

    /// Reduction or accumulation: folds along a sweep axis.
    pub fn is_sweep(&self) -> bool {
        self.is_reduction() || self.is_accumulation()
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Opcode::Free | Opcode::Noop | Opcode::Tally | Opcode::Sync)
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, Opcode::Extension(_))
    }

    /// Wire id for the dispatch envelope.
    pub fn code(&self) -> u32 {
        if let Opcode::Extension(id) = self {
            return EXT_OPCODE_BASE + id;
        }
        CORE_OPCODES.iter().position(|op| op == self).expect("opcode in wire table") as u32
    }

    pub fn from_code(code: u32) -> Option<Opcode> {
        if code >= EXT_OPCODE_BASE {
            return Some(Opcode::Extension(code - EXT_OPCODE_BASE));
        }
        CORE_OPCODES.get(code as usize).copied()
    }
}

/// A value embedded in an instruction, tagged over the element-type set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Complex64 { re: f32, im: f32 },
    Complex128 { re: f64, im: f64 },
    R123 { start: u64, key: u64 },
}

impl Constant {
    pub fn dtype(&self) -> ElemType {
        match self {
            Constant::Bool(_) => ElemType::Bool,
            Constant::Int8(_) => ElemType::Int8,
            Constant::Int16(_) => ElemType::Int16,
            Constant::Int32(_) => ElemType::Int32,
            Constant::Int64(_) => ElemType::Int64,
            Constant::UInt8(_) => ElemType::UInt8,
            Constant::UInt16(_) => ElemType::UInt16,
            Constant::UInt32(_) => ElemType::UInt32,
            Constant::UInt64(_) => ElemType::UInt64,
            Constant::Float32(_) => ElemType::Float32,
            Constant::Float64(_) => ElemType::Float64,
            Constant::Complex64 { .. } => ElemType::Complex64,
            Constant::Complex128 { .. } => ElemType::Complex128,
            Constant::R123 { .. } => ElemType::R123,
        }
    }

    /// Integer reading of the constant; used for sweep axes and repeat
    /// conditions.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Constant::Bool(v) => Some(v as i64),
            Constant::Int8(v) => Some(v as i64),
            Constant::Int16(v) => Some(v as i64),
            Constant::Int32(v) => Some(v as i64),
            Constant::Int64(v) => Some(v),
            Constant::UInt8(v) => Some(v as i64),
            Constant::UInt16(v) => Some(v as i64),
            Constant::UInt32(v) => Some(v as i64),
            Constant::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Additive/or-style identity of `dtype`.
    pub fn zero(dtype: ElemType) -> Result<Constant> {
        Ok(match dtype {
            ElemType::Bool => Constant::Bool(false),
            ElemType::Int8 => Constant::Int8(0),
            ElemType::Int16 => Constant::Int16(0),
            ElemType::Int32 => Constant::Int32(0),
            ElemType::Int64 => Constant::Int64(0),
            ElemType::UInt8 => Constant::UInt8(0),
            ElemType::UInt16 => Constant::UInt16(0),
            ElemType::UInt32 => Constant::UInt32(0),
            ElemType::UInt64 => Constant::UInt64(0),
            ElemType::Float32 => Constant::Float32(0.0),
            ElemType::Float64 => Constant::Float64(0.0),
            ElemType::Complex64 => Constant::Complex64 { re: 0.0, im: 0.0 },
            ElemType::Complex128 => Constant::Complex128 { re: 0.0, im: 0.0 },
            ElemType::R123 => return Err(Error::Structural("no zero for r123".into())),
        })
    }

    /// Multiplicative identity of `dtype`.
    pub fn one(dtype: ElemType) -> Result<Constant> {
        Ok(match dtype {
            ElemType::Bool => Constant::Bool(true),
            ElemType::Int8 => Constant::Int8(1),
            ElemType::Int16 => Constant::Int16(1),
            ElemType::Int32 => Constant::Int32(1),
            ElemType::Int64 => Constant::Int64(1),
            ElemType::UInt8 => Constant::UInt8(1),
            ElemType::UInt16 => Constant::UInt16(1),
            ElemType::UInt32 => Constant::UInt32(1),
            ElemType::UInt64 => Constant::UInt64(1),
            ElemType::Float32 => Constant::Float32(1.0),
            ElemType::Float64 => Constant::Float64(1.0),
            ElemType::Complex64 => Constant::Complex64 { re: 1.0, im: 0.0 },
            ElemType::Complex128 => Constant::Complex128 { re: 1.0, im: 0.0 },
            ElemType::R123 => return Err(Error::Structural("no one for r123".into())),
        })
    }

    /// All-ones bit pattern; identity for bitwise/logical-and folds.
    pub fn ones(dtype: ElemType) -> Result<Constant> {
        Ok(match dtype {
            ElemType::Bool => Constant::Bool(true),
            ElemType::Int8 => Constant::Int8(-1),
            ElemType::Int16 => Constant::Int16(-1),
            ElemType::Int32 => Constant::Int32(-1),
            ElemType::Int64 => Constant::Int64(-1),
            ElemType::UInt8 => Constant::UInt8(u8::MAX),
            ElemType::UInt16 => Constant::UInt16(u16::MAX),
            ElemType::UInt32 => Constant::UInt32(u32::MAX),
            ElemType::UInt64 => Constant::UInt64(u64::MAX),
            other => {
                return Err(Error::Structural(format!("no all-ones identity for {other:?}")))
            }
        })
    }

    /// Minimum representable value (floats: negative infinity).
    pub fn min(dtype: ElemType) -> Result<Constant> {
        Ok(match dtype {
            ElemType::Bool => Constant::Bool(false),
            ElemType::Int8 => Constant::Int8(i8::MIN),
            ElemType::Int16 => Constant::Int16(i16::MIN),
            ElemType::Int32 => Constant::Int32(i32::MIN),
            ElemType::Int64 => Constant::Int64(i64::MIN),
            ElemType::UInt8 => Constant::UInt8(0),
            ElemType::UInt16 => Constant::UInt16(0),
            ElemType::UInt32 => Constant::UInt32(0),
            ElemType::UInt64 => Constant::UInt64(0),
            ElemType::Float32 => Constant::Float32(f32::NEG_INFINITY),
            ElemType::Float64 => Constant::Float64(f64::NEG_INFINITY),
            other => return Err(Error::Structural(format!("no minimum for {other:?}"))),
        })
    }

    /// Native-endian value bytes, zero-padded to 16; the layout the
    /// kernels and the dispatch envelope read.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match *self {
            Constant::Bool(v) => out[0] = v as u8,
            Constant::Int8(v) => out[..1].copy_from_slice(&v.to_ne_bytes()),
            Constant::Int16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            Constant::Int32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Constant::Int64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            Constant::UInt8(v) => out[..1].copy_from_slice(&v.to_ne_bytes()),
            Constant::UInt16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            Constant::UInt32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Constant::UInt64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            Constant::Float32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Constant::Float64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            Constant::Complex64 { re, im } => {
                out[..4].copy_from_slice(&re.to_ne_bytes());
                out[4..8].copy_from_slice(&im.to_ne_bytes());
            }
            Constant::Complex128 { re, im } => {
                out[..8].copy_from_slice(&re.to_ne_bytes());
                out[8..].copy_from_slice(&im.to_ne_bytes());
            }
            Constant::R123 { start, key } => {
                out[..8].copy_from_slice(&start.to_ne_bytes());
                out[8..].copy_from_slice(&key.to_ne_bytes());
            }
        }
        out
    }

    /// Inverse of [`Constant::to_bytes`] for a known element type.
    pub fn from_bytes(dtype: ElemType, bytes: &[u8; 16]) -> Constant {
        let u16v = |r: std::ops::Range<usize>| u16::from_ne_bytes(bytes[r].try_into().unwrap());
        let u32v = |r: std::ops::Range<usize>| u32::from_ne_bytes(bytes[r].try_into().unwrap());
        let u64v = |r: std::ops::Range<usize>| u64::from_ne_bytes(bytes[r].try_into().unwrap());
        match dtype {
            ElemType::Bool => Constant::Bool(bytes[0] != 0),
            ElemType::Int8 => Constant::Int8(bytes[0] as i8),
            ElemType::Int16 => Constant::Int16(u16v(0..2) as i16),
            ElemType::Int32 => Constant::Int32(u32v(0..4) as i32),
            ElemType::Int64 => Constant::Int64(u64v(0..8) as i64),
            ElemType::UInt8 => Constant::UInt8(bytes[0]),
            ElemType::UInt16 => Constant::UInt16(u16v(0..2)),
            ElemType::UInt32 => Constant::UInt32(u32v(0..4)),
            ElemType::UInt64 => Constant::UInt64(u64v(0..8)),
            ElemType::Float32 => Constant::Float32(f32::from_bits(u32v(0..4))),
            ElemType::Float64 => Constant::Float64(f64::from_bits(u64v(0..8))),
            ElemType::Complex64 => Constant::Complex64 {
                re: f32::from_bits(u32v(0..4)),
                im: f32::from_bits(u32v(4..8)),
            },
            ElemType::Complex128 => Constant::Complex128 {
                re: f64::from_bits(u64v(0..8)),
                im: f64::from_bits(u64v(8..16)),
            },
            ElemType::R123 => Constant::R123 { start: u64v(0..8), key: u64v(8..16) },
        }
    }

    /// Maximum representable value (floats: positive infinity).
    pub fn max(dtype: ElemType) -> Result<Constant> {
        Ok(match dtype {
            ElemType::Bool => Constant::Bool(true),
            ElemType::Int8 => Constant::Int8(i8::MAX),
            ElemType::Int16 => Constant::Int16(i16::MAX),
            ElemType::Int32 => Constant::Int32(i32::MAX),
            ElemType::Int64 => Constant::Int64(i64::MAX),
            ElemType::UInt8 => Constant::UInt8(u8::MAX),
            ElemType::UInt16 => Constant::UInt16(u16::MAX),
            ElemType::UInt32 => Constant::UInt32(u32::MAX),
            ElemType::UInt64 => Constant::UInt64(u64::MAX),
            ElemType::Float32 => Constant::Float32(f32::INFINITY),
            ElemType::Float64 => Constant::Float64(f64::INFINITY),
            other => return Err(Error::Structural(format!("no maximum for {other:?}"))),
        })
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Constant::Bool(v) => write!(f, "{}", v as u8),
            Constant::Int8(v) => write!(f, "{v}"),
            Constant::Int16(v) => write!(f, "{v}"),
            Constant::Int32(v) => write!(f, "{v}"),
            Constant::Int64(v) => write!(f, "{v}"),
            Constant::UInt8(v) => write!(f, "{v}"),
            Constant::UInt16(v) => write!(f, "{v}"),
            Constant::UInt32(v) => write!(f, "{v}"),
            Constant::UInt64(v) => write!(f, "{v}"),
            Constant::Float32(v) => write!(f, "{v}"),
            Constant::Float64(v) => write!(f, "{v}"),
            Constant::Complex64 { re, im } => write!(f, "{re}+{im}i"),
            Constant::Complex128 { re, im } => write!(f, "{re}+{im}i"),
            Constant::R123 { start, key } => write!(f, "{{start: {start}, key: {key}}}"),
        }
    }
}

/// One instruction operand: a strided view, or the instruction's embedded
/// constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    View(View),
    Const,
}

impl Operand {
    pub fn view(&self) -> Option<&View> {
        match self {
            Operand::View(v) => Some(v),
            Operand::Const => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const)
    }
}

/// One recorded operation. Operand 0 is the output for every non-system
/// opcode. Immutable during the fusion pass apart from the `constructor`
/// stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub constant: Option<Constant>,
    /// First write to the output base within the batch.
    pub constructor: bool,
    /// Position in the pruned batch; keys per-instruction symbol ids.
    pub seq: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Instruction { opcode, operands, constant: None, constructor: false, seq: 0 }
    }

    pub fn with_constant(opcode: Opcode, operands: Vec<Operand>, constant: Constant) -> Self {
        Instruction { opcode, operands, constant: Some(constant), constructor: false, seq: 0 }
    }

    /// Reduction/accumulation along `axis` of `input` into `out`.
    pub fn sweep(opcode: Opcode, out: View, input: View, axis: i64) -> Self {
        Instruction::with_constant(
            opcode,
            vec![Operand::View(out), Operand::View(input), Operand::Const],
            Constant::Int64(axis),
        )
    }

    /// The output view, when the opcode has one.
    pub fn out_view(&self) -> Option<&View> {
        if self.opcode.is_system() && self.opcode != Opcode::Free {
            return None;
        }
        self.operands.first().and_then(|o| o.view())
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.operands.iter().filter_map(|o| o.view())
    }

    pub fn bases(&self) -> impl Iterator<Item = BaseId> + '_ {
        self.views().map(|v| v.base)
    }

    /// Axis a reduction or accumulation folds along.
    pub fn sweep_axis(&self) -> Option<i64> {
        if self.opcode.is_sweep() {
            self.constant.as_ref().and_then(|c| c.as_i64())
        } else {
            None
        }
    }

    /// Shape driving loop construction: sweep ops and scatters iterate
    /// over their input, everything else over the output. Rank zero is
    /// normalised to a single-element axis.
    pub fn dominant_shape(&self) -> Vec<i64> {
        let view = match self.opcode {
            _ if self.opcode.is_sweep() => self.operands[1].view(),
            Opcode::Scatter | Opcode::CondScatter => self.operands[1].view(),
            _ => self.operands.first().and_then(|o| o.view()),
        };
        match view {
            Some(v) if !v.shape.is_empty() => v.shape.clone(),
            _ => vec![1],
        }
    }

    /// Structural validation: arity, output kind, and the shape contracts
    /// of sweeps, gathers and scatters.
    pub fn validate(&self) -> Result<()> {
        if let Some(arity) = self.opcode.num_operands() {
            if self.operands.len() != arity {
                return Err(Error::Structural(format!(
                    "opcode {} expects {} operands, got {}",
                    self.opcode,
                    arity,
                    self.operands.len()
                ))
                .with_instr(&self.to_string()));
            }
        }
        if !self.opcode.is_system() && !self.operands.is_empty() && self.operands[0].is_const() {
            return Err(Error::Structural("output operand must be a view".into())
                .with_instr(&self.to_string()));
        }
        if self.opcode.is_sweep() {
            let out = self.operands[0].view().ok_or_else(|| {
                Error::Structural("sweep output must be a view".into())
            })?;
            let input = self.operands[1].view().ok_or_else(|| {
                Error::Structural("sweep input must be a view".into())
            })?;
            let axis = self
                .sweep_axis()
                .ok_or_else(|| Error::Structural("sweep without an axis constant".into()))?;
            if axis < 0 || axis as usize >= input.ndim() {
                return Err(Error::Structural(format!(
                    "sweep axis {axis} out of range for rank {}",
                    input.ndim()
                ))
                .with_instr(&self.to_string()));
            }
            let expect: Vec<i64> = if self.opcode.is_reduction() {
                let mut s = input.shape.clone();
                s.remove(axis as usize);
                s
            } else {
                input.shape.clone()
            };
            // A full reduction leaves a rank-0 output, spelled as [1].
            let out_shape: &[i64] =
                if out.shape.is_empty() || out.shape == [1] && expect.is_empty() {
                    &[]
                } else {
                    &out.shape
                };
            if !expect.is_empty() && out_shape != expect.as_slice() {
                return Err(Error::Structural(format!(
                    "sweep output shape {:?} does not match {:?}",
                    out.shape, expect
                ))
                .with_instr(&self.to_string()));
            }
        }
        if self.opcode == Opcode::Gather {
            let out = self.operands[0].view().unwrap();
            if let Some(index) = self.operands[2].view() {
                if out.shape != index.shape {
                    return Err(Error::Structural(
                        "gather output and index shapes differ".into(),
                    )
                    .with_instr(&self.to_string()));
                }
            }
        }
        if matches!(self.opcode, Opcode::Scatter | Opcode::CondScatter) {
            if let (Some(input), Some(index)) =
                (self.operands[1].view(), self.operands[2].view())
            {
                if input.shape != index.shape {
                    return Err(Error::Structural(
                        "scatter input and index shapes differ".into(),
                    )
                    .with_instr(&self.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Reshape every view operand to `shape`, recomputing row-major
    /// strides. Only meaningful for elementwise instructions where all
    /// operands share the element count.
    pub fn reshape(&self, shape: &[i64]) -> Result<Instruction> {
        let mut out = self.clone();
        for op in &mut out.operands {
            if let Operand::View(v) = op {
                *v = reshape_view(v, shape)?;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for op in &self.operands {
            match op {
                Operand::View(v) => write!(f, " {v}")?,
                Operand::Const => match &self.constant {
                    Some(c) => write!(f, " {c}")?,
                    None => write!(f, " ?")?,
                },
            }
        }
        Ok(())
    }
}

/// Identity element stored into a sweep output before the fold runs.
pub fn sweep_identity(opcode: Opcode, dtype: ElemType) -> Result<Constant> {
    use Opcode::*;
    match opcode {
        AddReduce | BitwiseOrReduce | BitwiseXorReduce | LogicalOrReduce | LogicalXorReduce
        | AddAccumulate => Constant::zero(dtype),
        MultiplyReduce | MultiplyAccumulate => Constant::one(dtype),
        BitwiseAndReduce | LogicalAndReduce => Constant::ones(dtype),
        MaximumReduce => {
            if dtype == ElemType::Bool {
                Ok(Constant::Bool(true))
            } else {
                Constant::min(dtype)
            }
        }
        MinimumReduce => Constant::max(dtype),
        other => Err(Error::Structural(format!("sweep_identity: unsupported operation {other}"))),
    }
}

/// Instruction `a` depends on `b` when `b`'s output overlaps any operand
/// of `a`, or `a`'s output overlaps any operand of `b`.
pub fn dependency(a: &Instruction, b: &Instruction) -> bool {
    if a.operands.is_empty() || b.operands.is_empty() {
        return false;
    }
    if let Some(b_out) = b.operands[0].view() {
        if a.views().any(|v| !disjoint(b_out, v)) {
            return true;
        }
    }
    if let Some(a_out) = a.operands[0].view() {
        if b.views().any(|v| !disjoint(a_out, v)) {
            return true;
        }
    }
    false
}

/// Retile `instr` so axes `0..rank` are kept, axis `rank` has length
/// `size_of_rank_dim`, and any surplus product trails as one extra axis.
pub fn reshape_rank(instr: &Instruction, rank: usize, size_of_rank_dim: i64) -> Result<Instruction> {
    let old = instr
        .operands
        .first()
        .and_then(|o| o.view())
        .ok_or_else(|| Error::Structural("reshape_rank: instruction has no output view".into()))?;
    if rank >= old.ndim() {
        return Err(Error::Structural(format!(
            "reshape_rank: rank {rank} out of range for {:?}",
            old.shape
        )));
    }
    let mut shape: Vec<i64> = old.shape[..rank].to_vec();
    let size: i64 = old.shape[rank..].iter().product();
    if size < size_of_rank_dim {
        return Err(Error::Structural(format!(
            "reshape_rank: block of {size} elements cannot hold an axis of {size_of_rank_dim}"
        )));
    }
    shape.push(size_of_rank_dim);
    if size != size_of_rank_dim {
        if size % size_of_rank_dim != 0 {
            return Err(Error::Structural(format!(
                "reshape_rank: {size} not divisible by {size_of_rank_dim}"
            )));
        }
        shape.push(size / size_of_rank_dim);
    }
    instr.reshape(&shape)
}
