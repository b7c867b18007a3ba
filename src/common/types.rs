use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Element types an array base can carry.
///
/// `R123` is the `{start, key}` counter pair consumed by the counter-based
/// RNG opcode; it never backs an array, only instruction constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ElemType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    R123,
}

impl ElemType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElemType::Bool | ElemType::Int8 | ElemType::UInt8 => 1,
            ElemType::Int16 | ElemType::UInt16 => 2,
            ElemType::Int32 | ElemType::UInt32 | ElemType::Float32 => 4,
            ElemType::Int64 | ElemType::UInt64 | ElemType::Float64 | ElemType::Complex64 => 8,
            ElemType::Complex128 | ElemType::R123 => 16,
        }
    }

    pub fn is_signed_integer(&self) -> bool {
        matches!(self, ElemType::Int8 | ElemType::Int16 | ElemType::Int32 | ElemType::Int64)
    }

    pub fn is_unsigned_integer(&self) -> bool {
        matches!(self, ElemType::UInt8 | ElemType::UInt16 | ElemType::UInt32 | ElemType::UInt64)
    }

    pub fn is_integer(&self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElemType::Float32 | ElemType::Float64)
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, ElemType::Complex64 | ElemType::Complex128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_classes() {
        assert_eq!(ElemType::Bool.size(), 1);
        assert_eq!(ElemType::Complex64.size(), 8);
        assert_eq!(ElemType::Complex128.size(), 16);
        assert!(ElemType::Int32.is_signed_integer());
        assert!(!ElemType::UInt32.is_signed_integer());
        assert!(ElemType::UInt32.is_integer());
        assert!(ElemType::Float32.is_float());
        assert!(!ElemType::Complex64.is_float());
        assert!(ElemType::Complex128.is_complex());
        assert!(!ElemType::Bool.is_integer());
    }

    #[test]
    fn wire_round_trip() {
        for t in [ElemType::Bool, ElemType::Int64, ElemType::R123] {
            let byte: u8 = t.into();
            assert_eq!(ElemType::try_from(byte).unwrap(), t);
        }
    }
}
