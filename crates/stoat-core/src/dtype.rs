use std::fmt;

// DType — supported element types
//
// Every tensor carries a DType that determines its element size and numeric
// behavior:
//
//   F16  — 16-bit IEEE half float
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the default
//   F64  — 64-bit float
//   Bool — boolean, backs condition masks (where / cond_take)
//   I32  — 32-bit int, the coordinate-index dtype of gather/scatter
//   I64  — 64-bit int, for labels and large indices

/// Enum of all supported element data types.
///
/// Stored inside every tensor so operations can dispatch to the correct
/// typed implementation at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    Bool,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type (Bool excluded).
    pub fn is_int(&self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Promote two dtypes to their common compute type.
    ///
    /// Ladder: Bool < I32 < I64 < half < F32 < F64. The two half types have
    /// no common half representation, so F16 with BF16 promotes to F32.
    pub fn promote(a: DType, b: DType) -> DType {
        if a == b {
            return a;
        }
        // Mixed half types widen to f32.
        if a.is_half() && b.is_half() {
            return DType::F32;
        }
        let rank = |d: DType| match d {
            DType::Bool => 0,
            DType::I32 => 1,
            DType::I64 => 2,
            DType::F16 | DType::BF16 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
        };
        if rank(a) >= rank(b) {
            a
        } else {
            b
        }
    }

    fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

/// Trait implemented by Rust types that can be stored in a tensor.
///
/// Bridges Rust's type system and the runtime DType enum, with conversions
/// to/from f64 for generic numeric code.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
        assert_eq!(DType::I32.size_in_bytes(), 4);
    }

    #[test]
    fn test_promote_same() {
        assert_eq!(DType::promote(DType::F32, DType::F32), DType::F32);
    }

    #[test]
    fn test_promote_ladder() {
        assert_eq!(DType::promote(DType::Bool, DType::I32), DType::I32);
        assert_eq!(DType::promote(DType::I32, DType::F32), DType::F32);
        assert_eq!(DType::promote(DType::I64, DType::F16), DType::F16);
        assert_eq!(DType::promote(DType::F32, DType::F64), DType::F64);
    }

    #[test]
    fn test_promote_mixed_half() {
        assert_eq!(DType::promote(DType::F16, DType::BF16), DType::F32);
    }

    #[test]
    fn test_with_dtype_roundtrip() {
        let v: f64 = 42.0;
        assert_eq!(f64::from_f64(v).to_f64(), v);
        assert_eq!(i64::from_f64(v).to_f64(), v);
        assert_eq!(i32::from_f64(v).to_f64(), v);
    }
}
