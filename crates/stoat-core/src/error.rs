use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// One enum for the whole workspace: shape and rank mismatches, dtype
/// problems (e.g. a non-boolean mask), axis/bounds violations, and device
/// disagreements. Backend-internal failures are wrapped in `Msg` and passed
/// through unmodified.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires operands of equal rank.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch (e.g. mask passed to a select is not Bool).
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Axis index out of range for the tensor's rank.
    #[error("axis out of range: axis {axis} for tensor with {rank} dimensions")]
    DimOutOfRange { axis: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: axis {axis}, start {start}, len {len}, axis_size {axis_size}")]
    NarrowOutOfBounds {
        axis: usize,
        start: usize,
        len: usize,
        axis_size: usize,
    },

    /// Tried to read a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Two operands live on different devices and no resolution was given.
    #[error("ambiguous device: {lhs} vs {rhs}")]
    AmbiguousDevice { lhs: String, rhs: String },

    /// A precondition on an argument was violated (shape/axis/value). The
    /// message names the offending shapes or values.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create an `InvalidArgument` error from a formatted message.
    pub fn invalid(s: impl Into<String>) -> Self {
        Error::InvalidArgument(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
