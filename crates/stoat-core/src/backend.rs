use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — abstraction over compute devices.
//
// Each backend (CPU today, accelerators later) implements this trait with
// its own storage type and kernels. A trait rather than a device enum keeps
// stoat-core free of any concrete backend: new backends are separate crates
// and Tensor stays generic over B: Backend.
//
// All operations take storage + layout (which encodes shape, strides, and
// offset) and return new storage. The only mutating entry point is
// `index_write`, which scatters into an existing buffer.

/// Identifies a compute device (e.g., "cpu").
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Human-readable name, used in error messages.
    fn name(&self) -> String;
}

/// A buffer holding tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    fn dtype(&self) -> DType;

    /// Number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// The op enums parameterize the backend kernels (one trait method per
// category) and are recorded in Op for autograd, which needs to know which
// op produced a tensor to compute the right gradient.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
}

/// Reductions along dimension(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Comparisons. Produce Bool storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// The core interface every backend implements.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    //  Creation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise ops

    /// result[i] = op(lhs[i], rhs[i]). Layouts handle broadcasting and
    /// non-contiguous access.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// result[i] = op(input[i]).
    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Element-wise comparison, returns Bool storage (0 or 1).
    fn cmp_op(
        op: CmpOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// result = input * mul + add.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce along specific dimensions. If `dims` is empty, reduce over
    /// all elements.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    /// Inclusive prefix sum along `axis`.
    fn cumsum(input: &Self::Storage, layout: &Layout, axis: usize) -> Result<Self::Storage>;

    //  Data movement

    /// Dense row-major copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy to a host Vec<f64> for inspection.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    //  Indexing
    //
    // Both take pre-resolved flat positions into a contiguous buffer; the
    // tensor layer turns coordinate tensors into positions so the backend
    // only moves elements.

    /// Read `positions.len()` elements out of contiguous `input` at the
    /// given flat positions.
    fn index_read(input: &Self::Storage, positions: &[usize]) -> Result<Self::Storage>;

    /// Write elements of `source` (read through `source_layout`) into
    /// `dest` at the given flat positions. Duplicate positions resolve to
    /// whichever write lands last.
    fn index_write(
        dest: &mut Self::Storage,
        positions: &[usize],
        source: &Self::Storage,
        source_layout: &Layout,
    ) -> Result<()>;

    /// Select elements of `input` where `mask` is nonzero, in row-major
    /// order. Returns the selected values and their flat indices (I32).
    fn cond_take(
        input: &Self::Storage,
        input_layout: &Layout,
        mask: &Self::Storage,
        mask_layout: &Layout,
    ) -> Result<(Self::Storage, Self::Storage)>;

    /// result[i] = if mask[i] != 0 { x[i] } else { y[i] }, in one pass.
    fn fused_select(
        mask: &Self::Storage,
        mask_layout: &Layout,
        x: &Self::Storage,
        x_layout: &Layout,
        y: &Self::Storage,
        y_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Concatenation

    /// Concatenate along `axis` into one contiguous storage. Entries are
    /// (storage, layout) so non-contiguous inputs are handled.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        axis: usize,
    ) -> Result<Self::Storage>;

    //  Dtype conversion

    /// Cast storage to a different dtype. The default goes through a host
    /// f64 round-trip; backends should override with a native kernel.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}
