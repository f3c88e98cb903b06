// Op — computation graph node for automatic differentiation.
//
// Every tensor produced by an operation records how it was made. The ops
// form a DAG that backward() traverses in reverse topological order,
// accumulating gradients by the chain rule.
//
// Each variant stores the actual input Tensor(s) rather than bare ids.
// Tensor is Arc-wrapped so these clones are refcount bumps, and holding the
// inputs keeps them alive exactly as long as backward might need them; the
// graph needs no separate registry.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Records the operation that produced a tensor.
///
/// Op<B> is generic over the Backend because it stores Tensor<B>.
pub enum Op<B: Backend> {
    /// Leaf tensor (input data or trainable parameter).
    None,

    /// Element-wise binary: result = op(lhs, rhs)
    Binary {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input)
    Unary {
        input: crate::Tensor<B>,
        op: UnaryOp,
    },

    /// Reduction over `dims` (all dims when empty).
    Reduce {
        input: crate::Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    /// Same data, different shape. src_shape lets backward reshape the
    /// gradient back.
    Reshape {
        input: crate::Tensor<B>,
        src_shape: crate::Shape,
    },

    /// Swap two dimensions.
    Transpose {
        input: crate::Tensor<B>,
        axis0: usize,
        axis1: usize,
    },

    /// Arbitrary axis reordering. Backward applies the inverse
    /// permutation to the gradient.
    Permute {
        input: crate::Tensor<B>,
        axes: Vec<usize>,
    },

    /// Slice along a dimension.
    Narrow {
        input: crate::Tensor<B>,
        axis: usize,
        start: usize,
        len: usize,
    },

    /// Stride-0 broadcast view to a larger shape. Backward sums the
    /// gradient back down to src_shape.
    BroadcastTo {
        input: crate::Tensor<B>,
        src_shape: crate::Shape,
    },

    /// result = input * mul + add
    Affine {
        input: crate::Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Contiguous copy. Gradient passes through unchanged.
    Contiguous { input: crate::Tensor<B> },

    /// Concatenation along `axis`. `sizes` records each input's extent
    /// along `axis` so backward can narrow the gradient back apart.
    Cat {
        inputs: Vec<crate::Tensor<B>>,
        axis: usize,
        sizes: Vec<usize>,
    },

    /// Dtype conversion. Backward casts the gradient back to src_dtype.
    ToDtype {
        input: crate::Tensor<B>,
        src_dtype: crate::dtype::DType,
    },

    /// Flat-position read out of a contiguous input (the lowering of
    /// coordinate-tensor gather). `positions` are kept for backward,
    /// which scatter-adds the gradient back to those positions.
    IndexRead {
        input: crate::Tensor<B>,
        positions: Vec<usize>,
    },

    /// Single-pass select: result[i] = mask[i] ? x[i] : y[i].
    /// Backward routes the gradient to x where the mask is set and to y
    /// elsewhere; the mask gets no gradient.
    FusedSelect {
        mask: crate::Tensor<B>,
        x: crate::Tensor<B>,
        y: crate::Tensor<B>,
    },

    /// Inclusive prefix sum along `axis`. Backward is the reverse-order
    /// prefix sum of the gradient.
    Cumsum {
        input: crate::Tensor<B>,
        axis: usize,
    },
}

// Manual Clone because derive can't see through the generic. All clones
// are cheap (Arc refcount bumps).
impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, axis0, axis1 } => Op::Transpose {
                input: input.clone(),
                axis0: *axis0,
                axis1: *axis1,
            },
            Op::Permute { input, axes } => Op::Permute {
                input: input.clone(),
                axes: axes.clone(),
            },
            Op::Narrow {
                input,
                axis,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                axis: *axis,
                start: *start,
                len: *len,
            },
            Op::BroadcastTo { input, src_shape } => Op::BroadcastTo {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Cat {
                inputs,
                axis,
                sizes,
            } => Op::Cat {
                inputs: inputs.clone(),
                axis: *axis,
                sizes: sizes.clone(),
            },
            Op::ToDtype { input, src_dtype } => Op::ToDtype {
                input: input.clone(),
                src_dtype: *src_dtype,
            },
            Op::IndexRead { input, positions } => Op::IndexRead {
                input: input.clone(),
                positions: positions.clone(),
            },
            Op::FusedSelect { mask, x, y } => Op::FusedSelect {
                mask: mask.clone(),
                x: x.clone(),
                y: y.clone(),
            },
            Op::Cumsum { input, axis } => Op::Cumsum {
                input: input.clone(),
                axis: *axis,
            },
        }
    }
}

// Concise Debug: op kind and tensor ids only, never tensor data.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({:?}, dims={:?}, id={:?})", op, dims, input.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape(from {}, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, axis0, axis1 } => {
                write!(f, "Transpose({}, {}, id={:?})", axis0, axis1, input.id())
            }
            Op::Permute { input, axes } => {
                write!(f, "Permute({:?}, id={:?})", axes, input.id())
            }
            Op::Narrow {
                input,
                axis,
                start,
                len,
            } => write!(
                f,
                "Narrow(axis={}, {}..{}, id={:?})",
                axis,
                start,
                start + len,
                input.id()
            ),
            Op::BroadcastTo { input, src_shape } => {
                write!(f, "BroadcastTo(from {}, id={:?})", src_shape, input.id())
            }
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::Cat { inputs, axis, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(axis={}, ids={:?})", axis, ids)
            }
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype(from={:?}, id={:?})", src_dtype, input.id())
            }
            Op::IndexRead { input, positions } => {
                write!(f, "IndexRead(n={}, id={:?})", positions.len(), input.id())
            }
            Op::FusedSelect { mask, x, y } => write!(
                f,
                "FusedSelect(mask={:?}, x={:?}, y={:?})",
                mask.id(),
                x.id(),
                y.id()
            ),
            Op::Cumsum { input, axis } => {
                write!(f, "Cumsum(axis={}, id={:?})", axis, input.id())
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// References to all input tensors of this operation. Drives the
    /// topological sort in backward().
    pub fn inputs(&self) -> Vec<&crate::Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Permute { input, .. }
            | Op::Narrow { input, .. }
            | Op::BroadcastTo { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::ToDtype { input, .. }
            | Op::IndexRead { input, .. }
            | Op::Cumsum { input, .. } => vec![input],
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::FusedSelect { mask, x, y } => vec![mask, x, y],
        }
    }
}
