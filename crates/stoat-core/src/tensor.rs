use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BackendDevice, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — an n-dimensional array on a backend device.
//
// The handle/inner split keeps Tensor cheap to clone: Tensor is an Arc
// around TensorInner, so a clone is a refcount bump and the autograd graph
// can hold inputs without copying data. Storage sits behind Arc<RwLock<..>>
// so views (transpose, narrow, broadcast) share one buffer, optimizer
// updates are visible through every handle, and index_write can mutate in
// place.
//
// Every operation records an Op describing how the result was produced;
// backward() walks that graph.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// Op that created this tensor. Op::None for leaves.
    op: Op<B>,
    /// Marks a trainable parameter (set via set_variable()).
    is_variable: bool,
}

/// An n-dimensional array of numbers on a specific backend.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc::clone is a refcount bump.
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// View sharing the same storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn same_device(&self, rhs: &Self) -> Result<()> {
        if self.inner.device != rhs.inner.device {
            return Err(Error::AmbiguousDevice {
                lhs: self.inner.device.name(),
                rhs: rhs.inner.device.name(),
            });
        }
        Ok(())
    }

    // In-place mutation

    /// Replace the underlying storage data. Every handle sharing this
    /// storage (e.g. a clone held by a module) sees the new values; this
    /// is what makes optimizer steps visible without re-assigning
    /// parameters. Element count and shape are unchanged.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::msg(format!(
                "update_data_inplace: expected {} elements, got {}",
                expected,
                new_data.len()
            )));
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    // Creation

    /// Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor from a typed slice; the dtype comes from the element type.
    pub fn from_slice<T: WithDType>(
        data: &[T],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let host: Vec<f64> = data.iter().map(|v| WithDType::to_f64(*v)).collect();
        Self::from_f64_slice(&host, shape, T::DTYPE, device)
    }

    /// Random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// 1-D tensor of `num` evenly spaced values from `start` to `stop`
    /// inclusive.
    pub fn linspace(
        start: f64,
        stop: f64,
        num: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        if num == 0 {
            return Err(Error::invalid("linspace: num must be >= 1"));
        }
        if num == 1 {
            return Self::from_f64_slice(&[start], 1, dtype, device);
        }
        let step = (stop - start) / (num as f64 - 1.0);
        let data: Vec<f64> = (0..num).map(|i| start + step * i as f64).collect();
        Self::from_f64_slice(&data, num, dtype, device)
    }

    /// 1-D tensor of values [start, start+step, ...) stopping before
    /// `stop`. Values are generated in f64 and converted to `dtype`.
    pub fn arange(
        start: f64,
        stop: f64,
        step: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        if step == 0.0 {
            return Err(Error::invalid("arange: step must be nonzero"));
        }
        let mut data = Vec::new();
        let mut v = start;
        if step > 0.0 {
            while v < stop {
                data.push(v);
                v += step;
            }
        } else {
            while v > stop {
                data.push(v);
                v += step;
            }
        }
        let len = data.len();
        Self::from_f64_slice(&data, len, dtype, device)
    }

    /// Matrix of shape [n, m] with ones on the k-th diagonal, zeros
    /// elsewhere. k > 0 selects a diagonal above the main one, k < 0
    /// below.
    pub fn eye(n: usize, m: usize, k: i64, dtype: DType, device: &B::Device) -> Result<Self> {
        let mut data = vec![0.0f64; n * m];
        for i in 0..n {
            let j = i as i64 + k;
            if j >= 0 && (j as usize) < m {
                data[i * m + j as usize] = 1.0;
            }
        }
        Self::from_f64_slice(&data, (n, m), dtype, device)
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::full(other.shape().clone(), 1.0, other.dtype(), other.device())
    }

    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val, other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable variable. Variables accumulate
    /// gradients during backward().
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    // Shape manipulation (views, no data copy)

    /// Swap two dimensions.
    pub fn transpose(&self, axis0: usize, axis1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(axis0, axis1)?;
        let op = Op::Transpose {
            input: self.clone(),
            axis0,
            axis1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// 2-D matrix transpose, shorthand for transpose(0, 1).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reorder all dimensions. permute(&[2, 0, 1]) on [A, B, C] gives
    /// [C, A, B].
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        let rank = self.rank();
        if axes.len() != rank {
            return Err(Error::invalid(format!(
                "permute: expected {} axes, got {}",
                rank,
                axes.len()
            )));
        }
        let mut seen = vec![false; rank];
        for &a in axes {
            if a >= rank {
                return Err(Error::DimOutOfRange { axis: a, rank });
            }
            if seen[a] {
                return Err(Error::invalid(format!("permute: duplicate axis {}", a)));
            }
            seen[a] = true;
        }
        let old_dims = self.dims();
        let old_strides = self.layout().strides();
        let new_dims: Vec<usize> = axes.iter().map(|&a| old_dims[a]).collect();
        let new_strides: Vec<usize> = axes.iter().map(|&a| old_strides[a]).collect();
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Permute {
            input: self.clone(),
            axes: axes.to_vec(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Slice along a dimension.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(axis, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            axis,
            start,
            len,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to a new shape with the same element count. Non-contiguous
    /// tensors are made contiguous first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let src_shape = tensor.shape().clone();
        let new_layout = Layout::contiguous(new_shape);
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape,
        };
        Ok(tensor.view_with_layout(new_layout, op))
    }

    /// Collapse to a 1-D tensor.
    pub fn flatten_all(&self) -> Result<Self> {
        self.reshape(self.elem_count())
    }

    /// Dense row-major copy. Already-contiguous tensors come back as a
    /// cheap Arc clone.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        let new_layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            new_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 dimension at `axis`. [3, 4] at axis 0 becomes
    /// [1, 3, 4].
    pub fn expand_dims(&self, axis: usize) -> Result<Self> {
        let rank = self.rank();
        if axis > rank {
            return Err(Error::DimOutOfRange {
                axis,
                rank: rank + 1,
            });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        // Stride of a size-1 dim is never walked; use the next dim's
        // stride (or 1 at the end) by convention.
        let stride_val = if axis < rank { new_strides[axis] } else { 1 };
        new_dims.insert(axis, 1);
        new_strides.insert(axis, stride_val);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Remove a size-1 dimension. Errors if the dimension is not size 1.
    pub fn squeeze(&self, axis: usize) -> Result<Self> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { axis, rank });
        }
        if self.dims()[axis] != 1 {
            return Err(Error::invalid(format!(
                "squeeze: axis {} has size {}, expected 1",
                axis,
                self.dims()[axis]
            )));
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        new_dims.remove(axis);
        new_strides.remove(axis);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Broadcast to a larger shape, right-aligned. Zero-copy: repeated
    /// dimensions get stride 0. Differentiable; backward sums the
    /// gradient back to the source shape.
    pub fn broadcast_to(&self, target: impl Into<Shape>) -> Result<Self> {
        let target = target.into();
        if &target == self.shape() {
            return Ok(self.clone());
        }
        let new_layout = self.inner.layout.broadcast_to(&target)?;
        let op = Op::BroadcastTo {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    // Arithmetic

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        self.same_device(rhs)?;
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result_layout = Layout::contiguous(result_shape);
        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// result = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Comparisons — Bool results, non-differentiable

    pub fn eq(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Eq)
    }

    pub fn ne(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ne)
    }

    pub fn gt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Gt)
    }

    pub fn ge(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ge)
    }

    pub fn lt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Lt)
    }

    pub fn le(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Le)
    }

    fn cmp_op(&self, rhs: &Self, op: CmpOp) -> Result<Self> {
        self.same_device(rhs)?;
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::cmp_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result_layout = Layout::contiguous(result_shape);
        Ok(Self::from_storage(
            result,
            result_layout,
            DType::Bool,
            self.inner.device.clone(),
            Op::None,
        ))
    }

    // Unary

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Reductions

    /// Sum all elements into a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn sum(&self, axis: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[axis], keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn mean(&self, axis: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[axis], keep_dim)
    }

    pub fn max(&self, axis: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[axis], keep_dim)
    }

    pub fn min(&self, axis: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Min, &[axis], keep_dim)
    }

    pub(crate) fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    axis: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = self.read_storage()?;
        let result = B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?;

        let result_shape = if dims.is_empty() {
            Shape::from(())
        } else if keep_dim {
            let mut new_dims = self.dims().to_vec();
            for &d in dims {
                new_dims[d] = 1;
            }
            Shape::new(new_dims)
        } else {
            let new_dims: Vec<usize> = self
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect();
            Shape::new(new_dims)
        };

        let result_layout = Layout::contiguous(result_shape);
        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
            keep_dim,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Inclusive prefix sum along `axis`.
    pub fn cumsum(&self, axis: usize) -> Result<Self> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { axis, rank });
        }
        let t = self.contiguous()?;
        let storage = t.read_storage()?;
        let result = B::cumsum(&storage, &t.inner.layout, axis)?;
        drop(storage);
        let result_layout = Layout::contiguous(t.shape().clone());
        let result_op = Op::Cumsum {
            input: t.clone(),
            axis,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Indexing

    /// Read elements at flat positions of this tensor's contiguous data,
    /// returning a 1-D tensor of `positions.len()` elements. Positions
    /// index the row-major flattening of self. Differentiable; backward
    /// scatter-adds the gradient back to the read positions.
    pub fn index_read(&self, positions: Vec<usize>) -> Result<Self> {
        let n = self.elem_count();
        for &p in &positions {
            if p >= n {
                return Err(Error::invalid(format!(
                    "index_read: position {} out of bounds for {} elements",
                    p, n
                )));
            }
        }
        let t = self.contiguous()?;
        let storage = t.read_storage()?;
        let result = B::index_read(&storage, &positions)?;
        drop(storage);
        let len = positions.len();
        let result_layout = Layout::contiguous(Shape::from(len));
        let result_op = Op::IndexRead {
            input: t.clone(),
            positions,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Write elements of `source` into this tensor's storage at flat
    /// positions of its row-major flattening, in place. Duplicate
    /// positions resolve to whichever write lands last, which is
    /// backend-dependent. Requires a contiguous destination. Writes are
    /// not tracked by autograd.
    pub fn index_write(&self, positions: &[usize], source: &Self) -> Result<()> {
        if !self.is_contiguous() {
            return Err(Error::invalid(
                "index_write: destination must be contiguous",
            ));
        }
        if self.dtype() != source.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: source.dtype(),
            });
        }
        if positions.len() != source.elem_count() {
            return Err(Error::invalid(format!(
                "index_write: {} positions but source has {} elements",
                positions.len(),
                source.elem_count()
            )));
        }
        let n = self.elem_count();
        for &p in positions {
            if p >= n {
                return Err(Error::invalid(format!(
                    "index_write: position {} out of bounds for {} elements",
                    p, n
                )));
            }
        }
        // When source shares this tensor's storage (self-scatter, or a view
        // of the destination), the read and write guards would target the
        // same lock. Snapshot the source buffer first in that case.
        if Arc::ptr_eq(&self.inner.storage, &source.inner.storage) {
            let snapshot = source.read_storage()?.clone();
            let mut dest = self.write_storage()?;
            B::index_write(&mut dest, positions, &snapshot, &source.inner.layout)
        } else {
            let source_storage = source.read_storage()?;
            let mut dest = self.write_storage()?;
            B::index_write(&mut dest, positions, &source_storage, &source.inner.layout)
        }
    }

    /// Select elements where `mask` is nonzero, in row-major order.
    /// Returns 1-D (values, indices); indices are I32 offsets into the
    /// row-major flattening. Both outputs are detached from the graph.
    pub fn cond_take(&self, mask: &Self) -> Result<(Self, Self)> {
        self.same_device(mask)?;
        if self.shape() != mask.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: mask.shape().clone(),
            });
        }
        let input_s = self.read_storage()?;
        let mask_s = mask.read_storage()?;
        let (values, indices) =
            B::cond_take(&input_s, &self.inner.layout, &mask_s, &mask.inner.layout)?;
        drop(input_s);
        drop(mask_s);
        let n = crate::backend::BackendStorage::len(&values);
        let values = Self::from_storage(
            values,
            Layout::contiguous(Shape::from(n)),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::None,
        );
        let indices = Self::from_storage(
            indices,
            Layout::contiguous(Shape::from(n)),
            DType::I32,
            self.inner.device.clone(),
            Op::None,
        );
        Ok((values, indices))
    }

    /// Single-pass select: result[i] = mask[i] ? x[i] : y[i]. All three
    /// tensors must already share one shape. Backward routes the gradient
    /// to x where the mask is set and to y elsewhere.
    pub fn fused_select(mask: &Self, x: &Self, y: &Self) -> Result<Self> {
        x.same_device(y)?;
        x.same_device(mask)?;
        if x.dtype() != y.dtype() {
            return Err(Error::DTypeMismatch {
                expected: x.dtype(),
                got: y.dtype(),
            });
        }
        if x.shape() != y.shape() || x.shape() != mask.shape() {
            return Err(Error::ShapeMismatch {
                expected: x.shape().clone(),
                got: if x.shape() != y.shape() {
                    y.shape().clone()
                } else {
                    mask.shape().clone()
                },
            });
        }
        let mask_s = mask.read_storage()?;
        let x_s = x.read_storage()?;
        let y_s = y.read_storage()?;
        let result = B::fused_select(
            &mask_s,
            &mask.inner.layout,
            &x_s,
            &x.inner.layout,
            &y_s,
            &y.inner.layout,
        )?;
        let result_layout = Layout::contiguous(x.shape().clone());
        let result_op = Op::FusedSelect {
            mask: mask.clone(),
            x: x.clone(),
            y: y.clone(),
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            x.inner.dtype,
            x.inner.device.clone(),
            result_op,
        ))
    }

    // Concatenation

    /// Concatenate tensors along `axis`. All inputs must agree on every
    /// dimension except `axis`.
    pub fn cat(tensors: &[Self], axis: usize) -> Result<Self> {
        if tensors.is_empty() {
            return Err(Error::invalid("cat: empty tensor list"));
        }
        if tensors.len() == 1 {
            return Ok(tensors[0].clone());
        }

        let first = &tensors[0];
        let rank = first.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { axis, rank });
        }
        for (i, t) in tensors.iter().enumerate().skip(1) {
            first.same_device(t)?;
            if t.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: t.rank(),
                });
            }
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            for d in 0..rank {
                if d != axis && t.dims()[d] != first.dims()[d] {
                    return Err(Error::invalid(format!(
                        "cat: tensor {} has size {} at axis {} but expected {}",
                        i,
                        t.dims()[d],
                        d,
                        first.dims()[d]
                    )));
                }
            }
        }

        let cat_size: usize = tensors.iter().map(|t| t.dims()[axis]).sum();
        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = cat_size;
        let out_shape = Shape::new(out_dims);
        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[axis]).collect();

        let guards: Vec<_> = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (&*guards[i], &t.inner.layout))
            .collect();

        let storage = B::cat(&pairs, &out_shape, axis)?;
        drop(pairs);
        drop(guards);
        let layout = Layout::contiguous(out_shape);
        let op = Op::Cat {
            inputs: tensors.to_vec(),
            axis,
            sizes,
        };
        Ok(Self::from_storage(
            storage,
            layout,
            first.dtype(),
            first.device().clone(),
            op,
        ))
    }

    /// Stack tensors along a new dimension at `axis`. All inputs must
    /// share one shape.
    pub fn stack(tensors: &[Self], axis: usize) -> Result<Self> {
        if tensors.is_empty() {
            return Err(Error::invalid("stack: empty tensor list"));
        }
        let first_shape = tensors[0].shape().clone();
        let rank = first_shape.rank();
        if axis > rank {
            return Err(Error::DimOutOfRange {
                axis,
                rank: rank + 1,
            });
        }
        for t in tensors.iter().skip(1) {
            if t.shape() != &first_shape {
                return Err(Error::ShapeMismatch {
                    expected: first_shape.clone(),
                    got: t.shape().clone(),
                });
            }
        }
        let unsqueezed: Vec<Self> = tensors
            .iter()
            .map(|t| t.expand_dims(axis))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&unsqueezed, axis)
    }

    // Dtype conversion

    /// Convert to a different dtype. A no-op (Arc clone) when the dtype
    /// already matches. Backward casts the gradient back to the source
    /// dtype.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let src_dtype = self.dtype();
        let storage = self.read_storage()?;
        let result = B::cast(&storage, &self.inner.layout, dtype, self.device())?;
        drop(storage);
        let layout = Layout::contiguous(self.shape().clone());
        let op = Op::ToDtype {
            input: self.clone(),
            src_dtype,
        };
        Ok(Self::from_storage(
            result,
            layout,
            dtype,
            self.device().clone(),
            op,
        ))
    }

    // Host access

    /// Copy the tensor contents to a host Vec<f64> in row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// Extract a scalar value. The tensor must have exactly one element.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let vec = self.to_f64_vec()?;
        Ok(vec[0])
    }

    // Autograd

    /// Run backpropagation from this (scalar) tensor. Returns the
    /// gradients of all variables it depends on.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Detached copy: same data, no gradient tracking.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }
}
