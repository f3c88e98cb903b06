// Tensor manipulation functions
//
// The operations here are glue over the tensor substrate: argument
// validation, shape algebra, and lowering. The two families that carry
// real machinery are
//
//   * gather/scatter, lowered through per-axis coordinate expansion
//     (`axis_coords`) into flat-position reads and writes, and
//   * repeat/tile/roll, built purely from expand_dims + broadcast +
//     reshape + narrow + concat, with no dedicated replication kernel.
//
// Everything validates eagerly and synchronously; errors name the
// offending shapes or axes.

use std::sync::Arc;

use stoat_core::{Backend, BackendDevice, DType, Error, Result, Shape, Tensor};

use crate::fused::{select_program, SelectProgram};

// Argument coercion

/// A value that may arrive as a plain scalar or as a tensor.
///
/// Several entry points accept either form (e.g. the start/stop of
/// `linspace`). Normalization happens in one place so every caller
/// coerces the same way.
#[derive(Debug, Clone)]
pub enum ScalarOrTensor<B: Backend> {
    Scalar(f64),
    Tensor(Tensor<B>),
}

impl<B: Backend> ScalarOrTensor<B> {
    /// Coerce to a tensor, materializing scalars as 0-D constants.
    pub fn to_tensor(&self, dtype: DType, device: &B::Device) -> Result<Tensor<B>> {
        match self {
            ScalarOrTensor::Scalar(v) => Tensor::from_f64_slice(&[*v], (), dtype, device),
            ScalarOrTensor::Tensor(t) => Ok(t.clone()),
        }
    }

    /// Coerce to a scalar; tensor inputs must be single-element.
    pub fn to_scalar(&self) -> Result<f64> {
        match self {
            ScalarOrTensor::Scalar(v) => Ok(*v),
            ScalarOrTensor::Tensor(t) => t.to_scalar_f64(),
        }
    }
}

impl<B: Backend> From<f64> for ScalarOrTensor<B> {
    fn from(v: f64) -> Self {
        ScalarOrTensor::Scalar(v)
    }
}

impl<B: Backend> From<Tensor<B>> for ScalarOrTensor<B> {
    fn from(t: Tensor<B>) -> Self {
        ScalarOrTensor::Tensor(t)
    }
}

fn check_same_device<B: Backend>(a: &Tensor<B>, b: &Tensor<B>) -> Result<()> {
    if a.device() != b.device() {
        return Err(Error::AmbiguousDevice {
            lhs: a.device().name(),
            rhs: b.device().name(),
        });
    }
    Ok(())
}

fn check_axis(axis: usize, rank: usize) -> Result<()> {
    if axis >= rank {
        return Err(Error::DimOutOfRange { axis, rank });
    }
    Ok(())
}

// Creation

pub fn zeros<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::zeros(shape, dtype, device)
}

pub fn ones<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::ones(shape, dtype, device)
}

pub fn full<B: Backend>(
    shape: impl Into<Shape>,
    value: ScalarOrTensor<B>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::full(shape, value.to_scalar()?, dtype, device)
}

pub fn zeros_like<B: Backend>(inp: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::zeros_like(inp)
}

pub fn ones_like<B: Backend>(inp: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::ones_like(inp)
}

pub fn full_like<B: Backend>(inp: &Tensor<B>, value: f64) -> Result<Tensor<B>> {
    Tensor::full_like(inp, value)
}

/// Identity-like matrix of shape [n, m] with ones on the main diagonal.
pub fn eye<B: Backend>(n: usize, m: usize, dtype: DType, device: &B::Device) -> Result<Tensor<B>> {
    Tensor::eye(n, m, 0, dtype, device)
}

/// Evenly spaced values over a closed interval. `start` and `stop` may
/// be scalars or single-element tensors.
pub fn linspace<B: Backend>(
    start: ScalarOrTensor<B>,
    stop: ScalarOrTensor<B>,
    num: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::linspace(start.to_scalar()?, stop.to_scalar()?, num, dtype, device)
}

/// Half-open range [start, stop) with the given step.
pub fn arange<B: Backend>(
    start: ScalarOrTensor<B>,
    stop: ScalarOrTensor<B>,
    step: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::arange(start.to_scalar()?, stop.to_scalar()?, step, dtype, device)
}

/// Diagonal extraction and construction.
///
/// A 2-D input yields the 1-D k-th diagonal, read through a
/// differentiable indexed load. A 1-D input of length d yields a
/// (d+|k|) square matrix with the input on the k-th diagonal; the
/// construction writes into fresh zeros and is not differentiated.
pub fn diag<B: Backend>(inp: &Tensor<B>, k: i64) -> Result<Tensor<B>> {
    match inp.rank() {
        2 => {
            let (n, m) = (inp.dims()[0], inp.dims()[1]);
            let mut positions = Vec::new();
            for i in 0..n {
                let j = i as i64 + k;
                if j >= 0 && (j as usize) < m {
                    positions.push(i * m + j as usize);
                }
            }
            inp.index_read(positions)
        }
        1 => {
            let d = inp.dims()[0];
            let n = d + k.unsigned_abs() as usize;
            let out = Tensor::zeros((n, n), inp.dtype(), inp.device())?;
            let mut positions = Vec::with_capacity(d);
            for i in 0..d {
                let (row, col) = if k >= 0 {
                    (i, i + k as usize)
                } else {
                    (i + (-k) as usize, i)
                };
                positions.push(row * n + col);
            }
            out.index_write(&positions, &inp.contiguous()?)?;
            Ok(out)
        }
        r => Err(Error::invalid(format!(
            "diag: expected a 1-D or 2-D tensor, got rank {}",
            r
        ))),
    }
}

// Shape manipulation

pub fn broadcast_to<B: Backend>(inp: &Tensor<B>, shape: impl Into<Shape>) -> Result<Tensor<B>> {
    inp.broadcast_to(shape)
}

/// Reshape with at most one inferred dimension. A `-1` entry takes
/// whatever extent makes the element counts match.
pub fn reshape<B: Backend>(inp: &Tensor<B>, shape: &[isize]) -> Result<Tensor<B>> {
    let mut infer = None;
    let mut known: usize = 1;
    for (i, &d) in shape.iter().enumerate() {
        if d == -1 {
            if infer.is_some() {
                return Err(Error::invalid(
                    "reshape: at most one dimension may be -1",
                ));
            }
            infer = Some(i);
        } else if d < 0 {
            return Err(Error::invalid(format!(
                "reshape: invalid dimension {} at position {}",
                d, i
            )));
        } else {
            known *= d as usize;
        }
    }
    let total = inp.elem_count();
    let mut dims: Vec<usize> = shape
        .iter()
        .map(|&d| if d == -1 { 0 } else { d as usize })
        .collect();
    if let Some(i) = infer {
        if known == 0 || total % known != 0 {
            return Err(Error::invalid(format!(
                "reshape: cannot infer dimension, {} elements do not divide into {:?}",
                total, shape
            )));
        }
        dims[i] = total / known;
    }
    inp.reshape(dims)
}

/// Merge the axes in [start_axis, end_axis] into one.
pub fn flatten<B: Backend>(
    inp: &Tensor<B>,
    start_axis: usize,
    end_axis: usize,
) -> Result<Tensor<B>> {
    let rank = inp.rank();
    check_axis(end_axis, rank)?;
    if start_axis > end_axis {
        return Err(Error::invalid(format!(
            "flatten: start_axis {} is past end_axis {}",
            start_axis, end_axis
        )));
    }
    let dims = inp.dims();
    let mut new_dims: Vec<usize> = dims[..start_axis].to_vec();
    new_dims.push(dims[start_axis..=end_axis].iter().product());
    new_dims.extend_from_slice(&dims[end_axis + 1..]);
    inp.reshape(new_dims)
}

/// Insert size-1 axes at the given positions. Positions refer to the
/// result, so they are applied in ascending order.
pub fn expand_dims<B: Backend>(inp: &Tensor<B>, axes: &[usize]) -> Result<Tensor<B>> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    let mut out = inp.clone();
    for &axis in &sorted {
        out = out.expand_dims(axis)?;
    }
    Ok(out)
}

/// Remove size-1 axes. With no axes given, every size-1 axis goes.
pub fn squeeze<B: Backend>(inp: &Tensor<B>, axes: Option<&[usize]>) -> Result<Tensor<B>> {
    match axes {
        Some(axes) => {
            let mut sorted = axes.to_vec();
            sorted.sort_unstable();
            let mut out = inp.clone();
            // Descending so earlier removals do not shift later axes.
            for &axis in sorted.iter().rev() {
                out = out.squeeze(axis)?;
            }
            Ok(out)
        }
        None => {
            let dims: Vec<usize> = inp.dims().iter().copied().filter(|&d| d != 1).collect();
            inp.reshape(dims)
        }
    }
}

/// Reorder axes by the given permutation.
pub fn transpose<B: Backend>(inp: &Tensor<B>, pattern: &[usize]) -> Result<Tensor<B>> {
    inp.permute(pattern)
}

pub fn concat<B: Backend>(tensors: &[Tensor<B>], axis: usize) -> Result<Tensor<B>> {
    Tensor::cat(tensors, axis)
}

pub fn stack<B: Backend>(tensors: &[Tensor<B>], axis: usize) -> Result<Tensor<B>> {
    Tensor::stack(tensors, axis)
}

/// How to divide an axis in [`split`].
#[derive(Debug, Clone)]
pub enum SplitSpec {
    /// Split into this many equal parts; the extent must divide evenly.
    Count(usize),
    /// Explicit part sizes; they must sum to the extent.
    Sections(Vec<usize>),
}

/// Divide `inp` along `axis` into contiguous views.
pub fn split<B: Backend>(
    inp: &Tensor<B>,
    spec: SplitSpec,
    axis: usize,
) -> Result<Vec<Tensor<B>>> {
    check_axis(axis, inp.rank())?;
    let extent = inp.dims()[axis];
    let sizes = match spec {
        SplitSpec::Count(n) => {
            if n == 0 || extent % n != 0 {
                return Err(Error::invalid(format!(
                    "split: axis {} of extent {} does not divide into {} parts",
                    axis, extent, n
                )));
            }
            vec![extent / n; n]
        }
        SplitSpec::Sections(sizes) => {
            let total: usize = sizes.iter().sum();
            if total != extent {
                return Err(Error::invalid(format!(
                    "split: sections {:?} sum to {}, axis {} has extent {}",
                    sizes, total, axis, extent
                )));
            }
            sizes
        }
    };
    let mut parts = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for len in sizes {
        parts.push(inp.narrow(axis, start, len)?);
        start += len;
    }
    Ok(parts)
}

/// Materialize a fresh buffer with the same values. The result shares
/// nothing with the input; gradients pass through unchanged. A target
/// device may be named but must match the input's device, since no
/// transfer path exists between backends.
pub fn copy<B: Backend>(inp: &Tensor<B>, device: Option<&B::Device>) -> Result<Tensor<B>> {
    if let Some(device) = device {
        if device != inp.device() {
            return Err(Error::invalid(format!(
                "copy: no transfer path from {} to {}",
                inp.device().name(),
                device.name()
            )));
        }
    }
    inp.affine(1.0, 0.0)
}

// Gather / scatter

/// Per-axis coordinate expansion for an index tensor.
///
/// For every dimension other than `axis`, builds the sequence
/// `0..extent`, shapes it to vary along that dimension only, broadcasts
/// it to `index`'s shape, and flattens. The axis dimension uses the
/// flattened `index` values themselves. The result is one I32
/// coordinate tensor per dimension, all of length
/// `index.elem_count()`, forming a simultaneous multi-axis index.
pub fn axis_coords<B: Backend>(index: &Tensor<B>, axis: usize) -> Result<Vec<Tensor<B>>> {
    let rank = index.rank();
    check_axis(axis, rank)?;
    let dims = index.dims().to_vec();
    let mut coords = Vec::with_capacity(rank);
    for i in 0..rank {
        if i == axis {
            coords.push(index.flatten_all()?.to_dtype(DType::I32)?);
        } else {
            let row = Tensor::arange(0.0, dims[i] as f64, 1.0, DType::I32, index.device())?;
            let mut view = vec![1usize; rank];
            view[i] = dims[i];
            let coord = row
                .reshape(view)?
                .broadcast_to(dims.clone())?
                .flatten_all()?;
            coords.push(coord);
        }
    }
    Ok(coords)
}

/// Fold coordinate tensors into flat row-major positions for a tensor
/// of the given shape, validating each coordinate against its extent.
fn flat_positions<B: Backend>(shape: &Shape, coords: &[Tensor<B>]) -> Result<Vec<usize>> {
    let strides = shape.stride_contiguous();
    let dims = shape.dims();
    let count = coords.first().map(|c| c.elem_count()).unwrap_or(0);
    let mut positions = vec![0usize; count];
    for (dim, coord) in coords.iter().enumerate() {
        let values = coord.to_f64_vec()?;
        for (pos, &v) in positions.iter_mut().zip(values.iter()) {
            let c = v as i64;
            if c < 0 || c as usize >= dims[dim] {
                return Err(Error::invalid(format!(
                    "index value {} out of range for dimension {} of extent {}",
                    c, dim, dims[dim]
                )));
            }
            *pos += c as usize * strides[dim];
        }
    }
    Ok(positions)
}

/// Gather elements of `inp` along `axis` at the positions named by
/// `index`.
///
/// `out[c] = inp[c with c[axis] replaced by index[c]]` for every
/// coordinate `c` of `index`; the output has exactly `index`'s shape.
/// `inp` and `index` must have equal rank and agree on every dimension
/// other than `axis`. Differentiable; the backward pass scatter-adds
/// the gradient back to the read positions.
pub fn gather<B: Backend>(inp: &Tensor<B>, axis: usize, index: &Tensor<B>) -> Result<Tensor<B>> {
    let rank = inp.rank();
    if index.rank() != rank {
        return Err(Error::RankMismatch {
            expected: rank,
            got: index.rank(),
        });
    }
    check_axis(axis, rank)?;
    for i in 0..rank {
        if i != axis && inp.dims()[i] != index.dims()[i] {
            return Err(Error::invalid(format!(
                "gather: inp shape {} and index shape {} disagree on dimension {}",
                inp.shape(),
                index.shape(),
                i
            )));
        }
    }
    let coords = axis_coords(index, axis)?;
    let positions = flat_positions(inp.shape(), &coords)?;
    inp.index_read(positions)?.reshape(index.shape().clone())
}

/// Scatter `source` into `inp` along `axis` at the positions named by
/// `index`, in place.
///
/// For each coordinate `c` of `source`,
/// `inp[c with c[axis] = index[c]] = source[c]`. The write goes through
/// `inp`'s shared storage, so every aliasing handle observes it; the
/// same handle is returned for chaining. When two source coordinates
/// map to one destination element the surviving value is
/// backend-dependent. Not differentiated.
pub fn scatter<B: Backend>(
    inp: &Tensor<B>,
    axis: usize,
    index: &Tensor<B>,
    source: &Tensor<B>,
) -> Result<Tensor<B>> {
    let rank = inp.rank();
    if index.rank() != rank || source.rank() != rank {
        return Err(Error::RankMismatch {
            expected: rank,
            got: if index.rank() != rank {
                index.rank()
            } else {
                source.rank()
            },
        });
    }
    check_axis(axis, rank)?;
    if index.shape() != source.shape() {
        return Err(Error::invalid(format!(
            "scatter: index shape {} and source shape {} must match",
            index.shape(),
            source.shape()
        )));
    }
    for i in 0..rank {
        if source.dims()[i] > inp.dims()[i] {
            return Err(Error::invalid(format!(
                "scatter: source shape {} exceeds inp shape {} on dimension {}",
                source.shape(),
                inp.shape(),
                i
            )));
        }
    }
    if inp.dtype() != source.dtype() {
        return Err(Error::DTypeMismatch {
            expected: inp.dtype(),
            got: source.dtype(),
        });
    }
    let coords = axis_coords(index, axis)?;
    let positions = flat_positions(inp.shape(), &coords)?;
    inp.index_write(&positions, &source.contiguous()?)?;
    Ok(inp.clone())
}

// Repeat / tile / roll

/// Replicate each element of `inp` `repeats` times along `axis`.
///
/// The axis of extent d splits into (d, 1), the trailing 1 broadcasts
/// to `repeats`, and the pair merges back into d * repeats, so
/// consecutive copies of each element sit next to each other. With
/// `axis = None` the input is flattened first and the result stays
/// flat.
pub fn repeat<B: Backend>(
    inp: &Tensor<B>,
    repeats: usize,
    axis: Option<usize>,
) -> Result<Tensor<B>> {
    let (x, axis) = match axis {
        Some(axis) => {
            check_axis(axis, inp.rank())?;
            (inp.clone(), axis)
        }
        None => (inp.flatten_all()?, 0),
    };
    let extent = x.dims()[axis];
    let expanded = x.expand_dims(axis + 1)?;
    let mut target = expanded.dims().to_vec();
    target[axis + 1] = repeats;
    let broadcast = expanded.broadcast_to(target)?;
    let mut merged = x.dims().to_vec();
    merged[axis] = extent * repeats;
    broadcast.reshape(merged)
}

/// Tile `inp` along one axis: the whole axis repeats as a block.
fn tile_one_axis<B: Backend>(inp: &Tensor<B>, rep: usize, axis: usize) -> Result<Tensor<B>> {
    let extent = inp.dims()[axis];
    let expanded = inp.expand_dims(axis)?;
    let mut target = expanded.dims().to_vec();
    target[axis] = rep;
    let broadcast = expanded.broadcast_to(target)?;
    let mut merged = inp.dims().to_vec();
    merged[axis] = rep * extent;
    broadcast.reshape(merged)
}

/// Tile `inp` by `reps`, rightmost-aligned.
///
/// Requires `reps.len() >= inp.rank()`; extra leading entries become
/// new leading dimensions. The result shape is the elementwise product
/// of the left-padded input shape and `reps`.
pub fn tile<B: Backend>(inp: &Tensor<B>, reps: &[usize]) -> Result<Tensor<B>> {
    if reps.len() < inp.rank() {
        return Err(Error::invalid(format!(
            "tile: got {} reps for a rank-{} tensor, need at least one per dimension",
            reps.len(),
            inp.rank()
        )));
    }
    let mut out = inp.clone();
    while out.rank() < reps.len() {
        out = out.expand_dims(0)?;
    }
    for (axis, &rep) in reps.iter().enumerate() {
        if rep != 1 {
            out = tile_one_axis(&out, rep, axis)?;
        }
    }
    Ok(out)
}

/// Cyclically shift `inp` along the given axes.
///
/// Each `(shift, axis)` pair rotates the axis by `shift` positions
/// toward higher indices (negative shifts go the other way). Shifts
/// normalize modulo the axis extent; a zero-extent axis is a no-op.
/// Pairs apply sequentially in the given order, so repeating an axis
/// compounds. With `axes = None` a single shift applies to the
/// flattened tensor and the original shape is restored.
pub fn roll<B: Backend>(
    inp: &Tensor<B>,
    shifts: &[i64],
    axes: Option<&[usize]>,
) -> Result<Tensor<B>> {
    match axes {
        None => {
            if shifts.len() != 1 {
                return Err(Error::invalid(format!(
                    "roll: flattened roll takes exactly one shift, got {}",
                    shifts.len()
                )));
            }
            let flat = inp.flatten_all()?;
            let rolled = roll_one_axis(&flat, shifts[0], 0)?;
            rolled.reshape(inp.shape().clone())
        }
        Some(axes) => {
            if shifts.len() != axes.len() {
                return Err(Error::invalid(format!(
                    "roll: {} shifts but {} axes",
                    shifts.len(),
                    axes.len()
                )));
            }
            let mut out = inp.clone();
            for (&shift, &axis) in shifts.iter().zip(axes.iter()) {
                out = roll_one_axis(&out, shift, axis)?;
            }
            Ok(out)
        }
    }
}

fn roll_one_axis<B: Backend>(inp: &Tensor<B>, shift: i64, axis: usize) -> Result<Tensor<B>> {
    check_axis(axis, inp.rank())?;
    let extent = inp.dims()[axis];
    if extent == 0 {
        return Ok(inp.clone());
    }
    let k = shift.rem_euclid(extent as i64) as usize;
    if k == 0 {
        return Ok(inp.clone());
    }
    let head = inp.narrow(axis, extent - k, k)?;
    let tail = inp.narrow(axis, 0, extent - k)?;
    Tensor::cat(&[head, tail], axis)
}

// Select / take / scan

/// Elementwise select: `out = mask ? x : y`.
///
/// The mask must be Bool; all three operands must share a device.
/// Shapes broadcast to a common shape and `x`/`y` promote to a common
/// dtype before the select runs. Execution goes through the memoized
/// per-(dtype, device) select program; the gradient of `x` passes
/// through where the mask is set, the gradient of `y` where it is not,
/// and the mask itself gets none.
pub fn where_<B: Backend>(mask: &Tensor<B>, x: &Tensor<B>, y: &Tensor<B>) -> Result<Tensor<B>> {
    if mask.dtype() != DType::Bool {
        return Err(Error::DTypeMismatch {
            expected: DType::Bool,
            got: mask.dtype(),
        });
    }
    check_same_device(mask, x)?;
    check_same_device(mask, y)?;
    let dtype = DType::promote(x.dtype(), y.dtype());
    let x = x.to_dtype(dtype)?;
    let y = y.to_dtype(dtype)?;
    let shape = Shape::broadcast_shape(mask.shape(), x.shape())?;
    let shape = Shape::broadcast_shape(&shape, y.shape())?;
    let mask = mask.broadcast_to(shape.clone())?;
    let x = x.broadcast_to(shape.clone())?;
    let y = y.broadcast_to(shape)?;
    let program: Arc<SelectProgram> = select_program(dtype, &mask.device().name());
    program.execute(&mask, &x, &y)
}

/// Take elements of `x` where `mask` is set, in row-major order.
/// Returns 1-D values and their I32 flat indices.
pub fn cond_take<B: Backend>(mask: &Tensor<B>, x: &Tensor<B>) -> Result<(Tensor<B>, Tensor<B>)> {
    if mask.dtype() != DType::Bool {
        return Err(Error::DTypeMismatch {
            expected: DType::Bool,
            got: mask.dtype(),
        });
    }
    x.cond_take(mask)
}

/// Inclusive prefix sum along `axis`.
pub fn cumsum<B: Backend>(inp: &Tensor<B>, axis: usize) -> Result<Tensor<B>> {
    check_axis(axis, inp.rank())?;
    inp.cumsum(axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;
    const DEV: CpuDevice = CpuDevice;

    fn f32s(data: &[f64], shape: impl Into<Shape>) -> Result<T> {
        T::from_f64_slice(data, shape, DType::F32, &DEV)
    }

    #[test]
    fn axis_coords_enumerates_off_axis_dims() -> Result<()> {
        let index = T::from_f64_slice(&[0.0, 2.0, 1.0, 0.0], (2, 2), DType::I32, &DEV)?;
        let coords = axis_coords(&index, 0)?;
        assert_eq!(coords.len(), 2);
        // Axis 0 carries the index values, axis 1 the column numbers.
        assert_eq!(coords[0].to_f64_vec()?, vec![0.0, 2.0, 1.0, 0.0]);
        assert_eq!(coords[1].to_f64_vec()?, vec![0.0, 1.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn reshape_infers_one_dimension() -> Result<()> {
        let t = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        let r = reshape(&t, &[3, -1])?;
        assert_eq!(r.dims(), &[3, 2]);
        assert!(reshape(&t, &[-1, -1]).is_err());
        assert!(reshape(&t, &[4, -1]).is_err());
        Ok(())
    }

    #[test]
    fn diag_extracts_and_builds() -> Result<()> {
        let m = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        assert_eq!(diag(&m, 0)?.to_f64_vec()?, vec![1.0, 5.0]);
        assert_eq!(diag(&m, 1)?.to_f64_vec()?, vec![2.0, 6.0]);
        assert_eq!(diag(&m, -1)?.to_f64_vec()?, vec![4.0]);

        let v = f32s(&[7.0, 8.0], 2)?;
        let d = diag(&v, 1)?;
        assert_eq!(d.dims(), &[3, 3]);
        assert_eq!(
            d.to_f64_vec()?,
            vec![0.0, 7.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn split_by_count_and_sections() -> Result<()> {
        let t = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        let halves = split(&t, SplitSpec::Count(2), 0)?;
        assert_eq!(halves.len(), 2);
        assert_eq!(halves[1].to_f64_vec()?, vec![4.0, 5.0, 6.0]);

        let cols = split(&t, SplitSpec::Sections(vec![1, 2]), 1)?;
        assert_eq!(cols[0].to_f64_vec()?, vec![1.0, 4.0]);
        assert_eq!(cols[1].to_f64_vec()?, vec![2.0, 3.0, 5.0, 6.0]);

        assert!(split(&t, SplitSpec::Count(4), 1).is_err());
        assert!(split(&t, SplitSpec::Sections(vec![1, 1]), 1).is_err());
        Ok(())
    }

    #[test]
    fn squeeze_and_expand_dims() -> Result<()> {
        let t = f32s(&[1.0, 2.0], (1, 2, 1))?;
        assert_eq!(squeeze(&t, None)?.dims(), &[2]);
        assert_eq!(squeeze(&t, Some(&[0]))?.dims(), &[2, 1]);
        assert!(squeeze(&t, Some(&[1])).is_err());

        let e = expand_dims(&squeeze(&t, None)?, &[0, 2])?;
        assert_eq!(e.dims(), &[1, 2, 1]);
        Ok(())
    }
}
