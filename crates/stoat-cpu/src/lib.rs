//! # stoat-cpu
//!
//! CPU backend for Stoat. Storage is a dtype-tagged enum over plain Vecs;
//! element-wise kernels run through f64 with rayon parallelism, while the
//! data-movement kernels (index_read, index_write, cat, cond_take) operate
//! on the native element type so integer data survives untouched.

use half::{bf16, f16};
use rand::Rng;
use rayon::prelude::*;

use stoat_core::backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp,
};
use stoat_core::{DType, Error, Layout, Result, Shape};

/// The single CPU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// CPU storage: one Vec per supported dtype. Bool is stored as u8 (0/1).
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::Bool(_) => DType::Bool,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::Bool(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

// Dispatch a block over the native element vector of a storage, producing
// a new storage of the same variant. `$vec` binds the input Vec.
macro_rules! map_native {
    ($storage:expr, $vec:ident => $body:expr) => {
        match $storage {
            CpuStorage::F16($vec) => CpuStorage::F16($body),
            CpuStorage::BF16($vec) => CpuStorage::BF16($body),
            CpuStorage::F32($vec) => CpuStorage::F32($body),
            CpuStorage::F64($vec) => CpuStorage::F64($body),
            CpuStorage::Bool($vec) => CpuStorage::Bool($body),
            CpuStorage::I32($vec) => CpuStorage::I32($body),
            CpuStorage::I64($vec) => CpuStorage::I64($body),
        }
    };
}

impl CpuStorage {
    fn from_f64(data: &[f64], dtype: DType) -> CpuStorage {
        match dtype {
            DType::F16 => CpuStorage::F16(data.iter().map(|&v| f16::from_f64(v)).collect()),
            DType::BF16 => CpuStorage::BF16(data.iter().map(|&v| bf16::from_f64(v)).collect()),
            DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(data.to_vec()),
            DType::Bool => CpuStorage::Bool(data.iter().map(|&v| (v != 0.0) as u8).collect()),
            DType::I32 => CpuStorage::I32(data.iter().map(|&v| v as i32).collect()),
            DType::I64 => CpuStorage::I64(data.iter().map(|&v| v as i64).collect()),
        }
    }

    fn get_f64(&self, idx: usize) -> f64 {
        match self {
            CpuStorage::F16(v) => v[idx].to_f64(),
            CpuStorage::BF16(v) => v[idx].to_f64(),
            CpuStorage::F32(v) => v[idx] as f64,
            CpuStorage::F64(v) => v[idx],
            CpuStorage::Bool(v) => v[idx] as f64,
            CpuStorage::I32(v) => v[idx] as f64,
            CpuStorage::I64(v) => v[idx] as f64,
        }
    }

    /// Read through a layout into a dense f64 buffer in logical row-major
    /// order.
    fn read_f64(&self, layout: &Layout) -> Vec<f64> {
        layout.strided_indices().map(|i| self.get_f64(i)).collect()
    }
}

/// The CPU compute backend.
#[derive(Debug, Clone, Copy)]
pub struct CpuBackend;

/// Convenience alias for tensors on the CPU backend.
pub type CpuTensor = stoat_core::Tensor<CpuBackend>;

fn binary_f64(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    }
}

fn unary_f64(op: UnaryOp, v: f64) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Abs => v.abs(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Square => v * v,
    }
}

fn cmp_f64(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

/// Broadcast two layouts to their common shape for a zipped element walk.
fn broadcast_pair(lhs: &Layout, rhs: &Layout) -> Result<(Layout, Layout)> {
    let out_shape = Shape::broadcast_shape(lhs.shape(), rhs.shape())?;
    let lhs_b = lhs.broadcast_to(&out_shape)?;
    let rhs_b = rhs.broadcast_to(&out_shape)?;
    Ok((lhs_b, rhs_b))
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(CpuStorage::from_f64(&vec![val; n], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64(&data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let (lhs_b, rhs_b) = broadcast_pair(lhs_layout, rhs_layout)?;
        let a = lhs.read_f64(&lhs_b);
        let b = rhs.read_f64(&rhs_b);
        let out: Vec<f64> = a
            .par_iter()
            .zip(b.par_iter())
            .map(|(&x, &y)| binary_f64(op, x, y))
            .collect();
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = input.read_f64(layout);
        let out: Vec<f64> = data.par_iter().map(|&v| unary_f64(op, v)).collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let (lhs_b, rhs_b) = broadcast_pair(lhs_layout, rhs_layout)?;
        let a = lhs.read_f64(&lhs_b);
        let b = rhs.read_f64(&rhs_b);
        let out: Vec<u8> = a
            .par_iter()
            .zip(b.par_iter())
            .map(|(&x, &y)| cmp_f64(op, x, y) as u8)
            .collect();
        Ok(CpuStorage::Bool(out))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data = input.read_f64(layout);
        let out: Vec<f64> = data.par_iter().map(|&v| v * mul + add).collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let data = input.read_f64(layout);
        let in_dims = layout.dims();

        if dims.is_empty() {
            let v = match op {
                ReduceOp::Sum => data.iter().sum::<f64>(),
                ReduceOp::Mean => data.iter().sum::<f64>() / data.len().max(1) as f64,
                ReduceOp::Max => data.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ReduceOp::Min => data.iter().cloned().fold(f64::INFINITY, f64::min),
            };
            return Ok(CpuStorage::from_f64(&[v], input.dtype()));
        }

        // Map each input element to its flat position in the reduced shape.
        let in_strides = layout.shape().stride_contiguous();
        let out_dims: Vec<usize> = in_dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !dims.contains(i))
            .map(|(_, &d)| d)
            .collect();
        let out_strides = Shape::new(out_dims.clone()).stride_contiguous();
        let out_len: usize = out_dims.iter().product::<usize>().max(1);
        let reduced_count: usize = dims.iter().map(|&d| in_dims[d]).product();

        let init = match op {
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        };
        let mut out = vec![init; out_len];

        for (flat_idx, &v) in data.iter().enumerate() {
            let mut remainder = flat_idx;
            let mut out_flat = 0;
            let mut out_axis = 0;
            for (i, &stride) in in_strides.iter().enumerate() {
                let coord = if stride > 0 { remainder / stride } else { 0 };
                if stride > 0 {
                    remainder %= stride;
                }
                if !dims.contains(&i) {
                    out_flat += coord * out_strides[out_axis];
                    out_axis += 1;
                }
            }
            match op {
                ReduceOp::Sum | ReduceOp::Mean => out[out_flat] += v,
                ReduceOp::Max => {
                    if v > out[out_flat] {
                        out[out_flat] = v;
                    }
                }
                ReduceOp::Min => {
                    if v < out[out_flat] {
                        out[out_flat] = v;
                    }
                }
            }
        }

        if op == ReduceOp::Mean {
            let scale = 1.0 / reduced_count.max(1) as f64;
            for v in out.iter_mut() {
                *v *= scale;
            }
        }

        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn cumsum(input: &CpuStorage, layout: &Layout, axis: usize) -> Result<CpuStorage> {
        let mut data = input.read_f64(layout);
        let dims = layout.dims();
        let inner: usize = dims[axis + 1..].iter().product();
        let outer: usize = dims[..axis].iter().product();
        let axis_size = dims[axis];
        for o in 0..outer {
            for i in 0..inner {
                for d in 1..axis_size {
                    let idx = (o * axis_size + d) * inner + i;
                    let prev = (o * axis_size + d - 1) * inner + i;
                    data[idx] += data[prev];
                }
            }
        }
        Ok(CpuStorage::from_f64(&data, input.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        if layout.is_contiguous() {
            return Ok(input.clone());
        }
        let indices: Vec<usize> = layout.strided_indices().collect();
        Ok(map_native!(input, v => indices.iter().map(|&i| v[i]).collect()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(input.read_f64(layout))
    }

    fn index_read(input: &CpuStorage, positions: &[usize]) -> Result<CpuStorage> {
        Ok(map_native!(input, v => positions.iter().map(|&p| v[p]).collect()))
    }

    fn index_write(
        dest: &mut CpuStorage,
        positions: &[usize],
        source: &CpuStorage,
        source_layout: &Layout,
    ) -> Result<()> {
        let src_indices: Vec<usize> = source_layout.strided_indices().collect();
        // Sequential writes: duplicate positions resolve last-write-wins.
        macro_rules! write_native {
            ($($variant:ident),+) => {
                match (dest, source) {
                    $(
                        (CpuStorage::$variant(d), CpuStorage::$variant(s)) => {
                            for (&p, &si) in positions.iter().zip(src_indices.iter()) {
                                d[p] = s[si];
                            }
                        }
                    )+
                    _ => {
                        return Err(Error::msg(
                            "index_write: destination and source dtype differ",
                        ))
                    }
                }
            };
        }
        write_native!(F16, BF16, F32, F64, Bool, I32, I64);
        Ok(())
    }

    fn cond_take(
        input: &CpuStorage,
        input_layout: &Layout,
        mask: &CpuStorage,
        mask_layout: &Layout,
    ) -> Result<(CpuStorage, CpuStorage)> {
        let mask_vals = mask.read_f64(mask_layout);
        let keep: Vec<usize> = mask_vals
            .iter()
            .enumerate()
            .filter(|(_, &m)| m != 0.0)
            .map(|(i, _)| i)
            .collect();
        let in_indices: Vec<usize> = input_layout.strided_indices().collect();
        let values = map_native!(input, v => keep.iter().map(|&i| v[in_indices[i]]).collect());
        let indices = CpuStorage::I32(keep.iter().map(|&i| i as i32).collect());
        Ok((values, indices))
    }

    fn fused_select(
        mask: &CpuStorage,
        mask_layout: &Layout,
        x: &CpuStorage,
        x_layout: &Layout,
        y: &CpuStorage,
        y_layout: &Layout,
    ) -> Result<CpuStorage> {
        let mask_vals = mask.read_f64(mask_layout);
        let x_indices: Vec<usize> = x_layout.strided_indices().collect();
        let y_indices: Vec<usize> = y_layout.strided_indices().collect();
        macro_rules! select_native {
            ($($variant:ident),+) => {
                match (x, y) {
                    $(
                        (CpuStorage::$variant(xv), CpuStorage::$variant(yv)) => {
                            CpuStorage::$variant(
                                mask_vals
                                    .iter()
                                    .enumerate()
                                    .map(|(i, &m)| {
                                        if m != 0.0 {
                                            xv[x_indices[i]]
                                        } else {
                                            yv[y_indices[i]]
                                        }
                                    })
                                    .collect(),
                            )
                        }
                    )+
                    _ => return Err(Error::msg("fused_select: branch dtypes differ")),
                }
            };
        }
        Ok(select_native!(F16, BF16, F32, F64, Bool, I32, I64))
    }

    fn cat(
        inputs: &[(&CpuStorage, &Layout)],
        out_shape: &Shape,
        axis: usize,
    ) -> Result<CpuStorage> {
        let out_dims = out_shape.dims();
        let inner: usize = out_dims[axis + 1..].iter().product();
        let outer: usize = out_dims[..axis].iter().product();

        // Row-major block copy: for each outer slice, append every input's
        // chunk (axis_size * inner elements) in turn.
        macro_rules! cat_native {
            ($($variant:ident),+) => {
                match inputs[0].0 {
                    $(
                        CpuStorage::$variant(_) => {
                            let mut out = Vec::with_capacity(out_shape.elem_count());
                            let native: Vec<(Vec<usize>, usize)> = inputs
                                .iter()
                                .map(|(_, l)| {
                                    (l.strided_indices().collect(), l.dims()[axis] * inner)
                                })
                                .collect();
                            for o in 0..outer {
                                for (i, (s, _)) in inputs.iter().enumerate() {
                                    let (idx, chunk) = &native[i];
                                    match s {
                                        CpuStorage::$variant(v) => {
                                            for k in 0..*chunk {
                                                out.push(v[idx[o * chunk + k]]);
                                            }
                                        }
                                        _ => return Err(Error::msg("cat: mixed dtypes")),
                                    }
                                }
                            }
                            Ok(CpuStorage::$variant(out))
                        }
                    )+
                }
            };
        }
        cat_native!(F16, BF16, F32, F64, Bool, I32, I64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Tensor;

    type T = Tensor<CpuBackend>;

    #[test]
    fn test_binary_broadcast() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F32, &CpuDevice)?;
        let b = T::from_f64_slice(&[10.0, 20.0], (2, 1), DType::F32, &CpuDevice)?;
        let c = a.add(&b)?;
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_f64_vec()?, vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
        Ok(())
    }

    #[test]
    fn test_reduce_axis() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &CpuDevice)?;
        let s = a.sum(1, false)?;
        assert_eq!(s.to_f64_vec()?, vec![6.0, 15.0]);
        let m = a.mean(0, false)?;
        assert_eq!(m.to_f64_vec()?, vec![2.5, 3.5, 4.5]);
        Ok(())
    }

    #[test]
    fn test_cumsum() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &CpuDevice)?;
        let c = a.cumsum(0)?;
        assert_eq!(c.to_f64_vec()?, vec![1.0, 2.0, 4.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_index_read_preserves_int() -> Result<()> {
        let a = T::from_f64_slice(&[5.0, 6.0, 7.0, 8.0], 4, DType::I64, &CpuDevice)?;
        let r = a.index_read(vec![3, 0, 0])?;
        assert_eq!(r.dtype(), DType::I64);
        assert_eq!(r.to_f64_vec()?, vec![8.0, 5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_index_write_last_wins() -> Result<()> {
        let a = T::zeros(4, DType::F32, &CpuDevice)?;
        let src = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F32, &CpuDevice)?;
        a.index_write(&[1, 1, 3], &src)?;
        assert_eq!(a.to_f64_vec()?, vec![0.0, 2.0, 0.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_from_slice_typed() -> Result<()> {
        let a = T::from_slice(&[1i32, 2, 3, 4], (2, 2), &CpuDevice)?;
        assert_eq!(a.dtype(), DType::I32);
        assert_eq!(a.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
        let h = T::from_slice(&[f16::from_f64(0.5), f16::from_f64(1.5)], 2, &CpuDevice)?;
        assert_eq!(h.dtype(), DType::F16);
        assert_eq!(h.to_f64_vec()?, vec![0.5, 1.5]);
        Ok(())
    }

    #[test]
    fn test_rand_uniform_range() -> Result<()> {
        let r = T::rand((4, 8), DType::F64, &CpuDevice)?;
        assert_eq!(r.dims(), &[4, 8]);
        assert_eq!(r.dtype(), DType::F64);
        for v in r.to_f64_vec()? {
            assert!((0.0..1.0).contains(&v));
        }
        Ok(())
    }

    #[test]
    fn test_index_write_source_aliases_dest() -> Result<()> {
        // Source sharing the destination's storage must not deadlock; the
        // writes see a snapshot of the pre-write values.
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], 4, DType::F32, &CpuDevice)?;
        a.index_write(&[3, 2, 1, 0], &a)?;
        assert_eq!(a.to_f64_vec()?, vec![4.0, 3.0, 2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_cond_take() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
        let mask = T::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2), DType::Bool, &CpuDevice)?;
        let (vals, idx) = a.cond_take(&mask)?;
        assert_eq!(vals.to_f64_vec()?, vec![1.0, 4.0]);
        assert_eq!(idx.to_f64_vec()?, vec![0.0, 3.0]);
        assert_eq!(idx.dtype(), DType::I32);
        Ok(())
    }

    #[test]
    fn test_cat_axis1() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
        let b = T::from_f64_slice(&[5.0, 6.0], (2, 1), DType::F32, &CpuDevice)?;
        let c = T::cat(&[a, b], 1)?;
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_f64_vec()?, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_fused_select_native() -> Result<()> {
        let mask = T::from_f64_slice(&[1.0, 0.0, 1.0], 3, DType::Bool, &CpuDevice)?;
        let x = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::I32, &CpuDevice)?;
        let y = T::from_f64_slice(&[-1.0, -2.0, -3.0], 3, DType::I32, &CpuDevice)?;
        let r = T::fused_select(&mask, &x, &y)?;
        assert_eq!(r.dtype(), DType::I32);
        assert_eq!(r.to_f64_vec()?, vec![1.0, -2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_backward_sum_mul() -> Result<()> {
        let a = T::from_f64_slice(&[2.0, 3.0], 2, DType::F64, &CpuDevice)?.set_variable();
        let b = T::from_f64_slice(&[4.0, 5.0], 2, DType::F64, &CpuDevice)?.set_variable();
        let loss = a.mul(&b)?.sum_all()?;
        let grads = loss.backward()?;
        assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![4.0, 5.0]);
        assert_eq!(grads.get(&b).unwrap().to_f64_vec()?, vec![2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_backward_broadcast_reduces() -> Result<()> {
        // a [1] broadcast against x [3]: grad_a sums the contributions
        let a = T::from_f64_slice(&[2.0], 1, DType::F64, &CpuDevice)?.set_variable();
        let x = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, &CpuDevice)?;
        let loss = x.mul(&a)?.sum_all()?;
        let grads = loss.backward()?;
        assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![6.0]);
        Ok(())
    }

    #[test]
    fn test_backward_index_read_scatter_adds() -> Result<()> {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, &CpuDevice)?.set_variable();
        // Position 0 read twice: its gradient accumulates
        let r = a.index_read(vec![0, 0, 2])?;
        let loss = r.sum_all()?;
        let grads = loss.backward()?;
        assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![2.0, 0.0, 1.0]);
        Ok(())
    }
}
