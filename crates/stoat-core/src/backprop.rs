// Backpropagation — reverse-mode automatic differentiation.
//
// The forward pass builds a DAG of Ops; backward() topologically sorts it
// from the scalar root to the leaves and walks it in reverse, applying the
// chain rule per Op and accumulating per-tensor gradients. A tensor used
// in several operations receives the sum of all contributions.
//
// Broadcasting has a mirror rule in backward: whenever the forward op
// expanded a shape, the gradient must be summed back down over the
// expanded dimensions (reduce_broadcast_grad).

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::Result;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Gradients for all tensors reached by a backward() call.
///
/// Use `grads.get(&tensor)` to look up the gradient of a tensor.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of a tensor, if one was computed.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    /// Accumulate a gradient, adding to any existing one for this id.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let new_grad = existing.add(&grad)?;
            self.grads.insert(id, new_grad);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }
}

/// Topological ordering of the graph rooted at `root`: every tensor
/// appears after all of its inputs (leaves first, root last).
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if visited.contains(&t.id()) {
            return;
        }
        visited.insert(t.id());
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    visit(root, &mut visited, &mut order);
    order
}

/// Compute gradients of `root` with respect to every tensor in its graph.
/// `root` must be a scalar; reduce with sum_all()/mean_all() first.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(crate::Error::msg(
            "backward() requires a scalar tensor. \
             Reduce with .sum_all() or .mean_all() first.",
        ));
    }

    let topo = build_topo(root);

    // dL/dL = 1
    let mut grads = GradStore::new();
    let ones = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    grads.grads.insert(root.id(), ones);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, input, &mut grads)?;
            }

            Op::Reduce {
                input, op, dims, ..
            } => {
                compute_reduce_grad(*op, &grad_output, input, dims, &mut grads)?;
            }

            Op::Reshape { input, src_shape } => {
                let grad = grad_output.reshape(src_shape.clone())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Transpose { input, axis0, axis1 } => {
                // Transpose is its own inverse
                let grad = grad_output.transpose(*axis0, *axis1)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Permute { input, axes } => {
                let mut inverse = vec![0usize; axes.len()];
                for (i, &a) in axes.iter().enumerate() {
                    inverse[a] = i;
                }
                let grad = grad_output.permute(&inverse)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Narrow {
                input,
                axis,
                start,
                ..
            } => {
                compute_narrow_grad(&grad_output, input, *axis, *start, &mut grads)?;
            }

            Op::BroadcastTo { input, src_shape } => {
                // Sum the gradient back down over the broadcast dims
                let grad = reduce_broadcast_grad(&grad_output, src_shape)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Affine { input, mul, .. } => {
                let grad = grad_output.affine(*mul, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Cat {
                inputs,
                axis,
                sizes,
            } => {
                // Slice the gradient back into per-input pieces
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    let grad_slice = grad_output.narrow(*axis, offset, sz)?;
                    grads.accumulate(inp.id(), grad_slice)?;
                    offset += sz;
                }
            }

            Op::ToDtype { input, src_dtype } => {
                let grad_in = grad_output.to_dtype(*src_dtype)?;
                grads.accumulate(input.id(), grad_in)?;
            }

            Op::IndexRead { input, positions } => {
                // Scatter-add the gradient back to the read positions.
                // Duplicate positions accumulate, which is exactly the
                // adjoint of reading the same element twice.
                let grad_data = grad_output.to_f64_vec()?;
                let mut grad_input_data = vec![0.0f64; input.elem_count()];
                for (i, &p) in positions.iter().enumerate() {
                    grad_input_data[p] += grad_data[i];
                }
                let grad_input = Tensor::<B>::from_f64_slice(
                    &grad_input_data,
                    input.shape().clone(),
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad_input)?;
            }

            Op::FusedSelect { mask, x, y } => {
                // Gradient goes to x where the mask is set, to y elsewhere.
                // The mask itself gets no gradient.
                let mask_data = mask.to_f64_vec()?;
                let grad_data = grad_output.to_f64_vec()?;
                let n = mask_data.len();
                let grad_x_data: Vec<f64> = (0..n)
                    .map(|i| if mask_data[i] != 0.0 { grad_data[i] } else { 0.0 })
                    .collect();
                let grad_y_data: Vec<f64> = (0..n)
                    .map(|i| if mask_data[i] == 0.0 { grad_data[i] } else { 0.0 })
                    .collect();
                let grad_x = Tensor::<B>::from_f64_slice(
                    &grad_x_data,
                    x.shape().clone(),
                    x.dtype(),
                    x.device(),
                )?;
                let grad_y = Tensor::<B>::from_f64_slice(
                    &grad_y_data,
                    y.shape().clone(),
                    y.dtype(),
                    y.device(),
                )?;
                grads.accumulate(x.id(), grad_x)?;
                grads.accumulate(y.id(), grad_y)?;
            }

            Op::Cumsum { input, axis } => {
                // Adjoint of the inclusive prefix sum is the inclusive
                // suffix sum along the same axis.
                let grad_data = grad_output.to_f64_vec()?;
                let dims = input.dims();
                let axis = *axis;
                let inner: usize = dims[axis + 1..].iter().product();
                let outer: usize = dims[..axis].iter().product();
                let axis_size = dims[axis];
                let mut out = grad_data;
                for o in 0..outer {
                    for i in 0..inner {
                        for d in (0..axis_size.saturating_sub(1)).rev() {
                            let idx = (o * axis_size + d) * inner + i;
                            let next = (o * axis_size + d + 1) * inner + i;
                            out[idx] += out[next];
                        }
                    }
                }
                let grad = Tensor::<B>::from_f64_slice(
                    &out,
                    input.shape().clone(),
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            }
        }
    }

    Ok(grads)
}

// Binary gradient rules

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            // d(a + b)/da = 1, d(a + b)/db = 1
            let grad_lhs = reduce_broadcast_grad(grad_output, lhs.shape())?;
            let grad_rhs = reduce_broadcast_grad(grad_output, rhs.shape())?;
            grads.accumulate(lhs.id(), grad_lhs)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
        BinaryOp::Sub => {
            // d(a - b)/da = 1, d(a - b)/db = -1
            let grad_lhs = reduce_broadcast_grad(grad_output, lhs.shape())?;
            let neg = grad_output.neg()?;
            let grad_rhs = reduce_broadcast_grad(&neg, rhs.shape())?;
            grads.accumulate(lhs.id(), grad_lhs)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
        BinaryOp::Mul => {
            // d(a * b)/da = b, d(a * b)/db = a
            let raw_lhs = grad_output.mul(rhs)?;
            let raw_rhs = grad_output.mul(lhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
        BinaryOp::Div => {
            // d(a / b)/da = 1/b, d(a / b)/db = -a / b^2
            let raw_lhs = grad_output.div(rhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            let neg_grad = grad_output.neg()?;
            let b_sq = rhs.mul(rhs)?;
            let raw_rhs = neg_grad.mul(lhs)?.div(&b_sq)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
    }
    Ok(())
}

/// Sum a gradient over broadcast dimensions so it matches `target_shape`.
///
/// If lhs was [1, 4] broadcast to [3, 4], grad_output is [3, 4] but
/// grad_lhs must be [1, 4]: sum over dim 0. If lhs was [4], additionally
/// drop the leading dim via reshape.
fn reduce_broadcast_grad<B: Backend>(
    grad: &Tensor<B>,
    target_shape: &Shape,
) -> Result<Tensor<B>> {
    let grad_dims = grad.dims();
    let target_dims = target_shape.dims();

    if grad_dims == target_dims {
        return Ok(grad.clone());
    }

    // Pad target dims with leading 1s to match grad rank
    let grad_rank = grad_dims.len();
    let target_rank = target_dims.len();
    let mut padded_target = vec![1usize; grad_rank];
    let offset = grad_rank - target_rank;
    padded_target[offset..offset + target_rank].copy_from_slice(target_dims);

    let mut dims_to_sum: Vec<usize> = Vec::new();
    for d in 0..grad_rank {
        if padded_target[d] == 1 && grad_dims[d] > 1 {
            dims_to_sum.push(d);
        }
    }

    // Sum highest-index-first so dim indices stay stable
    let mut result = grad.clone();
    for &d in dims_to_sum.iter().rev() {
        result = result.sum(d, true)?;
    }

    result.reshape(target_shape.clone())
}

// Unary gradient rules

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_input = match op {
        // d(-x)/dx = -1
        UnaryOp::Neg => grad_output.neg()?,

        // d|x|/dx = sign(x)
        UnaryOp::Abs => {
            let input_data = input.to_f64_vec()?;
            let sign_data: Vec<f64> = input_data
                .iter()
                .map(|&v| {
                    if v > 0.0 {
                        1.0
                    } else if v < 0.0 {
                        -1.0
                    } else {
                        0.0
                    }
                })
                .collect();
            let sign = Tensor::<B>::from_f64_slice(
                &sign_data,
                input.shape().clone(),
                input.dtype(),
                input.device(),
            )?;
            grad_output.mul(&sign)?
        }

        // d(e^x)/dx = e^x
        UnaryOp::Exp => {
            let exp_x = input.exp()?;
            grad_output.mul(&exp_x)?
        }

        // d(ln x)/dx = 1/x
        UnaryOp::Log => grad_output.div(input)?,

        // d(sqrt x)/dx = 1 / (2 sqrt x)
        UnaryOp::Sqrt => {
            let sqrt_x = input.sqrt()?;
            let two_sqrt = sqrt_x.affine(2.0, 0.0)?;
            grad_output.div(&two_sqrt)?
        }

        // d(x^2)/dx = 2x
        UnaryOp::Square => {
            let two_x = input.affine(2.0, 0.0)?;
            grad_output.mul(&two_x)?
        }
    };

    grads.accumulate(input.id(), grad_input)?;
    Ok(())
}

// Reduction gradient rules

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        ReduceOp::Sum => {
            if dims.is_empty() {
                // sum_all: fill the input shape with the scalar gradient
                let grad_val = grad_output.to_scalar_f64()?;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let grad = expand_grad_for_reduce(grad_output, input, dims)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
        ReduceOp::Mean => {
            if dims.is_empty() {
                let n = input.elem_count() as f64;
                let grad_val = grad_output.to_scalar_f64()? / n;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let n: f64 = dims.iter().map(|&d| input.dims()[d] as f64).product();
                let grad = expand_grad_for_reduce(grad_output, input, dims)?;
                let grad = grad.affine(1.0 / n, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
        ReduceOp::Max | ReduceOp::Min => {
            // Gradient flows only to elements that achieved the extremum,
            // split equally among ties.
            let input_data = input.to_f64_vec()?;
            let input_shape = input.shape().clone();
            let total = input_shape.elem_count();

            let grad_expanded = if dims.is_empty() {
                let grad_val = grad_output.to_scalar_f64()?;
                vec![grad_val; total]
            } else {
                expand_grad_for_reduce(grad_output, input, dims)?.to_f64_vec()?
            };

            // Flat index in the reduced shape for each input element
            let out_flat_of = |flat_idx: usize| -> usize {
                if dims.is_empty() {
                    return 0;
                }
                let input_strides = input_shape.stride_contiguous();
                let input_dims = input_shape.dims();
                let mut md = vec![0usize; input_dims.len()];
                let mut remainder = flat_idx;
                for i in 0..input_dims.len() {
                    if input_strides[i] > 0 {
                        md[i] = remainder / input_strides[i];
                        remainder %= input_strides[i];
                    }
                }
                let out_md: Vec<usize> = md
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dims.contains(i))
                    .map(|(_, &v)| v)
                    .collect();
                let out_dims: Vec<usize> = input_dims
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dims.contains(i))
                    .map(|(_, &d)| d)
                    .collect();
                let out_strides = Shape::new(out_dims).stride_contiguous();
                out_md
                    .iter()
                    .zip(out_strides.iter())
                    .map(|(&m, &s)| m * s)
                    .sum()
            };

            let reduced_total = if dims.is_empty() {
                1
            } else {
                input_shape
                    .dims()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dims.contains(i))
                    .map(|(_, &d)| d)
                    .product::<usize>()
                    .max(1)
            };

            let mut extrema = if op == ReduceOp::Max {
                vec![f64::NEG_INFINITY; reduced_total]
            } else {
                vec![f64::INFINITY; reduced_total]
            };
            for flat_idx in 0..total {
                let out_flat = out_flat_of(flat_idx);
                let val = input_data[flat_idx];
                if op == ReduceOp::Max {
                    if val > extrema[out_flat] {
                        extrema[out_flat] = val;
                    }
                } else if val < extrema[out_flat] {
                    extrema[out_flat] = val;
                }
            }

            let mut counts = vec![0.0f64; reduced_total];
            for flat_idx in 0..total {
                if input_data[flat_idx] == extrema[out_flat_of(flat_idx)] {
                    counts[out_flat_of(flat_idx)] += 1.0;
                }
            }

            let mut mask = vec![0.0f64; total];
            for flat_idx in 0..total {
                let out_flat = out_flat_of(flat_idx);
                if input_data[flat_idx] == extrema[out_flat] {
                    mask[flat_idx] = grad_expanded[flat_idx] / counts[out_flat];
                }
            }

            let grad =
                Tensor::<B>::from_f64_slice(&mask, input_shape, input.dtype(), input.device())?;
            grads.accumulate(input.id(), grad)?;
        }
    }
    Ok(())
}

/// Repeat a reduced gradient back along the reduced dimension(s).
///
/// input [2,3], sum(axis=1) gives output [2] with grad [g0, g1];
/// the expanded gradient is [[g0,g0,g0], [g1,g1,g1]].
fn expand_grad_for_reduce<B: Backend>(
    grad: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
) -> Result<Tensor<B>> {
    let input_dims = input.dims();
    let input_shape = input.shape().clone();
    let grad_data = grad.to_f64_vec()?;
    let total = input_shape.elem_count();
    let input_strides = input_shape.stride_contiguous();

    let grad_dims: Vec<usize> = input_dims
        .iter()
        .enumerate()
        .filter(|(i, _)| !dims.contains(i))
        .map(|(_, &d)| d)
        .collect();
    let grad_strides = Shape::new(grad_dims).stride_contiguous();

    let mut result_data = vec![0.0f64; total];

    for flat_idx in 0..total {
        let mut md = vec![0usize; input_dims.len()];
        let mut remainder = flat_idx;
        for i in 0..input_dims.len() {
            if input_strides[i] > 0 {
                md[i] = remainder / input_strides[i];
                remainder %= input_strides[i];
            }
        }

        let grad_md: Vec<usize> = md
            .iter()
            .enumerate()
            .filter(|(i, _)| !dims.contains(i))
            .map(|(_, &v)| v)
            .collect();

        let mut grad_flat = 0;
        for (i, &m) in grad_md.iter().enumerate() {
            if i < grad_strides.len() {
                grad_flat += m * grad_strides[i];
            }
        }

        if grad_flat < grad_data.len() {
            result_data[flat_idx] = grad_data[grad_flat];
        }
    }

    Tensor::<B>::from_f64_slice(&result_data, input_shape, input.dtype(), input.device())
}

// Narrow gradient

/// Place the slice gradient into a zero tensor at the original position.
///
/// input [4], narrow(axis=0, start=1, len=2): grad_output = [g1, g2]
/// gives grad_input = [0, g1, g2, 0].
fn compute_narrow_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    axis: usize,
    start: usize,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let input_shape = input.shape().clone();
    let grad_data = grad_output.to_f64_vec()?;
    let total = input_shape.elem_count();
    let input_strides = input_shape.stride_contiguous();

    let grad_out_dims = grad_output.dims();
    let grad_strides = Shape::new(grad_out_dims.to_vec()).stride_contiguous();
    let grad_total = grad_output.elem_count();

    let mut result_data = vec![0.0f64; total];

    for grad_flat in 0..grad_total {
        let mut md = vec![0usize; grad_out_dims.len()];
        let mut remainder = grad_flat;
        for i in 0..grad_out_dims.len() {
            if grad_strides[i] > 0 {
                md[i] = remainder / grad_strides[i];
                remainder %= grad_strides[i];
            }
        }

        md[axis] += start;

        let mut input_flat = 0;
        for (i, &m) in md.iter().enumerate() {
            input_flat += m * input_strides[i];
        }

        if input_flat < total {
            result_data[input_flat] = grad_data[grad_flat];
        }
    }

    let grad =
        Tensor::<B>::from_f64_slice(&result_data, input_shape, input.dtype(), input.device())?;
    grads.accumulate(input.id(), grad)?;
    Ok(())
}
