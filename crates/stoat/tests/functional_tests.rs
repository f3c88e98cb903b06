// Integration tests for the functional surface
//
// Exercise gather/scatter, repeat/tile/roll, where, cond_take, and the
// creation/shape wrappers end to end on the CPU backend, including the
// precondition errors each operation reports.

use stoat::functional::{self, ScalarOrTensor, SplitSpec};
use stoat::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn f32_tensor(data: &[f64], shape: impl Into<Shape>) -> stoat::Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape, DType::F32, &CpuDevice)
}

fn i32_tensor(data: &[f64], shape: impl Into<Shape>) -> stoat::Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape, DType::I32, &CpuDevice)
}

fn bool_tensor(data: &[f64], shape: impl Into<Shape>) -> stoat::Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape, DType::Bool, &CpuDevice)
}

// Reshape

#[test]
fn test_reshape_round_trips_element_order() -> stoat::Result<()> {
    let data = [
        1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0,
    ];
    let t = f32_tensor(&data, (3, 4))?;
    let r = functional::reshape(&t, &[2, 6])?;
    assert_eq!(r.dims(), &[2, 6]);
    let back = functional::reshape(&r, &[3, 4])?;
    assert_vec_approx(&back.to_f64_vec()?, &data, 0.0);
    Ok(())
}

// Gather

#[test]
fn test_gather_example() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2))?;
    let index = i32_tensor(&[0.0, 2.0, 1.0, 0.0], (2, 2))?;
    let out = functional::gather(&inp, 0, &index)?;
    assert_eq!(out.dims(), &[2, 2]);
    assert_vec_approx(&out.to_f64_vec()?, &[1.0, 6.0, 3.0, 2.0], 0.0);
    Ok(())
}

#[test]
fn test_gather_axis_1() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let index = i32_tensor(&[2.0, 0.0, 1.0, 1.0, 2.0, 0.0], (2, 3))?;
    let out = functional::gather(&inp, 1, &index)?;
    assert_vec_approx(&out.to_f64_vec()?, &[3.0, 1.0, 2.0, 5.0, 6.0, 4.0], 0.0);
    Ok(())
}

#[test]
fn test_gather_rejects_axis_out_of_range() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let index = i32_tensor(&[0.0, 1.0, 1.0, 0.0], (2, 2))?;
    assert!(functional::gather(&inp, 2, &index).is_err());
    Ok(())
}

#[test]
fn test_gather_rejects_rank_and_dim_mismatch() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let flat_index = i32_tensor(&[0.0, 1.0], 2)?;
    assert!(functional::gather(&inp, 0, &flat_index).is_err());

    // Off-axis dimension 1 disagrees (2 vs 3).
    let wide_index = i32_tensor(&[0.0, 1.0, 0.0, 1.0, 0.0, 1.0], (2, 3))?;
    assert!(functional::gather(&inp, 0, &wide_index).is_err());
    Ok(())
}

#[test]
fn test_gather_rejects_out_of_range_index_values() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let index = i32_tensor(&[0.0, 5.0, 1.0, 0.0], (2, 2))?;
    assert!(functional::gather(&inp, 0, &index).is_err());
    Ok(())
}

#[test]
fn test_gather_backward_scatter_adds() -> stoat::Result<()> {
    // Row 0 is read twice, row 2 once, row 1 never.
    let inp = f32_tensor(&[1.0, 2.0, 3.0], (3, 1))?.set_variable();
    let index = i32_tensor(&[0.0, 2.0, 0.0], (3, 1))?;
    let out = functional::gather(&inp, 0, &index)?;
    let loss = out.sum_all()?;
    let grads = loss.backward()?;
    let g = grads.get(&inp).expect("input gradient");
    assert_vec_approx(&g.to_f64_vec()?, &[2.0, 0.0, 1.0], 0.0);
    Ok(())
}

// Scatter

#[test]
fn test_scatter_example() -> stoat::Result<()> {
    let inp = CpuTensor::zeros((3, 5), DType::F32, &CpuDevice)?;
    let index = i32_tensor(&[0.0, 2.0, 0.0, 2.0, 1.0, 2.0, 0.0, 1.0, 1.0, 2.0], (2, 5))?;
    let source = f32_tensor(
        &[0.99, 0.95, 0.23, 0.89, 0.44, 0.77, 0.07, 0.59, 0.36, 0.46],
        (2, 5),
    )?;
    let out = functional::scatter(&inp, 0, &index, &source)?;
    // The input is mutated in place; the returned handle aliases it.
    assert_eq!(out.id(), inp.id());
    let expected = [
        0.99, 0.07, 0.23, 0.0, 0.0, //
        0.0, 0.0, 0.59, 0.36, 0.44, //
        0.77, 0.95, 0.0, 0.89, 0.46,
    ];
    assert_vec_approx(&inp.to_f64_vec()?, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_gather_then_scatter_round_trips() -> stoat::Result<()> {
    let inp = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2))?;
    let index = i32_tensor(&[2.0, 0.0, 0.0, 1.0, 1.0, 2.0], (3, 2))?;
    let gathered = functional::gather(&inp, 0, &index)?;
    let dest = CpuTensor::zeros((3, 2), DType::F32, &CpuDevice)?;
    functional::scatter(&dest, 0, &index, &gathered)?;
    // Per column the index values cover every row, so each element of
    // the original lands back at its own coordinates.
    assert_vec_approx(&dest.to_f64_vec()?, &inp.to_f64_vec()?, 0.0);
    Ok(())
}

#[test]
fn test_scatter_rejects_bad_shapes() -> stoat::Result<()> {
    let inp = CpuTensor::zeros((3, 5), DType::F32, &CpuDevice)?;
    let index = i32_tensor(&[0.0, 1.0], (1, 2))?;
    let source = f32_tensor(&[1.0, 2.0, 3.0], (1, 3))?;
    // index and source shapes disagree.
    assert!(functional::scatter(&inp, 0, &index, &source).is_err());

    // Source wider than the destination.
    let wide = f32_tensor(&[0.0; 6], (1, 6))?;
    let wide_index = i32_tensor(&[0.0; 6], (1, 6))?;
    assert!(functional::scatter(&inp, 0, &wide_index, &wide).is_err());

    // Axis out of range.
    let ok_index = i32_tensor(&[0.0, 1.0], (1, 2))?;
    let ok_source = f32_tensor(&[1.0, 2.0], (1, 2))?;
    assert!(functional::scatter(&inp, 2, &ok_index, &ok_source).is_err());
    Ok(())
}

#[test]
fn test_scatter_source_may_alias_input() -> stoat::Result<()> {
    // Writing a tensor into itself must complete, reading the pre-write
    // values as the source.
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let index = i32_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2))?;
    functional::scatter(&t, 0, &index, &t)?;
    assert_vec_approx(&t.to_f64_vec()?, &[3.0, 2.0, 1.0, 4.0], 0.0);
    Ok(())
}

#[test]
fn test_scatter_mutation_visible_through_aliases() -> stoat::Result<()> {
    let inp = CpuTensor::zeros((2, 2), DType::F32, &CpuDevice)?;
    let alias = inp.clone();
    let index = i32_tensor(&[1.0, 0.0], (1, 2))?;
    let source = f32_tensor(&[5.0, 7.0], (1, 2))?;
    functional::scatter(&inp, 0, &index, &source)?;
    assert_vec_approx(&alias.to_f64_vec()?, &[0.0, 7.0, 5.0, 0.0], 0.0);
    Ok(())
}

// Repeat / tile / roll

#[test]
fn test_repeat_example() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let r = functional::repeat(&t, 2, Some(0))?;
    assert_eq!(r.dims(), &[4, 2]);
    assert_vec_approx(
        &r.to_f64_vec()?,
        &[1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_repeat_along_axis_1_interleaves() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let r = functional::repeat(&t, 3, Some(1))?;
    assert_eq!(r.dims(), &[2, 6]);
    assert_vec_approx(
        &r.to_f64_vec()?,
        &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_repeat_flattened() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let r = functional::repeat(&t, 2, None)?;
    assert_eq!(r.dims(), &[8]);
    assert_vec_approx(
        &r.to_f64_vec()?,
        &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_tile_shape_law() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    // Left-pad the shape to (1, 2, 3); result is the elementwise product.
    let r = functional::tile(&t, &[2, 1, 3])?;
    assert_eq!(r.dims(), &[2, 2, 9]);
    Ok(())
}

#[test]
fn test_tile_block_repeats() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0], 2)?;
    let r = functional::tile(&t, &[3])?;
    assert_vec_approx(&r.to_f64_vec()?, &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0], 0.0);

    let m = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let rm = functional::tile(&m, &[1, 2])?;
    assert_eq!(rm.dims(), &[2, 4]);
    assert_vec_approx(
        &rm.to_f64_vec()?,
        &[1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_tile_rejects_too_few_reps() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    assert!(functional::tile(&t, &[2]).is_err());
    Ok(())
}

#[test]
fn test_roll_basic() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0], 5)?;
    let r = functional::roll(&t, &[2], Some(&[0]))?;
    assert_vec_approx(&r.to_f64_vec()?, &[4.0, 5.0, 1.0, 2.0, 3.0], 0.0);

    let neg = functional::roll(&t, &[-1], Some(&[0]))?;
    assert_vec_approx(&neg.to_f64_vec()?, &[2.0, 3.0, 4.0, 5.0, 1.0], 0.0);
    Ok(())
}

#[test]
fn test_roll_then_unroll_is_identity() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    for k in 0..5i64 {
        let there = functional::roll(&t, &[k], Some(&[1]))?;
        let back = functional::roll(&there, &[-k], Some(&[1]))?;
        assert_vec_approx(&back.to_f64_vec()?, &t.to_f64_vec()?, 0.0);
    }
    Ok(())
}

#[test]
fn test_roll_flattened_restores_shape() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let r = functional::roll(&t, &[1], None)?;
    assert_eq!(r.dims(), &[2, 2]);
    assert_vec_approx(&r.to_f64_vec()?, &[4.0, 1.0, 2.0, 3.0], 0.0);
    Ok(())
}

#[test]
fn test_roll_repeated_axis_compounds() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0], 5)?;
    let r = functional::roll(&t, &[1, 1], Some(&[0, 0]))?;
    let direct = functional::roll(&t, &[2], Some(&[0]))?;
    assert_vec_approx(&r.to_f64_vec()?, &direct.to_f64_vec()?, 0.0);
    Ok(())
}

// Where / cond_take / cumsum

#[test]
fn test_where_selects_by_mask() -> stoat::Result<()> {
    let mask = bool_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2))?;
    let x = f32_tensor(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let y = f32_tensor(&[9.0, 8.0, 7.0, 6.0], (2, 2))?;
    let out = functional::where_(&mask, &x, &y)?;
    assert_vec_approx(&out.to_f64_vec()?, &[1.0, 8.0, 7.0, 4.0], 0.0);
    Ok(())
}

#[test]
fn test_where_broadcasts_and_promotes() -> stoat::Result<()> {
    let mask = bool_tensor(&[1.0, 0.0], (2, 1))?;
    let x = i32_tensor(&[5.0], 1)?;
    let y = f32_tensor(&[1.0, 2.0, 3.0], 3)?;
    let out = functional::where_(&mask, &x, &y)?;
    assert_eq!(out.dims(), &[2, 3]);
    assert_eq!(out.dtype(), DType::F32);
    assert_vec_approx(
        &out.to_f64_vec()?,
        &[5.0, 5.0, 5.0, 1.0, 2.0, 3.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_where_rejects_non_bool_mask() -> stoat::Result<()> {
    let mask = f32_tensor(&[1.0, 0.0], 2)?;
    let x = f32_tensor(&[1.0, 2.0], 2)?;
    let y = f32_tensor(&[3.0, 4.0], 2)?;
    assert!(functional::where_(&mask, &x, &y).is_err());
    Ok(())
}

#[test]
fn test_where_gradient_routes_through_mask() -> stoat::Result<()> {
    let mask = bool_tensor(&[1.0, 0.0, 1.0], 3)?;
    let x = f32_tensor(&[1.0, 2.0, 3.0], 3)?.set_variable();
    let y = f32_tensor(&[4.0, 5.0, 6.0], 3)?.set_variable();
    let out = functional::where_(&mask, &x, &y)?;
    let grads = out.sum_all()?.backward()?;
    assert_vec_approx(
        &grads.get(&x).expect("x gradient").to_f64_vec()?,
        &[1.0, 0.0, 1.0],
        0.0,
    );
    assert_vec_approx(
        &grads.get(&y).expect("y gradient").to_f64_vec()?,
        &[0.0, 1.0, 0.0],
        0.0,
    );
    Ok(())
}

#[test]
fn test_cond_take_returns_values_and_indices() -> stoat::Result<()> {
    let x = f32_tensor(&[10.0, 20.0, 30.0, 40.0], (2, 2))?;
    let mask = bool_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2))?;
    let (values, indices) = functional::cond_take(&mask, &x)?;
    assert_vec_approx(&values.to_f64_vec()?, &[10.0, 40.0], 0.0);
    assert_eq!(indices.dtype(), DType::I32);
    assert_vec_approx(&indices.to_f64_vec()?, &[0.0, 3.0], 0.0);
    Ok(())
}

#[test]
fn test_cumsum_along_axis() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let along_rows = functional::cumsum(&t, 1)?;
    assert_vec_approx(
        &along_rows.to_f64_vec()?,
        &[1.0, 3.0, 6.0, 4.0, 9.0, 15.0],
        0.0,
    );
    let along_cols = functional::cumsum(&t, 0)?;
    assert_vec_approx(
        &along_cols.to_f64_vec()?,
        &[1.0, 2.0, 3.0, 5.0, 7.0, 9.0],
        0.0,
    );
    assert!(functional::cumsum(&t, 2).is_err());
    Ok(())
}

// Creation and shape wrappers

#[test]
fn test_creation_wrappers() -> stoat::Result<()> {
    let dev = CpuDevice;
    let f: CpuTensor = functional::full((2, 2), ScalarOrTensor::Scalar(3.5), DType::F32, &dev)?;
    assert_vec_approx(&f.to_f64_vec()?, &[3.5, 3.5, 3.5, 3.5], 0.0);

    let e = functional::eye::<CpuBackend>(2, 3, DType::F32, &dev)?;
    assert_vec_approx(&e.to_f64_vec()?, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 0.0);

    let l = functional::linspace::<CpuBackend>(
        ScalarOrTensor::Scalar(0.0),
        ScalarOrTensor::Scalar(1.0),
        5,
        DType::F32,
        &dev,
    )?;
    assert_vec_approx(&l.to_f64_vec()?, &[0.0, 0.25, 0.5, 0.75, 1.0], 1e-6);

    let start = CpuTensor::from_f64_slice(&[2.0], (), DType::F32, &dev)?;
    let a = functional::arange::<CpuBackend>(
        start.into(),
        ScalarOrTensor::Scalar(5.0),
        1.0,
        DType::I32,
        &dev,
    )?;
    assert_vec_approx(&a.to_f64_vec()?, &[2.0, 3.0, 4.0], 0.0);
    Ok(())
}

#[test]
fn test_concat_stack_split() -> stoat::Result<()> {
    let a = f32_tensor(&[1.0, 2.0], (1, 2))?;
    let b = f32_tensor(&[3.0, 4.0], (1, 2))?;
    let c = functional::concat(&[a.clone(), b.clone()], 0)?;
    assert_eq!(c.dims(), &[2, 2]);

    let s = functional::stack(&[a, b], 0)?;
    assert_eq!(s.dims(), &[2, 1, 2]);

    let parts = functional::split(&c, SplitSpec::Count(2), 0)?;
    assert_eq!(parts.len(), 2);
    assert_vec_approx(&parts[0].to_f64_vec()?, &[1.0, 2.0], 0.0);
    Ok(())
}

#[test]
fn test_copy_is_independent() -> stoat::Result<()> {
    let t = f32_tensor(&[1.0, 2.0], 2)?;
    let c = functional::copy(&t, None)?;
    t.update_data_inplace(&[9.0, 9.0])?;
    assert_vec_approx(&c.to_f64_vec()?, &[1.0, 2.0], 0.0);

    // Naming the tensor's own device is accepted.
    let d = functional::copy(&t, Some(&CpuDevice))?;
    assert_vec_approx(&d.to_f64_vec()?, &[9.0, 9.0], 0.0);
    Ok(())
}
