// Training-loop integration tests
//
// Two small end-to-end checks: a module with one scalar parameter is
// driven through forward, backward, and an SGD step, and the updated
// parameter value is verified exactly. The second test feeds the
// parameter through a column slice so the gradient has to survive a
// view and a broadcast.

use stoat::module::Module;
use stoat::optim::{Optimizer, SGD};
use stoat::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

/// One scalar parameter; forward multiplies the input by it.
struct Scale {
    a: CpuTensor,
}

impl Scale {
    fn new(init: f64) -> stoat::Result<Self> {
        let a = CpuTensor::from_f64_slice(&[init], 1, DType::F32, &CpuDevice)?.set_variable();
        Ok(Scale { a })
    }
}

impl Module<CpuBackend> for Scale {
    fn forward(&self, x: &CpuTensor) -> stoat::Result<CpuTensor> {
        x.mul(&self.a)
    }

    fn parameters(&self) -> Vec<CpuTensor> {
        vec![self.a.clone()]
    }
}

#[test]
fn test_single_step_on_scalar_parameter() -> stoat::Result<()> {
    let model = Scale::new(1.23)?;
    assert_eq!(model.num_parameters(), 1);
    let mut opt = SGD::new(model.parameters(), 1.0, 0.0, 0.0);

    let x = CpuTensor::from_f64_slice(&[2.34], 1, DType::F32, &CpuDevice)?;
    let loss = model.forward(&x)?.sum_all()?;
    let grads = loss.backward()?;
    opt.step(&grads)?;

    // d loss / d a = x, so one step at lr 1 moves a to 1.23 - 2.34.
    let a = model.a.to_scalar_f64()?;
    assert!(
        approx_eq(a, 1.23 - 2.34, 1e-5),
        "expected {} got {}",
        1.23 - 2.34,
        a
    );
    Ok(())
}

#[test]
fn test_single_step_through_column_slice() -> stoat::Result<()> {
    let model = Scale::new(1.0)?;
    let mut opt = SGD::new(model.parameters(), 1.0, 0.0, 0.0);

    let x = CpuTensor::ones((10, 10), DType::F32, &CpuDevice)?;
    // Only the first column participates in the loss.
    let column = x.narrow(1, 0, 1)?;
    let loss = model.forward(&column)?.sum_all()?;
    let grads = loss.backward()?;
    opt.step(&grads)?;

    // The column has ten ones, so the gradient of a is 10.
    let a = model.a.to_scalar_f64()?;
    assert!(approx_eq(a, 1.0 - 10.0, 1e-5), "expected -9 got {}", a);
    Ok(())
}

#[test]
fn test_update_visible_through_module_and_next_forward() -> stoat::Result<()> {
    let model = Scale::new(2.0)?;
    let mut opt = SGD::new(model.parameters(), 0.5, 0.0, 0.0);

    let x = CpuTensor::from_f64_slice(&[3.0], 1, DType::F32, &CpuDevice)?;
    for _ in 0..2 {
        let loss = model.forward(&x)?.sum_all()?;
        let grads = loss.backward()?;
        opt.step(&grads)?;
    }

    // Gradient is 3 each step regardless of a, so a = 2 - 0.5*3 - 0.5*3.
    let a = model.a.to_scalar_f64()?;
    assert!(approx_eq(a, -1.0, 1e-5), "expected -1 got {}", a);
    Ok(())
}

#[test]
fn test_momentum_accumulates_velocity() -> stoat::Result<()> {
    let model = Scale::new(0.0)?;
    let mut opt = SGD::new(model.parameters(), 0.1, 0.9, 0.0);

    let x = CpuTensor::from_f64_slice(&[1.0], 1, DType::F32, &CpuDevice)?;
    // Gradient is 1 every step; velocity becomes 1, then 1.9.
    for _ in 0..2 {
        let loss = model.forward(&x)?.sum_all()?;
        let grads = loss.backward()?;
        opt.step(&grads)?;
    }

    let a = model.a.to_scalar_f64()?;
    assert!(approx_eq(a, -0.1 - 0.19, 1e-5), "expected -0.29 got {}", a);
    Ok(())
}
