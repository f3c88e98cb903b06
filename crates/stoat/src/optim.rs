// Optimizers — parameter updates from a GradStore
//
// An optimizer holds clones of the parameter tensors. Because tensors
// share storage through an Arc, writing through `update_data_inplace`
// makes the new values visible to every other handle (the module, the
// next forward pass) without re-assigning anything.
//
// Updates are computed on the host in f64. Parameters are small
// relative to activations, and keeping the update loop on the host
// sidesteps accidentally recording optimizer arithmetic on the
// autograd tape.

use stoat_core::{Backend, GradStore, Result, Tensor};

/// Common interface for gradient-based parameter updates.
pub trait Optimizer<B: Backend> {
    /// Apply one update step using the gradients in `grads`.
    /// Parameters without a gradient entry are left untouched.
    fn step(&mut self, grads: &GradStore<B>) -> Result<()>;

    /// Learning rate currently in effect.
    fn learning_rate(&self) -> f64;

    /// Change the learning rate (for schedules).
    fn set_learning_rate(&mut self, lr: f64);
}

/// Stochastic gradient descent with optional momentum and weight decay.
///
/// Plain SGD: `p <- p - lr * g`.
/// With momentum m: `v <- m * v + g; p <- p - lr * v`.
/// Weight decay adds `wd * p` to the gradient before either update.
pub struct SGD<B: Backend> {
    params: Vec<Tensor<B>>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    /// Velocity buffer per parameter, allocated lazily on first step.
    velocity: Vec<Option<Vec<f64>>>,
}

impl<B: Backend> SGD<B> {
    pub fn new(params: Vec<Tensor<B>>, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        let velocity = vec![None; params.len()];
        SGD {
            params,
            lr,
            momentum,
            weight_decay,
            velocity,
        }
    }
}

impl<B: Backend> Optimizer<B> for SGD<B> {
    fn step(&mut self, grads: &GradStore<B>) -> Result<()> {
        for (i, param) in self.params.iter().enumerate() {
            let grad = match grads.get(param) {
                Some(g) => g,
                None => continue,
            };
            let mut g = grad.to_f64_vec()?;
            let p = param.to_f64_vec()?;
            if self.weight_decay != 0.0 {
                for (gv, pv) in g.iter_mut().zip(p.iter()) {
                    *gv += self.weight_decay * pv;
                }
            }
            if self.momentum != 0.0 {
                let v = self.velocity[i].get_or_insert_with(|| vec![0.0; g.len()]);
                for (vv, gv) in v.iter_mut().zip(g.iter_mut()) {
                    *vv = self.momentum * *vv + *gv;
                    *gv = *vv;
                }
            }
            let updated: Vec<f64> = p
                .iter()
                .zip(g.iter())
                .map(|(pv, gv)| pv - self.lr * gv)
                .collect();
            param.update_data_inplace(&updated)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}
