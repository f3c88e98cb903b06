// Module trait — the interface a trainable component implements
//
// A module is a plain struct holding parameter tensors. `forward`
// defines its computation, `parameters` hands the trainable tensors to
// an optimizer. All modules are generic over B: Backend, so the same
// definition runs on any device.

use stoat_core::{Backend, Result, Tensor};

/// A trainable component: owns parameters, computes outputs.
///
/// # Example
/// ```ignore
/// struct Scale<B: Backend> {
///     factor: Tensor<B>,
/// }
///
/// impl<B: Backend> Module<B> for Scale<B> {
///     fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
///         x.mul(&self.factor.broadcast_to(x.shape().clone())?)
///     }
///     fn parameters(&self) -> Vec<Tensor<B>> {
///         vec![self.factor.clone()]
///     }
/// }
/// ```
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// All trainable parameters of this module. The optimizer updates
    /// these in place, so clones of the same underlying tensor are
    /// shared, not copied.
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Set training or evaluation mode. Override in modules that
    /// behave differently between the two; the default is a no-op.
    fn set_training(&self, _training: bool) {}

    /// Whether the module is in training mode (default: true).
    fn is_training(&self) -> bool {
        true
    }

    /// Convenience: set training mode.
    fn train(&self) {
        self.set_training(true);
    }

    /// Convenience: set evaluation mode.
    fn eval(&self) {
        self.set_training(false);
    }

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }
}
