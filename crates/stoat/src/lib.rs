//! # Stoat
//!
//! Tensor manipulation with autograd: gather/scatter through
//! index-broadcast lowering, repeat/tile/roll built from pure shape
//! algebra, and a memoized fused select.
//!
//! This is the top-level facade crate that re-exports everything you
//! need.
//!
//! ## Usage
//!
//! ```rust
//! use stoat::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `stoat-core` | Tensor, Shape, DType, Layout, Backend trait, autograd |
//! | `stoat-cpu` | CPU backend with rayon parallelism |
//! | `stoat` | Functional surface, fused select cache, Module, SGD |

/// Re-export core types.
pub use stoat_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp},
    op::{Op, TensorId},
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export CPU backend.
pub use stoat_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Tensor manipulation functions: creation, shape algebra,
/// gather/scatter, repeat/tile/roll, where, cond_take, cumsum.
pub mod functional;

/// Memoized per-(dtype, device) select programs backing
/// [`functional::where_`].
pub mod fused;

/// The [`Module`](module::Module) trait for trainable components.
pub mod module;

/// Optimizers updating parameters from a [`GradStore`].
pub mod optim;

/// Common imports for working with stoat.
pub mod prelude {
    pub use crate::functional;
    pub use crate::module::Module;
    pub use crate::optim::{Optimizer, SGD};
    pub use crate::{
        Backend, CpuBackend, CpuDevice, CpuTensor, DType, Error, GradStore, Result, Shape, Tensor,
    };
}
