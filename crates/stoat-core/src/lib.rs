//! # stoat-core
//!
//! Core tensor primitives, backend traits, and autograd for Stoat.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array with automatic differentiation
//! - [`Shape`] / [`Layout`] — shape, strides, and memory layout
//! - [`DType`] — data types (F16, BF16, F32, F64, Bool, I32, I64)
//! - [`Backend`] trait — abstraction over compute devices
//! - [`GradStore`] — gradient storage returned by `backward()`

pub mod backend;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use backprop::GradStore;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::Op;
pub use shape::Shape;
pub use tensor::Tensor;
