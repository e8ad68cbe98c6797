//! Core compute primitives.
//!
//! The [`Tensor`] type is the foundation for all tile, map and accumulator
//! math in the reconstruction engine.

mod tensor;

pub use tensor::Tensor;
