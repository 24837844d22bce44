//! Multitensor System
//!
//! A *signature* flags which semantic axes a tensor materializes. The
//! registry fixes the ordered signature set for one task, and a
//! `MultiTensor` holds exactly one value per registered signature. Layers
//! are written for a single signature and lifted over the whole family with
//! the dispatch methods on `MultiTensor`.

pub mod collection;
pub mod registry;
pub mod signature;

pub use collection::MultiTensor;
pub use registry::{SignatureRegistry, N_DIRECTIONS};
pub use signature::{Axis, Signature};
