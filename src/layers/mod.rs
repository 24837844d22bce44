//! Layer Library
//!
//! Every layer is written for one signature and lifted over a whole
//! `MultiTensor` through its dispatch methods. Layers never mutate their
//! inputs; side values such as KL terms are returned to the caller.

pub mod channel;
pub mod cumulative;
pub mod primitives;
pub mod share;

pub use channel::{channel, decode_latents, Posterior};
pub use cumulative::{cummax_multi, shift_multi, CUMULATIVE_SIGNATURE};
pub use primitives::{
    affine, affine_multi, nonlinear_multi, normalize, normalize_multi, residual, reverse_multi,
    softmax_multi, Linear, ResidualConfig, ResidualWeights,
};
pub use share::{share_down, share_up, ShareWeights};
