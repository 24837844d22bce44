//! Stateless per-signature transforms and their multitensor lifts.

use candle_core::{bail, Result, Tensor, D};
use candle_nn::Module;
pub use candle_nn::Linear;

use crate::multitensor::{Axis, MultiTensor, Signature};

const NORM_EPS: f64 = 1e-8;

/// Input and output projections around a residual layer.
#[derive(Debug, Clone)]
pub struct ResidualWeights {
    pub input: Linear,
    pub output: Linear,
}

/// Placement of normalization and bias inside a residual block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidualConfig {
    pub pre_norm: bool,
    pub post_norm: bool,
    pub use_bias: bool,
}

impl ResidualConfig {
    pub fn pre_norm() -> Self {
        Self { pre_norm: true, ..Default::default() }
    }

    pub fn post_norm() -> Self {
        Self { post_norm: true, ..Default::default() }
    }
}

/// Views `x` as `[rows, features]`.
fn as_rows(x: &Tensor) -> Result<Tensor> {
    let width = x.dim(D::Minus1)?;
    x.reshape((x.elem_count() / width, width))
}

/// Subtracts the mean (optional) and divides by the root-mean-square, both
/// taken over every axis except the feature axis.
pub fn normalize(x: &Tensor, debias: bool) -> Result<Tensor> {
    let rows = as_rows(x)?;
    let rows = if debias {
        rows.broadcast_sub(&rows.mean_keepdim(0)?)?
    } else {
        rows
    };
    let rms = (rows.sqr()?.mean_keepdim(0)? + NORM_EPS)?.sqrt()?;
    rows.broadcast_div(&rms)?.reshape(x.dims())
}

/// Applies `linear` (weight `[out, in]`) along the feature axis, with its
/// bias only if asked.
pub fn affine(x: &Tensor, linear: &Linear, use_bias: bool) -> Result<Tensor> {
    let mut dims = x.dims().to_vec();
    let rows = as_rows(x)?;
    let y = match (linear.bias(), use_bias) {
        (Some(_), true) => linear.forward(&rows)?,
        _ => rows.matmul(&linear.weight().t()?)?,
    };
    if let Some(last) = dims.last_mut() {
        *last = linear.weight().dim(0)?;
    }
    y.reshape(dims)
}

/// `x + out(layer(in(norm?(x))))`, with optional post-normalization.
pub fn residual<F>(x: &Tensor, weights: &ResidualWeights, cfg: ResidualConfig, layer: F) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    let z = if cfg.pre_norm { normalize(x, true)? } else { x.clone() };
    let z = affine(&z, &weights.input, cfg.use_bias)?;
    let z = layer(&z)?;
    let z = if cfg.post_norm { normalize(&z, true)? } else { z };
    let z = affine(&z, &weights.output, cfg.use_bias)?;
    x + z
}

/// Every non-empty subset of `axes`, by size and then lexicographically.
pub fn axis_subsets(axes: &[usize]) -> Vec<Vec<usize>> {
    let mut subsets: Vec<Vec<usize>> = (1u32..(1 << axes.len()))
        .map(|bits| {
            axes.iter()
                .enumerate()
                .filter(|(i, _)| bits & (1 << i) != 0)
                .map(|(_, &a)| a)
                .collect()
        })
        .collect();
    subsets.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    subsets
}

/// Softmax over every non-empty subset of the non-example axes, concatenated
/// along the feature axis. Returns `None` when the signature has no such axes.
pub fn softmax_subsets(sig: Signature, x: &Tensor) -> Result<Option<Tensor>> {
    let subsets = axis_subsets(&sig.softmax_axes());
    if subsets.is_empty() {
        return Ok(None);
    }
    let mut parts = Vec::with_capacity(subsets.len());
    for subset in subsets.iter() {
        let mut offsets = x.detach();
        for &axis in subset.iter() {
            offsets = offsets.max_keepdim(axis)?;
        }
        let exp = x.broadcast_sub(&offsets)?.exp()?;
        let total = exp.sum_keepdim(subset.clone())?;
        parts.push(exp.broadcast_div(&total)?);
    }
    Tensor::cat(&parts, D::Minus1).map(Some)
}

/// Output width of `softmax_subsets` for an input of width `width`.
pub fn softmax_width(sig: Signature, width: usize) -> usize {
    width * ((1usize << sig.softmax_axes().len()) - 1)
}

/// Reverses `x` along `dim`.
pub fn flip(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let index: Vec<u32> = (0..n as u32).rev().collect();
    let index = Tensor::from_vec(index, n, x.device())?;
    x.contiguous()?.index_select(&index, dim)
}

/// Exchanges the forward and backward halves of the direction axis.
pub fn swap_directions(sig: Signature, x: &Tensor) -> Result<Tensor> {
    match sig.position(Axis::Direction) {
        Some(dim) => {
            let half = x.dim(dim)? / 2;
            Tensor::cat(&[x.narrow(dim, half, half)?, x.narrow(dim, 0, half)?], dim)
        }
        None => Ok(x.clone()),
    }
}

pub fn normalize_multi(x: &MultiTensor<Tensor>, debias: bool) -> Result<MultiTensor<Tensor>> {
    x.map(|_, t| normalize(t, debias))
}

pub fn affine_multi(
    x: &MultiTensor<Tensor>,
    weights: &MultiTensor<Linear>,
    use_bias: bool,
) -> Result<MultiTensor<Tensor>> {
    x.zip_with(weights, |_, t, w| affine(t, w, use_bias))
}

/// Residual softmax-over-subsets; identity where there is nothing to normalize over.
pub fn softmax_multi(
    x: &MultiTensor<Tensor>,
    weights: &MultiTensor<ResidualWeights>,
    cfg: ResidualConfig,
) -> Result<MultiTensor<Tensor>> {
    x.zip_with(weights, |sig, t, w| {
        if sig.softmax_axes().is_empty() {
            return Ok(t.clone());
        }
        residual(t, w, cfg, |z| {
            softmax_subsets(sig, z)?.ok_or_else(|| candle_core::Error::Msg(format!("no softmax axes for {}", sig)))
        })
    })
}

/// Residual SiLU.
pub fn nonlinear_multi(
    x: &MultiTensor<Tensor>,
    weights: &MultiTensor<ResidualWeights>,
    cfg: ResidualConfig,
) -> Result<MultiTensor<Tensor>> {
    x.zip_with(weights, |_, t, w| residual(t, w, cfg, |z| z.silu()))
}

/// `x + affine(swap_directions(norm?(x)))`, only for signatures with a direction axis.
///
/// `weights` holds a map for exactly those signatures.
pub fn reverse_multi(
    x: &MultiTensor<Tensor>,
    weights: &MultiTensor<Option<Linear>>,
    pre_norm: bool,
) -> Result<MultiTensor<Tensor>> {
    let directional: Vec<Signature> = x.registry().iter().filter(|s| s.has(Axis::Direction)).collect();
    x.map_only(&directional, |sig, t| {
        let Some(w) = weights.require(sig)? else {
            bail!("no reversal weights for {}", sig);
        };
        let z = if pre_norm { normalize(t, true)? } else { t.clone() };
        let swapped = swap_directions(sig, &z)?;
        t + affine(&swapped, w, false)?
    })
}
