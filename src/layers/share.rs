//! Cross-signature information sharing.
//!
//! `share_up` broadcasts every coarser signature into each finer one;
//! `share_down` pools every finer signature into each coarser one. Both run
//! through a narrow bottleneck whose projections are tied under the x/y swap.

use candle_core::{bail, Result, Tensor};

use super::primitives::{affine, flip, normalize_multi, Linear};
use crate::multitensor::{Axis, MultiTensor, Signature};
use crate::task::Task;

const MASKED_MEAN_EPS: f64 = 1e-4;

/// Bottleneck projections for one signature: `down` is `[width, bottleneck]`,
/// `up` is `[bottleneck, width]`.
#[derive(Debug, Clone)]
pub struct ShareWeights {
    pub down: Tensor,
    pub up: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareDirection {
    Up,
    Down,
}

/// Averages each weight with the last-axis flip of its x/y-swapped counterpart.
pub fn symmetrize_xy(weights: &MultiTensor<Tensor>) -> Result<MultiTensor<Tensor>> {
    weights.map(|sig, w| {
        let other = weights.require(sig.swap_xy())?;
        let last = other.rank() - 1;
        (w + flip(other, last)?)? * 0.5
    })
}

/// Multiplies the feature axis by an `[in, out]` matrix.
fn project(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    affine(x, &Linear::new(w.t()?, None), false)
}

/// Broadcasts `lower` up to the rank of `target` by inserting singleton axes.
fn broadcast_up(target: Signature, lower: Signature, x: &Tensor) -> Result<Tensor> {
    let mut x = x.clone();
    for axis in Axis::ALL {
        if lower.has(axis) {
            continue;
        }
        if let Some(pos) = target.position(axis) {
            x = x.unsqueeze(pos)?;
        }
    }
    Ok(x)
}

/// Position mask matching `higher`'s layout at the stage where `axis` is reduced.
fn stage_mask(combined: &Tensor, higher: Signature, target: Signature, axis: Axis) -> Result<Tensor> {
    let mut mask = if higher.has(Axis::Example) {
        combined.clone()
    } else {
        combined.narrow(0, 0, 1)?.squeeze(0)?
    };
    let insert_at = usize::from(higher.has(Axis::Example));
    for _ in 0..(usize::from(higher.has(Axis::Color)) + usize::from(higher.has(Axis::Direction))) {
        mask = mask.unsqueeze(insert_at)?;
    }
    let rank = mask.rank();
    if axis == Axis::X && !target.has(Axis::Y) {
        mask = mask.narrow(rank - 1, 0, 1)?.squeeze(rank - 1)?;
    }
    if axis == Axis::Y && !higher.has(Axis::X) {
        mask = mask.narrow(rank - 2, 0, 1)?.squeeze(rank - 2)?;
    }
    mask.unsqueeze(mask.rank())
}

/// Reduces `higher` down to the rank of `target`, highest axis first. Spatial
/// axes use a masked mean when the task's masks describe positions
/// consistently; everything else is a plain mean.
fn reduce_down(
    target: Signature,
    higher: Signature,
    x: &Tensor,
    combined_mask: &Tensor,
    task: &Task,
) -> Result<Tensor> {
    let mut x = x.clone();
    for axis in Axis::ALL.iter().rev().copied() {
        if target.has(axis) {
            continue;
        }
        let Some(pos) = higher.position(axis) else {
            continue;
        };
        let spatial = axis == Axis::X || axis == Axis::Y;
        x = if spatial && task.masked_aggregation() {
            let mask = stage_mask(combined_mask, higher, target, axis)?;
            let total = x.broadcast_mul(&mask)?.sum_keepdim(pos)?;
            let count = (mask.sum_keepdim(pos)? + MASKED_MEAN_EPS)?;
            total.broadcast_div(&count)?.squeeze(pos)?
        } else {
            x.mean(pos)?
        };
    }
    Ok(x)
}

fn gather(
    target: Signature,
    bottleneck: &MultiTensor<Tensor>,
    direction: ShareDirection,
    combined_mask: &Tensor,
) -> Result<Tensor> {
    let task = bottleneck.registry().task();
    let mut total: Option<Tensor> = None;
    for (source, x) in bottleneck.iter() {
        let contribution = match direction {
            ShareDirection::Up if source.is_below(&target) => broadcast_up(target, source, x)?,
            ShareDirection::Down if target.is_below(&source) => {
                reduce_down(target, source, x, combined_mask, task)?
            }
            _ => continue,
        };
        total = Some(match total {
            Some(t) => t.broadcast_add(&contribution)?,
            None => contribution,
        });
    }
    match total {
        Some(t) => Ok(t),
        None => bail!("no signature shares into {}", target),
    }
}

/// One residual sharing update in `direction`.
///
/// `combined_mask` is the task's `[example, x, y]` either-mode validity mask.
pub fn share(
    residual: &MultiTensor<Tensor>,
    weights: &MultiTensor<ShareWeights>,
    direction: ShareDirection,
    combined_mask: &Tensor,
) -> Result<MultiTensor<Tensor>> {
    let down = symmetrize_xy(&weights.map(|_, w| Ok(w.down.clone()))?)?;
    let up = symmetrize_xy(&weights.map(|_, w| Ok(w.up.clone()))?)?;

    let bottleneck = residual.zip_with(&down, |_, x, w| project(x, w))?;
    let shared = residual
        .registry()
        .build(|sig| gather(sig, &bottleneck, direction, combined_mask))?;
    let shared = normalize_multi(&shared, true)?;
    let update = shared.zip_with(&up, |_, x, w| project(x, w))?;
    residual.zip_with(&update, |_, x, u| x + u)
}

pub fn share_up(
    residual: &MultiTensor<Tensor>,
    weights: &MultiTensor<ShareWeights>,
    combined_mask: &Tensor,
) -> Result<MultiTensor<Tensor>> {
    share(residual, weights, ShareDirection::Up, combined_mask)
}

pub fn share_down(
    residual: &MultiTensor<Tensor>,
    weights: &MultiTensor<ShareWeights>,
    combined_mask: &Tensor,
) -> Result<MultiTensor<Tensor>> {
    share(residual, weights, ShareDirection::Down, combined_mask)
}
