//! Masked directional scans along the spatial axes.
//!
//! The direction axis holds `2 * direction_half + axis_kind` and the feature
//! axis is split into its even and odd channels. Each (direction half,
//! feature half) pair scans along x for axis kind 0 and y for axis kind 1,
//! reversed whenever exactly one of the two halves is the second one.

use candle_core::{bail, DType, Result, Tensor, D};

use super::primitives::{flip, residual, ResidualConfig, ResidualWeights};
use crate::multitensor::{Axis, MultiTensor, Signature};

/// The only signature the cumulative layers run on.
pub const CUMULATIVE_SIGNATURE: Signature = Signature::new([1, 1, 1, 1, 1]);

const MASK_PENALTY: f64 = 1e3;
const RANGE_EPS: f64 = 1e-3;

fn cumulative_max(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let mut current = x.narrow(dim, 0, 1)?;
    let mut parts = Vec::with_capacity(n);
    parts.push(current.clone());
    for i in 1..n {
        current = current.maximum(&x.narrow(dim, i, 1)?)?;
        parts.push(current.clone());
    }
    Tensor::cat(&parts, dim)
}

/// Running maximum along `dim` over valid positions, rescaled to `[-1, 1]`
/// with the window's masked min and max.
pub fn running_max(x: &Tensor, dim: usize, mask: &Tensor) -> Result<Tensor> {
    let penalty = mask.affine(-MASK_PENALTY, MASK_PENALTY)?;
    let lowered = x.broadcast_sub(&penalty)?;
    let max = (lowered.max_keepdim(dim)?.broadcast_add(&penalty)? + RANGE_EPS)?;
    let min = (x.broadcast_add(&penalty)?.min_keepdim(dim)?.broadcast_sub(&penalty)? - RANGE_EPS)?;
    let running = cumulative_max(&lowered, dim)?.broadcast_add(&penalty)?;
    let range = (&max - &min)?;
    (running - &min)?.div(&range)?.affine(2.0, -1.0)
}

/// Moves every position one step along `dim`, filling the first with zero.
pub fn shift(x: &Tensor, dim: usize, _mask: &Tensor) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let padding = x.narrow(dim, 0, 1)?.zeros_like()?;
    if n <= 1 {
        return Ok(padding);
    }
    Tensor::cat(&[padding, x.narrow(dim, 0, n - 1)?], dim)
}

/// Combined validity mask laid out like `sig`, with singleton color,
/// direction and feature axes.
fn layout_mask(sig: Signature, combined_mask: &Tensor) -> Result<Tensor> {
    let mut mask = combined_mask.clone();
    if !sig.has(Axis::Y) {
        mask = mask.narrow(2, 0, 1)?.squeeze(2)?;
    }
    if !sig.has(Axis::X) {
        mask = mask.narrow(1, 0, 1)?.squeeze(1)?;
    }
    if !sig.has(Axis::Example) {
        mask = mask.narrow(0, 0, 1)?.squeeze(0)?;
    }
    let insert_at = usize::from(sig.has(Axis::Example));
    for _ in 0..(usize::from(sig.has(Axis::Color)) + usize::from(sig.has(Axis::Direction))) {
        mask = mask.unsqueeze(insert_at)?;
    }
    mask.unsqueeze(mask.rank())
}

fn channel_index(parity: usize, width: usize, x: &Tensor) -> Result<Tensor> {
    let index: Vec<u32> = (parity..width).step_by(2).map(|i| i as u32).collect();
    let len = index.len();
    Tensor::from_vec(index, len, x.device())
}

/// Runs `op(slice, dim, mask)` over each direction/feature quarter of `x`.
pub fn cumulative<F>(sig: Signature, x: &Tensor, combined_mask: &Tensor, op: F) -> Result<Tensor>
where
    F: Fn(&Tensor, usize, &Tensor) -> Result<Tensor>,
{
    let Some(direction_dim) = sig.position(Axis::Direction) else {
        bail!("cumulative layer needs a direction axis, got {}", sig);
    };
    let mask = layout_mask(sig, combined_mask)?;
    let x = x.broadcast_mul(&mask)?;
    let mask = mask.narrow(direction_dim, 0, 1)?.squeeze(direction_dim)?;
    let width = x.dim(D::Minus1)?;
    let last = x.rank() - 2;

    let mut halves: [Vec<Tensor>; 2] = [Vec::new(), Vec::new()];
    for direction_half in 0..2 {
        for (feature_half, results) in halves.iter_mut().enumerate() {
            let index = channel_index(feature_half, width, &x)?;
            for (kind, axis) in [Axis::X, Axis::Y].into_iter().enumerate() {
                let slice = x
                    .narrow(direction_dim, 2 * direction_half + kind, 1)?
                    .squeeze(direction_dim)?
                    .contiguous()?
                    .index_select(&index, last)?;
                let result = match sig.position(axis) {
                    // the direction axis precedes both spatial axes
                    Some(pos) => {
                        let dim = pos - 1;
                        if direction_half + feature_half == 1 {
                            let out = op(&flip(&slice, dim)?, dim, &flip(&mask, dim)?)?;
                            flip(&out, dim)?
                        } else {
                            op(&slice, dim, &mask)?
                        }
                    }
                    None => Tensor::zeros(slice.dims(), DType::F32, slice.device())?,
                };
                results.push(result);
            }
        }
    }
    let [even, odd] = halves;
    let even = Tensor::stack(&even, direction_dim)?;
    let odd = Tensor::stack(&odd, direction_dim)?;
    Tensor::cat(&[even, odd], D::Minus1)
}

/// Residual running-max layer, gated to `CUMULATIVE_SIGNATURE`; `weights`
/// belong to that signature alone.
pub fn cummax_multi(
    x: &MultiTensor<Tensor>,
    weights: &ResidualWeights,
    combined_mask: &Tensor,
    cfg: ResidualConfig,
) -> Result<MultiTensor<Tensor>> {
    x.map_only(&[CUMULATIVE_SIGNATURE], |sig, t| {
        residual(t, weights, cfg, |z| cumulative(sig, z, combined_mask, running_max))
    })
}

/// Residual shift layer, gated to `CUMULATIVE_SIGNATURE`.
pub fn shift_multi(
    x: &MultiTensor<Tensor>,
    weights: &ResidualWeights,
    combined_mask: &Tensor,
    cfg: ResidualConfig,
) -> Result<MultiTensor<Tensor>> {
    x.map_only(&[CUMULATIVE_SIGNATURE], |sig, t| {
        residual(t, weights, cfg, |z| cumulative(sig, z, combined_mask, shift))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (values.len(), 1), &Device::Cpu).unwrap()
    }

    fn flat(x: &Tensor) -> Vec<f32> {
        x.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_running_max_of_increasing_sequence_is_rescaled_input() {
        let values = [-1.0f32, 0.5, 2.0, 2.5, 4.0];
        let x = column(&values);
        let mask = column(&[1.0; 5]);
        let out = flat(&running_max(&x, 0, &mask).unwrap());
        let (lo, hi) = (-1.0 - 1e-3, 4.0 + 1e-3);
        for (o, v) in out.iter().zip(values.iter()) {
            let expected = (v - lo) / (hi - lo) * 2.0 - 1.0;
            assert!((o - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_running_max_ignores_masked_positions() {
        let x = column(&[1.0, 5.0, 2.0, 9.0]);
        let mask = column(&[1.0, 1.0, 1.0, 0.0]);
        let out = flat(&running_max(&x, 0, &mask).unwrap());
        let (lo, hi) = (1.0 - 1e-3, 5.0 + 1e-3);
        let scale = |v: f32| (v - lo) / (hi - lo) * 2.0 - 1.0;
        for (o, e) in out.iter().take(3).zip([scale(1.0), scale(5.0), scale(5.0)]) {
            assert!((o - e).abs() < 1e-4);
        }
    }

    #[test]
    fn test_shift() {
        let x = column(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = flat(&shift(&x, 0, &x).unwrap());
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cumulative_directions() {
        let device = Device::Cpu;
        // [example, color, direction, x, y, feature]
        let shape = [1usize, 1, 4, 3, 2, 4];
        let n: usize = shape.iter().product();
        let x = Tensor::from_vec((0..n).map(|i| i as f32).collect::<Vec<_>>(), &shape[..], &device).unwrap();
        let mask = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();
        let out = cumulative(CUMULATIVE_SIGNATURE, &x, &mask, shift).unwrap();
        assert_eq!(out.dims(), &shape[..]);

        let at = |t: &Tensor, d: usize, f: usize| -> Vec<f32> {
            flat(&t.narrow(2, d, 1).unwrap().narrow(5, f, 1).unwrap())
        };
        // direction 0, even feature 0: forward along x; y index is innermost
        let input = at(&x, 0, 0);
        let output = at(&out, 0, 0);
        assert_eq!(&output[..2], &[0.0, 0.0]);
        assert_eq!(&output[2..], &input[..4]);

        // direction 2, even feature 0: backward along x
        let input = at(&x, 2, 0);
        let output = at(&out, 2, 0);
        assert_eq!(&output[..4], &input[2..]);
        assert_eq!(&output[4..], &[0.0, 0.0]);

        // direction 0, odd half lands after the even half: feature 2 holds input feature 1 reversed
        let input = at(&x, 0, 1);
        let output = at(&out, 0, 2);
        assert_eq!(&output[..4], &input[2..]);
    }

    #[test]
    fn test_padding_is_zeroed_before_scanning() {
        let device = Device::Cpu;
        let shape = [1usize, 1, 4, 2, 1, 2];
        let x = Tensor::ones(&shape[..], DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[[1f32], [0.0]]], &device).unwrap();
        let out = cumulative(CUMULATIVE_SIGNATURE, &x, &mask, shift).unwrap();
        // direction 2 scans backward over x: the padded cell feeds a zero
        let backward = flat(&out.narrow(2, 2, 1).unwrap().narrow(5, 0, 1).unwrap());
        assert_eq!(backward, vec![0.0, 0.0]);
    }
}
