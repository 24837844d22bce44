//! Variational information-bottleneck channel.
//!
//! Each signature carries a posterior `(mean, local capacity adjustment)`.
//! A global adjustment sets the total capacity budget; the local adjustment
//! is re-centred so it can only move capacity between positions.

use candle_core::{Device, Result, Tensor, D};

use super::primitives::{affine, Linear};
use crate::multitensor::{MultiTensor, Signature};
use crate::noise::NoiseSource;

pub const INIT_CAPACITY: f64 = 10000.0;
pub const MIN_CAPACITY: f64 = 0.5;
/// Exponent scale applied to capacity adjustments.
pub const ADJUSTMENT_SCALE: f64 = 10.0;
/// Above this `2 * capacity / dimensionality` the signal std is exactly 1.
pub const SIGNAL_STD_CLAMP: f64 = 20.0;
const MEAN_EPS: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct Posterior {
    pub mean: Tensor,
    pub local_capacity_adjustment: Tensor,
}

/// Mean over every axis except the feature axis, shaped `[features]`.
fn feature_mean(x: &Tensor) -> Result<Tensor> {
    let width = x.dim(D::Minus1)?;
    x.reshape((x.elem_count() / width, width))?.mean(0)
}

/// Samples the latent for one signature and returns `(z, kl)`, both shaped like the mean.
///
/// `epsilon` is the standard-normal draw for this pass; the result is a
/// deterministic function of it.
pub fn channel(global_adjustment: &Tensor, posterior: &Posterior, epsilon: &Tensor) -> Result<(Tensor, Tensor)> {
    let mean = &posterior.mean;
    let local = &posterior.local_capacity_adjustment;
    let dimensionality = mean.elem_count() as f64;

    let global = global_adjustment.affine(ADJUSTMENT_SCALE, 0.0)?;
    let desired_global = global.exp()?.affine(INIT_CAPACITY, MIN_CAPACITY)?;
    let output_scaling = desired_global
        .affine(-2.0 / dimensionality, 0.0)?
        .exp()?
        .affine(-1.0, 1.0)?;

    let local = local.broadcast_add(&global)?.broadcast_sub(&feature_mean(local)?)?;
    let desired_local = local.exp()?.affine(INIT_CAPACITY, MIN_CAPACITY)?;
    let rate = desired_local.affine(1.0 / dimensionality, 0.0)?;

    let noise_std = rate.neg()?.exp()?;
    let noise_var = noise_std.sqr()?;
    let doubled = rate.affine(2.0, 0.0)?;
    let unclamped = doubled.neg()?.exp()?.affine(-1.0, 1.0)?.sqrt()?;
    let signal_std = doubled
        .gt(SIGNAL_STD_CLAMP)?
        .where_cond(&Tensor::ones_like(&unclamped)?, &unclamped)?;
    let signal_var = noise_var.affine(-1.0, 1.0)?;

    let power = feature_mean(&(mean.sqr()? + MEAN_EPS)?)?.sqrt()?;
    let normalized_mean = mean.broadcast_div(&power)?;

    let z = ((&signal_std * &normalized_mean)? + (&noise_std * epsilon)?)?;
    let z = z.broadcast_mul(&output_scaling)?;

    let kl = ((&noise_var + (&signal_var * normalized_mean.sqr()?)?)?.affine(0.5, -0.5)? + rate)?;
    Ok((z, kl))
}

/// Samples every signature's latent, decodes it to the residual width and
/// returns the decoded collection with the per-signature KL tensors.
pub fn decode_latents(
    global_adjustments: &MultiTensor<Tensor>,
    decode_weights: &MultiTensor<Linear>,
    posteriors: &MultiTensor<Posterior>,
    noise: &mut NoiseSource,
    device: &Device,
) -> Result<(MultiTensor<Tensor>, Vec<(Signature, Tensor)>)> {
    posteriors.map_with_payload(|sig, posterior| {
        let epsilon = noise.standard_normal(posterior.mean.dims(), device)?;
        let (z, kl) = channel(global_adjustments.require(sig)?, posterior, &epsilon)?;
        let x = affine(&z, decode_weights.require(sig)?, true)?;
        Ok((x, kl))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_kl_at_defaults_matches_closed_form() {
        let shape = [1000, 10];
        let posterior = Posterior { mean: zeros(&shape), local_capacity_adjustment: zeros(&shape) };
        let (_, kl) = channel(&zeros(&[10]), &posterior, &zeros(&shape)).unwrap();

        let dimensionality = 10000.0f64;
        let capacity = INIT_CAPACITY + MIN_CAPACITY;
        let noise_var = (-2.0 * capacity / dimensionality).exp();
        let expected = 0.5 * (noise_var - 1.0) + capacity / dimensionality;

        let values = kl.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values.len(), 10000);
        assert!(values.iter().all(|&v| (v as f64 - expected).abs() < 1e-4), "expected {}", expected);
    }

    #[test]
    fn test_small_tensors_saturate_signal() {
        // capacity far above dimensionality: no noise, full signal
        let device = Device::Cpu;
        let mean = Tensor::new(&[[1f32, -2.0], [3.0, 2.0]], &device).unwrap();
        let posterior = Posterior { mean: mean.clone(), local_capacity_adjustment: zeros(&[2, 2]) };
        let epsilon = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let (z, _) = channel(&zeros(&[2]), &posterior, &epsilon).unwrap();
        let z = z.to_vec2::<f32>().unwrap();
        // column 0 has rms sqrt(5), column 1 has rms sqrt(4)
        assert!((z[0][0] - 1.0 / 5f32.sqrt()).abs() < 1e-4);
        assert!((z[1][1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_local_adjustment_is_mean_preserving() {
        let device = Device::Cpu;
        let shape = [50, 4];
        let mean = NoiseSource::seeded(3).standard_normal(&shape, &device).unwrap();
        let epsilon = NoiseSource::seeded(4).standard_normal(&shape, &device).unwrap();
        let local = NoiseSource::seeded(5).normal(&shape, 0.1, &device).unwrap();
        let global = Tensor::new(&[-0.8f32, -0.9, -1.0, -0.7], &device).unwrap();

        let base = Posterior { mean: mean.clone(), local_capacity_adjustment: local.clone() };
        let shifted = Posterior { mean, local_capacity_adjustment: (local + 3.0).unwrap() };
        let (z_a, kl_a) = channel(&global, &base, &epsilon).unwrap();
        let (z_b, kl_b) = channel(&global, &shifted, &epsilon).unwrap();

        let diff = (z_a - z_b).unwrap().abs().unwrap().max_keepdim(0).unwrap().max_keepdim(1).unwrap();
        assert!(diff.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0] < 1e-4);
        let kl_diff = (kl_a.sum_all().unwrap() - kl_b.sum_all().unwrap()).unwrap().abs().unwrap();
        assert!(kl_diff.to_scalar::<f32>().unwrap() < 1e-2);
    }
}
