//! Parameter initialization.
//!
//! Every parameter is registered by name in a `VarMap`. Values come from the
//! model's `NoiseSource` in a fixed order; global and local capacity
//! adjustments live under `CAPACITY_PREFIX` so a trainer can leave them out.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, VarMap};

use crate::config::ModelConfig;
use crate::layers::{Linear, Posterior, ResidualWeights, ShareWeights};
use crate::multitensor::{MultiTensor, Signature, SignatureRegistry};
use crate::noise::NoiseSource;

/// Name prefix of every capacity adjustment, global and local.
pub const CAPACITY_PREFIX: &str = "capacity.";

const POSTERIOR_MEAN_SCALE: f32 = 0.01;

/// `10010` style key for a signature.
pub fn signature_key(sig: Signature) -> String {
    sig.flags().iter().map(|f| f.to_string()).collect()
}

pub struct Initializer<'a> {
    registry: Arc<SignatureRegistry>,
    config: &'a ModelConfig,
    noise: &'a mut NoiseSource,
    device: Device,
    varmap: VarMap,
}

impl<'a> Initializer<'a> {
    pub fn new(
        registry: Arc<SignatureRegistry>,
        config: &'a ModelConfig,
        noise: &'a mut NoiseSource,
        device: &Device,
    ) -> Self {
        Self { registry, config, noise, device: device.clone(), varmap: VarMap::new() }
    }

    pub fn into_varmap(self) -> VarMap {
        self.varmap
    }

    fn zeros(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        self.varmap.get(shape, name, Init::Const(0.0), DType::F32, &self.device)
    }

    fn normal(&mut self, name: &str, shape: &[usize], scale: f32) -> Result<Tensor> {
        let value = self.noise.normal(shape, scale, &self.device)?;
        let tensor = self.zeros(name, shape)?;
        self.varmap.set_one(name, &value)?;
        Ok(tensor)
    }

    /// `[rows, cols]` matrix scaled by `1/sqrt(fan_in)`.
    fn matrix(&mut self, name: &str, rows: usize, cols: usize, fan_in: usize) -> Result<Tensor> {
        self.normal(name, &[rows, cols], 1.0 / (fan_in as f32).sqrt())
    }

    /// Linear map `fan_in -> fan_out`, optional zero bias.
    pub fn linear(&mut self, name: &str, fan_in: usize, fan_out: usize, bias: bool) -> Result<Linear> {
        let weight = self.matrix(&format!("{name}.weight"), fan_out, fan_in, fan_in)?;
        let bias = if bias { Some(self.zeros(&format!("{name}.bias"), &[fan_out])?) } else { None };
        Ok(Linear::new(weight, bias))
    }

    /// Per-signature linear maps whose widths may depend on the signature.
    pub fn multi_linear<I, O>(&mut self, name: &str, fan_in: I, fan_out: O, bias: bool) -> Result<MultiTensor<Linear>>
    where
        I: Fn(Signature) -> usize,
        O: Fn(Signature) -> usize,
    {
        let registry = self.registry.clone();
        registry.build(|sig| self.linear(&format!("{name}.{}", signature_key(sig)), fan_in(sig), fan_out(sig), bias))
    }

    /// Square maps at the residual width, only for signatures matching `keep`.
    pub fn multi_linear_where<K>(&mut self, name: &str, keep: K) -> Result<MultiTensor<Option<Linear>>>
    where
        K: Fn(Signature) -> bool,
    {
        let registry = self.registry.clone();
        let config = self.config;
        registry.build(|sig| {
            if !keep(sig) {
                return Ok(None);
            }
            let width = config.channel_width(sig);
            self.linear(&format!("{name}.{}", signature_key(sig)), width, width, false).map(Some)
        })
    }

    /// Residual projections for one signature: width to `inner`, `inner_out` back.
    pub fn residual(&mut self, name: &str, sig: Signature, inner: usize, inner_out: usize) -> Result<ResidualWeights> {
        let width = self.config.channel_width(sig);
        Ok(ResidualWeights {
            input: self.linear(&format!("{name}.in"), width, inner, false)?,
            output: self.linear(&format!("{name}.out"), inner_out, width, false)?,
        })
    }

    pub fn multi_residual<O>(&mut self, name: &str, inner: usize, inner_out: O) -> Result<MultiTensor<ResidualWeights>>
    where
        O: Fn(Signature) -> usize,
    {
        let registry = self.registry.clone();
        registry.build(|sig| self.residual(&format!("{name}.{}", signature_key(sig)), sig, inner, inner_out(sig)))
    }

    /// Bottleneck matrices: `down` is `[width, bottleneck]`, `up` is `[bottleneck, width]`.
    pub fn multi_share(&mut self, name: &str, bottleneck: usize) -> Result<MultiTensor<ShareWeights>> {
        let registry = self.registry.clone();
        let config = self.config;
        registry.build(|sig| {
            let key = format!("{name}.{}", signature_key(sig));
            let width = config.channel_width(sig);
            Ok(ShareWeights {
                down: self.matrix(&format!("{key}.down"), width, bottleneck, width)?,
                up: self.matrix(&format!("{key}.up"), bottleneck, width, bottleneck)?,
            })
        })
    }

    /// Posterior means near zero and zero local capacity adjustments.
    pub fn multi_posterior(&mut self, width: usize) -> Result<MultiTensor<Posterior>> {
        let registry = self.registry.clone();
        registry.build(|sig| {
            let key = signature_key(sig);
            let shape = registry.shape(sig, width);
            Ok(Posterior {
                mean: self.normal(&format!("posterior.{key}.mean"), &shape, POSTERIOR_MEAN_SCALE)?,
                local_capacity_adjustment: self.zeros(&format!("{CAPACITY_PREFIX}local.{key}"), &shape)?,
            })
        })
    }

    /// Zero global capacity adjustments, one per latent channel.
    pub fn multi_capacity(&mut self, width: usize) -> Result<MultiTensor<Tensor>> {
        let registry = self.registry.clone();
        registry.build(|sig| self.zeros(&format!("{CAPACITY_PREFIX}global.{}", signature_key(sig)), &[width]))
    }
}
