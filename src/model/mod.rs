//! ARC Compressor Network
//!
//! Latents are sampled per signature through the variational channel, mixed
//! by a stack of sharing, softmax, cumulative, reversal and nonlinear layers,
//! and read out as color logits plus x/y position masks.

pub mod init;

use std::sync::Arc;

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::VarMap;
use ndarray::Array3;
use tracing::info;

use crate::config::ModelConfig;
use crate::layers::primitives::softmax_width;
use crate::layers::{
    affine, cummax_multi, decode_latents, nonlinear_multi, normalize_multi, reverse_multi, share_down,
    share_up, shift_multi, softmax_multi, Linear, Posterior, ResidualConfig, ResidualWeights, ShareWeights,
    CUMULATIVE_SIGNATURE,
};
use crate::multitensor::{Axis, MultiTensor, Signature, SignatureRegistry};
use crate::noise::NoiseSource;
use crate::task::Task;
use init::{Initializer, CAPACITY_PREFIX};

/// Signature read out as per-pixel color logits.
pub const COLOR_HEAD: Signature = Signature::new([1, 1, 0, 1, 1]);
/// Signature read out as the x position mask.
pub const X_MASK_HEAD: Signature = Signature::new([1, 0, 0, 1, 0]);
/// Signature read out as the y position mask.
pub const Y_MASK_HEAD: Signature = Signature::new([1, 0, 0, 0, 1]);

/// Logit added to positions beyond the larger of an example's two grids.
const OUT_OF_RANGE_LOGIT: f32 = -1000.0;

#[derive(Debug, Clone)]
struct LayerWeights {
    share_up: MultiTensor<ShareWeights>,
    softmax: MultiTensor<ResidualWeights>,
    cummax: ResidualWeights,
    shift: ResidualWeights,
    reverse: MultiTensor<Option<Linear>>,
    nonlinear: MultiTensor<ResidualWeights>,
    share_down: MultiTensor<ShareWeights>,
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Non-background color logits, `[example, color, x, y, mode]`.
    pub logits: Tensor,
    /// `[example, x, mode]`
    pub x_mask: Tensor,
    /// `[example, y, mode]`
    pub y_mask: Tensor,
    pub kl_terms: Vec<(Signature, Tensor)>,
}

pub struct ArcCompressor {
    task: Arc<Task>,
    registry: Arc<SignatureRegistry>,
    device: Device,
    noise: NoiseSource,
    combined_mask: Tensor,
    posteriors: MultiTensor<Posterior>,
    decode_weights: MultiTensor<Linear>,
    capacity_adjustments: MultiTensor<Tensor>,
    layers: Vec<LayerWeights>,
    head: Linear,
    mask_head: Linear,
    varmap: VarMap,
}

impl ArcCompressor {
    pub fn new(task: Arc<Task>, config: &ModelConfig, mut noise: NoiseSource, device: &Device) -> Result<Self> {
        let registry = SignatureRegistry::new(task.clone());
        let combined_mask = task.combined_mask_tensor(device)?;

        let mut init = Initializer::new(registry.clone(), config, &mut noise, device);
        let posteriors = init.multi_posterior(config.decoding_dim)?;
        let decode_weights =
            init.multi_linear("decode", |_| config.decoding_dim, |sig| config.channel_width(sig), true)?;
        let capacity_adjustments = init.multi_capacity(config.decoding_dim)?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let layer = format!("layer{i}");
            layers.push(LayerWeights {
                share_up: init.multi_share(&format!("{layer}.share_up"), config.share_up_dim)?,
                softmax: init.multi_residual(&format!("{layer}.softmax"), config.softmax_dim, |sig| {
                    softmax_width(sig, config.softmax_dim)
                })?,
                cummax: init.residual(
                    &format!("{layer}.cummax"),
                    CUMULATIVE_SIGNATURE,
                    config.cummax_dim,
                    config.cummax_dim,
                )?,
                shift: init.residual(&format!("{layer}.shift"), CUMULATIVE_SIGNATURE, config.shift_dim, config.shift_dim)?,
                reverse: init.multi_linear_where(&format!("{layer}.reverse"), |sig| sig.has(Axis::Direction))?,
                nonlinear: init.multi_residual(&format!("{layer}.nonlinear"), config.nonlinear_dim, |_| {
                    config.nonlinear_dim
                })?,
                share_down: init.multi_share(&format!("{layer}.share_down"), config.share_down_dim)?,
            });
        }
        let head = init.linear("head", config.channel_width(COLOR_HEAD), 2, false)?;
        let mask_head = init.linear("mask_head", config.channel_width(X_MASK_HEAD), 2, true)?;
        let varmap = init.into_varmap();

        let parameters: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!(
            signatures = registry.len(),
            parameters,
            n_examples = task.n_examples,
            n_x = task.n_x,
            n_y = task.n_y,
            "compressor initialized"
        );

        Ok(Self {
            task,
            registry,
            device: device.clone(),
            noise,
            combined_mask,
            posteriors,
            decode_weights,
            capacity_adjustments,
            layers,
            head,
            mask_head,
            varmap,
        })
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn registry(&self) -> &Arc<SignatureRegistry> {
        &self.registry
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Parameters for the optimizer; capacity adjustments only when asked.
    pub fn trainable_vars(&self, include_capacity: bool) -> Result<Vec<Var>> {
        if include_capacity {
            return Ok(self.varmap.all_vars());
        }
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter map poisoned: {e}")))?;
        Ok(data
            .iter()
            .filter(|(name, _)| !name.starts_with(CAPACITY_PREFIX))
            .map(|(_, var)| var.clone())
            .collect())
    }

    pub fn forward(&mut self) -> Result<ModelOutput> {
        let mask = &self.combined_mask;
        let (mut x, kl_terms) = decode_latents(
            &self.capacity_adjustments,
            &self.decode_weights,
            &self.posteriors,
            &mut self.noise,
            &self.device,
        )?;

        for layer in self.layers.iter() {
            x = share_up(&x, &layer.share_up, mask)?;
            x = softmax_multi(&x, &layer.softmax, ResidualConfig::pre_norm())?;
            x = cummax_multi(&x, &layer.cummax, mask, ResidualConfig::post_norm())?;
            x = shift_multi(&x, &layer.shift, mask, ResidualConfig::default())?;
            x = reverse_multi(&x, &layer.reverse, true)?;
            x = nonlinear_multi(&x, &layer.nonlinear, ResidualConfig::pre_norm())?;
            x = share_down(&x, &layer.share_down, mask)?;
            // scale only: a per-feature offset must survive to the heads
            x = normalize_multi(&x, false)?;
        }

        let logits = affine(x.require(COLOR_HEAD)?, &self.head, false)?;
        let x_mask = affine(x.require(X_MASK_HEAD)?, &self.mask_head, true)?;
        let y_mask = affine(x.require(Y_MASK_HEAD)?, &self.mask_head, true)?;
        let (x_mask, y_mask) = postprocess_mask(&self.task, &x_mask, &y_mask)?;
        Ok(ModelOutput { logits, x_mask, y_mask, kl_terms })
    }
}

/// Pushes mask logits far negative beyond the larger of each example's input
/// and output lengths, in both modes.
pub fn postprocess_mask(task: &Task, x_mask: &Tensor, y_mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let mut x_modifier = Array3::<f32>::zeros((task.n_examples, task.n_x, 2));
    let mut y_modifier = Array3::<f32>::zeros((task.n_examples, task.n_y, 2));
    for (e, shape) in task.shapes.iter().enumerate() {
        let max_x = shape[0][0].max(shape[1][0]);
        let max_y = shape[0][1].max(shape[1][1]);
        for mode in 0..2 {
            for x in max_x..task.n_x {
                x_modifier[[e, x, mode]] = OUT_OF_RANGE_LOGIT;
            }
            for y in max_y..task.n_y {
                y_modifier[[e, y, mode]] = OUT_OF_RANGE_LOGIT;
            }
        }
    }
    let to_tensor = |a: Array3<f32>, like: &Tensor| -> Result<Tensor> {
        let dims = a.shape().to_vec();
        Tensor::from_vec(a.into_raw_vec(), dims, like.device())
    };
    let x_mask = (x_mask + to_tensor(x_modifier, x_mask)?)?;
    let y_mask = (y_mask + to_tensor(y_modifier, y_mask)?)?;
    Ok((x_mask, y_mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_task() -> Arc<Task> {
        let input = vec![vec![1u8, 0], vec![0, 2]];
        let output = vec![vec![2u8, 0, 1], vec![0, 1, 1]];
        Arc::new(Task::from_examples(&[(input.clone(), output)], &[input]).unwrap())
    }

    #[test]
    fn test_forward_shapes() {
        let task = small_task();
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let mut model = ArcCompressor::new(task.clone(), &config, NoiseSource::seeded(0), &Device::Cpu).unwrap();
        let out = model.forward().unwrap();
        assert_eq!(out.logits.dims(), &[2, task.n_colors, task.n_x, task.n_y, 2]);
        assert_eq!(out.x_mask.dims(), &[2, task.n_x, 2]);
        assert_eq!(out.y_mask.dims(), &[2, task.n_y, 2]);
        assert_eq!(out.kl_terms.len(), model.registry().len());
        for (sig, kl) in out.kl_terms.iter() {
            assert_eq!(kl.dims(), &model.registry().shape(*sig, config.decoding_dim)[..]);
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let task = small_task();
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let run = || {
            let mut model = ArcCompressor::new(task.clone(), &config, NoiseSource::seeded(3), &Device::Cpu).unwrap();
            model.forward().unwrap().logits.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_postprocess_mask_penalizes_out_of_range() {
        let small = vec![vec![1u8]];
        let wide = vec![vec![1u8, 0, 1]];
        let task = Task::from_examples(&[(small.clone(), small), (wide.clone(), wide)], &[]).unwrap();
        let x_mask = Tensor::zeros((2, task.n_x, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y_mask = Tensor::zeros((2, task.n_y, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let (x, y) = postprocess_mask(&task, &x_mask, &y_mask).unwrap();
        assert!(x.to_vec3::<f32>().unwrap().iter().flatten().flatten().all(|v| *v == 0.0));
        let y = y.to_vec3::<f32>().unwrap();
        assert_eq!(y[0][0], vec![0.0, 0.0]);
        assert_eq!(y[0][1], vec![OUT_OF_RANGE_LOGIT; 2]);
        assert_eq!(y[0][2], vec![OUT_OF_RANGE_LOGIT; 2]);
        assert_eq!(y[1][2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_capacity_vars_are_separate() {
        let task = small_task();
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let model = ArcCompressor::new(task, &config, NoiseSource::seeded(0), &Device::Cpu).unwrap();
        let with = model.trainable_vars(true).unwrap().len();
        let without = model.trainable_vars(false).unwrap().len();
        // one global and one local adjustment per signature
        assert_eq!(with - without, 2 * model.registry().len());
    }

    #[test]
    fn test_gated_layers_only_hold_their_signatures() {
        let task = small_task();
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let model = ArcCompressor::new(task, &config, NoiseSource::seeded(0), &Device::Cpu).unwrap();
        let data = model.varmap().data().lock().unwrap();
        let cumulative: Vec<&String> = data
            .keys()
            .filter(|name| name.starts_with("layer0.cummax") || name.starts_with("layer0.shift"))
            .collect();
        assert_eq!(cumulative.len(), 4, "{:?}", cumulative);
        assert!(data.contains_key("layer0.cummax.in.weight"));
        assert!(data.contains_key("layer0.shift.out.weight"));
        for sig in model.registry().iter() {
            let key = format!("layer0.reverse.{}.weight", init::signature_key(sig));
            assert_eq!(data.contains_key(&key), sig.has(Axis::Direction), "{}", sig);
        }
    }

    #[test]
    fn test_color_head_can_express_a_constant() {
        // a zero-mean readout would sum to exactly zero over every position
        let grid = vec![vec![2u8; 3]; 3];
        let task = Arc::new(Task::from_examples(&[(grid.clone(), grid)], &[]).unwrap());
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let mut model = ArcCompressor::new(task, &config, NoiseSource::seeded(0), &Device::Cpu).unwrap();
        let logits = model.forward().unwrap().logits;
        // [example, color, x, y, mode] summed over positions, per mode
        let totals = logits.sum_keepdim(vec![0, 1, 2, 3]).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(totals.iter().any(|t| t.abs() > 1e-3), "{:?}", totals);
    }
}
