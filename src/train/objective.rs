//! Training objective.
//!
//! Each grid is scored by marginalizing over every placement of its window
//! inside the padded canvas: the position masks give a log-probability to
//! each x and y offset, the color logits give a cross-entropy per placement,
//! and log-sum-exp combines them. The loss is the total KL plus a weighted
//! reconstruction error.

use candle_core::{bail, DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::model::ModelOutput;
use crate::task::{Task, OUTPUT_MODE};

/// Weight of the reconstruction error in the loss.
pub const RECONSTRUCTION_WEIGHT: f64 = 10.0;
/// Steps over which the uncertain-size schedules anneal to 1.
const ANNEAL_STEPS: f64 = 100.0;

/// Numerically stable `log(sum(exp(xs)))` over every element.
pub fn log_sum_exp(xs: &Tensor) -> Result<Tensor> {
    xs.flatten_all()?.log_sum_exp(0)
}

/// Scores every placement of a length-`length` window in `mask` (mask logits
/// along one axis). A placement at offset `o` earns the logits inside the
/// window and loses the ones outside: `2 * window_sum - total_sum`.
///
/// Returns `(log_partition, logprobs)` with `logprobs` of length
/// `mask.len() - length + 1`.
pub fn mask_select_logprobs(mask: &Tensor, length: usize) -> Result<(Tensor, Tensor)> {
    let n = mask.dim(0)?;
    if length == 0 || length > n {
        bail!("window length {} does not fit in {}", length, n);
    }
    let offsets = n - length + 1;
    let total = mask.sum_all()?;
    let zero = Tensor::zeros(1, mask.dtype(), mask.device())?;
    let prefix = Tensor::cat(&[zero, mask.cumsum(0)?], 0)?;
    let window = (prefix.narrow(0, length, offsets)? - prefix.narrow(0, 0, offsets)?)?;
    let logprobs = window.affine(2.0, 0.0)?.broadcast_sub(&total)?;
    let log_partition = log_sum_exp(&logprobs)?;
    Ok((log_partition, logprobs))
}

/// Scale applied to mask logits when the grid size is uncertain; rises from
/// 0.01 to 1 over the first hundred steps.
pub fn mask_coefficient(step: usize) -> f64 {
    0.01f64.powf((1.0 - step as f64 / ANNEAL_STEPS).max(0.0))
}

/// Inverse temperature of the placement log-sum-exp when the grid size is
/// uncertain; rises from 0.1 to 1 over the first hundred steps.
pub fn placement_sharpness(step: usize) -> f64 {
    0.1f64.powf((1.0 - step as f64 / ANNEAL_STEPS).max(0.0))
}

/// Prepends a zero logit for the background color along the color axis.
pub fn with_background(logits: &Tensor) -> Result<Tensor> {
    let mut dims = logits.dims().to_vec();
    dims[1] = 1;
    let background = Tensor::zeros(dims, logits.dtype(), logits.device())?;
    Tensor::cat(&[background, logits.clone()], 1)
}

/// Log-probability of one axis's placements, normalized by the partition
/// over the true length, or over every length when the size is uncertain.
fn axis_logprobs(mask: &Tensor, length: usize, uncertain: bool) -> Result<Tensor> {
    let (partition, logprobs) = mask_select_logprobs(mask, length)?;
    let partition = if uncertain {
        let n = mask.dim(0)?;
        let partitions = (1..=n)
            .map(|l| mask_select_logprobs(mask, l).map(|(p, _)| p))
            .collect::<Result<Vec<_>>>()?;
        log_sum_exp(&Tensor::stack(&partitions, 0)?)?
    } else {
        partition
    };
    logprobs.broadcast_sub(&partition)
}

/// Log-likelihood of one grid under the model, marginalized over placements.
///
/// `log_probs` is `[example, color + 1, x, y, mode]` after log-softmax.
pub fn grid_logprob(
    task: &Task,
    log_probs: &Tensor,
    output: &ModelOutput,
    example: usize,
    mode: usize,
    step: usize,
) -> Result<Tensor> {
    let uncertain = !task.grid_size_known(mode);
    let coefficient = if uncertain { mask_coefficient(step) } else { 1.0 };
    let [lx, ly] = task.shapes[example][mode];

    let select = |mask: &Tensor| -> Result<Tensor> {
        mask.narrow(0, example, 1)?.squeeze(0)?.narrow(1, mode, 1)?.squeeze(1)?.affine(coefficient, 0.0)
    };
    let x_logprobs = axis_logprobs(&select(&output.x_mask)?, lx, uncertain)?;
    let y_logprobs = axis_logprobs(&select(&output.y_mask)?, ly, uncertain)?;

    let canvas = log_probs.narrow(0, example, 1)?.squeeze(0)?.narrow(D::Minus1, mode, 1)?.squeeze(D::Minus1)?;
    let target = task.target(example, mode, log_probs.device())?.unsqueeze(0)?;
    let (n_ox, n_oy) = (x_logprobs.dim(0)?, y_logprobs.dim(0)?);
    let mut rows = Vec::with_capacity(n_ox);
    for ox in 0..n_ox {
        let mut row = Vec::with_capacity(n_oy);
        for oy in 0..n_oy {
            let crop = canvas.narrow(1, ox, lx)?.narrow(2, oy, ly)?.contiguous()?;
            row.push(crop.gather(&target, 0)?.sum_all()?);
        }
        rows.push(Tensor::stack(&row, 0)?);
    }
    let placements = Tensor::stack(&rows, 0)?
        .broadcast_add(&x_logprobs.unsqueeze(1)?)?
        .broadcast_add(&y_logprobs.unsqueeze(0)?)?;

    let sharpness = if uncertain { placement_sharpness(step) } else { 1.0 };
    log_sum_exp(&placements.affine(sharpness, 0.0)?)?.affine(1.0 / sharpness, 0.0)
}

/// Scalar terms of one step's objective.
#[derive(Debug, Clone)]
pub struct Objective {
    /// Color logits with the background channel, `[example, color + 1, x, y, mode]`.
    pub logits: Tensor,
    pub total_kl: Tensor,
    pub reconstruction_error: Tensor,
    pub loss: Tensor,
}

/// Total KL plus `RECONSTRUCTION_WEIGHT` times the negative log-likelihood
/// of every known grid. Test examples contribute only their inputs.
pub fn evaluate(task: &Task, output: &ModelOutput, step: usize) -> Result<Objective> {
    let device = output.logits.device();
    let logits = with_background(&output.logits)?;
    let log_probs = log_softmax(&logits, 1)?;

    let mut total_kl = Tensor::zeros((), DType::F32, device)?;
    for (_, kl) in output.kl_terms.iter() {
        total_kl = (total_kl + kl.sum_all()?)?;
    }

    let mut reconstruction_error = Tensor::zeros((), DType::F32, device)?;
    for example in 0..task.n_examples {
        for mode in 0..2 {
            if example >= task.n_train && mode == OUTPUT_MODE {
                continue;
            }
            let logprob = grid_logprob(task, &log_probs, output, example, mode, step)?;
            reconstruction_error = (reconstruction_error - logprob)?;
        }
    }

    let loss = (&total_kl + reconstruction_error.affine(RECONSTRUCTION_WEIGHT, 0.0)?)?;
    Ok(Objective { logits, total_kl, reconstruction_error, loss })
}
