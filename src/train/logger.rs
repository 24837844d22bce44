//! Per-step observers.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Everything a step produced, detached from the autodiff graph.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: usize,
    /// `[example, color + 1, x, y, mode]`, background first.
    pub logits: Tensor,
    pub x_mask: Tensor,
    pub y_mask: Tensor,
    /// Per-signature KL tensors keyed by the signature's display name.
    pub kl_terms: Vec<(String, Tensor)>,
    pub total_kl: f32,
    pub reconstruction_error: f32,
    pub loss: f32,
}

impl StepRecord {
    pub fn summary(&self) -> StepSummary {
        StepSummary {
            step: self.step,
            total_kl: self.total_kl,
            reconstruction_error: self.reconstruction_error,
            loss: self.loss,
        }
    }
}

/// Scalar view of a step, cheap to keep for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub total_kl: f32,
    pub reconstruction_error: f32,
    pub loss: f32,
}

pub trait StepLogger {
    fn log(&mut self, record: &StepRecord) -> anyhow::Result<()>;
}

/// Emits every step at `debug` and every `every`-th step at `info`.
pub struct TracingLogger {
    every: usize,
}

impl TracingLogger {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }
}

impl StepLogger for TracingLogger {
    fn log(&mut self, record: &StepRecord) -> anyhow::Result<()> {
        debug!(
            step = record.step,
            total_kl = record.total_kl,
            reconstruction_error = record.reconstruction_error,
            loss = record.loss,
            "step"
        );
        if record.step % self.every == 0 {
            info!(
                "step {}: loss {:.3} (kl {:.3}, reconstruction {:.3})",
                record.step, record.loss, record.total_kl, record.reconstruction_error
            );
        }
        Ok(())
    }
}

/// Keeps the scalar history of a run.
#[derive(Debug, Default)]
pub struct HistoryLogger {
    pub history: Vec<StepSummary>,
}

impl HistoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.history)?)
    }
}

impl StepLogger for HistoryLogger {
    fn log(&mut self, record: &StepRecord) -> anyhow::Result<()> {
        self.history.push(record.summary());
        Ok(())
    }
}
