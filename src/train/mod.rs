//! Training Loop
//!
//! One step runs the compressor forward, scores it with the objective, and
//! applies one Adam update to every trainable parameter.

pub mod logger;
pub mod objective;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::info;

use crate::config::TrainConfig;
use crate::model::ArcCompressor;
pub use logger::{HistoryLogger, StepLogger, StepRecord, StepSummary, TracingLogger};
pub use objective::{evaluate, log_sum_exp, mask_select_logprobs, Objective};

pub struct Trainer {
    model: ArcCompressor,
    optimizer: AdamW,
    config: TrainConfig,
    step: usize,
}

impl Trainer {
    pub fn new(model: ArcCompressor, config: TrainConfig) -> anyhow::Result<Self> {
        // zero weight decay: plain Adam
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(model.trainable_vars(!config.freeze_capacity)?, params)?;
        Ok(Self { model, optimizer, config, step: 0 })
    }

    pub fn model(&self) -> &ArcCompressor {
        &self.model
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Forward, loss, one optimizer update, then hands the step to `logger`.
    pub fn take_step(&mut self, logger: &mut dyn StepLogger) -> anyhow::Result<StepRecord> {
        let output = self.model.forward()?;
        let objective = evaluate(self.model.task(), &output, self.step)?;

        let grads = objective.loss.backward()?;
        self.optimizer.step(&grads)?;

        let record = StepRecord {
            step: self.step,
            logits: objective.logits.detach(),
            x_mask: output.x_mask.detach(),
            y_mask: output.y_mask.detach(),
            kl_terms: output.kl_terms.iter().map(|(sig, kl)| (sig.to_string(), kl.detach())).collect(),
            total_kl: scalar(&objective.total_kl)?,
            reconstruction_error: scalar(&objective.reconstruction_error)?,
            loss: scalar(&objective.loss)?,
        };
        logger.log(&record)?;
        self.step += 1;
        Ok(record)
    }

    /// Runs `n` more steps.
    pub fn run(&mut self, n: usize, logger: &mut dyn StepLogger) -> anyhow::Result<Option<StepSummary>> {
        let mut last = None;
        for _ in 0..n {
            last = Some(self.take_step(logger)?.summary());
        }
        if let Some(summary) = last {
            info!(
                "finished {} steps: loss {:.3} (kl {:.3}, reconstruction {:.3})",
                self.step, summary.loss, summary.total_kl, summary.reconstruction_error
            );
        }
        Ok(last)
    }
}

fn scalar(t: &Tensor) -> candle_core::Result<f32> {
    t.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::noise::NoiseSource;
    use crate::task::Task;
    use candle_core::Device;
    use std::sync::Arc;

    fn trainer(freeze_capacity: bool) -> Trainer {
        let grid = vec![vec![1u8, 0], vec![0, 1]];
        let task = Arc::new(Task::from_examples(&[(grid.clone(), grid.clone())], &[grid]).unwrap());
        let config = ModelConfig { n_layers: 1, ..Default::default() };
        let model = ArcCompressor::new(task, &config, NoiseSource::seeded(0), &Device::Cpu).unwrap();
        let train = TrainConfig { n_iterations: 3, freeze_capacity, ..Default::default() };
        Trainer::new(model, train).unwrap()
    }

    #[test]
    fn test_take_step_records_consistent_loss() {
        let mut trainer = trainer(false);
        let mut history = HistoryLogger::new();
        let record = trainer.take_step(&mut history).unwrap();
        assert_eq!(record.step, 0);
        assert_eq!(trainer.step(), 1);
        let expected = record.total_kl + 10.0 * record.reconstruction_error;
        assert!((record.loss - expected).abs() <= 1e-3 * expected.abs().max(1.0));
        assert!(record.total_kl > -1e-3);
        assert_eq!(record.kl_terms.len(), trainer.model().registry().len());
        assert_eq!(history.history.len(), 1);
    }

    #[test]
    fn test_run_counts_steps() {
        let mut trainer = trainer(true);
        let mut history = HistoryLogger::new();
        let n = trainer.config().n_iterations;
        let last = trainer.run(n, &mut history).unwrap().unwrap();
        assert_eq!(last.step, 2);
        let steps: Vec<usize> = history.history.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn test_frozen_capacity_stays_zero() {
        let mut trainer = trainer(true);
        let mut history = HistoryLogger::new();
        trainer.run(2, &mut history).unwrap();
        let data = trainer.model().varmap().data().lock().unwrap();
        let mut seen = 0;
        for (name, var) in data.iter().filter(|(name, _)| name.starts_with("capacity.")) {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| *v == 0.0), "{}", name);
            seen += 1;
        }
        assert_eq!(seen, 2 * trainer.model().registry().len());
    }
}
