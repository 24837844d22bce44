//! Trains the compressor on one ARC task file.
//!
//! Usage: `arc_compressor <task.json> [train_config.json] [model_config.json]`
//!
//! Missing config files are created with their defaults.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use arc_compressor::telemetry::init_tracing;
use arc_compressor::{
    ArcCompressor, ConfigManager, ModelConfig, NoiseSource, Task, TracingLogger, TrainConfig, Trainer,
};

// ──────────────────────────────────────────────────────────────────────────────
// CONFIGURATION
// ──────────────────────────────────────────────────────────────────────────────

struct Paths {
    task: PathBuf,
    train_config: PathBuf,
    model_config: PathBuf,
}

impl Paths {
    fn from_args() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let Some(task) = args.next() else {
            bail!("usage: arc_compressor <task.json> [train_config.json] [model_config.json]");
        };
        Ok(Self {
            task: task.into(),
            train_config: args.next().unwrap_or_else(|| "train_config.json".to_string()).into(),
            model_config: args.next().unwrap_or_else(|| "model_config.json".to_string()).into(),
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// MAIN ENTRY POINT
// ──────────────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    init_tracing("arc_compressor=info")?;
    let paths = Paths::from_args()?;

    let train_config: TrainConfig = ConfigManager::new(&paths.train_config).load()?;
    let model_config: ModelConfig = ConfigManager::new(&paths.model_config).load()?;

    let content = std::fs::read_to_string(&paths.task)
        .with_context(|| format!("reading task {}", paths.task.display()))?;
    let task = Arc::new(Task::from_json(&content)?);
    info!(
        "task {}: {} examples ({} train), {} colors, canvas {}x{}",
        paths.task.display(),
        task.n_examples,
        task.n_train,
        task.n_colors,
        task.n_x,
        task.n_y
    );

    let device = Device::Cpu;
    let noise = NoiseSource::seeded(train_config.seed);
    let model = ArcCompressor::new(task, &model_config, noise, &device)?;
    let mut logger = TracingLogger::new(train_config.log_every);
    let mut trainer = Trainer::new(model, train_config)?;
    let n = trainer.config().n_iterations;
    trainer.run(n, &mut logger)?;
    Ok(())
}
