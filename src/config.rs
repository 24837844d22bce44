use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::multitensor::{Axis, Signature};

/// Widths of the compressor network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub n_layers: usize,
    pub share_up_dim: usize,
    pub share_down_dim: usize,
    pub decoding_dim: usize,
    pub softmax_dim: usize,
    pub cummax_dim: usize,
    pub shift_dim: usize,
    pub nonlinear_dim: usize,
    /// Residual width for signatures without a direction axis.
    pub channel_dim: usize,
    /// Residual width for signatures with a direction axis.
    pub direction_channel_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_layers: 4,
            share_up_dim: 16,
            share_down_dim: 8,
            decoding_dim: 4,
            softmax_dim: 2,
            cummax_dim: 4,
            shift_dim: 4,
            nonlinear_dim: 16,
            channel_dim: 16,
            direction_channel_dim: 8,
        }
    }
}

impl ModelConfig {
    pub fn channel_width(&self, sig: Signature) -> usize {
        if sig.has(Axis::Direction) {
            self.direction_channel_dim
        } else {
            self.channel_dim
        }
    }
}

/// Optimizer and loop settings for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    pub n_iterations: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub seed: u64,
    /// Keep the global and local capacity adjustments at zero.
    pub freeze_capacity: bool,
    /// Emit an `info` event every this many steps.
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_iterations: 2000,
            learning_rate: 0.01,
            beta1: 0.5,
            beta2: 0.9,
            eps: 1e-8,
            seed: 0,
            freeze_capacity: false,
            log_every: 100,
        }
    }
}

/// Loads and stores a JSON config file, creating it with defaults when missing.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load<T: Serialize + DeserializeOwned + Default>(&self) -> Result<T> {
        if !self.path.exists() {
            let default = T::default();
            self.save(&default)?;
            return Ok(default);
        }
        load_json(&self.path)
    }

    pub fn save<T: Serialize>(&self, config: &T) -> Result<()> {
        save_json(&self.path, config)
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

pub fn save_json<T: Serialize>(path: &Path, config: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}
