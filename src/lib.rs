//! ARC Compressor
//!
//! Per-task compression model for ARC puzzles:
//! - Signature registry and multitensor dispatch
//! - Layer library (sharing, softmax, cumulative scans, reversal)
//! - Variational channel with closed-form KL
//! - Position-marginalized training objective

pub mod config;
pub mod layers;
pub mod model;
pub mod multitensor;
pub mod noise;
pub mod task;
pub mod telemetry;
pub mod train;

// Re-exports for convenience
pub use config::{ConfigManager, ModelConfig, TrainConfig};
pub use model::{ArcCompressor, ModelOutput};
pub use multitensor::{Axis, MultiTensor, Signature, SignatureRegistry};
pub use noise::NoiseSource;
pub use task::{Task, TaskError};
pub use train::{HistoryLogger, StepLogger, StepRecord, TracingLogger, Trainer};
