use std::sync::Arc;

use candle_core::Result;
use tracing::debug;

use super::{Axis, MultiTensor, Signature};
use crate::task::Task;

/// Length of the direction axis: two directions times two spatial axis kinds.
pub const N_DIRECTIONS: usize = 4;

/// The fixed, ordered set of signatures used for one task, with shape metadata.
#[derive(Debug)]
pub struct SignatureRegistry {
    task: Arc<Task>,
    signatures: Vec<Signature>,
}

impl SignatureRegistry {
    pub fn new(task: Arc<Task>) -> Arc<Self> {
        let signatures: Vec<Signature> = (0u8..32)
            .map(|bits| {
                let mut flags = [0u8; 5];
                for (i, flag) in flags.iter_mut().enumerate() {
                    *flag = (bits >> (4 - i)) & 1;
                }
                Signature::new(flags)
            })
            .filter(|sig| Self::is_valid(sig, &task))
            .collect();
        debug!(count = signatures.len(), "signature registry built");
        Arc::new(Self { task, signatures })
    }

    /// Registry membership rule for a signature given the task's structure.
    pub fn is_valid(sig: &Signature, task: &Task) -> bool {
        let spatial = sig.has(Axis::X) || sig.has(Axis::Y);
        if sig.has(Axis::Direction) && !spatial {
            return false;
        }
        if spatial && !sig.has(Axis::Example) && !task.uniform_grid_size() {
            return false;
        }
        true
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Signatures in their stable iteration order.
    pub fn iter(&self) -> impl Iterator<Item = Signature> + '_ {
        self.signatures.iter().copied()
    }

    pub fn contains(&self, sig: &Signature) -> bool {
        self.index_of(sig).is_some()
    }

    pub fn index_of(&self, sig: &Signature) -> Option<usize> {
        self.signatures.iter().position(|s| s == sig)
    }

    pub fn axis_length(&self, axis: Axis) -> usize {
        match axis {
            Axis::Example => self.task.n_examples,
            Axis::Color => self.task.n_colors,
            Axis::Direction => N_DIRECTIONS,
            Axis::X => self.task.n_x,
            Axis::Y => self.task.n_y,
        }
    }

    /// Tensor shape for `sig` with a trailing feature axis of `width`.
    pub fn shape(&self, sig: Signature, width: usize) -> Vec<usize> {
        let mut shape: Vec<usize> = Axis::ALL
            .iter()
            .filter(|&&axis| sig.has(axis))
            .map(|&axis| self.axis_length(axis))
            .collect();
        shape.push(width);
        shape
    }

    /// Builds a collection by calling `f` once per registered signature.
    pub fn build<T, F>(self: &Arc<Self>, mut f: F) -> Result<MultiTensor<T>>
    where
        F: FnMut(Signature) -> Result<T>,
    {
        let values = self.iter().map(&mut f).collect::<Result<Vec<T>>>()?;
        Ok(MultiTensor::from_parts(self.clone(), values))
    }

    /// A collection holding `value` for every registered signature.
    pub fn filled<T: Clone>(self: &Arc<Self>, value: T) -> MultiTensor<T> {
        MultiTensor::from_parts(self.clone(), vec![value; self.len()])
    }
}
