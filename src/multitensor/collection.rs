use std::sync::Arc;

use candle_core::{bail, Result};

use super::{Signature, SignatureRegistry};

/// One value per registered signature, aligned with the registry's order.
///
/// Every operation that produces a new collection goes through the registry
/// iteration order, so call order across signatures is deterministic.
#[derive(Debug, Clone)]
pub struct MultiTensor<T> {
    registry: Arc<SignatureRegistry>,
    values: Vec<T>,
}

impl<T> MultiTensor<T> {
    pub(crate) fn from_parts(registry: Arc<SignatureRegistry>, values: Vec<T>) -> Self {
        debug_assert_eq!(registry.len(), values.len());
        Self { registry, values }
    }

    pub fn registry(&self) -> &Arc<SignatureRegistry> {
        &self.registry
    }

    pub fn get(&self, sig: Signature) -> Option<&T> {
        self.registry.index_of(&sig).map(|i| &self.values[i])
    }

    /// Like `get`, but a missing signature is an error.
    pub fn require(&self, sig: Signature) -> Result<&T> {
        match self.get(sig) {
            Some(value) => Ok(value),
            None => bail!("signature {} is not registered", sig),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Signature, &T)> + '_ {
        self.registry.iter().zip(self.values.iter())
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    fn check_aligned<U>(&self, other: &MultiTensor<U>) -> Result<()> {
        if !Arc::ptr_eq(&self.registry, &other.registry) {
            bail!("multitensors belong to different signature registries");
        }
        Ok(())
    }

    /// Applies `f` independently to every signature.
    pub fn map<U, F>(&self, mut f: F) -> Result<MultiTensor<U>>
    where
        F: FnMut(Signature, &T) -> Result<U>,
    {
        let values = self
            .iter()
            .map(|(sig, v)| f(sig, v))
            .collect::<Result<Vec<U>>>()?;
        Ok(MultiTensor::from_parts(self.registry.clone(), values))
    }

    /// Applies `f` to aligned entries of two collections.
    pub fn zip_with<U, V, F>(&self, other: &MultiTensor<U>, mut f: F) -> Result<MultiTensor<V>>
    where
        F: FnMut(Signature, &T, &U) -> Result<V>,
    {
        self.check_aligned(other)?;
        let values = self
            .iter()
            .zip(other.values.iter())
            .map(|((sig, a), b)| f(sig, a, b))
            .collect::<Result<Vec<V>>>()?;
        Ok(MultiTensor::from_parts(self.registry.clone(), values))
    }

    /// Applies `f` to aligned entries of three collections.
    pub fn zip3_with<U, V, W, F>(
        &self,
        second: &MultiTensor<U>,
        third: &MultiTensor<V>,
        mut f: F,
    ) -> Result<MultiTensor<W>>
    where
        F: FnMut(Signature, &T, &U, &V) -> Result<W>,
    {
        self.check_aligned(second)?;
        self.check_aligned(third)?;
        let values = self
            .iter()
            .zip(second.values.iter().zip(third.values.iter()))
            .map(|((sig, a), (b, c))| f(sig, a, b, c))
            .collect::<Result<Vec<W>>>()?;
        Ok(MultiTensor::from_parts(self.registry.clone(), values))
    }

    /// Like `map`, but `f` also returns a side payload; payloads are collected
    /// in registry order alongside their signature.
    pub fn map_with_payload<U, S, F>(&self, mut f: F) -> Result<(MultiTensor<U>, Vec<(Signature, S)>)>
    where
        F: FnMut(Signature, &T) -> Result<(U, S)>,
    {
        let mut values = Vec::with_capacity(self.values.len());
        let mut payloads = Vec::with_capacity(self.values.len());
        for (sig, v) in self.iter() {
            let (value, payload) = f(sig, v)?;
            values.push(value);
            payloads.push((sig, payload));
        }
        Ok((MultiTensor::from_parts(self.registry.clone(), values), payloads))
    }
}

impl<T: Clone> MultiTensor<T> {
    /// Applies `f` only to the `allowed` signatures; every other entry is
    /// passed through unchanged.
    pub fn map_only<F>(&self, allowed: &[Signature], mut f: F) -> Result<MultiTensor<T>>
    where
        F: FnMut(Signature, &T) -> Result<T>,
    {
        self.map(|sig, v| {
            if allowed.contains(&sig) {
                f(sig, v)
            } else {
                Ok(v.clone())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn registry() -> Arc<SignatureRegistry> {
        let grid = vec![vec![1u8; 2]; 2];
        SignatureRegistry::new(Arc::new(Task::from_examples(&[(grid.clone(), grid)], &[]).unwrap()))
    }

    #[test]
    fn test_map_preserves_keys() {
        let registry = registry();
        let ranks = registry.build(|sig| Ok(sig.rank())).unwrap();
        let doubled = ranks.map(|_, r| Ok(r * 2)).unwrap();
        for (sig, v) in doubled.iter() {
            assert_eq!(*v, sig.rank() * 2);
        }
        assert_eq!(doubled.values().len(), registry.len());
    }

    #[test]
    fn test_zip_rejects_foreign_registry() {
        let a = registry().filled(1u32);
        let b = registry().filled(2u32);
        assert!(a.zip_with(&b, |_, x, y| Ok(x + y)).is_err());
        let c = a.registry().filled(5u32);
        let sum = a.zip_with(&c, |_, x, y| Ok(x + y)).unwrap();
        assert!(sum.values().iter().all(|&v| v == 6));
    }

    #[test]
    fn test_map_only_passes_through() {
        let registry = registry();
        let only = Signature::new([1, 1, 1, 1, 1]);
        let values = registry.filled(0i32);
        let out = values.map_only(&[only], |_, v| Ok(v + 7)).unwrap();
        for (sig, v) in out.iter() {
            assert_eq!(*v, if sig == only { 7 } else { 0 });
        }
    }

    #[test]
    fn test_payloads_follow_registry_order() {
        let registry = registry();
        let values = registry.filled(1.0f32);
        let (out, payloads) = values
            .map_with_payload(|sig, v| Ok((*v, sig.to_string())))
            .unwrap();
        let order: Vec<_> = registry.iter().map(|s| s.to_string()).collect();
        let seen: Vec<_> = payloads.iter().map(|(_, name)| name.clone()).collect();
        assert_eq!(order, seen);
        assert!(out.get(Signature::new([0, 0, 0, 0, 0])).is_some());
    }
}
