//! Gradient ledger for adapter weights.

use crate::error::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use std::collections::HashMap;

/// Accumulated gradients keyed by adapter variable.
///
/// Each per-layer replay produces a fresh [`GradStore`] that only covers the
/// adapters of that layer. The ledger sums those contributions until
/// [`AdapterGrads::clear`] is called.
#[derive(Debug, Default, Clone)]
pub struct AdapterGrads {
    grads: HashMap<TensorId, Tensor>,
}

impl AdapterGrads {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every gradient `store` holds for `vars`. Returns how many were found.
    pub fn accumulate<'a>(
        &mut self,
        vars: impl IntoIterator<Item = &'a Var>,
        store: &GradStore,
    ) -> Result<usize> {
        let mut found = 0;
        for var in vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            found += 1;
            let grad = grad.detach();
            let summed = match self.grads.remove(&var.id()) {
                Some(prev) => prev.add(&grad)?,
                None => grad,
            };
            self.grads.insert(var.id(), summed);
        }
        Ok(found)
    }

    /// Add every gradient of `other` into this ledger.
    pub fn merge(&mut self, other: &AdapterGrads) -> Result<()> {
        for (id, grad) in &other.grads {
            let summed = match self.grads.remove(id) {
                Some(prev) => prev.add(grad)?,
                None => grad.clone(),
            };
            self.grads.insert(*id, summed);
        }
        Ok(())
    }

    /// Iterate over accumulated gradients.
    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Tensor)> {
        self.grads.iter()
    }

    /// Accumulated gradient for `var`.
    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.grads.get(&var.id())
    }

    /// Forget every accumulated gradient.
    pub fn clear(&mut self) {
        self.grads.clear();
    }

    /// Number of variables with a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// True if nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn accumulates_across_stores() {
        let w = Var::ones(3, DType::F32, &Device::Cpu).unwrap();
        let x = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let mut ledger = AdapterGrads::new();

        for _ in 0..2 {
            let loss = w.as_tensor().mul(&x).unwrap().sum_all().unwrap();
            let store = loss.backward().unwrap();
            assert_eq!(ledger.accumulate([&w], &store).unwrap(), 1);
        }

        let grad: Vec<f32> = ledger.get(&w).unwrap().to_vec1().unwrap();
        assert_eq!(grad, vec![2.0, 4.0, 6.0]);

        ledger.clear();
        assert!(ledger.is_empty());
    }

    #[test]
    fn merge_sums_ledgers() {
        let w = Var::ones(2, DType::F32, &Device::Cpu).unwrap();
        let v = Var::ones(2, DType::F32, &Device::Cpu).unwrap();
        let store = (w.as_tensor() + v.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();

        let mut total = AdapterGrads::new();
        total.accumulate([&w], &store).unwrap();
        let mut step = AdapterGrads::new();
        step.accumulate([&w, &v], &store).unwrap();

        total.merge(&step).unwrap();
        assert_eq!(total.len(), 2);
        assert_eq!(total.get(&w).unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
        assert_eq!(total.get(&v).unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn skips_untracked_vars() {
        let w = Var::ones(2, DType::F32, &Device::Cpu).unwrap();
        let other = Var::ones(2, DType::F32, &Device::Cpu).unwrap();
        let store = w.as_tensor().sum_all().unwrap().backward().unwrap();

        let mut ledger = AdapterGrads::new();
        assert_eq!(ledger.accumulate([&w, &other], &store).unwrap(), 1);
        assert!(ledger.get(&other).is_none());
        assert_eq!(ledger.len(), 1);
    }
}
