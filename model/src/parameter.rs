use std::collections::{BTreeMap, btree_map};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{ModelErr, Result};

/// A single named parameter of a model.
pub type Tensor = ArrayD<f32>;

/// An ordered mapping from parameter name to tensor.
///
/// Represents either a full model state or the element-wise difference
/// between two states of the same architecture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterDict(BTreeMap<String, Tensor>);

impl ParameterDict {
    /// Creates a new empty `ParameterDict`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a named tensor, returning the previous one if present.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, Tensor> {
        self.0.iter_mut()
    }

    /// Returns the total amount of scalar elements across every tensor.
    pub fn numel(&self) -> usize {
        self.0.values().map(Tensor::len).sum()
    }

    /// Returns the amount of non-zero elements across every tensor.
    pub fn count_nonzero(&self) -> usize {
        self.0
            .values()
            .map(|t| t.iter().filter(|x| **x != 0.0).count())
            .sum()
    }

    /// Creates a parameter set with the same keys and shapes, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        self.0
            .iter()
            .map(|(name, t)| (name.clone(), Tensor::zeros(t.raw_dim())))
            .collect()
    }

    /// Computes `updated - self` element-wise.
    ///
    /// # Arguments
    /// * `updated` - The newer parameter set.
    ///
    /// # Returns
    /// The difference or an error if the key sets or shapes don't match.
    pub fn diff(&self, updated: &Self) -> Result<Self> {
        self.check_compatible(updated)?;

        let diff = self
            .0
            .iter()
            .zip(updated.0.values())
            .map(|((name, base), new)| (name.clone(), new - base))
            .collect();

        Ok(diff)
    }

    /// Computes `self + diff` element-wise.
    ///
    /// # Arguments
    /// * `diff` - A difference previously produced by `diff`.
    ///
    /// # Returns
    /// The updated parameter set or an error if the key sets or shapes don't match.
    pub fn apply(&self, diff: &Self) -> Result<Self> {
        let mut out = self.clone();
        out.scaled_add(1.0, diff)?;
        Ok(out)
    }

    /// Performs `self += alpha * other` element-wise.
    pub fn scaled_add(&mut self, alpha: f32, other: &Self) -> Result<()> {
        self.check_compatible(other)?;

        self.0
            .values_mut()
            .zip(other.0.values())
            .for_each(|(acc, x)| acc.scaled_add(alpha, x));

        Ok(())
    }

    /// Computes `Σ(wᵢ·pᵢ) / Σwᵢ` element-wise.
    ///
    /// The entries are accumulated in iteration order, callers that need a
    /// reproducible result must iterate in a stable order.
    ///
    /// # Arguments
    /// * `entries` - Pairs of weight and parameter set.
    ///
    /// # Returns
    /// The weighted mean or an error if `entries` is empty, the weights sum
    /// to zero or the parameter sets are incompatible.
    pub fn weighted_mean<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (f64, &'a ParameterDict)>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        let (_, first) = entries.first().ok_or(ModelErr::Empty)?;

        let total: f64 = entries.iter().map(|(w, _)| w).sum();
        if total <= 0.0 {
            return Err(ModelErr::ZeroWeight);
        }

        let mut acc = first.zeros_like();
        for (weight, params) in &entries {
            acc.scaled_add((weight / total) as f32, params)?;
        }

        Ok(acc)
    }

    /// Checks whether both parameter sets are equal within `eps` element-wise.
    pub fn approx_eq(&self, other: &Self, eps: f32) -> bool {
        self.check_compatible(other).is_ok()
            && self
                .0
                .values()
                .zip(other.0.values())
                .all(|(a, b)| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= eps))
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if let Some(name) = self.0.keys().find(|k| !other.0.contains_key(*k)) {
            return Err(ModelErr::KeyMismatch { name: name.clone() });
        }

        if let Some(name) = other.0.keys().find(|k| !self.0.contains_key(*k)) {
            return Err(ModelErr::KeyMismatch { name: name.clone() });
        }

        for ((name, a), b) in self.0.iter().zip(other.0.values()) {
            if a.shape() != b.shape() {
                return Err(ModelErr::ShapeMismatch {
                    name: name.clone(),
                    got: b.shape().to_vec(),
                    expected: a.shape().to_vec(),
                });
            }
        }

        Ok(())
    }
}

impl FromIterator<(String, Tensor)> for ParameterDict {
    fn from_iter<T: IntoIterator<Item = (String, Tensor)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ParameterDict {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterDict {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
