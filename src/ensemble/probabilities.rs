use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-class probability vector. Index `i` holds the mass for stage `i + 1`.
///
/// Either sums to 1 or is all zeros (no usable evidence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassProbabilities(Vec<f64>);

impl ClassProbabilities {
    pub fn zeros(num_classes: usize) -> Self {
        Self(vec![0.0; num_classes])
    }

    /// Wrap raw values without normalising them.
    pub fn from_raw(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, class: usize) -> f64 {
        self.0.get(class).copied().unwrap_or(0.0)
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    pub fn max(&self) -> f64 {
        self.0.iter().copied().fold(0.0, f64::max)
    }

    pub fn is_zero(&self) -> bool {
        self.sum() <= 0.0
    }

    /// Scale to sum 1. An all-zero vector is left untouched.
    pub fn normalize(&mut self) {
        let total = self.sum();
        if total > 0.0 {
            for p in &mut self.0 {
                *p /= total;
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Index of the largest entry; the lowest index wins ties.
    /// `None` for an empty or all-zero vector.
    pub fn argmax(&self) -> Option<usize> {
        if self.is_zero() {
            return None;
        }
        let mut best: Option<(usize, f64)> = None;
        for (i, &p) in self.0.iter().enumerate() {
            match best {
                Some((_, b)) if p <= b => {}
                _ => best = Some((i, p)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Scores keyed by stage number ("1", "2", ...).
    pub fn to_stage_map(&self) -> BTreeMap<String, f64> {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &p)| ((i + 1).to_string(), p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sums_to_one() {
        let p = ClassProbabilities::from_raw(vec![1.0, 3.0, 0.0, 4.0]).normalized();
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!((p.get(3) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_leaves_zero_vector() {
        let p = ClassProbabilities::zeros(5).normalized();
        assert_eq!(p.sum(), 0.0);
        assert!(p.is_zero());
    }

    #[test]
    fn test_argmax_tie_prefers_lowest_index() {
        let p = ClassProbabilities::from_raw(vec![0.1, 0.4, 0.1, 0.4]);
        assert_eq!(p.argmax(), Some(1));
    }

    #[test]
    fn test_argmax_zero_vector_is_none() {
        assert_eq!(ClassProbabilities::zeros(3).argmax(), None);
        assert_eq!(ClassProbabilities::zeros(0).argmax(), None);
    }

    #[test]
    fn test_get_out_of_range_is_zero() {
        let p = ClassProbabilities::from_raw(vec![1.0]);
        assert_eq!(p.get(7), 0.0);
    }

    #[test]
    fn test_stage_map_is_one_based() {
        let p = ClassProbabilities::from_raw(vec![0.25, 0.75]);
        let map = p.to_stage_map();
        assert_eq!(map.get("1"), Some(&0.25));
        assert_eq!(map.get("2"), Some(&0.75));
        assert!(!map.contains_key("0"));
    }
}
