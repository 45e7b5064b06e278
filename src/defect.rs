// src/defect.rs
// NUCLEOTIDE DEFECT VECTORS
// Sparse (index, value) contributions to an ensemble defect. Indices refer
// to whatever coordinate system the producer used (complex positions or
// underlying design variables); reduce() merges duplicates after projection.

use rand::Rng;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Defect {
    pub contributions: Vec<(usize, f64)>,
}

impl Defect {
    pub fn new(contributions: Vec<(usize, f64)>) -> Self {
        Defect { contributions }
    }

    /// Build from a dense vector, dropping zeros and dividing by
    /// `normalization`.
    pub fn from_dense(values: &[f64], normalization: f64) -> Self {
        let contributions = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(i, &v)| (i, v / normalization))
            .collect();
        Defect { contributions }
    }

    pub fn total(&self) -> f64 {
        self.contributions.iter().map(|&(_, v)| v).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    pub fn scaled(&self, weight: f64) -> Defect {
        Defect {
            contributions: self
                .contributions
                .iter()
                .map(|&(i, v)| (i, v * weight))
                .collect(),
        }
    }

    /// Apply per-contribution weights; lengths must agree.
    pub fn weighted(&self, weights: &[f64]) -> Defect {
        assert_eq!(
            weights.len(),
            self.contributions.len(),
            "can only apply weights elementwise"
        );
        Defect {
            contributions: self
                .contributions
                .iter()
                .zip(weights)
                .map(|(&(i, v), &w)| (i, v * w))
                .collect(),
        }
    }

    /// Merge contributions sharing an index; the total is unchanged.
    pub fn reduced(&self) -> Defect {
        let mut merged: std::collections::BTreeMap<usize, f64> = Default::default();
        for &(i, v) in &self.contributions {
            *merged.entry(i).or_insert(0.0) += v;
        }
        Defect {
            contributions: merged.into_iter().collect(),
        }
    }

    /// Merge another defect into this one (same coordinate system).
    pub fn merge(&mut self, other: &Defect) {
        self.contributions.extend_from_slice(&other.contributions);
        *self = self.reduced();
    }

    /// Sample up to `num` indices proportional to their contribution,
    /// without replacement. Asking for more than exist returns them all.
    pub fn sample_nucleotides<R: Rng + ?Sized>(&self, num: usize, rng: &mut R) -> Vec<usize> {
        if num >= self.contributions.len() {
            return self.contributions.iter().map(|&(i, _)| i).collect();
        }
        let mut distribution = self.contributions.clone();
        let mut sampled = Vec::with_capacity(num);
        for _ in 0..num {
            // Re-sum each draw so removal does not accumulate rounding error.
            let total: f64 = distribution.iter().map(|&(_, v)| v).sum();
            if total <= 0.0 {
                break;
            }
            let stop = rng.gen::<f64>() * total;
            let mut acc = 0.0;
            let mut chosen = distribution.len() - 1;
            for (k, &(_, v)) in distribution.iter().enumerate() {
                acc += v;
                if acc >= stop {
                    chosen = k;
                    break;
                }
            }
            sampled.push(distribution.remove(chosen).0);
        }
        sampled
    }
}

/// Per-nucleotide complex ensemble defect: 1 - P(i, s[i]) against the
/// target pairing (s[i] == i for unpaired).
pub fn nucleotide_defects(pp: &[Vec<f64>], target: &crate::structure::PairList) -> Vec<f64> {
    (0..target.len())
        .map(|i| 1.0 - pp[i][target.partner(i)])
        .collect()
}
