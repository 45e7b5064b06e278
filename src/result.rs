// src/result.rs
// OPTIMIZATION CANDIDATES
// A candidate couples a sequence snapshot with one normalized defect per
// objective (tube) and per-objective weights. Dominance is componentwise on
// defect totals. The four position-sampling policies the optimizer draws
// mutation targets from live here too.

use crate::base::Base;
use crate::defect::Defect;
use crate::tube::TubeEvaluation;
use rand::Rng;

/// Full-depth, all-active evaluation attached lazily to archived
/// candidates; everything a report needs that is not cheap to rebuild.
#[derive(Debug, Clone)]
pub struct FullEvaluation {
    pub log_pfuncs: Vec<f64>,
    pub tube_evaluations: Vec<TubeEvaluation>,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub sequence: Vec<Base>,
    /// One normalized defect per objective, pool coordinates.
    pub defects: Vec<Defect>,
    /// Per-objective multipliers; defaults to 1/n so the weighted total is
    /// the multitube average.
    pub weights: Vec<f64>,
    pub evaluation: Option<FullEvaluation>,
}

impl Candidate {
    pub fn new(sequence: Vec<Base>, defects: Vec<Defect>) -> Self {
        let n = defects.len().max(1);
        Candidate {
            sequence,
            weights: vec![1.0 / n as f64; defects.len()],
            defects,
            evaluation: None,
        }
    }

    /// Worst-possible placeholder; anything real dominates it.
    pub fn unevaluated(n_objectives: usize) -> Self {
        Candidate {
            sequence: Vec::new(),
            defects: vec![Defect::new(vec![(0, f64::INFINITY)]); n_objectives],
            weights: vec![1.0 / n_objectives.max(1) as f64; n_objectives],
            evaluation: None,
        }
    }

    pub fn totals(&self) -> Vec<f64> {
        self.defects.iter().map(|d| d.total()).collect()
    }

    pub fn total(&self) -> f64 {
        self.defects.iter().map(|d| d.total()).sum()
    }

    /// The design defect: weighted (multitube-averaged) total.
    pub fn weighted_total(&self) -> f64 {
        self.defects
            .iter()
            .zip(&self.weights)
            .map(|(d, &w)| d.total() * w)
            .sum()
    }

    pub fn weighted_defects(&self) -> Vec<Defect> {
        self.defects
            .iter()
            .zip(&self.weights)
            .map(|(d, &w)| d.scaled(w))
            .collect()
    }

    /// Componentwise <= with at least one strict <.
    pub fn dominates(&self, other: &Candidate) -> bool {
        debug_assert_eq!(self.defects.len(), other.defects.len());
        let mine = self.totals();
        let theirs = other.totals();
        let mut strict = false;
        for (a, b) in mine.iter().zip(&theirs) {
            if a > b {
                return false;
            }
            if a < b {
                strict = true;
            }
        }
        strict
    }

    pub fn same_totals(&self, other: &Candidate) -> bool {
        self.totals() == other.totals()
    }
}

/// How mutation positions are drawn from the defect contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Contributions of the first objective only.
    FirstDefect,
    /// Pick an objective by weighted total, then positions from it.
    StochasticHierarchical,
    /// Sum weighted objectives, then sample the combined contributions.
    Scalarized,
    /// Ignore defects entirely.
    Uniform,
}

impl Default for SamplingMode {
    fn default() -> Self {
        SamplingMode::StochasticHierarchical
    }
}

/// Sample up to `num` variable pool positions to mutate. Positions outside
/// `variables` never come back: mutating a fixed base cannot succeed.
pub fn sample_positions<R: Rng + ?Sized>(
    mode: SamplingMode,
    candidate: &Candidate,
    variables: &[usize],
    num: usize,
    rng: &mut R,
) -> Vec<usize> {
    let restrict = |d: &Defect| -> Defect {
        Defect::new(
            d.contributions
                .iter()
                .filter(|(i, _)| variables.binary_search(i).is_ok())
                .copied()
                .collect(),
        )
        .reduced()
    };

    match mode {
        SamplingMode::FirstDefect => match candidate.defects.first() {
            Some(d) => restrict(d).sample_nucleotides(num, rng),
            None => Vec::new(),
        },
        SamplingMode::StochasticHierarchical => {
            let totals: Vec<f64> = candidate
                .weighted_defects()
                .iter()
                .map(|d| d.total())
                .collect();
            let sum: f64 = totals.iter().sum();
            if sum <= 0.0 {
                return sample_uniform(variables, num, rng);
            }
            let stop = rng.gen::<f64>() * sum;
            let mut acc = 0.0;
            let mut pick = candidate.defects.len() - 1;
            for (i, &t) in totals.iter().enumerate() {
                acc += t;
                if acc >= stop {
                    pick = i;
                    break;
                }
            }
            restrict(&candidate.defects[pick]).sample_nucleotides(num, rng)
        }
        SamplingMode::Scalarized => {
            let mut combined = Defect::default();
            for d in candidate.weighted_defects() {
                combined.merge(&d);
            }
            restrict(&combined).sample_nucleotides(num, rng)
        }
        SamplingMode::Uniform => sample_uniform(variables, num, rng),
    }
}

/// Uniform draw without replacement over the variable positions.
fn sample_uniform<R: Rng + ?Sized>(variables: &[usize], num: usize, rng: &mut R) -> Vec<usize> {
    let mut choices = variables.to_vec();
    let mut out = Vec::with_capacity(num.min(choices.len()));
    while out.len() < num && !choices.is_empty() {
        let k = rng.gen_range(0..choices.len());
        out.push(choices.swap_remove(k));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(totals: &[f64]) -> Candidate {
        Candidate::new(
            Vec::new(),
            totals
                .iter()
                .map(|&t| Defect::new(vec![(0, t)]))
                .collect(),
        )
    }

    #[test]
    fn dominance_is_strict_somewhere() {
        assert!(candidate(&[0.1, 0.2]).dominates(&candidate(&[0.2, 0.2])));
        assert!(!candidate(&[0.2, 0.2]).dominates(&candidate(&[0.2, 0.2])));
        assert!(!candidate(&[0.1, 0.3]).dominates(&candidate(&[0.2, 0.2])));
    }

    #[test]
    fn weighted_total_is_multitube_average() {
        let c = candidate(&[0.2, 0.4]);
        assert!((c.weighted_total() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn unevaluated_loses_to_everything() {
        let real = candidate(&[0.5, 0.5]);
        assert!(real.dominates(&Candidate::unevaluated(2)));
    }

    #[test]
    fn sampling_respects_variable_set() {
        let c = Candidate::new(
            Vec::new(),
            vec![Defect::new(vec![(0, 5.0), (3, 5.0), (7, 5.0)])],
        );
        let mut rng = StdRng::seed_from_u64(17);
        for mode in [
            SamplingMode::FirstDefect,
            SamplingMode::StochasticHierarchical,
            SamplingMode::Scalarized,
            SamplingMode::Uniform,
        ] {
            for _ in 0..10 {
                let picks = sample_positions(mode, &c, &[3, 7], 2, &mut rng);
                assert!(picks.iter().all(|p| *p == 3 || *p == 7), "{:?}", mode);
            }
        }
    }

    #[test]
    fn hierarchical_prefers_heavy_objective() {
        let c = Candidate::new(
            Vec::new(),
            vec![
                Defect::new(vec![(1, 0.001)]),
                Defect::new(vec![(2, 10.0)]),
            ],
        );
        let mut rng = StdRng::seed_from_u64(19);
        let mut hits = 0;
        for _ in 0..100 {
            let picks =
                sample_positions(SamplingMode::StochasticHierarchical, &c, &[1, 2], 1, &mut rng);
            if picks == vec![2] {
                hits += 1;
            }
        }
        assert!(hits > 90);
    }
}
