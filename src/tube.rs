// src/tube.rs
// TEST TUBES
// A tube names member complexes with target concentrations (zero for
// off-targets) and evaluates the normalized tube ensemble defect: the
// structural defect of on-targets weighted by min(actual, target)
// concentration plus the concentration deficiency spread over each
// complex's nucleotides, all divided by the tube nucleotide concentration.

use crate::complex::Complex;
use crate::concentration::equilibrate;
use crate::defect::Defect;
use crate::error::DesignError;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};

/// Per-complex, per-position defect weights resolved for one tube.
pub type ComplexWeights = HashMap<usize, Vec<f64>>;

#[derive(Debug, Clone, Copy)]
pub struct TubeTarget {
    pub complex_index: usize,
    /// Molar target concentration; zero marks an off-target member.
    pub target_conc: f64,
}

#[derive(Debug, Clone)]
pub struct Tube {
    pub name: String,
    pub targets: Vec<TubeTarget>,
    /// Sum of target_conc * complex length over on-target members.
    pub nucleotide_concentration: f64,
}

/// Everything a tube evaluation produces, kept for reports.
#[derive(Debug, Clone)]
pub struct TubeEvaluation {
    /// Normalized defect over pool variables.
    pub defect: Defect,
    /// Equilibrium concentration per tube member (aligned with targets).
    pub concentrations: Vec<f64>,
    /// Unnormalized structural defect total.
    pub structural: f64,
    /// Unnormalized concentration defect total.
    pub concentration: f64,
}

impl Tube {
    pub fn new(name: String, targets: Vec<TubeTarget>, complexes: &[Complex]) -> Result<Self> {
        let mut nucleotide_concentration = 0.0;
        for t in &targets {
            let c = complexes.get(t.complex_index).ok_or_else(|| {
                DesignError::InvalidConfiguration(format!(
                    "tube {} references missing complex {}",
                    name, t.complex_index
                ))
            })?;
            if t.target_conc < 0.0 || !t.target_conc.is_finite() {
                return Err(DesignError::InvalidConfiguration(format!(
                    "tube {}: bad target concentration for {}",
                    name, c.name
                ))
                .into());
            }
            if t.target_conc > 0.0 && !c.is_on_target() {
                return Err(DesignError::InvalidConfiguration(format!(
                    "tube {}: complex {} has a target concentration but no structure",
                    name, c.name
                ))
                .into());
            }
            nucleotide_concentration += t.target_conc * c.len() as f64;
        }
        if nucleotide_concentration <= 0.0 {
            return Err(DesignError::InvalidConfiguration(format!(
                "tube {} has no on-target material",
                name
            ))
            .into());
        }
        Ok(Tube {
            name,
            targets,
            nucleotide_concentration,
        })
    }

    /// Strand names occurring in member complexes, sorted and unique.
    fn strand_universe(&self, complexes: &[Complex]) -> Vec<String> {
        let mut names: Vec<String> = self
            .targets
            .iter()
            .flat_map(|t| complexes[t.complex_index].strand_names.iter().cloned())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Equilibrium concentrations of the members (molar), from the given
    /// per-complex log partition functions. Complexes using a strand with
    /// no on-target inventory are held at zero.
    pub fn concentrations(&self, log_pfuncs: &[f64], complexes: &[Complex]) -> Result<Vec<f64>> {
        let universe = self.strand_universe(complexes);
        let strand_pos: BTreeMap<&str, usize> = universe
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        // Strand inventory implied by the on-target concentrations.
        let mut inventory = vec![0.0; universe.len()];
        let mut rows = Vec::with_capacity(self.targets.len());
        for t in &self.targets {
            let c = &complexes[t.complex_index];
            let mut row = vec![0.0; universe.len()];
            for s in &c.strand_names {
                row[strand_pos[s.as_str()]] += 1.0;
            }
            for (s, &count) in row.iter().enumerate() {
                inventory[s] += t.target_conc * count;
            }
            rows.push(row);
        }

        // Drop empty strand columns; complexes needing them are absent.
        let kept: Vec<usize> = (0..universe.len())
            .filter(|&s| inventory[s] > 0.0)
            .collect();
        let mut log_q = Vec::with_capacity(self.targets.len());
        let mut compositions = Vec::with_capacity(self.targets.len());
        for (t, row) in self.targets.iter().zip(&rows) {
            let uses_empty = (0..universe.len()).any(|s| row[s] > 0.0 && inventory[s] <= 0.0);
            log_q.push(if uses_empty {
                f64::NEG_INFINITY
            } else {
                log_pfuncs[t.complex_index]
            });
            compositions.push(kept.iter().map(|&s| row[s]).collect::<Vec<f64>>());
        }
        let b: Vec<f64> = kept.iter().map(|&s| inventory[s]).collect();

        equilibrate(&compositions, &log_q, &b).with_context(|| format!("tube {}", self.name))
    }

    /// Fraction of the tube's nucleotides each member holds at equilibrium;
    /// the refocus procedure sorts passive complexes by this share.
    pub fn fractions(&self, log_pfuncs: &[f64], complexes: &[Complex]) -> Result<Vec<f64>> {
        let conc = self.concentrations(log_pfuncs, complexes)?;
        Ok(self
            .targets
            .iter()
            .zip(&conc)
            .map(|(t, &x)| x * complexes[t.complex_index].len() as f64 / self.nucleotide_concentration)
            .collect())
    }

    /// The normalized tube ensemble defect and its components.
    ///
    /// * structural: min(conc, target) * per-nucleotide complex defect;
    /// * concentration: max(0, target - conc) per nucleotide of the
    ///   deficient on-target.
    ///
    /// Per-position weights multiply both kinds of contribution.
    pub fn normalized_defect(
        &self,
        log_pfuncs: &[f64],
        complex_defects: &[Defect],
        complexes: &[Complex],
        weights: Option<&ComplexWeights>,
    ) -> Result<TubeEvaluation> {
        let concentrations = self.concentrations(log_pfuncs, complexes)?;
        let mut contributions: Vec<(usize, f64)> = Vec::new();
        let mut structural = 0.0;
        let mut concentration = 0.0;

        for (t, &conc) in self.targets.iter().zip(&concentrations) {
            if t.target_conc <= 0.0 {
                continue;
            }
            let c = &complexes[t.complex_index];
            let weight = weights.and_then(|w| w.get(&t.complex_index));

            let held = conc.min(t.target_conc);
            let deficiency = (t.target_conc - conc).max(0.0);

            // Per-position structural contributions; a member without them
            // (not evaluated under this partition) still owes its
            // concentration deficiency.
            let defect = &complex_defects[t.complex_index];
            let structural_contribs: Vec<(usize, f64)> =
                if defect.contributions.len() == c.len() {
                    defect.contributions.clone()
                } else {
                    c.to_indices().into_iter().map(|i| (i, 0.0)).collect()
                };
            for (k, &(pool_idx, d)) in structural_contribs.iter().enumerate() {
                let w = weight.map_or(1.0, |w| w[k]);
                let s = held * d * w;
                let cd = deficiency * w;
                structural += s;
                concentration += cd;
                let combined = s + cd;
                if combined > 0.0 {
                    contributions.push((pool_idx, combined));
                }
            }
        }

        let defect = Defect::new(
            contributions
                .into_iter()
                .map(|(i, v)| (i, v / self.nucleotide_concentration))
                .collect(),
        )
        .reduced();
        Ok(TubeEvaluation {
            defect,
            concentrations,
            structural,
            concentration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::Complex;
    use crate::decompose::DecompositionParameters;
    use crate::model::{ModelKey, ModelMap};
    use crate::sequence::DesignSequence;
    use crate::structure::Structure;
    use crate::thermo::EngineObserver;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixture() -> (DesignSequence, Vec<Complex>) {
        let mut seqs = DesignSequence::default();
        seqs.add_domain("a", "GCGC").unwrap();
        seqs.add_strand("s1", &["a".into()]).unwrap();
        seqs.add_strand("s2", &["a*".into()]).unwrap();
        seqs.make_sequence().unwrap();
        let mut rng = StdRng::seed_from_u64(33);
        seqs.initialize_sequence(&mut rng).unwrap();

        let duplex = Complex::new(
            "duplex".into(),
            vec!["s1".into(), "s2".into()],
            vec![
                seqs.get_strand("s1").unwrap(),
                seqs.get_strand("s2").unwrap(),
            ],
            ModelKey::default(),
            Some(Structure::parse("((((+))))").unwrap()),
            DecompositionParameters::default(),
            0.0,
        )
        .unwrap();
        let monomer1 = Complex::new(
            "m1".into(),
            vec!["s1".into()],
            vec![seqs.get_strand("s1").unwrap()],
            ModelKey::default(),
            None,
            DecompositionParameters::default(),
            0.0,
        )
        .unwrap();
        let monomer2 = Complex::new(
            "m2".into(),
            vec!["s2".into()],
            vec![seqs.get_strand("s2").unwrap()],
            ModelKey::default(),
            None,
            DecompositionParameters::default(),
            0.0,
        )
        .unwrap();
        (seqs, vec![duplex, monomer1, monomer2])
    }

    fn tube(complexes: &[Complex]) -> Tube {
        Tube::new(
            "t1".into(),
            vec![
                TubeTarget {
                    complex_index: 0,
                    target_conc: 1e-6,
                },
                TubeTarget {
                    complex_index: 1,
                    target_conc: 0.0,
                },
                TubeTarget {
                    complex_index: 2,
                    target_conc: 0.0,
                },
            ],
            complexes,
        )
        .unwrap()
    }

    #[test]
    fn nucleotide_concentration_counts_on_targets_only() {
        let (_seqs, complexes) = fixture();
        let t = tube(&complexes);
        assert!((t.nucleotide_concentration - 8e-6).abs() < 1e-18);
    }

    #[test]
    fn strong_duplex_dominates_tube() {
        let (seqs, complexes) = fixture();
        let t = tube(&complexes);
        let obs = EngineObserver::default();
        let models = ModelMap::new(1 << 22);
        let lpfs: Vec<f64> = complexes
            .iter()
            .map(|c| c.log_pfunc(&seqs.nucleotides, &models, 0, &obs).unwrap())
            .collect();
        let conc = t.concentrations(&lpfs, &complexes).unwrap();
        assert!(conc[0] > 0.5e-6, "duplex concentration {}", conc[0]);
        // Strand conservation.
        let s1_total = conc[0] + conc[1];
        assert!((s1_total - 1e-6).abs() / 1e-6 < 1e-4);
    }

    #[test]
    fn tube_defect_is_normalized() {
        let (seqs, complexes) = fixture();
        let t = tube(&complexes);
        let obs = EngineObserver::default();
        let models = ModelMap::new(1 << 22);
        let lpfs: Vec<f64> = complexes
            .iter()
            .map(|c| c.log_pfunc(&seqs.nucleotides, &models, 0, &obs).unwrap())
            .collect();
        let defects: Vec<Defect> = complexes
            .iter()
            .map(|c| c.defect(&seqs.nucleotides, &models, 0, &obs).unwrap())
            .collect();
        let eval = t
            .normalized_defect(&lpfs, &defects, &complexes, None)
            .unwrap();
        let total = eval.defect.total();
        assert!(total >= 0.0 && total <= 1.0, "normalized total {}", total);
        assert!(
            (eval.structural + eval.concentration) / t.nucleotide_concentration - total < 1e-9
        );
    }

    #[test]
    fn missing_complex_rejected() {
        let (_seqs, complexes) = fixture();
        let bad = Tube::new(
            "bad".into(),
            vec![TubeTarget {
                complex_index: 9,
                target_conc: 1e-6,
            }],
            &complexes,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn off_target_only_tube_rejected() {
        let (_seqs, complexes) = fixture();
        let bad = Tube::new(
            "bad".into(),
            vec![TubeTarget {
                complex_index: 1,
                target_conc: 0.0,
            }],
            &complexes,
        );
        assert!(bad.is_err());
    }
}
