// src/design.rs
// DESIGN
// The aggregate the optimizer works on: the sequence pool, the complexes,
// the tubes, the model map, and the resolved weights. Evaluation fans out
// across complexes on the rayon pool and folds tube defects into per-tube
// objectives. The EnsemblePartition splits complexes into active (scored
// through their decomposition trees) and passive (excluded from scoring;
// the refocus procedure predicts them with the single-strand proxy).

use crate::base::Base;
use crate::complex::{lowest_rotation, Complex};
use crate::decompose::DecompositionParameters;
use crate::defect::Defect;
use crate::error::DesignError;
use crate::model::{ModelKey, ModelMap};
use crate::sequence::DesignSequence;
use crate::structure::Structure;
use crate::thermo::EngineObserver;
use crate::tube::{Tube, TubeEvaluation, TubeTarget};
use crate::weights::Weights;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashSet;

/// Generated off-target ensembles are bounded; a spec asking for more is a
/// configuration error, not a silent truncation.
const MAX_GENERATED_OFF_TARGETS: usize = 4096;

/// Active/passive split over the design's complexes. An empty partition
/// means everything is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsemblePartition {
    pub mask: Vec<bool>,
}

impl EnsemblePartition {
    pub fn everything(n: usize) -> Self {
        EnsemblePartition {
            mask: vec![true; n],
        }
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn active(&self, i: usize) -> bool {
        self.mask.is_empty() || self.mask[i]
    }

    pub fn all_active(&self) -> bool {
        self.mask.is_empty() || self.mask.iter().all(|&b| b)
    }

    pub fn num_active(&self) -> usize {
        self.mask.iter().filter(|&&b| b).count()
    }

    pub fn num_passive(&self) -> usize {
        self.mask.iter().filter(|&&b| !b).count()
    }

    pub fn actives(&self) -> Vec<usize> {
        (0..self.mask.len()).filter(|&i| self.mask[i]).collect()
    }

    pub fn passives(&self) -> Vec<usize> {
        (0..self.mask.len()).filter(|&i| !self.mask[i]).collect()
    }
}

#[derive(Debug)]
pub struct Design {
    pub sequences: DesignSequence,
    pub complexes: Vec<Complex>,
    pub tubes: Vec<Tube>,
    pub models: ModelMap,
    pub weights: Weights,
}

impl Design {
    pub fn new(sequences: DesignSequence, ram_budget_bytes: usize) -> Self {
        Design {
            sequences,
            complexes: Vec::new(),
            tubes: Vec::new(),
            models: ModelMap::new(ram_budget_bytes),
            weights: Weights::default(),
        }
    }

    pub fn sequence(&self) -> &[Base] {
        &self.sequences.nucleotides
    }

    /// Add a complex from strand names; an on-target brings its structure.
    pub fn add_complex(
        &mut self,
        name: &str,
        strand_names: &[String],
        model: ModelKey,
        structure: Option<Structure>,
        params: DecompositionParameters,
        bonus: f64,
    ) -> Result<usize> {
        let strands = strand_names
            .iter()
            .map(|n| self.sequences.get_strand(n))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("complex {}", name))?;
        let complex = Complex::new(
            name.to_string(),
            strand_names.to_vec(),
            strands,
            model,
            structure,
            params,
            bonus,
        )?;
        self.complexes.push(complex);
        Ok(self.complexes.len() - 1)
    }

    pub fn add_tube(&mut self, name: &str, entries: Vec<(usize, f64)>) -> Result<usize> {
        let targets = entries
            .into_iter()
            .map(|(complex_index, target_conc)| TubeTarget {
                complex_index,
                target_conc,
            })
            .collect();
        let tube = Tube::new(name.to_string(), targets, &self.complexes)?;
        self.tubes.push(tube);
        Ok(self.tubes.len() - 1)
    }

    /// For every on-target base pair, impose complementarity between the
    /// underlying pool variables.
    pub fn add_structure_complementarity(&mut self) {
        let wobble = self.sequences.wobble_mutations;
        let mut pairs = Vec::new();
        for c in &self.complexes {
            if let Some(structure) = &c.target {
                let indices = c.to_indices();
                for (i, j) in structure.pairs.pairs() {
                    pairs.push((indices[i], indices[j]));
                }
            }
        }
        for (i, j) in pairs {
            self.sequences
                .constraints
                .complementarity_constraint(i, j, wobble);
        }
    }

    pub fn resolve_weights(&mut self, specifications: Vec<crate::weights::Weight>) -> Result<()> {
        let mut weights = Weights::new(specifications);
        weights.resolve(&self.sequences, &self.complexes, &self.tubes)?;
        self.weights = weights;
        Ok(())
    }

    /// Depth-d log partition functions; passive complexes are excluded
    /// (log Z = -inf drops them from the concentration solve).
    pub fn log_pfuncs(
        &self,
        depth: u32,
        part: &EnsemblePartition,
        obs: &EngineObserver,
    ) -> Result<Vec<f64>> {
        self.complexes
            .par_iter()
            .enumerate()
            .map(|(i, c)| {
                if part.active(i) {
                    c.log_pfunc(self.sequence(), &self.models, depth, obs)
                } else {
                    Ok(f64::NEG_INFINITY)
                }
            })
            .collect()
    }

    /// Depth-d complex defects for active complexes.
    pub fn complex_defects(
        &self,
        depth: u32,
        part: &EnsemblePartition,
        obs: &EngineObserver,
    ) -> Result<Vec<Defect>> {
        self.complexes
            .par_iter()
            .enumerate()
            .map(|(i, c)| {
                if part.active(i) {
                    c.defect(self.sequence(), &self.models, depth, obs)
                } else {
                    Ok(Defect::default())
                }
            })
            .collect()
    }

    /// Per-tube normalized defects (the design's objectives) plus the full
    /// tube evaluations for reporting.
    pub fn normalized_defect(
        &self,
        depth: u32,
        part: &EnsemblePartition,
        obs: &EngineObserver,
    ) -> Result<(Vec<Defect>, Vec<TubeEvaluation>)> {
        let lpfs = self.log_pfuncs(depth, part, obs)?;
        let cdefs = self.complex_defects(depth, part, obs)?;
        let evals = self
            .tubes
            .par_iter()
            .enumerate()
            .map(|(i, t)| {
                t.normalized_defect(&lpfs, &cdefs, &self.complexes, self.weights.for_tube(i))
                    .with_context(|| format!("tube {}", t.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let defects = evals.iter().map(|e| e.defect.clone()).collect();
        Ok((defects, evals))
    }

    /// Decompose the active set: structure-based for on-targets,
    /// probability-based otherwise.
    pub fn initialize_decomposition(
        &mut self,
        part: &EnsemblePartition,
        obs: &EngineObserver,
    ) -> Result<()> {
        let pool = self.sequences.nucleotides.clone();
        for i in 0..self.complexes.len() {
            if !part.active(i) {
                continue;
            }
            if self.complexes[i].is_on_target() {
                self.complexes[i].structure_decompose();
            } else {
                self.complexes[i].probability_decompose(&pool, &self.models, obs)?;
            }
        }
        Ok(())
    }

    /// Probability-based redecomposition of the listed complexes.
    pub fn subset_decompose(&mut self, indices: &[usize], obs: &EngineObserver) -> Result<()> {
        let pool = self.sequences.nucleotides.clone();
        for &i in indices {
            self.complexes[i].probability_decompose(&pool, &self.models, obs)?;
        }
        Ok(())
    }

    pub fn max_depth(&self, part: &EnsemblePartition) -> u32 {
        self.complexes
            .iter()
            .enumerate()
            .filter(|(i, _)| part.active(*i))
            .map(|(_, c)| c.max_depth())
            .max()
            .unwrap_or(0)
    }

    /// Number of variable nucleotides in the pool.
    pub fn n_variables(&self) -> usize {
        self.sequences.constraints.variable_positions().len()
    }

    /// Generate the off-target ensemble of a tube: every rotation-distinct
    /// complex over the tube's strands up to max_size strands that is not
    /// already a member, added with zero target concentration.
    pub fn generate_off_targets(
        &mut self,
        tube_index: usize,
        max_size: usize,
        params: DecompositionParameters,
    ) -> Result<usize> {
        let tube = self
            .tubes
            .get(tube_index)
            .ok_or_else(|| DesignError::InvalidConfiguration("no such tube".into()))?;
        let member_indices: Vec<usize> =
            tube.targets.iter().map(|t| t.complex_index).collect();
        let model = self.complexes[member_indices[0]].model;

        let mut strand_names: Vec<String> = member_indices
            .iter()
            .flat_map(|&i| self.complexes[i].strand_names.iter().cloned())
            .collect();
        strand_names.sort_unstable();
        strand_names.dedup();

        let mut seen: HashSet<Vec<String>> = self
            .complexes
            .iter()
            .map(|c| c.canonical_strands())
            .collect();

        let mut generated = Vec::new();
        let mut stack: Vec<Vec<String>> = strand_names.iter().map(|s| vec![s.clone()]).collect();
        while let Some(current) = stack.pop() {
            let canonical = lowest_rotation(&current);
            if seen.insert(canonical.clone()) {
                generated.push(canonical);
                if generated.len() > MAX_GENERATED_OFF_TARGETS {
                    return Err(DesignError::InvalidConfiguration(format!(
                        "off-target generation exceeds {} complexes",
                        MAX_GENERATED_OFF_TARGETS
                    ))
                    .into());
                }
            }
            if current.len() < max_size {
                for s in &strand_names {
                    let mut next = current.clone();
                    next.push(s.clone());
                    stack.push(next);
                }
            }
        }

        let mut added = 0;
        for strands in generated {
            let name = format!("({})", strands.join("+"));
            let idx = self.add_complex(&name, &strands, model, None, params, 0.0)?;
            self.tubes[tube_index].targets.push(TubeTarget {
                complex_index: idx,
                target_conc: 0.0,
            });
            added += 1;
        }
        Ok(added)
    }
}
