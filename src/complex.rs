// src/complex.rs
// COMPLEX
// A circular (rotation-equivalent) ordered list of strands with an optional
// target structure, a model key, a free-energy bonus, and an owned
// decomposition tree. Depth-indexed thermodynamic quantities come from the
// tree; the symmetry correction, strand-association penalty, and bonus are
// applied here because node evaluation leaves them off to keep fragment
// answers exact.

use crate::base::Base;
use crate::decompose::{DecompositionNode, DecompositionParameters, NodeContext};
use crate::defect::{nucleotide_defects, Defect};
use crate::error::DesignError;
use crate::model::{ModelKey, ModelMap};
use crate::sequence::StrandView;
use crate::structure::{rotational_symmetry, Structure};
use crate::thermo::{EngineObserver, Matrix, NickSeq};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Debug)]
pub struct Complex {
    pub name: String,
    /// Strand names in linearized circular order.
    pub strand_names: Vec<String>,
    pub strands: Vec<StrandView>,
    pub model: ModelKey,
    /// Some for on-targets; the structure fixes the nicks too.
    pub target: Option<Structure>,
    /// Extra free energy credited to the whole complex, kcal/mol.
    pub bonus: f64,
    pub params: DecompositionParameters,
    pub decomposition: DecompositionNode,
    /// Cumulative strand ends in complex coordinates.
    pub nicks: Vec<usize>,
}

impl Complex {
    pub fn new(
        name: String,
        strand_names: Vec<String>,
        strands: Vec<StrandView>,
        model: ModelKey,
        target: Option<Structure>,
        params: DecompositionParameters,
        bonus: f64,
    ) -> Result<Self> {
        let mut nicks = Vec::with_capacity(strands.len());
        let mut total = 0;
        for s in &strands {
            total += s.len();
            nicks.push(total);
        }
        if let Some(structure) = &target {
            structure
                .validate()
                .with_context(|| format!("complex {}", name))?;
            if structure.len() != total || structure.nicks != nicks {
                return Err(DesignError::InvalidConfiguration(format!(
                    "complex {}: structure does not match strand lengths",
                    name
                ))
                .into());
            }
            if !structure.is_connected() {
                return Err(DesignError::InvalidConfiguration(format!(
                    "complex {}: on-target structure is disconnected",
                    name
                ))
                .into());
            }
        }
        Ok(Complex {
            decomposition: DecompositionNode::root(total),
            name,
            strand_names,
            strands,
            model,
            target,
            bonus,
            params,
            nicks,
        })
    }

    pub fn len(&self) -> usize {
        *self.nicks.last().unwrap_or(&0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_strands(&self) -> usize {
        self.strands.len()
    }

    pub fn is_on_target(&self) -> bool {
        self.target.is_some()
    }

    /// Pool index underlying each complex position.
    pub fn to_indices(&self) -> Vec<usize> {
        self.strands.iter().flat_map(|s| s.indices()).collect()
    }

    /// Current catenated bases of the complex.
    pub fn bases(&self, pool: &[Base]) -> Vec<Base> {
        self.to_indices().into_iter().map(|i| pool[i]).collect()
    }

    pub fn nick_seq(&self, pool: &[Base]) -> NickSeq {
        NickSeq {
            bases: self.bases(pool),
            nicks: self.nicks.clone(),
        }
    }

    /// Rotational symmetry R of the complex: the target structure's
    /// symmetry when present, else the symmetry of the strand-name cycle.
    pub fn symmetry(&self) -> usize {
        match &self.target {
            Some(s) => s.symmetry(),
            None => rotational_symmetry(&self.strand_names),
        }
    }

    /// ln R, subtracted from every partition-function estimate.
    pub fn symmetry_correction(&self) -> f64 {
        (self.symmetry() as f64).ln()
    }

    /// Log-space strand-association penalty (negative for multi-strand
    /// complexes).
    pub fn join_penalty(&self) -> f64 {
        -(self.n_strands().saturating_sub(1) as f64)
            * self.model.beta()
            * self.model.join_penalty_kcal()
    }

    fn corrections(&self) -> f64 {
        -self.symmetry_correction() + self.join_penalty() - self.model.beta() * self.bonus
    }

    /// Evaluate the decomposition tree at a depth; callers pick the matrix
    /// or the partition function out of the pair.
    fn evaluate_tree(
        &self,
        pool: &[Base],
        models: &ModelMap,
        depth: u32,
        obs: &EngineObserver,
    ) -> Result<(Arc<Matrix>, f64)> {
        let bases = self.bases(pool);
        let env = models.get(self.model);
        let ctx = NodeContext {
            env: &env,
            obs,
            bases: &bases,
            nicks: &self.nicks,
            params: self.params,
        };
        self.decomposition
            .evaluate(&ctx, depth)
            .with_context(|| format!("complex {}", self.name))
    }

    /// Partition-function estimate at a depth of the decomposition tree,
    /// with symmetry, join, and bonus corrections applied.
    pub fn log_pfunc(
        &self,
        pool: &[Base],
        models: &ModelMap,
        depth: u32,
        obs: &EngineObserver,
    ) -> Result<f64> {
        let (_, log_z) = self.evaluate_tree(pool, models, depth, obs)?;
        let ret = log_z + self.corrections();
        if ret.is_nan() {
            return Err(DesignError::ThermoNan {
                sequence: self.nick_seq(pool).to_string(),
                depth,
                enforced_pairs: Vec::new(),
            }
            .into());
        }
        Ok(ret)
    }

    /// Pair-probability estimate at a depth (complex coordinates).
    pub fn pair_probabilities(
        &self,
        pool: &[Base],
        models: &ModelMap,
        depth: u32,
        obs: &EngineObserver,
    ) -> Result<Arc<Matrix>> {
        let (p, _) = self.evaluate_tree(pool, models, depth, obs)?;
        Ok(p)
    }

    /// Complex ensemble defect at a depth, projected onto pool variables.
    /// Off-targets have no structural defect.
    pub fn defect(
        &self,
        pool: &[Base],
        models: &ModelMap,
        depth: u32,
        obs: &EngineObserver,
    ) -> Result<Defect> {
        let target = match &self.target {
            Some(t) => t,
            None => return Ok(Defect::default()),
        };
        let p = self.pair_probabilities(pool, models, depth, obs)?;
        let defects = nucleotide_defects(&p, &target.pairs);
        // One contribution per complex position, unfiltered, so per-position
        // weights can be applied elementwise before reduction.
        let contributions = self.to_indices().into_iter().zip(defects).collect();
        Ok(Defect::new(contributions))
    }

    /// Cheap proxy for passive complexes: the sum of memoized single-strand
    /// log partition functions, with the same corrections applied.
    pub fn log_pf_single_strands(
        &self,
        pool: &[Base],
        models: &ModelMap,
        obs: &EngineObserver,
    ) -> Result<f64> {
        let env = models.get(self.model);
        let mut log_z = 0.0;
        for s in &self.strands {
            log_z += env.strand_pfunc(&s.to_sequence(pool), obs)?;
        }
        Ok(log_z + self.corrections())
    }

    /// Structure-based decomposition; the tree is immutable afterwards
    /// until a redecomposition event tears it down.
    pub fn structure_decompose(&mut self) {
        if let Some(target) = &self.target {
            let mut root = DecompositionNode::root(self.len());
            root.structure_decompose(&target.pairs, &self.params);
            self.decomposition = root;
        }
    }

    /// Probability-based (re)decomposition from current pair probabilities.
    pub fn probability_decompose(
        &mut self,
        pool: &[Base],
        models: &ModelMap,
        obs: &EngineObserver,
    ) -> Result<bool> {
        let bases = self.bases(pool);
        let mut root = DecompositionNode::root(bases.len());
        let changed = {
            let env = models.get(self.model);
            let ctx = NodeContext {
                env: &env,
                obs,
                bases: &bases,
                nicks: &self.nicks,
                params: self.params,
            };
            root.probability_decompose(&ctx)
                .with_context(|| format!("complex {}", self.name))?
        };
        self.decomposition = root;
        Ok(changed)
    }

    pub fn max_depth(&self) -> u32 {
        self.decomposition.height()
    }

    /// Canonical strand cycle used for rotation-invariant identity.
    pub fn canonical_strands(&self) -> Vec<String> {
        lowest_rotation(&self.strand_names)
    }
}

/// Lexicographically smallest cyclic rotation of a list.
pub fn lowest_rotation<T: Ord + Clone>(v: &[T]) -> Vec<T> {
    let mut best = v.to_vec();
    for s in 1..v.len() {
        let mut cand = v.to_vec();
        cand.rotate_left(s);
        if cand < best {
            best = cand;
        }
    }
    best
}
