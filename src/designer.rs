// src/designer.rs
// SEQUENCE DESIGNER
// The depth-indexed estimate-and-refine loop. Each pass sweeps the
// decomposition forest from the deepest level to the root, mutating the
// sequence under counter-driven escalation (M_bad rejections reseed,
// M_reseed fruitless reseeds archive-and-restart, M_reopt restarts
// redecompose). At the root the full-ensemble defect is compared against
// the estimate; disagreement triggers the refocus procedure, which promotes
// passive off-targets predicted (by the single-strand proxy) to dominate
// the defect until the relative increase falls under f_refocus.

use crate::archive::Archive;
use crate::design::{Design, EnsemblePartition};
use crate::error::DesignError;
use crate::result::{sample_positions, Candidate, FullEvaluation, SamplingMode};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::thermo::EngineObserver;

/// Cooperative cancellation flag polled at task boundaries. Clone freely;
/// all clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesignParameters {
    /// Stop tolerance on the full normalized design defect.
    pub f_stop: f64,
    /// Relative defect increase below which refocus stops promoting.
    pub f_refocus: f64,
    /// Defect fraction the passive set is allowed to carry.
    pub f_passive: f64,
    /// Tightening of the stop tolerance per depth level.
    pub f_stringent: f64,
    /// Rejections before the sequence reseeds.
    pub m_bad: u32,
    /// Fruitless reseeds before the best is archived and search restarts.
    pub m_reseed: u32,
    /// Restarts before the active complexes redecompose.
    pub m_reopt: u32,
    pub sampling: SamplingMode,
    pub seed: u64,
    pub archive_size: usize,
    /// Wall-clock budget in seconds; None runs to convergence.
    pub timeout_s: Option<f64>,
}

impl Default for DesignParameters {
    fn default() -> Self {
        DesignParameters {
            f_stop: 0.02,
            f_refocus: 0.03,
            f_passive: 0.01,
            f_stringent: 0.99,
            m_bad: 300,
            m_reseed: 50,
            m_reopt: 3,
            sampling: SamplingMode::default(),
            seed: 0,
            archive_size: 8,
            timeout_s: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DesignStats {
    pub iterations: u64,
    pub mutations_attempted: u64,
    pub mutations_accepted: u64,
    pub reseeds: u64,
    pub redecompositions: u64,
    /// Off-targets promoted per refocus invocation.
    pub refocus_history: Vec<usize>,
    pub design_time_s: f64,
}

pub struct Designer {
    pub design: Design,
    pub parameters: DesignParameters,
    /// Active/passive split; on-targets start active, off-targets passive.
    pub psi: EnsemblePartition,
    pub archive: Archive,
    /// Archive state saved before destabilizing operations.
    pub checkpoint: Option<Archive>,
    pub best: Candidate,
    pub stats: DesignStats,
    pub obs: EngineObserver,
    cancel: CancelToken,
    deadline: Option<Instant>,
    rng: StdRng,
    /// Mutation position sets known to fail for the current sequence.
    known_bads: HashSet<Vec<usize>>,
}

impl Designer {
    pub fn new(
        mut design: Design,
        parameters: DesignParameters,
        obs: EngineObserver,
        cancel: CancelToken,
    ) -> Result<Self> {
        let psi = EnsemblePartition {
            mask: design.complexes.iter().map(|c| c.is_on_target()).collect(),
        };
        design
            .initialize_decomposition(&psi, &obs)
            .context("initial decomposition")?;
        let n_objectives = design.tubes.len();
        Ok(Designer {
            design,
            psi,
            archive: Archive::new(parameters.archive_size),
            checkpoint: None,
            best: Candidate::unevaluated(n_objectives),
            stats: DesignStats::default(),
            obs,
            cancel,
            deadline: None,
            rng: StdRng::seed_from_u64(parameters.seed),
            known_bads: HashSet::new(),
            parameters,
        })
    }

    /// Run the optimization to convergence, timeout, or cancellation.
    /// Returns the best full-ensemble candidate.
    pub fn optimize(&mut self) -> Result<Candidate> {
        let timer = Instant::now();
        self.deadline = self
            .parameters
            .timeout_s
            .map(|s| timer + std::time::Duration::from_secs_f64(s));

        let mut done = false;
        self.optimize_forest()?;

        while !done {
            self.checkpoint_archive();
            if self.refocus()? {
                let estimate = self.evaluate(0, &self.psi)?;
                let full = self.evaluate_full()?;
                done = full.weighted_total()
                    <= self.parameters.f_stop.max(estimate.weighted_total());

                if full.weighted_total() < self.best.weighted_total() {
                    log::info!(
                        "root accepted: defect {:.6} (estimate {:.6}, active {}/{})",
                        full.weighted_total(),
                        estimate.weighted_total(),
                        self.psi.num_active(),
                        self.psi.mask.len(),
                    );
                    self.best = full.clone();
                } else {
                    log::debug!("root rejected: defect {:.6}", full.weighted_total());
                }
                // Optimization resumes from the current sequence even when
                // the archived best is a different assignment.
                let resume = full.sequence.clone();
                self.update_archive_estimates()?;
                self.archive.attempt_add(full);
                self.design.sequences.nucleotides = resume;
            }
            if !done {
                self.optimize_forest()?;
            }
        }

        self.stats.design_time_s += timer.elapsed().as_secs_f64();
        Ok(self.best.clone())
    }

    /// The design met its stop condition under the full ensemble.
    pub fn success(&self) -> bool {
        self.best.weighted_total() <= self.parameters.f_stop
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(DesignError::Canceled.into());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(DesignError::Timeout.into());
            }
        }
        Ok(())
    }

    fn tolerance(&self, depth: u32) -> f64 {
        self.parameters.f_stop * self.parameters.f_stringent.powi(depth as i32)
    }

    /// Evaluate the design at a depth under a partition.
    fn evaluate(&self, depth: u32, part: &EnsemblePartition) -> Result<Candidate> {
        let (defects, _) = self.design.normalized_defect(depth, part, &self.obs)?;
        Ok(Candidate::new(self.design.sequence().to_vec(), defects))
    }

    /// Full ensemble, full depth, with the lazy evaluation record attached.
    pub(crate) fn evaluate_full(&self) -> Result<Candidate> {
        let everything = EnsemblePartition::default();
        let (defects, tube_evaluations) =
            self.design.normalized_defect(0, &everything, &self.obs)?;
        let log_pfuncs = self.design.log_pfuncs(0, &everything, &self.obs)?;
        let mut candidate = Candidate::new(self.design.sequence().to_vec(), defects);
        candidate.evaluation = Some(FullEvaluation {
            log_pfuncs,
            tube_evaluations,
        });
        Ok(candidate)
    }

    /// Sweep the forest from the deepest level up to the root, leaving the
    /// design sequence at the best root-level assignment found.
    fn optimize_forest(&mut self) -> Result<()> {
        let max_depth = self.design.max_depth(&self.psi);
        for depth in (0..=max_depth).rev() {
            self.optimize_depth(depth)
                .with_context(|| format!("optimizing at depth {}", depth))?;
        }
        Ok(())
    }

    /// Mutate-and-accept loop at one depth, with counter-driven escalation.
    fn optimize_depth(&mut self, depth: u32) -> Result<()> {
        let psi = self.psi.clone();
        let tolerance = self.tolerance(depth);
        let variables = self.design.sequences.constraints.variable_positions();
        if variables.is_empty() {
            return Ok(());
        }

        let p = self.parameters.clone();
        let cap = (4u64)
            .saturating_mul(p.m_bad as u64)
            .saturating_mul(p.m_reseed as u64 + 1)
            .saturating_mul(p.m_reopt as u64 + 1)
            .max(200);

        let mut current = self.evaluate(depth, &psi)?;
        let mut best = current.clone();
        let mut bad_streak = 0u32;
        let mut no_improve = 0u32;
        let mut reopt_streak = 0u32;
        let mut iterations = 0u64;

        while best.weighted_total() > tolerance && iterations < cap {
            self.check_interrupt()?;
            iterations += 1;
            self.stats.iterations += 1;

            let mut positions =
                sample_positions(p.sampling, &current, &variables, 1, &mut self.rng);
            positions.sort_unstable();
            let mut rejected = positions.is_empty() || self.known_bads.contains(&positions);

            if !rejected {
                self.stats.mutations_attempted += 1;
                let saved = self.design.sequences.nucleotides.clone();
                if !self
                    .design
                    .sequences
                    .mutate_sequence(&positions, &mut self.rng)
                {
                    self.known_bads.insert(positions);
                    rejected = true;
                } else {
                    let trial = self.evaluate(depth, &psi)?;
                    if trial.dominates(&current) {
                        self.stats.mutations_accepted += 1;
                        self.known_bads.clear();
                        current = trial;
                        bad_streak = 0;
                        if current.dominates(&best) {
                            best = current.clone();
                            no_improve = 0;
                        }
                        continue;
                    }
                    self.design.sequences.nucleotides = saved;
                    rejected = true;
                }
            }

            if rejected {
                bad_streak += 1;
                if bad_streak >= p.m_bad {
                    bad_streak = 0;
                    no_improve += 1;
                    self.reseed(depth, &psi, &mut current)?;
                    if no_improve >= p.m_reseed {
                        no_improve = 0;
                        reopt_streak += 1;
                        self.archive.attempt_add(best.clone());
                        if reopt_streak >= p.m_reopt {
                            reopt_streak = 0;
                            self.redecompose(depth, &psi, &mut current, &mut best)?;
                        }
                    }
                }
            }
        }

        // Propagate the best assignment up to the parent level.
        self.design.sequences.nucleotides = best.sequence.clone();
        Ok(())
    }

    /// Fresh constrained random assignment of the whole pool.
    fn reseed(
        &mut self,
        depth: u32,
        psi: &EnsemblePartition,
        current: &mut Candidate,
    ) -> Result<()> {
        self.stats.reseeds += 1;
        self.known_bads.clear();
        self.design
            .sequences
            .initialize_sequence(&mut self.rng)
            .context("reseeding")?;
        *current = self.evaluate(depth, psi)?;
        Ok(())
    }

    /// Probability-based redecomposition of the active set, then restart
    /// from the best sequence under the new trees.
    fn redecompose(
        &mut self,
        depth: u32,
        psi: &EnsemblePartition,
        current: &mut Candidate,
        best: &mut Candidate,
    ) -> Result<()> {
        self.stats.redecompositions += 1;
        self.checkpoint_archive();
        self.design.sequences.nucleotides = best.sequence.clone();
        let active = psi.actives();
        let obs = self.obs.clone();
        self.design
            .subset_decompose(&active, &obs)
            .context("redecomposition")?;
        *best = self.evaluate(depth, psi)?;
        *current = best.clone();
        Ok(())
    }

    /// The refocus procedure. Predicts passive contributions with the
    /// single-strand proxy, promotes passive complexes in order of their
    /// predicted defect share until the relative increase drops below
    /// f_refocus, then commits the new partition. Returns true when the
    /// first promotion already changed little (the estimate can be trusted
    /// against the full ensemble) or nothing was left to promote.
    pub fn refocus(&mut self) -> Result<bool> {
        if self.psi.all_active() {
            return Ok(true);
        }
        let pool = self.design.sequence().to_vec();
        let mut lpfs = Vec::with_capacity(self.design.complexes.len());
        for (i, c) in self.design.complexes.iter().enumerate() {
            lpfs.push(if self.psi.active(i) {
                c.log_pfunc(&pool, &self.design.models, 0, &self.obs)?
            } else {
                c.log_pf_single_strands(&pool, &self.design.models, &self.obs)?
            });
        }

        // Predicted nucleotide share of each passive complex, over tubes.
        let mut fractions = vec![0.0; self.design.complexes.len()];
        for tube in &self.design.tubes {
            let fr = tube.fractions(&lpfs, &self.design.complexes)?;
            for (t, f) in tube.targets.iter().zip(fr) {
                if !self.psi.active(t.complex_index) {
                    fractions[t.complex_index] += f;
                }
            }
        }
        let mut passive: Vec<(usize, f64)> = self
            .psi
            .passives()
            .into_iter()
            .map(|i| (i, fractions[i]))
            .collect();
        passive.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite fractions"));

        // Off-targets predicted to hold less than f_passive of the tube
        // material are not worth full-depth scoring yet; always keep at
        // least the top candidate so every refocus makes progress.
        let significant = passive
            .iter()
            .filter(|&&(_, f)| f >= self.parameters.f_passive)
            .count()
            .max(1);
        passive.truncate(significant);

        let mut part = self.psi.clone();
        let mut order = passive.into_iter().map(|(i, _)| i);
        let first = order.next().expect("at least one passive complex");
        part.mask[first] = true;

        let relative = |est: &Candidate, prev: &Candidate| -> f64 {
            (est.weighted_total() - prev.weighted_total()) / prev.weighted_total().max(1e-12)
        };
        let mut prev = self.evaluate(0, &self.psi)?;
        let mut estimate = self.evaluate(0, &part)?;
        let immediate = relative(&estimate, &prev) < self.parameters.f_refocus;

        for i in order {
            if relative(&estimate, &prev) < self.parameters.f_refocus {
                break;
            }
            part.mask[i] = true;
            prev = estimate;
            estimate = self.evaluate(0, &part)?;
        }

        let changed: Vec<usize> = (0..part.mask.len())
            .filter(|&i| part.mask[i] && !self.psi.mask[i])
            .collect();
        log::info!(
            "refocus promoted {} off-target(s); active now {}/{}",
            changed.len(),
            part.num_active(),
            part.mask.len()
        );
        let obs = self.obs.clone();
        self.design.subset_decompose(&changed, &obs)?;
        self.stats.refocus_history.push(changed.len());
        self.psi = part;
        self.known_bads.clear();
        Ok(immediate)
    }

    /// Re-evaluate archived candidates at the full ensemble and prune the
    /// newly dominated.
    fn update_archive_estimates(&mut self) -> Result<()> {
        let mut archive = std::mem::take(&mut self.archive);
        let outcome = archive.update_estimates(|c| {
            self.design.sequences.nucleotides = c.sequence.clone();
            self.evaluate_full()
        });
        self.archive = archive;
        outcome?;
        Ok(())
    }

    fn checkpoint_archive(&mut self) {
        self.checkpoint = Some(self.archive.clone());
    }
}
