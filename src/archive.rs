// src/archive.rs
// PARETO ARCHIVE
// Bounded set of mutually non-dominated candidates. New entries are
// rejected when dominated, replace whatever they dominate, and otherwise
// compete on diversity: when full, the member with the smallest
// nearest-neighbor distance in objective space makes room only for a
// strictly more isolated newcomer.

use crate::result::Candidate;

#[derive(Debug, Clone, Default)]
pub struct Archive {
    pub results: Vec<Candidate>,
    pub max_size: usize,
}

impl Archive {
    pub fn new(max_size: usize) -> Self {
        Archive {
            results: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.results.len() >= self.max_size
    }

    /// Best candidate by weighted total, for reporting.
    pub fn best(&self) -> Option<&Candidate> {
        self.results.iter().min_by(|a, b| {
            a.weighted_total()
                .partial_cmp(&b.weighted_total())
                .expect("finite totals")
        })
    }

    /// Try to add a candidate. Returns (added, removed) counts.
    pub fn attempt_add(&mut self, candidate: Candidate) -> (usize, usize) {
        if self
            .results
            .iter()
            .any(|r| r.dominates(&candidate) || r.same_totals(&candidate))
        {
            return (0, 0);
        }

        let before = self.results.len();
        self.results.retain(|r| !candidate.dominates(r));
        let removed = before - self.results.len();
        if removed > 0 {
            self.results.push(candidate);
            return (1, removed);
        }

        if !self.is_full() {
            self.results.push(candidate);
            return (1, 0);
        }

        // Diversity promotion: evict the most crowded member only if the
        // newcomer is strictly less crowded.
        let densities = self.densities();
        let (crowded, &min_density) = match densities
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).expect("finite densities"))
        {
            Some(found) => found,
            None => return (0, 0),
        };
        if self.density(&candidate) > min_density {
            self.results.remove(crowded);
            self.results.push(candidate);
            return (1, 1);
        }
        (0, 0)
    }

    /// attempt_add applied to every member of another archive.
    pub fn merge(&mut self, other: Archive) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for r in other.results {
            let (a, d) = self.attempt_add(r);
            added += a;
            removed += d;
        }
        (added, removed)
    }

    /// Drop members dominated by another member; used after re-evaluating
    /// defects at a more accurate estimate.
    pub fn remove_dominated(&mut self) -> usize {
        let reference = self.results.clone();
        let before = self.results.len();
        self.results
            .retain(|r| !reference.iter().any(|other| other.dominates(r)));
        before - self.results.len()
    }

    /// Re-evaluate every member with the supplied function (new depth or
    /// partition), then prune the newly dominated.
    pub fn update_estimates<E>(&mut self, mut reevaluate: E) -> anyhow::Result<usize>
    where
        E: FnMut(&Candidate) -> anyhow::Result<Candidate>,
    {
        for r in self.results.iter_mut() {
            *r = reevaluate(r)?;
        }
        Ok(self.remove_dominated())
    }

    fn densities(&self) -> Vec<f64> {
        self.results.iter().map(|r| self.density(r)).collect()
    }

    /// Nearest-neighbor distance to the archive, ignoring zero distances
    /// (self or exact duplicates).
    fn density(&self, candidate: &Candidate) -> f64 {
        self.results
            .iter()
            .map(|r| distance(candidate, r))
            .filter(|&d| d > 0.0)
            .fold(f64::INFINITY, f64::min)
    }
}

/// Mean L1 distance between defect-total vectors.
fn distance(a: &Candidate, b: &Candidate) -> f64 {
    let ta = a.totals();
    let tb = b.totals();
    debug_assert_eq!(ta.len(), tb.len(), "incomparable objective vectors");
    let sum: f64 = ta.iter().zip(&tb).map(|(x, y)| (x - y).abs()).sum();
    sum / ta.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defect::Defect;

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
    fn dominated_candidate_rejected() {
        let mut archive = Archive::new(4);
        assert_eq!(archive.attempt_add(candidate(&[0.1, 0.1])), (1, 0));
        assert_eq!(archive.attempt_add(candidate(&[0.2, 0.2])), (0, 0));
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn dominating_candidate_replaces() {
        let mut archive = Archive::new(4);
        archive.attempt_add(candidate(&[0.2, 0.2]));
        archive.attempt_add(candidate(&[0.3, 0.1]));
        assert_eq!(archive.attempt_add(candidate(&[0.1, 0.1])), (1, 2));
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn pareto_invariant_holds() {
        let mut archive = Archive::new(8);
        archive.attempt_add(candidate(&[0.1, 0.9]));
        archive.attempt_add(candidate(&[0.5, 0.5]));
        archive.attempt_add(candidate(&[0.9, 0.1]));
        for a in &archive.results {
            for b in &archive.results {
                assert!(!a.dominates(b));
            }
        }
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn near_duplicate_rejected_on_diversity() {
        let mut archive = Archive::new(3);
        archive.attempt_add(candidate(&[0.1, 0.9]));
        archive.attempt_add(candidate(&[0.5, 0.5]));
        archive.attempt_add(candidate(&[0.9, 0.1]));
        // Mutually non-dominated with all three, but nearly a duplicate of
        // the middle member: less isolated than anything archived.
        let (added, removed) = archive.attempt_add(candidate(&[0.49, 0.51]));
        assert_eq!((added, removed), (0, 0));
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn isolated_candidate_displaces_crowded() {
        let mut archive = Archive::new(3);
        archive.attempt_add(candidate(&[0.1, 0.9]));
        archive.attempt_add(candidate(&[0.5, 0.5]));
        archive.attempt_add(candidate(&[0.52, 0.48]));
        // Far from everything; the crowded pair loses a member.
        let (added, removed) = archive.attempt_add(candidate(&[0.9, 0.05]));
        assert_eq!((added, removed), (1, 1));
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn update_estimates_prunes_newly_dominated() {
        let mut archive = Archive::new(4);
        archive.attempt_add(candidate(&[0.1, 0.9]));
        archive.attempt_add(candidate(&[0.9, 0.1]));
        // Re-evaluation collapses both onto comparable vectors.
        let removed = archive
            .update_estimates(|r| {
                Ok(if r.totals()[0] < 0.5 {
                    candidate(&[0.1, 0.1])
                } else {
                    candidate(&[0.2, 0.2])
                })
            })
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(archive.len(), 1);
    }
}
