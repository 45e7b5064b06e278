// src/constraints.rs
// CONSTRAINT-SATISFYING ASSIGNMENT
// Variables are pool positions holding base masks. Constraints are
// complementarity edges (Watson-Crick, optionally wobble) and forbidden
// degenerate words over position windows. Initialization and mutation run
// arc-consistent propagation plus random restarts; a mutation that cannot be
// completed returns None and leaves the caller's sequence untouched.

use crate::base::Base;
use rand::Rng;
use std::collections::BTreeSet;

/// Restart bounds. Initialization gets more attempts than a single mutation
/// because it only runs once per design.
const INIT_ATTEMPTS: usize = 64;
const MUTATE_ATTEMPTS: usize = 24;

#[derive(Debug, Clone)]
struct PatternConstraint {
    /// Pool positions forming the window, in order.
    window: Vec<usize>,
    /// Forbidden word as degenerate masks; the word matches when every
    /// window base is admitted by the corresponding mask.
    word: Vec<Base>,
}

#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Composition mask per variable (domain spec intersected with any
    /// word-level masks).
    masks: Vec<Base>,
    /// Complementarity adjacency: (partner, wobble_allowed).
    comp: Vec<Vec<(usize, bool)>>,
    patterns: Vec<PatternConstraint>,
    /// Variable -> indices into `patterns`.
    pattern_index: Vec<Vec<usize>>,
}

impl Constraints {
    pub fn new(masks: Vec<Base>) -> Self {
        let n = masks.len();
        Constraints {
            masks,
            comp: vec![Vec::new(); n],
            patterns: Vec::new(),
            pattern_index: vec![Vec::new(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn mask(&self, i: usize) -> Base {
        self.masks[i]
    }

    /// Positions that are free to vary under the composition masks.
    pub fn variable_positions(&self) -> Vec<usize> {
        (0..self.masks.len())
            .filter(|&i| !self.masks[i].is_determined())
            .collect()
    }

    /// Require that positions i and j always form a legal pair. Idempotent.
    pub fn complementarity_constraint(&mut self, i: usize, j: usize, wobble: bool) {
        if !self.comp[i].contains(&(j, wobble)) {
            self.comp[i].push((j, wobble));
            self.comp[j].push((i, wobble));
        }
    }

    /// Forbid a degenerate word over a window of positions.
    pub fn prevent_word(&mut self, window: Vec<usize>, word: Vec<Base>) {
        debug_assert_eq!(window.len(), word.len());
        let id = self.patterns.len();
        for &v in &window {
            self.pattern_index[v].push(id);
        }
        self.patterns.push(PatternConstraint { window, word });
    }

    /// Narrow the composition mask of a position in place.
    pub fn restrict_mask(&mut self, i: usize, allowed: Base) {
        self.masks[i] = self.masks[i].intersect(allowed);
    }

    /// Ground every position to a single base such that all constraints
    /// hold. None when the constrained problem admits no assignment.
    pub fn initial_sequence<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Vec<Base>> {
        // A propagation wipeout from the raw masks alone is a proof of
        // unsatisfiability; restarts cannot help.
        let mut working = self.masks.clone();
        if self
            .propagate(&mut working, (0..self.len()).collect())
            .is_err()
        {
            return None;
        }

        for _ in 0..INIT_ATTEMPTS {
            if let Some(seq) = self.try_assign(self.masks.clone(), &(0..self.len()).collect(), rng)
            {
                return Some(seq);
            }
        }
        None
    }

    /// Re-sample the listed positions while keeping every constraint
    /// satisfied. On conflict the cleared region grows to the constraint
    /// neighborhood; after the attempt bound, None (no mutation made).
    pub fn make_mutation<R: Rng + ?Sized>(
        &self,
        current: &[Base],
        positions: &[usize],
        rng: &mut R,
    ) -> Option<Vec<Base>> {
        debug_assert_eq!(current.len(), self.len());
        let mut cleared: BTreeSet<usize> = positions.iter().copied().collect();

        for attempt in 0..MUTATE_ATTEMPTS {
            let mut working: Vec<Base> = current.to_vec();
            for &i in &cleared {
                working[i] = self.masks[i];
            }
            // Bias the first attempts away from the current assignment so a
            // successful mutation actually changes something.
            let avoid_current = attempt < MUTATE_ATTEMPTS / 2;
            if avoid_current {
                for &i in &cleared {
                    let narrowed = working[i].intersect(current[i].inverse());
                    if !narrowed.is_none() {
                        working[i] = narrowed;
                    }
                }
            }

            match self.propagate(&mut working, cleared.iter().copied().collect()) {
                Err(conflict) => {
                    self.grow_cleared(&mut cleared, conflict);
                    continue;
                }
                Ok(()) => {}
            }

            if let Some(seq) = self.try_assign(working, &cleared, rng) {
                if seq != current {
                    return Some(seq);
                }
                // Identical resample; widen and go again.
                if let Some(&first) = cleared.iter().next() {
                    self.grow_cleared(&mut cleared, first);
                }
                continue;
            }
            // Assignment failed inside the cleared region; widen it.
            if let Some(&first) = cleared.iter().next() {
                self.grow_cleared(&mut cleared, first);
            }
        }
        None
    }

    /// Check a fully grounded sequence against every constraint.
    pub fn satisfied(&self, seq: &[Base]) -> bool {
        if seq.len() != self.len() {
            return false;
        }
        for (i, &b) in seq.iter().enumerate() {
            if !self.masks[i].admits(b) {
                return false;
            }
            for &(j, wobble) in &self.comp[i] {
                if !Base::can_pair(b, seq[j], wobble) {
                    return false;
                }
            }
        }
        self.patterns.iter().all(|p| !pattern_matches(p, seq))
    }

    /// Arc-consistency over complementarity edges seeded from `queue`,
    /// plus last-position pruning for word constraints. Err carries a
    /// variable participating in the wipeout.
    fn propagate(&self, working: &mut [Base], queue: Vec<usize>) -> Result<(), usize> {
        let mut queue: Vec<usize> = queue;
        while let Some(i) = queue.pop() {
            if working[i].is_none() {
                return Err(i);
            }
            for &(j, wobble) in &self.comp[i] {
                let allowed = if wobble {
                    working[i].wobble_complement()
                } else {
                    working[i].complement()
                };
                let narrowed = working[j].intersect(allowed);
                if narrowed.is_none() {
                    return Err(j);
                }
                if narrowed != working[j] {
                    working[j] = narrowed;
                    queue.push(j);
                }
            }
            for &pid in &self.pattern_index[i] {
                if let Some(v) = self.prune_pattern(&self.patterns[pid], working)? {
                    queue.push(v);
                }
            }
        }
        Ok(())
    }

    /// When all but one window position already match the forbidden word,
    /// remove the word's mask from the remaining position.
    fn prune_pattern(
        &self,
        p: &PatternConstraint,
        working: &mut [Base],
    ) -> Result<Option<usize>, usize> {
        let mut open = None;
        for (&v, &w) in p.window.iter().zip(&p.word) {
            if working[v].is_determined() {
                if !w.admits(working[v]) {
                    return Ok(None); // window can no longer match
                }
            } else {
                if open.is_some() {
                    return Ok(None); // two open positions, nothing to prune
                }
                open = Some((v, w));
            }
        }
        match open {
            None => Err(p.window[0]), // fully matched: wipeout at this window
            Some((v, w)) => {
                let narrowed = working[v].intersect(w.inverse());
                if narrowed.is_none() {
                    return Err(v);
                }
                if narrowed != working[v] {
                    working[v] = narrowed;
                    return Ok(Some(v));
                }
                Ok(None)
            }
        }
    }

    /// Ground every undetermined position in random order with propagation
    /// after each choice. One shot; callers provide the restart loop.
    fn try_assign<R: Rng + ?Sized>(
        &self,
        mut working: Vec<Base>,
        targets: &BTreeSet<usize>,
        rng: &mut R,
    ) -> Option<Vec<Base>> {
        // Seed propagation from everything already determined so samples
        // are drawn from consistent masks.
        let working_len = working.len();
        if self
            .propagate(&mut working, (0..working_len).collect())
            .is_err()
        {
            return None;
        }

        let mut order: Vec<usize> = targets
            .iter()
            .copied()
            .filter(|&i| !working[i].is_determined())
            .collect();
        shuffle(&mut order, rng);

        for &i in &order {
            if working[i].is_none() {
                return None;
            }
            if working[i].is_determined() {
                continue; // grounded by earlier propagation
            }
            let choice = working[i].sample(rng);
            working[i] = choice;
            if self.propagate(&mut working, vec![i]).is_err() {
                return None;
            }
        }

        if working.iter().all(|b| b.is_determined()) && self.satisfied(&working) {
            Some(working)
        } else {
            None
        }
    }

    /// Extend a cleared region by the constraint neighborhood of a
    /// conflicting variable.
    fn grow_cleared(&self, cleared: &mut BTreeSet<usize>, conflict: usize) {
        cleared.insert(conflict);
        for &(j, _) in &self.comp[conflict] {
            cleared.insert(j);
        }
        for &pid in &self.pattern_index[conflict] {
            for &v in &self.patterns[pid].window {
                cleared.insert(v);
            }
        }
    }
}

fn pattern_matches(p: &PatternConstraint, seq: &[Base]) -> bool {
    p.window
        .iter()
        .zip(&p.word)
        .all(|(&v, &w)| w.admits(seq[v]))
}

/// Fisher-Yates; small helper so the solver only needs an `Rng`.
fn shuffle<T, R: Rng + ?Sized>(v: &mut [T], rng: &mut R) {
    for i in (1..v.len()).rev() {
        let j = rng.gen_range(0..=i);
        v.swap(i, j);
    }
}
