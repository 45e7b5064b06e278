// src/sequence.rs
// SEQUENCE MODEL
// Domains are named runs of allowed-base masks packed into one variable
// pool; strands are ordered domain references; complexes index strands.
// Views carry pool index ranges so defects and weights can be projected
// back onto the underlying variables.

use crate::base::{self, Base};
use crate::constraints::Constraints;
use crate::error::DesignError;
use anyhow::{Context, Result};
use rand::Rng;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub allowed: Vec<Base>,
}

#[derive(Debug, Clone)]
pub struct StrandSpec {
    pub name: String,
    pub domain_names: Vec<String>,
}

/// Contiguous pool range [start, stop) owned by a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainView {
    pub start: usize,
    pub stop: usize,
}

impl DomainView {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> {
        self.start..self.stop
    }

    pub fn to_sequence(&self, pool: &[Base]) -> Vec<Base> {
        pool[self.start..self.stop].to_vec()
    }
}

/// Ordered list of domain views making up a strand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrandView {
    pub domains: Vec<DomainView>,
}

impl StrandView {
    pub fn len(&self) -> usize {
        self.domains.iter().map(|d| d.len()).sum()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.domains.iter().flat_map(|d| d.indices())
    }

    pub fn to_sequence(&self, pool: &[Base]) -> Vec<Base> {
        self.indices().map(|i| pool[i]).collect()
    }
}

/// The mutable sequence state of a design: specs, pool, views, constraints.
#[derive(Debug, Clone, Default)]
pub struct DesignSequence {
    pub domain_specs: Vec<DomainSpec>,
    pub strand_specs: Vec<StrandSpec>,
    /// Current assignment of the variable pool (domains catenated in
    /// declaration order).
    pub nucleotides: Vec<Base>,
    pub domains: BTreeMap<String, DomainView>,
    pub strands: BTreeMap<String, StrandView>,
    pub constraints: Constraints,
    /// Admit G-U pairs in complementarity constraints.
    pub wobble_mutations: bool,
}

impl DesignSequence {
    pub fn add_domain(&mut self, name: &str, codes: &str) -> Result<()> {
        if self.domain_specs.iter().any(|d| d.name == name) {
            return Err(DesignError::InvalidConfiguration(format!(
                "duplicate domain {}",
                name
            ))
            .into());
        }
        let allowed = base::parse_bases(codes).ok_or_else(|| {
            DesignError::InvalidConfiguration(format!("domain {}: bad codes {}", name, codes))
        })?;
        if allowed.is_empty() || allowed.iter().any(|b| b.is_none()) {
            return Err(DesignError::InvalidConfiguration(format!(
                "domain {} has an empty position",
                name
            ))
            .into());
        }
        self.domain_specs.push(DomainSpec {
            name: name.to_string(),
            allowed,
        });
        Ok(())
    }

    pub fn add_strand(&mut self, name: &str, domain_names: &[String]) -> Result<()> {
        if self.strand_specs.iter().any(|s| s.name == name) {
            return Err(DesignError::InvalidConfiguration(format!(
                "duplicate strand {}",
                name
            ))
            .into());
        }
        if domain_names.is_empty() {
            return Err(
                DesignError::InvalidConfiguration(format!("strand {} is empty", name)).into(),
            );
        }
        self.strand_specs.push(StrandSpec {
            name: name.to_string(),
            domain_names: domain_names.to_vec(),
        });
        Ok(())
    }

    /// Add any missing domain complements as unconstrained (all-N) domains.
    /// Idempotent once non-complement domains are fixed.
    pub fn add_domain_complements(&mut self) {
        let existing: Vec<String> = self.domain_specs.iter().map(|d| d.name.clone()).collect();
        for name in existing {
            if name.ends_with('*') {
                continue;
            }
            let comp_name = format!("{}*", name);
            if self.domain_specs.iter().any(|d| d.name == comp_name) {
                continue;
            }
            let len = self
                .domain_specs
                .iter()
                .find(|d| d.name == name)
                .map(|d| d.allowed.len())
                .unwrap_or(0);
            self.domain_specs.push(DomainSpec {
                name: comp_name,
                allowed: vec![Base::N; len],
            });
        }
    }

    /// Convert specs into the pool, views, and constraint set. Strand
    /// domain references are resolved here.
    pub fn make_sequence(&mut self) -> Result<()> {
        self.domains.clear();
        self.strands.clear();
        self.add_domain_complements();

        self.nucleotides = self
            .domain_specs
            .iter()
            .flat_map(|d| d.allowed.iter().copied())
            .collect();

        let mut last = 0;
        for d in &self.domain_specs {
            let view = DomainView {
                start: last,
                stop: last + d.allowed.len(),
            };
            last = view.stop;
            self.domains.insert(d.name.clone(), view);
        }

        for s in &self.strand_specs {
            let mut views = Vec::with_capacity(s.domain_names.len());
            for dn in &s.domain_names {
                let view = self.domains.get(dn).copied().ok_or_else(|| {
                    DesignError::InvalidConfiguration(format!(
                        "strand {} references unknown domain {}",
                        s.name, dn
                    ))
                })?;
                views.push(view);
            }
            self.strands
                .insert(s.name.clone(), StrandView { domains: views });
        }

        self.constraints = Constraints::new(self.nucleotides.clone());
        self.add_complementarity_constraints();
        Ok(())
    }

    /// Pair position i of each domain X with position len-1-i of X*.
    fn add_complementarity_constraints(&mut self) {
        let pairs: Vec<(DomainView, DomainView)> = self
            .domains
            .iter()
            .filter(|(name, _)| !name.ends_with('*'))
            .filter_map(|(name, &view)| {
                self.domains
                    .get(&format!("{}*", name))
                    .map(|&comp| (view, comp))
            })
            .collect();
        for (view, comp) in pairs {
            for (k, i) in view.indices().enumerate() {
                let j = comp.stop - 1 - k;
                self.constraints
                    .complementarity_constraint(i, j, self.wobble_mutations);
            }
        }
    }

    /// Forbid a word in every strand window where it could occur.
    pub fn prevent_word(&mut self, codes: &str) -> Result<()> {
        let word = base::parse_bases(codes).ok_or_else(|| {
            DesignError::InvalidConfiguration(format!("bad prevented word {}", codes))
        })?;
        if word.is_empty() {
            return Err(DesignError::InvalidConfiguration("empty prevented word".into()).into());
        }
        let windows: Vec<Vec<usize>> = self
            .strands
            .values()
            .flat_map(|s| {
                let idx: Vec<usize> = s.indices().collect();
                (0..idx.len().saturating_sub(word.len() - 1))
                    .map(|start| idx[start..start + word.len()].to_vec())
                    .collect::<Vec<_>>()
            })
            .collect();
        for w in windows {
            self.constraints.prevent_word(w, word.clone());
        }
        Ok(())
    }

    /// Ground the pool to an initial constraint-satisfying assignment.
    pub fn initialize_sequence<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        match self.constraints.initial_sequence(rng) {
            Some(seq) => {
                self.nucleotides = seq;
                Ok(())
            }
            None => Err(DesignError::ConstraintUnsatisfiable(
                "initialization of the design sequence".into(),
            ))
            .context("while grounding the variable pool"),
        }
    }

    /// Mutate the listed positions, keeping all constraints satisfied.
    /// False means no mutation was made.
    pub fn mutate_sequence<R: Rng + ?Sized>(&mut self, positions: &[usize], rng: &mut R) -> bool {
        match self
            .constraints
            .make_mutation(&self.nucleotides, positions, rng)
        {
            Some(seq) => {
                self.nucleotides = seq;
                true
            }
            None => false,
        }
    }

    pub fn get_domain(&self, name: &str) -> Result<DomainView> {
        self.domains.get(name).copied().ok_or_else(|| {
            DesignError::InvalidConfiguration(format!("unknown domain {}", name)).into()
        })
    }

    pub fn get_strand(&self, name: &str) -> Result<StrandView> {
        self.strands.get(name).cloned().ok_or_else(|| {
            DesignError::InvalidConfiguration(format!("unknown strand {}", name)).into()
        })
    }

    /// Overwrite a domain with a grounded sequence compatible with its spec.
    pub fn set_domain(&mut self, name: &str, seq: &[Base]) -> Result<()> {
        let view = self.get_domain(name)?;
        if view.len() != seq.len() {
            return Err(DesignError::InvalidConfiguration(format!(
                "sequence length {} does not match domain {} (length {})",
                seq.len(),
                name,
                view.len()
            ))
            .into());
        }
        if !base::all_determined(seq) {
            return Err(DesignError::InvalidConfiguration(format!(
                "cannot assign degenerate codes to domain {}",
                name
            ))
            .into());
        }
        for (k, i) in view.indices().enumerate() {
            if !self.constraints.mask(i).admits(seq[k]) {
                return Err(DesignError::InvalidConfiguration(format!(
                    "base {} is not allowed at position {} of domain {}",
                    seq[k].to_char(),
                    k,
                    name
                ))
                .into());
            }
        }
        for (k, i) in view.indices().enumerate() {
            self.nucleotides[i] = seq[k];
        }
        Ok(())
    }

    /// Current text of every domain, for reporting.
    pub fn domain_sequences(&self) -> BTreeMap<String, String> {
        self.domains
            .iter()
            .map(|(name, view)| (name.clone(), base::format_bases(&view.to_sequence(&self.nucleotides))))
            .collect()
    }

    /// Current text of every strand, for reporting.
    pub fn strand_sequences(&self) -> BTreeMap<String, String> {
        self.strands
            .iter()
            .map(|(name, view)| (name.clone(), base::format_bases(&view.to_sequence(&self.nucleotides))))
            .collect()
    }

    /// True when no nucleotide is free to vary (degenerate designs can be
    /// evaluated without optimization).
    pub fn all_nucleotides_fixed(&self) -> bool {
        self.constraints.variable_positions().is_empty()
    }

    pub fn len(&self) -> usize {
        self.nucleotides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nucleotides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::format_bases;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_domain_design() -> DesignSequence {
        let mut seqs = DesignSequence::default();
        seqs.add_domain("a", "NNNN").unwrap();
        seqs.add_strand("s1", &["a".into()]).unwrap();
        seqs.add_strand("s2", &["a*".into()]).unwrap();
        seqs.make_sequence().unwrap();
        seqs
    }

    #[test]
    fn complements_materialized_lazily() {
        let seqs = two_domain_design();
        assert!(seqs.domains.contains_key("a*"));
        assert_eq!(seqs.get_domain("a*").unwrap().len(), 4);
    }

    #[test]
    fn initialization_satisfies_complementarity() {
        let mut seqs = two_domain_design();
        let mut rng = StdRng::seed_from_u64(9);
        seqs.initialize_sequence(&mut rng).unwrap();
        let a = seqs.get_domain("a").unwrap().to_sequence(&seqs.nucleotides);
        let b = seqs
            .get_domain("a*")
            .unwrap()
            .to_sequence(&seqs.nucleotides);
        for (i, &base) in a.iter().enumerate() {
            assert_eq!(b[a.len() - 1 - i], base.complement());
        }
    }

    #[test]
    fn mutation_keeps_complementarity() {
        let mut seqs = two_domain_design();
        let mut rng = StdRng::seed_from_u64(10);
        seqs.initialize_sequence(&mut rng).unwrap();
        let before = seqs.nucleotides.clone();
        assert!(seqs.mutate_sequence(&[0, 1], &mut rng));
        assert_ne!(seqs.nucleotides, before);
        assert!(seqs.constraints.satisfied(&seqs.nucleotides));
    }

    #[test]
    fn unknown_domain_rejected() {
        let mut seqs = DesignSequence::default();
        seqs.add_domain("a", "NNNN").unwrap();
        seqs.add_strand("s1", &["missing".into()]).unwrap();
        assert!(seqs.make_sequence().is_err());
    }

    #[test]
    fn set_domain_validates() {
        let mut seqs = two_domain_design();
        let mut rng = StdRng::seed_from_u64(12);
        seqs.initialize_sequence(&mut rng).unwrap();
        let acgu = crate::base::parse_bases("ACGU").unwrap();
        seqs.set_domain("a", &acgu).unwrap();
        assert_eq!(
            format_bases(
                &seqs
                    .get_domain("a")
                    .unwrap()
                    .to_sequence(&seqs.nucleotides)
            ),
            "ACGU"
        );
        assert!(seqs
            .set_domain("a", &crate::base::parse_bases("NNNN").unwrap())
            .is_err());
        assert!(seqs
            .set_domain("a", &crate::base::parse_bases("AC").unwrap())
            .is_err());
    }
}
