// src/weights.rs
// DEFECT WEIGHTS
// A weight names any combination of tube, complex, strand, and domain
// scopes and a multiplier. Resolution turns the specification list into
// per-complex nucleotide multipliers (complex coordinates), then per-tube
// copies that tube-scoped weights refine further.

use crate::complex::Complex;
use crate::error::DesignError;
use crate::sequence::DesignSequence;
use crate::tube::{ComplexWeights, Tube};
use anyhow::Result;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Weight {
    pub tube: Option<String>,
    pub complex: Option<String>,
    pub strand: Option<String>,
    pub domain: Option<String>,
    pub weight: f64,
}

impl Weight {
    pub fn new(
        tube: Option<String>,
        complex: Option<String>,
        strand: Option<String>,
        domain: Option<String>,
        weight: f64,
    ) -> Result<Self> {
        if tube.is_none() && complex.is_none() && strand.is_none() && domain.is_none() {
            return Err(DesignError::InvalidConfiguration(
                "weight must have a scope: tube, complex, strand, and/or domain".into(),
            )
            .into());
        }
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(
                DesignError::InvalidConfiguration(format!("bad weight {}", weight)).into(),
            );
        }
        Ok(Weight {
            tube,
            complex,
            strand,
            domain,
            weight,
        })
    }
}

/// Per-position strand and domain names of a complex, for scope matching.
#[derive(Debug, Clone)]
pub struct ReversedComplex {
    strands: Vec<String>,
    domains: Vec<String>,
}

impl ReversedComplex {
    pub fn new(seqs: &DesignSequence, complex: &Complex) -> Result<Self> {
        let mut strands = Vec::with_capacity(complex.len());
        let mut domains = Vec::with_capacity(complex.len());
        for strand_name in &complex.strand_names {
            let spec = seqs
                .strand_specs
                .iter()
                .find(|s| &s.name == strand_name)
                .ok_or_else(|| {
                    DesignError::InvalidConfiguration(format!(
                        "complex {} uses undeclared strand {}",
                        complex.name, strand_name
                    ))
                })?;
            for domain_name in &spec.domain_names {
                let view = seqs.get_domain(domain_name)?;
                for _ in 0..view.len() {
                    strands.push(strand_name.clone());
                    domains.push(domain_name.clone());
                }
            }
        }
        Ok(ReversedComplex { strands, domains })
    }

    pub fn strands(&self) -> &[String] {
        &self.strands
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

#[derive(Debug, Clone, Default)]
pub struct Weights {
    pub specifications: Vec<Weight>,
    /// Complex index -> per-position multiplier, on-targets only.
    pub per_complex: HashMap<usize, Vec<f64>>,
    /// One ComplexWeights per tube, aligned with the design's tube list.
    pub per_tube: Vec<ComplexWeights>,
}

impl Weights {
    pub fn new(specifications: Vec<Weight>) -> Self {
        Weights {
            specifications,
            per_complex: HashMap::new(),
            per_tube: Vec::new(),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.specifications.is_empty()
    }

    /// Resolve specifications against the design's complexes and tubes.
    pub fn resolve(
        &mut self,
        seqs: &DesignSequence,
        complexes: &[Complex],
        tubes: &[Tube],
    ) -> Result<()> {
        self.per_complex.clear();
        self.per_tube.clear();

        let mut on_targets = Vec::new();
        let mut reversed: HashMap<usize, ReversedComplex> = HashMap::new();
        for (i, c) in complexes.iter().enumerate() {
            if c.is_on_target() {
                self.per_complex.insert(i, vec![1.0; c.len()]);
                reversed.insert(i, ReversedComplex::new(seqs, c)?);
                on_targets.push(i);
            }
        }

        let (tube_specific, complex_specific): (Vec<&Weight>, Vec<&Weight>) = self
            .specifications
            .iter()
            .partition(|w| w.tube.is_some());

        for w in complex_specific {
            let targets = match &w.complex {
                Some(name) => vec![find_complex(name, complexes)?],
                None => on_targets.clone(),
            };
            for i in targets {
                let weights = self.per_complex.get_mut(&i).ok_or_else(|| {
                    DesignError::InvalidConfiguration(format!(
                        "weight applies to off-target complex {}",
                        complexes[i].name
                    ))
                })?;
                apply_to_complex(weights, &reversed[&i], w);
            }
        }

        for tube in tubes {
            let mut cw = ComplexWeights::new();
            for t in &tube.targets {
                if complexes[t.complex_index].is_on_target() {
                    cw.insert(
                        t.complex_index,
                        self.per_complex[&t.complex_index].clone(),
                    );
                }
            }
            self.per_tube.push(cw);
        }

        for w in tube_specific {
            let tube_name = w.tube.as_deref().expect("partitioned on tube");
            let ti = find_tube(tube_name, tubes)?;
            let cw = &mut self.per_tube[ti];
            let members: Vec<usize> = cw.keys().copied().collect();
            let targets = match &w.complex {
                Some(name) => {
                    let ci = find_complex(name, complexes)?;
                    if !members.contains(&ci) {
                        return Err(DesignError::InvalidConfiguration(format!(
                            "tube {} does not contain on-target {}",
                            tube_name, name
                        ))
                        .into());
                    }
                    vec![ci]
                }
                None => members,
            };
            for i in targets {
                apply_to_complex(cw.get_mut(&i).expect("member exists"), &reversed[&i], w);
            }
        }
        Ok(())
    }

    /// Weights for one tube by index, empty when unresolved or trivial.
    pub fn for_tube(&self, tube_index: usize) -> Option<&ComplexWeights> {
        self.per_tube.get(tube_index)
    }
}

/// Multiply the weight into matching positions; tube and complex scope are
/// already fixed by the caller, leaving the four strand/domain cases.
fn apply_to_complex(weights: &mut [f64], reversed: &ReversedComplex, w: &Weight) {
    let strands = reversed.strands();
    let domains = reversed.domains();
    for (k, value) in weights.iter_mut().enumerate() {
        let strand_ok = w.strand.as_ref().map_or(true, |s| s == &strands[k]);
        let domain_ok = w.domain.as_ref().map_or(true, |d| d == &domains[k]);
        if strand_ok && domain_ok {
            *value *= w.weight;
        }
    }
}

pub fn find_complex(name: &str, complexes: &[Complex]) -> Result<usize> {
    complexes
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| DesignError::InvalidConfiguration(format!("complex {} not found", name)).into())
}

pub fn find_tube(name: &str, tubes: &[Tube]) -> Result<usize> {
    tubes
        .iter()
        .position(|t| t.name == name)
        .ok_or_else(|| DesignError::InvalidConfiguration(format!("tube {} not found", name)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::DecompositionParameters;
    use crate::model::ModelKey;
    use crate::structure::Structure;
    use crate::tube::TubeTarget;

    fn fixture() -> (DesignSequence, Vec<Complex>, Vec<Tube>) {
        let mut seqs = DesignSequence::default();
        seqs.add_domain("a", "NNNN").unwrap();
        seqs.add_domain("b", "NNNN").unwrap();
        seqs.add_strand("s1", &["a".into(), "b".into()]).unwrap();
        seqs.add_strand("s2", &["b*".into(), "a*".into()]).unwrap();
        seqs.make_sequence().unwrap();
        let duplex = Complex::new(
            "duplex".into(),
            vec!["s1".into(), "s2".into()],
            vec![
                seqs.get_strand("s1").unwrap(),
                seqs.get_strand("s2").unwrap(),
            ],
            ModelKey::default(),
            Some(Structure::parse("((((((((+))))))))").unwrap()),
            DecompositionParameters::default(),
            0.0,
        )
        .unwrap();
        let complexes = vec![duplex];
        let tubes = vec![Tube::new(
            "t1".into(),
            vec![TubeTarget {
                complex_index: 0,
                target_conc: 1e-6,
            }],
            &complexes,
        )
        .unwrap()];
        (seqs, complexes, tubes)
    }

    #[test]
    fn scopeless_weight_rejected() {
        assert!(Weight::new(None, None, None, None, 2.0).is_err());
    }

    #[test]
    fn domain_scope_hits_matching_positions() {
        let (seqs, complexes, tubes) = fixture();
        let mut weights = Weights::new(vec![Weight::new(
            None,
            None,
            None,
            Some("a".into()),
            3.0,
        )
        .unwrap()]);
        weights.resolve(&seqs, &complexes, &tubes).unwrap();
        let w = &weights.per_complex[&0];
        // s1 = a b, s2 = b* a*: only the four "a" positions get 3.0.
        assert_eq!(&w[0..4], &[3.0; 4]);
        assert_eq!(&w[4..16], &[1.0; 12]);
    }

    #[test]
    fn strand_and_domain_scope_intersect() {
        let (seqs, complexes, tubes) = fixture();
        let mut weights = Weights::new(vec![Weight::new(
            None,
            None,
            Some("s2".into()),
            Some("a*".into()),
            0.5,
        )
        .unwrap()]);
        weights.resolve(&seqs, &complexes, &tubes).unwrap();
        let w = &weights.per_complex[&0];
        assert_eq!(&w[0..12], &[1.0; 12]);
        assert_eq!(&w[12..16], &[0.5; 4]);
    }

    #[test]
    fn tube_scope_only_touches_that_tube() {
        let (seqs, complexes, tubes) = fixture();
        let mut weights = Weights::new(vec![Weight::new(
            Some("t1".into()),
            None,
            None,
            None,
            2.0,
        )
        .unwrap()]);
        weights.resolve(&seqs, &complexes, &tubes).unwrap();
        assert_eq!(weights.per_complex[&0], vec![1.0; 16]);
        assert_eq!(weights.per_tube[0][&0], vec![2.0; 16]);
    }

    #[test]
    fn unknown_names_rejected() {
        let (seqs, complexes, tubes) = fixture();
        let mut weights = Weights::new(vec![Weight::new(
            Some("nope".into()),
            None,
            None,
            None,
            2.0,
        )
        .unwrap()]);
        assert!(weights.resolve(&seqs, &complexes, &tubes).is_err());
    }
}
