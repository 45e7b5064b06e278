// src/spec.rs
// SPECIFICATION I/O
// The serialized design problem: domains, strands, complexes (dpp or
// dpp-rle structures), tubes with target concentrations, weights, model,
// and hyperparameters. Reports carry everything the spec promises back
// out, with structures re-emitted in rle form.

use crate::base;
use crate::decompose::DecompositionParameters;
use crate::design::Design;
use crate::designer::{DesignParameters, DesignStats, Designer};
use crate::error::DesignError;
use crate::model::{Ensemble, Material, ModelKey};
use crate::result::{Candidate, SamplingMode};
use crate::sequence::DesignSequence;
use crate::structure::Structure;
use crate::weights::Weight;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_RAM_BUDGET_MB: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesignSpec {
    #[serde(default)]
    pub model: ModelSpec,
    pub domains: Vec<DomainEntry>,
    pub strands: Vec<StrandEntry>,
    pub complexes: Vec<ComplexEntry>,
    pub tubes: Vec<TubeEntry>,
    #[serde(default)]
    pub weights: Vec<WeightEntry>,
    #[serde(default)]
    pub prevented_patterns: Vec<String>,
    #[serde(default)]
    pub parameters: ParameterEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub material: Material,
    pub temperature_c: f64,
    pub sodium: f64,
    pub magnesium: f64,
    pub ensemble: Ensemble,
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec {
            material: Material::Rna,
            temperature_c: 37.0,
            sodium: 1.0,
            magnesium: 0.0,
            ensemble: Ensemble::Stacking,
        }
    }
}

impl ModelSpec {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(
            self.material,
            self.temperature_c + 273.15,
            self.sodium,
            self.magnesium,
            self.ensemble,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainEntry {
    pub name: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrandEntry {
    pub name: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComplexEntry {
    pub name: String,
    pub strands: Vec<String>,
    /// dpp or dpp-rle; absent for explicit off-targets.
    #[serde(default)]
    pub structure: Option<String>,
    #[serde(default)]
    pub bonus: f64,
    /// Per-complex decomposition overrides.
    #[serde(default)]
    pub n_split: Option<usize>,
    #[serde(default)]
    pub h_split: Option<usize>,
    #[serde(default)]
    pub f_split: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TubeEntry {
    pub name: String,
    pub complexes: Vec<TubeComplexEntry>,
    /// Generate every rotation-distinct off-target up to this strand
    /// count.
    #[serde(default)]
    pub max_off_target_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TubeComplexEntry {
    pub complex: String,
    pub concentration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightEntry {
    #[serde(default)]
    pub tube: Option<String>,
    #[serde(default)]
    pub complex: Option<String>,
    #[serde(default)]
    pub strand: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParameterEntry {
    pub n_split: usize,
    pub h_split: usize,
    pub f_split: f64,
    pub f_stop: f64,
    pub f_refocus: f64,
    pub f_passive: f64,
    pub f_stringent: f64,
    pub m_bad: u32,
    pub m_reseed: u32,
    pub m_reopt: u32,
    pub bonus_per_split: f64,
    pub sampling: SamplingMode,
    pub seed: u64,
    pub ram_budget_mb: usize,
    pub timeout_s: Option<f64>,
    pub archive_size: usize,
    pub wobble: bool,
}

impl Default for ParameterEntry {
    fn default() -> Self {
        let d = DecompositionParameters::default();
        let p = DesignParameters::default();
        ParameterEntry {
            n_split: d.n_split,
            h_split: d.h_split,
            f_split: d.f_split,
            f_stop: p.f_stop,
            f_refocus: p.f_refocus,
            f_passive: p.f_passive,
            f_stringent: p.f_stringent,
            m_bad: p.m_bad,
            m_reseed: p.m_reseed,
            m_reopt: p.m_reopt,
            bonus_per_split: d.bonus_per_split,
            sampling: p.sampling,
            seed: p.seed,
            ram_budget_mb: DEFAULT_RAM_BUDGET_MB,
            timeout_s: p.timeout_s,
            archive_size: p.archive_size,
            wobble: false,
        }
    }
}

impl ParameterEntry {
    pub fn decomposition(&self) -> DecompositionParameters {
        DecompositionParameters {
            n_split: self.n_split,
            h_split: self.h_split,
            f_split: self.f_split,
            bonus_per_split: self.bonus_per_split,
        }
    }

    pub fn design(&self) -> DesignParameters {
        DesignParameters {
            f_stop: self.f_stop,
            f_refocus: self.f_refocus,
            f_passive: self.f_passive,
            f_stringent: self.f_stringent,
            m_bad: self.m_bad,
            m_reseed: self.m_reseed,
            m_reopt: self.m_reopt,
            sampling: self.sampling,
            seed: self.seed,
            archive_size: self.archive_size,
            timeout_s: self.timeout_s,
        }
    }
}

impl DesignSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parsing design specification")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing design specification")
    }

    /// Materialize the design: sequences, constraints, complexes, tubes,
    /// generated off-targets, and resolved weights. The sequence pool is
    /// left degenerate; the caller initializes it with a seeded rng.
    pub fn build(&self) -> Result<Design> {
        let mut seqs = DesignSequence {
            wobble_mutations: self.parameters.wobble,
            ..Default::default()
        };
        for d in &self.domains {
            seqs.add_domain(&d.name, &d.sequence)?;
        }
        for s in &self.strands {
            seqs.add_strand(&s.name, &s.domains)?;
        }
        seqs.make_sequence()?;
        for pattern in &self.prevented_patterns {
            seqs.prevent_word(pattern)?;
        }

        let model = self.model.key();
        let mut design = Design::new(
            seqs,
            self.parameters.ram_budget_mb.saturating_mul(1 << 20),
        );

        let defaults = self.parameters.decomposition();
        let mut complex_index = BTreeMap::new();
        for c in &self.complexes {
            let structure = c
                .structure
                .as_deref()
                .map(Structure::parse)
                .transpose()
                .with_context(|| format!("complex {}", c.name))?;
            let params = DecompositionParameters {
                n_split: c.n_split.unwrap_or(defaults.n_split),
                h_split: c.h_split.unwrap_or(defaults.h_split),
                f_split: c.f_split.unwrap_or(defaults.f_split),
                bonus_per_split: defaults.bonus_per_split,
            };
            let idx = design.add_complex(&c.name, &c.strands, model, structure, params, c.bonus)?;
            complex_index.insert(c.name.clone(), idx);
        }

        for t in &self.tubes {
            let entries = t
                .complexes
                .iter()
                .map(|tc| {
                    complex_index
                        .get(&tc.complex)
                        .copied()
                        .map(|i| (i, tc.concentration))
                        .ok_or_else(|| {
                            DesignError::InvalidConfiguration(format!(
                                "tube {} references missing complex {}",
                                t.name, tc.complex
                            ))
                            .into()
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let tube_idx = design.add_tube(&t.name, entries)?;
            if let Some(max_size) = t.max_off_target_size {
                design.generate_off_targets(tube_idx, max_size, defaults)?;
            }
        }

        design.add_structure_complementarity();

        let weight_specs = self
            .weights
            .iter()
            .map(|w| {
                Weight::new(
                    w.tube.clone(),
                    w.complex.clone(),
                    w.strand.clone(),
                    w.domain.clone(),
                    w.weight,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        design.resolve_weights(weight_specs)?;
        Ok(design)
    }
}

// ---------------------------------------------------------------------------
// Reports

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignReport {
    pub success: bool,
    pub design_defect: f64,
    pub stats: StatsReport,
    pub results: Vec<ResultReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub iterations: u64,
    pub mutations_attempted: u64,
    pub mutations_accepted: u64,
    pub reseeds: u64,
    pub redecompositions: u64,
    pub refocus_history: Vec<usize>,
    pub design_time_s: f64,
}

impl From<&DesignStats> for StatsReport {
    fn from(s: &DesignStats) -> Self {
        StatsReport {
            iterations: s.iterations,
            mutations_attempted: s.mutations_attempted,
            mutations_accepted: s.mutations_accepted,
            reseeds: s.reseeds,
            redecompositions: s.redecompositions,
            refocus_history: s.refocus_history.clone(),
            design_time_s: s.design_time_s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultReport {
    /// Per-objective normalized defect totals.
    pub defects: Vec<f64>,
    pub design_defect: f64,
    pub domains: BTreeMap<String, String>,
    pub strands: BTreeMap<String, String>,
    pub complexes: Vec<ComplexReport>,
    pub tubes: Vec<TubeReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplexReport {
    pub name: String,
    pub sequence: String,
    /// rle-encoded target structure for on-targets.
    pub structure: Option<String>,
    pub log_pfunc: f64,
    pub defect: f64,
    pub normalized_defect: f64,
    /// Sparse pair probabilities (i, j, p) above 1e-3, on-targets only.
    pub pair_probabilities: Option<Vec<(usize, usize, f64)>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TubeReport {
    pub name: String,
    pub nucleotide_concentration: f64,
    pub structural_defect: f64,
    pub concentration_defect: f64,
    pub normalized_defect: f64,
    pub complexes: Vec<TubeComplexReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TubeComplexReport {
    pub name: String,
    pub concentration: f64,
    pub target_concentration: f64,
}

/// Build the report for one candidate; the thermo cache makes the extra
/// lookups cheap when the candidate was just evaluated.
fn result_report(design: &mut Design, candidate: &Candidate) -> Result<ResultReport> {
    design.sequences.nucleotides = candidate.sequence.clone();
    let obs = crate::thermo::EngineObserver::default();
    let everything = crate::design::EnsemblePartition::default();
    let lpfs = design.log_pfuncs(0, &everything, &obs)?;
    let (_, tube_evals) = design.normalized_defect(0, &everything, &obs)?;

    let mut complexes = Vec::with_capacity(design.complexes.len());
    for (c, &log_pfunc) in design.complexes.iter().zip(&lpfs) {
        let defect = c
            .defect(design.sequences.nucleotides.as_slice(), &design.models, 0, &obs)?
            .total();
        let pair_probabilities = if c.is_on_target() {
            let p = c.pair_probabilities(
                design.sequences.nucleotides.as_slice(),
                &design.models,
                0,
                &obs,
            )?;
            let mut sparse = Vec::new();
            for i in 0..p.len() {
                for j in i + 1..p.len() {
                    if p[i][j] > 1e-3 {
                        sparse.push((i, j, p[i][j]));
                    }
                }
            }
            Some(sparse)
        } else {
            None
        };
        complexes.push(ComplexReport {
            name: c.name.clone(),
            sequence: c.nick_seq(&design.sequences.nucleotides).to_string(),
            structure: c.target.as_ref().map(|s| s.dp_rle()),
            log_pfunc: if log_pfunc.is_finite() {
                log_pfunc
            } else {
                f64::MIN
            },
            defect,
            normalized_defect: defect / c.len().max(1) as f64,
            pair_probabilities,
        });
    }

    let tubes = design
        .tubes
        .iter()
        .zip(&tube_evals)
        .map(|(t, eval)| TubeReport {
            name: t.name.clone(),
            nucleotide_concentration: t.nucleotide_concentration,
            structural_defect: eval.structural,
            concentration_defect: eval.concentration,
            normalized_defect: eval.defect.total(),
            complexes: t
                .targets
                .iter()
                .zip(&eval.concentrations)
                .map(|(target, &conc)| TubeComplexReport {
                    name: design.complexes[target.complex_index].name.clone(),
                    concentration: conc,
                    target_concentration: target.target_conc,
                })
                .collect(),
        })
        .collect();

    Ok(ResultReport {
        defects: candidate.totals(),
        design_defect: candidate.weighted_total(),
        domains: design.sequences.domain_sequences(),
        strands: design.sequences.strand_sequences(),
        complexes,
        tubes,
    })
}

/// The full output: the best candidate first, then the rest of the archive.
pub fn design_report(designer: &mut Designer) -> Result<DesignReport> {
    if designer.best.sequence.is_empty() {
        // Interrupted before the first root evaluation; report the live
        // sequence instead of the placeholder.
        designer.best = designer.evaluate_full()?;
    }
    let mut candidates = vec![designer.best.clone()];
    for c in &designer.archive.results {
        if !c.same_totals(&designer.best) {
            candidates.push(c.clone());
        }
    }
    let mut results = Vec::with_capacity(candidates.len());
    for c in &candidates {
        results.push(result_report(&mut designer.design, c)?);
    }
    Ok(DesignReport {
        success: designer.success(),
        design_defect: designer.best.weighted_total(),
        stats: StatsReport::from(&designer.stats),
        results,
    })
}

/// Report the current (initialized) sequences without optimizing.
pub fn evaluate_report(design: &mut Design) -> Result<DesignReport> {
    let obs = crate::thermo::EngineObserver::default();
    let everything = crate::design::EnsemblePartition::default();
    let (defects, _) = design.normalized_defect(0, &everything, &obs)?;
    let candidate = Candidate::new(design.sequences.nucleotides.clone(), defects);
    let design_defect = candidate.weighted_total();
    let results = vec![result_report(design, &candidate)?];
    Ok(DesignReport {
        success: false,
        design_defect,
        stats: StatsReport::from(&DesignStats::default()),
        results,
    })
}

/// Validate a grounded sequence against the base codes of the spec.
pub fn parse_sequence(text: &str) -> Result<Vec<crate::base::Base>> {
    base::parse_bases(text)
        .ok_or_else(|| DesignError::InvalidConfiguration(format!("bad sequence {}", text)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hairpin_spec() -> &'static str {
        r#"{
            "domains": [{"name": "a", "sequence": "NNNN"}],
            "strands": [
                {"name": "s1", "domains": ["a"]},
                {"name": "s2", "domains": ["a*"]}
            ],
            "complexes": [
                {"name": "duplex", "strands": ["s1", "s2"], "structure": "(4+)4"}
            ],
            "tubes": [
                {"name": "t1", "complexes": [{"complex": "duplex", "concentration": 1e-6}]}
            ]
        }"#
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = DesignSpec::from_json(hairpin_spec()).unwrap();
        let text = spec.to_json().unwrap();
        let again = DesignSpec::from_json(&text).unwrap();
        assert_eq!(text, again.to_json().unwrap());
    }

    #[test]
    fn build_produces_working_design() {
        let spec = DesignSpec::from_json(hairpin_spec()).unwrap();
        let design = spec.build().unwrap();
        assert_eq!(design.complexes.len(), 1);
        assert_eq!(design.tubes.len(), 1);
        assert_eq!(design.sequences.len(), 8);
    }

    #[test]
    fn unknown_fields_rejected() {
        let bad = hairpin_spec().replace("\"domains\"", "\"bogus\": 1, \"domains\"");
        assert!(DesignSpec::from_json(&bad).is_err());
    }

    #[test]
    fn missing_complex_in_tube_rejected() {
        let bad = hairpin_spec().replace("{\"complex\": \"duplex\"", "{\"complex\": \"nope\"");
        let spec = DesignSpec::from_json(&bad).unwrap();
        assert!(spec.build().is_err());
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = DesignReport {
            success: true,
            design_defect: 0.01,
            stats: StatsReport::from(&DesignStats::default()),
            results: vec![],
        };
        let text = serde_json::to_string(&report).unwrap();
        let parsed: DesignReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), text);
    }
}
