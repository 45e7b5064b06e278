// src/model.rs
// MODEL MAP
// A Model key names a thermodynamic condition bundle (material, temperature,
// salts, ensemble). ModelMap lazily creates one ThermoEnviron per key (the
// engine plus its caches) and splits the RAM budget across live models.

use crate::error::DesignError;
use crate::thermo::{EngineObserver, Matrix, NickSeq, PairModel, ThermoCache, ThermoEngine};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    Rna,
    Dna,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensemble {
    Stacking,
    NoStacking,
}

/// Hashable model key. Temperature and salts are stored in millidegrees /
/// micromolar so the key stays Eq-able; accessors return floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub material: Material,
    pub temperature_mk: u64,
    pub sodium_umolar: u64,
    pub magnesium_umolar: u64,
    pub ensemble: Ensemble,
}

impl ModelKey {
    pub fn new(
        material: Material,
        temperature_k: f64,
        sodium_molar: f64,
        magnesium_molar: f64,
        ensemble: Ensemble,
    ) -> Self {
        ModelKey {
            material,
            temperature_mk: (temperature_k * 1e3).round() as u64,
            sodium_umolar: (sodium_molar * 1e6).round() as u64,
            magnesium_umolar: (magnesium_molar * 1e6).round() as u64,
            ensemble,
        }
    }

    pub fn temperature_k(&self) -> f64 {
        self.temperature_mk as f64 / 1e3
    }

    pub fn sodium_molar(&self) -> f64 {
        self.sodium_umolar as f64 / 1e6
    }

    pub fn magnesium_molar(&self) -> f64 {
        self.magnesium_umolar as f64 / 1e6
    }

    /// 1/RT in mol/kcal.
    pub fn beta(&self) -> f64 {
        1.0 / (crate::thermo::GAS_CONSTANT * self.temperature_k())
    }

    /// Free-energy penalty per strand association, kcal/mol.
    pub fn join_penalty_kcal(&self) -> f64 {
        1.96
    }

    /// Conventional parameter-set name, for reports.
    pub fn parameter_set(&self) -> &'static str {
        match self.material {
            Material::Rna => "rna06",
            Material::Dna => "dna04",
        }
    }
}

impl Default for ModelKey {
    fn default() -> Self {
        ModelKey::new(Material::Rna, 310.15, 1.0, 0.0, Ensemble::Stacking)
    }
}

/// A model's engine and caches. The pfunc memo holds single-strand log
/// partition functions used by the passive-complex proxy.
pub struct ThermoEnviron {
    pub key: ModelKey,
    engine: Box<dyn ThermoEngine>,
    cache: ThermoCache,
    strand_pfuncs: RwLock<HashMap<NickSeq, f64>>,
}

impl ThermoEnviron {
    pub fn new(key: ModelKey, cache_bytes: usize) -> Self {
        let engine = PairModel::new(
            key.temperature_k(),
            key.material == Material::Rna,
            key.sodium_molar(),
            key.magnesium_molar(),
        );
        ThermoEnviron {
            key,
            engine: Box::new(engine),
            cache: ThermoCache::new(cache_bytes),
            strand_pfuncs: RwLock::new(HashMap::new()),
        }
    }

    pub fn partition_function(&self, seq: &NickSeq, obs: &EngineObserver) -> Result<f64> {
        if let Some((_, log_z)) = self.cache.get(seq, &[]) {
            return Ok(log_z);
        }
        let log_z = obs
            .timed("partition function", seq.len(), || {
                self.engine.partition_function(seq)
            })
            .with_context(|| format!("partition function of {}", seq))?;
        check_finite_or_nan(log_z, seq, &[])?;
        Ok(log_z)
    }

    pub fn pair_probability(
        &self,
        seq: &NickSeq,
        obs: &EngineObserver,
    ) -> Result<(Arc<Matrix>, f64)> {
        self.bonus_pair_probability(seq, &[], 0.0, obs)
    }

    /// Cached bonus-variant evaluation; the cache key includes the enforced
    /// pairs so conditional and unconditional results never mix.
    pub fn bonus_pair_probability(
        &self,
        seq: &NickSeq,
        enforced: &[(usize, usize)],
        bonus_kcal: f64,
        obs: &EngineObserver,
    ) -> Result<(Arc<Matrix>, f64)> {
        if let Some(hit) = self.cache.get(seq, enforced) {
            return Ok(hit);
        }
        let (probs, log_z) = obs
            .timed("pair probability", seq.len(), || {
                if enforced.is_empty() {
                    self.engine.pair_probability(seq)
                } else {
                    self.engine.bonus_pair_probability(seq, enforced, bonus_kcal)
                }
            })
            .with_context(|| format!("pair probabilities of {}", seq))?;
        check_finite_or_nan(log_z, seq, enforced)?;
        let probs = Arc::new(probs);
        self.cache.insert(seq, enforced, probs.clone(), log_z);
        Ok((probs, log_z))
    }

    /// Memoized single-strand log partition function.
    pub fn strand_pfunc(&self, strand: &[crate::base::Base], obs: &EngineObserver) -> Result<f64> {
        let seq = NickSeq::single(strand.to_vec());
        {
            let memo = self.strand_pfuncs.read().expect("pfunc memo poisoned");
            if let Some(&log_z) = memo.get(&seq) {
                return Ok(log_z);
            }
        }
        let log_z = self.partition_function(&seq, obs)?;
        self.strand_pfuncs
            .write()
            .expect("pfunc memo poisoned")
            .entry(seq)
            .or_insert(log_z);
        Ok(log_z)
    }

    pub fn clear_caches(&self) {
        self.cache.clear();
        self.strand_pfuncs
            .write()
            .expect("pfunc memo poisoned")
            .clear();
    }
}

fn check_finite_or_nan(log_z: f64, seq: &NickSeq, enforced: &[(usize, usize)]) -> Result<()> {
    if log_z.is_nan() {
        return Err(DesignError::ThermoNan {
            sequence: seq.to_string(),
            depth: 0,
            enforced_pairs: enforced.to_vec(),
        }
        .into());
    }
    Ok(())
}

/// Lazily populated key -> environment map shared across complexes.
pub struct ModelMap {
    environs: RwLock<HashMap<ModelKey, Arc<ThermoEnviron>>>,
    ram_budget_bytes: usize,
}

impl ModelMap {
    pub fn new(ram_budget_bytes: usize) -> Self {
        ModelMap {
            environs: RwLock::new(HashMap::new()),
            ram_budget_bytes,
        }
    }

    /// Fetch or create the environment for a key. Creation resizes nothing
    /// retroactively: each live model gets an equal share of the budget at
    /// the time it first appears.
    pub fn get(&self, key: ModelKey) -> Arc<ThermoEnviron> {
        {
            let guard = self.environs.read().expect("model map poisoned");
            if let Some(env) = guard.get(&key) {
                return env.clone();
            }
        }
        let mut guard = self.environs.write().expect("model map poisoned");
        let share = self.ram_budget_bytes / (guard.len() + 1).max(1);
        guard
            .entry(key)
            .or_insert_with(|| Arc::new(ThermoEnviron::new(key, share)))
            .clone()
    }

    pub fn clear_caches(&self) {
        for env in self.environs.read().expect("model map poisoned").values() {
            env.clear_caches();
        }
    }

    pub fn len(&self) -> usize {
        self.environs.read().expect("model map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ModelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMap")
            .field("models", &self.len())
            .field("ram_budget_bytes", &self.ram_budget_bytes)
            .finish()
    }
}
