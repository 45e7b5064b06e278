// src/thermo.rs
// THERMODYNAMIC INTERFACE & REFERENCE ENGINE
// The designer consumes three pure functions behind the ThermoEngine trait:
// log partition function, pair probabilities, and the bonus variant that
// clamps enforced pairs with a large favorable energy. PairModel is a
// reference implementation: a McCaskill-style inside/outside dynamic program
// over Watson-Crick (and RNA wobble) pairs with per-pair stacking energies.
// It works in linear f64 space, which is adequate up to a few hundred
// nucleotides; a production kernel plugs in through the same trait.

use crate::base::Base;
use crate::error::DesignError;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

pub type Matrix = Vec<Vec<f64>>;

/// Gas constant in kcal/(mol K).
pub const GAS_CONSTANT: f64 = 0.0019872;

/// A catenated multi-strand sequence with cumulative nick positions
/// (nicks.last() == len). The text form writes '+' at each nick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NickSeq {
    pub bases: Vec<Base>,
    pub nicks: Vec<usize>,
}

impl NickSeq {
    pub fn from_strands(strands: &[Vec<Base>]) -> Self {
        let mut bases = Vec::new();
        let mut nicks = Vec::with_capacity(strands.len());
        for s in strands {
            bases.extend_from_slice(s);
            nicks.push(bases.len());
        }
        NickSeq { bases, nicks }
    }

    pub fn single(bases: Vec<Base>) -> Self {
        let n = bases.len();
        NickSeq {
            bases,
            nicks: vec![n],
        }
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn n_strands(&self) -> usize {
        self.nicks.len()
    }

    pub fn strands(&self) -> Vec<&[Base]> {
        let mut out = Vec::with_capacity(self.nicks.len());
        let mut prev = 0;
        for &n in &self.nicks {
            out.push(&self.bases[prev..n]);
            prev = n;
        }
        out
    }

    /// True when a strand break lies strictly between positions i and j.
    pub fn nick_between(&self, i: usize, j: usize) -> bool {
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        self.nicks.iter().any(|&b| b < self.len() && lo < b && b <= hi)
    }
}

impl fmt::Display for NickSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nick_iter = self.nicks.iter().peekable();
        for (i, b) in self.bases.iter().enumerate() {
            if let Some(&&n) = nick_iter.peek() {
                if n == i {
                    f.write_str("+")?;
                    nick_iter.next();
                }
            }
            write!(f, "{}", b.to_char())?;
        }
        Ok(())
    }
}

/// Optional timing hook carried by value; None disables.
#[derive(Clone, Default)]
pub struct EngineObserver {
    pub callback: Option<Arc<dyn Fn(&str, usize, f64) + Send + Sync>>,
}

impl fmt::Debug for EngineObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineObserver")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}

impl EngineObserver {
    pub fn timed<T>(&self, kind: &str, len: usize, f: impl FnOnce() -> T) -> T {
        match &self.callback {
            None => f(),
            Some(cb) => {
                let start = Instant::now();
                let out = f();
                cb(kind, len, start.elapsed().as_secs_f64());
                out
            }
        }
    }
}

/// The three functions the design core consumes. log_Z is finite, or -inf
/// for an empty ensemble; probability matrices are symmetric with rows
/// summing to 1 (diagonal = unpaired probability).
pub trait ThermoEngine: Send + Sync {
    fn partition_function(&self, seq: &NickSeq) -> Result<f64>;

    fn pair_probability(&self, seq: &NickSeq) -> Result<(Matrix, f64)>;

    /// Multiply exp(-beta * bonus) into the paired recursion entry of every
    /// enforced pair, then remove the bonus from the returned P and log_Z.
    fn bonus_pair_probability(
        &self,
        seq: &NickSeq,
        enforced: &[(usize, usize)],
        bonus_kcal: f64,
    ) -> Result<(Matrix, f64)>;
}

/// Reference pair model. Pair energies are stacking-flavored constants with
/// a SantaLucia-style monovalent/divalent salt shift; no loop entropies.
/// The returned log_Z carries neither the rotational-symmetry correction
/// nor the strand-association penalty; the complex layer applies both.
#[derive(Debug, Clone)]
pub struct PairModel {
    pub beta: f64,
    /// Score G-U pairs (RNA material).
    pub wobble: bool,
    /// Additive destabilization per pair from the salt environment.
    pub salt_shift: f64,
}

impl PairModel {
    pub fn new(temperature_k: f64, wobble: bool, sodium_molar: f64, magnesium_molar: f64) -> Self {
        let effective = (sodium_molar + 3.3 * magnesium_molar.sqrt()).max(1e-4);
        PairModel {
            beta: 1.0 / (GAS_CONSTANT * temperature_k),
            wobble,
            salt_shift: -0.114 * effective.ln(),
        }
    }

    fn pair_energy(&self, a: Base, b: Base) -> Option<f64> {
        let e = match (a, b) {
            (Base::G, Base::C) | (Base::C, Base::G) => -3.2,
            (Base::A, Base::U) | (Base::U, Base::A) => -2.1,
            (Base::G, Base::U) | (Base::U, Base::G) if self.wobble => -1.3,
            _ => return None,
        };
        Some(e + self.salt_shift)
    }

    /// Boltzmann weight of pair (i, j); zero when the pair is disallowed.
    /// Hairpin closures need at least 3 unpaired intra-strand nucleotides.
    fn pair_weight(&self, seq: &NickSeq, i: usize, j: usize) -> f64 {
        debug_assert!(i < j);
        if j - i < 4 && !seq.nick_between(i, j) {
            return 0.0;
        }
        match self.pair_energy(seq.bases[i], seq.bases[j]) {
            Some(e) => (-self.beta * e).exp(),
            None => 0.0,
        }
    }

    /// Inside pass. Returns (q, qb) where q[i][j] sums all non-crossing
    /// pairings of [i..=j] and qb[i][j] requires (i, j) paired.
    fn inside(
        &self,
        seq: &NickSeq,
        bonus: &HashMap<(usize, usize), f64>,
    ) -> (Matrix, Matrix) {
        let n = seq.len();
        let mut q = vec![vec![0.0; n]; n];
        let mut qb = vec![vec![0.0; n]; n];
        // q over an empty interval is 1; closures below keep that implicit.
        for i in 0..n {
            q[i][i] = 1.0;
        }
        for span in 1..n {
            for i in 0..n - span {
                let j = i + span;
                let mut w = self.pair_weight(seq, i, j);
                if let Some(&factor) = bonus.get(&(i, j)) {
                    // Enforced pairs stay allowed even between bases the
                    // energy model rejects; they score neutral before the
                    // bonus so the clamp always has something to act on.
                    if w == 0.0 {
                        w = 1.0;
                    }
                    w *= factor;
                }
                if w > 0.0 {
                    let inner = if i + 1 > j - 1 { 1.0 } else { q[i + 1][j - 1] };
                    qb[i][j] = w * inner;
                }

                let mut total = q[i][j - 1];
                for k in i..j {
                    if qb[k][j] > 0.0 {
                        let left = if k == i { 1.0 } else { q[i][k - 1] };
                        total += left * qb[k][j];
                    }
                }
                q[i][j] = total;
            }
        }
        (q, qb)
    }

    /// Outside pass: full pair-probability matrix from the inside arrays.
    /// Each structure is attributed to its innermost enclosing pair, so
    /// every (i, j) is counted exactly once.
    fn outside(&self, n: usize, q: &Matrix, qb: &Matrix) -> Matrix {
        let z = q[0][n - 1];
        let mut p = vec![vec![0.0; n]; n];
        if z <= 0.0 {
            return p;
        }
        let qr = |i: usize, j: isize| -> f64 {
            if j < i as isize {
                1.0
            } else {
                q[i][j as usize]
            }
        };
        for span in (1..n).rev() {
            for i in 0..n - span {
                let j = i + span;
                if qb[i][j] <= 0.0 {
                    continue;
                }
                let mut ext = qr(0, i as isize - 1) * qr(j + 1, n as isize - 1) / z;
                for k in 0..i {
                    for l in j + 1..n {
                        if p[k][l] <= 0.0 {
                            continue;
                        }
                        let loop_q = qr(k + 1, l as isize - 1);
                        if loop_q > 0.0 {
                            ext += p[k][l] * qr(k + 1, i as isize - 1)
                                * qr(j + 1, l as isize - 1)
                                / loop_q;
                        }
                    }
                }
                p[i][j] = qb[i][j] * ext;
                p[j][i] = p[i][j];
            }
        }
        for i in 0..n {
            let paired: f64 = (0..n).filter(|&j| j != i).map(|j| p[i][j]).sum();
            p[i][i] = 1.0 - paired;
        }
        p
    }

    fn evaluate(
        &self,
        seq: &NickSeq,
        bonus: &HashMap<(usize, usize), f64>,
    ) -> Result<(Matrix, f64)> {
        if seq.is_empty() {
            return Err(
                DesignError::InvalidConfiguration("empty sequence evaluated".into()).into(),
            );
        }
        let n = seq.len();
        let (q, qb) = self.inside(seq, bonus);
        let z = q[0][n - 1];
        if !z.is_finite() {
            return Err(DesignError::NumericDomain(format!(
                "partition function overflowed for {}",
                seq
            ))
            .into());
        }
        let p = self.outside(n, &q, &qb);
        Ok((p, z.ln()))
    }
}

impl ThermoEngine for PairModel {
    fn partition_function(&self, seq: &NickSeq) -> Result<f64> {
        let (_, log_z) = self.evaluate(seq, &HashMap::new())?;
        Ok(log_z)
    }

    fn pair_probability(&self, seq: &NickSeq) -> Result<(Matrix, f64)> {
        self.evaluate(seq, &HashMap::new())
    }

    fn bonus_pair_probability(
        &self,
        seq: &NickSeq,
        enforced: &[(usize, usize)],
        bonus_kcal: f64,
    ) -> Result<(Matrix, f64)> {
        let factor = (-self.beta * bonus_kcal).exp();
        let bonus: HashMap<(usize, usize), f64> = enforced
            .iter()
            .map(|&(i, j)| (if i < j { (i, j) } else { (j, i) }, factor))
            .collect();
        let (mut p, mut log_z) = self.evaluate(seq, &bonus)?;

        // Strip the clamp: enforced entries lose the bonus factor, the
        // diagonal is rebuilt, and log_Z drops |pairs| * ln(factor). The
        // reference model has no terminal penalty, so that correction is 1.
        for &(i, j) in bonus.keys() {
            p[i][j] /= factor;
            p[j][i] = p[i][j];
        }
        let n = seq.len();
        for i in 0..n {
            let paired: f64 = (0..n).filter(|&j| j != i).map(|j| p[i][j]).sum();
            p[i][i] = 1.0 - paired;
        }
        log_z -= bonus.len() as f64 * factor.ln();
        if log_z.is_nan() {
            return Err(DesignError::ThermoNan {
                sequence: seq.to_string(),
                depth: 0,
                enforced_pairs: enforced.to_vec(),
            }
            .into());
        }
        Ok((p, log_z))
    }
}

/// One cached evaluation. The fingerprint is cheap (crc32 over content);
/// the exact key is kept alongside and verified on every hit, so a
/// collision degrades to a miss, never to a wrong answer.
struct CacheEntry {
    seq: NickSeq,
    enforced: Vec<(usize, usize)>,
    probs: Arc<Matrix>,
    log_z: f64,
    bytes: usize,
    last_used: AtomicU64,
}

/// Concurrency-safe LRU keyed by content fingerprint. Readers see either a
/// fully populated entry or nothing; concurrent misses may duplicate work
/// and the first insert wins.
pub struct ThermoCache {
    inner: RwLock<HashMap<u64, CacheEntry>>,
    clock: AtomicU64,
    budget_bytes: usize,
}

impl fmt::Debug for ThermoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThermoCache")
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}

impl ThermoCache {
    pub fn new(budget_bytes: usize) -> Self {
        ThermoCache {
            inner: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            budget_bytes,
        }
    }

    pub fn fingerprint(seq: &NickSeq, enforced: &[(usize, usize)]) -> u64 {
        let mut h = crc32fast::Hasher::new();
        for b in &seq.bases {
            h.update(&[b.to_char() as u8]);
        }
        for &n in &seq.nicks {
            h.update(&(n as u32).to_be_bytes());
        }
        let content = h.finalize();

        let mut h = crc32fast::Hasher::new();
        for &(i, j) in enforced {
            h.update(&(i as u32).to_be_bytes());
            h.update(&(j as u32).to_be_bytes());
        }
        let pairs = h.finalize();
        ((content as u64) << 32) | pairs as u64
    }

    pub fn get(&self, seq: &NickSeq, enforced: &[(usize, usize)]) -> Option<(Arc<Matrix>, f64)> {
        let key = Self::fingerprint(seq, enforced);
        let guard = self.inner.read().expect("thermo cache poisoned");
        let entry = guard.get(&key)?;
        if entry.seq != *seq || entry.enforced != enforced {
            return None; // fingerprint collision
        }
        entry
            .last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some((entry.probs.clone(), entry.log_z))
    }

    pub fn insert(
        &self,
        seq: &NickSeq,
        enforced: &[(usize, usize)],
        probs: Arc<Matrix>,
        log_z: f64,
    ) {
        let key = Self::fingerprint(seq, enforced);
        let n = seq.len();
        let bytes = n * n * 8 + seq.bases.len() + 64;
        let mut guard = self.inner.write().expect("thermo cache poisoned");
        if guard.contains_key(&key) {
            return; // first insert wins
        }
        guard.insert(
            key,
            CacheEntry {
                seq: seq.clone(),
                enforced: enforced.to_vec(),
                probs,
                log_z,
                bytes,
                last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
            },
        );
        let mut total: usize = guard.values().map(|e| e.bytes).sum();
        while total > self.budget_bytes && guard.len() > 1 {
            let (&victim, _) = guard
                .iter()
                .filter(|(&k, _)| k != key)
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .expect("eviction candidate exists");
            if let Some(evicted) = guard.remove(&victim) {
                total -= evicted.bytes;
            }
        }
    }

    pub fn clear(&self) {
        self.inner.write().expect("thermo cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("thermo cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::parse_bases;

    fn model() -> PairModel {
        PairModel::new(310.15, true, 1.0, 0.0)
    }

    fn duplex(a: &str, b: &str) -> NickSeq {
        NickSeq::from_strands(&[parse_bases(a).unwrap(), parse_bases(b).unwrap()])
    }

    #[test]
    fn dimer_of_length_two() {
        // Two 1-nt strands; the only structures are open or one pair.
        let seq = duplex("G", "C");
        let m = model();
        let (p, log_z) = m.pair_probability(&seq).unwrap();
        let w = (m.beta * 3.2).exp();
        assert!((log_z - (1.0 + w).ln()).abs() < 1e-9);
        assert!((p[0][1] - w / (1.0 + w)).abs() < 1e-9);
        assert!((p[0][0] - 1.0 / (1.0 + w)).abs() < 1e-9);
    }

    #[test]
    fn hairpin_needs_loop_of_three() {
        let m = model();
        let short = NickSeq::single(parse_bases("GAAC").unwrap());
        assert!((m.partition_function(&short).unwrap() - 0.0).abs() < 1e-12);
        let ok = NickSeq::single(parse_bases("GAAAC").unwrap());
        assert!(m.partition_function(&ok).unwrap() > 0.0);
    }

    #[test]
    fn rows_are_stochastic_and_symmetric() {
        let seq = duplex("GGGAAACCC", "GGGUUUCCC");
        let (p, _) = model().pair_probability(&seq).unwrap();
        let n = seq.len();
        for i in 0..n {
            let row: f64 = (0..n).map(|j| p[i][j]).sum();
            assert!((row - 1.0).abs() < 1e-9, "row {} sums to {}", i, row);
            assert!(p[i][i] >= -1e-12);
            for j in 0..n {
                assert!((p[i][j] - p[j][i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn strong_duplex_pairs_dominate() {
        let seq = duplex("GGGG", "CCCC");
        let (p, _) = model().pair_probability(&seq).unwrap();
        // Outermost pair of the designed duplex should be likely.
        assert!(p[0][7] > 0.5);
    }

    #[test]
    fn bonus_variant_round_trips_log_z() {
        let m = model();
        let seq = duplex("GCGC", "GCGC");
        let plain = m.partition_function(&seq).unwrap();
        // A zero bonus changes nothing.
        let (_, log_z) = m.bonus_pair_probability(&seq, &[(0, 7)], 0.0).unwrap();
        assert!((log_z - plain).abs() < 1e-9);
    }

    #[test]
    fn bonus_clamps_enforced_pair() {
        let m = model();
        let seq = duplex("GCGC", "GCGC");
        let (p, log_z) = m.bonus_pair_probability(&seq, &[(0, 7)], -25.0).unwrap();
        // Under the clamp the conditional ensemble has the pair closed.
        assert!((p[0][7] * (-m.beta * -25.0).exp()).min(1.0) > 0.999);
        assert!(log_z.is_finite());
        // Conditional log_Z cannot exceed the unconstrained one.
        assert!(log_z <= m.partition_function(&seq).unwrap() + 1e-9);
    }

    #[test]
    fn cache_hits_verify_exact_key() {
        let cache = ThermoCache::new(1 << 20);
        let seq = duplex("GGG", "CCC");
        let probs = Arc::new(vec![vec![0.0; 6]; 6]);
        cache.insert(&seq, &[], probs.clone(), 1.5);
        let (hit, log_z) = cache.get(&seq, &[]).unwrap();
        assert!(Arc::ptr_eq(&hit, &probs));
        assert!((log_z - 1.5).abs() < 1e-12);
        assert!(cache.get(&seq, &[(0, 5)]).is_none());
    }

    #[test]
    fn cache_evicts_lru_under_budget() {
        // Each 6x6 entry is ~358 bytes; budget fits two.
        let cache = ThermoCache::new(800);
        let a = duplex("GGG", "CCC");
        let b = duplex("AAA", "UUU");
        let c = duplex("GGA", "UCC");
        let probs = Arc::new(vec![vec![0.0; 6]; 6]);
        cache.insert(&a, &[], probs.clone(), 0.1);
        cache.insert(&b, &[], probs.clone(), 0.2);
        assert!(cache.get(&a, &[]).is_some()); // refresh a
        cache.insert(&c, &[], probs, 0.3);
        assert!(cache.get(&b, &[]).is_none());
        assert!(cache.get(&a, &[]).is_some());
        assert!(cache.get(&c, &[]).is_some());
    }

    #[test]
    fn display_marks_nicks() {
        let seq = duplex("GGG", "CCC");
        assert_eq!(seq.to_string(), "GGG+CCC");
    }
}
