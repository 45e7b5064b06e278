// src/decompose.rs
// DECOMPOSITION TREE
// Each complex owns a binary tree of conditional sub-problems. A node owns a
// sub-sequence descriptor (index ranges in the complex's catenated
// coordinates) and the pairs its ancestors clamped. Splitting at pair (i, j)
// yields children over [i..j] and [j..i], both carrying (i, j) enforced.
// The depth-indexed dynamic program evaluates leaves with the bonus-pair
// variant and merges results back up: AND splits multiply partition
// functions (divided by the duplicate-pair correction), OR splits sum them.

use crate::base::Base;
use crate::structure::PairList;
use crate::thermo::{EngineObserver, Matrix, NickSeq, ThermoCache};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SplitPoint = (usize, usize);

/// Minimum probability a flanking pair needs for a probability-based split
/// to count it as helix padding.
const HELIX_PROB_MIN: f64 = 1e-3;
/// Per-node memo bound; the memo is content-keyed, so dropping it only
/// costs recomputation.
const NODE_CACHE_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecompositionParameters {
    /// Minimum nucleotides per child.
    pub n_split: usize,
    /// Consecutive flanking pairs required on each side of a split point.
    pub h_split: usize,
    /// Partition-function fraction exclusive split points must capture.
    pub f_split: f64,
    /// Clamp energy for enforced pairs, kcal/mol.
    pub bonus_per_split: f64,
}

impl Default for DecompositionParameters {
    fn default() -> Self {
        DecompositionParameters {
            n_split: 12,
            h_split: 2,
            f_split: 0.99,
            bonus_per_split: -25.0,
        }
    }
}

/// Everything a node needs from its complex to evaluate itself.
pub struct NodeContext<'a> {
    pub env: &'a crate::model::ThermoEnviron,
    pub obs: &'a EngineObserver,
    /// Current catenated bases of the complex.
    pub bases: &'a [Base],
    /// Complex nick positions (cumulative strand ends).
    pub nicks: &'a [usize],
    pub params: DecompositionParameters,
}

#[derive(Debug)]
pub struct SplitBranch {
    /// Split pair in complex coordinates.
    pub pair: SplitPoint,
    pub left: Box<DecompositionNode>,
    pub right: Box<DecompositionNode>,
}

#[derive(Debug)]
pub enum Children {
    Leaf,
    /// Single split point: conditional ensembles of the children compose by
    /// product.
    Split(SplitBranch),
    /// Mutually exclusive split points: branch ensembles are disjoint and
    /// compose by sum.
    Exclusive(Vec<SplitBranch>),
}

#[derive(Debug)]
pub struct DecompositionNode {
    /// Half-open index ranges into the complex coordinates, in order.
    pub ranges: Vec<(usize, usize)>,
    /// Pairs clamped by ancestors (complex coordinates).
    pub enforced: Vec<SplitPoint>,
    pub children: Children,
    cache: Mutex<HashMap<(u32, u64), (Arc<Matrix>, f64)>>,
}

impl DecompositionNode {
    pub fn root(len: usize) -> Self {
        DecompositionNode {
            ranges: vec![(0, len)],
            enforced: Vec::new(),
            children: Children::Leaf,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn with_positions(positions: &[usize], enforced: Vec<SplitPoint>) -> Self {
        DecompositionNode {
            ranges: ranges_of(positions),
            enforced,
            children: Children::Leaf,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.iter().map(|&(a, b)| b - a).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.children, Children::Leaf)
    }

    /// Complex coordinates owned by this node, in catenated order.
    pub fn positions(&self) -> Vec<usize> {
        self.ranges.iter().flat_map(|&(a, b)| a..b).collect()
    }

    /// Tree height: 0 for a leaf.
    pub fn height(&self) -> u32 {
        match &self.children {
            Children::Leaf => 0,
            Children::Split(b) => 1 + b.left.height().max(b.right.height()),
            Children::Exclusive(bs) => {
                1 + bs
                    .iter()
                    .map(|b| b.left.height().max(b.right.height()))
                    .max()
                    .unwrap_or(0)
            }
        }
    }

    /// Visit every node depth-first.
    pub fn visit<F: FnMut(&DecompositionNode)>(&self, f: &mut F) {
        f(self);
        match &self.children {
            Children::Leaf => {}
            Children::Split(b) => {
                b.left.visit(f);
                b.right.visit(f);
            }
            Children::Exclusive(bs) => {
                for b in bs {
                    b.left.visit(f);
                    b.right.visit(f);
                }
            }
        }
    }

    /// The node's sub-sequence with nicks at complex strand breaks and at
    /// range boundaries (the backbone is cut where ranges meet).
    pub fn nick_seq(&self, ctx: &NodeContext) -> NickSeq {
        let mut strands: Vec<Vec<Base>> = Vec::new();
        let mut current = Vec::new();
        let mut prev: Option<usize> = None;
        for p in self.positions() {
            let broken = match prev {
                None => false,
                Some(q) => p != q + 1 || ctx.nicks.contains(&p),
            };
            if broken && !current.is_empty() {
                strands.push(std::mem::take(&mut current));
            }
            current.push(ctx.bases[p]);
            prev = Some(p);
        }
        if !current.is_empty() {
            strands.push(current);
        }
        NickSeq::from_strands(&strands)
    }

    /// Enforced pairs in node-local coordinates.
    fn local_enforced(&self) -> Vec<SplitPoint> {
        let local = self.local_map();
        let mut pairs: Vec<SplitPoint> = self
            .enforced
            .iter()
            .map(|&(i, j)| {
                let (a, b) = (local[&i], local[&j]);
                if a < b {
                    (a, b)
                } else {
                    (b, a)
                }
            })
            .collect();
        pairs.sort_unstable();
        pairs
    }

    fn local_map(&self) -> HashMap<usize, usize> {
        self.positions()
            .into_iter()
            .enumerate()
            .map(|(k, p)| (p, k))
            .collect()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("node cache poisoned").clear();
    }

    /// The depth-indexed dynamic program. Depth 0 or a leaf evaluates the
    /// sub-sequence directly; otherwise children evaluate at depth-1 and
    /// merge. Results are memoized per (depth, content fingerprint).
    pub fn evaluate(&self, ctx: &NodeContext, depth: u32) -> Result<(Arc<Matrix>, f64)> {
        let seq = self.nick_seq(ctx);
        let enforced = self.local_enforced();
        let key = (depth, ThermoCache::fingerprint(&seq, &enforced));
        if let Some(hit) = self
            .cache
            .lock()
            .expect("node cache poisoned")
            .get(&key)
            .cloned()
        {
            return Ok(hit);
        }

        let result: (Arc<Matrix>, f64) = if depth == 0 || self.is_leaf() {
            ctx.env
                .bonus_pair_probability(&seq, &enforced, ctx.params.bonus_per_split, ctx.obs)
                .context("leaf evaluation")?
        } else {
            match &self.children {
                Children::Leaf => unreachable!(),
                Children::Split(branch) => {
                    let (p, z) = self.merge_and(ctx, branch, depth)?;
                    (Arc::new(p), z)
                }
                Children::Exclusive(branches) => {
                    let mut merged: Vec<(Matrix, f64)> = Vec::with_capacity(branches.len());
                    for b in branches {
                        merged.push(self.merge_and(ctx, b, depth)?);
                    }
                    let log_z = log_sum_exp(merged.iter().map(|&(_, z)| z));
                    let n = self.len();
                    let mut p = vec![vec![0.0; n]; n];
                    for (pb, zb) in &merged {
                        let weight = (zb - log_z).exp();
                        for i in 0..n {
                            for j in 0..n {
                                p[i][j] += weight * pb[i][j];
                            }
                        }
                    }
                    (Arc::new(p), log_z)
                }
            }
        };

        let mut cache = self.cache.lock().expect("node cache poisoned");
        if cache.len() >= NODE_CACHE_MAX {
            cache.clear();
        }
        cache.entry(key).or_insert_with(|| result.clone());
        Ok(result)
    }

    /// AND merge: children at depth-1, partition functions multiplied and
    /// divided by the duplicate-pair correction, child probability blocks
    /// placed into node coordinates with the enforced pair written exactly.
    fn merge_and(
        &self,
        ctx: &NodeContext,
        branch: &SplitBranch,
        depth: u32,
    ) -> Result<(Matrix, f64)> {
        let (pl, zl) = branch.left.evaluate(ctx, depth - 1)?;
        let (pr, zr) = branch.right.evaluate(ctx, depth - 1)?;
        let (ci, cj) = branch.pair;
        let dup = duplicate_pair_correction(ctx, ci, cj)?;
        let log_z = zl + zr - dup;

        let local = self.local_map();
        let li = local[&ci];
        let lj = local[&cj];
        let n = self.len();
        let mut p = vec![vec![0.0; n]; n];

        for (child, probs) in [(&branch.left, &pl), (&branch.right, &pr)] {
            let child_positions = child.positions();
            for (a, &pa) in child_positions.iter().enumerate() {
                for (b, &pb) in child_positions.iter().enumerate() {
                    if a == b || pa == ci || pa == cj || pb == ci || pb == cj {
                        continue;
                    }
                    p[local[&pa]][local[&pb]] = probs[a][b];
                }
            }
        }
        // The conditional ensemble holds the split pair closed.
        p[li][lj] = 1.0;
        p[lj][li] = 1.0;
        for i in 0..n {
            let paired: f64 = (0..n).filter(|&j| j != i).map(|j| p[i][j]).sum();
            p[i][i] = 1.0 - paired;
        }
        Ok((p, log_z))
    }

    /// Recursive structure-based decomposition; the tree is immutable once
    /// built this way. `local` is the node's target structure.
    pub fn structure_decompose(&mut self, local: &PairList, params: &DecompositionParameters) {
        if let Some((i, j)) = best_structure_split(local, params) {
            let positions = self.positions();
            let (left, right) = self.make_children(&positions, i, j);
            let (ls, rs) = split_structure(local, i, j);
            let mut branch = SplitBranch {
                pair: (positions[i], positions[j]),
                left: Box::new(left),
                right: Box::new(right),
            };
            branch.left.structure_decompose(&ls, params);
            branch.right.structure_decompose(&rs, params);
            self.children = Children::Split(branch);
        }
    }

    /// Probability-based (re)decomposition: evaluate this node's conditional
    /// pair probabilities, pick exclusive split points capturing at least
    /// f_split of the ensemble, and recurse. Existing children are torn
    /// down. Returns true when any split was made.
    pub fn probability_decompose(&mut self, ctx: &NodeContext) -> Result<bool> {
        self.children = Children::Leaf;
        self.clear_cache();
        let n = self.len();
        let params = &ctx.params;
        // A split puts left + right = n + 2 nucleotides into the children.
        if n + 2 < 2 * params.n_split {
            return Ok(false);
        }
        let (p, _) = self.evaluate(ctx, 0)?;

        // Candidate split points, most probable first.
        let mut candidates: Vec<(SplitPoint, f64)> = Vec::new();
        for i in 0..n {
            for j in i + 1..n {
                if p[i][j] <= 0.0 {
                    continue;
                }
                let left = j - i + 1;
                let right = n - left + 2;
                if left < params.n_split || right < params.n_split {
                    continue;
                }
                if !probability_helix_padding(&p, i, j, n, params.h_split) {
                    continue;
                }
                candidates.push(((i, j), p[i][j]));
            }
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite probabilities"));

        // Greedy exclusive cover: admit a candidate only when no structure
        // can contain it together with one already chosen.
        let mut chosen: Vec<(SplitPoint, f64)> = Vec::new();
        let mut covered = 0.0;
        for (pair, prob) in candidates {
            if chosen.iter().all(|&(c, _)| mutually_exclusive(pair, c)) {
                chosen.push((pair, prob));
                covered += prob;
                if covered >= params.f_split {
                    break;
                }
            }
        }
        if chosen.is_empty() || covered < params.f_split {
            return Ok(false);
        }

        let positions = self.positions();
        let mut branches = Vec::with_capacity(chosen.len());
        for ((i, j), _) in chosen {
            let (left, right) = self.make_children(&positions, i, j);
            let mut branch = SplitBranch {
                pair: (positions[i], positions[j]),
                left: Box::new(left),
                right: Box::new(right),
            };
            branch.left.probability_decompose(ctx)?;
            branch.right.probability_decompose(ctx)?;
            branches.push(branch);
        }
        self.children = if branches.len() == 1 {
            Children::Split(branches.pop().expect("one branch"))
        } else {
            Children::Exclusive(branches)
        };
        Ok(true)
    }

    /// Children over [i..j] and [j..i] (node-local split indices); both
    /// inherit the applicable ancestor clamps plus the new pair.
    fn make_children(
        &self,
        positions: &[usize],
        i: usize,
        j: usize,
    ) -> (DecompositionNode, DecompositionNode) {
        let pair = (positions[i], positions[j]);
        let left_positions: Vec<usize> = positions[i..=j].to_vec();
        let right_positions: Vec<usize> = positions[..=i]
            .iter()
            .chain(positions[j..].iter())
            .copied()
            .collect();

        let inherit = |pos: &[usize]| -> Vec<SplitPoint> {
            let set: std::collections::HashSet<usize> = pos.iter().copied().collect();
            let mut pairs: Vec<SplitPoint> = self
                .enforced
                .iter()
                .filter(|&&(a, b)| set.contains(&a) && set.contains(&b))
                .copied()
                .collect();
            pairs.push(pair);
            pairs
        };

        (
            DecompositionNode::with_positions(&left_positions, inherit(&left_positions)),
            DecompositionNode::with_positions(&right_positions, inherit(&right_positions)),
        )
    }
}

/// Partition function of the clamped dimer [s_i] + [s_j]: the pair weight
/// counted by both children, evaluated through the same engine so pair
/// energetics stay inside the kernel boundary.
fn duplicate_pair_correction(ctx: &NodeContext, ci: usize, cj: usize) -> Result<f64> {
    let dimer = NickSeq::from_strands(&[vec![ctx.bases[ci]], vec![ctx.bases[cj]]]);
    let (_, log_z) = ctx
        .env
        .bonus_pair_probability(&dimer, &[(0, 1)], ctx.params.bonus_per_split, ctx.obs)
        .context("duplicate-pair correction")?;
    Ok(log_z)
}

/// Best structure split: legal under n_split/h_split, most balanced, ties
/// toward the lower opening index.
fn best_structure_split(
    local: &PairList,
    params: &DecompositionParameters,
) -> Option<(usize, usize)> {
    let m = local.len();
    let mut best: Option<((usize, usize), usize)> = None;
    for (i, j) in local.pairs() {
        let left = j - i + 1;
        let right = m - left + 2;
        if left < params.n_split || right < params.n_split {
            continue;
        }
        if !structure_helix_padding(local, i, j, params.h_split) {
            continue;
        }
        let imbalance = left.abs_diff(right);
        let better = match best {
            None => true,
            Some((_, b)) => imbalance < b,
        };
        if better {
            best = Some(((i, j), imbalance));
        }
    }
    best.map(|(pair, _)| pair)
}

/// h consecutive pairs flanking (i, j) on each side of the helix.
fn structure_helix_padding(local: &PairList, i: usize, j: usize, h: usize) -> bool {
    let m = local.len();
    for k in 1..=h {
        if i + k >= m || j < k || i + k >= j - k {
            return false;
        }
        if local.partner(i + k) != j - k {
            return false;
        }
        if i < k || j + k >= m {
            return false;
        }
        if local.partner(i - k) != j + k {
            return false;
        }
    }
    true
}

fn probability_helix_padding(p: &Matrix, i: usize, j: usize, n: usize, h: usize) -> bool {
    for k in 1..=h {
        if i + k >= n || j < k || i + k >= j - k {
            return false;
        }
        if p[i + k][j - k] < HELIX_PROB_MIN {
            return false;
        }
        if i < k || j + k >= n {
            return false;
        }
        if p[i - k][j + k] < HELIX_PROB_MIN {
            return false;
        }
    }
    true
}

/// Two split points are mutually exclusive when no non-crossing structure
/// can contain both: they cross or share an endpoint.
fn mutually_exclusive(a: SplitPoint, b: SplitPoint) -> bool {
    let (i, j) = a;
    let (k, l) = b;
    if i == k || i == l || j == k || j == l {
        return true;
    }
    let crossing = (i < k && k < j && j < l) || (k < i && i < l && l < j);
    crossing
}

/// Project a node's target structure into its two children at split (i, j).
fn split_structure(local: &PairList, i: usize, j: usize) -> (PairList, PairList) {
    let m = local.len();
    let left: Vec<usize> = (i..=j).map(|k| local.partner(k) - i).collect();
    let map_right = |t: usize| -> usize {
        if t <= i {
            t
        } else {
            t - (j - i - 1)
        }
    };
    let right: Vec<usize> = (0..=i)
        .chain(j..m)
        .map(|t| map_right(local.partner(t)))
        .collect();
    (PairList { values: left }, PairList { values: right })
}

/// Coalesce ordered positions into half-open ranges.
fn ranges_of(positions: &[usize]) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = Vec::new();
    for &p in positions {
        match out.last_mut() {
            Some(&mut (_, ref mut stop)) if *stop == p => *stop += 1,
            _ => out.push((p, p + 1)),
        }
    }
    out
}

pub fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values
        .clone()
        .fold(f64::NEG_INFINITY, |a, b| if b > a { b } else { a });
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Structure;

    fn params(n_split: usize, h_split: usize) -> DecompositionParameters {
        DecompositionParameters {
            n_split,
            h_split,
            ..Default::default()
        }
    }

    #[test]
    fn ranges_coalesce() {
        assert_eq!(ranges_of(&[0, 1, 2, 5, 6, 9]), vec![(0, 3), (5, 7), (9, 10)]);
    }

    #[test]
    fn hairpin_too_small_to_split() {
        let s = Structure::parse("((((....))))").unwrap();
        let mut root = DecompositionNode::root(s.len());
        root.structure_decompose(&s.pairs, &params(12, 2));
        assert!(root.is_leaf());
    }

    #[test]
    fn long_duplex_splits_in_the_middle() {
        // 40-nt duplex: 20 pairs; split should balance the children.
        let s = Structure::parse("(20+)20").unwrap();
        let mut root = DecompositionNode::root(s.len());
        root.structure_decompose(&s.pairs, &params(8, 2));
        match &root.children {
            Children::Split(b) => {
                let (i, j) = b.pair;
                assert_eq!(i + j, 39, "split pair spans the duplex");
                let balance = b.left.len().abs_diff(b.right.len());
                assert!(balance <= 2, "imbalance {}", balance);
                // Both children carry the clamp.
                assert!(b.left.enforced.contains(&b.pair));
                assert!(b.right.enforced.contains(&b.pair));
            }
            _ => panic!("expected a single split"),
        }
    }

    #[test]
    fn helix_padding_respected() {
        // Split pair must have h pairs on both sides; the terminal pairs
        // of a short helix never qualify.
        let s = Structure::parse("(((((.....)))))").unwrap();
        let pairs = &s.pairs;
        assert!(structure_helix_padding(pairs, 2, 12, 2));
        assert!(!structure_helix_padding(pairs, 0, 14, 2));
        assert!(!structure_helix_padding(pairs, 4, 10, 2));
    }

    #[test]
    fn split_structure_maps_partners() {
        let s = Structure::parse("((((....))))").unwrap();
        let (left, right) = split_structure(&s.pairs, 1, 10);
        left.validate().unwrap();
        right.validate().unwrap();
        assert_eq!(left.len(), 10);
        assert_eq!(right.len(), 4);
        assert_eq!(left.partner(0), 9);
        assert_eq!(right.partner(0), 3);
    }

    #[test]
    fn exclusivity_rules() {
        assert!(mutually_exclusive((0, 10), (5, 15))); // crossing
        assert!(mutually_exclusive((0, 10), (10, 20))); // shared endpoint
        assert!(!mutually_exclusive((0, 10), (2, 8))); // nested
        assert!(!mutually_exclusive((0, 5), (6, 10))); // disjoint
    }

    #[test]
    fn log_sum_exp_matches_direct() {
        let direct = (1.0f64.exp() + 2.0f64.exp() + 0.5f64.exp()).ln();
        let lse = log_sum_exp([1.0, 2.0, 0.5].into_iter());
        assert!((direct - lse).abs() < 1e-12);
    }
}
