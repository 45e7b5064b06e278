// src/structure.rs
// SECONDARY STRUCTURE
// PairList: partner array where pairs[i] == i means unpaired. Structure adds
// the nick positions (cumulative strand boundaries). Text form is
// dot-parens-plus, optionally run-length encoded: "(3+.4)3" == "(((+....)))".
// '+' marks a strand break and is never run-encoded.

use crate::error::DesignError;
use anyhow::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairList {
    pub values: Vec<usize>,
}

impl PairList {
    pub fn unpaired(n: usize) -> Self {
        PairList {
            values: (0..n).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn partner(&self, i: usize) -> usize {
        self.values[i]
    }

    pub fn is_paired(&self, i: usize) -> bool {
        self.values[i] != i
    }

    pub fn n_pairs(&self) -> usize {
        self.values.iter().enumerate().filter(|(i, &j)| *i < j).count()
    }

    /// Iterate each pair (i, j) with i < j once.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(i, &j)| *i < j)
            .map(|(i, &j)| (i, j))
    }

    /// pairs[pairs[i]] == i and all partners in range.
    pub fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(DesignError::InvalidStructure("empty pair list".into()).into());
        }
        for (i, &j) in self.values.iter().enumerate() {
            if j >= self.values.len() {
                return Err(
                    DesignError::InvalidStructure(format!("pair index {} out of range", j)).into(),
                );
            }
            if self.values[j] != i {
                return Err(DesignError::InvalidStructure(format!(
                    "mismatched base pair ({}, {})",
                    i, j
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Rotate partner indices left by s nucleotides.
    pub fn rotate(&mut self, s: usize) {
        let n = self.values.len();
        if n == 0 {
            return;
        }
        let s = s % n;
        for j in self.values.iter_mut() {
            *j = (*j + n - s) % n;
        }
        self.values.rotate_left(s);
    }

    /// Order of the cyclic rotation group fixing the pair mapping: the
    /// largest k such that rotation by n/k maps pairs onto pairs.
    pub fn symmetry(&self) -> usize {
        let n = self.values.len();
        'outer: for s in 1..=n {
            if n % s != 0 {
                continue;
            }
            for i in 0..n {
                if self.values[(i + s) % n] != (self.values[i] + s) % n {
                    continue 'outer;
                }
            }
            return n / s;
        }
        1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Structure {
    pub pairs: PairList,
    /// Cumulative strand boundaries; nicks.last() == len().
    pub nicks: Vec<usize>,
}

impl Structure {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn n_strands(&self) -> usize {
        self.nicks.len()
    }

    pub fn strand_lengths(&self) -> Vec<usize> {
        let mut prev = 0;
        self.nicks
            .iter()
            .map(|&n| {
                let l = n - prev;
                prev = n;
                l
            })
            .collect()
    }

    /// Parse dot-parens-plus, run-length-encoded dpp, or any hybrid of the
    /// two. Strand lengths are implied by the '+' positions.
    pub fn parse(s: &str) -> Result<Structure> {
        let expanded = expand_rle(s)?;
        let mut stack = Vec::new();
        let mut values = Vec::new();
        let mut nicks = Vec::new();
        for c in expanded.chars() {
            match c {
                '(' => {
                    stack.push(values.len());
                    values.push(usize::MAX);
                }
                ')' => {
                    let i = stack.pop().ok_or_else(|| {
                        DesignError::InvalidStructure(format!("unbalanced ')' in {}", s))
                    })?;
                    let j = values.len();
                    values[i] = j;
                    values.push(i);
                }
                '.' => {
                    let i = values.len();
                    values.push(i);
                }
                '+' => {
                    if values.is_empty() || nicks.last() == Some(&values.len()) {
                        return Err(DesignError::InvalidStructure(format!(
                            "empty strand in {}",
                            s
                        ))
                        .into());
                    }
                    nicks.push(values.len());
                }
                _ => {
                    return Err(DesignError::InvalidStructure(format!(
                        "unexpected character {:?} in {}",
                        c, s
                    ))
                    .into())
                }
            }
        }
        if !stack.is_empty() {
            return Err(DesignError::InvalidStructure(format!("unbalanced '(' in {}", s)).into());
        }
        if values.is_empty() {
            return Err(DesignError::InvalidStructure("empty structure".into()).into());
        }
        nicks.push(values.len());
        Ok(Structure {
            pairs: PairList { values },
            nicks,
        })
    }

    /// Plain dot-parens-plus text.
    pub fn dp(&self) -> String {
        let mut out = String::with_capacity(self.len() + self.n_strands());
        let mut nick_iter = self.nicks.iter().peekable();
        for (i, &j) in self.pairs.values.iter().enumerate() {
            if let Some(&&n) = nick_iter.peek() {
                if n == i {
                    out.push('+');
                    nick_iter.next();
                }
            }
            out.push(if j == i {
                '.'
            } else if i < j {
                '('
            } else {
                ')'
            });
        }
        out
    }

    /// Minimal run-length encoding of the dpp text; length-1 runs omit the
    /// count and '+' is emitted verbatim.
    pub fn dp_rle(&self) -> String {
        let dp = self.dp();
        let mut out = String::new();
        let mut chars = dp.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '+' {
                out.push('+');
                continue;
            }
            let mut run = 1usize;
            while chars.peek() == Some(&c) {
                chars.next();
                run += 1;
            }
            out.push(c);
            if run > 1 {
                out.push_str(&run.to_string());
            }
        }
        out
    }

    /// Rotational symmetry: gcd of the strand-length pattern symmetry and
    /// the pair-list symmetry; 1 when the strand pattern is asymmetric.
    pub fn symmetry(&self) -> usize {
        let sym1 = rotational_symmetry(&self.strand_lengths());
        if sym1 == 1 {
            1
        } else {
            gcd(sym1, self.pairs.symmetry())
        }
    }

    /// Rotate by s whole strands.
    pub fn rotate(&mut self, s: usize) {
        let ns = self.n_strands();
        if ns == 0 || s % ns == 0 {
            return;
        }
        let s = s % ns;
        self.pairs.rotate(self.nicks[s - 1]);
        let mut lengths = self.strand_lengths();
        lengths.rotate_left(s);
        let mut acc = 0;
        self.nicks = lengths
            .into_iter()
            .map(|l| {
                acc += l;
                acc
            })
            .collect();
    }

    /// Canonical representative under strand rotation; two structures are
    /// equal iff their lowest rotations agree.
    pub fn lowest_rotation(&self) -> Structure {
        let mut best = self.clone();
        for s in 1..self.n_strands() {
            let mut cand = self.clone();
            cand.rotate(s);
            if (cand.pairs.values.as_slice(), cand.nicks.as_slice())
                < (best.pairs.values.as_slice(), best.nicks.as_slice())
            {
                best = cand;
            }
        }
        best
    }

    /// True if the base pairs connect every strand into one complex.
    pub fn is_connected(&self) -> bool {
        let n = self.len();
        if n == 0 {
            return false;
        }
        let mut visited = vec![false; n];
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let j = self.pairs.values[i];
            if !visited[j] {
                stack.push(j);
            }
            let strand = self.strand_of(i);
            let lo = if strand == 0 { 0 } else { self.nicks[strand - 1] };
            let hi = self.nicks[strand];
            if i + 1 < hi && !visited[i + 1] {
                stack.push(i + 1);
            }
            if i > lo && !visited[i - 1] {
                stack.push(i - 1);
            }
        }
        visited.into_iter().all(|v| v)
    }

    /// Index of the strand containing nucleotide i.
    pub fn strand_of(&self, i: usize) -> usize {
        self.nicks.partition_point(|&n| n <= i)
    }

    pub fn validate(&self) -> Result<()> {
        self.pairs.validate()?;
        if self.nicks.last() != Some(&self.len()) {
            return Err(DesignError::InvalidStructure(
                "nick positions do not cover the structure".into(),
            )
            .into());
        }
        if self.nicks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DesignError::InvalidStructure("empty or unsorted strand".into()).into());
        }
        Ok(())
    }
}

/// Expand any rle runs in a hybrid dpp/dpp-rle string into pure dpp.
fn expand_rle(s: &str) -> Result<String> {
    let mut out = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | ')' | '.' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let run: usize = if digits.is_empty() {
                    1
                } else {
                    digits.parse().map_err(|_| {
                        DesignError::InvalidStructure(format!("bad run length in {}", s))
                    })?
                };
                if run == 0 {
                    return Err(
                        DesignError::InvalidStructure(format!("zero run length in {}", s)).into(),
                    );
                }
                for _ in 0..run {
                    out.push(c);
                }
            }
            '+' => out.push('+'),
            _ => {
                return Err(DesignError::InvalidStructure(format!(
                    "{} is not in dpp or rle-dpp format",
                    s
                ))
                .into())
            }
        }
    }
    Ok(out)
}

/// Order of the cyclic symmetry group of a list: len / smallest period.
pub fn rotational_symmetry<T: Eq>(v: &[T]) -> usize {
    let n = v.len();
    for p in 1..=n {
        if n % p != 0 {
            continue;
        }
        if (0..n).all(|i| v[i] == v[(i + p) % n]) {
            return n / p;
        }
    }
    1
}

pub fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_dpp() {
        let s = Structure::parse("(((+)))").unwrap();
        assert_eq!(s.len(), 6);
        assert_eq!(s.nicks, vec![3, 6]);
        assert_eq!(s.pairs.values, vec![5, 4, 3, 2, 1, 0]);
        s.validate().unwrap();
    }

    #[test]
    fn parse_rle_and_hybrid() {
        let a = Structure::parse("(((+....)))").unwrap();
        let b = Structure::parse("(3+.4)3").unwrap();
        let c = Structure::parse("((2+...1.)3").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn rle_round_trip() {
        for text in ["(((+....)))", "....", "((..))", "(.(.).)+."] {
            let s = Structure::parse(text).unwrap();
            let rle = s.dp_rle();
            assert_eq!(Structure::parse(&rle).unwrap(), s);
            assert_eq!(s.dp(), text);
            assert!(!rle.contains("+2"));
        }
    }

    #[test]
    fn unbalanced_rejected() {
        assert!(Structure::parse("(((").is_err());
        assert!(Structure::parse("())").is_err());
        assert!(Structure::parse("(x)").is_err());
        assert!(Structure::parse("(+)+").is_err());
    }

    #[test]
    fn involution_holds() {
        let s = Structure::parse("((.((...)).))").unwrap();
        for i in 0..s.len() {
            assert_eq!(s.pairs.values[s.pairs.values[i]], i);
        }
    }

    #[test]
    fn symmetry_of_four_strand_ring() {
        // Four identical 2-nt strands pairing around a ring: symmetry 4.
        let s = Structure::parse("((+)(+)(+))").unwrap();
        assert_eq!(s.n_strands(), 4);
        assert_eq!(s.strand_lengths(), vec![2, 2, 2, 2]);
        assert_eq!(s.pairs.symmetry(), 4);
        assert_eq!(s.symmetry(), 4);
        assert!(s.is_connected());
    }

    #[test]
    fn rotation_preserves_symmetry_class() {
        let s = Structure::parse("((((+))))").unwrap();
        let mut r = s.clone();
        r.rotate(1);
        assert_eq!(r.dp(), "((((+))))");
        assert_eq!(s.lowest_rotation(), r.lowest_rotation());
    }

    #[test]
    fn connectivity() {
        assert!(Structure::parse("(((+)))").unwrap().is_connected());
        assert!(!Structure::parse("...+...").unwrap().is_connected());
        assert!(Structure::parse("..").unwrap().is_connected());
    }
}
