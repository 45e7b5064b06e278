// src/base.rs
// DEGENERATE BASE ALPHABET
// A nucleotide is a 4-bit mask over {A, C, G, U}. The 15 nonzero codes are
// the IUPAC degenerate alphabet (N = any); mask 0 is the conflict/sentinel
// code rendered '_'. Constraint propagation works directly on these masks.

use rand::Rng;

const MASK_A: u8 = 0b0001;
const MASK_C: u8 = 0b0010;
const MASK_G: u8 = 0b0100;
const MASK_U: u8 = 0b1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Base(u8);

impl Base {
    pub const NONE: Base = Base(0);
    pub const A: Base = Base(MASK_A);
    pub const C: Base = Base(MASK_C);
    pub const G: Base = Base(MASK_G);
    pub const U: Base = Base(MASK_U);
    pub const N: Base = Base(MASK_A | MASK_C | MASK_G | MASK_U);

    pub fn all() -> [Base; 4] {
        [Base::A, Base::C, Base::G, Base::U]
    }

    /// Parse one IUPAC code. 'T' is accepted as a synonym for 'U'; the
    /// material only matters when formatting back out.
    pub fn from_char(c: char) -> Option<Self> {
        let mask = match c.to_ascii_uppercase() {
            'A' => MASK_A,
            'C' => MASK_C,
            'G' => MASK_G,
            'U' | 'T' => MASK_U,
            'R' => MASK_A | MASK_G,
            'Y' => MASK_C | MASK_U,
            'M' => MASK_A | MASK_C,
            'K' => MASK_G | MASK_U,
            'S' => MASK_C | MASK_G,
            'W' => MASK_A | MASK_U,
            'V' => MASK_A | MASK_C | MASK_G,
            'H' => MASK_A | MASK_C | MASK_U,
            'D' => MASK_A | MASK_G | MASK_U,
            'B' => MASK_C | MASK_G | MASK_U,
            'N' => MASK_A | MASK_C | MASK_G | MASK_U,
            '_' => 0,
            _ => return None,
        };
        Some(Base(mask))
    }

    /// RNA spelling of the code ('U' for the uracil bit).
    pub fn to_char(self) -> char {
        match self.0 {
            0 => '_',
            m if m == MASK_A => 'A',
            m if m == MASK_C => 'C',
            m if m == MASK_G => 'G',
            m if m == MASK_U => 'U',
            m if m == MASK_A | MASK_G => 'R',
            m if m == MASK_C | MASK_U => 'Y',
            m if m == MASK_A | MASK_C => 'M',
            m if m == MASK_G | MASK_U => 'K',
            m if m == MASK_C | MASK_G => 'S',
            m if m == MASK_A | MASK_U => 'W',
            m if m == MASK_A | MASK_C | MASK_G => 'V',
            m if m == MASK_A | MASK_C | MASK_U => 'H',
            m if m == MASK_A | MASK_G | MASK_U => 'D',
            m if m == MASK_C | MASK_G | MASK_U => 'B',
            _ => 'N',
        }
    }

    /// Watson-Crick complement of a mask: the union of the complements of
    /// every base the mask admits.
    pub fn complement(self) -> Base {
        let mut out = 0;
        if self.0 & MASK_A != 0 {
            out |= MASK_U;
        }
        if self.0 & MASK_C != 0 {
            out |= MASK_G;
        }
        if self.0 & MASK_G != 0 {
            out |= MASK_C;
        }
        if self.0 & MASK_U != 0 {
            out |= MASK_A;
        }
        Base(out)
    }

    /// Complement when G-U wobble pairs are admitted: G may face C or U,
    /// and U may face A or G.
    pub fn wobble_complement(self) -> Base {
        let mut out = self.complement().0;
        if self.0 & MASK_G != 0 {
            out |= MASK_U;
        }
        if self.0 & MASK_U != 0 {
            out |= MASK_G;
        }
        Base(out)
    }

    pub fn intersect(self, other: Base) -> Base {
        Base(self.0 & other.0)
    }

    /// Bases NOT admitted by this mask, within N.
    pub fn inverse(self) -> Base {
        Base(!self.0 & Base::N.0)
    }

    pub fn union(self, other: Base) -> Base {
        Base(self.0 | other.0)
    }

    /// True when `self` admits every base `other` admits.
    pub fn admits(self, other: Base) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// A fully grounded base (exactly one bit set).
    pub fn is_determined(self) -> bool {
        self.0.count_ones() == 1
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Map a determined base to a 0-3 index for table lookups.
    pub fn idx(self) -> usize {
        debug_assert!(self.is_determined());
        self.0.trailing_zeros() as usize
    }

    pub fn from_idx(i: usize) -> Base {
        Base(1u8 << i)
    }

    /// Uniformly sample one admitted base from the mask. Panics on the
    /// empty mask; callers treat NONE as a propagation conflict first.
    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R) -> Base {
        assert!(self.0 != 0, "cannot sample the empty base mask");
        let n = self.count();
        let mut k = rng.gen_range(0..n);
        for b in Base::all() {
            if self.0 & b.0 != 0 {
                if k == 0 {
                    return b;
                }
                k -= 1;
            }
        }
        unreachable!()
    }

    /// Iterate the determined bases admitted by this mask.
    pub fn options(self) -> impl Iterator<Item = Base> {
        Base::all().into_iter().filter(move |b| self.0 & b.0 != 0)
    }

    /// True if a and b can form a pair (WC, optionally wobble).
    pub fn can_pair(a: Base, b: Base, wobble: bool) -> bool {
        let comp = if wobble {
            a.wobble_complement()
        } else {
            a.complement()
        };
        comp.0 & b.0 != 0
    }
}

/// Parse a string of IUPAC codes into a mask sequence.
pub fn parse_bases(s: &str) -> Option<Vec<Base>> {
    s.chars().map(Base::from_char).collect()
}

/// Format a mask sequence with RNA spelling.
pub fn format_bases(seq: &[Base]) -> String {
    seq.iter().map(|b| b.to_char()).collect()
}

/// True when every position is grounded to a single base.
pub fn all_determined(seq: &[Base]) -> bool {
    seq.iter().all(|b| b.is_determined())
}

/// Reverse complement of a mask sequence.
pub fn reverse_complement(seq: &[Base], wobble: bool) -> Vec<Base> {
    seq.iter()
        .rev()
        .map(|b| {
            if wobble {
                b.wobble_complement()
            } else {
                b.complement()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn char_round_trip() {
        for c in "ACGURYMKSWVHDBN_".chars() {
            let b = Base::from_char(c).unwrap();
            assert_eq!(b.to_char(), c);
        }
        assert_eq!(Base::from_char('T'), Base::from_char('U'));
        assert_eq!(Base::from_char('x'), None);
    }

    #[test]
    fn complement_involution_on_wc() {
        for b in Base::all() {
            assert_eq!(b.complement().complement(), b);
        }
        assert_eq!(Base::N.complement(), Base::N);
    }

    #[test]
    fn wobble_widens() {
        assert_eq!(Base::G.wobble_complement(), Base::from_char('Y').unwrap());
        assert_eq!(Base::U.wobble_complement(), Base::from_char('R').unwrap());
        assert_eq!(Base::A.wobble_complement(), Base::U);
    }

    #[test]
    fn sampling_respects_mask() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = Base::from_char('S').unwrap();
        for _ in 0..50 {
            let b = mask.sample(&mut rng);
            assert!(b == Base::C || b == Base::G);
        }
    }

    #[test]
    fn pairing_table() {
        assert!(Base::can_pair(Base::G, Base::C, false));
        assert!(!Base::can_pair(Base::G, Base::U, false));
        assert!(Base::can_pair(Base::G, Base::U, true));
        assert!(!Base::can_pair(Base::A, Base::G, true));
    }
}
