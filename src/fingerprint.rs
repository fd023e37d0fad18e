// SPDX-License-Identifier: Apache-2.0

//! Bloom-filter summary of a path condition.
//!
//! The summary is a 16x64 bit matrix. Row 0 records the general (structural)
//! token of every clause; rows 1..16 record the specific token of the same
//! clause in the column chosen by its general token, so two conditions with
//! the same shape but different details share row-0 bits and differ below.

use crate::path_condition::{PathCondition, PathConditionSlicer};
use crate::pathweave_error::PathweaveError;

pub const ROWS: usize = 16;
pub const COLS: usize = 64;

const SPECIFIC_ROWS: u32 = (ROWS - 1) as u32;
const PRIMES: [i32; 3] = [7, 11, 13];

/// 31-polynomial hash over UTF-16 code units, in wrapping 32-bit arithmetic.
fn token_hash(token: &str) -> i32 {
    token
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Supplemental hash that spreads entropy from the high bits into the low
/// bits used for indexing, so weak token hashes don't cluster.
fn spread(h: i32) -> u32 {
    let mut h = h.wrapping_abs() as u32;
    h ^= (h >> 20) ^ (h >> 12);
    h ^ (h >> 7) ^ (h >> 4)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathFingerprint {
    rows: [u64; ROWS],
}

impl PathFingerprint {
    pub fn new(
        condition: &PathCondition,
        slicer: &dyn PathConditionSlicer,
    ) -> Result<Self, PathweaveError> {
        let sliced = slicer.slice(condition);
        Self::from_slices(&sliced.general, &sliced.specific)
    }

    pub fn from_slices<S: AsRef<str>>(
        general: &[S],
        specific: &[S],
    ) -> Result<Self, PathweaveError> {
        if general.len() != specific.len() {
            return Err(PathweaveError::InvalidConfig(format!(
                "sliced path condition has {} general but {} specific tokens",
                general.len(),
                specific.len()
            )));
        }
        let mut rows = [0u64; ROWS];
        for (g, s) in general.iter().zip(specific) {
            let g = token_hash(g.as_ref());
            let s = token_hash(s.as_ref());
            for prime in PRIMES {
                let hash_general = prime.wrapping_mul(31).wrapping_add(g);
                let hash_specific = prime.wrapping_mul(31).wrapping_add(s);
                let col = spread(hash_general) as usize % COLS;
                let row = (spread(hash_specific) % SPECIFIC_ROWS) as usize;
                rows[0] |= 1u64 << col;
                rows[row + 1] |= 1u64 << col;
            }
        }
        Ok(PathFingerprint { rows })
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.rows[row] & (1u64 << col) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.rows.iter().map(|r| r.count_ones()).sum()
    }

    /// Fraction of set positions the two matrices share: `both / (both +
    /// only_one)`. 1.0 means identical, 0.0 means disjoint. Two empty
    /// matrices are identical.
    pub fn similarity(&self, other: &PathFingerprint) -> f64 {
        let (both, only_one) = self
            .rows
            .iter()
            .zip(other.rows.iter())
            .fold((0u32, 0u32), |(both, only), (a, b)| {
                (both + (a & b).count_ones(), only + (a ^ b).count_ones())
            });
        if both + only_one == 0 {
            return 1.0;
        }
        f64::from(both) / f64::from(both + only_one)
    }

    /// As `similarity`, with an absent fingerprint sharing nothing.
    pub fn similarity_to(&self, other: Option<&PathFingerprint>) -> f64 {
        other.map_or(0.0, |o| self.similarity(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_condition::ShapeSlicer;
    use pretty_assertions::assert_eq;
    use rand::distributions::Alphanumeric;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pc(clauses: &[&str]) -> PathCondition {
        clauses.iter().copied().collect()
    }

    fn random_token(rng: &mut StdRng) -> String {
        let len = rng.gen_range(4..16);
        rng.sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    #[test]
    fn token_hash_matches_polynomial_string_hash() {
        assert_eq!(token_hash(""), 0);
        assert_eq!(token_hash("a"), 97);
        assert_eq!(token_hash("ab"), 97 * 31 + 98);
        // Wraps like 32-bit arithmetic.
        assert_eq!(token_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn spread_handles_extreme_inputs() {
        assert_eq!(spread(0), 0);
        // Absolute value of i32::MIN overflows back to itself.
        let _ = spread(i32::MIN);
        assert_eq!(spread(-5), spread(5));
    }

    #[test]
    fn encoding_is_deterministic() {
        let condition = pc(&["x > 5", "y == z", "{R0}.next != null"]);
        let a = PathFingerprint::new(&condition, &ShapeSlicer).unwrap();
        let b = PathFingerprint::new(&condition, &ShapeSlicer).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.similarity(&b), 1.0);
    }

    #[test]
    fn every_clause_sets_row_zero_and_a_specific_row_in_the_same_column() {
        let fp = PathFingerprint::from_slices(&["g"], &["s"]).unwrap();
        let general_cols: Vec<usize> = (0..COLS).filter(|&c| fp.get(0, c)).collect();
        assert!(!general_cols.is_empty() && general_cols.len() <= PRIMES.len());
        for col in 0..COLS {
            let below = (1..ROWS).any(|r| fp.get(r, col));
            assert_eq!(fp.get(0, col), below, "column {}", col);
        }
    }

    #[test]
    fn empty_condition_has_no_bits() {
        let fp = PathFingerprint::new(&PathCondition::default(), &ShapeSlicer).unwrap();
        assert_eq!(fp.count_ones(), 0);
        assert_eq!(fp.similarity(&fp.clone()), 1.0);
    }

    #[test]
    fn unequal_slices_are_rejected() {
        assert!(PathFingerprint::from_slices(&["a", "b"], &["a"]).is_err());
    }

    #[test]
    fn absent_other_has_zero_similarity() {
        let fp = PathFingerprint::from_slices(&["g"], &["s"]).unwrap();
        assert_eq!(fp.similarity_to(None), 0.0);
        assert_eq!(fp.similarity_to(Some(&fp)), 1.0);
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = PathFingerprint::new(&pc(&["x > 5", "y < 3"]), &ShapeSlicer).unwrap();
        let b = PathFingerprint::new(&pc(&["x > 5", "w == 1"]), &ShapeSlicer).unwrap();
        let ab = a.similarity(&b);
        assert_eq!(ab, b.similarity(&a));
        assert!((0.0..=1.0).contains(&ab));
        assert!(ab > 0.0, "shared clause must share bits");
        assert!(ab < 1.0);
    }

    #[test]
    fn same_shape_is_closer_than_different_shape() {
        let base = PathFingerprint::new(&pc(&["x > 5", "y == z"]), &ShapeSlicer).unwrap();
        let same_shape = PathFingerprint::new(&pc(&["x > 5", "q == r"]), &ShapeSlicer).unwrap();
        let other_shape =
            PathFingerprint::new(&pc(&["x > 5", "f(a, b, c) instanceof T"]), &ShapeSlicer)
                .unwrap();
        assert!(base.similarity(&same_shape) > base.similarity(&other_shape));
    }

    #[test]
    fn changing_one_token_changes_the_fingerprint() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut differing = 0;
        let trials = 200;
        for _ in 0..trials {
            let general: Vec<String> = (0..4).map(|_| random_token(&mut rng)).collect();
            let specific: Vec<String> = (0..4).map(|_| random_token(&mut rng)).collect();
            let mut mutated = specific.clone();
            let i = rng.gen_range(0..mutated.len());
            mutated[i] = random_token(&mut rng);
            let a = PathFingerprint::from_slices(&general, &specific).unwrap();
            let b = PathFingerprint::from_slices(&general, &mutated).unwrap();
            if a != b {
                differing += 1;
            }
        }
        assert!(differing * 10 >= trials * 9, "only {differing}/{trials} differed");
    }
}
