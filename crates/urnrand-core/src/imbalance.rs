// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::config::ImbalanceRule;
use crate::error::{UrnError, UrnResult};

/// Non-negative rational imbalance `numer / denom`. Kept exact so that
/// ties between urns are decided without floating-point noise.
#[derive(Debug, Clone, Copy)]
pub struct Imbalance {
    numer: u128,
    denom: u128,
}

impl Imbalance {
    pub const ZERO: Self = Self { numer: 0, denom: 1 };

    fn ratio(numer: u128, denom: u128) -> Self {
        if numer == 0 || denom == 0 {
            Self::ZERO
        } else {
            Self { numer, denom }
        }
    }

    pub fn numer(&self) -> u128 {
        self.numer
    }

    pub fn denom(&self) -> u128 {
        self.denom
    }

    pub fn is_zero(&self) -> bool {
        self.numer == 0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        self.numer as f64 / self.denom as f64
    }
}

impl Ord for Imbalance {
    fn cmp(&self, other: &Self) -> Ordering {
        match (
            self.numer.checked_mul(other.denom),
            other.numer.checked_mul(self.denom),
        ) {
            (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

impl PartialOrd for Imbalance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Imbalance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Imbalance {}

impl fmt::Display for Imbalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numer, self.denom)
    }
}

impl Serialize for Imbalance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

fn overflow() -> UrnError {
    UrnError::validation("ball counts too large to score")
}

/// Scores one urn's ball counts under `rule`. An empty urn scores zero.
pub fn evaluate(rule: ImbalanceRule, balls: &[u64]) -> UrnResult<Imbalance> {
    let total: u128 = balls.iter().map(|b| u128::from(*b)).sum();
    if total == 0 || balls.len() < 2 {
        return Ok(Imbalance::ZERO);
    }
    match rule {
        ImbalanceRule::Range => {
            let max = balls.iter().copied().max().unwrap_or(0);
            let min = balls.iter().copied().min().unwrap_or(0);
            Ok(Imbalance::ratio(u128::from(max - min), total))
        }
        ImbalanceRule::Variance => {
            // Sample variance over total:
            //   (k * sum(b^2) - S^2) / (k * (k - 1) * S)
            let k = balls.len() as u128;
            let sum_sq = balls.iter().try_fold(0u128, |acc, b| {
                let b = u128::from(*b);
                b.checked_mul(b).and_then(|sq| acc.checked_add(sq))
            });
            let sum_sq = sum_sq.ok_or_else(overflow)?;
            let numer = k
                .checked_mul(sum_sq)
                .and_then(|lhs| total.checked_mul(total).map(|rhs| lhs - rhs))
                .ok_or_else(overflow)?;
            let denom = k
                .checked_mul(k - 1)
                .and_then(|kk| kk.checked_mul(total))
                .ok_or_else(overflow)?;
            Ok(Imbalance::ratio(numer, denom))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn three_arm_urn_under_both_rules() {
        let range = evaluate(ImbalanceRule::Range, &[5, 1, 1]).unwrap();
        assert_eq!(range, Imbalance::ratio(4, 7));
        assert!((range.as_f64() - 4.0 / 7.0).abs() < 1e-12);

        let variance = evaluate(ImbalanceRule::Variance, &[5, 1, 1]).unwrap();
        assert_eq!(variance, Imbalance::ratio(16, 21));
        assert!((variance.as_f64() - 0.761_904_761_904).abs() < 1e-9);
    }

    #[test]
    fn equal_fractions_compare_equal() {
        assert_eq!(Imbalance::ratio(1, 5), Imbalance::ratio(2, 10));
        assert!(Imbalance::ratio(1, 5) < Imbalance::ratio(1, 4));
        assert!(Imbalance::ZERO < Imbalance::ratio(1, u128::MAX));
    }

    #[test]
    fn empty_urn_scores_zero() {
        assert!(evaluate(ImbalanceRule::Range, &[0, 0]).unwrap().is_zero());
        assert!(evaluate(ImbalanceRule::Variance, &[0, 0, 0])
            .unwrap()
            .is_zero());
    }

    #[test]
    fn serializes_as_a_number() {
        let d = evaluate(ImbalanceRule::Range, &[3, 1]).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), "0.5");
    }

    proptest! {
        #[test]
        fn balanced_urns_score_zero(b in 0u64..1_000_000, k in 2usize..6) {
            let balls = vec![b; k];
            prop_assert!(evaluate(ImbalanceRule::Range, &balls).unwrap().is_zero());
            prop_assert!(evaluate(ImbalanceRule::Variance, &balls).unwrap().is_zero());
        }

        #[test]
        fn range_is_at_most_one(balls in proptest::collection::vec(0u64..10_000, 2..6)) {
            let d = evaluate(ImbalanceRule::Range, &balls).unwrap();
            prop_assert!(d <= Imbalance::ratio(1, 1));
        }

        #[test]
        fn unequal_urns_score_positive(a in 0u64..10_000, extra in 1u64..10_000) {
            let balls = [a, a + extra];
            prop_assert!(!evaluate(ImbalanceRule::Range, &balls).unwrap().is_zero());
            prop_assert!(!evaluate(ImbalanceRule::Variance, &balls).unwrap().is_zero());
        }
    }
}
