// SPDX-License-Identifier: Apache-2.0

//! k-nearest-neighbor triage over labeled path fingerprints.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard};

use serde::Deserialize;

use crate::fingerprint::PathFingerprint;
use crate::pathweave_error::PathweaveError;

/// A fingerprint together with the resolved feasibility of its path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrainingItem {
    pub fingerprint: PathFingerprint,
    /// True when the path turned out to be feasible.
    pub label: bool,
}

impl TrainingItem {
    pub fn new(fingerprint: PathFingerprint, label: bool) -> Self {
        TrainingItem { fingerprint, label }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// No usable signal: too little training data, too many neighbors with
    /// nothing in common with the query, or a tied vote. Never read this as
    /// a negative label.
    Unknown,
    Known {
        label: bool,
        /// Size of the losing side of the vote; lower means a stronger
        /// majority.
        voting_weight: usize,
        /// Mean similarity of the k nearest neighbors.
        average_similarity: f64,
    },
}

pub struct ClassifierKnn {
    k: usize,
    items: RwLock<BTreeSet<TrainingItem>>,
}

impl ClassifierKnn {
    pub fn new(k: usize) -> Result<Self, PathweaveError> {
        if k == 0 {
            return Err(PathweaveError::InvalidConfig(
                "classifier k must be > 0".to_string(),
            ));
        }
        Ok(ClassifierKnn {
            k,
            items: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<TrainingItem>> {
        self.items.read().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn train(&self, items: impl IntoIterator<Item = TrainingItem>) {
        let mut set = self
            .items
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        set.extend(items);
    }

    pub fn classify(&self, query: &PathFingerprint) -> Prediction {
        let mut scored: Vec<(f64, bool)> = {
            let items = self.read();
            if items.len() < self.k {
                return Prediction::Unknown;
            }
            items
                .iter()
                .map(|item| (query.similarity(&item.fingerprint), item.label))
                .collect()
        };
        // Descending: the most similar neighbors first. The sort is stable,
        // so ties keep the training set's order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut uncertain = 0usize;
        let mut count_true = 0usize;
        let mut count_false = 0usize;
        let mut similarity_sum = 0.0f64;
        for &(similarity, label) in &scored[..self.k] {
            similarity_sum += similarity;
            if similarity == 0.0 {
                uncertain += 1;
            } else if label {
                count_true += 1;
            } else {
                count_false += 1;
            }
        }
        let average_similarity = similarity_sum / self.k as f64;

        if (uncertain >= count_true && uncertain >= count_false) || count_true == count_false {
            return Prediction::Unknown;
        }
        let label = count_true > count_false;
        Prediction::Known {
            label,
            voting_weight: count_true.min(count_false),
            average_similarity,
        }
    }
}

/// Turns predictions into skip decisions: a path is only skipped when the
/// classifier confidently predicts it infeasible.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriagePolicy {
    pub enabled: bool,
    pub k: usize,
    /// Largest minority vote still considered a confident majority.
    pub max_minority_votes: usize,
    pub min_average_similarity: f64,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        TriagePolicy {
            enabled: true,
            k: 5,
            max_minority_votes: 1,
            min_average_similarity: 0.75,
        }
    }
}

impl TriagePolicy {
    pub fn validate(&self) -> Result<(), PathweaveError> {
        if self.k == 0 {
            return Err(PathweaveError::InvalidConfig(
                "triage k must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_average_similarity) {
            return Err(PathweaveError::InvalidConfig(format!(
                "min_average_similarity must be in [0, 1]; got {}",
                self.min_average_similarity
            )));
        }
        Ok(())
    }

    pub fn should_skip(&self, prediction: &Prediction) -> bool {
        match *prediction {
            Prediction::Known {
                label: false,
                voting_weight,
                average_similarity,
            } => {
                self.enabled
                    && voting_weight <= self.max_minority_votes
                    && average_similarity >= self.min_average_similarity
            }
            Prediction::Known { label: true, .. } | Prediction::Unknown => false,
        }
    }
}
