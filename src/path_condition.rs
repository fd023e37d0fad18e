// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// A symbolic path condition: the conjunction of clauses collected along one
/// execution path, in the order they were assumed. Clause text is opaque to
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PathCondition {
    clauses: Vec<String>,
}

impl PathCondition {
    pub fn new(clauses: Vec<String>) -> Self {
        PathCondition { clauses }
    }

    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for PathCondition {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        PathCondition::new(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for PathCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.clauses.join(" && "))
    }
}

/// One coarse ("general") and one fine ("specific") token per clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicedCondition {
    pub general: Vec<String>,
    pub specific: Vec<String>,
}

pub trait PathConditionSlicer: Send + Sync {
    /// Must return sequences of equal length.
    fn slice(&self, condition: &PathCondition) -> SlicedCondition;
}

/// Slices each clause into its structural shape (identifiers and numeric
/// literals abstracted away) and its exact trimmed text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeSlicer;

impl ShapeSlicer {
    pub fn shape(clause: &str) -> String {
        let mut out = String::with_capacity(clause.len());
        let mut chars = clause.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_whitespace() {
                continue;
            }
            if c.is_ascii_digit() {
                while chars
                    .peek()
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '.')
                {
                    chars.next();
                }
                out.push('n');
            } else if c.is_alphabetic() || c == '_' || c == '$' {
                while chars
                    .peek()
                    .is_some_and(|n| n.is_alphanumeric() || *n == '_' || *n == '$')
                {
                    chars.next();
                }
                out.push('v');
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl PathConditionSlicer for ShapeSlicer {
    fn slice(&self, condition: &PathCondition) -> SlicedCondition {
        let general = condition
            .clauses()
            .iter()
            .map(|c| ShapeSlicer::shape(c))
            .collect();
        let specific = condition
            .clauses()
            .iter()
            .map(|c| c.trim().to_string())
            .collect();
        SlicedCondition { general, specific }
    }
}
