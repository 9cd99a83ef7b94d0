// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use fnv::FnvHasher;

const SEPARATOR: u8 = 0xff;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered set of name/value pairs identifying a series.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Keeps the given order.
    #[must_use]
    pub fn new(labels: Vec<Label>) -> Self {
        Self(labels)
    }

    /// Builds a set sorted by name from `name, value` pairs.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(name, value)| Label::new(name, value))
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self(labels)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    /// Stable 64-bit FNV-1a hash over `name 0xff value 0xff` for every pair, in
    /// order. Used for sharding, so it must not change between releases.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write(&[SEPARATOR]);
            hasher.write(label.value.as_bytes());
            hasher.write(&[SEPARATOR]);
        }
        hasher.finish()
    }

    /// Series labels in their own order, followed by each external label whose
    /// name the series does not already carry, in the external set's order.
    ///
    /// The result is not re-sorted: an external label that sorts before the
    /// series labels still lands at the tail.
    #[must_use]
    pub fn merge_external(&self, external: &Labels) -> Labels {
        let mut merged = Vec::with_capacity(self.0.len() + external.0.len());
        merged.extend(self.0.iter().cloned());
        merged.extend(
            external
                .0
                .iter()
                .filter(|ext| !self.has(&ext.name))
                .cloned(),
        );
        Labels(merged)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<Label> {
        self.0
    }
}

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Self(labels)
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
