//! Capability normalization.
//!
//! Workers advertise capabilities either as a list of tags
//! (`["code", "review"]`) or as the legacy map of booleans
//! (`{ code = true, review = false }`). Both shapes are accepted at the
//! boundary and normalized once, at registration, into a [`CapabilitySet`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Capabilities as reported by a worker or a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityShape {
    Tags(Vec<String>),
    Flags(BTreeMap<String, bool>),
}

impl Default for CapabilityShape {
    fn default() -> Self {
        Self::Tags(Vec::new())
    }
}

impl CapabilityShape {
    pub fn normalize(&self) -> CapabilitySet {
        match self {
            CapabilityShape::Tags(tags) => from_tags(tags),
            CapabilityShape::Flags(flags) => from_flags(flags),
        }
    }
}

impl From<Vec<&str>> for CapabilityShape {
    fn from(tags: Vec<&str>) -> Self {
        Self::Tags(tags.into_iter().map(String::from).collect())
    }
}

/// Canonical capability tags: trimmed, lowercase, deduplicated, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(&canonical(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<&str> = self.iter().collect();
        write!(f, "{}", tags.join(","))
    }
}

/// Adapter for the list-of-tags shape.
pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> CapabilitySet {
    CapabilitySet(
        tags.iter()
            .map(|t| canonical(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

/// Adapter for the legacy map-of-booleans shape. Only `true` entries count.
pub fn from_flags(flags: &BTreeMap<String, bool>) -> CapabilitySet {
    CapabilitySet(
        flags
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(tag, _)| canonical(tag))
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

fn canonical(tag: &str) -> String {
    tag.trim().to_lowercase()
}
