// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Remotes: named sources of refs and commits.
//!
//! Remote definitions are persisted per installation; the summary of
//! what a remote serves is fetched lazily and cached per transaction
//! as a [`RemoteState`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::{Kind, Ref};
use crate::store::CommitId;

/// A configured remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub url: String,
    #[serde(default)]
    pub disabled: bool,
    /// Ephemeral origin remotes are pruned when the transaction that
    /// created them finishes
    #[serde(default)]
    pub ephemeral: bool,
}

/// Named map of remote configs, the on-disk document shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map(pub BTreeMap<String, Config>);

impl Map {
    pub fn get(&self, name: &str) -> Option<&Config> {
        self.0.get(name)
    }
}

/// What a remote serves for one ref
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub commit: CommitId,
    pub installed_size: u64,
    pub download_size: u64,
    /// Raw metadata document for the ref
    #[serde(default)]
    pub metadata: Option<String>,
}

/// A ref declared by a primary ref as an optional extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedRef {
    pub reference: Ref,
    #[serde(default)]
    pub subpaths: Vec<String>,
    /// Whether the related content should be fetched automatically
    #[serde(default)]
    pub download: bool,
    #[serde(default)]
    pub delete: bool,
}

/// Summary document served by a remote: the ref cache table plus
/// related-ref declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub entries: BTreeMap<String, SummaryEntry>,
    #[serde(default)]
    pub related: BTreeMap<String, Vec<RelatedRef>>,
}

/// Cached per-transaction view of one remote
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub name: String,
    pub url: String,
    summary: Summary,
}

impl RemoteState {
    pub fn new(name: impl Into<String>, url: impl Into<String>, summary: Summary) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            summary,
        }
    }

    pub fn lookup_ref(&self, reference: &Ref) -> Option<&SummaryEntry> {
        self.summary.entries.get(&reference.to_string())
    }

    /// Best-effort metadata for a ref; `None` is a warning at call
    /// sites, never an error
    pub fn lookup_metadata(&self, reference: &Ref) -> Option<&str> {
        self.lookup_ref(reference)?.metadata.as_deref()
    }

    pub fn related_refs(&self, reference: &Ref) -> &[RelatedRef] {
        self.summary
            .related
            .get(&reference.to_string())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every well-formed ref this remote serves
    pub fn refs(&self) -> Vec<Ref> {
        self.summary
            .entries
            .keys()
            .filter_map(|name| Ref::parse(name).ok())
            .collect()
    }

    /// Refs of the given kind and id served by this remote, used for
    /// runtime discovery
    pub fn search(&self, kind: Kind, id: &str) -> Vec<Ref> {
        self.summary
            .entries
            .keys()
            .filter_map(|name| Ref::parse(name).ok())
            .filter(|r| r.kind() == kind && r.id() == id)
            .collect()
    }

    pub fn contains(&self, reference: &Ref) -> bool {
        self.lookup_ref(reference).is_some()
    }
}

/// Per-transaction cache of [`RemoteState`]
#[derive(Debug, Default)]
pub struct StateCache(HashMap<String, RemoteState>);

impl StateCache {
    pub fn get(&self, name: &str) -> Option<&RemoteState> {
        self.0.get(name)
    }

    pub fn insert(&mut self, state: RemoteState) -> &RemoteState {
        let name = state.name.clone();
        self.0.insert(name.clone(), state);
        &self.0[&name]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such remote: {0}")]
    UnknownRemote(String),

    #[error("remote {0} is disabled")]
    Disabled(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn summary() -> Summary {
        let mut entries = BTreeMap::new();
        entries.insert(
            "runtime/org.example.Platform/x86_64/23.08".to_owned(),
            SummaryEntry {
                commit: CommitId::from("a".repeat(64)),
                installed_size: 1000,
                download_size: 500,
                metadata: Some("[Runtime]\nruntime=org.example.Platform/x86_64/23.08\n".to_owned()),
            },
        );
        entries.insert(
            "runtime/org.example.Platform/aarch64/23.08".to_owned(),
            SummaryEntry::default(),
        );
        Summary {
            entries,
            related: BTreeMap::new(),
        }
    }

    #[test]
    fn search_by_kind_and_id() {
        let state = RemoteState::new("origin", "file:///srv/repo", summary());

        let found = state.search(Kind::Runtime, "org.example.Platform");
        assert_eq!(found.len(), 2);
        assert!(state.search(Kind::App, "org.example.Platform").is_empty());
        assert!(state.search(Kind::Runtime, "org.other").is_empty());
    }

    #[test]
    fn metadata_lookup_is_optional() {
        let state = RemoteState::new("origin", "file:///srv/repo", summary());
        let with = Ref::parse("runtime/org.example.Platform/x86_64/23.08").unwrap();
        let without = Ref::parse("runtime/org.example.Platform/aarch64/23.08").unwrap();

        assert!(state.lookup_metadata(&with).is_some());
        assert!(state.lookup_metadata(&without).is_none());
    }
}
