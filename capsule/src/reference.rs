// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content names of the form `kind/id/arch/branch`.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumString};
use thiserror::Error;

/// Id suffixes marking subordinate content of a parent ref
const SUBREF_SUFFIXES: &[&str] = &[".Locale", ".Debug", ".Sources", ".Docs"];

/// What a ref names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    App,
    Runtime,
}

/// A fully qualified content name. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    kind: Kind,
    id: String,
    arch: String,
    branch: String,
}

impl Ref {
    pub fn new(
        kind: Kind,
        id: impl Into<String>,
        arch: impl Into<String>,
        branch: impl Into<String>,
    ) -> Result<Self, Error> {
        let id = id.into();
        let arch = arch.into();
        let branch = branch.into();

        for segment in [&id, &arch, &branch] {
            if segment.is_empty() {
                return Err(Error::EmptySegment);
            }
            if segment.contains('/') {
                return Err(Error::SegmentSeparator(segment.clone()));
            }
        }

        Ok(Self { kind, id, arch, branch })
    }

    /// Parse the canonical four segment form
    pub fn parse(text: &str) -> Result<Self, Error> {
        let segments = text.split('/').collect::<Vec<_>>();
        let [kind, id, arch, branch] = segments[..] else {
            return Err(Error::SegmentCount(text.to_owned()));
        };
        let kind = kind
            .parse::<Kind>()
            .map_err(|_| Error::UnknownKind(kind.to_owned()))?;
        Self::new(kind, id, arch, branch)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn is_app(&self) -> bool {
        self.kind == Kind::App
    }

    pub fn is_runtime(&self) -> bool {
        self.kind == Kind::Runtime
    }

    /// The short form `id/arch/branch` used in user facing messages
    pub fn pref(&self) -> String {
        format!("{}/{}/{}", self.id, self.arch, self.branch)
    }

    /// True iff the id's last dotted component marks subordinate
    /// content, e.g. `org.example.App.Locale`
    pub fn is_subref(&self) -> bool {
        is_subref_id(&self.id)
    }
}

pub fn is_subref_id(id: &str) -> bool {
    SUBREF_SUFFIXES.iter().any(|suffix| id.ends_with(suffix))
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.kind, self.id, self.arch, self.branch)
    }
}

impl FromStr for Ref {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(de::Error::custom)
    }
}

/// Components recovered by [`parse_partial`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRef {
    /// The kinds the text can still match
    pub kinds: Vec<Kind>,
    pub id: Option<String>,
    pub arch: Option<String>,
    pub branch: Option<String>,
}

/// Tolerant parser for completion and glob matching: recovers whatever
/// suffix components are present. An empty segment leaves the
/// component unset, a leading kind segment narrows `allowed_kinds`.
pub fn parse_partial(text: &str, allowed_kinds: &[Kind]) -> Result<PartialRef, Error> {
    let mut segments = text.split('/').collect::<Vec<_>>();

    let kinds = match segments.first().and_then(|s| s.parse::<Kind>().ok()) {
        Some(kind) => {
            if !allowed_kinds.contains(&kind) {
                return Err(Error::KindNotAllowed(kind));
            }
            segments.remove(0);
            vec![kind]
        }
        None => allowed_kinds.to_vec(),
    };

    if segments.len() > 3 {
        return Err(Error::SegmentCount(text.to_owned()));
    }

    let mut component = |index: usize| {
        segments
            .get(index)
            .filter(|s| !s.is_empty())
            .map(|s| (*s).to_owned())
    };

    Ok(PartialRef {
        id: component(0),
        arch: component(1),
        branch: component(2),
        kinds,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ref: expected kind/id/arch/branch: {0}")]
    SegmentCount(String),

    #[error("invalid ref: empty segment")]
    EmptySegment,

    #[error("invalid ref: segment contains /: {0}")]
    SegmentSeparator(String),

    #[error("invalid ref kind: {0}")]
    UnknownKind(String),

    #[error("ref kind {0} not allowed here")]
    KindNotAllowed(Kind),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_canonical() {
        let reference = Ref::parse("app/org.example.App/x86_64/stable").unwrap();
        assert_eq!(reference.kind(), Kind::App);
        assert_eq!(reference.id(), "org.example.App");
        assert_eq!(reference.arch(), "x86_64");
        assert_eq!(reference.branch(), "stable");
        assert_eq!(reference.to_string(), "app/org.example.App/x86_64/stable");
        assert_eq!(reference.pref(), "org.example.App/x86_64/stable");
    }

    #[test]
    fn parse_rejects_wrong_segment_count() {
        assert!(Ref::parse("app/org.example.App/x86_64").is_err());
        assert!(Ref::parse("app/org.example.App/x86_64/stable/extra").is_err());
        assert!(Ref::parse("").is_err());
    }

    #[test]
    fn parse_rejects_bad_kind_and_empty_segments() {
        assert!(matches!(
            Ref::parse("extension/org.example.App/x86_64/stable"),
            Err(Error::UnknownKind(_))
        ));
        assert!(matches!(
            Ref::parse("app//x86_64/stable"),
            Err(Error::EmptySegment)
        ));
    }

    #[test]
    fn equality_over_all_components() {
        let a = Ref::parse("app/org.example.App/x86_64/stable").unwrap();
        let b = Ref::parse("app/org.example.App/x86_64/beta").unwrap();
        let c = Ref::parse("runtime/org.example.App/x86_64/stable").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Ref::parse("app/org.example.App/x86_64/stable").unwrap());
    }

    #[test]
    fn subref_detection() {
        assert!(is_subref_id("org.example.App.Locale"));
        assert!(is_subref_id("org.example.App.Debug"));
        assert!(is_subref_id("org.example.App.Sources"));
        assert!(!is_subref_id("org.example.App"));
        assert!(!is_subref_id("org.example.Locale.App"));
    }

    #[test]
    fn partial_with_kind() {
        let partial = parse_partial("app/org.example.App", &[Kind::App, Kind::Runtime]).unwrap();
        assert_eq!(partial.kinds, [Kind::App]);
        assert_eq!(partial.id.as_deref(), Some("org.example.App"));
        assert_eq!(partial.arch, None);
        assert_eq!(partial.branch, None);
    }

    #[test]
    fn partial_without_kind() {
        let partial = parse_partial("org.example.App//stable", &[Kind::App, Kind::Runtime]).unwrap();
        assert_eq!(partial.kinds, [Kind::App, Kind::Runtime]);
        assert_eq!(partial.id.as_deref(), Some("org.example.App"));
        assert_eq!(partial.arch, None);
        assert_eq!(partial.branch.as_deref(), Some("stable"));
    }

    #[test]
    fn partial_disallowed_kind() {
        assert!(matches!(
            parse_partial("runtime/org.example.Platform", &[Kind::App]),
            Err(Error::KindNotAllowed(Kind::Runtime))
        ));
    }

    #[test]
    fn partial_too_many_segments() {
        assert!(parse_partial("app/a/b/c/d", &[Kind::App]).is_err());
    }

    #[test]
    fn serde_as_string() {
        let reference = Ref::parse("runtime/org.example.Platform/x86_64/23.08").unwrap();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"runtime/org.example.Platform/x86_64/23.08\"");
        assert_eq!(serde_json::from_str::<Ref>(&json).unwrap(), reference);
    }
}
