// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Line-oriented key-file documents: ordered `[Group]` sections of
//! `key=value` entries, with `;` separated list values.
//!
//! Group and key order is preserved so that serialized output is stable
//! across a load / save round-trip.

use std::fmt;

use thiserror::Error;

pub const LIST_SEPARATOR: char = ';';

/// An ordered key-file document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

/// A named section of ordered `key=value` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl Group {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split a `;` separated list value, honoring `\;` and `\\` escapes.
    /// A trailing separator does not produce an empty element.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(split_list)
    }

    /// Join elements with `;`, escaping embedded separators, with a
    /// trailing separator
    pub fn set_list<S: AsRef<str>>(&mut self, key: impl Into<String>, values: &[S]) {
        self.set(key, join_list(values));
    }
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document. Unknown constructs are rejected, comments and
    /// blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut this = Self::default();
        let mut current: Option<usize> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let line_number = index + 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return Err(Error::MalformedGroup { line_number });
                };
                if name.is_empty() {
                    return Err(Error::MalformedGroup { line_number });
                }
                current = Some(this.ensure_group_index(name));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::MalformedEntry { line_number });
            };
            let Some(group) = current else {
                return Err(Error::EntryOutsideGroup { line_number });
            };

            this.groups[group].set(key.trim_end(), value.trim_start());
        }

        Ok(this)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    /// Returns the named group, appending an empty one if absent
    pub fn ensure_group(&mut self, name: &str) -> &mut Group {
        let index = self.ensure_group_index(name);
        &mut self.groups[index]
    }

    fn ensure_group_index(&mut self, name: &str) -> usize {
        if let Some(index) = self.groups.iter().position(|g| g.name == name) {
            index
        } else {
            self.groups.push(Group::new(name));
            self.groups.len() - 1
        }
    }

    pub fn remove_group(&mut self, name: &str) -> Option<Group> {
        let index = self.groups.iter().position(|g| g.name == name)?;
        Some(self.groups.remove(index))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.group(group)?.get(key)
    }

    pub fn set(&mut self, group: &str, key: impl Into<String>, value: impl Into<String>) {
        self.ensure_group(group).set(key, value);
    }

    pub fn get_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        self.group(group)?.get_list(key)
    }

    pub fn set_list<S: AsRef<str>>(&mut self, group: &str, key: impl Into<String>, values: &[S]) {
        self.ensure_group(group).set_list(key, values);
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, group) in self.groups.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", group.name)?;
            for (key, value) in &group.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    let mut elements = vec![];
    let mut current = String::new();
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next @ (LIST_SEPARATOR | '\\')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            },
            LIST_SEPARATOR => {
                elements.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        elements.push(current);
    }

    elements
}

pub fn join_list<S: AsRef<str>>(values: &[S]) -> String {
    let mut out = String::new();
    for value in values {
        for c in value.as_ref().chars() {
            if c == LIST_SEPARATOR || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push(LIST_SEPARATOR);
    }
    out
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed group header on line {line_number}")]
    MalformedGroup { line_number: usize },

    #[error("malformed entry on line {line_number}")]
    MalformedEntry { line_number: usize },

    #[error("entry outside of any group on line {line_number}")]
    EntryOutsideGroup { line_number: usize },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let text = "[Context]\nshared=network;!ipc;\nsockets=wayland;\n\n[Environment]\nLANG=en_US.UTF-8\n";
        let keyfile = KeyFile::parse(text).unwrap();

        assert_eq!(keyfile.get("Context", "shared"), Some("network;!ipc;"));
        assert_eq!(keyfile.get("Environment", "LANG"), Some("en_US.UTF-8"));
        assert_eq!(keyfile.to_string(), text);
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let keyfile = KeyFile::parse("# header\n\n[A]\n# note\nx=1\n").unwrap();
        assert_eq!(keyfile.get("A", "x"), Some("1"));
    }

    #[test]
    fn entry_outside_group_rejected() {
        assert!(matches!(
            KeyFile::parse("x=1\n"),
            Err(Error::EntryOutsideGroup { line_number: 1 })
        ));
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(matches!(
            KeyFile::parse("[A\n"),
            Err(Error::MalformedGroup { line_number: 1 })
        ));
        assert!(matches!(
            KeyFile::parse("[A]\nno-equals\n"),
            Err(Error::MalformedEntry { line_number: 2 })
        ));
    }

    #[test]
    fn duplicate_groups_merge() {
        let keyfile = KeyFile::parse("[A]\nx=1\n[B]\ny=2\n[A]\nz=3\n").unwrap();
        let group = keyfile.group("A").unwrap();
        assert_eq!(group.get("x"), Some("1"));
        assert_eq!(group.get("z"), Some("3"));
    }

    #[test]
    fn last_write_wins() {
        let mut keyfile = KeyFile::new();
        keyfile.set("A", "x", "1");
        keyfile.set("A", "x", "2");
        assert_eq!(keyfile.get("A", "x"), Some("2"));
        assert_eq!(keyfile.group("A").unwrap().keys().count(), 1);
    }

    #[test]
    fn list_values() {
        let mut keyfile = KeyFile::new();
        keyfile.set_list("A", "list", &["one", "two;half", "back\\slash"]);

        let raw = keyfile.get("A", "list").unwrap();
        assert_eq!(raw, r"one;two\;half;back\\slash;");
        assert_eq!(
            keyfile.get_list("A", "list").unwrap(),
            vec!["one", "two;half", "back\\slash"]
        );
    }

    #[test]
    fn trailing_separator_produces_no_empty_element() {
        assert_eq!(split_list("a;b;"), vec!["a", "b"]);
        assert_eq!(split_list(""), Vec::<String>::new());
    }

    #[test]
    fn whitespace_trimmed_around_entries() {
        let keyfile = KeyFile::parse("[A]\n  x = 1\n").unwrap();
        assert_eq!(keyfile.get("A", "x"), Some("1"));
    }
}
