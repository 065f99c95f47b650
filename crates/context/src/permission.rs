// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-capability permission records and their list-token encoding.
//!
//! A capability (a socket or device name) is either unconditionally
//! allowed, unconditionally disallowed, or allowed under one or more
//! named runtime conditions. The list encoding uses three token shapes:
//! `name` (allow), `!name` (disallow / reset marker) and
//! `if:name:condition`.

use log::warn;

/// Condition name that always evaluates true
pub const CONDITION_TRUE: &str = "true";

/// Permission state of a single named capability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permission {
    allowed: bool,
    reset: bool,
    // Lexicographically sorted, deduplicated
    conditionals: Vec<String>,
    // Bare legacy token seen while deserializing; the first
    // `if:` token for the capability reverts it
    legacy_token: bool,
    // Reset state prior to the bare token, restored on revert
    legacy_prior_reset: bool,
}

impl Permission {
    /// Unconditionally allow. Also resets: conditionals layered below
    /// must not make the grant conditional again.
    pub fn allow(&mut self) {
        self.allowed = true;
        self.reset = true;
        self.conditionals.clear();
        self.legacy_token = false;
    }

    /// Unconditionally disallow, resetting lower layers
    pub fn disallow(&mut self) {
        self.allowed = false;
        self.reset = true;
        self.conditionals.clear();
        self.legacy_token = false;
    }

    /// Allow when `condition` holds. Ignored if already unconditionally
    /// allowed or the condition is already present.
    pub fn allow_if(&mut self, condition: impl Into<String>) {
        if self.allowed {
            return;
        }
        let condition = condition.into();
        if let Err(index) = self.conditionals.binary_search(&condition) {
            self.conditionals.insert(index, condition);
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn conditionals(&self) -> &[String] {
        &self.conditionals
    }

    /// Layer `overlay` on top of this record
    pub fn merge(&mut self, overlay: &Permission) {
        if overlay.reset {
            self.conditionals.clear();
            self.reset = true;
        }
        self.allowed = overlay.allowed;
        for condition in &overlay.conditionals {
            if let Err(index) = self.conditionals.binary_search(condition) {
                self.conditionals.insert(index, condition.clone());
            }
        }
        if self.allowed {
            self.conditionals.clear();
        }
    }

    /// Evaluate the record against runtime conditions. The evaluator
    /// returns `None` for unknown conditions, which contribute nothing.
    pub fn compute(&self, evaluator: impl Fn(&str) -> Option<bool>) -> bool {
        if self.allowed {
            return true;
        }
        self.conditionals.iter().any(|conditional| {
            let (negated, name) = match conditional.strip_prefix('!') {
                Some(name) => (true, name),
                None => (false, conditional.as_str()),
            };
            if name == CONDITION_TRUE {
                return !negated;
            }
            match evaluator(name) {
                Some(value) => value != negated,
                None => false,
            }
        })
    }

    /// True iff `new` grants strictly more than `old`
    pub fn adds_permissions(old: &Permission, new: &Permission) -> bool {
        if old.allowed {
            return false;
        }
        if new.allowed {
            return true;
        }

        // Merge-walk over the two sorted lists; conditionals only
        // present in `old` are ignored
        let mut old_iter = old.conditionals.iter().peekable();
        for conditional in &new.conditionals {
            loop {
                match old_iter.peek() {
                    Some(existing) if *existing < conditional => {
                        old_iter.next();
                    }
                    Some(existing) if *existing == conditional => break,
                    _ => return true,
                }
            }
        }

        false
    }

    /// Emit the record's list tokens for capability `name`
    pub fn serialize(&self, name: &str, flatten: bool, out: &mut Vec<String>) {
        if self.allowed {
            out.push(name.to_owned());
        } else if !self.conditionals.is_empty() {
            if self.reset && !flatten {
                out.push(format!("!{name}"));
            }
            // Backward compatibility for readers unaware of `if:`
            // tokens, which must follow it
            out.push(name.to_owned());
            for conditional in &self.conditionals {
                out.push(format!("if:{name}:{conditional}"));
            }
        } else if !flatten {
            out.push(format!("!{name}"));
        }
    }

    fn apply_legacy_token(&mut self) {
        if !self.conditionals.is_empty() {
            warn!("bare permission token after conditional tokens; treating as unconditional allow");
        }
        let prior_reset = self.reset;
        self.allow();
        self.legacy_token = true;
        self.legacy_prior_reset = prior_reset;
    }

    fn apply_conditional_token(&mut self, condition: &str) {
        if self.legacy_token {
            // Revert the provisional unconditional allow; the bare
            // token was compatibility output for this conditional
            self.allowed = false;
            self.reset = self.legacy_prior_reset;
            self.legacy_token = false;
        } else if self.allowed {
            warn!("conditional permission token after unconditional allow; ignoring if:{condition}");
            return;
        }
        self.allow_if(condition);
    }

    fn finish_deserialize(&mut self) {
        self.legacy_token = false;
        self.legacy_prior_reset = false;
    }
}

/// Insertion-ordered map of capability name to [`Permission`].
///
/// Insertion order is load order, which keeps serialization stable
/// across round-trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMap(Vec<(String, Permission)>);

impl PermissionMap {
    pub fn get(&self, name: &str) -> Option<&Permission> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn entry(&mut self, name: &str) -> &mut Permission {
        if let Some(index) = self.0.iter().position(|(n, _)| n == name) {
            &mut self.0[index].1
        } else {
            self.0.push((name.to_owned(), Permission::default()));
            &mut self.0.last_mut().expect("just pushed").1
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Permission)> {
        self.0.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Layer `overlay` onto this map, per-capability
    pub fn merge(&mut self, overlay: &PermissionMap) {
        for (name, permission) in overlay.iter() {
            self.entry(name).merge(permission);
        }
    }

    /// Serialize every capability into list tokens
    pub fn serialize(&self, flatten: bool) -> Vec<String> {
        let mut out = vec![];
        for (name, permission) in self.iter() {
            permission.serialize(name, flatten, &mut out);
        }
        out
    }

    /// Rebuild a map from list tokens. Tolerates the legacy encoding
    /// where a bare `name` precedes the `if:name:*` tokens it stands
    /// in for.
    pub fn deserialize(tokens: &[String]) -> PermissionMap {
        let mut map = PermissionMap::default();

        for token in tokens {
            if let Some(rest) = token.strip_prefix("if:") {
                let Some((name, condition)) = rest.split_once(':') else {
                    warn!("malformed conditional permission token {token}; ignoring");
                    continue;
                };
                map.entry(name).apply_conditional_token(condition);
            } else if let Some(name) = token.strip_prefix('!') {
                map.entry(name).disallow();
            } else {
                map.entry(token).apply_legacy_token();
            }
        }

        for (_, permission) in &mut map.0 {
            permission.finish_deserialize();
        }

        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn allow_clears_conditionals() {
        let mut p = Permission::default();
        p.allow_if("has-wayland");
        p.allow();

        assert!(p.is_allowed());
        assert!(p.is_reset());
        assert!(p.conditionals().is_empty());
    }

    #[test]
    fn conditionals_sorted_and_deduplicated() {
        let mut p = Permission::default();
        p.allow_if("zeta");
        p.allow_if("alpha");
        p.allow_if("zeta");

        assert_eq!(p.conditionals(), ["alpha", "zeta"]);
    }

    #[test]
    fn allow_if_ignored_when_allowed() {
        let mut p = Permission::default();
        p.allow();
        p.allow_if("cond");
        assert!(p.conditionals().is_empty());
    }

    #[test]
    fn merge_reset_clears_base_conditionals() {
        let mut base = Permission::default();
        base.allow_if("base-cond");

        let mut overlay = Permission::default();
        overlay.disallow();
        overlay.allow_if("overlay-cond");

        base.merge(&overlay);

        assert!(!base.is_allowed());
        assert!(base.is_reset());
        assert_eq!(base.conditionals(), ["overlay-cond"]);
    }

    #[test]
    fn merge_unions_conditionals() {
        let mut base = Permission::default();
        base.allow_if("b");

        let mut overlay = Permission::default();
        overlay.allow_if("a");
        overlay.allow_if("c");

        base.merge(&overlay);
        assert_eq!(base.conditionals(), ["a", "b", "c"]);
    }

    #[test]
    fn compute_statics_and_negation() {
        let mut p = Permission::default();
        p.allow_if("true");
        assert!(p.compute(|_| None));

        let mut p = Permission::default();
        p.allow_if("!missing-display");
        assert!(p.compute(|name| (name == "missing-display").then_some(false)));
        assert!(!p.compute(|name| (name == "missing-display").then_some(true)));

        let mut p = Permission::default();
        p.allow_if("unknown-condition");
        assert!(!p.compute(|_| None));
    }

    #[test]
    fn adds_permissions_matrix() {
        let allowed = {
            let mut p = Permission::default();
            p.allow();
            p
        };
        let denied = {
            let mut p = Permission::default();
            p.disallow();
            p
        };
        let conditional = |conds: &[&str]| {
            let mut p = Permission::default();
            for c in conds {
                p.allow_if(*c);
            }
            p
        };

        assert!(!Permission::adds_permissions(&allowed, &denied));
        assert!(!Permission::adds_permissions(&allowed, &allowed));
        assert!(Permission::adds_permissions(&denied, &allowed));
        assert!(Permission::adds_permissions(
            &denied,
            &conditional(&["a"])
        ));
        assert!(!Permission::adds_permissions(
            &conditional(&["a", "b"]),
            &conditional(&["a"])
        ));
        assert!(Permission::adds_permissions(
            &conditional(&["a"]),
            &conditional(&["a", "b"])
        ));
        assert!(!Permission::adds_permissions(
            &conditional(&["a", "b"]),
            &conditional(&["a", "b"])
        ));
    }

    #[test]
    fn serialize_unconditional() {
        let mut map = PermissionMap::default();
        map.entry("wayland").allow();
        map.entry("x11").disallow();

        assert_eq!(map.serialize(false), tokens(&["wayland", "!x11"]));
        // Flatten drops the no-op negation
        assert_eq!(map.serialize(true), tokens(&["wayland"]));
    }

    #[test]
    fn serialize_conditional_token_order() {
        let mut map = PermissionMap::default();
        let p = map.entry("wayland");
        p.disallow();
        p.allow_if("has-wayland");

        // Reset marker, then the compat token, then conditionals
        assert_eq!(
            map.serialize(false),
            tokens(&["!wayland", "wayland", "if:wayland:has-wayland"])
        );
        assert_eq!(
            map.serialize(true),
            tokens(&["wayland", "if:wayland:has-wayland"])
        );
    }

    #[test]
    fn deserialize_legacy_revert() {
        let map = PermissionMap::deserialize(&tokens(&["foo", "if:foo:c"]));
        let p = map.get("foo").unwrap();

        assert!(!p.is_allowed());
        assert!(!p.is_reset());
        assert_eq!(p.conditionals(), ["c"]);
    }

    #[test]
    fn deserialize_round_trip_mixed() {
        let input = tokens(&["wayland", "if:wayland:has-wayland", "!x11"]);
        let map = PermissionMap::deserialize(&input);

        let wayland = map.get("wayland").unwrap();
        assert!(!wayland.is_allowed());
        assert!(!wayland.is_reset());
        assert_eq!(wayland.conditionals(), ["has-wayland"]);

        let x11 = map.get("x11").unwrap();
        assert!(!x11.is_allowed());
        assert!(x11.is_reset());
        assert!(x11.conditionals().is_empty());

        assert_eq!(map.serialize(false), input);
    }

    #[test]
    fn deserialize_reset_conditional_round_trip() {
        let input = tokens(&["!pulseaudio", "pulseaudio", "if:pulseaudio:has-audio"]);
        let map = PermissionMap::deserialize(&input);

        let p = map.get("pulseaudio").unwrap();
        assert!(!p.is_allowed());
        assert!(p.is_reset());
        assert_eq!(p.conditionals(), ["has-audio"]);

        assert_eq!(map.serialize(false), input);
    }

    #[test]
    fn deserialize_bare_token_alone_is_allow() {
        let map = PermissionMap::deserialize(&tokens(&["dri"]));
        let p = map.get("dri").unwrap();

        assert!(p.is_allowed());
        assert!(p.is_reset());
    }
}
