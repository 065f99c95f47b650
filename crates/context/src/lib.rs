// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Sandbox context model: the aggregate of permissions an application
//! runs with, with merge/override semantics for layering contexts and
//! a key-file serialization used in application metadata.

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use log::warn;
use thiserror::Error;

pub use self::bus::Policy as BusPolicy;
pub use self::filesystem::{Filesystem, Mode as FilesystemMode};
pub use self::permission::{Permission, PermissionMap};
pub use self::usb::Query as UsbQuery;

pub mod bus;
pub mod filesystem;
pub mod permission;
pub mod usb;

bitflags! {
    /// Host resources shared into the sandbox
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Shares: u32 {
        const NETWORK = 1 << 0;
        const IPC = 1 << 1;
    }
}

bitflags! {
    /// Optional sandbox features
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Features: u32 {
        const DEVEL = 1 << 0;
        const MULTIARCH = 1 << 1;
        const BLUETOOTH = 1 << 2;
        const CANBUS = 1 << 3;
        const PER_APP_DEV_SHM = 1 << 4;
    }
}

/// Features that never count towards "asks for more permissions"
pub const HARMLESS_FEATURES: Features = Features::MULTIARCH.union(Features::PER_APP_DEV_SHM);

const SHARE_TOKENS: &[(Shares, &str)] = &[(Shares::NETWORK, "network"), (Shares::IPC, "ipc")];

const FEATURE_TOKENS: &[(Features, &str)] = &[
    (Features::DEVEL, "devel"),
    (Features::MULTIARCH, "multiarch"),
    (Features::BLUETOOTH, "bluetooth"),
    (Features::CANBUS, "canbus"),
    (Features::PER_APP_DEV_SHM, "per-app-dev-shm"),
];

const GROUP_CONTEXT: &str = "Context";
const GROUP_SESSION_BUS: &str = "Session Bus Policy";
const GROUP_SYSTEM_BUS: &str = "System Bus Policy";
const GROUP_A11Y_BUS: &str = "A11y Bus Policy";
const GROUP_ENVIRONMENT: &str = "Environment";
const GROUP_USB: &str = "USB Devices";
const POLICY_GROUP_PREFIX: &str = "Policy ";

const KEY_SHARED: &str = "shared";
const KEY_SOCKETS: &str = "sockets";
const KEY_DEVICES: &str = "devices";
const KEY_FEATURES: &str = "features";
const KEY_FILESYSTEMS: &str = "filesystems";
const KEY_PERSISTENT: &str = "persistent";
const KEY_UNSET_ENVIRONMENT: &str = "unset-environment";
const KEY_USB_ENUMERABLE: &str = "enumerable-devices";
const KEY_USB_HIDDEN: &str = "hidden-devices";

/// Insertion-ordered map of filesystem grants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemMap(Vec<(Filesystem, FilesystemMode)>);

impl FilesystemMap {
    pub fn get(&self, filesystem: &Filesystem) -> Option<FilesystemMode> {
        self.0.iter().find(|(f, _)| f == filesystem).map(|(_, m)| *m)
    }

    pub fn set(&mut self, filesystem: Filesystem, mode: FilesystemMode) {
        if let Some(entry) = self.0.iter_mut().find(|(f, _)| *f == filesystem) {
            entry.1 = mode;
        } else {
            self.0.push((filesystem, mode));
        }
    }

    pub fn contains(&self, filesystem: &Filesystem) -> bool {
        self.get(filesystem).is_some()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Filesystem, FilesystemMode)> {
        self.0.iter().map(|(f, m)| (f, *m))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The full permission set of an application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub shares: Shares,
    pub shares_valid: Shares,
    pub features: Features,
    pub features_valid: Features,
    pub sockets: PermissionMap,
    pub devices: PermissionMap,
    /// `None` means the variable is unset inside the sandbox
    pub env_vars: BTreeMap<String, Option<String>>,
    /// Paths under `$HOME` persisted across runs
    pub persistent: BTreeSet<String>,
    pub filesystems: FilesystemMap,
    pub session_bus: BTreeMap<String, BusPolicy>,
    pub system_bus: BTreeMap<String, BusPolicy>,
    pub a11y_bus: BTreeMap<String, BusPolicy>,
    /// `subsystem.key` to ordered value tokens; a leading `!` marks a
    /// removal carried through merges
    pub generic: BTreeMap<String, Vec<String>>,
    pub usb_allow: BTreeMap<String, UsbQuery>,
    pub usb_hide: BTreeMap<String, UsbQuery>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    // Token-level mutators, used by CLI option handling and load

    pub fn add_share(&mut self, token: &str) -> Result<(), Error> {
        let share = share_from_token(token)?;
        self.shares_valid |= share;
        self.shares |= share;
        Ok(())
    }

    pub fn remove_share(&mut self, token: &str) -> Result<(), Error> {
        let share = share_from_token(token)?;
        self.shares_valid |= share;
        self.shares &= !share;
        Ok(())
    }

    pub fn allow_feature(&mut self, token: &str) -> Result<(), Error> {
        let feature = feature_from_token(token)?;
        self.features_valid |= feature;
        self.features |= feature;
        Ok(())
    }

    pub fn disallow_feature(&mut self, token: &str) -> Result<(), Error> {
        let feature = feature_from_token(token)?;
        self.features_valid |= feature;
        self.features &= !feature;
        Ok(())
    }

    pub fn allow_socket(&mut self, name: &str) {
        self.sockets.entry(name).allow();
    }

    pub fn disallow_socket(&mut self, name: &str) {
        self.sockets.entry(name).disallow();
    }

    pub fn allow_socket_if(&mut self, name: &str, condition: &str) {
        self.sockets.entry(name).allow_if(condition);
    }

    pub fn allow_device(&mut self, name: &str) {
        self.devices.entry(name).allow();
    }

    pub fn disallow_device(&mut self, name: &str) {
        self.devices.entry(name).disallow();
    }

    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(name.into(), Some(value.into()));
    }

    pub fn unset_env(&mut self, name: impl Into<String>) {
        self.env_vars.insert(name.into(), None);
    }

    pub fn add_persistent(&mut self, path: impl Into<String>) {
        self.persistent.insert(path.into());
    }

    /// Add a filesystem grant from token text, handling `!` negation
    pub fn add_filesystem(&mut self, token: &str) -> Result<(), Error> {
        let (negated, text) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let (filesystem, mode) = Filesystem::parse(text, negated)?;
        self.filesystems.set(filesystem, mode);
        Ok(())
    }

    pub fn set_session_bus_policy(&mut self, name: &str, policy: BusPolicy) -> Result<(), Error> {
        bus::validate_name(name)?;
        self.session_bus.insert(name.to_owned(), policy);
        Ok(())
    }

    pub fn set_system_bus_policy(&mut self, name: &str, policy: BusPolicy) -> Result<(), Error> {
        bus::validate_name(name)?;
        self.system_bus.insert(name.to_owned(), policy);
        Ok(())
    }

    pub fn set_a11y_bus_policy(&mut self, name: &str, policy: BusPolicy) -> Result<(), Error> {
        bus::validate_name(name)?;
        self.a11y_bus.insert(name.to_owned(), policy);
        Ok(())
    }

    /// Apply one `(key, value)` generic policy: the new value replaces
    /// any earlier value with the same payload, where the payload is
    /// the value with a `!` removal prefix stripped
    pub fn apply_generic_policy(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if !key.contains('.') {
            return Err(Error::MalformedPolicyKey(key.to_owned()));
        }

        let payload = value.strip_prefix('!').unwrap_or(value);
        let values = self.generic.entry(key.to_owned()).or_default();
        values.retain(|existing| existing.strip_prefix('!').unwrap_or(existing) != payload);
        values.push(value.to_owned());

        Ok(())
    }

    pub fn add_usb_query(&mut self, text: &str) -> Result<(), Error> {
        let query = UsbQuery::parse(text)?;
        self.usb_allow.insert(query.to_string(), query);
        Ok(())
    }

    pub fn hide_usb_query(&mut self, text: &str) -> Result<(), Error> {
        let query = UsbQuery::parse(text)?;
        self.usb_hide.insert(query.to_string(), query);
        Ok(())
    }

    /// Layer `overlay` on top of this context
    pub fn merge(&mut self, overlay: &Context) {
        self.shares_valid |= overlay.shares_valid;
        self.shares = (self.shares & !overlay.shares_valid) | (overlay.shares & overlay.shares_valid);

        self.features_valid |= overlay.features_valid;
        self.features =
            (self.features & !overlay.features_valid) | (overlay.features & overlay.features_valid);

        self.sockets.merge(&overlay.sockets);
        self.devices.merge(&overlay.devices);

        for (name, value) in &overlay.env_vars {
            self.env_vars.insert(name.clone(), value.clone());
        }
        for path in &overlay.persistent {
            self.persistent.insert(path.clone());
        }

        // A host-reset in the overlay discards everything accumulated
        // below it, before any overlay entries are copied
        if overlay.filesystems.get(&Filesystem::HostReset) == Some(FilesystemMode::None) {
            self.filesystems.clear();
        }
        for (filesystem, mode) in overlay.filesystems.iter() {
            self.filesystems.set(filesystem.clone(), mode);
        }

        for (name, policy) in &overlay.session_bus {
            self.session_bus.insert(name.clone(), *policy);
        }
        for (name, policy) in &overlay.system_bus {
            self.system_bus.insert(name.clone(), *policy);
        }
        for (name, policy) in &overlay.a11y_bus {
            self.a11y_bus.insert(name.clone(), *policy);
        }

        for (key, values) in &overlay.generic {
            for value in values {
                // Keys were validated when the overlay was built
                let _ = self.apply_generic_policy(key, value);
            }
        }

        for (key, query) in &overlay.usb_allow {
            self.usb_allow.insert(key.clone(), query.clone());
        }
        for (key, query) in &overlay.usb_hide {
            self.usb_hide.insert(key.clone(), query.clone());
        }
    }

    /// True iff `new` grants anything `old` does not.
    ///
    /// Subpath filesystem grants are never subsumed by broader grants
    /// already present: even with `home` granted, a new `~/foo` entry
    /// can widen access through symlink traversal. Only an equal or
    /// stronger mode on the same entry, or on `host`, subsumes.
    pub fn adds_permissions(old: &Context, new: &Context) -> bool {
        if new.shares.intersects(!old.shares) {
            return true;
        }

        if (new.features & !old.features).intersects(!HARMLESS_FEATURES) {
            return true;
        }

        // Allowing x11 implicitly allows fallback-x11
        let mut old_sockets = old.sockets.clone();
        if let Some(x11) = old.sockets.get("x11").cloned() {
            let fallback = old_sockets.entry("fallback-x11");
            if x11.is_allowed() {
                fallback.allow();
            } else {
                for condition in x11.conditionals() {
                    fallback.allow_if(condition.clone());
                }
            }
        }

        let denied = Permission::default();
        for (name, permission) in new.sockets.iter() {
            if Permission::adds_permissions(old_sockets.get(name).unwrap_or(&denied), permission) {
                return true;
            }
        }
        for (name, permission) in new.devices.iter() {
            if Permission::adds_permissions(old.devices.get(name).unwrap_or(&denied), permission) {
                return true;
            }
        }

        for (new_bus, old_bus) in [
            (&new.session_bus, &old.session_bus),
            (&new.system_bus, &old.system_bus),
            (&new.a11y_bus, &old.a11y_bus),
        ] {
            for (name, policy) in new_bus {
                if *policy > old_bus.get(name).copied().unwrap_or_default() {
                    return true;
                }
            }
        }

        for (key, values) in &new.generic {
            let old_values = old.generic.get(key);
            for value in values {
                if value.starts_with('!') {
                    continue;
                }
                if !old_values.is_some_and(|old_values| old_values.contains(value)) {
                    return true;
                }
            }
        }

        // host's mode is a ceiling for every other entry
        let ceiling = old
            .filesystems
            .get(&Filesystem::Host)
            .unwrap_or(FilesystemMode::None);
        for (filesystem, mode) in new.filesystems.iter() {
            if matches!(filesystem, Filesystem::HostReset) {
                continue;
            }
            let old_mode = old.filesystems.get(filesystem).unwrap_or(FilesystemMode::None);
            if mode > old_mode && mode > ceiling {
                return true;
            }
        }

        if new.usb_allow.keys().any(|key| !old.usb_allow.contains_key(key)) {
            return true;
        }
        if old.usb_hide.keys().any(|key| !new.usb_hide.contains_key(key)) {
            return true;
        }

        false
    }

    /// Serialize into key-file metadata.
    ///
    /// Flatten mode is for contexts that will not be layered on top of
    /// another: only positive grants are emitted and negation markers
    /// are dropped.
    pub fn save(&self, flatten: bool) -> keyfile::KeyFile {
        let mut out = keyfile::KeyFile::new();
        // Group order is fixed even when some turn out empty
        out.ensure_group(GROUP_CONTEXT);

        let shared = bitmask_tokens(
            SHARE_TOKENS.iter().map(|(b, t)| (self.shares.contains(*b), self.shares_valid.contains(*b), *t)),
            flatten,
        );
        if !shared.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_SHARED, &shared);
        }

        let sockets = self.sockets.serialize(flatten);
        if !sockets.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_SOCKETS, &sockets);
        }

        let devices = self.devices.serialize(flatten);
        if !devices.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_DEVICES, &devices);
        }

        let features = bitmask_tokens(
            FEATURE_TOKENS
                .iter()
                .map(|(b, t)| (self.features.contains(*b), self.features_valid.contains(*b), *t)),
            flatten,
        );
        if !features.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_FEATURES, &features);
        }

        let filesystems = self.serialize_filesystems(flatten);
        if !filesystems.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_FILESYSTEMS, &filesystems);
        }

        if !self.persistent.is_empty() {
            let persistent = self.persistent.iter().cloned().collect::<Vec<_>>();
            out.set_list(GROUP_CONTEXT, KEY_PERSISTENT, &persistent);
        }

        let unset = self
            .env_vars
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        if !unset.is_empty() {
            out.set_list(GROUP_CONTEXT, KEY_UNSET_ENVIRONMENT, &unset);
        }

        for (group, policies) in [
            (GROUP_SESSION_BUS, &self.session_bus),
            (GROUP_SYSTEM_BUS, &self.system_bus),
            (GROUP_A11Y_BUS, &self.a11y_bus),
        ] {
            for (name, policy) in policies {
                if flatten && *policy == BusPolicy::None {
                    continue;
                }
                out.set(group, name.clone(), policy.to_string());
            }
        }

        if !self.env_vars.is_empty() {
            for (name, value) in &self.env_vars {
                // Unset variables keep an empty value for older
                // readers; newer ones prefer unset-environment
                out.set(GROUP_ENVIRONMENT, name.clone(), value.clone().unwrap_or_default());
            }
        }

        for (key, values) in &self.generic {
            let Some((subsystem, rule)) = key.split_once('.') else {
                continue;
            };
            let values = if flatten {
                values.iter().filter(|v| !v.starts_with('!')).cloned().collect::<Vec<_>>()
            } else {
                values.clone()
            };
            if !values.is_empty() {
                out.set_list(&format!("{POLICY_GROUP_PREFIX}{subsystem}"), rule, &values);
            }
        }

        if !self.usb_allow.is_empty() {
            let queries = self.usb_allow.keys().cloned().collect::<Vec<_>>();
            out.set_list(GROUP_USB, KEY_USB_ENUMERABLE, &queries);
        }
        if !self.usb_hide.is_empty() {
            let queries = self.usb_hide.keys().cloned().collect::<Vec<_>>();
            out.set_list(GROUP_USB, KEY_USB_HIDDEN, &queries);
        }

        out
    }

    fn serialize_filesystems(&self, flatten: bool) -> Vec<String> {
        let mut tokens = vec![];

        // The reset marker leads the list so lower layers are cleared
        // before any of the entries that follow it are applied
        if !flatten && self.filesystems.contains(&Filesystem::HostReset) {
            tokens.push(Filesystem::HostReset.serialize(FilesystemMode::None));
        }

        for (filesystem, mode) in self.filesystems.iter() {
            if matches!(filesystem, Filesystem::HostReset) {
                continue;
            }
            if flatten && mode == FilesystemMode::None {
                continue;
            }
            tokens.push(filesystem.serialize(mode));
        }

        tokens
    }

    /// Load a context from key-file metadata
    pub fn load(keyfile: &keyfile::KeyFile) -> Result<Self, Error> {
        let mut context = Context::new();

        if let Some(tokens) = keyfile.get_list(GROUP_CONTEXT, KEY_SHARED) {
            apply_bitmask_tokens(&tokens, "share", share_from_token, &mut context.shares, &mut context.shares_valid);
        }
        if let Some(tokens) = keyfile.get_list(GROUP_CONTEXT, KEY_FEATURES) {
            apply_bitmask_tokens(
                &tokens,
                "feature",
                feature_from_token,
                &mut context.features,
                &mut context.features_valid,
            );
        }

        if let Some(tokens) = keyfile.get_list(GROUP_CONTEXT, KEY_SOCKETS) {
            context.sockets = PermissionMap::deserialize(&tokens);
        }
        if let Some(tokens) = keyfile.get_list(GROUP_CONTEXT, KEY_DEVICES) {
            context.devices = PermissionMap::deserialize(&tokens);
        }

        if let Some(tokens) = keyfile.get_list(GROUP_CONTEXT, KEY_FILESYSTEMS) {
            for token in &tokens {
                context.add_filesystem(token)?;
            }
        }

        if let Some(paths) = keyfile.get_list(GROUP_CONTEXT, KEY_PERSISTENT) {
            context.persistent.extend(paths);
        }

        for (group, target) in [
            (GROUP_SESSION_BUS, &mut context.session_bus),
            (GROUP_SYSTEM_BUS, &mut context.system_bus),
            (GROUP_A11Y_BUS, &mut context.a11y_bus),
        ] {
            let Some(group) = keyfile.group(group) else {
                continue;
            };
            for (name, value) in group.entries() {
                if bus::validate_name(name).is_err() {
                    warn!("invalid bus name {name}; skipping");
                    continue;
                }
                let Ok(policy) = value.parse::<BusPolicy>() else {
                    warn!("invalid bus policy {value} for {name}; skipping");
                    continue;
                };
                target.insert(name.to_owned(), policy);
            }
        }

        if let Some(group) = keyfile.group(GROUP_ENVIRONMENT) {
            for (name, value) in group.entries() {
                context.env_vars.insert(name.to_owned(), Some(value.to_owned()));
            }
        }
        // Newer writers record unset variables explicitly; this takes
        // precedence over the empty-value compatibility form
        if let Some(names) = keyfile.get_list(GROUP_CONTEXT, KEY_UNSET_ENVIRONMENT) {
            for name in names {
                context.env_vars.insert(name, None);
            }
        }

        for group in keyfile.groups() {
            let Some(subsystem) = group.name().strip_prefix(POLICY_GROUP_PREFIX) else {
                continue;
            };
            for key in group.keys().map(ToOwned::to_owned).collect::<Vec<_>>() {
                let values = group.get_list(&key).unwrap_or_default();
                context.generic.insert(format!("{subsystem}.{key}"), values);
            }
        }

        if let Some(queries) = keyfile.get_list(GROUP_USB, KEY_USB_ENUMERABLE) {
            for text in &queries {
                if let Err(error) = context.add_usb_query(text) {
                    warn!("invalid usb query {text}: {error}; skipping");
                }
            }
        }
        if let Some(queries) = keyfile.get_list(GROUP_USB, KEY_USB_HIDDEN) {
            for text in &queries {
                if let Err(error) = context.hide_usb_query(text) {
                    warn!("invalid usb query {text}: {error}; skipping");
                }
            }
        }

        Ok(context)
    }
}

fn share_from_token(token: &str) -> Result<Shares, Error> {
    SHARE_TOKENS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(b, _)| *b)
        .ok_or_else(|| Error::UnknownShare(token.to_owned()))
}

fn feature_from_token(token: &str) -> Result<Features, Error> {
    FEATURE_TOKENS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(b, _)| *b)
        .ok_or_else(|| Error::UnknownFeature(token.to_owned()))
}

fn bitmask_tokens(bits: impl Iterator<Item = (bool, bool, &'static str)>, flatten: bool) -> Vec<String> {
    let mut tokens = vec![];
    for (set, valid, token) in bits {
        if set {
            tokens.push(token.to_owned());
        } else if valid && !flatten {
            tokens.push(format!("!{token}"));
        }
    }
    tokens
}

fn apply_bitmask_tokens<B: Copy + std::ops::BitOrAssign + std::ops::BitAndAssign + std::ops::Not<Output = B>>(
    tokens: &[String],
    what: &str,
    lookup: impl Fn(&str) -> Result<B, Error>,
    bits: &mut B,
    valid: &mut B,
) {
    for token in tokens {
        let (negated, name) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token.as_str()),
        };
        match lookup(name) {
            Ok(bit) => {
                *valid |= bit;
                if negated {
                    *bits &= !bit;
                } else {
                    *bits |= bit;
                }
            }
            Err(_) => warn!("unknown {what} token {name}; skipping"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown share token: {0}")]
    UnknownShare(String),

    #[error("unknown feature token: {0}")]
    UnknownFeature(String),

    #[error("policy key must be of the form subsystem.key: {0}")]
    MalformedPolicyKey(String),

    #[error("invalid filesystem: {0}")]
    Filesystem(#[from] filesystem::Error),

    #[error("invalid bus name: {0}")]
    Bus(#[from] bus::Error),

    #[error("invalid usb query: {0}")]
    Usb(#[from] usb::Error),

    #[error("malformed metadata: {0}")]
    KeyFile(#[from] keyfile::Error),
}
