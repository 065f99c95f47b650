// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The transaction engine: turns install/update/bundle requests into
//! an ordered plan of operations over the installation, recursing into
//! runtime dependencies and related refs, then executes the plan with
//! per-operation failure policies.

use std::collections::HashMap;
use std::path::PathBuf;

use bitflags::bitflags;
use dialoguer::{theme::ColorfulTheme, Select};
use log::{error, info, warn};
use strum::Display;
use thiserror::Error;

use crate::cancel::Cancel;
use crate::installation::{self, Bundle, InstallOptions, Installation};
use crate::metadata::{Metadata, Version, HOST_VERSION};
use crate::progress::Progress;
use crate::reference::{self, Ref};
use crate::remote::{RemoteState, StateCache};
use crate::store::CommitId;

bitflags! {
    /// Behavior switches for a [`Transaction`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Never prompt; ambiguous choices pick the first candidate
        const NO_INTERACTION = 1 << 0;
        /// Skip pulling; operate on already fetched content
        const NO_PULL = 1 << 1;
        /// Pull only; skip deploying
        const NO_DEPLOY = 1 << 2;
        const NO_STATIC_DELTAS = 1 << 3;
        /// Recurse into runtime dependencies
        const ADD_DEPS = 1 << 4;
        /// Pull in download-flagged related refs
        const ADD_RELATED = 1 << 5;
        const REINSTALL = 1 << 6;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::ADD_DEPS | Flags::ADD_RELATED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Install,
    Update,
    /// Resolved to install or update at execution time
    #[strum(serialize = "install or update")]
    InstallOrUpdate,
    #[strum(serialize = "install bundle")]
    Bundle,
    Uninstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// One step of the plan
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    /// Present before execution; resolved from the installation for
    /// pure updates
    pub remote: Option<String>,
    pub reference: Ref,
    /// `None` keeps prior subpaths, empty means everything
    pub subpaths: Option<Vec<String>>,
    /// Explicit target commit, otherwise the remote's tip
    pub commit: Option<CommitId>,
    pub bundle: Option<PathBuf>,
    /// Failure does not abort sibling operations
    pub non_fatal: bool,
    /// Index into the plan of the operation that introduced this one
    pub source_op: Option<usize>,
    pub state: OperationState,
}

/// A transaction over one installation. Operations are appended by the
/// `add_*` family, then executed in the order they were introduced.
pub struct Transaction<'a> {
    installation: &'a mut Installation,
    ops: Vec<Operation>,
    ops_by_ref: HashMap<Ref, usize>,
    remote_states: StateCache,
    added_origin_remotes: Vec<String>,
    flags: Flags,
}

impl<'a> Transaction<'a> {
    pub fn new(installation: &'a mut Installation, flags: Flags) -> Self {
        Self {
            installation,
            ops: vec![],
            ops_by_ref: HashMap::new(),
            remote_states: StateCache::default(),
            added_origin_remotes: vec![],
            flags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains_ref(&self, reference: &Ref) -> bool {
        self.ops_by_ref.contains_key(reference)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Queue an install of `reference` from `remote`
    pub fn add_install(
        &mut self,
        remote: &str,
        reference: &str,
        subpaths: Option<Vec<String>>,
    ) -> Result<(), Error> {
        let reference = Ref::parse(reference)?;
        self.add_ref(
            Some(remote.to_owned()),
            reference,
            subpaths,
            None,
            OperationKind::Install,
            None,
        )
    }

    /// Queue an update of an installed `reference`, optionally pinned
    /// to an explicit commit
    pub fn add_update(
        &mut self,
        reference: &str,
        subpaths: Option<Vec<String>>,
        commit: Option<CommitId>,
    ) -> Result<(), Error> {
        let reference = Ref::parse(reference)?;
        self.add_ref(None, reference, subpaths, commit, OperationKind::Update, None)
    }

    /// Queue installation of a local bundle file
    pub fn add_install_bundle(&mut self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let path = path.into();
        let bundle = Bundle::load(&path)?;

        let url = bundle
            .origin_url
            .clone()
            .unwrap_or_else(|| format!("file://{}", path.display()));
        let origin = self.installation.add_origin_remote(bundle.reference.id(), &url)?;
        self.added_origin_remotes.push(origin.clone());

        if let Some(text) = &bundle.metadata {
            self.check_version(&Metadata::parse(text)?, &bundle.reference)?;
        }

        self.add_op(
            Some(origin),
            bundle.reference.clone(),
            None,
            None,
            Some(path),
            OperationKind::Bundle,
        );
        Ok(())
    }

    /// Queue an install from a single-ref remote (an OCI style image
    /// location); the remote is registered ephemerally and `tag`
    /// selects the branch
    pub fn add_install_oci(&mut self, uri: &str, tag: &str) -> Result<(), Error> {
        let name = uri
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .collect::<String>();
        let origin = self.installation.add_origin_remote(&name, uri)?;
        self.added_origin_remotes.push(origin.clone());

        self.ensure_remote_state(&origin)?;
        let state = self.cached_state(&origin)?;
        let Some(reference) = state
            .refs()
            .into_iter()
            .find(|reference| reference.branch() == tag)
        else {
            return Err(Error::TagNotFound {
                uri: uri.to_owned(),
                tag: tag.to_owned(),
            });
        };

        self.add_ref(
            Some(origin),
            reference,
            None,
            None,
            OperationKind::InstallOrUpdate,
            None,
        )
    }

    /// Queue removal of an installed ref. Uninstalls never recurse.
    pub fn add_uninstall(&mut self, reference: &str) -> Result<(), Error> {
        let reference = Ref::parse(reference)?;
        if self.installation.deployed(&reference).is_none() {
            return Err(Error::NotInstalled {
                pref: reference.pref(),
            });
        }
        self.add_op(None, reference, None, None, None, OperationKind::Uninstall);
        Ok(())
    }

    /// Refresh cached remote states: every configured remote, or just
    /// the ones this transaction has touched
    pub fn update_metadata(&mut self, all_remotes: bool, cancel: &Cancel) -> Result<(), Error> {
        cancel.check()?;

        let names: Vec<String> = if all_remotes {
            self.installation.remote_names().map(ToOwned::to_owned).collect()
        } else {
            self.remote_states.names().map(ToOwned::to_owned).collect()
        };

        for name in names {
            cancel.check()?;
            match self.installation.remote_state(&name) {
                Ok(state) => {
                    self.remote_states.insert(state);
                }
                Err(error) => warn!("failed to refresh remote {name}: {error}"),
            }
        }
        Ok(())
    }

    // Plan building

    /// The gate through which all requests flow
    fn add_ref(
        &mut self,
        remote: Option<String>,
        reference: Ref,
        subpaths: Option<Vec<String>>,
        commit: Option<CommitId>,
        kind: OperationKind,
        external_metadata: Option<String>,
    ) -> Result<(), Error> {
        // file:// installs go through an ephemeral origin remote named
        // after the ref id
        let remote = match remote {
            Some(url) if url.starts_with("file://") => {
                let name = self.installation.add_origin_remote(reference.id(), &url)?;
                self.added_origin_remotes.push(name.clone());
                Some(name)
            }
            other => other,
        };

        let remote = match kind {
            OperationKind::Update => {
                let Some(origin) = self.installation.origin_of(&reference).map(ToOwned::to_owned) else {
                    return Err(Error::NotInstalled {
                        pref: reference.pref(),
                    });
                };
                if self
                    .installation
                    .remote_config(&origin)
                    .is_some_and(|config| config.disabled)
                {
                    warn!(
                        "remote {origin} is disabled; not updating {}",
                        reference.pref()
                    );
                    return Ok(());
                }
                origin
            }
            OperationKind::Install => {
                let remote = remote.ok_or(Error::RemoteRequired)?;
                if let Some(deploy) = self.installation.deployed(&reference) {
                    if deploy.origin == remote {
                        if !self.flags.contains(Flags::REINSTALL) {
                            println!(
                                "{} already installed from {remote}, skipping",
                                reference.pref()
                            );
                            return Ok(());
                        }
                    } else {
                        return Err(Error::AlreadyInstalledFromOtherRemote {
                            pref: reference.pref(),
                            origin: deploy.origin.clone(),
                        });
                    }
                }
                remote
            }
            _ => remote.ok_or(Error::RemoteRequired)?,
        };

        self.ensure_remote_state(&remote)?;

        // Metadata lookup is best-effort
        let metadata_text = external_metadata.or_else(|| {
            let state = self.remote_states.get(&remote)?;
            let found = state.lookup_metadata(&reference).map(ToOwned::to_owned);
            if found.is_none() {
                warn!("no metadata for {} in remote {remote}", reference.pref());
            }
            found
        });

        let mut runtime_op = None;
        if let Some(text) = &metadata_text {
            match Metadata::parse(text) {
                Ok(metadata) => {
                    self.check_version(&metadata, &reference)?;
                    if self.flags.contains(Flags::ADD_DEPS) && reference.is_app() {
                        let runtime = metadata.runtime(reference.kind())?;
                        runtime_op = self.add_deps(runtime, &remote)?;
                    }
                }
                Err(error) => warn!("malformed metadata for {}: {error}", reference.pref()),
            }
        }

        let index = self.add_op(Some(remote.clone()), reference.clone(), subpaths, commit, None, kind);
        if self.ops[index].source_op.is_none() {
            self.ops[index].source_op = runtime_op;
        }

        self.add_related(&remote, &reference, index);

        Ok(())
    }

    /// Recurse into the runtime an application declares. Returns the
    /// plan index of the runtime's operation, if one was needed.
    fn add_deps(&mut self, runtime: Option<Ref>, remote: &str) -> Result<Option<usize>, Error> {
        let Some(runtime_ref) = runtime else {
            return Ok(None);
        };

        if let Some(&index) = self.ops_by_ref.get(&runtime_ref) {
            return Ok(Some(index));
        }

        // Installed here: keep it fresh, but never fail the app over it
        if let Some(origin) = self.installation.origin_of(&runtime_ref).map(ToOwned::to_owned) {
            let index = self.add_op(
                Some(origin.clone()),
                runtime_ref.clone(),
                None,
                None,
                None,
                OperationKind::Update,
            );
            self.ops[index].non_fatal = true;
            self.add_related(&origin, &runtime_ref, index);
            return Ok(Some(index));
        }

        // Visible in another installation: nothing to do
        if self.installation.installed_elsewhere(&runtime_ref).is_some() {
            return Ok(None);
        }

        // Discover a providing remote, preferring the app's own
        let mut candidates = vec![];
        let mut names = vec![remote.to_owned()];
        names.extend(
            self.installation
                .remote_names()
                .filter(|name| {
                    *name != remote
                        && !self
                            .installation
                            .remote_config(name)
                            .is_some_and(|config| config.disabled)
                })
                .map(ToOwned::to_owned),
        );
        for name in names {
            if !self.remote_states.contains(&name) && self.ensure_remote_state(&name).is_err() {
                warn!("remote {name} unavailable while resolving runtime {}", runtime_ref.pref());
                continue;
            }
            if self.cached_state(&name)?.contains(&runtime_ref) {
                candidates.push(name);
            }
        }

        let chosen = match candidates.len() {
            0 => {
                return Err(Error::RuntimeUnavailable {
                    id: runtime_ref.id().to_owned(),
                })
            }
            1 => candidates.swap_remove(0),
            _ if self.flags.contains(Flags::NO_INTERACTION) => {
                info!(
                    "multiple remotes provide {}; using {}",
                    runtime_ref.pref(),
                    candidates[0]
                );
                candidates.swap_remove(0)
            }
            _ => {
                let index = prompt_remote_choice(&runtime_ref, &candidates)?;
                candidates.swap_remove(index)
            }
        };

        let index = self.add_op(
            Some(chosen.clone()),
            runtime_ref.clone(),
            None,
            None,
            None,
            OperationKind::InstallOrUpdate,
        );
        self.add_related(&chosen, &runtime_ref, index);
        Ok(Some(index))
    }

    /// Queue download-flagged related refs as non-fatal operations.
    /// Lookup failures are warnings, never errors.
    fn add_related(&mut self, remote: &str, reference: &Ref, source_op: usize) {
        if !self.flags.contains(Flags::ADD_RELATED) {
            return;
        }
        let Some(state) = self.remote_states.get(remote) else {
            warn!("no state for remote {remote}; skipping related refs of {}", reference.pref());
            return;
        };

        let related = state.related_refs(reference).to_vec();
        for related_ref in related {
            if !related_ref.download {
                continue;
            }
            let index = self.add_op(
                Some(remote.to_owned()),
                related_ref.reference.clone(),
                Some(related_ref.subpaths.clone()),
                None,
                None,
                OperationKind::InstallOrUpdate,
            );
            self.ops[index].non_fatal = true;
            if self.ops[index].source_op.is_none() {
                self.ops[index].source_op = Some(source_op);
            }
        }
    }

    /// Uniqueness gate: one operation per ref. A second add merges
    /// subpaths and may upgrade install-or-update to install, but
    /// never crosses install and update.
    fn add_op(
        &mut self,
        remote: Option<String>,
        reference: Ref,
        subpaths: Option<Vec<String>>,
        commit: Option<CommitId>,
        bundle: Option<PathBuf>,
        kind: OperationKind,
    ) -> usize {
        if let Some(&index) = self.ops_by_ref.get(&reference) {
            let op = &mut self.ops[index];
            merge_subpaths(&mut op.subpaths, subpaths);
            if op.kind == OperationKind::InstallOrUpdate && kind == OperationKind::Install {
                op.kind = OperationKind::Install;
                if op.remote.is_none() {
                    op.remote = remote;
                }
            }
            return index;
        }

        let index = self.ops.len();
        self.ops.push(Operation {
            kind,
            remote,
            reference: reference.clone(),
            subpaths,
            commit,
            bundle,
            non_fatal: false,
            source_op: None,
            state: OperationState::Pending,
        });
        self.ops_by_ref.insert(reference, index);
        index
    }

    // Execution

    /// Execute the plan in the order operations were introduced:
    /// dependencies were inserted before their dependents, so they run
    /// first. Returns an error when any fatal operation failed.
    pub fn run(
        &mut self,
        stop_on_first_error: bool,
        progress: &mut dyn Progress,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        progress.start(self.ops.len());
        let mut failed = false;

        for index in 0..self.ops.len() {
            self.resolve_install_or_update(index);

            if self.should_skip(index) {
                let op = &mut self.ops[index];
                op.state = OperationState::Skipped;
                println!(
                    "Skipping {} of {}: a required operation did not complete",
                    op.kind,
                    op.reference.pref()
                );
                continue;
            }

            progress.op_start(&self.ops[index].reference.pref());
            match self.execute_op(index, progress, cancel) {
                Ok(()) => {
                    self.ops[index].state = OperationState::Succeeded;
                    progress.op_end(true);
                    self.print_eol_notices(index);
                }
                Err(error) => {
                    self.ops[index].state = OperationState::Failed;
                    progress.op_end(false);

                    let op = &self.ops[index];
                    if op.non_fatal {
                        warn!("{} of {} failed: {error}", op.kind, op.reference.pref());
                    } else if stop_on_first_error {
                        self.cleanup_origin_remotes();
                        return Err(error);
                    } else {
                        error!("{} of {} failed: {error}", op.kind, op.reference.pref());
                        failed = true;
                    }
                }
            }
        }

        if let Err(error) = self.installation.prune_store(cancel) {
            warn!("prune after transaction failed: {error}");
        }
        self.cleanup_origin_remotes();

        if failed {
            Err(Error::SomeOperationsFailed)
        } else {
            Ok(())
        }
    }

    /// Resolve install-or-update against the installation, adopting
    /// the installed origin for updates
    fn resolve_install_or_update(&mut self, index: usize) {
        if self.ops[index].kind != OperationKind::InstallOrUpdate {
            return;
        }
        let reference = self.ops[index].reference.clone();
        match self.installation.deployed(&reference) {
            Some(deploy) => {
                let origin = deploy.origin.clone();
                let op = &mut self.ops[index];
                op.kind = OperationKind::Update;
                op.remote = Some(origin);
            }
            None => self.ops[index].kind = OperationKind::Install,
        }
    }

    /// An operation is skipped when the operation that introduced it
    /// failed or was skipped - except that an application install
    /// still proceeds when its runtime merely failed to update: the
    /// installed runtime can still run the app.
    fn should_skip(&self, index: usize) -> bool {
        let op = &self.ops[index];
        let Some(source) = op.source_op else {
            return false;
        };
        let source_op = &self.ops[source];

        if !matches!(source_op.state, OperationState::Failed | OperationState::Skipped) {
            return false;
        }

        let update_failure_only =
            source_op.state == OperationState::Failed && source_op.kind == OperationKind::Update;
        let proceed_anyway =
            op.kind == OperationKind::Install && op.reference.is_app() && update_failure_only;

        !proceed_anyway
    }

    fn execute_op(
        &mut self,
        index: usize,
        progress: &mut dyn Progress,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        let (kind, reference, remote, subpaths, commit, bundle) = {
            let op = &self.ops[index];
            (
                op.kind,
                op.reference.clone(),
                op.remote.clone(),
                op.subpaths.clone(),
                op.commit.clone(),
                op.bundle.clone(),
            )
        };

        let options = InstallOptions {
            no_pull: self.flags.contains(Flags::NO_PULL),
            no_deploy: self.flags.contains(Flags::NO_DEPLOY),
            no_static_deltas: self.flags.contains(Flags::NO_STATIC_DELTAS),
            reinstall: self.flags.contains(Flags::REINSTALL),
            subpaths,
        };

        match kind {
            OperationKind::Install => {
                let remote = remote.ok_or(Error::RemoteRequired)?;
                self.ensure_remote_state(&remote)?;
                let state = self.cached_state(&remote)?;
                self.installation.install(
                    &state,
                    &reference,
                    &options,
                    &mut |bytes, total| progress.op_progress(bytes, total),
                    cancel,
                )?;
            }
            OperationKind::Update => {
                let remote = remote.ok_or(Error::RemoteRequired)?;
                self.ensure_remote_state(&remote)?;
                let state = self.cached_state(&remote)?;

                match self.installation.check_for_update(&state, &reference, commit.as_ref())? {
                    None => {
                        println!("No updates for {}", reference.pref());
                    }
                    Some(target) => {
                        let result = self.installation.update(
                            &state,
                            &reference,
                            &target,
                            &options,
                            &mut |bytes, total| progress.op_progress(bytes, total),
                            cancel,
                        );
                        match result {
                            Ok(()) => println!("Updated {} to {}", reference.pref(), target.short()),
                            // Raced to the same commit; not an error
                            Err(installation::Error::AlreadyInstalled { .. }) => {}
                            Err(error) => return Err(error.into()),
                        }
                    }
                }
            }
            OperationKind::Bundle => {
                let remote = remote.ok_or(Error::RemoteRequired)?;
                let path = bundle.ok_or(Error::MissingBundle)?;
                let bundle = Bundle::load(&path)?;
                self.installation.install_bundle(&bundle, &remote, cancel)?;
            }
            OperationKind::Uninstall => {
                self.installation.uninstall(&reference)?;
            }
            // Resolved before dispatch
            OperationKind::InstallOrUpdate => {
                self.resolve_install_or_update(index);
                return self.execute_op(index, progress, cancel);
            }
        }
        Ok(())
    }

    fn print_eol_notices(&self, index: usize) {
        let op = &self.ops[index];
        let Some(deploy) = self.installation.deployed(&op.reference) else {
            return;
        };
        if let Some(reason) = &deploy.eol {
            println!("Warning: {} is end-of-life: {reason}", op.reference.pref());
        }
        if let Some(rebase) = &deploy.eol_rebase {
            println!(
                "Warning: {} is end-of-life, replaced by {rebase}",
                op.reference.pref()
            );
        }
    }

    fn cleanup_origin_remotes(&mut self) {
        for name in std::mem::take(&mut self.added_origin_remotes) {
            if let Err(error) = self.installation.remove_origin_remote(&name) {
                warn!("failed to remove origin remote {name}: {error}");
            }
        }
    }

    fn ensure_remote_state(&mut self, name: &str) -> Result<(), Error> {
        if self.remote_states.contains(name) {
            return Ok(());
        }
        let state =
            self.installation
                .remote_state(name)
                .map_err(|error| Error::RemoteStateUnavailable {
                    remote: name.to_owned(),
                    source: Box::new(error),
                })?;
        self.remote_states.insert(state);
        Ok(())
    }

    fn cached_state(&self, name: &str) -> Result<RemoteState, Error> {
        self.remote_states
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RemoteStateUnavailable {
                remote: name.to_owned(),
                source: Box::new(installation::Error::UnknownRemote(name.to_owned())),
            })
    }

    fn check_version(&self, metadata: &Metadata, reference: &Ref) -> Result<(), Error> {
        if let Some(required) = metadata.required_version(reference.kind())? {
            if HOST_VERSION < required {
                return Err(Error::VersionTooOld {
                    pref: reference.pref(),
                    required,
                });
            }
        }
        Ok(())
    }
}

/// Merge subpath requests for the same ref: an unspecified request
/// keeps what is there, an empty request widens to everything, two
/// explicit requests union.
fn merge_subpaths(existing: &mut Option<Vec<String>>, incoming: Option<Vec<String>>) {
    match (existing.as_mut(), incoming) {
        (_, None) => {}
        (None, incoming) => *existing = incoming,
        (Some(current), Some(incoming)) => {
            if current.is_empty() || incoming.is_empty() {
                current.clear();
            } else {
                for path in incoming {
                    if !current.contains(&path) {
                        current.push(path);
                    }
                }
            }
        }
    }
}

fn prompt_remote_choice(reference: &Ref, candidates: &[String]) -> Result<usize, Error> {
    let mut items = vec!["abort".to_owned()];
    items.extend(candidates.iter().cloned());

    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Multiple remotes provide {}. Which? 0=abort",
            reference.pref()
        ))
        .items(&items)
        .default(1)
        .interact()?;

    if choice == 0 {
        return Err(Error::Aborted);
    }
    Ok(choice - 1)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{pref} is not installed")]
    NotInstalled { pref: String },

    #[error("{pref} is already installed from remote {origin}")]
    AlreadyInstalledFromOtherRemote { pref: String, origin: String },

    #[error("{pref} requires version {required} or newer")]
    VersionTooOld { pref: String, required: Version },

    #[error("runtime {id} is neither installed nor available in any remote")]
    RuntimeUnavailable { id: String },

    #[error("cannot fetch state of remote {remote}: {source}")]
    RemoteStateUnavailable {
        remote: String,
        source: Box<installation::Error>,
    },

    #[error("no ref with tag {tag} in {uri}")]
    TagNotFound { uri: String, tag: String },

    #[error("a remote is required for installation")]
    RemoteRequired,

    #[error("bundle operation lost its file")]
    MissingBundle,

    #[error("one or more operations failed")]
    SomeOperationsFailed,

    #[error("aborted")]
    Aborted,

    #[error("cancelled")]
    Cancelled(#[from] crate::cancel::Cancelled),

    #[error("invalid ref: {0}")]
    Ref(#[from] reference::Error),

    #[error("installation: {0}")]
    Installation(#[from] installation::Error),

    #[error("metadata: {0}")]
    Metadata(#[from] crate::metadata::Error),

    #[error("prompt: {0}")]
    Dialog(#[from] dialoguer::Error),
}
