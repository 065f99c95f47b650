// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The installed-application tree rooted at a directory.
//!
//! Deploys live under `<root>/.capsule/deploy/<ref>/files` with their
//! bookkeeping collected in a single JSON document; the object store
//! sits at `<root>/.capsule/store`; remote definitions at
//! `<root>/.capsule/remotes.json`.

use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::{trace, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::unistd::{access, AccessFlags, Uid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::Cancel;
use crate::metadata::Metadata;
use crate::reference::Ref;
use crate::remote::{self, RemoteState};
use crate::store::{self, CheckoutOptions, CommitId, PullOptions, Store};

const CAPSULE_DIR: &str = ".capsule";
const REMOTES_FILE: &str = "remotes.json";
const DEPLOYS_FILE: &str = "deploys.json";

/// Exclusive hold on an installation's transaction lock. Store
/// mutation and pruning happen under one of these; dropping it
/// releases the flock.
#[derive(Debug)]
pub struct Lock {
    #[allow(unused)]
    file: fs::File,
}

/// Bookkeeping for one deployed ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub origin: String,
    pub commit: CommitId,
    /// Deployed subset of the tree; empty means everything
    #[serde(default)]
    pub subpaths: Vec<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub eol: Option<String>,
    #[serde(default)]
    pub eol_rebase: Option<String>,
}

/// Options driving [`Installation::install`] and
/// [`Installation::update`]
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub no_pull: bool,
    pub no_deploy: bool,
    pub no_static_deltas: bool,
    pub reinstall: bool,
    /// `None` keeps any previously recorded subpaths
    pub subpaths: Option<Vec<String>>,
}

/// A bundle: a single file carrying one ref and its tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub reference: Ref,
    #[serde(default)]
    pub origin_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    /// Relative path to hex encoded contents
    pub files: BTreeMap<String, String>,
}

impl Bundle {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|error| Error::MalformedBundle {
            path: path.to_owned(),
            error,
        })
    }
}

pub struct Installation {
    pub root: PathBuf,
    /// Whether this process may mutate the installation
    pub writable: bool,
    store: Box<dyn Store>,
    remotes: remote::Map,
    deploys: BTreeMap<String, Deploy>,
    /// Roots of other system installations consulted by
    /// [`Installation::installed_elsewhere`]
    pub system_roots: Vec<PathBuf>,
}

impl Installation {
    /// Open the installation at `root`, backed by the disk store
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        let store = store::disk::Disk::open(root.join(CAPSULE_DIR).join("store"))?;
        Self::with_store(root, Box::new(store))
    }

    /// Open with an injected store implementation
    pub fn with_store(root: impl Into<PathBuf>, store: Box<dyn Store>) -> Result<Self, Error> {
        let root: PathBuf = root.into();

        // Root can always write; everyone else needs the root
        // directory to be writable (or still absent)
        let writable = Uid::effective().is_root()
            || !root.exists()
            || access(&root, AccessFlags::W_OK).is_ok();

        trace!("Installation at {root:?}, writable: {writable}");

        if writable {
            ensure_dirs_exist(&root);
        }

        let remotes = load_json(&root.join(CAPSULE_DIR).join(REMOTES_FILE))?.unwrap_or_default();
        let deploys = load_json(&root.join(CAPSULE_DIR).join(DEPLOYS_FILE))?.unwrap_or_default();

        Ok(Self {
            root,
            writable,
            store,
            remotes,
            deploys,
            system_roots: vec![],
        })
    }

    pub fn read_only(&self) -> bool {
        !self.writable
    }

    fn capsule_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(CAPSULE_DIR).join(path)
    }

    pub fn deploy_dir(&self, reference: &Ref) -> PathBuf {
        self.capsule_path("deploy").join(reference.to_string())
    }

    pub fn store(&mut self) -> &mut dyn Store {
        self.store.as_mut()
    }

    /// Take the installation's transaction lock, blocking (with a
    /// notice) while another process holds it. The returned [`Lock`]
    /// is held until dropped.
    pub fn lock(&self) -> Result<Lock, Error> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.capsule_path("lock"))?;

        if let Err(errno) = flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            if errno != Errno::EWOULDBLOCK {
                return Err(Error::Lock(errno));
            }
            println!(
                "Waiting for another transaction on {} to finish",
                self.root.display()
            );
            flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(Error::Lock)?;
        }

        Ok(Lock { file })
    }

    // Remote configuration

    pub fn remote_config(&self, name: &str) -> Option<&remote::Config> {
        self.remotes.get(name)
    }

    pub fn remote_names(&self) -> impl Iterator<Item = &str> {
        self.remotes.0.keys().map(String::as_str)
    }

    pub fn add_remote(&mut self, name: impl Into<String>, config: remote::Config) -> Result<(), Error> {
        self.remotes.0.insert(name.into(), config);
        self.save_remotes()
    }

    pub fn remove_remote(&mut self, name: &str) -> Result<(), Error> {
        self.remotes.0.remove(name);
        self.save_remotes()
    }

    /// Create an ephemeral origin remote for a `file://` install,
    /// named after the ref id. Reused when the same url is already
    /// registered, made unique otherwise.
    pub fn add_origin_remote(&mut self, id: &str, url: &str) -> Result<String, Error> {
        let base = format!("{id}-origin");

        let mut name = base.clone();
        let mut counter = 1;
        loop {
            match self.remotes.get(&name) {
                Some(config) if config.url == url => return Ok(name),
                Some(_) => {
                    name = format!("{base}-{counter}");
                    counter += 1;
                }
                None => break,
            }
        }

        self.add_remote(
            name.clone(),
            remote::Config {
                url: url.to_owned(),
                disabled: false,
                ephemeral: true,
            },
        )?;
        Ok(name)
    }

    pub fn remove_origin_remote(&mut self, name: &str) -> Result<(), Error> {
        if self.remotes.get(name).is_some_and(|config| config.ephemeral) {
            self.remove_remote(name)?;
        }
        Ok(())
    }

    /// Fetch the current state of a configured remote
    pub fn remote_state(&self, name: &str) -> Result<RemoteState, Error> {
        let config = self
            .remotes
            .get(name)
            .ok_or_else(|| Error::UnknownRemote(name.to_owned()))?;
        let summary = self.store.fetch_summary(&config.url)?;
        Ok(RemoteState::new(name, config.url.clone(), summary))
    }

    // Deploy queries

    pub fn deployed(&self, reference: &Ref) -> Option<&Deploy> {
        self.deploys.get(&reference.to_string())
    }

    pub fn origin_of(&self, reference: &Ref) -> Option<&str> {
        self.deployed(reference).map(|deploy| deploy.origin.as_str())
    }

    pub fn deployed_refs(&self) -> impl Iterator<Item = (Ref, &Deploy)> {
        self.deploys
            .iter()
            .filter_map(|(name, deploy)| Some((Ref::parse(name).ok()?, deploy)))
    }

    /// Origin recorded for `reference` in another system installation,
    /// skipping duplicates of this root
    pub fn installed_elsewhere(&self, reference: &Ref) -> Option<String> {
        let this_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());

        for root in &self.system_roots {
            let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
            if canonical == this_root {
                continue;
            }
            let deploys: BTreeMap<String, Deploy> =
                match load_json(&root.join(CAPSULE_DIR).join(DEPLOYS_FILE)) {
                    Ok(Some(deploys)) => deploys,
                    _ => continue,
                };
            if let Some(deploy) = deploys.get(&reference.to_string()) {
                return Some(deploy.origin.clone());
            }
        }
        None
    }

    pub fn ref_is_installed(&self, reference: &Ref) -> bool {
        self.deployed(reference).is_some() || self.installed_elsewhere(reference).is_some()
    }

    // Engine primitives

    /// Pull and deploy a ref from a remote
    pub fn install(
        &mut self,
        state: &RemoteState,
        reference: &Ref,
        options: &InstallOptions,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &Cancel,
    ) -> Result<(), Error> {
        let entry = state.lookup_ref(reference).ok_or_else(|| Error::NotInRemote {
            pref: reference.pref(),
            remote: state.name.clone(),
        })?;
        let metadata = entry.metadata.clone();

        let commit = if options.no_pull {
            entry.commit.clone()
        } else {
            self.store.pull(
                &state.url.clone(),
                &reference.to_string(),
                &PullOptions {
                    no_static_deltas: options.no_static_deltas,
                },
                progress,
                cancel,
            )?
        };

        if options.no_deploy {
            return Ok(());
        }

        let subpaths = options.subpaths.clone().unwrap_or_default();
        self.deploy(reference, &state.name.clone(), commit, subpaths, metadata, cancel)
    }

    /// Redeploy an installed ref at `target`, keeping its origin.
    /// Returns [`Error::AlreadyInstalled`] when the deploy is already
    /// at the target commit.
    pub fn update(
        &mut self,
        state: &RemoteState,
        reference: &Ref,
        target: &CommitId,
        options: &InstallOptions,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &Cancel,
    ) -> Result<(), Error> {
        let deploy = self.deployed(reference).ok_or_else(|| Error::NotInstalled {
            pref: reference.pref(),
        })?;

        if &deploy.commit == target && !options.reinstall {
            return Err(Error::AlreadyInstalled {
                pref: reference.pref(),
            });
        }

        let origin = deploy.origin.clone();
        let subpaths = match &options.subpaths {
            Some(subpaths) => subpaths.clone(),
            None => deploy.subpaths.clone(),
        };
        let metadata = state
            .lookup_ref(reference)
            .and_then(|entry| entry.metadata.clone())
            .or_else(|| self.deployed(reference).and_then(|d| d.metadata.clone()));

        let commit = if options.no_pull {
            target.clone()
        } else {
            self.store.pull(
                &state.url.clone(),
                &reference.to_string(),
                &PullOptions {
                    no_static_deltas: options.no_static_deltas,
                },
                progress,
                cancel,
            )?
        };

        if options.no_deploy {
            return Ok(());
        }

        self.deploy(reference, &origin, commit, subpaths, metadata, cancel)
    }

    /// Newest commit available for an installed ref: `None` when
    /// already current. An explicit `target` overrides the remote's
    /// tip.
    pub fn check_for_update(
        &self,
        state: &RemoteState,
        reference: &Ref,
        target: Option<&CommitId>,
    ) -> Result<Option<CommitId>, Error> {
        let deploy = self.deployed(reference).ok_or_else(|| Error::NotInstalled {
            pref: reference.pref(),
        })?;

        let target = match target {
            Some(target) => target.clone(),
            None => {
                state
                    .lookup_ref(reference)
                    .ok_or_else(|| Error::NotInRemote {
                        pref: reference.pref(),
                        remote: state.name.clone(),
                    })?
                    .commit
                    .clone()
            }
        };

        Ok((deploy.commit != target).then_some(target))
    }

    /// Deploy a bundle file under the given origin remote name
    pub fn install_bundle(&mut self, bundle: &Bundle, origin: &str, cancel: &Cancel) -> Result<(), Error> {
        cancel.check().map_err(store::Error::from)?;

        let target = self.deploy_dir(&bundle.reference).join("files");
        store::clear_dir(&target)?;
        for (relative, contents) in &bundle.files {
            let contents = hex::decode(contents).map_err(|_| Error::MalformedBundleFile {
                file: relative.clone(),
            })?;
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }

        let (eol, eol_rebase) = eol_of(&bundle.reference, bundle.metadata.as_deref());
        self.record_deploy(
            &bundle.reference,
            Deploy {
                origin: origin.to_owned(),
                // Bundles install outside the store; no commit to
                // reference
                commit: CommitId::from(String::new()),
                subpaths: vec![],
                metadata: bundle.metadata.clone(),
                eol,
                eol_rebase,
            },
        )
    }

    /// Remove a deployed ref; store contents are reclaimed by the next
    /// prune
    pub fn uninstall(&mut self, reference: &Ref) -> Result<(), Error> {
        if self.deploys.remove(&reference.to_string()).is_none() {
            return Err(Error::NotInstalled {
                pref: reference.pref(),
            });
        }
        let dir = self.deploy_dir(reference);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        self.store.set_ref(&format!("deploy/{reference}"), None)?;
        self.save_deploys()
    }

    /// Prune unreachable store content under the installation lock
    pub fn prune_store(&mut self, cancel: &Cancel) -> Result<usize, Error> {
        cancel.check().map_err(store::Error::from)?;
        let _lock = self.lock()?;
        Ok(self.store.prune(true)?)
    }

    fn deploy(
        &mut self,
        reference: &Ref,
        origin: &str,
        commit: CommitId,
        subpaths: Vec<String>,
        metadata: Option<String>,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        cancel.check().map_err(store::Error::from)?;

        let target = self.deploy_dir(reference).join("files");
        self.store.checkout(
            &commit,
            &target,
            &CheckoutOptions {
                subpaths: subpaths.clone(),
                ..Default::default()
            },
        )?;

        // Root the deployed commit so pruning keeps it
        self.store.set_ref(&format!("deploy/{reference}"), Some(&commit))?;

        let (eol, eol_rebase) = eol_of(reference, metadata.as_deref());
        self.record_deploy(
            reference,
            Deploy {
                origin: origin.to_owned(),
                commit,
                subpaths,
                metadata,
                eol,
                eol_rebase,
            },
        )
    }

    fn record_deploy(&mut self, reference: &Ref, deploy: Deploy) -> Result<(), Error> {
        self.deploys.insert(reference.to_string(), deploy);
        self.save_deploys()
    }

    fn save_remotes(&self) -> Result<(), Error> {
        save_json(&self.capsule_path(REMOTES_FILE), &self.remotes)
    }

    fn save_deploys(&self) -> Result<(), Error> {
        save_json(&self.capsule_path(DEPLOYS_FILE), &self.deploys)
    }
}

/// End-of-life notices carried in a ref's metadata
fn eol_of(reference: &Ref, metadata: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(metadata) = metadata else {
        return (None, None);
    };
    match Metadata::parse(metadata) {
        Ok(metadata) => (
            metadata.end_of_life(reference.kind()).map(ToOwned::to_owned),
            metadata.end_of_life_rebase(reference.kind()).map(ToOwned::to_owned),
        ),
        Err(error) => {
            warn!("malformed metadata for {}: {error}", reference.pref());
            (None, None)
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Ensures capsule directories are created
fn ensure_dirs_exist(root: &Path) {
    let capsule = root.join(CAPSULE_DIR);

    for path in [capsule.join("deploy"), capsule.join("store")] {
        let _ = fs::create_dir_all(path);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{pref} is not installed")]
    NotInstalled { pref: String },

    #[error("{pref} is already installed")]
    AlreadyInstalled { pref: String },

    #[error("{pref} not found in remote {remote}")]
    NotInRemote { pref: String, remote: String },

    #[error("no such remote: {0}")]
    UnknownRemote(String),

    #[error("malformed bundle {path}: {error}")]
    MalformedBundle {
        path: PathBuf,
        error: serde_json::Error,
    },

    #[error("malformed bundle file entry: {file}")]
    MalformedBundleFile { file: String },

    #[error("taking the transaction lock: {0}")]
    Lock(#[source] Errno),

    #[error("store: {0}")]
    Store(#[from] store::Error),

    #[error("malformed document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::{Memory, Remote, Tree};

    fn memory_installation(root: &Path) -> (Installation, String) {
        let mut store = Memory::new();
        let mut remote = Remote::default();
        remote.seed(
            "app/org.example.App/x86_64/stable",
            Some("[Application]\nruntime=org.example.Platform/x86_64/23.08\n"),
            Tree::from([("bin/app".to_owned(), b"app".to_vec())]),
        );
        store.add_remote("memory://origin", remote);

        let mut installation = Installation::with_store(root, Box::new(store)).unwrap();
        installation
            .add_remote(
                "origin",
                remote::Config {
                    url: "memory://origin".to_owned(),
                    disabled: false,
                    ephemeral: false,
                },
            )
            .unwrap();
        (installation, "origin".to_owned())
    }

    #[test]
    fn install_records_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut installation, remote) = memory_installation(dir.path());
        let state = installation.remote_state(&remote).unwrap();

        let reference = Ref::parse("app/org.example.App/x86_64/stable").unwrap();
        installation
            .install(
                &state,
                &reference,
                &InstallOptions::default(),
                &mut |_, _| {},
                &Cancel::new(),
            )
            .unwrap();

        let deploy = installation.deployed(&reference).unwrap();
        assert_eq!(deploy.origin, "origin");
        assert!(installation.deploy_dir(&reference).join("files/bin/app").exists());

        // Survives a reopen
        let store = Memory::new();
        let reopened = Installation::with_store(dir.path(), Box::new(store)).unwrap();
        assert!(reopened.deployed(&reference).is_some());
    }

    #[test]
    fn check_for_update_none_when_current() {
        let dir = tempfile::tempdir().unwrap();
        let (mut installation, remote) = memory_installation(dir.path());
        let state = installation.remote_state(&remote).unwrap();
        let reference = Ref::parse("app/org.example.App/x86_64/stable").unwrap();

        installation
            .install(&state, &reference, &InstallOptions::default(), &mut |_, _| {}, &Cancel::new())
            .unwrap();

        assert_eq!(installation.check_for_update(&state, &reference, None).unwrap(), None);
    }

    #[test]
    fn uninstall_removes_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut installation, remote) = memory_installation(dir.path());
        let state = installation.remote_state(&remote).unwrap();
        let reference = Ref::parse("app/org.example.App/x86_64/stable").unwrap();

        installation
            .install(&state, &reference, &InstallOptions::default(), &mut |_, _| {}, &Cancel::new())
            .unwrap();
        installation.uninstall(&reference).unwrap();

        assert!(installation.deployed(&reference).is_none());
        assert!(!installation.deploy_dir(&reference).join("files").exists());
        assert!(matches!(
            installation.uninstall(&reference),
            Err(Error::NotInstalled { .. })
        ));
    }

    #[test]
    fn transaction_lock_reacquires_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let installation =
            Installation::with_store(dir.path(), Box::new(Memory::new())).unwrap();

        let lock = installation.lock().unwrap();
        drop(lock);
        // Released on drop; a second hold succeeds without blocking
        let _lock = installation.lock().unwrap();
    }

    #[test]
    fn origin_remote_naming() {
        let dir = tempfile::tempdir().unwrap();
        let store = Memory::new();
        let mut installation = Installation::with_store(dir.path(), Box::new(store)).unwrap();

        let first = installation
            .add_origin_remote("org.example.App", "file:///srv/a")
            .unwrap();
        assert_eq!(first, "org.example.App-origin");

        // Same url reuses the remote
        let again = installation
            .add_origin_remote("org.example.App", "file:///srv/a")
            .unwrap();
        assert_eq!(again, first);

        // Different url gets a unique name
        let other = installation
            .add_origin_remote("org.example.App", "file:///srv/b")
            .unwrap();
        assert_eq!(other, "org.example.App-origin-1");

        installation.remove_origin_remote(&other).unwrap();
        assert!(installation.remote_config(&other).is_none());
    }

    #[test]
    fn installed_elsewhere_skips_duplicate_roots() {
        let dir = tempfile::tempdir().unwrap();
        let (mut installation, remote) = memory_installation(&dir.path().join("primary"));
        let state = installation.remote_state(&remote).unwrap();
        let reference = Ref::parse("app/org.example.App/x86_64/stable").unwrap();
        installation
            .install(&state, &reference, &InstallOptions::default(), &mut |_, _| {}, &Cancel::new())
            .unwrap();

        // A duplicate of our own root is not "elsewhere"
        installation.system_roots = vec![dir.path().join("primary")];
        assert!(installation.installed_elsewhere(&reference).is_none());

        // Another installation with the ref is
        let (mut secondary, remote) = memory_installation(&dir.path().join("secondary"));
        let state = secondary.remote_state(&remote).unwrap();
        secondary
            .install(&state, &reference, &InstallOptions::default(), &mut |_, _| {}, &Cancel::new())
            .unwrap();

        installation.system_roots = vec![dir.path().join("secondary")];
        assert_eq!(
            installation.installed_elsewhere(&reference),
            Some("origin".to_owned())
        );
    }
}
