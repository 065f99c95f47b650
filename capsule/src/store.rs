// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Seam to the content-addressed object store.
//!
//! Everything the installer and the build cache need from the store
//! goes through the [`Store`] trait: ref resolution, commit access,
//! tree checkout/commit, diffing, pruning and remote transport. The
//! [`memory`] implementation backs tests, [`disk`] is a minimal
//! file-backed store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{Cancel, Cancelled};
use crate::remote::Summary;

pub mod disk;
pub mod memory;

/// Opaque commit identifier, a 64 character content hash by convention
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Shortened form for user facing output
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl From<String> for CommitId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CommitId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for CommitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Commit header data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub subject: String,
    pub body: String,
    pub parent: Option<CommitId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Options for materializing a commit as a directory tree
#[derive(Debug, Clone, Default)]
pub struct CheckoutOptions {
    /// Hardlink objects into the target where possible. Must stay
    /// disabled when the checkout will be mutated in place.
    pub allow_hardlinks: bool,
    /// Force this mtime (seconds) onto every checked out file
    pub force_mtime: Option<i64>,
    /// Restrict the checkout to these top level paths; empty means all
    pub subpaths: Vec<String>,
}

/// Options applied while pulling from a remote
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Disable delta object reuse; full objects are fetched
    pub no_static_deltas: bool,
}

/// Relative paths differing between two trees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// One side of a tree comparison
#[derive(Debug, Clone)]
pub enum TreeSide {
    Commit(CommitId),
    Directory(PathBuf),
    /// The empty tree
    Empty,
}

/// The content-addressed store capability
pub trait Store {
    /// Resolve a ref name to its current commit, `None` when unset
    fn resolve_ref(&self, name: &str) -> Result<Option<CommitId>, Error>;

    /// All ref names starting with `prefix`
    fn list_refs(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Point `name` at `commit`, or delete the ref with `None`.
    /// Honors an open transaction.
    fn set_ref(&mut self, name: &str, commit: Option<&CommitId>) -> Result<(), Error>;

    fn load_commit(&self, commit: &CommitId) -> Result<CommitInfo, Error>;

    fn checkout(&self, commit: &CommitId, target: &Path, options: &CheckoutOptions) -> Result<(), Error>;

    /// Open a transaction; ref updates and tree commits stage until
    /// [`commit`](Store::commit)
    fn begin(&mut self) -> Result<(), Error>;

    /// Write `source` as a tree and materialize a commit over it
    fn commit_tree(&mut self, source: &Path, info: CommitInfo) -> Result<CommitId, Error>;

    /// Publish the open transaction
    fn commit(&mut self) -> Result<(), Error>;

    /// Drop the open transaction and everything staged in it
    fn abort(&mut self);

    fn diff_trees(&self, from: &TreeSide, to: &TreeSide) -> Result<Changes, Error>;

    /// Remove unreachable content; `refs_only` limits the roots to
    /// current refs. Returns the number of commits removed.
    fn prune(&mut self, refs_only: bool) -> Result<usize, Error>;

    /// Fetch `ref_name` and its objects from a remote, reporting
    /// `(bytes, total)` transfer progress
    fn pull(
        &mut self,
        remote_url: &str,
        ref_name: &str,
        options: &PullOptions,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &Cancel,
    ) -> Result<CommitId, Error>;

    /// Fetch the summary document of a remote
    fn fetch_summary(&self, remote_url: &str) -> Result<Summary, Error>;
}

/// Collect `(relative_path, absolute_path)` for every file under
/// `root`, sorted by relative path
pub(crate) fn walk_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    fn recurse(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                recurse(root, &path, out)?;
            } else {
                let relative = path
                    .strip_prefix(root)
                    .expect("path under root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((relative, path));
            }
        }
        Ok(())
    }

    let mut out = vec![];
    recurse(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

/// Force the file's mtime to `seconds` past the epoch
pub(crate) fn force_mtime(path: &Path, seconds: u64) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_modified(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(seconds))
}

/// Recreate `dir` as an empty directory
pub fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

/// True when `relative` is selected by the subpath filter
pub(crate) fn selected_by_subpaths(relative: &str, subpaths: &[String]) -> bool {
    if subpaths.is_empty() {
        return true;
    }
    subpaths.iter().any(|subpath| {
        let subpath = subpath.trim_matches('/');
        relative == subpath || relative.starts_with(&format!("{subpath}/"))
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown commit: {0}")]
    UnknownCommit(CommitId),

    #[error("ref not found in remote: {0}")]
    RefNotFound(String),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("no open transaction")]
    NoTransaction,

    #[error("cancelled")]
    Cancelled(#[from] Cancelled),

    #[error("malformed store document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
