// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal file-backed [`Store`].
//!
//! Objects are stored once under `objects/` keyed by content hash,
//! commits are JSON documents carrying a path-to-object tree, refs are
//! plain files whose nested path is the ref name. No deltas and no
//! signatures; transport understands `file://` remotes only.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    clear_dir, force_mtime, selected_by_subpaths, walk_files, Changes, CheckoutOptions, CommitId,
    CommitInfo, Error, PullOptions, Store, TreeSide,
};
use crate::cancel::Cancel;
use crate::remote::Summary;

const OBJECTS_DIR: &str = "objects";
const COMMITS_DIR: &str = "commits";
const REFS_DIR: &str = "refs";
const SUMMARY_FILE: &str = "summary.json";

/// Commit document: header plus the path to object-hash tree
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitDoc {
    #[serde(flatten)]
    info: CommitInfo,
    tree: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Staged {
    refs: BTreeMap<String, Option<CommitId>>,
    commits: BTreeMap<CommitId, CommitDoc>,
}

/// File-backed store rooted at a directory
#[derive(Debug)]
pub struct Disk {
    root: PathBuf,
    staged: Option<Staged>,
}

impl Disk {
    /// Create or open the store at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        for dir in [OBJECTS_DIR, COMMITS_DIR, REFS_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root, staged: None })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(hash)
    }

    fn commit_path(&self, id: &CommitId) -> PathBuf {
        self.root.join(COMMITS_DIR).join(format!("{id}.json"))
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(REFS_DIR).join(name)
    }

    fn load_doc(&self, id: &CommitId) -> Result<CommitDoc, Error> {
        if let Some(doc) = self.staged.as_ref().and_then(|s| s.commits.get(id)) {
            return Ok(doc.clone());
        }
        let path = self.commit_path(id);
        if !path.exists() {
            return Err(Error::UnknownCommit(id.clone()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_object(&self, contents: &[u8]) -> Result<String, Error> {
        let hash = hex::encode(Sha256::digest(contents));
        let path = self.object_path(&hash);
        if !path.exists() {
            fs::write(path, contents)?;
        }
        Ok(hash)
    }

    fn store_ref(&self, name: &str, commit: Option<&CommitId>) -> Result<(), Error> {
        let path = self.ref_path(name);
        match commit {
            Some(commit) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, commit.as_ref())?;
            }
            None => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn load_side(&self, side: &TreeSide) -> Result<BTreeMap<String, String>, Error> {
        match side {
            TreeSide::Commit(id) => Ok(self.load_doc(id)?.tree),
            TreeSide::Empty => Ok(BTreeMap::new()),
            TreeSide::Directory(path) => {
                let mut tree = BTreeMap::new();
                if path.exists() {
                    for (relative, absolute) in walk_files(path)? {
                        let contents = fs::read(absolute)?;
                        tree.insert(relative, hex::encode(Sha256::digest(&contents)));
                    }
                }
                Ok(tree)
            }
        }
    }

    fn all_ref_names(&self) -> Result<Vec<String>, Error> {
        fn recurse(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    recurse(root, &path, out)?;
                } else {
                    let name = path
                        .strip_prefix(root)
                        .expect("path under refs root")
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(name);
                }
            }
            Ok(())
        }

        let mut out = vec![];
        recurse(&self.root.join(REFS_DIR), &self.root.join(REFS_DIR), &mut out)?;
        out.sort();
        Ok(out)
    }
}

impl Store for Disk {
    fn resolve_ref(&self, name: &str) -> Result<Option<CommitId>, Error> {
        let path = self.ref_path(name);
        // A directory here holds refs nested under the name
        if !path.is_file() {
            return Ok(None);
        }
        let id = fs::read_to_string(path)?;
        Ok(Some(CommitId::from(id.trim().to_owned())))
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .all_ref_names()?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    fn set_ref(&mut self, name: &str, commit: Option<&CommitId>) -> Result<(), Error> {
        if let Some(staged) = &mut self.staged {
            staged.refs.insert(name.to_owned(), commit.cloned());
            return Ok(());
        }
        self.store_ref(name, commit)
    }

    fn load_commit(&self, commit: &CommitId) -> Result<CommitInfo, Error> {
        Ok(self.load_doc(commit)?.info)
    }

    fn checkout(&self, commit: &CommitId, target: &Path, options: &CheckoutOptions) -> Result<(), Error> {
        let doc = self.load_doc(commit)?;

        clear_dir(target)?;
        for (relative, object) in &doc.tree {
            if !selected_by_subpaths(relative, &options.subpaths) {
                continue;
            }
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let source = self.object_path(object);
            if options.allow_hardlinks {
                fs::hard_link(&source, &path)?;
            } else {
                fs::copy(&source, &path)?;
            }
            if let Some(seconds) = options.force_mtime {
                force_mtime(&path, seconds as u64)?;
            }
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.staged = Some(Staged::default());
        Ok(())
    }

    fn commit_tree(&mut self, source: &Path, info: CommitInfo) -> Result<CommitId, Error> {
        let mut tree = BTreeMap::new();
        for (relative, absolute) in walk_files(source)? {
            let contents = fs::read(absolute)?;
            tree.insert(relative, self.write_object(&contents)?);
        }

        let doc = CommitDoc { info, tree };
        let id = doc_id(&doc);

        if let Some(staged) = &mut self.staged {
            staged.commits.insert(id.clone(), doc);
        } else {
            fs::write(self.commit_path(&id), serde_json::to_string_pretty(&doc)?)?;
        }
        Ok(id)
    }

    fn commit(&mut self) -> Result<(), Error> {
        let staged = self.staged.take().ok_or(Error::NoTransaction)?;

        for (id, doc) in &staged.commits {
            fs::write(self.commit_path(id), serde_json::to_string_pretty(doc)?)?;
        }
        for (name, commit) in &staged.refs {
            self.store_ref(name, commit.as_ref())?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
    }

    fn diff_trees(&self, from: &TreeSide, to: &TreeSide) -> Result<Changes, Error> {
        let from = self.load_side(from)?;
        let to = self.load_side(to)?;

        let mut changes = Changes::default();
        for (path, object) in &to {
            match from.get(path) {
                None => changes.added.push(path.clone()),
                Some(previous) if previous != object => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in from.keys() {
            if !to.contains_key(path) {
                changes.removed.push(path.clone());
            }
        }
        Ok(changes)
    }

    fn prune(&mut self, _refs_only: bool) -> Result<usize, Error> {
        // Reachability: every ref plus its parent chain
        let mut reachable = HashSet::new();
        let mut queue = vec![];
        for name in self.all_ref_names()? {
            if let Some(id) = self.resolve_ref(&name)? {
                queue.push(id);
            }
        }
        while let Some(id) = queue.pop() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            if let Ok(doc) = self.load_doc(&id) {
                if let Some(parent) = doc.info.parent {
                    queue.push(parent);
                }
            }
        }

        let mut kept_objects = HashSet::new();
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join(COMMITS_DIR))? {
            let path = entry?.path();
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| CommitId::from(stem.to_owned()))
            else {
                continue;
            };
            if reachable.contains(&id) {
                if let Ok(doc) = self.load_doc(&id) {
                    kept_objects.extend(doc.tree.into_values());
                }
            } else {
                fs::remove_file(path)?;
                removed += 1;
            }
        }

        for entry in fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let path = entry?.path();
            let keep = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| kept_objects.contains(name));
            if !keep {
                fs::remove_file(path)?;
            }
        }

        Ok(removed)
    }

    fn pull(
        &mut self,
        remote_url: &str,
        ref_name: &str,
        _options: &PullOptions,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &Cancel,
    ) -> Result<CommitId, Error> {
        cancel.check()?;

        let remote = Disk::open(remote_path(remote_url)?)?;
        let id = remote
            .resolve_ref(ref_name)?
            .ok_or_else(|| Error::RefNotFound(ref_name.to_owned()))?;
        let doc = remote.load_doc(&id)?;

        let total = doc
            .tree
            .values()
            .map(|object| {
                remote
                    .object_path(object)
                    .metadata()
                    .map(|m| m.len())
                    .unwrap_or_default()
            })
            .sum();
        progress(0, total);

        let mut transferred = 0;
        for object in doc.tree.values() {
            cancel.check()?;
            let source = remote.object_path(object);
            let target = self.object_path(object);
            if !target.exists() {
                fs::copy(&source, &target)?;
            }
            transferred += source.metadata().map(|m| m.len()).unwrap_or_default();
            progress(transferred, total);
        }

        fs::write(self.commit_path(&id), serde_json::to_string_pretty(&doc)?)?;
        Ok(id)
    }

    fn fetch_summary(&self, remote_url: &str) -> Result<Summary, Error> {
        let path = remote_path(remote_url)?.join(SUMMARY_FILE);
        if !path.exists() {
            return Err(Error::RemoteUnreachable(remote_url.to_owned()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Only `file://` remotes are understood by this store
fn remote_path(remote_url: &str) -> Result<PathBuf, Error> {
    remote_url
        .strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| Error::RemoteUnreachable(remote_url.to_owned()))
}

fn doc_id(doc: &CommitDoc) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update(doc.info.subject.as_bytes());
    hasher.update([0]);
    hasher.update(doc.info.body.as_bytes());
    hasher.update([0]);
    if let Some(parent) = &doc.info.parent {
        hasher.update(parent.as_ref().as_bytes());
    }
    hasher.update([0]);
    for (path, object) in &doc.tree {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(object.as_bytes());
        hasher.update([0]);
    }
    CommitId::from(hex::encode(hasher.finalize()))
}
