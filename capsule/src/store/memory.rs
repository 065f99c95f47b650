// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory [`Store`] used as a test fixture. Remote repositories are
//! seeded up front; pulls copy from them into the local maps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::{
    clear_dir, force_mtime, selected_by_subpaths, walk_files, Changes, CheckoutOptions, CommitId,
    CommitInfo, Error, PullOptions, Store, TreeSide,
};
use crate::cancel::Cancel;
use crate::remote::Summary;

/// Relative path to file contents
pub type Tree = BTreeMap<String, Vec<u8>>;

/// A seeded remote repository
#[derive(Debug, Clone, Default)]
pub struct Remote {
    pub summary: Summary,
    pub commits: HashMap<CommitId, CommitInfo>,
    pub trees: HashMap<CommitId, Tree>,
}

impl Remote {
    /// Seed one ref with a commit over `tree`, updating the summary
    pub fn seed(&mut self, ref_name: &str, metadata: Option<&str>, tree: Tree) -> CommitId {
        let info = CommitInfo {
            subject: format!("seed {ref_name}"),
            ..Default::default()
        };
        let id = commit_id(&info, &tree);
        let download_size = tree.values().map(|b| b.len() as u64).sum();

        self.summary.entries.insert(
            ref_name.to_owned(),
            crate::remote::SummaryEntry {
                commit: id.clone(),
                installed_size: download_size,
                download_size,
                metadata: metadata.map(ToOwned::to_owned),
            },
        );
        self.commits.insert(id.clone(), info);
        self.trees.insert(id.clone(), tree);
        id
    }
}

#[derive(Debug, Default)]
struct Staged {
    refs: BTreeMap<String, Option<CommitId>>,
    commits: HashMap<CommitId, CommitInfo>,
    trees: HashMap<CommitId, Tree>,
}

/// The fixture store
#[derive(Debug, Default)]
pub struct Memory {
    refs: BTreeMap<String, CommitId>,
    commits: HashMap<CommitId, CommitInfo>,
    trees: HashMap<CommitId, Tree>,
    remotes: HashMap<String, Remote>,
    staged: Option<Staged>,
    /// Commits removed by prune passes, for assertions
    pub pruned: usize,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_remote(&mut self, url: impl Into<String>, remote: Remote) {
        self.remotes.insert(url.into(), remote);
    }

    pub fn remote_mut(&mut self, url: &str) -> Option<&mut Remote> {
        self.remotes.get_mut(url)
    }

    /// Directly seed a local commit, optionally behind a ref
    pub fn seed_commit(&mut self, ref_name: Option<&str>, info: CommitInfo, tree: Tree) -> CommitId {
        let id = commit_id(&info, &tree);
        self.commits.insert(id.clone(), info);
        self.trees.insert(id.clone(), tree);
        if let Some(name) = ref_name {
            self.refs.insert(name.to_owned(), id.clone());
        }
        id
    }

    pub fn has_commit(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    fn tree(&self, id: &CommitId) -> Result<&Tree, Error> {
        self.trees.get(id).ok_or_else(|| Error::UnknownCommit(id.clone()))
    }

    fn load_side(&self, side: &TreeSide) -> Result<Tree, Error> {
        match side {
            TreeSide::Commit(id) => Ok(self.tree(id)?.clone()),
            TreeSide::Directory(path) => Ok(read_dir_tree(path)?),
            TreeSide::Empty => Ok(Tree::new()),
        }
    }
}

impl Store for Memory {
    fn resolve_ref(&self, name: &str) -> Result<Option<CommitId>, Error> {
        Ok(self.refs.get(name).cloned())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .refs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn set_ref(&mut self, name: &str, commit: Option<&CommitId>) -> Result<(), Error> {
        if let Some(staged) = &mut self.staged {
            staged.refs.insert(name.to_owned(), commit.cloned());
            return Ok(());
        }
        match commit {
            Some(commit) => {
                self.refs.insert(name.to_owned(), commit.clone());
            }
            None => {
                self.refs.remove(name);
            }
        }
        Ok(())
    }

    fn load_commit(&self, commit: &CommitId) -> Result<CommitInfo, Error> {
        self.commits
            .get(commit)
            .cloned()
            .ok_or_else(|| Error::UnknownCommit(commit.clone()))
    }

    fn checkout(&self, commit: &CommitId, target: &Path, options: &CheckoutOptions) -> Result<(), Error> {
        let tree = self.tree(commit)?;

        clear_dir(target)?;
        for (relative, contents) in tree {
            if !selected_by_subpaths(relative, &options.subpaths) {
                continue;
            }
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents)?;
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
        let tree = read_dir_tree(source)?;
        let id = commit_id(&info, &tree);

        if let Some(staged) = &mut self.staged {
            staged.commits.insert(id.clone(), info);
            staged.trees.insert(id.clone(), tree);
        } else {
            self.commits.insert(id.clone(), info);
            self.trees.insert(id.clone(), tree);
        }
        Ok(id)
    }

    fn commit(&mut self) -> Result<(), Error> {
        let staged = self.staged.take().ok_or(Error::NoTransaction)?;

        self.commits.extend(staged.commits);
        self.trees.extend(staged.trees);
        for (name, commit) in staged.refs {
            match commit {
                Some(commit) => {
                    self.refs.insert(name, commit);
                }
                None => {
                    self.refs.remove(&name);
                }
            }
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
        for (path, contents) in &to {
            match from.get(path) {
                None => changes.added.push(path.clone()),
                Some(previous) if previous != contents => changes.modified.push(path.clone()),
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
        let mut reachable = HashSet::new();
        let mut queue = self.refs.values().cloned().collect::<Vec<_>>();
        while let Some(id) = queue.pop() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            if let Some(parent) = self.commits.get(&id).and_then(|c| c.parent.clone()) {
                queue.push(parent);
            }
        }

        let before = self.commits.len();
        self.commits.retain(|id, _| reachable.contains(id));
        self.trees.retain(|id, _| reachable.contains(id));
        let removed = before - self.commits.len();
        self.pruned += removed;
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

        let remote = self
            .remotes
            .get(remote_url)
            .ok_or_else(|| Error::RemoteUnreachable(remote_url.to_owned()))?;
        let entry = remote
            .summary
            .entries
            .get(ref_name)
            .ok_or_else(|| Error::RefNotFound(ref_name.to_owned()))?;

        let id = entry.commit.clone();
        let info = remote
            .commits
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownCommit(id.clone()))?;
        let tree = remote
            .trees
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownCommit(id.clone()))?;

        progress(0, entry.download_size);
        cancel.check()?;

        self.commits.insert(id.clone(), info);
        self.trees.insert(id.clone(), tree);
        progress(entry.download_size, entry.download_size);

        Ok(id)
    }

    fn fetch_summary(&self, remote_url: &str) -> Result<Summary, Error> {
        self.remotes
            .get(remote_url)
            .map(|remote| remote.summary.clone())
            .ok_or_else(|| Error::RemoteUnreachable(remote_url.to_owned()))
    }
}

/// Hash a commit header and tree into a stable 64-hex id
pub fn commit_id(info: &CommitInfo, tree: &Tree) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update(info.subject.as_bytes());
    hasher.update([0]);
    hasher.update(info.body.as_bytes());
    hasher.update([0]);
    if let Some(parent) = &info.parent {
        hasher.update(parent.as_ref().as_bytes());
    }
    hasher.update([0]);
    for (path, contents) in tree {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(contents);
        hasher.update([0]);
    }
    CommitId::from(hex::encode(hasher.finalize()))
}

/// Read a directory into a [`Tree`]
pub fn read_dir_tree(root: &Path) -> std::io::Result<Tree> {
    let mut tree = Tree::new();
    if !root.exists() {
        return Ok(tree);
    }
    for (relative, path) in walk_files(root)? {
        tree.insert(relative, std::fs::read(path)?);
    }
    Ok(tree)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tree(entries: &[(&str, &str)]) -> Tree {
        entries
            .iter()
            .map(|(p, c)| ((*p).to_owned(), c.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn refs_resolve_and_delete() {
        let mut store = Memory::new();
        let id = store.seed_commit(Some("app/x/y/z"), CommitInfo::default(), tree(&[]));

        assert_eq!(store.resolve_ref("app/x/y/z").unwrap(), Some(id.clone()));
        store.set_ref("app/x/y/z", None).unwrap();
        assert_eq!(store.resolve_ref("app/x/y/z").unwrap(), None);
    }

    #[test]
    fn transaction_stages_until_commit() {
        let mut store = Memory::new();
        let id = store.seed_commit(None, CommitInfo::default(), tree(&[("a", "1")]));

        store.begin().unwrap();
        store.set_ref("cache/stage", Some(&id)).unwrap();
        assert_eq!(store.resolve_ref("cache/stage").unwrap(), None);

        store.commit().unwrap();
        assert_eq!(store.resolve_ref("cache/stage").unwrap(), Some(id));
    }

    #[test]
    fn abort_drops_staged_refs() {
        let mut store = Memory::new();
        let id = store.seed_commit(None, CommitInfo::default(), tree(&[]));

        store.begin().unwrap();
        store.set_ref("cache/stage", Some(&id)).unwrap();
        store.abort();

        assert_eq!(store.resolve_ref("cache/stage").unwrap(), None);
        assert!(store.commit().is_err());
    }

    #[test]
    fn prune_drops_unreachable_commits() {
        let mut store = Memory::new();
        let kept = store.seed_commit(Some("keep"), CommitInfo::default(), tree(&[("a", "1")]));
        let dropped = store.seed_commit(None, CommitInfo::default(), tree(&[("b", "2")]));

        assert_eq!(store.prune(true).unwrap(), 1);
        assert!(store.has_commit(&kept));
        assert!(!store.has_commit(&dropped));
    }

    #[test]
    fn prune_keeps_parent_chain() {
        let mut store = Memory::new();
        let parent = store.seed_commit(None, CommitInfo::default(), tree(&[("a", "1")]));
        let child = store.seed_commit(
            Some("tip"),
            CommitInfo {
                parent: Some(parent.clone()),
                ..Default::default()
            },
            tree(&[("a", "2")]),
        );

        assert_eq!(store.prune(true).unwrap(), 0);
        assert!(store.has_commit(&parent));
        assert!(store.has_commit(&child));
    }

    #[test]
    fn pull_copies_from_remote() {
        let mut remote = Remote::default();
        let id = remote.seed("app/org.x.App/x86_64/stable", None, tree(&[("bin/app", "x")]));

        let mut store = Memory::new();
        store.add_remote("file:///srv/repo", remote);

        let mut transferred = 0;
        let pulled = store
            .pull(
                "file:///srv/repo",
                "app/org.x.App/x86_64/stable",
                &PullOptions::default(),
                &mut |bytes, _| transferred = bytes,
                &Cancel::new(),
            )
            .unwrap();

        assert_eq!(pulled, id);
        assert!(store.has_commit(&id));
        assert_eq!(transferred, 1);
    }

    #[test]
    fn pull_honors_cancellation() {
        let mut store = Memory::new();
        store.add_remote("file:///srv/repo", Remote::default());

        let cancel = Cancel::new();
        cancel.cancel();

        let result = store.pull(
            "file:///srv/repo",
            "app/x/y/z",
            &PullOptions::default(),
            &mut |_, _| {},
            &cancel,
        );
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[test]
    fn diff_between_commits() {
        let mut store = Memory::new();
        let from = store.seed_commit(None, CommitInfo::default(), tree(&[("a", "1"), ("b", "1")]));
        let to = store.seed_commit(
            None,
            CommitInfo {
                subject: "second".into(),
                ..Default::default()
            },
            tree(&[("a", "2"), ("c", "1")]),
        );

        let changes = store
            .diff_trees(&TreeSide::Commit(from), &TreeSide::Commit(to))
            .unwrap();
        assert_eq!(changes.added, ["c"]);
        assert_eq!(changes.modified, ["a"]);
        assert_eq!(changes.removed, ["b"]);
    }
}
