// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Stage-indexed build cache.
//!
//! Every stage of a build is fingerprinted by the rolling [`Checksum`]
//! over all inputs seen so far. A stage whose stored commit carries
//! the same fingerprint as its subject is skipped; the first mismatch
//! checks the last good tree out into the application directory and
//! disables the cache for the rest of the run, so later stages always
//! rebuild on top of it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use capsule::store::{self, Changes, CheckoutOptions, CommitId, CommitInfo, Store, TreeSide};
use log::{debug, info};
use thiserror::Error;

use crate::checksum::Checksum;

/// Stage name of the first commit of a build
pub const STAGE_INIT: &str = "init";
/// Stage name of the last commit of a build
pub const STAGE_FINISH: &str = "finish";

/// Files checked out of the cache get this fixed mtime so a rebuild
/// from cache is indistinguishable from the original build
const CACHE_MTIME: u64 = 1;

pub struct BuildCache {
    store: Box<dyn Store>,
    checksum: Checksum,
    branch: String,
    stage: Option<String>,
    last_parent: Option<CommitId>,
    /// Stage refs present at open time that no lookup has touched yet
    unused_stages: BTreeSet<String>,
    /// Set on the first miss; later lookups can never hit
    disabled: bool,
    app_dir: PathBuf,
}

impl BuildCache {
    /// Open the cache over a disk store at `cache_dir`
    pub fn open(
        cache_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Result<Self, Error> {
        let store = store::disk::Disk::open(cache_dir.into())?;
        Self::with_store(Box::new(store), app_dir, branch)
    }

    /// Open the cache over an injected store
    pub fn with_store(
        mut store: Box<dyn Store>,
        app_dir: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Result<Self, Error> {
        let branch = branch.into();

        // Early versions wrote a single unstaged ref at the bare
        // branch name; such a ref hides the staged layout
        if store.resolve_ref(&branch)?.is_some() {
            debug!("removing legacy cache ref {branch}");
            store.set_ref(&branch, None)?;
        }

        let unused_stages = store
            .list_refs(&format!("{branch}/"))?
            .into_iter()
            .collect::<BTreeSet<_>>();

        Ok(Self {
            store,
            checksum: Checksum::new(),
            branch,
            stage: None,
            last_parent: None,
            unused_stages,
            disabled: false,
            app_dir: app_dir.into(),
        })
    }

    /// The rolling input fingerprint; feed every stage input through
    /// this before calling [`lookup`](Self::lookup)
    pub fn checksum(&mut self) -> &mut Checksum {
        &mut self.checksum
    }

    pub fn last_parent(&self) -> Option<&CommitId> {
        self.last_parent.as_ref()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Ref a stage is stored under. Characters outside `[A-Za-z0-9-_.]`
    /// are `%xx` escaped per byte; `%` itself is never in the safe set,
    /// so distinct stage names always map to distinct refs.
    pub fn stage_ref(&self, stage: &str) -> String {
        let mut escaped = String::with_capacity(stage.len());
        for byte in stage.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                escaped.push(byte as char);
            } else {
                escaped.push_str(&format!("%{byte:02x}"));
            }
        }
        format!("{}/{escaped}", self.branch)
    }

    /// Probe the cache for `stage` under the current fingerprint.
    ///
    /// A hit advances `last_parent` and returns true: the stage's work
    /// can be skipped. A miss materializes the last good tree into the
    /// application directory and permanently disables further hits.
    pub fn lookup(&mut self, stage: &str) -> Result<bool, Error> {
        self.stage = Some(stage.to_owned());
        let stage_ref = self.stage_ref(stage);
        self.unused_stages.remove(&stage_ref);

        if !self.disabled {
            if let Some(commit) = self.store.resolve_ref(&stage_ref)? {
                match self.store.load_commit(&commit) {
                    Ok(info) if info.subject == self.checksum.current() => {
                        debug!("cache hit for stage {stage}");
                        self.last_parent = Some(commit);
                        return Ok(true);
                    }
                    Ok(_) => debug!("cache fingerprint mismatch for stage {stage}"),
                    Err(error) => debug!("cannot load cached stage {stage}: {error}"),
                }
            }

            info!("building stage {stage}");
            if let Some(parent) = self.last_parent.clone() {
                self.checkout(&parent)?;
            }
            self.disabled = true;
        }

        Ok(false)
    }

    /// Commit the application directory as the current stage's result
    pub fn commit(&mut self, body: &str) -> Result<(), Error> {
        let stage = self.stage.clone().ok_or(Error::NoCurrentStage)?;

        // Normalized mtimes keep cached and fresh trees identical
        force_mtimes(&self.app_dir, CACHE_MTIME)?;

        self.store.begin()?;
        let result: Result<CommitId, Error> = (|| {
            let commit = self.store.commit_tree(
                &self.app_dir,
                CommitInfo {
                    subject: self.checksum.current(),
                    body: body.to_owned(),
                    parent: self.last_parent.clone(),
                    metadata: Default::default(),
                },
            )?;
            self.store.set_ref(&self.stage_ref(&stage), Some(&commit))?;
            self.store.commit()?;
            Ok(commit)
        })();

        match result {
            Ok(commit) => {
                self.last_parent = Some(commit);
                Ok(())
            }
            Err(error) => {
                self.store.abort();
                Err(error)
            }
        }
    }

    /// Materialize the final tree when the last stage was a hit
    pub fn checkout_last_parent(&mut self) -> Result<(), Error> {
        if self.disabled {
            return Ok(());
        }
        if let Some(parent) = self.last_parent.clone() {
            self.checkout(&parent)?;
        }
        self.disabled = true;
        Ok(())
    }

    /// Drop stage refs no lookup touched this run, then prune the
    /// store. Returns the number of commits reclaimed.
    pub fn gc(&mut self) -> Result<usize, Error> {
        for stage_ref in std::mem::take(&mut self.unused_stages) {
            debug!("dropping unused cache stage {stage_ref}");
            self.store.set_ref(&stage_ref, None)?;
        }
        Ok(self.store.prune(true)?)
    }

    /// Paths changed by the current stage: its tree against its parent
    pub fn get_changes(&self) -> Result<Changes, Error> {
        let current = self.last_parent.clone().ok_or(Error::NoCurrentStage)?;
        let parent = match self.store.load_commit(&current)?.parent {
            Some(parent) => TreeSide::Commit(parent),
            None => TreeSide::Empty,
        };
        Ok(self.store.diff_trees(&parent, &TreeSide::Commit(current))?)
    }

    /// Paths in the application directory not yet committed
    pub fn get_outstanding_changes(&self) -> Result<Changes, Error> {
        let current = match self.last_parent.clone() {
            Some(commit) => TreeSide::Commit(commit),
            None => TreeSide::Empty,
        };
        Ok(self
            .store
            .diff_trees(&current, &TreeSide::Directory(self.app_dir.clone()))?)
    }

    /// Everything a whole build changed, first stage to last
    pub fn get_all_changes(&self) -> Result<Changes, Error> {
        let side = |stage: &str| -> Result<TreeSide, Error> {
            Ok(match self.store.resolve_ref(&self.stage_ref(stage))? {
                Some(commit) => TreeSide::Commit(commit),
                None => TreeSide::Empty,
            })
        };
        Ok(self
            .store
            .diff_trees(&side(STAGE_INIT)?, &side(STAGE_FINISH)?)?)
    }

    fn checkout(&mut self, commit: &CommitId) -> Result<(), Error> {
        // Never hardlink: later stages mutate the checkout in place
        self.store.checkout(
            commit,
            &self.app_dir,
            &CheckoutOptions {
                allow_hardlinks: false,
                force_mtime: Some(CACHE_MTIME as i64),
                subpaths: vec![],
            },
        )?;
        Ok(())
    }
}

/// Force `mtime` onto every file under `dir`
fn force_mtimes(dir: &Path, mtime: u64) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            force_mtimes(&path, mtime)?;
        } else {
            let file = std::fs::File::options().write(true).open(&path)?;
            file.set_modified(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(mtime))?;
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no stage has been looked up yet")]
    NoCurrentStage,

    #[error("store: {0}")]
    Store(#[from] store::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use capsule::store::memory::Memory;

    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn app_dir(&self) -> PathBuf {
            self.dir.path().join("app")
        }

        fn cache(&self) -> BuildCache {
            BuildCache::open(self.dir.path().join("cache"), self.app_dir(), "org.example.App")
                .unwrap()
        }

        fn write(&self, relative: &str, contents: &str) {
            let path = self.app_dir().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
    }

    /// Feed the canonical four stage inputs, then run the stage bodies
    /// on miss. Returns the per-stage hit pattern.
    fn run_build(fixture: &Fixture, cache: &mut BuildCache, stages: &[(&str, &str)]) -> Vec<bool> {
        let mut hits = vec![];
        for &(stage, payload) in stages {
            cache.checksum().string(Some(stage));
            cache.checksum().string(Some(payload));

            let hit = cache.lookup(stage).unwrap();
            if !hit {
                fixture.write(&format!("out/{stage}"), payload);
                cache.commit(&format!("stage {stage}")).unwrap();
            }
            hits.push(hit);
        }
        hits
    }

    const STAGES: &[(&str, &str)] = &[
        ("init", "skeleton"),
        ("source", "sources"),
        ("build", "objects"),
        ("finish", "export"),
    ];

    #[test]
    fn first_run_misses_second_run_hits() {
        let fixture = Fixture::new();

        let mut cache = fixture.cache();
        assert_eq!(run_build(&fixture, &mut cache, STAGES), [false; 4]);
        let first_finish = cache.last_parent().cloned().unwrap();
        drop(cache);

        let mut cache = fixture.cache();
        assert_eq!(run_build(&fixture, &mut cache, STAGES), [true; 4]);
        assert_eq!(cache.last_parent(), Some(&first_finish));
    }

    #[test]
    fn changed_input_disables_rest_of_run() {
        let fixture = Fixture::new();

        let mut cache = fixture.cache();
        run_build(&fixture, &mut cache, STAGES);
        drop(cache);

        // Same init and source, changed build input
        let changed: Vec<(&str, &str)> = vec![
            ("init", "skeleton"),
            ("source", "sources"),
            ("build", "objects-v2"),
            ("finish", "export"),
        ];
        let mut cache = fixture.cache();
        let hits = run_build(&fixture, &mut cache, &changed);
        assert_eq!(hits, [true, true, false, false]);
        assert!(cache.is_disabled());

        // The miss checked the last good tree out into the app dir
        assert!(fixture.app_dir().join("out/source").exists());
    }

    #[test]
    fn finish_stage_differs_even_with_same_payload() {
        // The rolling checksum distinguishes identical stage payloads
        // at different positions
        let fixture = Fixture::new();

        let mut cache = fixture.cache();
        run_build(&fixture, &mut cache, STAGES);
        drop(cache);

        let reordered: Vec<(&str, &str)> = vec![
            ("init", "skeleton"),
            ("build", "objects"),
            ("source", "sources"),
            ("finish", "export"),
        ];
        let mut cache = fixture.cache();
        let hits = run_build(&fixture, &mut cache, &reordered);
        assert_eq!(hits[0], true);
        assert_eq!(hits[1], false);
    }

    #[test]
    fn gc_drops_stages_absent_from_run() {
        let fixture = Fixture::new();

        let mut cache = fixture.cache();
        run_build(&fixture, &mut cache, STAGES);
        drop(cache);

        // Third run with no "build" stage
        let shorter: Vec<(&str, &str)> = vec![
            ("init", "skeleton"),
            ("source", "sources"),
            ("finish", "other-export"),
        ];
        let mut cache = fixture.cache();
        run_build(&fixture, &mut cache, &shorter);
        cache.gc().unwrap();
        let build_ref = cache.stage_ref("build");
        let init_ref = cache.stage_ref("init");
        drop(cache);

        let store = store::disk::Disk::open(fixture.dir.path().join("cache")).unwrap();
        assert_eq!(store.resolve_ref(&build_ref).unwrap(), None);
        assert!(store.resolve_ref(&init_ref).unwrap().is_some());
    }

    #[test]
    fn checkout_last_parent_materializes_full_hit() {
        let fixture = Fixture::new();

        let mut cache = fixture.cache();
        run_build(&fixture, &mut cache, STAGES);
        drop(cache);

        // Clear the app dir, then hit every stage
        std::fs::remove_dir_all(fixture.app_dir()).unwrap();
        let mut cache = fixture.cache();
        for &(stage, payload) in STAGES {
            cache.checksum().string(Some(stage));
            cache.checksum().string(Some(payload));
            assert!(cache.lookup(stage).unwrap());
        }

        cache.checkout_last_parent().unwrap();
        assert!(cache.is_disabled());
        assert!(fixture.app_dir().join("out/finish").exists());
        // Disabled afterwards; another lookup cannot hit
        cache.checksum().string(Some("extra"));
        assert!(!cache.lookup("extra").unwrap());
    }

    #[test]
    fn stage_ref_escaping_round_trips() {
        let fixture = Fixture::new();
        let cache = fixture.cache();

        assert_eq!(cache.stage_ref("init"), "org.example.App/init");
        assert_eq!(cache.stage_ref("build-mod one"), "org.example.App/build-mod%20one");
        // The escape marker itself is escaped, so these stay distinct
        assert_ne!(cache.stage_ref("a%20b"), cache.stage_ref("a b"));
        assert_ne!(cache.stage_ref("c3a9"), cache.stage_ref("é"));
    }

    #[test]
    fn legacy_bare_branch_ref_is_dropped_at_open() {
        let fixture = Fixture::new();
        fixture.write("seed", "x");

        let mut store = store::disk::Disk::open(fixture.dir.path().join("cache")).unwrap();
        let commit = store
            .commit_tree(&fixture.app_dir(), CommitInfo::default())
            .unwrap();
        store.set_ref("org.example.App", Some(&commit)).unwrap();
        drop(store);

        let _cache = fixture.cache();
        let store = store::disk::Disk::open(fixture.dir.path().join("cache")).unwrap();
        assert_eq!(store.resolve_ref("org.example.App").unwrap(), None);
    }

    #[test]
    fn change_queries() {
        let fixture = Fixture::new();
        let mut cache = fixture.cache();

        cache.checksum().string(Some("init"));
        assert!(!cache.lookup("init").unwrap());
        fixture.write("base", "1");
        cache.commit("init").unwrap();

        cache.checksum().string(Some("finish"));
        assert!(!cache.lookup("finish").unwrap());
        fixture.write("extra", "2");
        cache.commit("finish").unwrap();

        // finish added `extra` on top of init
        let changes = cache.get_changes().unwrap();
        assert_eq!(changes.added, ["extra"]);
        assert!(changes.modified.is_empty());

        // Outstanding: app dir drifted after the commit
        fixture.write("drift", "3");
        let outstanding = cache.get_outstanding_changes().unwrap();
        assert_eq!(outstanding.added, ["drift"]);

        // Whole build: everything relative to the init tree
        let all = cache.get_all_changes().unwrap();
        assert_eq!(all.added, ["extra"]);
    }

    #[test]
    fn commit_requires_a_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache =
            BuildCache::with_store(Box::new(Memory::new()), dir.path().join("app"), "branch").unwrap();
        assert!(matches!(cache.commit("x"), Err(Error::NoCurrentStage)));
    }
}
