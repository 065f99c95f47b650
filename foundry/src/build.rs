// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The staged build driver.
//!
//! A build is an ordered run of stages - `init`, then
//! `source-<module>` and `build-<module>` per module, then `finish` -
//! each fingerprinted into the rolling cache checksum and skipped on a
//! cache hit.

use std::path::{Path, PathBuf};
use std::process;

use fs_err as fs;
use log::info;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{self, BuildCache, STAGE_FINISH, STAGE_INIT};
use crate::manifest::{Manifest, Module, Source};

/// Seam for running external build tools
pub trait Spawn {
    fn run(&mut self, command: &str, current_dir: &Path) -> Result<(), Error>;
}

/// Runs commands through the shell
#[derive(Debug, Default)]
pub struct ShellSpawn;

impl Spawn for ShellSpawn {
    fn run(&mut self, command: &str, current_dir: &Path) -> Result<(), Error> {
        let status = process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(current_dir)
            .status()?;

        if !status.success() {
            return Err(Error::CommandFailed {
                command: command.to_owned(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

pub struct Builder {
    manifest: Manifest,
    manifest_dir: PathBuf,
    cache: BuildCache,
    app_dir: PathBuf,
}

impl Builder {
    pub fn new(
        manifest_path: &Path,
        cache_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        let manifest = Manifest::load(manifest_path)?;
        let manifest_dir = manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_owned();
        let app_dir = app_dir.into();
        let cache = BuildCache::open(cache_dir, &app_dir, &manifest.id)?;

        Ok(Self {
            manifest,
            manifest_dir,
            cache,
            app_dir,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Run every stage, consulting the cache first
    pub fn build(&mut self, spawn: &mut dyn Spawn) -> Result<(), Error> {
        self.stage_init()?;

        let modules = self.manifest.modules.clone();
        for module in &modules {
            self.stage_source(module)?;
            self.stage_build(module, spawn)?;
        }

        let finished_from_cache = self.stage_finish()?;
        if finished_from_cache {
            // Materialize the tree for whatever runs after the build
            self.cache.checkout_last_parent()?;
        }

        let reclaimed = self.cache.gc()?;
        if reclaimed > 0 {
            info!("cache gc reclaimed {reclaimed} commits");
        }
        Ok(())
    }

    /// Paths the whole build changed, for reporting
    pub fn changes(&self) -> Result<capsule::store::Changes, Error> {
        Ok(self.cache.get_all_changes()?)
    }

    fn stage_init(&mut self) -> Result<(), Error> {
        let checksum = self.cache.checksum();
        checksum.string(Some(STAGE_INIT));
        checksum.string(Some(&self.manifest.id));
        checksum.string(Some(&self.manifest.branch));
        checksum.string(Some(&self.manifest.arch));
        checksum.string(Some(&self.manifest.runtime));
        checksum.string(Some(&self.manifest.runtime_version));
        checksum.string(Some(&self.manifest.sdk));

        if self.cache.lookup(STAGE_INIT)? {
            return Ok(());
        }

        capsule::store::clear_dir(&self.app_dir)?;
        fs::create_dir_all(self.app_dir.join("files"))?;
        self.cache.commit("Init")?;
        Ok(())
    }

    fn stage_source(&mut self, module: &Module) -> Result<(), Error> {
        let stage = format!("source-{}", module.name);
        self.cache.checksum().string(Some(&stage));
        self.fingerprint_sources(module)?;

        if self.cache.lookup(&stage)? {
            return Ok(());
        }

        let target = self.app_dir.join("sources").join(&module.name);
        capsule::store::clear_dir(&target)?;
        for source in &module.sources {
            self.stage_one_source(source, &target)?;
        }
        self.cache.commit(&format!("Source {}", module.name))?;
        Ok(())
    }

    fn stage_build(&mut self, module: &Module, spawn: &mut dyn Spawn) -> Result<(), Error> {
        let stage = format!("build-{}", module.name);
        let checksum = self.cache.checksum();
        checksum.string(Some(&stage));
        checksum.strv(Some(&module.build_commands));

        if self.cache.lookup(&stage)? {
            return Ok(());
        }

        for command in &module.build_commands {
            info!("[{}] {command}", module.name);
            spawn.run(command, &self.app_dir)?;
        }
        self.cache.commit(&format!("Build {}", module.name))?;
        Ok(())
    }

    /// Returns true when the finish stage was a cache hit
    fn stage_finish(&mut self) -> Result<bool, Error> {
        let checksum = self.cache.checksum();
        checksum.string(Some(STAGE_FINISH));
        checksum.strv(Some(&self.manifest.finish_args));
        checksum.strv(Some(&self.manifest.cleanup));

        if self.cache.lookup(STAGE_FINISH)? {
            return Ok(true);
        }

        for prefix in &self.manifest.cleanup {
            let path = self.app_dir.join("files").join(prefix.trim_start_matches('/'));
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else if path.exists() {
                fs::remove_file(path)?;
            }
        }

        let metadata = self.finished_metadata()?;
        fs::write(self.app_dir.join("metadata"), metadata.to_string())?;

        self.cache.commit("Finish")?;
        Ok(false)
    }

    /// The application metadata document: identity keys plus the
    /// sandbox context built from the finish args
    fn finished_metadata(&self) -> Result<keyfile::KeyFile, Error> {
        let mut sandbox = context::Context::new();
        for arg in &self.manifest.finish_args {
            apply_finish_arg(&mut sandbox, arg)?;
        }

        let mut out = keyfile::KeyFile::new();
        out.set("Application", "name", self.manifest.id.clone());
        out.set("Application", "runtime", self.manifest.runtime_ref());
        out.set("Application", "sdk", self.manifest.sdk.clone());

        for group in sandbox.save(false).groups() {
            for (key, value) in group.entries() {
                out.set(group.name(), key, value);
            }
        }
        Ok(out)
    }

    fn fingerprint_sources(&mut self, module: &Module) -> Result<(), Error> {
        for source in &module.sources {
            match source {
                Source::File { path, sha256 } => {
                    let contents = fs::read(self.manifest_dir.join(path))?;
                    if let Some(expected) = sha256 {
                        let actual = hex::encode(Sha256::digest(&contents));
                        if &actual != expected {
                            return Err(Error::SourceChecksumMismatch {
                                path: path.clone(),
                                expected: expected.clone(),
                                actual,
                            });
                        }
                    }
                    let checksum = self.cache.checksum();
                    checksum.string(Some(path));
                    checksum.bytes(&contents);
                }
                Source::Dir { path } => {
                    let root = self.manifest_dir.join(path);
                    let mut files = vec![];
                    collect_files(&root, &root, &mut files)?;
                    files.sort();
                    let checksum = self.cache.checksum();
                    checksum.string(Some(path));
                    for (relative, absolute) in files {
                        checksum.string(Some(&relative));
                        checksum.bytes(&fs::read(absolute)?);
                    }
                }
            }
        }
        Ok(())
    }

    fn stage_one_source(&self, source: &Source, target: &Path) -> Result<(), Error> {
        match source {
            Source::File { path, .. } => {
                let file_name = Path::new(path)
                    .file_name()
                    .ok_or_else(|| Error::BadSourcePath(path.clone()))?;
                fs::copy(self.manifest_dir.join(path), target.join(file_name))?;
            }
            Source::Dir { path } => {
                let root = self.manifest_dir.join(path);
                let mut files = vec![];
                collect_files(&root, &root, &mut files)?;
                for (relative, absolute) in files {
                    let destination = target.join(relative);
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(absolute, destination)?;
                }
            }
        }
        Ok(())
    }
}

/// Map one finish-arg token onto the sandbox context
fn apply_finish_arg(context: &mut context::Context, arg: &str) -> Result<(), Error> {
    let (option, value) = arg
        .split_once('=')
        .ok_or_else(|| Error::UnknownFinishArg(arg.to_owned()))?;

    let result = match option {
        "--share" => context.add_share(value),
        "--unshare" => context.remove_share(value),
        "--allow" => context.allow_feature(value),
        "--disallow" => context.disallow_feature(value),
        "--socket" => {
            context.allow_socket(value);
            Ok(())
        }
        "--nosocket" => {
            context.disallow_socket(value);
            Ok(())
        }
        "--device" => {
            context.allow_device(value);
            Ok(())
        }
        "--nodevice" => {
            context.disallow_device(value);
            Ok(())
        }
        "--filesystem" => context.add_filesystem(value),
        "--nofilesystem" => context.add_filesystem(&format!("!{value}")),
        "--env" => {
            let (name, value) = value
                .split_once('=')
                .ok_or_else(|| Error::UnknownFinishArg(arg.to_owned()))?;
            context.set_env(name, value);
            Ok(())
        }
        "--unset-env" => {
            context.unset_env(value);
            Ok(())
        }
        "--persist" => {
            context.add_persistent(value);
            Ok(())
        }
        "--talk-name" => context.set_session_bus_policy(value, context::BusPolicy::Talk),
        "--own-name" => context.set_session_bus_policy(value, context::BusPolicy::Own),
        "--system-talk-name" => context.set_system_bus_policy(value, context::BusPolicy::Talk),
        "--system-own-name" => context.set_system_bus_policy(value, context::BusPolicy::Own),
        "--a11y-own-name" => context.set_a11y_bus_policy(value, context::BusPolicy::Own),
        "--add-policy" => {
            let (key, value) = value
                .split_once('=')
                .ok_or_else(|| Error::UnknownFinishArg(arg.to_owned()))?;
            context.apply_generic_policy(key, value)
        }
        "--remove-policy" => {
            let (key, value) = value
                .split_once('=')
                .ok_or_else(|| Error::UnknownFinishArg(arg.to_owned()))?;
            context.apply_generic_policy(key, &format!("!{value}"))
        }
        "--usb" => context.add_usb_query(value),
        "--nousb" => context.hide_usb_query(value),
        _ => return Err(Error::UnknownFinishArg(arg.to_owned())),
    };

    result.map_err(|error| Error::FinishArg {
        arg: arg.to_owned(),
        error,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("path under root")
                .to_string_lossy()
                .into_owned();
            out.push((relative, path));
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed with status {code:?}: {command}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("source {path} does not match its checksum: expected {expected}, got {actual}")]
    SourceChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("source path has no file name: {0}")]
    BadSourcePath(String),

    #[error("unknown finish-arg: {0}")]
    UnknownFinishArg(String),

    #[error("invalid finish-arg {arg}: {error}")]
    FinishArg {
        arg: String,
        error: context::Error,
    },

    #[error("manifest: {0}")]
    Manifest(#[from] crate::manifest::Error),

    #[error("cache: {0}")]
    Cache(#[from] cache::Error),

    #[error("store: {0}")]
    Store(#[from] capsule::store::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    /// Records commands instead of running them
    #[derive(Debug, Default)]
    struct RecordingSpawn {
        commands: Vec<String>,
    }

    impl Spawn for RecordingSpawn {
        fn run(&mut self, command: &str, _current_dir: &Path) -> Result<(), Error> {
            self.commands.push(command.to_owned());
            Ok(())
        }
    }

    fn write_manifest(dir: &Path, build_commands: &[&str]) -> PathBuf {
        let manifest = serde_json::json!({
            "id": "org.example.App",
            "runtime": "org.example.Platform",
            "runtime-version": "23.08",
            "sdk": "org.example.Sdk",
            "finish-args": ["--share=network", "--socket=wayland", "--env=LANG=C"],
            "modules": [{
                "name": "main",
                "sources": [{"type": "file", "path": "main.c"}],
                "build-commands": build_commands,
            }],
        });
        let path = dir.join("manifest.json");
        std::fs::write(&path, manifest.to_string()).unwrap();
        std::fs::write(dir.join("main.c"), "int main() { return 0; }").unwrap();
        path
    }

    fn builder(dir: &Path, manifest: &Path) -> Builder {
        Builder::new(manifest, dir.join("cache"), dir.join("app")).unwrap()
    }

    #[test]
    fn second_build_skips_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &["make"]);

        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();
        assert_eq!(spawn.commands, ["make"]);

        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();
        assert!(spawn.commands.is_empty());
    }

    #[test]
    fn changed_commands_rebuild_from_that_stage() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &["make"]);

        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();

        let manifest = write_manifest(dir.path(), &["make", "make install"]);
        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();
        assert_eq!(spawn.commands, ["make", "make install"]);
    }

    #[test]
    fn changed_source_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &["make"]);

        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();

        std::fs::write(dir.path().join("main.c"), "int main() { return 1; }").unwrap();
        let mut spawn = RecordingSpawn::default();
        builder(dir.path(), &manifest).build(&mut spawn).unwrap();
        assert_eq!(spawn.commands, ["make"]);
    }

    #[test]
    fn finish_writes_metadata_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &["make"]);

        builder(dir.path(), &manifest)
            .build(&mut RecordingSpawn::default())
            .unwrap();

        let metadata = std::fs::read_to_string(dir.path().join("app/metadata")).unwrap();
        let keyfile = keyfile::KeyFile::parse(&metadata).unwrap();
        assert_eq!(keyfile.get("Application", "name"), Some("org.example.App"));
        assert_eq!(
            keyfile.get("Application", "runtime").map(String::from),
            Some(format!(
                "org.example.Platform/{}/23.08",
                std::env::consts::ARCH
            ))
        );
        assert_eq!(keyfile.get("Context", "shared"), Some("network;"));
        assert_eq!(keyfile.get("Context", "sockets"), Some("wayland;"));
        assert_eq!(keyfile.get("Environment", "LANG"), Some("C"));

        // The staged sources landed in the tree
        assert!(dir.path().join("app/sources/main/main.c").exists());
    }

    #[test]
    fn bad_source_checksum_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = serde_json::json!({
            "id": "org.example.App",
            "runtime": "org.example.Platform",
            "runtime-version": "23.08",
            "sdk": "org.example.Sdk",
            "modules": [{
                "name": "main",
                "sources": [{"type": "file", "path": "main.c", "sha256": "0".repeat(64)}],
            }],
        });
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, manifest.to_string()).unwrap();
        std::fs::write(dir.path().join("main.c"), "int main() {}").unwrap();

        let result = builder(dir.path(), &path).build(&mut RecordingSpawn::default());
        assert!(matches!(result, Err(Error::SourceChecksumMismatch { .. })));
    }

    #[test]
    fn unknown_finish_arg_rejected() {
        let mut context = context::Context::new();
        assert!(matches!(
            apply_finish_arg(&mut context, "--frobnicate=yes"),
            Err(Error::UnknownFinishArg(_))
        ));
        assert!(apply_finish_arg(&mut context, "--filesystem=~/Music:ro").is_ok());
        assert!(matches!(
            apply_finish_arg(&mut context, "--filesystem=/.."),
            Err(Error::FinishArg { .. })
        ));
    }
}
