// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build manifests, declared as an explicit serde schema.

use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_branch() -> String {
    "stable".to_owned()
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_owned()
}

/// A build manifest: one application, built module by module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    pub id: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    pub runtime: String,
    pub runtime_version: String,
    pub sdk: String,
    #[serde(default)]
    pub modules: Vec<Module>,
    /// Context option tokens applied at the finish stage, e.g.
    /// `--share=network`
    #[serde(default)]
    pub finish_args: Vec<String>,
    /// Path prefixes removed from the finished tree
    #[serde(default)]
    pub cleanup: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub build_commands: Vec<String>,
}

/// Where a module's inputs come from. Network and VCS transports are
/// outside the builder; paths are relative to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    File {
        path: String,
        #[serde(default)]
        sha256: Option<String>,
    },
    Dir {
        path: String,
    },
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|error| Error::Malformed {
            path: path.to_owned(),
            error,
        })?;

        if manifest.id.is_empty() {
            return Err(Error::MissingId);
        }
        for module in &manifest.modules {
            if module.name.is_empty() {
                return Err(Error::UnnamedModule);
            }
        }

        Ok(manifest)
    }

    /// The full ref the build produces
    pub fn app_ref(&self) -> String {
        format!("app/{}/{}/{}", self.id, self.arch, self.branch)
    }

    /// The runtime declaration for the finished metadata
    pub fn runtime_ref(&self) -> String {
        format!("{}/{}/{}", self.runtime, self.arch, self.runtime_version)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest has no id")]
    MissingId,

    #[error("manifest contains an unnamed module")]
    UnnamedModule,

    #[error("malformed manifest {path}: {error}")]
    Malformed {
        path: PathBuf,
        error: serde_json::Error,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    const MANIFEST: &str = r#"{
        "id": "org.example.App",
        "runtime": "org.example.Platform",
        "runtime-version": "23.08",
        "sdk": "org.example.Sdk",
        "finish-args": ["--share=network"],
        "modules": [
            {
                "name": "main",
                "sources": [{"type": "file", "path": "main.c", "sha256": null}],
                "build-commands": ["cc main.c -o files/bin/main"]
            }
        ]
    }"#;

    #[test]
    fn parse_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.id, "org.example.App");
        assert_eq!(manifest.branch, "stable");
        assert_eq!(manifest.modules.len(), 1);
        assert_eq!(
            manifest.runtime_ref(),
            format!("org.example.Platform/{}/23.08", std::env::consts::ARCH)
        );
        assert!(manifest.app_ref().starts_with("app/org.example.App/"));
    }

    #[test]
    fn rejects_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"id": "", "runtime": "r", "runtime-version": "1", "sdk": "s"}"#,
        )
        .unwrap();
        assert!(matches!(Manifest::load(&path), Err(Error::MissingId)));
    }

    #[test]
    fn rejects_unknown_source_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"id": "x", "runtime": "r", "runtime-version": "1", "sdk": "s",
                "modules": [{"name": "m", "sources": [{"type": "git", "url": "y"}]}]}"#,
        )
        .unwrap();
        assert!(matches!(Manifest::load(&path), Err(Error::Malformed { .. })));
    }
}
