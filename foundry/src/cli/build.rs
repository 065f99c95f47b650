// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use clap::Parser;
use foundry::build::{self, ShellSpawn};
use foundry::Builder;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Build an application from its manifest")]
pub struct Command {
    #[arg(help = "Path to the build manifest")]
    manifest: PathBuf,
    #[arg(long, help = "Application directory; defaults to <state-dir>/app")]
    app_dir: Option<PathBuf>,
}

pub fn handle(command: Command, state_dir: &Path) -> Result<(), Error> {
    let app_dir = command
        .app_dir
        .unwrap_or_else(|| state_dir.join("app"));
    let cache_dir = state_dir.join("cache");

    let mut builder = Builder::new(&command.manifest, cache_dir, app_dir)?;
    builder.build(&mut ShellSpawn)?;

    let changes = builder.changes()?;
    println!(
        "Built {} ({} added, {} modified, {} removed)",
        builder.manifest().app_ref(),
        changes.added.len(),
        changes.modified.len(),
        changes.removed.len()
    );

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] build::Error),
}
