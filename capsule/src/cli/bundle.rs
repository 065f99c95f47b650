// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use capsule::{progress, transaction, transaction::Flags, Cancel, Installation, Transaction};
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Install a local bundle file")]
pub struct Command {
    #[arg(required = true, help = "Bundle files to install")]
    files: Vec<PathBuf>,
}

pub fn handle(command: Command, installation: &mut Installation, flags: Flags) -> Result<(), Error> {
    let mut tx = Transaction::new(installation, flags);
    for file in &command.files {
        tx.add_install_bundle(file)?;
    }

    tx.run(false, &mut progress::Console::default(), &Cancel::new())?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transaction(#[from] transaction::Error),
}
