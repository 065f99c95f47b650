// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use capsule::{progress, transaction, transaction::Flags, Cancel, Installation, Transaction};
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Install applications or runtimes")]
pub struct Command {
    #[arg(help = "Remote name, or a file:// location")]
    remote: String,
    #[arg(required = true, value_name = "REF", help = "Fully qualified refs to install")]
    refs: Vec<String>,
    #[arg(
        long = "subpath",
        value_name = "PATH",
        help = "Install only these subpaths, can be passed multiple times"
    )]
    subpaths: Vec<String>,
}

pub fn handle(command: Command, installation: &mut Installation, flags: Flags) -> Result<(), Error> {
    let subpaths = (!command.subpaths.is_empty()).then(|| command.subpaths.clone());

    let mut tx = Transaction::new(installation, flags);
    for reference in &command.refs {
        tx.add_install(&command.remote, reference, subpaths.clone())?;
    }

    if tx.is_empty() {
        return Ok(());
    }

    tx.run(false, &mut progress::Console::default(), &Cancel::new())?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transaction(#[from] transaction::Error),
}
