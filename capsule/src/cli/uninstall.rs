// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use capsule::{progress, transaction, transaction::Flags, Cancel, Installation, Transaction};
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Uninstall applications or runtimes")]
pub struct Command {
    #[arg(required = true, value_name = "REF", help = "Refs to uninstall")]
    refs: Vec<String>,
}

pub fn handle(command: Command, installation: &mut Installation, flags: Flags) -> Result<(), Error> {
    let mut tx = Transaction::new(installation, flags);
    for reference in &command.refs {
        tx.add_uninstall(reference)?;
    }

    tx.run(false, &mut progress::Console::default(), &Cancel::new())?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transaction(#[from] transaction::Error),
}
