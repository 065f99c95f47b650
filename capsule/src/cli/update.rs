// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use capsule::{
    progress, store::CommitId, transaction, transaction::Flags, Cancel, Installation, Transaction,
};
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Update installed applications and runtimes")]
pub struct Command {
    #[arg(value_name = "REF", help = "Refs to update; all installed refs when omitted")]
    refs: Vec<String>,
    #[arg(long, help = "Update to this commit instead of the latest")]
    commit: Option<String>,
}

pub fn handle(command: Command, installation: &mut Installation, flags: Flags) -> Result<(), Error> {
    if command.commit.is_some() && command.refs.len() != 1 {
        return Err(Error::CommitNeedsSingleRef);
    }

    let refs = if command.refs.is_empty() {
        installation
            .deployed_refs()
            .map(|(reference, _)| reference.to_string())
            .collect()
    } else {
        command.refs.clone()
    };

    let mut tx = Transaction::new(installation, flags);
    tx.update_metadata(true, &Cancel::new())?;
    for reference in &refs {
        tx.add_update(reference, None, command.commit.clone().map(CommitId::from))?;
    }

    if tx.is_empty() {
        println!("Nothing to update");
        return Ok(());
    }

    tx.run(false, &mut progress::Console::default(), &Cancel::new())?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("--commit requires exactly one ref")]
    CommitNeedsSingleRef,

    #[error(transparent)]
    Transaction(#[from] transaction::Error),
}
