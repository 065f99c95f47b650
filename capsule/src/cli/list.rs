// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use capsule::Installation;
use clap::Parser;
use itertools::Itertools;

#[derive(Debug, Parser)]
#[command(about = "List installed applications and runtimes")]
pub struct Command {
    #[arg(long, help = "List applications only")]
    app: bool,
    #[arg(long, help = "List runtimes only")]
    runtime: bool,
}

pub fn handle(command: Command, installation: &Installation) {
    let refs = installation
        .deployed_refs()
        .filter(|(reference, _)| {
            if command.app {
                reference.is_app()
            } else if command.runtime {
                reference.is_runtime()
            } else {
                true
            }
        })
        .sorted_by(|(a, _), (b, _)| a.cmp(b));

    for (reference, deploy) in refs {
        println!("{reference}\t{}", deploy.origin);
    }
}
