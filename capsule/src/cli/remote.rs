// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use capsule::{installation, remote::Config, Installation};
use clap::Parser;
use thiserror::Error;
use url::Url;

#[derive(Debug, Parser)]
#[command(about = "Manage configured remotes")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    #[command(about = "List remotes")]
    List,
    #[command(about = "Add a remote")]
    Add {
        #[arg(help = "remote name")]
        name: String,
        #[arg(help = "remote url", value_parser = parse_url)]
        url: Url,
        #[arg(long, help = "Add the remote in disabled state")]
        disabled: bool,
    },
    #[command(about = "Remove a remote")]
    Remove {
        #[arg(help = "remote name")]
        name: String,
    },
}

fn parse_url(s: &str) -> Result<Url, String> {
    s.parse::<Url>().map_err(|e| e.to_string())
}

pub fn handle(command: Command, installation: &mut Installation) -> Result<(), Error> {
    match command.subcommand {
        Subcommand::List => {
            for name in installation.remote_names() {
                let Some(config) = installation.remote_config(name) else {
                    continue;
                };
                let state = if config.disabled { " (disabled)" } else { "" };
                println!("{name} {}{state}", config.url);
            }
            Ok(())
        }
        Subcommand::Add { name, url, disabled } => {
            installation.add_remote(
                name,
                Config {
                    url: url.to_string(),
                    disabled,
                    ephemeral: false,
                },
            )?;
            Ok(())
        }
        Subcommand::Remove { name } => {
            installation.remove_remote(&name)?;
            Ok(())
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Installation(#[from] installation::Error),
}
