// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use capsule::{transaction::Flags, Installation};
use clap::{Args, CommandFactory, Parser};
use clap_complete::{
    generate_to,
    shells::{Bash, Fish, Zsh},
};
use clap_mangen::Man;
use fs_err::{self as fs, File};
use thiserror::Error;

mod bundle;
mod install;
mod list;
mod remote;
mod uninstall;
mod update;
mod version;

#[derive(Debug, Parser)]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short = 'D',
        long = "directory",
        global = true,
        default_value = "/",
        help = "Installation root directory"
    )]
    pub root: PathBuf,
    #[arg(
        short,
        long = "yes-all",
        global = true,
        help = "Assume yes for all questions",
        default_value = "false"
    )]
    pub yes: bool,
    #[arg(long, global = true, help = "Do not recurse into runtime dependencies")]
    pub no_deps: bool,
    #[arg(long, global = true, help = "Do not pull in related refs")]
    pub no_related: bool,
    #[arg(long, global = true, help = "Reinstall already installed refs")]
    pub reinstall: bool,
    #[arg(long, global = true, help = "Operate on already fetched content")]
    pub no_pull: bool,
    #[arg(long, global = true, help = "Pull only, do not deploy")]
    pub no_deploy: bool,
    #[arg(long, global = true, hide = true)]
    pub generate_manpages: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    pub generate_completions: Option<PathBuf>,
}

impl Global {
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::default();
        if self.yes {
            flags |= Flags::NO_INTERACTION;
        }
        if self.no_deps {
            flags &= !Flags::ADD_DEPS;
        }
        if self.no_related {
            flags &= !Flags::ADD_RELATED;
        }
        if self.reinstall {
            flags |= Flags::REINSTALL;
        }
        if self.no_pull {
            flags |= Flags::NO_PULL;
        }
        if self.no_deploy {
            flags |= Flags::NO_DEPLOY;
        }
        flags
    }
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Install(install::Command),
    Update(update::Command),
    Uninstall(uninstall::Command),
    Bundle(bundle::Command),
    Remote(remote::Command),
    List(list::Command),
    Version(version::Command),
}

pub fn process() -> Result<(), Error> {
    let Command { global, subcommand } = Command::parse();

    if let Some(dir) = global.generate_manpages {
        fs::create_dir_all(&dir)?;
        let main_cmd = Command::command();
        let main_man = Man::new(main_cmd.clone());
        let mut buffer = File::create(dir.join("capsule.1"))?;
        main_man.render(&mut buffer)?;

        for sub in main_cmd.get_subcommands() {
            let sub_man = Man::new(sub.clone());
            let name = format!("capsule-{}.1", sub.get_name());
            let mut buffer = File::create(dir.join(&name))?;
            sub_man.render(&mut buffer)?;
        }
        return Ok(());
    }

    if let Some(dir) = global.generate_completions {
        fs::create_dir_all(&dir)?;
        let mut cmd = Command::command();
        generate_to(Bash, &mut cmd, "capsule", &dir)?;
        generate_to(Fish, &mut cmd, "capsule", &dir)?;
        generate_to(Zsh, &mut cmd, "capsule", &dir)?;
        return Ok(());
    }

    let Some(subcommand) = subcommand else {
        Command::command().print_help()?;
        return Ok(());
    };

    if matches!(subcommand, Subcommand::Version(_)) {
        version::print();
        return Ok(());
    }

    let flags = global.flags();
    let mut installation = Installation::open(&global.root)?;

    match subcommand {
        Subcommand::Install(command) => install::handle(command, &mut installation, flags)?,
        Subcommand::Update(command) => update::handle(command, &mut installation, flags)?,
        Subcommand::Uninstall(command) => uninstall::handle(command, &mut installation, flags)?,
        Subcommand::Bundle(command) => bundle::handle(command, &mut installation, flags)?,
        Subcommand::Remote(command) => remote::handle(command, &mut installation)?,
        Subcommand::List(command) => list::handle(command, &installation),
        Subcommand::Version(_) => unreachable!("handled above"),
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("install: {0}")]
    Install(#[from] install::Error),

    #[error("update: {0}")]
    Update(#[from] update::Error),

    #[error("uninstall: {0}")]
    Uninstall(#[from] uninstall::Error),

    #[error("bundle: {0}")]
    Bundle(#[from] bundle::Error),

    #[error("remote: {0}")]
    Remote(#[from] remote::Error),

    #[error("installation: {0}")]
    Installation(#[from] capsule::installation::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
