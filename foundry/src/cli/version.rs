// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Print version info and exit")]
pub struct Command {}

/// Print program version
pub fn print() {
    println!("foundry {}", env!("CARGO_PKG_VERSION"));
}
