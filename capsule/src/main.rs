// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

mod cli;

fn main() {
    env_logger::init();

    if let Err(error) = cli::process() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}
