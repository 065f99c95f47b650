// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Progress reporting seam. The engine drives one of these
//! synchronously while executing a plan; rendering is up to the
//! implementation.

/// Callbacks fired while a transaction plan executes
pub trait Progress {
    /// The plan has `n_ops` operations
    fn start(&mut self, n_ops: usize) {
        let _ = n_ops;
    }

    /// Work on `pref` (`id/arch/branch`) began
    fn op_start(&mut self, pref: &str) {
        let _ = pref;
    }

    /// Bytes moved for the current operation
    fn op_progress(&mut self, bytes: u64, total: u64) {
        let _ = (bytes, total);
    }

    /// The current operation finished
    fn op_end(&mut self, success: bool) {
        let _ = success;
    }
}

/// Discards all progress
#[derive(Debug, Default)]
pub struct Silent;

impl Progress for Silent {}

/// Plain line-per-operation console reporting
#[derive(Debug, Default)]
pub struct Console {
    current: Option<String>,
}

impl Progress for Console {
    fn op_start(&mut self, pref: &str) {
        self.current = Some(pref.to_owned());
    }

    fn op_end(&mut self, success: bool) {
        if let Some(pref) = self.current.take() {
            if success {
                println!("{pref}: done");
            }
        }
    }
}
