// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cooperative cancellation for long running primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Cancellation handle shared with every long running primitive.
/// Cloning yields a handle to the same token.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token; in-flight primitives abort at their next check
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Suspension point: returns the cancelled error once tripped
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trip_propagates_to_clones() {
        let cancel = Cancel::new();
        let other = cancel.clone();

        assert!(cancel.check().is_ok());
        other.cancel();
        assert_eq!(cancel.check(), Err(Cancelled));
    }
}
