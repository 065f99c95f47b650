// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Message bus access policies, keyed by well-known bus name.

use strum::{Display, EnumString};
use thiserror::Error;

/// What a sandboxed application may do with a given bus name.
/// Variants are ordered by how much they permit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Policy {
    /// Name is invisible
    #[default]
    None,
    /// Name is visible but cannot be talked to
    See,
    /// Calls and signals are allowed
    Talk,
    /// The application may own the name
    Own,
}

const MAX_NAME_LENGTH: usize = 255;

/// Validate a well-known bus name. A trailing `.*` element makes the
/// policy apply to every name under the prefix.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidName(name.to_owned());

    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(invalid());
    }

    let body = name.strip_suffix(".*").unwrap_or(name);
    if body.is_empty() {
        return Err(invalid());
    }

    // A wildcard applies to anything under the prefix, so a single
    // prefix element is enough; full names need two
    let elements = body.split('.').collect::<Vec<_>>();
    if elements.len() < 2 && body == name {
        return Err(invalid());
    }

    for element in elements {
        if element.is_empty() {
            return Err(invalid());
        }
        let mut chars = element.chars();
        let first = chars.next().expect("nonempty element");
        if !(first.is_ascii_alphabetic() || first == '_' || first == '-') {
            return Err(invalid());
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid());
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid bus name: {0}")]
    InvalidName(String),
}
