// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::build::Builder;
pub use self::cache::BuildCache;
pub use self::checksum::Checksum;
pub use self::manifest::Manifest;

pub mod build;
pub mod cache;
pub mod checksum;
pub mod manifest;
