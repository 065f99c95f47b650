// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Application and runtime metadata semantics the engine needs: the
//! declared runtime, the minimum host version and end-of-life notices.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::reference::{Kind, Ref};

pub const GROUP_APPLICATION: &str = "Application";
pub const GROUP_RUNTIME: &str = "Runtime";

const KEY_RUNTIME: &str = "runtime";
const KEY_REQUIRED_VERSION: &str = "required-capsule";
const KEY_EOL: &str = "end-of-life";
const KEY_EOL_REBASE: &str = "end-of-life-rebase";

/// Version the running host reports for `required-capsule` checks
pub const HOST_VERSION: Version = Version {
    major: 0,
    minor: 3,
    micro: 1,
};

/// MAJOR.MINOR.MICRO version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut component = || -> Result<u32, Error> {
            match parts.next() {
                None => Ok(0),
                Some(part) => part.parse().map_err(|_| Error::InvalidVersion(s.to_owned())),
            }
        };

        let major = component()?;
        let minor = component()?;
        let micro = component()?;
        if parts.next().is_some() {
            return Err(Error::InvalidVersion(s.to_owned()));
        }

        Ok(Self { major, minor, micro })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Parsed metadata document of one ref
#[derive(Debug, Clone)]
pub struct Metadata {
    keyfile: keyfile::KeyFile,
}

impl Metadata {
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(Self {
            keyfile: keyfile::KeyFile::parse(text)?,
        })
    }

    /// The group carrying the ref's own keys
    fn group(kind: Kind) -> &'static str {
        match kind {
            Kind::App => GROUP_APPLICATION,
            Kind::Runtime => GROUP_RUNTIME,
        }
    }

    /// The runtime an application declares, as a full runtime ref
    pub fn runtime(&self, kind: Kind) -> Result<Option<Ref>, Error> {
        let Some(value) = self.keyfile.get(Self::group(kind), KEY_RUNTIME) else {
            return Ok(None);
        };

        let [id, arch, branch] = value.split('/').collect::<Vec<_>>()[..] else {
            return Err(Error::InvalidRuntime(value.to_owned()));
        };
        Ref::new(Kind::Runtime, id, arch, branch)
            .map(Some)
            .map_err(|_| Error::InvalidRuntime(value.to_owned()))
    }

    /// Minimum host version required by the ref, if declared
    pub fn required_version(&self, kind: Kind) -> Result<Option<Version>, Error> {
        self.keyfile
            .get(Self::group(kind), KEY_REQUIRED_VERSION)
            .map(Version::from_str)
            .transpose()
    }

    pub fn end_of_life(&self, kind: Kind) -> Option<&str> {
        self.keyfile.get(Self::group(kind), KEY_EOL)
    }

    pub fn end_of_life_rebase(&self, kind: Kind) -> Option<&str> {
        self.keyfile.get(Self::group(kind), KEY_EOL_REBASE)
    }

    /// The sandbox context embedded in the metadata
    pub fn context(&self) -> Result<context::Context, context::Error> {
        context::Context::load(&self.keyfile)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid runtime declaration: {0}")]
    InvalidRuntime(String),

    #[error("malformed metadata: {0}")]
    KeyFile(#[from] keyfile::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_parse_and_order() {
        let version = "1.14.3".parse::<Version>().unwrap();
        assert_eq!(
            version,
            Version {
                major: 1,
                minor: 14,
                micro: 3
            }
        );
        assert!("1.15".parse::<Version>().unwrap() > version);
        assert!("1.14.2".parse::<Version>().unwrap() < version);
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1.x".parse::<Version>().is_err());
    }

    #[test]
    fn runtime_declaration() {
        let metadata = Metadata::parse(
            "[Application]\nname=org.example.App\nruntime=org.example.Platform/x86_64/23.08\n",
        )
        .unwrap();

        let runtime = metadata.runtime(Kind::App).unwrap().unwrap();
        assert_eq!(
            runtime.to_string(),
            "runtime/org.example.Platform/x86_64/23.08"
        );
        assert_eq!(metadata.runtime(Kind::Runtime).unwrap(), None);
    }

    #[test]
    fn malformed_runtime_rejected() {
        let metadata = Metadata::parse("[Application]\nruntime=org.example.Platform\n").unwrap();
        assert!(matches!(
            metadata.runtime(Kind::App),
            Err(Error::InvalidRuntime(_))
        ));
    }

    #[test]
    fn required_version_per_kind_group() {
        let metadata =
            Metadata::parse("[Runtime]\nrequired-capsule=0.2.0\n").unwrap();
        assert_eq!(
            metadata.required_version(Kind::Runtime).unwrap(),
            Some(Version {
                major: 0,
                minor: 2,
                micro: 0
            })
        );
        assert_eq!(metadata.required_version(Kind::App).unwrap(), None);
    }

    #[test]
    fn end_of_life_notices() {
        let metadata = Metadata::parse(
            "[Application]\nend-of-life=no longer maintained\nend-of-life-rebase=org.example.NewApp\n",
        )
        .unwrap();
        assert_eq!(metadata.end_of_life(Kind::App), Some("no longer maintained"));
        assert_eq!(metadata.end_of_life_rebase(Kind::App), Some("org.example.NewApp"));
    }
}
