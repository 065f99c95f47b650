// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem grant tokens.
//!
//! A token is a reserved word (`home`, `host`, ...), an
//! `xdg-*[/subpath]` reference, a `~/relative` path or an absolute
//! path, optionally followed by a `:ro` / `:rw` / `:create` mode
//! suffix. `\:` and `\\` escape a literal colon or backslash inside
//! the token text.

use std::fmt;

use thiserror::Error;

/// Access mode of a filesystem grant, orderable by how much it permits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    /// Negated entry: no access, masks lower layers
    None,
    ReadOnly,
    #[default]
    ReadWrite,
    Create,
}

impl Mode {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "ro" => Some(Self::ReadOnly),
            "rw" => Some(Self::ReadWrite),
            "create" => Some(Self::Create),
            _ => None,
        }
    }

    fn suffix(self) -> Option<&'static str> {
        match self {
            Self::None | Self::ReadWrite => None,
            Self::ReadOnly => Some("ro"),
            Self::Create => Some("create"),
        }
    }
}

/// Directory names accepted after `xdg-`; `xdg-run` requires a subpath
const XDG_NAMES: &[&str] = &[
    "xdg-desktop",
    "xdg-documents",
    "xdg-download",
    "xdg-music",
    "xdg-pictures",
    "xdg-public-share",
    "xdg-videos",
    "xdg-templates",
    "xdg-cache",
    "xdg-config",
    "xdg-data",
    "xdg-run",
];

/// A single filesystem grant location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filesystem {
    /// The user home directory
    Home,
    /// Everything on the host
    Host,
    /// Host /etc
    HostEtc,
    /// Host os tree (/usr and friends)
    HostOs,
    /// Host root directory
    HostRoot,
    /// Clears all accumulated entries when merged with mode `None`
    HostReset,
    /// A well-known xdg directory, optionally a subpath of it
    Xdg { name: String, subpath: Option<String> },
    /// A path relative to the user home directory
    HomePath(String),
    /// An absolute path
    Absolute(String),
}

impl Filesystem {
    /// Parse a full token, including any mode suffix.
    ///
    /// `!`-negated tokens are passed here without the leading `!`;
    /// `negated` selects the extra `:reset` suffix handling.
    pub fn parse(token: &str, negated: bool) -> Result<(Self, Mode), Error> {
        let (text, suffix) = split_suffix(token);

        let mode = match suffix {
            None => Mode::default(),
            Some("reset") => {
                // Only `!host:reset` carries the reset suffix
                if negated && text == "host" {
                    return Ok((Self::HostReset, Mode::None));
                }
                return Err(Error::InvalidSuffix(token.to_owned()));
            }
            Some(suffix) => Mode::from_suffix(suffix).ok_or_else(|| Error::InvalidSuffix(token.to_owned()))?,
        };

        let mode = if negated { Mode::None } else { mode };
        let location = Self::parse_location(&unescape(text)?)?;

        if matches!(location, Self::HostReset) {
            return Ok((location, Mode::None));
        }

        Ok((location, mode))
    }

    fn parse_location(text: &str) -> Result<Self, Error> {
        match text {
            "" => return Err(Error::Empty),
            "home" | "~" | "~/" => return Ok(Self::Home),
            "host" => return Ok(Self::Host),
            "host-etc" => return Ok(Self::HostEtc),
            "host-os" => return Ok(Self::HostOs),
            "host-root" => return Ok(Self::HostRoot),
            "host-reset" => return Ok(Self::HostReset),
            "/" => return Err(Error::RootPath),
            _ => {}
        }

        if let Some(rest) = text.strip_prefix("~/") {
            let path = normalize(rest)?;
            return if path.is_empty() {
                Ok(Self::Home)
            } else {
                Ok(Self::HomePath(path))
            };
        }

        if text.starts_with("xdg-") {
            let (name, subpath) = match text.split_once('/') {
                Some((name, subpath)) => (name, Some(subpath)),
                None => (text, None),
            };
            if !XDG_NAMES.contains(&name) {
                return Err(Error::UnknownXdgDir(name.to_owned()));
            }
            let subpath = subpath.map(normalize).transpose()?.filter(|s| !s.is_empty());
            if name == "xdg-run" && subpath.is_none() {
                return Err(Error::XdgRunWithoutSubpath);
            }
            return Ok(Self::Xdg {
                name: name.to_owned(),
                subpath,
            });
        }

        if let Some(rest) = text.strip_prefix('/') {
            let path = normalize(rest)?;
            if path.is_empty() {
                return Err(Error::RootPath);
            }
            return Ok(Self::Absolute(format!("/{path}")));
        }

        Err(Error::InvalidToken(text.to_owned()))
    }

    /// The token text without any mode suffix, colon/backslash escaped
    pub fn token(&self) -> String {
        let raw = match self {
            Self::Home => "home".to_owned(),
            Self::Host => "host".to_owned(),
            Self::HostEtc => "host-etc".to_owned(),
            Self::HostOs => "host-os".to_owned(),
            Self::HostRoot => "host-root".to_owned(),
            Self::HostReset => "host-reset".to_owned(),
            Self::Xdg { name, subpath } => match subpath {
                Some(subpath) => format!("{name}/{subpath}"),
                None => name.clone(),
            },
            Self::HomePath(path) => format!("~/{path}"),
            Self::Absolute(path) => path.clone(),
        };
        escape(&raw)
    }

    /// Serialize with mode suffix and negation marker.
    ///
    /// `host-reset` always serializes to its layering form
    /// `!host:reset`.
    pub fn serialize(&self, mode: Mode) -> String {
        if matches!(self, Self::HostReset) {
            return "!host:reset".to_owned();
        }
        let token = self.token();
        match mode {
            Mode::None => format!("!{token}"),
            mode => match mode.suffix() {
                Some(suffix) => format!("{token}:{suffix}"),
                None => token,
            },
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.token().fmt(f)
    }
}

/// Split the mode suffix at the first unescaped colon
fn split_suffix(token: &str) -> (&str, Option<&str>) {
    let bytes = token.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b':' => return (&token[..index], Some(&token[index + 1..])),
            _ => index += 1,
        }
    }
    (token, None)
}

fn unescape(text: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ (':' | '\\')) => out.push(next),
                _ => return Err(Error::InvalidEscape(text.to_owned())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == ':' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Normalize a relative path: collapse `//` and `/./`, strip trailing
/// `/` and `/.`, reject any parent-directory traversal.
fn normalize(path: &str) -> Result<String, Error> {
    let mut segments = vec![];
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::ParentReference(path.to_owned())),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty filesystem token")]
    Empty,

    #[error("filesystem token / is not valid, use host")]
    RootPath,

    #[error("filesystem token must not contain ..: {0}")]
    ParentReference(String),

    #[error("unknown filesystem suffix: {0}")]
    InvalidSuffix(String),

    #[error("invalid escape sequence in filesystem token: {0}")]
    InvalidEscape(String),

    #[error("unknown xdg directory: {0}")]
    UnknownXdgDir(String),

    #[error("xdg-run requires a subpath")]
    XdgRunWithoutSubpath,

    #[error("not a valid filesystem token: {0}")]
    InvalidToken(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserved_words() {
        assert_eq!(
            Filesystem::parse("home", false).unwrap(),
            (Filesystem::Home, Mode::ReadWrite)
        );
        assert_eq!(
            Filesystem::parse("host:ro", false).unwrap(),
            (Filesystem::Host, Mode::ReadOnly)
        );
        assert_eq!(
            Filesystem::parse("host-etc", false).unwrap(),
            (Filesystem::HostEtc, Mode::ReadWrite)
        );
    }

    #[test]
    fn host_reset_forms() {
        assert_eq!(
            Filesystem::parse("host:reset", true).unwrap(),
            (Filesystem::HostReset, Mode::None)
        );
        assert_eq!(
            Filesystem::parse("host-reset", false).unwrap(),
            (Filesystem::HostReset, Mode::None)
        );
        // `:reset` requires negated host
        assert!(Filesystem::parse("host:reset", false).is_err());
        assert!(Filesystem::parse("home:reset", true).is_err());
    }

    #[test]
    fn host_reset_serializes_to_layering_form() {
        assert_eq!(Filesystem::HostReset.serialize(Mode::None), "!host:reset");
    }

    #[test]
    fn home_paths() {
        assert_eq!(
            Filesystem::parse("~/Documents:ro", false).unwrap(),
            (Filesystem::HomePath("Documents".into()), Mode::ReadOnly)
        );
        assert_eq!(
            Filesystem::parse("~", false).unwrap(),
            (Filesystem::Home, Mode::ReadWrite)
        );
    }

    #[test]
    fn xdg_paths() {
        assert_eq!(
            Filesystem::parse("xdg-config/gtk-4.0:ro", false).unwrap(),
            (
                Filesystem::Xdg {
                    name: "xdg-config".into(),
                    subpath: Some("gtk-4.0".into())
                },
                Mode::ReadOnly
            )
        );
        assert!(Filesystem::parse("xdg-nonsense", false).is_err());
        assert!(Filesystem::parse("xdg-run", false).is_err());
        assert!(Filesystem::parse("xdg-run/dconf", false).is_ok());
    }

    #[test]
    fn absolute_paths_normalized() {
        assert_eq!(
            Filesystem::parse("/mnt//data/./x/", false).unwrap().0,
            Filesystem::Absolute("/mnt/data/x".into())
        );
        assert_eq!(
            Filesystem::parse("/srv/.", false).unwrap().0,
            Filesystem::Absolute("/srv".into())
        );
    }

    #[test]
    fn rejects_traversal_and_root() {
        assert_eq!(Filesystem::parse("/", false), Err(Error::RootPath));
        assert!(matches!(
            Filesystem::parse("/a/../b", false),
            Err(Error::ParentReference(_))
        ));
        assert!(matches!(
            Filesystem::parse("~/foo/..", false),
            Err(Error::ParentReference(_))
        ));
        assert!(matches!(
            Filesystem::parse("~/..", false),
            Err(Error::ParentReference(_))
        ));
        // Bare relative tokens are not grants at all
        assert!(Filesystem::parse("..", false).is_err());
        assert!(Filesystem::parse("foo/..", false).is_err());
    }

    #[test]
    fn escaped_colon_stays_in_token() {
        let (fs, mode) = Filesystem::parse(r"/pictures\:old:ro", false).unwrap();
        assert_eq!(fs, Filesystem::Absolute("/pictures:old".into()));
        assert_eq!(mode, Mode::ReadOnly);

        // Round-trips with the escape restored
        assert_eq!(fs.serialize(mode), r"/pictures\:old:ro");
    }

    #[test]
    fn unknown_suffix_rejected() {
        assert!(matches!(
            Filesystem::parse("home:write", false),
            Err(Error::InvalidSuffix(_))
        ));
    }

    #[test]
    fn mode_ordering() {
        assert!(Mode::None < Mode::ReadOnly);
        assert!(Mode::ReadOnly < Mode::ReadWrite);
        assert!(Mode::ReadWrite < Mode::Create);
    }
}
