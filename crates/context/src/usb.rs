// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! USB device queries.
//!
//! A query is a `+` joined conjunction of rules: `vnd:XXXX` (vendor
//! id), `prd:XXXX` (product id, requires a vendor rule), `cls:XX` or
//! `cls:XX+XX` style class/subclass matches with `*` wildcards.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Rule {
    Vendor(u16),
    Product(u16),
    Class(u8),
    /// Class with subclass, subclass may be wildcarded
    Subclass(u8, Option<u8>),
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Vendor(id) => write!(f, "vnd:{id:04x}"),
            Rule::Product(id) => write!(f, "prd:{id:04x}"),
            Rule::Class(class) => write!(f, "cls:{class:02x}"),
            Rule::Subclass(class, Some(subclass)) => write!(f, "cls:{class:02x}:{subclass:02x}"),
            Rule::Subclass(class, None) => write!(f, "cls:{class:02x}:*"),
        }
    }
}

/// A conjunction of [`Rule`]s identifying a set of devices
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    rules: Vec<Rule>,
}

impl Query {
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.is_empty() {
            return Err(Error::Empty);
        }

        let mut rules = vec![];
        for part in text.split('+') {
            let Some((kind, value)) = part.split_once(':') else {
                return Err(Error::MalformedRule(part.to_owned()));
            };
            let rule = match kind {
                "vnd" => Rule::Vendor(parse_id(value, part)?),
                "prd" => Rule::Product(parse_id(value, part)?),
                "cls" => match value.split_once(':') {
                    None => Rule::Class(parse_class(value, part)?),
                    Some((class, "*")) => Rule::Subclass(parse_class(class, part)?, None),
                    Some((class, subclass)) => {
                        Rule::Subclass(parse_class(class, part)?, Some(parse_class(subclass, part)?))
                    }
                },
                _ => return Err(Error::MalformedRule(part.to_owned())),
            };
            rules.push(rule);
        }

        let query = Self { rules };
        if query.rules.iter().any(|r| matches!(r, Rule::Product(_)))
            && !query.rules.iter().any(|r| matches!(r, Rule::Vendor(_)))
        {
            return Err(Error::ProductWithoutVendor(text.to_owned()));
        }

        Ok(query)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, rule) in self.rules.iter().enumerate() {
            if index > 0 {
                write!(f, "+")?;
            }
            rule.fmt(f)?;
        }
        Ok(())
    }
}

fn parse_id(value: &str, rule: &str) -> Result<u16, Error> {
    if value.len() != 4 {
        return Err(Error::MalformedRule(rule.to_owned()));
    }
    u16::from_str_radix(value, 16).map_err(|_| Error::MalformedRule(rule.to_owned()))
}

fn parse_class(value: &str, rule: &str) -> Result<u8, Error> {
    if value.len() != 2 {
        return Err(Error::MalformedRule(rule.to_owned()));
    }
    u8::from_str_radix(value, 16).map_err(|_| Error::MalformedRule(rule.to_owned()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty usb query")]
    Empty,

    #[error("malformed usb rule: {0}")]
    MalformedRule(String),

    #[error("usb product rule requires a vendor rule: {0}")]
    ProductWithoutVendor(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vendor_product() {
        let query = Query::parse("vnd:1234+prd:5678").unwrap();
        assert_eq!(
            query.rules(),
            [Rule::Vendor(0x1234), Rule::Product(0x5678)]
        );
        assert_eq!(query.to_string(), "vnd:1234+prd:5678");
    }

    #[test]
    fn classes() {
        assert_eq!(Query::parse("cls:03").unwrap().rules(), [Rule::Class(0x03)]);
        assert_eq!(
            Query::parse("cls:03:01").unwrap().rules(),
            [Rule::Subclass(0x03, Some(0x01))]
        );
        assert_eq!(
            Query::parse("cls:03:*").unwrap().rules(),
            [Rule::Subclass(0x03, None)]
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("vnd:12345").is_err());
        assert!(Query::parse("vnd:wxyz").is_err());
        assert!(Query::parse("snd:1234").is_err());
        assert!(Query::parse("prd:5678").is_err());
    }
}
