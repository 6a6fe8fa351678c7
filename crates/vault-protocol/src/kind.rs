use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const MAX_KIND_LEN: usize = 64;

/// Name of one independent configuration domain (e.g. `proxy-auth`).
///
/// Each kind owns its own sequence space, ledger row and fleet-status rows.
/// Names are lowercase ASCII, digits and `-`, starting with a letter, so they
/// are safe to use as path components in artifact storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
#[schema(value_type = String, example = "proxy-auth")]
pub struct ConfigKind(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidKind {
    #[error("configuration kind must not be empty")]
    Empty,
    #[error("configuration kind exceeds {MAX_KIND_LEN} bytes")]
    TooLong,
    #[error("configuration kind '{0}' must start with a lowercase letter")]
    BadStart(String),
    #[error("configuration kind '{0}' may only contain [a-z0-9-]")]
    BadChar(String),
}

impl ConfigKind {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidKind> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidKind::Empty);
        }
        if name.len() > MAX_KIND_LEN {
            return Err(InvalidKind::TooLong);
        }
        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(InvalidKind::BadStart(name));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(InvalidKind::BadChar(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConfigKind {
    type Err = InvalidKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKind::new(s)
    }
}

impl TryFrom<String> for ConfigKind {
    type Error = InvalidKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ConfigKind::new(value)
    }
}

impl From<ConfigKind> for String {
    fn from(value: ConfigKind) -> Self {
        value.0
    }
}

impl AsRef<str> for ConfigKind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
