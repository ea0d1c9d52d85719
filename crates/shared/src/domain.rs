use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric id as it arrives from the backend: sometimes a JSON number,
/// sometimes a quoted string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid numeric id: {0:?}")]
pub struct InvalidId(pub String);

impl RawId {
    pub fn normalize(&self) -> Result<i64, InvalidId> {
        match self {
            RawId::Number(value) => Ok(*value),
            RawId::Text(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| InvalidId(text.clone())),
        }
    }
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "RawId")]
        pub struct $name(pub i64);

        impl TryFrom<RawId> for $name {
            type Error = InvalidId;

            fn try_from(raw: RawId) -> Result<Self, Self::Error> {
                raw.normalize().map($name)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                RawId::Text(s.to_string()).normalize().map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(AttachmentId);

/// Opaque two-party conversation id. Numeric ids are kept in their decimal
/// string form so both encodings compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawId")]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Push channel carrying this thread's events.
    pub fn channel_name(&self) -> String {
        format!("chat.{}", self.0)
    }
}

impl From<RawId> for ThreadId {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Number(value) => ThreadId(value.to_string()),
            RawId::Text(text) => ThreadId::new(text),
        }
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        ThreadId::new(value)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Tutor,
    Student,
    Parent,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
