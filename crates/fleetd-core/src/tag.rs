//! Entity tags.
//!
//! Every principal in the cluster is identified by a typed tag: hosts
//! (agents), human users, and models. Tags render as `kind-id` strings
//! and are what login admission dispatches on.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A typed entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tag {
    /// A host enrolled in the cluster (an agent identity).
    Host(String),
    /// A human user.
    User(String),
    /// A managed model.
    Model(String),
}

impl Tag {
    /// The tag kind as a string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Host(_) => "host",
            Self::User(_) => "user",
            Self::Model(_) => "model",
        }
    }

    /// The untyped identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Host(id) | Self::User(id) | Self::Model(id) => id,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.kind(), self.id())
    }
}

/// Errors from parsing a tag string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    /// The string is not of the form `kind-id`.
    #[error("malformed tag {0:?}")]
    Malformed(String),

    /// The kind prefix is not recognized.
    #[error("unknown tag kind in {0:?}")]
    UnknownKind(String),
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('-')
            .ok_or_else(|| TagError::Malformed(s.to_string()))?;
        if id.is_empty() {
            return Err(TagError::Malformed(s.to_string()));
        }
        match kind {
            "host" => Ok(Self::Host(id.to_string())),
            "user" => Ok(Self::User(id.to_string())),
            "model" => Ok(Self::Model(id.to_string())),
            _ => Err(TagError::UnknownKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for Tag {
    type Error = TagError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}
