//! Deterministic mapping from a room name to its three store keys

use crate::error::{Error, Result};

/// A room name: non-empty, and a *pattern* iff it contains `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(String);

impl RoomName {
    /// Validate and wrap a room name. Rejects the empty string.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyRoomName);
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A name is a pattern iff it contains the wildcard character `*`.
    /// Pattern names are consumer-only.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.0.contains('*')
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three store keys derived from a room name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTriple {
    /// Snapshot hash key: `{prefix}:{name}:hash`
    pub hash: String,
    /// History list key: `{prefix}:{name}:list`
    pub list: String,
    /// Pub/sub channel key: `{prefix}:{name}:channel`
    pub channel: String,
}

/// Build the key triple for a room name. Patterns and literals use the same
/// formula; the `*` in a pattern name is retained so scan/glob matching at
/// fetch and dispatch time still works.
#[must_use]
pub fn key_triple(prefix: &str, name: &str) -> KeyTriple {
    KeyTriple {
        hash: format!("{prefix}:{name}:hash"),
        list: format!("{prefix}:{name}:list"),
        channel: format!("{prefix}:{name}:channel"),
    }
}

/// Extract the room name embedded in a channel key, given the same prefix
/// used to build it. Returns `None` if the channel doesn't match the
/// `{prefix}:...:channel` shape.
#[must_use]
pub fn room_name_from_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|rest| rest.strip_suffix(":channel"))
}
