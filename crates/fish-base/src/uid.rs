//! The 128-bit identifier shared by every domain entity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-ordered unique identifier.
///
/// Every domain entity (Node, Label, Application, ...) is keyed by a
/// `Uid`. New identifiers are generated with UUIDv7 so that storage
/// iteration order roughly follows creation order without needing a
/// separate sequence counter.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(Uuid);

impl Uid {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID, e.g. one read back from storage.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The nil identifier, used as a sentinel in tests and defaults.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for Uid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique_and_ordered() {
        let a = Uid::new();
        let b = Uid::new();
        assert_ne!(a, b);
        // UUIDv7 embeds a millisecond timestamp, so ordering should
        // follow generation order the overwhelming majority of the time.
        assert!(a <= b);
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        let id = Uid::new();
        let printed = id.to_string();
        let parsed: Uid = printed.parse().expect("valid uid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn round_trips_through_serde() {
        let id = Uid::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
