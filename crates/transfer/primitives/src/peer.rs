use core::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Identity of a group member.
///
/// Opaque and totally ordered, so it can key maps and decide the default
/// state provider deterministically.
#[derive(
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_identity() {
        let mut members: Vec<PeerId> = vec!["carol".into(), "alice".into(), "bob".into()];
        members.sort();

        assert_eq!(
            members.iter().map(PeerId::as_str).collect::<Vec<_>>(),
            ["alice", "bob", "carol"],
            "members should sort by identity"
        );
    }

    #[test]
    fn test_serde_is_transparent() {
        let peer = PeerId::from("node-1");
        let json = serde_json::to_string(&peer).unwrap();

        assert_eq!(json, "\"node-1\"", "identity should serialize as a plain string");
    }
}
