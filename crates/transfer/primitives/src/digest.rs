use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Delivery progress of one sender as seen by the local member.
#[derive(
    BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
pub struct SeqRange {
    pub low: u64,
    pub highest_delivered: u64,
    pub highest_received: u64,
}

impl SeqRange {
    #[must_use]
    pub const fn new(low: u64, highest_delivered: u64, highest_received: u64) -> Self {
        Self {
            low,
            highest_delivered,
            highest_received,
        }
    }
}

/// Consistency token captured by a provider while its delivery barrier is
/// closed. A requester installs it verbatim, replacing its own.
#[derive(
    BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
pub struct Digest {
    entries: BTreeMap<PeerId, SeqRange>,
}

impl Digest {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, sender: PeerId, range: SeqRange) -> Self {
        let _prev = self.entries.insert(sender, range);
        self
    }

    pub fn set(&mut self, sender: PeerId, range: SeqRange) -> Option<SeqRange> {
        self.entries.insert(sender, range)
    }

    #[must_use]
    pub fn get(&self, sender: &PeerId) -> Option<&SeqRange> {
        self.entries.get(sender)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &SeqRange)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(PeerId, SeqRange)> for Digest {
    fn from_iter<I: IntoIterator<Item = (PeerId, SeqRange)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
