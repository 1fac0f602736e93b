use core::fmt::{self, Display, Formatter};
use std::io;
use std::net::SocketAddr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Socket endpoint a provider advertises for an out-of-band transfer.
#[derive(
    BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
)]
pub struct Rendezvous {
    pub host: String,
    pub port: u16,
}

impl Rendezvous {
    #[must_use]
    pub const fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl From<SocketAddr> for Rendezvous {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl Display for Rendezvous {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum StateHeader {
    /// Asks the recipient to provide its state.
    Request,
    /// Provider's answer. `rendezvous` is set for out-of-band transfers,
    /// `digest` whenever the provider captured one.
    Response {
        rendezvous: Option<Rendezvous>,
        digest: Option<Digest>,
    },
    /// One in-band slice of state; the bytes travel as the payload.
    Chunk,
    /// Clean end of in-band state.
    Eof,
    /// The provider gave up; the requester must fail its session.
    Error { reason: String },
}

impl StateHeader {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response { .. } => "response",
            Self::Chunk => "chunk",
            Self::Eof => "eof",
            Self::Error { .. } => "error",
        }
    }
}

/// A state-transfer message as carried by the message bus.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct StateMessage {
    pub header: StateHeader,
    pub payload: Vec<u8>,
}

impl StateMessage {
    #[must_use]
    pub const fn request() -> Self {
        Self {
            header: StateHeader::Request,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub const fn response(rendezvous: Option<Rendezvous>, digest: Option<Digest>) -> Self {
        Self {
            header: StateHeader::Response { rendezvous, digest },
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub const fn chunk(payload: Vec<u8>) -> Self {
        Self {
            header: StateHeader::Chunk,
            payload,
        }
    }

    #[must_use]
    pub const fn eof() -> Self {
        Self {
            header: StateHeader::Eof,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub const fn error(reason: String) -> Self {
        Self {
            header: StateHeader::Error { reason },
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        borsh::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        borsh::from_slice(bytes)
    }
}
