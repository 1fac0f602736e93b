//! Shared types for group state transfer.
//!
//! Everything that crosses a crate boundary lives here: member identities,
//! the consistency digest, the state-transfer wire messages, the events
//! surfaced to the application and the configuration of both transports.

pub mod config;
pub mod digest;
pub mod error;
pub mod events;
pub mod messages;
pub mod peer;

pub use digest::{Digest, SeqRange};
pub use error::TransferError;
pub use events::TransferEvent;
pub use messages::{Rendezvous, StateHeader, StateMessage};
pub use peer::PeerId;
