//! Concurrency building blocks shared by the state-transfer stack.

pub mod age_out;
pub mod byte_stream;
pub mod collector;

pub use age_out::AgeOutCache;
pub use byte_stream::{byte_stream, ByteStreamError, ByteStreamHandle, ByteStreamReader, ByteStreamWriter};
pub use collector::{CollectorError, ResponseCollector};
