use core::fmt::{self, Display, Formatter};
use core::time::Duration;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Default in-band chunk size (8 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default capacity of the requester's reassembly buffer (80 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 80 * 1024;

/// Default socket send/receive buffer for out-of-band transfers (8 KiB)
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of workers serving out-of-band requesters
pub const DEFAULT_MAX_POOL: usize = 5;

/// Default idle time after which a pool worker retires (20 seconds)
pub const DEFAULT_POOL_KEEP_ALIVE_MS: u64 = 20_000;

/// Default time a requester has to connect to an advertised rendezvous (20 seconds)
pub const DEFAULT_RENDEZVOUS_TIMEOUT_MS: u64 = 20_000;

/// Default bounded wait for the acceptor task on shutdown
pub const DEFAULT_ACCEPTOR_SHUTDOWN_WAIT_MS: u64 = 300;

/// Default bounded wait for the worker pool on shutdown
pub const DEFAULT_POOL_SHUTDOWN_WAIT_MS: u64 = 3_000;

/// Transport used to move state bytes from provider to requester.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Chunks are sent as ordinary messages through the message bus.
    #[default]
    InBand,
    /// A dedicated TCP connection per requester.
    Socket,
}

impl TransportKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InBand => "in-band",
            Self::Socket => "socket",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct StateTransferConfig {
    pub transport: TransportKind,

    /// Largest payload of one in-band chunk (bytes)
    pub chunk_size: usize,

    /// Capacity of the requester's reassembly buffer (bytes)
    pub buffer_size: usize,

    /// Close the delivery barrier and ship a digest with every response
    pub digest: bool,

    pub socket: SocketConfig,
}

impl StateTransferConfig {
    #[must_use]
    pub const fn new(
        transport: TransportKind,
        chunk_size: usize,
        buffer_size: usize,
        digest: bool,
        socket: SocketConfig,
    ) -> Self {
        Self {
            transport,
            chunk_size,
            buffer_size,
            digest,
            socket,
        }
    }
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            digest: true,
            socket: SocketConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SocketConfig {
    pub bind_addr: IpAddr,

    /// 0 picks an ephemeral port
    pub bind_port: u16,

    pub socket_buffer_size: usize,

    pub max_pool: usize,

    #[serde(rename = "pool_keep_alive_ms", with = "serde_duration")]
    pub pool_keep_alive: Duration,

    #[serde(rename = "rendezvous_timeout_ms", with = "serde_duration")]
    pub rendezvous_timeout: Duration,

    #[serde(rename = "acceptor_shutdown_wait_ms", with = "serde_duration")]
    pub acceptor_shutdown_wait: Duration,

    #[serde(rename = "pool_shutdown_wait_ms", with = "serde_duration")]
    pub pool_shutdown_wait: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            max_pool: DEFAULT_MAX_POOL,
            pool_keep_alive: Duration::from_millis(DEFAULT_POOL_KEEP_ALIVE_MS),
            rendezvous_timeout: Duration::from_millis(DEFAULT_RENDEZVOUS_TIMEOUT_MS),
            acceptor_shutdown_wait: Duration::from_millis(DEFAULT_ACCEPTOR_SHUTDOWN_WAIT_MS),
            pool_shutdown_wait: Duration::from_millis(DEFAULT_POOL_SHUTDOWN_WAIT_MS),
        }
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
