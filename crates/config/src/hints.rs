#[derive(Debug)]
pub struct ConfigHint {
    pub key: &'static str,
    pub description: &'static str,
}

pub const CONFIG_HINTS: &[ConfigHint] = &[
    ConfigHint {
        key: "identity",
        description: "Name of this member in the group.",
    },
    ConfigHint {
        key: "state_transfer.transport",
        description: "Either \"in-band\" (chunks over the message bus) or \"socket\" (one TCP connection per requester).",
    },
    ConfigHint {
        key: "state_transfer.chunk_size",
        description: "Largest in-band chunk in bytes.",
    },
    ConfigHint {
        key: "state_transfer.buffer_size",
        description: "Bytes a requester buffers before the provider has to wait.",
    },
    ConfigHint {
        key: "state_transfer.digest",
        description: "Close the delivery barrier and ship a digest with every response.",
    },
    ConfigHint {
        key: "state_transfer.socket.bind_addr",
        description: "Address the out-of-band listener binds to.",
    },
    ConfigHint {
        key: "state_transfer.socket.bind_port",
        description: "Port of the out-of-band listener, 0 picks a free one.",
    },
    ConfigHint {
        key: "state_transfer.socket.socket_buffer_size",
        description: "Socket buffer and frame size in bytes.",
    },
    ConfigHint {
        key: "state_transfer.socket.max_pool",
        description: "Requesters served at the same time; more connections are dropped.",
    },
    ConfigHint {
        key: "state_transfer.socket.pool_keep_alive_ms",
        description: "Idle time after which a pool worker retires.",
    },
    ConfigHint {
        key: "state_transfer.socket.rendezvous_timeout_ms",
        description: "Time a requester has to connect and identify itself.",
    },
    ConfigHint {
        key: "state_transfer.socket.acceptor_shutdown_wait_ms",
        description: "Bounded wait for the acceptor when stopping.",
    },
    ConfigHint {
        key: "state_transfer.socket.pool_shutdown_wait_ms",
        description: "Bounded wait for running transfers when stopping.",
    },
];

#[must_use]
pub fn hint_for(key: &str) -> Option<&'static ConfigHint> {
    CONFIG_HINTS.iter().find(|hint| hint.key == key)
}
