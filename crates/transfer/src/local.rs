//! In-process message bus and delivery layer.
//!
//! Members of a [`LocalNetwork`] exchange encoded state-transfer messages
//! over bounded channels, one inbox per member. Used by the `stratad`
//! transfer command and by tests; there is no real group communication
//! underneath, so the barrier only counts and the digest is a plain value.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{eyre, Result as EyreResult};
use parking_lot::{Mutex, RwLock};
use strata_transfer_primitives::{Digest, PeerId, StateMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{DeliveryLayer, MessageBus};
use crate::StateTransfer;

const INBOX_CAPACITY: usize = 64;

/// An encoded message together with its sender.
pub type Envelope = (PeerId, Vec<u8>);

#[derive(Debug, Default)]
pub struct LocalNetwork {
    members: RwLock<Vec<(PeerId, mpsc::Sender<Envelope>)>>,
}

impl LocalNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Adds `peer` to the network, replacing an earlier member of that name.
    pub fn join(self: &Arc<Self>, peer: PeerId) -> (LocalBus, mpsc::Receiver<Envelope>) {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);

        {
            let mut members = self.members.write();
            members.retain(|(member, _)| *member != peer);
            members.push((peer.clone(), sender));
        }

        debug!(%peer, "joined local network");

        let bus = LocalBus {
            network: Arc::clone(self),
            local: peer,
        };

        (bus, inbox)
    }

    /// Removes `peer`; its inbox ends once queued messages are drained.
    pub fn leave(&self, peer: &PeerId) {
        self.members.write().retain(|(member, _)| member != peer);
        debug!(%peer, "left local network");
    }

    /// Current members in join order.
    #[must_use]
    pub fn members(&self) -> Vec<PeerId> {
        self.members
            .read()
            .iter()
            .map(|(member, _)| member.clone())
            .collect()
    }

    fn sender(&self, peer: &PeerId) -> Option<mpsc::Sender<Envelope>> {
        self.members
            .read()
            .iter()
            .find(|(member, _)| member == peer)
            .map(|(_, sender)| sender.clone())
    }
}

/// A member's handle for sending on a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalBus {
    network: Arc<LocalNetwork>,
    local: PeerId,
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send(&self, to: &PeerId, message: StateMessage) -> EyreResult<()> {
        let Some(sender) = self.network.sender(to) else {
            return Err(eyre!("{to} is not a member of the local network"));
        };

        let encoded = message.to_bytes()?;

        sender
            .send((self.local.clone(), encoded))
            .await
            .map_err(|_closed| eyre!("inbox of {to} is closed"))
    }
}

/// Decodes everything arriving in `inbox` and feeds it to `transfer`.
#[must_use]
pub fn spawn_delivery(transfer: StateTransfer, mut inbox: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((sender, encoded)) = inbox.recv().await {
            match StateMessage::from_bytes(&encoded) {
                Ok(message) => transfer.handle_message(sender, message).await,
                Err(err) => warn!(%sender, %err, "dropping undecodable state message"),
            }
        }

        debug!(local = %transfer.local(), "local delivery ended");
    })
}

/// Delivery layer that records barrier traffic and holds a digest value.
#[derive(Debug, Default)]
pub struct LocalDelivery {
    digest: Mutex<Digest>,
    closes: AtomicUsize,
    opens: AtomicUsize,
}

impl LocalDelivery {
    #[must_use]
    pub fn new(digest: Digest) -> Self {
        Self {
            digest: Mutex::new(digest),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        self.digest.lock().clone()
    }

    #[must_use]
    pub fn barrier_closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn barrier_opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Every close was matched by an open.
    #[must_use]
    pub fn is_barrier_open(&self) -> bool {
        self.barrier_closes() == self.barrier_opens()
    }
}

impl DeliveryLayer for LocalDelivery {
    fn close_barrier(&self) {
        let _prev = self.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn open_barrier(&self) {
        let _prev = self.opens.fetch_add(1, Ordering::AcqRel);
    }

    fn capture_digest(&self) -> EyreResult<Digest> {
        Ok(self.digest())
    }

    fn install_digest(&self, digest: Digest) -> EyreResult<()> {
        *self.digest.lock() = digest;
        Ok(())
    }
}
