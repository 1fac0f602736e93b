//! A small in-process group for exercising whole state transfers.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{bail, Result as EyreResult};
use parking_lot::Mutex;
use strata_transfer::local::{spawn_delivery, LocalDelivery, LocalNetwork};
use strata_transfer::{DeliveryLayer, StateInput, StateListener, StateOutput, StateTransfer};
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::{Digest, PeerId, SeqRange, TransferError, TransferEvent};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

const PIECE: usize = 1000;

/// How a [`TestApp`] behaves when asked for or handed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Serve,
    FailGet,
    StallGet,
    /// Stalls like [`Behavior::StallGet`] on the first request only.
    StallFirstGet,
    FailSet,
}

#[derive(Debug)]
pub struct TestApp {
    state: Mutex<Vec<u8>>,
    behavior: Behavior,
    gets: AtomicUsize,
}

impl TestApp {
    pub fn new(state: impl Into<Vec<u8>>) -> Arc<Self> {
        Self::with_behavior(state, Behavior::Serve)
    }

    pub fn with_behavior(state: impl Into<Vec<u8>>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state.into()),
            behavior,
            gets: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> Vec<u8> {
        self.state.lock().clone()
    }

    /// How often the state was asked for.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Acquire)
    }
}

#[async_trait]
impl StateListener for TestApp {
    async fn get_state(&self, output: &mut dyn StateOutput) -> EyreResult<()> {
        let state = self.state();
        let earlier_gets = self.gets.fetch_add(1, Ordering::AcqRel);

        let stall = match self.behavior {
            Behavior::StallGet => true,
            Behavior::StallFirstGet => earlier_gets == 0,
            _ => false,
        };

        if stall {
            loop {
                output.write(b"x").await?;
                output.flush().await?;
                sleep(Duration::from_millis(10)).await;
            }
        }

        match self.behavior {
            Behavior::FailGet => {
                output.write(&state[..state.len().min(3)]).await?;
                bail!("state store unavailable");
            }
            _ => {
                for piece in state.chunks(PIECE) {
                    output.write(piece).await?;
                }
                Ok(())
            }
        }
    }

    async fn set_state(&self, input: &mut dyn StateInput) -> EyreResult<()> {
        let mut received = Vec::new();
        let _read = input.read_to_end(&mut received).await?;

        if self.behavior == Behavior::FailSet {
            bail!("refusing foreign state");
        }

        *self.state.lock() = received;

        Ok(())
    }
}

/// Local delivery with switchable digest failures.
#[derive(Debug, Default)]
pub struct TestDelivery {
    pub inner: LocalDelivery,
    pub fail_capture: AtomicBool,
    pub fail_install: AtomicBool,
}

impl TestDelivery {
    pub fn new(digest: Digest) -> Self {
        Self {
            inner: LocalDelivery::new(digest),
            ..Self::default()
        }
    }

    pub fn is_barrier_open(&self) -> bool {
        self.inner.is_barrier_open()
    }
}

impl DeliveryLayer for TestDelivery {
    fn close_barrier(&self) {
        self.inner.close_barrier();
    }

    fn open_barrier(&self) {
        self.inner.open_barrier();
    }

    fn capture_digest(&self) -> EyreResult<Digest> {
        if self.fail_capture.load(Ordering::Acquire) {
            bail!("digest unavailable");
        }
        self.inner.capture_digest()
    }

    fn install_digest(&self, digest: Digest) -> EyreResult<()> {
        if self.fail_install.load(Ordering::Acquire) {
            bail!("digest rejected");
        }
        self.inner.install_digest(digest)
    }
}

#[derive(Clone, Debug)]
pub struct Member {
    pub id: PeerId,
    pub transfer: StateTransfer,
    pub delivery: Arc<TestDelivery>,
    pub app: Arc<TestApp>,
}

impl Member {
    pub async fn fetch(&self, provider: Option<&Self>) -> Result<u64, TransferError> {
        self.transfer
            .fetch_state(provider.map(|member| member.id.clone()), WAIT)
            .await
    }
}

#[derive(Debug)]
pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    config: StateTransferConfig,
    members: Vec<Member>,
}

impl Cluster {
    pub fn new(config: StateTransferConfig) -> Self {
        Self {
            network: LocalNetwork::new(),
            config,
            members: Vec::new(),
        }
    }

    pub fn join(&mut self, name: &str, app: Arc<TestApp>) -> Member {
        let id = PeerId::from(name);
        let (bus, inbox) = self.network.join(id.clone());
        let delivery = Arc::new(TestDelivery::new(digest_of(name)));

        let transfer = StateTransfer::new(
            id.clone(),
            self.config.clone(),
            Arc::new(bus),
            delivery.clone(),
            app.clone(),
        );

        drop(spawn_delivery(transfer.clone(), inbox));

        let member = Member {
            id,
            transfer,
            delivery,
            app,
        };
        self.members.push(member.clone());

        member
    }

    /// Tells every member about the current network membership.
    pub async fn install_view(&self) {
        let view = self.network.members();

        for member in &self.members {
            member.transfer.handle_view_change(view.clone()).await;
        }
    }

    pub async fn shutdown(self) {
        for member in &self.members {
            member.transfer.stop().await;
        }
    }
}

/// A digest only `name` could have captured.
pub fn digest_of(name: &str) -> Digest {
    let seqno = u64::try_from(name.len()).unwrap() * 10;
    Digest::new().with(PeerId::from(name), SeqRange::new(1, seqno, seqno + 1))
}

/// Deterministic state of `len` bytes that is unlikely to line up by chance.
pub fn patterned_state(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i * 7 % 251).unwrap()).collect()
}

pub async fn next_event<F>(
    events: &mut broadcast::Receiver<TransferEvent>,
    mut matches: F,
) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

/// Waits for the next `*Closed` event and returns its result.
pub async fn closed(
    events: &mut broadcast::Receiver<TransferEvent>,
) -> Result<u64, TransferError> {
    match next_event(events, TransferEvent::is_closed).await {
        TransferEvent::InputStreamClosed { result, .. }
        | TransferEvent::OutputStreamClosed { result, .. } => result,
        other => panic!("not a closed event: {other:?}"),
    }
}
