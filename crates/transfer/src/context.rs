//! Protocol core shared by both transports.
//!
//! One [`TransferContext`] exists per member. It owns the member's single
//! outgoing state request (the requester session) and every request it is
//! currently serving (provider sessions), and it is the only place where the
//! delivery barrier is closed and reopened.
//!
//! Every session ends through [`TransferContext::finish_requester`] or
//! [`TransferContext::finish_provider`]. Both take the session out of its slot
//! first, so whichever caller gets there first decides the outcome and the
//! teardown (barrier, transport, events) runs exactly once.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eyre::Report;
use parking_lot::{Mutex, RwLock};
use strata_transfer_primitives::config::{StateTransferConfig, TransportKind};
use strata_transfer_primitives::{
    Digest, PeerId, Rendezvous, StateHeader, StateMessage, TransferError, TransferEvent,
};
use tokio::sync::{broadcast, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::barrier::BarrierGuard;
use crate::bus::{DeliveryLayer, MessageBus};
use crate::listener::StateListener;
use crate::session::{
    ProviderSession, ProviderState, RequesterSession, RequesterState, SessionHandle,
};
use crate::stats::TransferStats;
use crate::stream::{StateInput, StateOutput};
use crate::transport::chunked::ChunkedTransport;
use crate::transport::socket::SocketTransport;
use crate::transport::{ProviderHandoff, RequesterHandoff, StateTransport};

const EVENT_CAPACITY: usize = 64;

pub(crate) struct TransferContext {
    local: PeerId,
    config: StateTransferConfig,
    bus: Arc<dyn MessageBus>,
    delivery: Arc<dyn DeliveryLayer>,
    listener: Arc<dyn StateListener>,
    transport: Box<dyn StateTransport>,
    stats: Arc<TransferStats>,
    events: broadcast::Sender<TransferEvent>,
    members: RwLock<Vec<PeerId>>,
    requester: Mutex<Option<RequesterSession>>,
    requester_state: Mutex<RequesterState>,
    providing: DashMap<PeerId, ProviderSession>,
    next_session: AtomicU64,
    stopped: AtomicBool,
}

impl TransferContext {
    pub(crate) fn new(
        local: PeerId,
        config: StateTransferConfig,
        bus: Arc<dyn MessageBus>,
        delivery: Arc<dyn DeliveryLayer>,
        listener: Arc<dyn StateListener>,
        this: &Weak<Self>,
    ) -> Self {
        let transport: Box<dyn StateTransport> = match config.transport {
            TransportKind::InBand => Box::new(ChunkedTransport::new(&config)),
            TransportKind::Socket => {
                Box::new(SocketTransport::new(config.socket, Weak::clone(this)))
            }
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            local,
            config,
            bus,
            delivery,
            listener,
            transport,
            stats: Arc::new(TransferStats::new()),
            events,
            members: RwLock::new(Vec::new()),
            requester: Mutex::new(None),
            requester_state: Mutex::new(RequesterState::Idle),
            providing: DashMap::new(),
            next_session: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) const fn local(&self) -> &PeerId {
        &self.local
    }

    pub(crate) const fn config(&self) -> &StateTransferConfig {
        &self.config
    }

    pub(crate) const fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub(crate) const fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub(crate) fn members(&self) -> Vec<PeerId> {
        self.members.read().clone()
    }

    pub(crate) fn requester_state(&self) -> RequesterState {
        *self.requester_state.lock()
    }

    pub(crate) fn provider_state(&self, requester: &PeerId) -> ProviderState {
        self.providing
            .get(requester)
            .map(|session| session.state)
            .unwrap_or_default()
    }

    /// First member of the current view other than the local one.
    pub(crate) fn default_provider(&self) -> Option<PeerId> {
        self.members
            .read()
            .iter()
            .find(|member| **member != self.local)
            .cloned()
    }

    fn next_handle(&self) -> SessionHandle {
        SessionHandle::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _receivers = self.events.send(event);
    }

    fn current_requester(&self) -> Option<(u64, PeerId)> {
        self.requester
            .lock()
            .as_ref()
            .map(|session| (session.handle.id, session.provider.clone()))
    }

    pub(crate) fn provider_handle(&self, requester: &PeerId) -> Option<SessionHandle> {
        self.providing
            .get(requester)
            .map(|session| session.handle.clone())
    }

    fn set_provider_state(&self, requester: &PeerId, id: u64, state: ProviderState) {
        if let Some(mut session) = self.providing.get_mut(requester) {
            if session.handle.id == id {
                session.state = state;
            }
        }
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    pub(crate) async fn handle_message(self: &Arc<Self>, sender: PeerId, message: StateMessage) {
        if self.stopped.load(Ordering::Acquire) {
            debug!(%sender, kind = message.header.kind(), "stopped, ignoring message");
            return;
        }

        match message.header {
            StateHeader::Request => self.handle_state_request(sender).await,
            StateHeader::Response { rendezvous, digest } => {
                self.handle_state_response(sender, rendezvous, digest).await;
            }
            StateHeader::Chunk => self.transport.on_chunk(&sender, message.payload).await,
            StateHeader::Eof => self.transport.on_eof(&sender).await,
            StateHeader::Error { reason } => self.handle_provider_error(&sender, reason),
        }
    }

    pub(crate) async fn handle_view_change(&self, members: Vec<PeerId>) {
        let departed_provider = self
            .current_requester()
            .filter(|(_, provider)| !members.contains(provider));

        let departed_requesters: Vec<(PeerId, u64)> = self
            .providing
            .iter()
            .filter(|session| !members.contains(session.key()))
            .map(|session| (session.key().clone(), session.handle.id))
            .collect();

        debug!(members = members.len(), "view changed");
        *self.members.write() = members;

        if let Some((id, provider)) = departed_provider {
            let _finished =
                self.finish_requester(id, Err(TransferError::ProviderDeparted { provider }));
        }

        for (requester, id) in departed_requesters {
            let error = TransferError::RequesterDeparted {
                requester: requester.clone(),
            };
            let _finished = self.finish_provider(&requester, id, Err(error), false).await;
        }
    }

    /// Fails every session with `peer` after the bus reported a fault on it.
    pub(crate) async fn handle_exception(&self, peer: &PeerId, error: &Report) {
        let reason = format!("{error:#}");

        if let Some((id, provider)) = self.current_requester() {
            if provider == *peer {
                let _finished = self.finish_requester(
                    id,
                    Err(TransferError::Bus {
                        reason: reason.clone(),
                    }),
                );
            }
        }

        if let Some(handle) = self.provider_handle(peer) {
            let _finished = self
                .finish_provider(peer, handle.id, Err(TransferError::Bus { reason }), false)
                .await;
        }
    }

    pub(crate) async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some((id, _)) = self.current_requester() {
            let _finished = self.finish_requester(id, Err(TransferError::Stopped));
        }

        let serving: Vec<(PeerId, u64)> = self
            .providing
            .iter()
            .map(|session| (session.key().clone(), session.handle.id))
            .collect();

        for (requester, id) in serving {
            let _finished = self
                .finish_provider(&requester, id, Err(TransferError::Stopped), true)
                .await;
        }

        self.transport.stop().await;

        info!(local = %self.local, "state transfer stopped");
    }

    // =========================================================================
    // Requester side
    // =========================================================================

    pub(crate) async fn fetch_state(
        self: &Arc<Self>,
        provider: Option<PeerId>,
        timeout: Duration,
    ) -> Result<u64, TransferError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransferError::Stopped);
        }

        let provider = match provider {
            Some(provider) => provider,
            None => self.default_provider().ok_or(TransferError::NoProvider)?,
        };

        if provider == self.local {
            return Err(TransferError::NoProvider);
        }

        let (done, mut result) = oneshot::channel();
        let handle = self.begin_requester(provider.clone(), done)?;

        info!(%provider, "requesting state");

        if let Err(err) = self.bus.send(&provider, StateMessage::request()).await {
            let _finished = self.finish_requester(handle.id, Err(bus_error(&err)));
        }

        match time::timeout(timeout, &mut result).await {
            Ok(outcome) => outcome.unwrap_or(Err(TransferError::Stopped)),
            Err(_elapsed) => {
                let _finished = self.finish_requester(handle.id, Err(TransferError::Timeout));
                result.await.unwrap_or(Err(TransferError::Stopped))
            }
        }
    }

    fn begin_requester(
        &self,
        provider: PeerId,
        done: oneshot::Sender<Result<u64, TransferError>>,
    ) -> Result<SessionHandle, TransferError> {
        let handle = self.next_handle();

        {
            let mut slot = self.requester.lock();
            if slot.is_some() {
                return Err(TransferError::InProgress);
            }

            *slot = Some(RequesterSession {
                provider,
                state: RequesterState::AwaitingProviderAddress,
                handle: handle.clone(),
                barrier: None,
                done: Some(done),
            });
            *self.requester_state.lock() = RequesterState::AwaitingProviderAddress;
        }

        if self.config.digest {
            // The barrier is closed outside the session lock; if the session
            // ended meanwhile the guard is dropped and the barrier reopens.
            let guard = BarrierGuard::close(Arc::clone(&self.delivery));

            let unclaimed = {
                let mut slot = self.requester.lock();
                match slot.as_mut() {
                    Some(session) if session.handle.id == handle.id => {
                        session.barrier = Some(guard);
                        None
                    }
                    _ => Some(guard),
                }
            };

            drop(unclaimed);
        }

        Ok(handle)
    }

    async fn handle_state_response(
        self: &Arc<Self>,
        provider: PeerId,
        rendezvous: Option<Rendezvous>,
        digest: Option<Digest>,
    ) {
        let (handle, barrier) = {
            let mut slot = self.requester.lock();

            let Some(session) = slot.as_mut() else {
                debug!(%provider, "unsolicited state response");
                return;
            };

            if session.provider != provider
                || session.state != RequesterState::AwaitingProviderAddress
            {
                warn!(%provider, expected = %session.provider, "unexpected state response");
                return;
            }

            session.state = RequesterState::Receiving;
            *self.requester_state.lock() = RequesterState::Receiving;
            (session.handle.clone(), session.barrier.take())
        };

        if let Some(digest) = digest {
            debug!(%provider, senders = digest.len(), "installing provider digest");

            if let Err(err) = self.delivery.install_digest(digest) {
                drop(barrier);
                let error = TransferError::Digest {
                    reason: format!("{err:#}"),
                };
                let _finished = self.finish_requester(handle.id, Err(error));
                return;
            }
        }

        if let Some(barrier) = barrier {
            let _reopened = barrier.reopen();
        }

        self.emit(TransferEvent::InputStreamReady {
            provider: provider.clone(),
        });

        let handoff = match self
            .transport
            .prepare_requester_side(&provider, rendezvous, &handle)
        {
            Ok(handoff) => handoff,
            Err(err) => {
                let _finished = self.finish_requester(handle.id, Err(err));
                return;
            }
        };

        let ctx = Arc::clone(self);
        drop(tokio::spawn(async move {
            ctx.receive(handle, provider, handoff).await;
        }));
    }

    /// Opens the state input, connecting first if the transport needs to, and
    /// hands it to the application.
    async fn receive(
        self: Arc<Self>,
        handle: SessionHandle,
        provider: PeerId,
        handoff: RequesterHandoff,
    ) {
        let mut input = match handoff {
            RequesterHandoff::Input(input) => input,
            RequesterHandoff::Connect(rendezvous) => match self
                .transport
                .connect_requester_side(&self, &provider, rendezvous, &handle)
                .await
            {
                Ok(input) => input,
                Err(err) => {
                    let _finished = self.finish_requester(handle.id, Err(err));
                    return;
                }
            },
        };

        if self.current_requester().map(|(id, _)| id) != Some(handle.id) {
            input.close().await;
            return;
        }

        self.consume(handle, provider, input).await;
    }

    /// Runs the application's `set_state`.
    async fn consume(
        &self,
        handle: SessionHandle,
        provider: PeerId,
        mut input: Box<dyn StateInput>,
    ) {
        debug!(%provider, "handing state input to the application");

        let applied = self.listener.set_state(input.as_mut()).await;
        input.close().await;

        let outcome = applied
            .map(|()| input.bytes_read())
            .map_err(|err| transfer_error(&err));

        let _finished = self.finish_requester(handle.id, outcome);
    }

    fn handle_provider_error(&self, provider: &PeerId, reason: String) {
        match self.current_requester() {
            Some((id, current)) if current == *provider => {
                let _finished =
                    self.finish_requester(id, Err(TransferError::ProviderFailed { reason }));
            }
            _ => debug!(%provider, %reason, "provider error for no active transfer"),
        }
    }

    /// Ends the requester session `id`. Returns `false` if it already ended.
    ///
    /// `requester_state` is only written under the `requester` lock, so a
    /// fetch that starts right after this one ended is never overwritten.
    pub(crate) fn finish_requester(&self, id: u64, outcome: Result<u64, TransferError>) -> bool {
        let session = {
            let mut slot = self.requester.lock();
            match slot.as_ref() {
                Some(session) if session.handle.id == id => {
                    *self.requester_state.lock() = if outcome.is_ok() {
                        RequesterState::Completed
                    } else {
                        RequesterState::Failed
                    };
                    slot.take()
                }
                _ => None,
            }
        };

        let Some(mut session) = session else {
            return false;
        };

        session.handle.cancel.cancel();
        self.transport
            .release_requester_side(&session.provider, outcome.as_ref().err());

        if let Some(barrier) = session.barrier.take() {
            let _reopened = barrier.reopen();
        }

        let provider = session.provider;
        let elapsed_ms = session.handle.elapsed_ms();

        match &outcome {
            Ok(bytes) => info!(%provider, bytes, elapsed_ms, "state received"),
            Err(err) => warn!(%provider, %err, elapsed_ms, "state transfer failed"),
        }

        self.emit(TransferEvent::InputStreamClosed {
            provider,
            result: outcome.clone(),
        });

        if let Some(done) = session.done.take() {
            let _unheard = done.send(outcome);
        }

        true
    }

    // =========================================================================
    // Provider side
    // =========================================================================

    async fn handle_state_request(self: &Arc<Self>, requester: PeerId) {
        let handle = self.next_handle();

        // A requester only asks again once its earlier attempt is over on its
        // side, so whatever is still being served for it is stale. The stale
        // session ends without an ERROR, which would fail the new attempt.
        while let Some(stale) = self.provider_handle(&requester) {
            info!(%requester, "state requested again, dropping the earlier transfer");
            let error = TransferError::Superseded {
                requester: requester.clone(),
            };
            let _finished = self.finish_provider(&requester, stale.id, Err(error), false).await;
        }

        let state = if self.config.digest {
            ProviderState::BarrierClosing
        } else {
            ProviderState::Providing
        };

        match self.providing.entry(requester.clone()) {
            Entry::Occupied(_) => {
                warn!(%requester, "concurrent state requests from one requester");
                return;
            }
            Entry::Vacant(slot) => {
                let _session = slot.insert(ProviderSession {
                    handle: handle.clone(),
                    state,
                });
            }
        }

        info!(%requester, "serving state request");

        match self.respond(&requester, &handle).await {
            Ok(ProviderHandoff::Output(output)) => {
                let ctx = Arc::clone(self);
                drop(tokio::spawn(async move {
                    ctx.serve(requester, handle, output).await;
                }));
            }
            Ok(ProviderHandoff::Rendezvous(addr)) => {
                debug!(%requester, %addr, "waiting for requester to connect");
            }
            Err(err) => {
                let _finished = self.finish_provider(&requester, handle.id, Err(err), true).await;
            }
        }
    }

    /// Captures the digest under the barrier and answers the request.
    ///
    /// The barrier is reopened once the response is out; any early return
    /// drops the guard, which reopens it as well.
    async fn respond(
        self: &Arc<Self>,
        requester: &PeerId,
        handle: &SessionHandle,
    ) -> Result<ProviderHandoff, TransferError> {
        let (barrier, digest) = if self.config.digest {
            let barrier = BarrierGuard::close(Arc::clone(&self.delivery));
            let digest = self
                .delivery
                .capture_digest()
                .map_err(|err| TransferError::Digest {
                    reason: format!("{err:#}"),
                })?;
            (Some(barrier), Some(digest))
        } else {
            (None, None)
        };

        let handoff = self
            .transport
            .prepare_provider_side(self, requester, handle)
            .await?;

        let rendezvous = match &handoff {
            ProviderHandoff::Rendezvous(addr) => Some(Rendezvous::from(*addr)),
            ProviderHandoff::Output(_) => None,
        };

        self.bus
            .send(requester, StateMessage::response(rendezvous, digest))
            .await
            .map_err(|err| bus_error(&err))?;

        self.stats.record_request();
        self.set_provider_state(requester, handle.id, ProviderState::Providing);

        if let Some(barrier) = barrier {
            let _reopened = barrier.reopen();
        }

        Ok(handoff)
    }

    /// Runs the application's `get_state` into `output` and ends the session.
    pub(crate) async fn serve(
        &self,
        requester: PeerId,
        handle: SessionHandle,
        mut output: Box<dyn StateOutput>,
    ) {
        self.emit(TransferEvent::OutputStreamReady {
            requester: requester.clone(),
        });

        let outcome = match self.listener.get_state(output.as_mut()).await {
            Ok(()) => output.close().await.map(|()| output.bytes_written()),
            Err(err) => Err(transfer_error(&err)),
        };

        drop(output);

        let _finished = self.finish_provider(&requester, handle.id, outcome, true).await;
    }

    /// Fails provider session `id` if its requester never showed up.
    pub(crate) async fn expire_rendezvous(&self, requester: &PeerId, id: u64) {
        let error = TransferError::RendezvousTimeout {
            requester: requester.clone(),
        };
        let _finished = self.finish_provider(requester, id, Err(error), true).await;
    }

    /// Ends the provider session `id` for `requester`. Returns `false` if it
    /// already ended. With `notify`, a failure is reported to the requester.
    pub(crate) async fn finish_provider(
        &self,
        requester: &PeerId,
        id: u64,
        outcome: Result<u64, TransferError>,
        notify: bool,
    ) -> bool {
        let Some((_, mut session)) = self
            .providing
            .remove_if(requester, |_, session| session.handle.id == id)
        else {
            return false;
        };

        session.handle.cancel.cancel();
        self.transport.release_provider_side(requester);

        let elapsed_ms = session.handle.elapsed_ms();

        match &outcome {
            Ok(bytes) => {
                session.state = ProviderState::Completed;
                info!(%requester, bytes, elapsed_ms, "state provided");
            }
            Err(err) => {
                session.state = ProviderState::Failed;
                warn!(%requester, %err, elapsed_ms, "state provision failed");

                if notify {
                    let message = StateMessage::error(err.to_string());
                    if let Err(send_err) = self.bus.send(requester, message).await {
                        debug!(%requester, error = %send_err, "could not report failure to requester");
                    }
                }
            }
        }

        debug!(%requester, state = ?session.state, "provider session ended");

        self.emit(TransferEvent::OutputStreamClosed {
            requester: requester.clone(),
            result: outcome,
        });

        true
    }
}

pub(crate) fn bus_error(err: &Report) -> TransferError {
    TransferError::Bus {
        reason: format!("{err:#}"),
    }
}

/// Recovers a [`TransferError`] that travelled through an application
/// callback, or wraps the callback's own failure.
fn transfer_error(err: &Report) -> TransferError {
    err.downcast_ref::<TransferError>()
        .cloned()
        .unwrap_or_else(|| TransferError::application(err))
}
