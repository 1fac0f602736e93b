//! In-band transfer: state travels as chunk messages over the message bus.

use core::mem;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::{PeerId, Rendezvous, StateMessage, TransferError};
use strata_utils_sync::byte_stream::byte_stream_with_cancel;
use strata_utils_sync::{ByteStreamError, ByteStreamHandle, ByteStreamReader, ByteStreamWriter};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::bus::MessageBus;
use crate::context::{bus_error, TransferContext};
use crate::session::SessionHandle;
use crate::stats::TransferStats;
use crate::stream::{StateInput, StateOutput};
use crate::transport::{ProviderHandoff, RequesterHandoff, StateTransport};

pub(crate) struct ChunkedTransport {
    chunk_size: usize,
    buffer_size: usize,
    inbound: Mutex<Option<Inbound>>,
}

/// Reassembly buffer of the transfer the local member is receiving.
struct Inbound {
    provider: PeerId,
    control: ByteStreamHandle,
    writer: Arc<AsyncMutex<ByteStreamWriter>>,
}

impl ChunkedTransport {
    pub(crate) fn new(config: &StateTransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            buffer_size: config.buffer_size,
            inbound: Mutex::new(None),
        }
    }

    fn take_inbound(&self, provider: &PeerId) -> Option<Inbound> {
        let mut slot = self.inbound.lock();
        match slot.as_ref() {
            Some(inbound) if inbound.provider == *provider => slot.take(),
            _ => None,
        }
    }
}

#[async_trait]
impl StateTransport for ChunkedTransport {
    async fn prepare_provider_side(
        &self,
        ctx: &Arc<TransferContext>,
        requester: &PeerId,
        handle: &SessionHandle,
    ) -> Result<ProviderHandoff, TransferError> {
        let output = ChunkOutput {
            bus: Arc::clone(ctx.bus()),
            stats: Arc::clone(ctx.stats()),
            requester: requester.clone(),
            handle: handle.clone(),
            chunk_size: self.chunk_size,
            buffer: Vec::with_capacity(self.chunk_size),
        };

        Ok(ProviderHandoff::Output(Box::new(output)))
    }

    fn prepare_requester_side(
        &self,
        provider: &PeerId,
        _rendezvous: Option<Rendezvous>,
        handle: &SessionHandle,
    ) -> Result<RequesterHandoff, TransferError> {
        let (writer, reader) = byte_stream_with_cancel(self.buffer_size, handle.cancel.clone());

        let inbound = Inbound {
            provider: provider.clone(),
            control: writer.handle(),
            writer: Arc::new(AsyncMutex::new(writer)),
        };

        if let Some(stale) = self.inbound.lock().replace(inbound) {
            let _aborted = stale.control.abort("superseded by a newer transfer");
        }

        Ok(RequesterHandoff::Input(Box::new(ChunkInput {
            reader,
            handle: handle.clone(),
        })))
    }

    async fn on_chunk(&self, provider: &PeerId, payload: Vec<u8>) {
        let writer = match self.inbound.lock().as_ref() {
            Some(inbound) if inbound.provider == *provider => Arc::clone(&inbound.writer),
            _ => {
                debug!(%provider, len = payload.len(), "state chunk for no active transfer");
                return;
            }
        };

        let mut writer = writer.lock().await;

        if let Err(err) = writer.write(&payload).await {
            debug!(%provider, %err, "dropping state chunk");
        }
    }

    async fn on_eof(&self, provider: &PeerId) {
        if let Some(inbound) = self.take_inbound(provider) {
            let _closed = inbound.control.close();
            debug!(%provider, "end of in-band state");
        }
    }

    fn release_requester_side(&self, provider: &PeerId, reason: Option<&TransferError>) {
        let Some(inbound) = self.take_inbound(provider) else {
            return;
        };

        let _changed = match reason {
            Some(err) => inbound.control.abort(err.to_string()),
            None => inbound.control.close(),
        };
    }
}

/// Provider-side stream that slices state into chunk messages.
struct ChunkOutput {
    bus: Arc<dyn MessageBus>,
    stats: Arc<TransferStats>,
    requester: PeerId,
    handle: SessionHandle,
    chunk_size: usize,
    buffer: Vec<u8>,
}

impl ChunkOutput {
    async fn send_buffered(&mut self) -> Result<(), TransferError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.handle.ensure_writable()?;

        let payload = mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let len = payload.len();

        self.bus
            .send(&self.requester, StateMessage::chunk(payload))
            .await
            .map_err(|err| bus_error(&err))?;

        let _total = self.handle.meter.record(len);

        Ok(())
    }
}

#[async_trait]
impl StateOutput for ChunkOutput {
    async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        self.handle.ensure_writable()?;

        let mut rest = buf;

        while !rest.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.buffer.extend_from_slice(head);
            rest = tail;

            if self.buffer.len() >= self.chunk_size {
                self.send_buffered().await?;
            }
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransferError> {
        self.handle.ensure_writable()?;
        self.send_buffered().await
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if self.handle.meter.is_closed() {
            return Ok(());
        }

        self.send_buffered().await?;

        self.bus
            .send(&self.requester, StateMessage::eof())
            .await
            .map_err(|err| bus_error(&err))?;

        if self.handle.meter.close_once() {
            self.stats.record_bytes(self.handle.meter.bytes());
        }

        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.handle.meter.bytes()
    }
}

/// Requester-side stream fed from the reassembly buffer.
struct ChunkInput {
    reader: ByteStreamReader,
    handle: SessionHandle,
}

#[async_trait]
impl StateInput for ChunkInput {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        if self.handle.meter.is_closed() {
            return Err(TransferError::StreamClosed);
        }

        let read = tokio::select! {
            read = self.reader.read(buf) => read.map_err(|err| stream_error(err, &self.handle))?,
            () = self.handle.cancel.cancelled() => return Err(self.handle.interrupted()),
        };

        let _total = self.handle.meter.record(read);

        Ok(read)
    }

    async fn close(&mut self) {
        if self.handle.meter.close_once() {
            let _closed = self.reader.close();
        }
    }

    fn bytes_read(&self) -> u64 {
        self.handle.meter.bytes()
    }
}

fn stream_error(err: ByteStreamError, handle: &SessionHandle) -> TransferError {
    match err {
        ByteStreamError::Aborted { reason } => TransferError::ProviderFailed { reason },
        ByteStreamError::Interrupted { .. } => handle.interrupted(),
        _ => TransferError::StreamClosed,
    }
}
