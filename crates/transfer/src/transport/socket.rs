//! Out-of-band transfer: each requester pulls state over its own TCP
//! connection to an address the provider advertised in its response.
//!
//! Wire format, one length-delimited frame after another:
//! the requester's identity first (requester to provider), then state frames
//! (provider to requester) ended by an empty frame. A connection that ends
//! without the empty frame is a truncated transfer.

use core::time::Duration;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use strata_transfer_primitives::config::SocketConfig;
use strata_transfer_primitives::{PeerId, Rendezvous, TransferError};
use strata_utils_sync::AgeOutCache;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::TransferContext;
use crate::session::SessionHandle;
use crate::stats::TransferStats;
use crate::stream::{StateInput, StateOutput};
use crate::transport::pool::{Job, WorkerPool};
use crate::transport::{ProviderHandoff, RequesterHandoff, StateTransport};

const BACKLOG: u32 = 128;

/// Largest frame either side accepts; matches the codec's default limit.
const MAX_FRAME: usize = 8 * 1024 * 1024;

pub(crate) struct SocketTransport {
    config: SocketConfig,
    ctx: Weak<TransferContext>,
    cancel: CancellationToken,
    listening: Mutex<Option<Listening>>,
}

/// Provider-side resources, created on the first request served.
struct Listening {
    addr: SocketAddr,
    acceptor: JoinHandle<()>,
    pool: Arc<WorkerPool>,
    pending: Arc<AgeOutCache<PeerId>>,
}

impl SocketTransport {
    pub(crate) fn new(config: SocketConfig, ctx: Weak<TransferContext>) -> Self {
        Self {
            config,
            ctx,
            cancel: CancellationToken::new(),
            listening: Mutex::new(None),
        }
    }

    fn frame_size(&self) -> usize {
        self.config.socket_buffer_size.clamp(1, MAX_FRAME)
    }

    fn socket_buffer(&self) -> u32 {
        u32::try_from(self.config.socket_buffer_size).unwrap_or(u32::MAX)
    }

    /// Returns the advertised address and the rendezvous cache, binding the
    /// listener if this is the first out-of-band request.
    fn ensure_listening(&self) -> Result<(SocketAddr, Arc<AgeOutCache<PeerId>>), TransferError> {
        let mut listening = self.listening.lock();

        if self.cancel.is_cancelled() {
            return Err(TransferError::Stopped);
        }

        if let Some(listening) = listening.as_ref() {
            return Ok((listening.addr, Arc::clone(&listening.pending)));
        }

        let listener = self.bind()?;
        let bound = listener.local_addr()?;
        let addr = advertised(bound);

        let ctx = Weak::clone(&self.ctx);
        let pending = Arc::new(
            AgeOutCache::new(self.config.rendezvous_timeout).with_handler(
                move |requester: &PeerId| {
                    let Some(ctx) = ctx.upgrade() else {
                        return;
                    };
                    // Pinned now, so a session that replaced this one later
                    // is left alone.
                    let Some(handle) = ctx.provider_handle(requester) else {
                        return;
                    };
                    let requester = requester.clone();
                    drop(tokio::spawn(async move {
                        ctx.expire_rendezvous(&requester, handle.id).await;
                    }));
                },
            ),
        );

        let pool = Arc::new(WorkerPool::new(
            self.config.max_pool,
            self.config.pool_keep_alive,
        ));

        let acceptor = tokio::spawn(accept_loop(
            listener,
            Acceptor {
                ctx: Weak::clone(&self.ctx),
                pool: Arc::clone(&pool),
                pending: Arc::clone(&pending),
                rendezvous_timeout: self.config.rendezvous_timeout,
                frame_size: self.frame_size(),
            },
            self.cancel.clone(),
        ));

        info!(%addr, %bound, max_pool = self.config.max_pool, "listening for state requesters");

        *listening = Some(Listening {
            addr,
            acceptor,
            pool,
            pending: Arc::clone(&pending),
        });

        Ok((addr, pending))
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.bind_port);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket.set_reuseaddr(true)?;
        socket.set_send_buffer_size(self.socket_buffer())?;
        socket.bind(addr)?;

        socket.listen(BACKLOG)
    }

    async fn connect(&self, rendezvous: &Rendezvous) -> io::Result<TcpStream> {
        let mut last_err = None;

        for addr in lookup_host((rendezvous.host.as_str(), rendezvous.port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };

            socket.set_recv_buffer_size(self.socket_buffer())?;

            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(%addr, %err, "rendezvous address unreachable");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("rendezvous {rendezvous} resolved to no address"),
            )
        }))
    }
}

/// A wildcard bind is advertised as the loopback address of its family.
fn advertised(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

#[async_trait]
impl StateTransport for SocketTransport {
    async fn prepare_provider_side(
        &self,
        _ctx: &Arc<TransferContext>,
        requester: &PeerId,
        _handle: &SessionHandle,
    ) -> Result<ProviderHandoff, TransferError> {
        let (addr, pending) = self.ensure_listening()?;
        pending.add(requester.clone());

        Ok(ProviderHandoff::Rendezvous(addr))
    }

    fn prepare_requester_side(
        &self,
        _provider: &PeerId,
        rendezvous: Option<Rendezvous>,
        _handle: &SessionHandle,
    ) -> Result<RequesterHandoff, TransferError> {
        rendezvous
            .map(RequesterHandoff::Connect)
            .ok_or(TransferError::MissingRendezvous)
    }

    async fn connect_requester_side(
        &self,
        ctx: &Arc<TransferContext>,
        provider: &PeerId,
        rendezvous: Rendezvous,
        handle: &SessionHandle,
    ) -> Result<Box<dyn StateInput>, TransferError> {
        debug!(%provider, %rendezvous, "connecting to state provider");

        let stream = tokio::select! {
            connected = time::timeout(self.config.rendezvous_timeout, self.connect(&rendezvous)) => {
                connected.map_err(|_elapsed| TransferError::Timeout)??
            }
            () = handle.cancel.cancelled() => return Err(handle.interrupted()),
        };

        let (read_half, write_half) = stream.into_split();

        let identity = borsh::to_vec(ctx.local())?;
        let mut hello = FramedWrite::new(write_half, LengthDelimitedCodec::new());
        hello.send(Bytes::from(identity)).await?;

        Ok(Box::new(SocketInput::new(read_half, handle.clone())))
    }

    fn release_provider_side(&self, requester: &PeerId) {
        if let Some(listening) = self.listening.lock().as_ref() {
            let _removed = listening.pending.remove(requester);
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();

        let Some(listening) = self.listening.lock().take() else {
            return;
        };

        let Listening {
            addr,
            mut acceptor,
            pool,
            pending,
        } = listening;

        pending.set_handler(None);

        if time::timeout(self.config.acceptor_shutdown_wait, &mut acceptor)
            .await
            .is_err()
        {
            warn!(%addr, "state acceptor did not stop in time, aborting");
            acceptor.abort();
        }

        pool.shutdown(self.config.pool_shutdown_wait).await;

        info!(%addr, "state listener closed");
    }
}

// =============================================================================
// Provider side
// =============================================================================

/// What every accepted connection needs from the transport.
#[derive(Clone)]
struct Acceptor {
    ctx: Weak<TransferContext>,
    pool: Arc<WorkerPool>,
    pending: Arc<AgeOutCache<PeerId>>,
    rendezvous_timeout: Duration,
    frame_size: usize,
}

async fn accept_loop(listener: TcpListener, acceptor: Acceptor, cancel: CancellationToken) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "failed to accept state connection");
                    continue;
                }
            },
        };

        let job: Job = Box::pin(acceptor.clone().serve_connection(stream, peer_addr));

        if acceptor.pool.submit(job).is_err() {
            warn!(%peer_addr, "state transfer pool saturated, dropping connection");
        }
    }

    debug!("state acceptor stopped");
}

impl Acceptor {
    async fn serve_connection(self, stream: TcpStream, peer_addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());

        let requester = match time::timeout(self.rendezvous_timeout, frames.next()).await {
            Ok(Some(Ok(frame))) => match borsh::from_slice::<PeerId>(&frame) {
                Ok(requester) => requester,
                Err(err) => {
                    warn!(%peer_addr, %err, "undecodable requester identity");
                    return;
                }
            },
            Ok(Some(Err(err))) => {
                warn!(%peer_addr, %err, "failed to read requester identity");
                return;
            }
            Ok(None) => {
                debug!(%peer_addr, "connection closed before identifying");
                return;
            }
            Err(_elapsed) => {
                warn!(%peer_addr, "requester did not identify in time");
                return;
            }
        };

        if !self.pending.remove(&requester) {
            warn!(%requester, %peer_addr, "connection from a requester with no pending transfer");
            return;
        }

        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };

        let Some(handle) = ctx.provider_handle(&requester) else {
            debug!(%requester, "provider session ended before the requester connected");
            return;
        };

        debug!(%requester, %peer_addr, "requester connected");

        let output = SocketOutput::new(
            write_half,
            self.frame_size,
            Arc::clone(ctx.stats()),
            handle.clone(),
        );

        ctx.serve(requester, handle, Box::new(output)).await;
    }
}

/// Provider-side stream writing state frames to the requester's connection.
struct SocketOutput<W> {
    frames: FramedWrite<W, LengthDelimitedCodec>,
    frame_size: usize,
    stats: Arc<TransferStats>,
    handle: SessionHandle,
}

impl<W: AsyncWrite + Unpin + Send> SocketOutput<W> {
    fn new(writer: W, frame_size: usize, stats: Arc<TransferStats>, handle: SessionHandle) -> Self {
        Self {
            frames: FramedWrite::new(writer, LengthDelimitedCodec::new()),
            frame_size: frame_size.max(1),
            stats,
            handle,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StateOutput for SocketOutput<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        self.handle.ensure_writable()?;

        for frame in buf.chunks(self.frame_size) {
            tokio::select! {
                fed = self.frames.feed(Bytes::copy_from_slice(frame)) => fed?,
                () = self.handle.cancel.cancelled() => return Err(self.handle.interrupted()),
            }

            let _total = self.handle.meter.record(frame.len());
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransferError> {
        self.handle.ensure_writable()?;

        tokio::select! {
            flushed = SinkExt::<Bytes>::flush(&mut self.frames) => Ok(flushed?),
            () = self.handle.cancel.cancelled() => Err(self.handle.interrupted()),
        }
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if self.handle.meter.is_closed() {
            return Ok(());
        }

        let frames = &mut self.frames;

        tokio::select! {
            ended = async move {
                frames.feed(Bytes::new()).await?;
                SinkExt::<Bytes>::close(frames).await
            } => ended?,
            () = self.handle.cancel.cancelled() => return Err(self.handle.interrupted()),
        }

        if self.handle.meter.close_once() {
            self.stats.record_bytes(self.handle.meter.bytes());
        }

        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.handle.meter.bytes()
    }
}

// =============================================================================
// Requester side
// =============================================================================

/// Requester-side stream unwrapping state frames until the end marker.
struct SocketInput<R> {
    frames: FramedRead<R, LengthDelimitedCodec>,
    pending: Bytes,
    finished: bool,
    handle: SessionHandle,
}

impl<R: AsyncRead + Unpin + Send> SocketInput<R> {
    fn new(reader: R, handle: SessionHandle) -> Self {
        Self {
            frames: FramedRead::new(reader, LengthDelimitedCodec::new()),
            pending: Bytes::new(),
            finished: false,
            handle,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> StateInput for SocketInput<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        if self.handle.meter.is_closed() {
            return Err(TransferError::StreamClosed);
        }

        loop {
            if !self.pending.is_empty() {
                let len = self.pending.len().min(buf.len());
                let head = self.pending.split_to(len);
                buf[..len].copy_from_slice(&head);
                let _total = self.handle.meter.record(len);

                return Ok(len);
            }

            if self.finished || buf.is_empty() {
                return Ok(0);
            }

            let next = tokio::select! {
                next = self.frames.next() => next,
                () = self.handle.cancel.cancelled() => return Err(self.handle.interrupted()),
            };

            match next {
                Some(Ok(frame)) if frame.is_empty() => self.finished = true,
                Some(Ok(frame)) => self.pending = frame.freeze(),
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(TransferError::Truncated {
                        bytes_transferred: self.handle.meter.bytes(),
                    })
                }
            }
        }
    }

    async fn close(&mut self) {
        let _first = self.handle.meter.close_once();
    }

    fn bytes_read(&self) -> u64 {
        self.handle.meter.bytes()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[tokio::test]
    async fn test_input_reads_frames_until_end_marker() {
        let connection = Builder::new()
            .read(&[0, 0, 0, 4])
            .read(b"Bela")
            .read(&[0, 0, 0, 4, b' ', b'B', b'a', b'n'])
            .read(&[0, 0, 0, 0])
            .build();

        let mut input = SocketInput::new(connection, SessionHandle::new(1));
        let mut state = Vec::new();

        let read = input.read_to_end(&mut state).await.unwrap();

        assert_eq!(state, b"Bela Ban", "frames are concatenated");
        assert_eq!(read, 8, "read_to_end reports the total");
        assert_eq!(input.bytes_read(), 8, "meter counts delivered bytes");
        assert_eq!(input.read(&mut [0; 4]).await.unwrap(), 0, "end of state is sticky");
    }

    #[tokio::test]
    async fn test_input_without_end_marker_is_truncated() {
        let connection = Builder::new().read(&[0, 0, 0, 4]).read(b"Bela").build();

        let mut input = SocketInput::new(connection, SessionHandle::new(1));
        let mut state = Vec::new();

        let result = input.read_to_end(&mut state).await;

        assert!(
            matches!(
                result,
                Err(TransferError::Truncated {
                    bytes_transferred: 4
                })
            ),
            "a connection ending without the marker is a failure, got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_output_frames_state_and_ends_with_marker() {
        let mut expected = Vec::new();
        for frame in [&b"Bela"[..], b" Ban", b"!", b""] {
            expected.extend_from_slice(&u32::try_from(frame.len()).unwrap().to_be_bytes());
            expected.extend_from_slice(frame);
        }

        let connection = Builder::new().write(&expected).build();

        let stats = Arc::new(TransferStats::new());
        let mut output = SocketOutput::new(connection, 4, Arc::clone(&stats), SessionHandle::new(1));

        output.write(b"Bela Ban!").await.unwrap();
        output.close().await.unwrap();
        output.close().await.unwrap();

        assert_eq!(output.bytes_written(), 9, "every state byte is counted");
        assert_eq!(stats.num_bytes_sent(), 9, "close records the statistic once");
        assert!(
            matches!(output.write(b"late").await, Err(TransferError::StreamClosed)),
            "writes after close are rejected"
        );
    }

    #[test]
    fn test_wildcard_bind_advertises_loopback() {
        let bound: SocketAddr = "0.0.0.0:7800".parse().unwrap();
        assert_eq!(
            advertised(bound),
            "127.0.0.1:7800".parse::<SocketAddr>().unwrap(),
            "unspecified v4 becomes loopback"
        );

        let bound: SocketAddr = "[::]:7800".parse().unwrap();
        assert_eq!(
            advertised(bound),
            "[::1]:7800".parse::<SocketAddr>().unwrap(),
            "unspecified v6 becomes loopback"
        );

        let bound: SocketAddr = "10.0.0.7:7800".parse().unwrap();
        assert_eq!(advertised(bound), bound, "concrete address is kept");
    }
}
