//! Session state, the shared send path, and the background worker that owns
//! the read side of a connection.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::config::{ClientConfig, ConnectOptions};
use crate::crypto::{CryptoError, Envelope, SessionKey};
use crate::framing::{write_frame, FrameError, LENGTH_PREFIX_SIZE};
use crate::handshake::{HandshakeContext, HandshakeError};
use crate::messages::{ClientHandshake, CodecError, ContentTypeToServer, OutboundMessage};
use crate::pool::BufferPool;
use crate::sdk::QueryEvents;
use crate::transport::QueryConnector;

pub mod state;
mod worker;

pub use state::{DisconnectionReason, SessionState, SessionStateError};

/// Payload of the keepalive command.
pub const KEEPALIVE_COMMAND: &[u8] = b"noop";

const POOLED_BUFFERS: usize = 4;
const POOLED_BUFFER_CAPACITY: usize = 1024;

/// Low-level cause retained when a session ends on a fault.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("transport setup failed: {0}")]
    Connect(#[source] io::Error),
    #[error("transport setup did not finish within {0:?}")]
    ConnectTimeout(Duration),
    #[error("no server handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),
    #[error("message {sequence} (timestamp {timestamp}) rejected after sequence {last_accepted}")]
    Validation {
        sequence: u32,
        timestamp: i64,
        last_accepted: u32,
    },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("stream closed by peer")]
    Closed,
    #[error("stream closed with {buffered} of 2 length bytes buffered")]
    ShortLength { buffered: usize },
    #[error("stream closed with {buffered} of {expected} payload bytes buffered")]
    ShortPayload { expected: usize, buffered: usize },
    #[error("write failed part way through a frame: {0}")]
    Write(#[source] io::Error),
    #[error("write did not finish within {0:?}; frame left incomplete")]
    WriteTimeout(Duration),
    #[error("keepalive failed: {0}")]
    Keepalive(#[source] SendError),
}

impl SessionFault {
    pub fn reason(&self) -> DisconnectionReason {
        use DisconnectionReason as R;
        match self {
            SessionFault::Connect(_)
            | SessionFault::ConnectTimeout(_)
            | SessionFault::HandshakeTimeout(_) => R::ConnectionFailed,
            SessionFault::Frame(FrameError::RxBufferSizeExceeded { .. }) => R::RxBufferSizeExceeded,
            SessionFault::Frame(_) => R::ReadError,
            SessionFault::Handshake(err) => err.reason(),
            SessionFault::Crypto(_) => R::DecryptionFailed,
            SessionFault::Codec(_) => R::DeserializationFailed,
            SessionFault::Validation { .. } => R::MessageValidationFailed,
            SessionFault::Read(_) | SessionFault::ShortPayload { .. } => R::ReadError,
            SessionFault::ShortLength { .. } => R::CannotReadLength,
            SessionFault::Closed
            | SessionFault::Write(_)
            | SessionFault::WriteTimeout(_)
            | SessionFault::Keepalive(_) => R::ConnectionLost,
        }
    }
}

/// Why a send was refused.
///
/// `Io` and `Timeout` may leave a partial frame on the wire, so they end the
/// session with `ConnectionLost`. The others are raised before anything is
/// written and leave the connection untouched.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to a server")]
    NotConnected,
    #[error("{size} bytes exceed the tx size limit of {limit}")]
    TxSizeLimitExceeded { size: usize, limit: u16 },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("write did not finish within {0:?}")]
    Timeout(Duration),
}

struct Outbound {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    tx_counter: u32,
    tx_size_limit: u16,
}

/// Fault to end the session with when `err` left the stream mid-frame.
fn broken_stream_fault(err: &SendError) -> Option<SessionFault> {
    match err {
        SendError::Io(source) => Some(SessionFault::Write(io::Error::new(
            source.kind(),
            source.to_string(),
        ))),
        SendError::Timeout(after) => Some(SessionFault::WriteTimeout(*after)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct KeepaliveTimer {
    interval: Duration,
    due: Instant,
}

struct Shared {
    id: Uuid,
    state: Mutex<SessionState>,
    stop: AtomicBool,
    last_fault: Mutex<Option<Arc<SessionFault>>>,
    write_fault: Mutex<Option<SessionFault>>,
    outbound: tokio::sync::Mutex<Option<Outbound>>,
    keepalive: Mutex<Option<KeepaliveTimer>>,
    tx_size_limit: AtomicU16,
    envelope: Envelope,
    pool: BufferPool,
    rx_buffer_size: u16,
    io_timeout: Duration,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionStateError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(())
    }

    fn record_fault(&self, fault: SessionFault) -> Arc<SessionFault> {
        let fault = Arc::new(fault);
        *self.last_fault.lock() = Some(Arc::clone(&fault));
        fault
    }

    /// Write-side fault that asked the worker to stop, if any.
    fn take_write_fault(&self) -> Option<SessionFault> {
        self.write_fault.lock().take()
    }

    fn keepalive_due(&self, now: Instant) -> bool {
        let timer = *self.keepalive.lock();
        timer.map_or(false, |timer| now >= timer.due)
    }

    fn arm_keepalive(&self, interval: Duration) {
        *self.keepalive.lock() = Some(KeepaliveTimer {
            interval,
            due: Instant::now() + interval,
        });
    }

    async fn attach_writer(&self, writer: Box<dyn AsyncWrite + Send + Unpin>, tx_size_limit: u16) {
        self.tx_size_limit.store(tx_size_limit, Ordering::Release);
        *self.outbound.lock().await = Some(Outbound {
            writer,
            tx_counter: 0,
            tx_size_limit,
        });
    }

    /// Shuts the write half down and drops it.
    async fn detach_writer(&self) {
        *self.keepalive.lock() = None;
        if let Some(mut out) = self.outbound.lock().await.take() {
            let _ = time::timeout(self.io_timeout, out.writer.shutdown()).await;
        }
    }

    /// Seals and writes the handshake response. The negotiated size limit
    /// applies from this frame on.
    async fn send_handshake(
        &self,
        response: &ClientHandshake,
        tx_size_limit: u16,
    ) -> Result<(), SendError> {
        let mut guard = self.outbound.lock().await;
        let out = guard.as_mut().ok_or(SendError::NotConnected)?;
        out.tx_size_limit = tx_size_limit;
        self.tx_size_limit.store(tx_size_limit, Ordering::Release);

        let mut plain = self.pool.acquire();
        response.encode_into(&mut plain);
        self.write_sealed(out, &plain).await
    }

    /// Sends one sequenced message and returns its sequence number.
    ///
    /// The sequence counter is advanced before encoding and restored when the
    /// send is refused before writing, so the server never sees a gap. A write
    /// that fails or times out drops the writer and stops the session.
    async fn send_message(
        &self,
        payload: &[u8],
        content_type: ContentTypeToServer,
    ) -> Result<u32, SendError> {
        let mut guard = self.outbound.lock().await;
        let out = match guard.as_mut() {
            Some(out) if self.state().is_connected() => out,
            _ => return Err(SendError::NotConnected),
        };

        out.tx_counter = out.tx_counter.wrapping_add(1);
        let sequence = out.tx_counter;

        let message = OutboundMessage::new(sequence, content_type, payload);
        let mut plain = self.pool.acquire();
        message.encode_into(&mut plain);

        let written = self.write_sealed(out, &plain).await;
        match written {
            Ok(()) => {
                if let Some(timer) = self.keepalive.lock().as_mut() {
                    timer.due = Instant::now() + timer.interval;
                }
                Ok(sequence)
            }
            Err(err) => {
                match broken_stream_fault(&err) {
                    Some(fault) => {
                        *guard = None;
                        *self.write_fault.lock() = Some(fault);
                        self.stop.store(true, Ordering::Release);
                    }
                    None => out.tx_counter = out.tx_counter.wrapping_sub(1),
                }
                Err(err)
            }
        }
    }

    async fn write_sealed(&self, out: &mut Outbound, plaintext: &[u8]) -> Result<(), SendError> {
        let limit = out.tx_size_limit;
        if plaintext.len() > usize::from(limit) {
            return Err(SendError::TxSizeLimitExceeded {
                size: plaintext.len(),
                limit,
            });
        }

        let mut sealed = self.pool.acquire();
        self.envelope.seal_into(plaintext, &mut sealed)?;
        let frame_len = LENGTH_PREFIX_SIZE + sealed.len();
        if frame_len > usize::from(limit) {
            return Err(SendError::TxSizeLimitExceeded {
                size: frame_len,
                limit,
            });
        }

        let mut frame = self.pool.acquire();
        write_frame(&sealed, &mut *frame)?;

        let writer = &mut out.writer;
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<_, io::Error>(())
        };
        match time::timeout(self.io_timeout, write).await {
            Ok(result) => result.map_err(SendError::Io),
            Err(_) => Err(SendError::Timeout(self.io_timeout)),
        }
    }
}

/// Handle to one query session. Clones share the same session.
///
/// A session runs at most once: after it reaches `Disconnected` a new one has
/// to be created to reconnect.
#[derive(Clone)]
pub struct QuerySession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl QuerySession {
    pub fn new(config: &ClientConfig, key: &SessionKey) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state: Mutex::new(SessionState::Idle),
                stop: AtomicBool::new(false),
                last_fault: Mutex::new(None),
                write_fault: Mutex::new(None),
                outbound: tokio::sync::Mutex::new(None),
                keepalive: Mutex::new(None),
                tx_size_limit: AtomicU16::new(config.tx_size_limit),
                envelope: Envelope::new(key),
                pool: BufferPool::new(POOLED_BUFFERS, POOLED_BUFFER_CAPACITY),
                rx_buffer_size: config.rx_buffer_size,
                io_timeout: config.io_timeout(),
            }),
        }
    }

    /// Moves the session out of `Idle` and spawns its worker.
    ///
    /// `options` must already be normalized. Fails if the session was
    /// started before.
    pub fn start<C>(
        &self,
        connector: C,
        options: ConnectOptions,
        context: HandshakeContext,
        events: Arc<dyn QueryEvents>,
    ) -> Result<JoinHandle<DisconnectionReason>, SessionStateError>
    where
        C: QueryConnector + 'static,
    {
        self.shared.transition(SessionState::Connecting)?;
        let worker = worker::Worker::new(Arc::clone(&self.shared), options, context, events);
        Ok(tokio::spawn(worker.run(connector)))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// False as soon as a stop is pending, even before the worker has
    /// reached `Disconnected`.
    pub fn is_connected(&self) -> bool {
        self.shared.state().is_connected() && !self.shared.stop.load(Ordering::Acquire)
    }

    /// Current outbound frame limit; lowered to the server's size once the
    /// handshake completes.
    pub fn tx_size_limit(&self) -> u16 {
        self.shared.tx_size_limit.load(Ordering::Acquire)
    }

    /// Asks the worker to stop. Observed on its next loop iteration.
    pub fn disconnect(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Most recent low-level fault that ended or broke the session.
    pub fn last_receive_fault(&self) -> Option<Arc<SessionFault>> {
        self.shared.last_fault.lock().clone()
    }

    /// Seals and sends `payload`. An empty payload is accepted and dropped.
    pub async fn send(
        &self,
        payload: &[u8],
        content_type: ContentTypeToServer,
    ) -> Result<Option<u32>, SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if payload.is_empty() {
            return Ok(None);
        }
        self.shared.send_message(payload, content_type).await.map(Some)
    }
}
