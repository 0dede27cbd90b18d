use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Instant};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::{
    DisconnectionReason, SessionFault, SessionState, Shared, KEEPALIVE_COMMAND,
};
use crate::config::ConnectOptions;
use crate::framing::{QueryFrameCodec, LENGTH_PREFIX_SIZE};
use crate::handshake::{HandshakeContext, HandshakeError};
use crate::messages::{unix_now, ContentTypeToServer, InboundMessage};
use crate::sdk::QueryEvents;
use crate::transport::QueryConnector;

/// Why the read loop stopped.
enum Exit {
    Requested,
    Fault(SessionFault),
}

impl From<SessionFault> for Exit {
    fn from(fault: SessionFault) -> Self {
        Exit::Fault(fault)
    }
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    options: ConnectOptions,
    context: HandshakeContext,
    events: Arc<dyn QueryEvents>,
    codec: QueryFrameCodec,
    rx: BytesMut,
    plaintext: Vec<u8>,
    rx_counter: u32,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        options: ConnectOptions,
        context: HandshakeContext,
        events: Arc<dyn QueryEvents>,
    ) -> Self {
        let capacity = usize::from(shared.rx_buffer_size);
        Self {
            codec: QueryFrameCodec::new(capacity),
            rx: BytesMut::with_capacity(capacity + LENGTH_PREFIX_SIZE),
            plaintext: Vec::with_capacity(capacity),
            rx_counter: 0,
            shared,
            options,
            context,
            events,
        }
    }

    pub(super) async fn run<C: QueryConnector>(mut self, connector: C) -> DisconnectionReason {
        let id = self.shared.id;
        let connect_timeout = self.options.connection_timeout();
        info!(session = %id, "connecting to query server");

        let exit = match time::timeout(connect_timeout, connector.connect()).await {
            Ok(Ok(stream)) => {
                info!(session = %id, "transport established");
                let (reader, writer) = tokio::io::split(stream);
                self.shared
                    .attach_writer(Box::new(writer), self.context.tx_size_limit)
                    .await;
                if let Err(err) = self.shared.transition(SessionState::AwaitingHandshake) {
                    warn!(session = %id, error = %err, "unexpected session state");
                }
                // handshake window opens once the transport is up
                let awaiting_since = Instant::now();
                self.drive(reader, awaiting_since).await
            }
            Ok(Err(err)) => Exit::Fault(SessionFault::Connect(err)),
            Err(_) => Exit::Fault(SessionFault::ConnectTimeout(connect_timeout)),
        };

        self.finish(exit).await
    }

    async fn drive<R>(&mut self, mut reader: R, awaiting_since: Instant) -> Exit
    where
        R: AsyncRead + Unpin,
    {
        let poll = self.options.poll_interval();
        let handshake_timeout = self.options.connection_timeout();

        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                return match self.shared.take_write_fault() {
                    Some(fault) => fault.into(),
                    None => Exit::Requested,
                };
            }

            let now = Instant::now();
            if self.shared.state().is_connected() {
                if self.shared.keepalive_due(now) {
                    if let Err(err) = self
                        .shared
                        .send_message(KEEPALIVE_COMMAND, ContentTypeToServer::Command)
                        .await
                    {
                        return SessionFault::Keepalive(err).into();
                    }
                    debug!(session = %self.shared.id, "keepalive sent");
                }
            } else if now.duration_since(awaiting_since) >= handshake_timeout {
                return SessionFault::HandshakeTimeout(handshake_timeout).into();
            }

            match self.codec.decode(&mut self.rx) {
                Ok(Some(frame)) => {
                    if let Err(fault) = self.handle_frame(&frame).await {
                        return fault.into();
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => return SessionFault::Frame(err).into(),
            }

            match time::timeout(poll, reader.read_buf(&mut self.rx)).await {
                Err(_) => {}
                Ok(Ok(0)) => return self.classify_eof().into(),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return SessionFault::Read(err).into(),
            }
        }
    }

    fn classify_eof(&self) -> SessionFault {
        match self.codec.pending_length() {
            Some(expected) => SessionFault::ShortPayload {
                expected,
                buffered: self.rx.len(),
            },
            None if !self.rx.is_empty() => SessionFault::ShortLength {
                buffered: self.rx.len(),
            },
            None => SessionFault::Closed,
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), SessionFault> {
        if self.shared.state().is_connected() {
            self.handle_message(frame)
        } else {
            self.handle_handshake(frame).await
        }
    }

    async fn handle_handshake(&mut self, frame: &[u8]) -> Result<(), SessionFault> {
        let negotiated = self.context.negotiate(frame, unix_now())?;
        self.shared
            .send_handshake(&negotiated.response, negotiated.tx_size_limit)
            .await
            .map_err(|err| HandshakeError::ResponseSend(err.to_string()))?;

        self.shared.arm_keepalive(negotiated.liveness);
        if let Err(err) = self.shared.transition(SessionState::Connected) {
            warn!(session = %self.shared.id, error = %err, "unexpected session state");
        }
        info!(
            session = %self.shared.id,
            tx_size_limit = negotiated.tx_size_limit,
            liveness_ms = negotiated.liveness.as_millis() as u64,
            "handshake accepted"
        );
        self.events.on_connected_to_server();
        Ok(())
    }

    fn handle_message(&mut self, frame: &[u8]) -> Result<(), SessionFault> {
        self.shared.envelope.open_into(frame, &mut self.plaintext)?;
        let message = InboundMessage::decode(&self.plaintext)?;
        if !message.validate(self.rx_counter) {
            return Err(SessionFault::Validation {
                sequence: message.sequence,
                timestamp: message.timestamp,
                last_accepted: self.rx_counter,
            });
        }
        self.rx_counter = message.sequence;
        debug!(
            session = %self.shared.id,
            sequence = message.sequence,
            content_type = ?message.content_type,
            len = message.payload.len(),
            "message received"
        );
        self.events.on_message_received(&message);
        Ok(())
    }

    async fn finish(self, exit: Exit) -> DisconnectionReason {
        let id = self.shared.id;
        let reason = match exit {
            Exit::Requested => DisconnectionReason::DisconnectedByClient,
            Exit::Fault(fault) => {
                let reason = fault.reason();
                warn!(session = %id, %reason, error = %fault, "session fault");
                self.shared.record_fault(fault);
                reason
            }
        };

        self.shared.stop.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            if let Ok(next) = state.transition(SessionState::Disconnected(reason)) {
                *state = next;
            }
        }
        self.shared.detach_writer().await;

        info!(session = %id, ?reason, "disconnected");
        self.events.on_disconnected_from_server(reason);
        reason
    }
}
