//! Client side of the challenge handshake.
//!
//! The server opens with a plaintext [`ServerHandshake`]. The client checks
//! its clock and buffer size, settles the outbound size limit and keepalive
//! interval, and answers with a [`ClientHandshake`] that the session layer
//! seals under the pre-shared key. A correct answer is the only proof of the
//! password; nothing is sent back to confirm it.
use std::time::Duration;

use thiserror::Error;

use crate::config::{ClientConfig, ConnectOptions};
use crate::messages::{
    ClientFlags, ClientHandshake, CodecError, ServerHandshake, TIMESTAMP_TOLERANCE_SECS,
};
use crate::session::DisconnectionReason;

/// Smallest receive buffer a server may advertise.
pub const MIN_SERVER_PACKET_SIZE: u16 = 3072;

/// Advertised thresholds above this get the larger keepalive share.
const LONG_THRESHOLD_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed server handshake: {0}")]
    Malformed(#[source] CodecError),
    #[error("server clock {server} differs from local clock {local} by more than {tolerance}s")]
    ClockSkew {
        server: i64,
        local: i64,
        tolerance: u64,
    },
    #[error("server receive buffer {advertised} is below the {minimum} byte minimum")]
    ServerRxBufferTooSmall { advertised: u16, minimum: u16 },
    #[error("handshake response could not be built: {0}")]
    Response(#[source] CodecError),
    #[error("handshake response could not be sent: {0}")]
    ResponseSend(String),
}

impl HandshakeError {
    pub fn reason(&self) -> DisconnectionReason {
        match self {
            HandshakeError::Malformed(_) | HandshakeError::ClockSkew { .. } => {
                DisconnectionReason::HandshakeValidationFailed
            }
            HandshakeError::ServerRxBufferTooSmall { .. } => {
                DisconnectionReason::ServerRxBufferToSmall
            }
            HandshakeError::Response(_) | HandshakeError::ResponseSend(_) => {
                DisconnectionReason::SendingHandshakeResponseFailed
            }
        }
    }
}

/// Keepalive interval derived from the server's idle threshold.
///
/// Long thresholds keep 80% of the window, short ones 65%, so the noop
/// lands well before the server gives up on the connection.
pub fn liveness_from_threshold(threshold_ms: u16) -> Duration {
    let threshold = u64::from(threshold_ms);
    let ms = if threshold > LONG_THRESHOLD_MS {
        threshold * 4 / 5
    } else {
        threshold * 13 / 20
    };
    Duration::from_millis(ms)
}

/// Everything the client brings into the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub rx_buffer_size: u16,
    pub tx_size_limit: u16,
    pub flags: ClientFlags,
    pub permissions: u64,
    pub kick_power: u8,
    pub username: Option<String>,
    /// Keepalive interval used when the server advertises no threshold.
    pub default_liveness: Duration,
    pub tolerance_secs: u64,
}

impl HandshakeContext {
    /// Builds a context from the client config and already-normalized options.
    pub fn new(config: &ClientConfig, options: &ConnectOptions) -> Self {
        Self {
            rx_buffer_size: config.rx_buffer_size,
            tx_size_limit: config.tx_size_limit,
            flags: options.flags,
            permissions: options.permissions,
            kick_power: options.kick_power,
            username: options.username.clone(),
            default_liveness: options.connection_timeout(),
            tolerance_secs: TIMESTAMP_TOLERANCE_SECS,
        }
    }

    /// Validates a server handshake payload and builds the response.
    pub fn negotiate(&self, payload: &[u8], now: i64) -> Result<Negotiated, HandshakeError> {
        let server = ServerHandshake::decode(payload).map_err(HandshakeError::Malformed)?;

        if !server.validate_at(now, self.tolerance_secs) {
            return Err(HandshakeError::ClockSkew {
                server: server.timestamp,
                local: now,
                tolerance: self.tolerance_secs,
            });
        }
        if server.max_packet_size < MIN_SERVER_PACKET_SIZE {
            return Err(HandshakeError::ServerRxBufferTooSmall {
                advertised: server.max_packet_size,
                minimum: MIN_SERVER_PACKET_SIZE,
            });
        }

        let tx_size_limit = self.tx_size_limit.min(server.max_packet_size);
        let liveness = match server.timeout_threshold_ms {
            Some(threshold) if threshold > 0 => liveness_from_threshold(threshold),
            _ => self.default_liveness,
        };

        let response = ClientHandshake::with_timestamp(
            self.rx_buffer_size,
            now,
            server.challenge,
            self.flags,
            self.permissions,
            self.kick_power,
            self.username.clone(),
        )
        .map_err(HandshakeError::Response)?;

        Ok(Negotiated {
            server,
            tx_size_limit,
            liveness,
            response,
        })
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub server: ServerHandshake,
    pub tx_size_limit: u16,
    pub liveness: Duration,
    pub response: ClientHandshake,
}
