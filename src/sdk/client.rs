use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ClientConfig, ConfigError, ConnectOptions};
use crate::crypto::SessionKey;
use crate::handshake::HandshakeContext;
use crate::messages::ContentTypeToServer;
use crate::session::{
    DisconnectionReason, QuerySession, SendError, SessionFault, SessionState,
};
use crate::transport::{QueryConnector, TcpConnector};

use super::events::QueryEvents;

/// Errors returned when starting a client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// `connect` was already called on this client.
    #[error("client has already been started")]
    AlreadyStarted,
    /// Configuration or connect options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] ConfigError),
}

/// Remote console client for one query session.
///
/// # Guarantees
/// * The passphrase is hashed once, at construction, and only the derived key
///   is kept.
/// * `connect` succeeds at most once per client; reconnecting needs a new
///   client.
/// * Events are delivered from the background worker, one at a time.
#[derive(Debug)]
pub struct QueryClient {
    config: ClientConfig,
    session: QuerySession,
}

impl QueryClient {
    /// Validates `config` and derives the session key from its password.
    pub fn new(mut config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let key = SessionKey::from_passphrase(&config.password);
        config.password.clear();
        let session = QuerySession::new(&config, &key);
        Ok(Self { config, session })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects over TCP to the configured host and port.
    pub fn connect<E: QueryEvents>(
        &self,
        options: ConnectOptions,
        events: E,
    ) -> Result<JoinHandle<DisconnectionReason>, ClientError> {
        let connector = TcpConnector::new(self.config.address());
        self.connect_with(connector, options, events)
    }

    /// Starts the session over streams produced by `connector`.
    ///
    /// Returns the worker's join handle, which resolves to the disconnection
    /// reason once the session ends. Must be called inside a tokio runtime.
    pub fn connect_with<C, E>(
        &self,
        connector: C,
        options: ConnectOptions,
        events: E,
    ) -> Result<JoinHandle<DisconnectionReason>, ClientError>
    where
        C: QueryConnector + 'static,
        E: QueryEvents,
    {
        if self.session.state() != SessionState::Idle {
            return Err(ClientError::AlreadyStarted);
        }
        let options = options.normalize()?;
        let context = HandshakeContext::new(&self.config, &options);
        self.session
            .start(connector, options, context, Arc::new(events))
            .map_err(|_| ClientError::AlreadyStarted)
    }

    /// Requests a disconnect; the worker stops on its next poll.
    pub fn disconnect(&self) {
        debug!(session = %self.session.id(), "disconnect requested");
        self.session.disconnect();
    }

    /// Sends a raw payload. Empty payloads are accepted and not sent.
    ///
    /// A size-limit rejection leaves the sequence counter and the connection
    /// as they were. A failed or timed-out write ends the session with
    /// `ConnectionLost`, since part of the frame may already be sent.
    pub async fn send(
        &self,
        payload: &[u8],
        content_type: ContentTypeToServer,
    ) -> Result<(), SendError> {
        self.session.send(payload, content_type).await.map(|_| ())
    }

    /// Sends a console command. Blank commands are accepted and not sent.
    pub async fn send_command(&self, command: &str) -> Result<(), SendError> {
        if !self.session.is_connected() {
            return Err(SendError::NotConnected);
        }
        if command.trim().is_empty() {
            return Ok(());
        }
        self.send(command.as_bytes(), ContentTypeToServer::Command)
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn tx_size_limit(&self) -> u16 {
        self.session.tx_size_limit()
    }

    /// Low-level error behind the most recent fault, for diagnostics.
    pub fn last_receive_fault(&self) -> Option<Arc<SessionFault>> {
        self.session.last_receive_fault()
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.session.disconnect();
    }
}
