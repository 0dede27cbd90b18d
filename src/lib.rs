//! Client for the SCP: Secret Laboratory query protocol (remote server console).
//!
//! A session runs over one ordered byte stream, normally TCP. Every frame is a
//! big-endian `u16` length followed by its payload. The server opens with a
//! plaintext challenge; everything after it, the client's reply included, is
//! sealed with AES-256-GCM under a key derived from the shared password.
//! Messages carry a sequence number and a unix timestamp and are rejected
//! unless they directly follow the last accepted one and are fresh.
//!
//! [`QueryClient`] is the entry point. It spawns a background worker that
//! owns the read side, answers the handshake, sends keepalives, and reports
//! through [`QueryEvents`].

pub mod config;
pub mod crypto;
pub mod e2e_common;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod pool;
pub mod sdk;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ConnectOptions};
pub use crypto::{CryptoError, Envelope, SessionKey};
pub use framing::{FrameError, QueryFrameCodec};
pub use handshake::{HandshakeContext, HandshakeError};
pub use messages::{
    ClientFlags, ClientHandshake, CodecError, ContentTypeToClient, ContentTypeToServer,
    InboundMessage, OutboundMessage, QueryMessage, RemoteAdminFlags, RemoteAdminResponse,
    ServerHandshake,
};
pub use sdk::{ChannelEvents, ClientError, ClientEvent, NoopEvents, QueryClient, QueryEvents};
pub use session::{
    DisconnectionReason, QuerySession, SendError, SessionFault, SessionState,
};
pub use transport::{QueryConnector, TcpConnector};
