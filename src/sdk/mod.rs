//! High-level client API.
pub mod client;
pub mod events;

pub use client::{ClientError, QueryClient};
pub use events::{ChannelEvents, ClientEvent, NoopEvents, QueryEvents};
