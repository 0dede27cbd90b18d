//! Scripted server peer and in-memory connectors for end-to-end tests.
use std::error::Error;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;

use crate::crypto::{Envelope, SessionKey};
use crate::framing::{write_frame, QueryFrameCodec, MAX_FRAME_PAYLOAD};
use crate::messages::{
    ClientHandshake, ContentTypeToClient, InboundMessage, OutboundMessage, ServerHandshake,
};
use crate::transport::QueryConnector;

pub type TestResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

/// Connector that hands out one end of an in-memory pipe, once.
#[derive(Debug)]
pub struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
}

impl DuplexConnector {
    /// Returns the connector and the server's end of the pipe.
    pub fn pair(max_buf_size: usize) -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(max_buf_size);
        (
            Self {
                stream: Mutex::new(Some(client)),
            },
            server,
        )
    }
}

#[async_trait]
impl QueryConnector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream already taken"))
    }
}

/// Connector whose every attempt fails with `kind`.
#[derive(Debug, Clone, Copy)]
pub struct RefusingConnector(pub io::ErrorKind);

#[async_trait]
impl QueryConnector for RefusingConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        Err(io::Error::new(self.0, "connection refused by test connector"))
    }
}

/// Connector that waits `delay` before handing off to `inner`.
#[derive(Debug)]
pub struct SlowConnector<C> {
    inner: C,
    delay: Duration,
}

impl<C> SlowConnector<C> {
    pub fn new(inner: C, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<C: QueryConnector> QueryConnector for SlowConnector<C> {
    type Stream = C::Stream;

    async fn connect(&self) -> io::Result<C::Stream> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect().await
    }
}

/// Server side of a query connection, driven step by step from a test.
///
/// Frames are read with the same codec the client uses; message payloads are
/// sealed and opened with the key derived from `password`.
pub struct MockQueryServer<S = DuplexStream> {
    stream: S,
    envelope: Envelope,
    codec: QueryFrameCodec,
    rx: BytesMut,
    tx_counter: u32,
}

impl<S> MockQueryServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, password: &str) -> Self {
        Self {
            stream,
            envelope: Envelope::new(&SessionKey::from_passphrase(password)),
            codec: QueryFrameCodec::new(MAX_FRAME_PAYLOAD),
            rx: BytesMut::with_capacity(1024),
            tx_counter: 0,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Sequence number the next `send_message` will use.
    pub fn next_sequence(&self) -> u32 {
        self.tx_counter.wrapping_add(1)
    }

    /// Runs the server half of the handshake and returns the client's reply.
    ///
    /// Fails if the reply does not echo the issued challenge.
    pub async fn accept(
        &mut self,
        max_packet_size: u16,
        timeout_threshold_ms: Option<u16>,
    ) -> TestResult<ClientHandshake> {
        let mut handshake = ServerHandshake::generate(max_packet_size);
        handshake.timeout_threshold_ms = timeout_threshold_ms;
        self.send_handshake(&handshake).await?;
        let reply = self.read_client_handshake().await?;
        if reply.challenge() != &handshake.challenge {
            return Err("client echoed a different challenge".into());
        }
        Ok(reply)
    }

    pub async fn send_handshake(&mut self, handshake: &ServerHandshake) -> TestResult {
        self.send_raw_frame(&handshake.encode()).await
    }

    pub async fn read_client_handshake(&mut self) -> TestResult<ClientHandshake> {
        let plain = self.read_sealed().await?;
        Ok(ClientHandshake::decode(&plain)?)
    }

    /// Reads and decrypts the next client message. Sequence numbers are left
    /// for the test to check.
    pub async fn read_message(&mut self) -> TestResult<OutboundMessage> {
        let plain = self.read_sealed().await?;
        Ok(OutboundMessage::decode(&plain)?)
    }

    /// Sends the next message in sequence and returns its sequence number.
    pub async fn send_message(
        &mut self,
        content_type: ContentTypeToClient,
        payload: &[u8],
    ) -> TestResult<u32> {
        self.tx_counter = self.tx_counter.wrapping_add(1);
        let message = InboundMessage::new(self.tx_counter, content_type, payload);
        self.send_inbound(&message).await?;
        Ok(self.tx_counter)
    }

    /// Sends `message` as-is, without touching the server's counter.
    pub async fn send_inbound(&mut self, message: &InboundMessage) -> TestResult {
        self.send_sealed(&message.encode()).await
    }

    pub async fn send_sealed(&mut self, plaintext: &[u8]) -> TestResult {
        let mut sealed = Vec::new();
        self.envelope.seal_into(plaintext, &mut sealed)?;
        self.send_raw_frame(&sealed).await
    }

    pub async fn send_raw_frame(&mut self, payload: &[u8]) -> TestResult {
        let mut frame = Vec::with_capacity(payload.len() + 2);
        write_frame(payload, &mut frame)?;
        self.write_raw(&frame).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> TestResult {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> TestResult<BytesMut> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.rx)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.rx).await? == 0 {
                return Err("client closed the stream".into());
            }
        }
    }

    /// Waits until the client closes its side, discarding anything it sends.
    pub async fn expect_closed(&mut self) -> TestResult {
        let mut scratch = [0u8; 256];
        loop {
            match self.stream.read(&mut scratch).await {
                Ok(0) | Err(_) => return Ok(()),
                Ok(_) => {}
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn read_sealed(&mut self) -> TestResult<Vec<u8>> {
        let frame = self.read_frame().await?;
        let mut plain = Vec::new();
        self.envelope.open_into(&frame, &mut plain)?;
        Ok(plain)
    }
}
