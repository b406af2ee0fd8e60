use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::encryption::{Encryptor, Negotiated};
use super::error::PeerError;
use crate::constants::{CONNECTION_TIMEOUT, HANDSHAKE_LEN, MAX_FRAME_SIZE, WRITE_TIMEOUT};
use crate::message::{DecodeContext, Handshake, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Any bidirectional byte stream a peer can be reached over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound transports.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Plain TCP with a connect timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(CONNECTION_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let limit = self.timeout;
        Box::pin(async move {
            let stream = timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Receiving half of a connection. Reads exactly one frame per call and
/// decrypts bytes as they arrive.
pub struct PeerReader {
    stream: ReadHalf<BoxedStream>,
    buf: BytesMut,
    decryptor: Encryptor,
    max_frame: usize,
}

impl PeerReader {
    pub fn new(stream: ReadHalf<BoxedStream>, decryptor: Encryptor) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
            decryptor,
            max_frame: MAX_FRAME_SIZE,
        }
    }

    /// Queues already decrypted bytes ahead of anything read from the
    /// stream.
    pub fn with_initial(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    async fn fill(&mut self, needed: usize) -> Result<(), PeerError> {
        while self.buf.len() < needed {
            let start = self.buf.len();
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
            self.decryptor.apply(&mut self.buf[start..]);
        }
        Ok(())
    }

    pub async fn read_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.buf.split_to(HANDSHAKE_LEN);
        Ok(Handshake::decode(&data)?)
    }

    /// Reads one length-prefixed frame, prefix included.
    pub async fn read_frame(&mut self) -> Result<Bytes, PeerError> {
        self.fill(4).await?;
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > self.max_frame {
            return Err(PeerError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                length, self.max_frame
            )));
        }

        self.fill(4 + length).await?;
        Ok(self.buf.split_to(4 + length).freeze())
    }

    pub async fn read_message(&mut self, ctx: &DecodeContext<'_>) -> Result<Message, PeerError> {
        let frame = self.read_frame().await?;
        Ok(Message::decode(&frame, ctx)?)
    }
}

/// Sending half of a connection. Frames are encoded into a reused buffer,
/// encrypted in place and written whole.
pub struct PeerWriter {
    stream: WriteHalf<BoxedStream>,
    buf: Vec<u8>,
    encryptor: Encryptor,
}

impl PeerWriter {
    pub fn new(stream: WriteHalf<BoxedStream>, encryptor: Encryptor) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(32 * 1024),
            encryptor,
        }
    }

    pub async fn write_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.buf.clear();
        self.buf.resize(handshake.byte_len(), 0);
        handshake.encode_into(&mut self.buf, 0)?;
        self.flush_buf().await
    }

    /// Writes `message` and returns the frame size.
    pub async fn write_message(&mut self, message: &Message) -> Result<usize, PeerError> {
        self.buf.clear();
        self.buf.resize(message.byte_len(), 0);
        let written = message.encode_into(&mut self.buf, 0)?;
        self.buf.truncate(written);
        self.flush_buf().await?;
        Ok(written)
    }

    async fn flush_buf(&mut self) -> Result<(), PeerError> {
        self.encryptor.apply(&mut self.buf);
        timeout(WRITE_TIMEOUT, async {
            self.stream.write_all(&self.buf).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}

/// Splits a negotiated stream into its reader and writer.
pub(crate) fn split(stream: BoxedStream, negotiated: Negotiated) -> (PeerReader, PeerWriter) {
    let (read, write) = tokio::io::split(stream);
    let reader = PeerReader::new(read, negotiated.decryptor).with_initial(&negotiated.initial);
    (reader, PeerWriter::new(write, negotiated.encryptor))
}

impl std::fmt::Debug for PeerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerReader")
            .field("buffered", &self.buf.len())
            .field("max_frame", &self.max_frame)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PeerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWriter")
            .field("plain_text", &self.encryptor.is_plain_text())
            .finish_non_exhaustive()
    }
}
