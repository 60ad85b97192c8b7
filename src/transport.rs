//! Framed TCP transport
//!
//! Owns one stream socket to one outstation and speaks whole APDUs: a
//! length-prefixed send that either writes the complete frame or fails, and
//! an exact-length receive that reads the two-octet APCI header first and
//! then the declared remainder. Control fields are not interpreted here;
//! raw frame bytes go to the protocol engine, which hands them to the codec.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::frame::{Apdu, APDU_LEN_MAX, APDU_LEN_MIN, START_BYTE};
use crate::error::{Iec104Error, Result};
use crate::util::format_hex_pretty;

/// Default IEC 60870-5-104 TCP port.
pub const DEFAULT_PORT: u16 = 2404;

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Remote host address
    pub host: String,
    /// Remote port number
    pub port: u16,
    /// Connection establishment timeout (t0)
    pub connect_timeout: Duration,
    /// Enable SO_KEEPALIVE on the connected socket
    pub keep_alive: bool,
    /// Disable Nagle so small frames are pushed immediately
    pub no_delay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(30),
            keep_alive: true,
            no_delay: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Iec104Error::config("host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Iec104Error::config("port cannot be zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Iec104Error::config("connect timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Byte and frame counters shared by both halves of a split transport
#[derive(Debug, Default)]
pub struct TransportStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// A connected, framed TCP transport
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    endpoint: String,
    stats: Arc<TransportStats>,
}

impl Transport {
    /// Establish the TCP session within the configured t0 window and apply
    /// socket options (NoDelay, keep-alive).
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint();
        debug!(endpoint = %endpoint, "connecting");

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Iec104Error::ConnectRefused(format!("{endpoint}: {e}")));
            }
            Ok(Err(e)) => {
                return Err(Iec104Error::ReadError(format!(
                    "failed to connect to {endpoint}: {e}"
                )));
            }
            Err(_) => {
                return Err(Iec104Error::ConnectTimeout(format!(
                    "{endpoint} after {:?}",
                    config.connect_timeout
                )));
            }
        };

        if config.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(endpoint = %endpoint, "failed to set TCP_NODELAY: {e}");
            }
        }
        if config.keep_alive {
            let sock = socket2::SockRef::from(&stream);
            if let Err(e) = sock.set_keepalive(true) {
                warn!(endpoint = %endpoint, "failed to set SO_KEEPALIVE: {e}");
            }
        }

        debug!(endpoint = %endpoint, "connected");
        Ok(Self {
            stream,
            endpoint,
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.stats.snapshot()
    }

    /// Write one frame; all-or-nothing at this boundary.
    pub async fn send_frame(&mut self, frame: &Apdu) -> Result<()> {
        let data = frame.encode()?;
        write_frame_bytes(&mut self.stream, &data, &self.stats).await
    }

    /// Read exactly one frame, honoring an optional deadline.
    ///
    /// Yields the raw frame bytes (header included). A peer that closes the
    /// socket mid-frame or before one surfaces as `Disconnected`.
    pub async fn recv_frame(&mut self, deadline: Option<Duration>) -> Result<bytes::Bytes> {
        match deadline {
            Some(limit) => match timeout(limit, read_frame_bytes(&mut self.stream, &self.stats)).await {
                Ok(result) => result,
                Err(_) => Err(Iec104Error::ReadTimeout(format!(
                    "no frame within {limit:?}"
                ))),
            },
            None => read_frame_bytes(&mut self.stream, &self.stats).await,
        }
    }

    /// Non-blocking: any data readable right now.
    pub fn available(&self) -> bool {
        self.stream.readable().now_or_never().is_some()
    }

    /// Split into independently owned read and write halves for the
    /// engine's receive task / send path. Stats stay shared.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        let reader = FrameReader {
            half: read_half,
            endpoint: self.endpoint.clone(),
            stats: Arc::clone(&self.stats),
        };
        let writer = FrameWriter {
            half: write_half,
            endpoint: self.endpoint,
            stats: self.stats,
        };
        (reader, writer)
    }
}

/// Read half of a split transport
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    endpoint: String,
    stats: Arc<TransportStats>,
}

impl FrameReader {
    /// Block until one complete frame arrives.
    pub async fn read_frame(&mut self) -> Result<bytes::Bytes> {
        read_frame_bytes(&mut self.half, &self.stats).await
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Write half of a split transport
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
    endpoint: String,
    stats: Arc<TransportStats>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: &Apdu) -> Result<()> {
        let data = frame.encode()?;
        write_frame_bytes(&mut self.half, &data, &self.stats).await
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.stats.snapshot()
    }
}

async fn write_frame_bytes<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
    stats: &TransportStats,
) -> Result<()> {
    writer
        .write_all(data)
        .await
        .map_err(|e| Iec104Error::WriteError(e.to_string()))?;
    stats.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    debug!(hex_data = %format_hex_pretty(data), length = data.len(), direction = "send", "raw frame");
    Ok(())
}

/// Read the two-octet APCI header, validate start and length, then read the
/// declared remainder. Returns the whole frame including the header.
async fn read_frame_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    stats: &TransportStats,
) -> Result<bytes::Bytes> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await.map_err(map_read_error)?;

    if header[0] != START_BYTE {
        return Err(Iec104Error::BadStartByte(header[0]));
    }
    let length = header[1];
    if !(APDU_LEN_MIN..=APDU_LEN_MAX).contains(&length) {
        return Err(Iec104Error::BadLength(length));
    }

    let mut buf = vec![0u8; length as usize + 2];
    buf[..2].copy_from_slice(&header);
    reader
        .read_exact(&mut buf[2..])
        .await
        .map_err(map_read_error)?;

    stats
        .bytes_received
        .fetch_add(buf.len() as u64, Ordering::Relaxed);
    stats.frames_received.fetch_add(1, Ordering::Relaxed);
    debug!(hex_data = %format_hex_pretty(&buf), length = buf.len(), direction = "recv", "raw frame");
    Ok(bytes::Bytes::from(buf))
}

fn map_read_error(e: std::io::Error) -> Iec104Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => {
            Iec104Error::Disconnected("connection closed by peer".to_string())
        }
        _ => Iec104Error::ReadError(e.to_string()),
    }
}
