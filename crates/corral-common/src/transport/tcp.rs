use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{CorralError, Result};
use crate::protocol::{Request, Response};
use crate::transport::codec::JsonCodec;

/// Largest frame accepted on either side of a connection.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Length-prefixed JSON framing over TCP.
///
/// Wire format:
///
/// ```text
/// [4-byte length, u32 big-endian] [JSON data]
/// ```
///
/// # Example
///
/// ```no_run
/// use corral_common::transport::TcpTransport;
/// use corral_common::protocol::Request;
/// use serde_json::json;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> corral_common::Result<()> {
/// let transport = TcpTransport::new();
/// let mut stream = transport.connect("127.0.0.1:9001", Duration::from_secs(5)).await?;
///
/// let request = Request::new("echo", json!({"n": 100}));
/// let response = transport.send_request(&mut stream, &request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport {
    keepalive: Option<Duration>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables TCP keepalive on connected streams, probing after `idle` of
    /// silence. `None` leaves the OS default (usually off).
    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    /// Resolves `addr` and connects to the first address that accepts,
    /// giving each attempt at most `timeout`.
    pub async fn connect(&self, addr: &str, timeout: Duration) -> Result<TcpStream> {
        let socket_addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| CorralError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    self.apply_keepalive(&stream);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {}ms", timeout.as_millis())),
            }
        }

        Err(CorralError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Turns on keepalive for `stream` when configured, so the kernel notices
    /// a dead peer even when no call is in flight.
    fn apply_keepalive(&self, stream: &TcpStream) {
        let Some(idle) = self.keepalive else {
            return;
        };
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)) {
            tracing::warn!(error = %e, "failed to enable tcp keepalive");
        }
    }

    /// Writes one request frame and reads one response frame.
    pub async fn send_request(&self, stream: &mut TcpStream, request: &Request) -> Result<Response> {
        let encoded = JsonCodec::encode_request(request)?;
        Self::send_message(stream, &encoded).await?;

        let response_data = Self::receive_message(stream).await?;
        let response = JsonCodec::decode_response(&response_data)?;

        if response.id != request.id && response.id != 0 {
            return Err(CorralError::InvalidResponse(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }

        Ok(response)
    }

    pub async fn send_message(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CorralError::InvalidResponse(format!(
                "Message too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let len = data.len() as u32;

        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data"))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    pub async fn receive_message(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CorralError::InvalidResponse(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading data"))?;

        Ok(buf)
    }

    /// Connection-level failures become `Connection` so the channel marks the
    /// subchannel as failed; everything else stays an `Io` error.
    fn map_io_error(err: std::io::Error, context: &str) -> CorralError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                CorralError::Connection(format!("{}: connection lost", context))
            }
            _ => CorralError::Io(err),
        }
    }
}
