use std::fmt;
use std::time::Duration;

use corral_common::transport::TcpTransport;
use corral_common::{CorralError, Request, Response, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;

/// Connectivity of a subchannel, or aggregated over a whole channel.
///
/// # Transitions
///
/// ```text
/// Idle -> Connecting -> Ready -> (call error) -> Idle | TransientFailure
///              \-> TransientFailure -> Connecting ...
/// any -> Shutdown (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// Ready and idle connections may be reused; anything else is dead.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectivityState::Ready | ConnectivityState::Idle)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// One TCP connection to one resolved address.
///
/// Starts `Idle` and connects on [`connect`](Self::connect) or on the first
/// call. Any I/O failure drops the stream and moves it to `TransientFailure`;
/// the next connect attempt starts over.
///
/// # Fields
///
/// - `addr`: The `host:port` this subchannel connects to
/// - `transport`: Framing plus socket options such as keepalive
/// - `connect_timeout`: Budget for one TCP connect
/// - `stream`: The live connection, `None` while disconnected
/// - `state`: Current [`ConnectivityState`]
///
/// # Thread Safety
///
/// Calls on one subchannel are serialized by the async stream lock. State
/// reads never wait on that lock, so pickers and the channel can poll
/// `state()` while a call is in flight.
pub struct Subchannel {
    addr: String,
    transport: TcpTransport,
    connect_timeout: Duration,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    state: Mutex<ConnectivityState>,
}

impl Subchannel {
    /// Creates an idle subchannel. Nothing is dialed until the first
    /// [`connect`](Self::connect) or [`call`](Self::call).
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            transport: TcpTransport::new(),
            connect_timeout,
            stream: tokio::sync::Mutex::new(None),
            state: Mutex::new(ConnectivityState::Idle),
        }
    }

    /// Turns on TCP keepalive for every stream this subchannel opens.
    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.transport = self.transport.with_keepalive(idle);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectivityState) {
        let mut state = self.state.lock();
        // Shutdown is terminal.
        if *state != ConnectivityState::Shutdown {
            *state = next;
        }
    }

    /// Establishes the connection if it is not already up.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Connection`] if the subchannel is shut down or the
    ///   connect fails; the state is then `TransientFailure`
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.stream.lock().await;
        self.connect_locked(&mut slot).await
    }

    async fn connect_locked(&self, slot: &mut Option<TcpStream>) -> Result<()> {
        if self.state() == ConnectivityState::Shutdown {
            return Err(CorralError::Connection(format!("subchannel {} is shut down", self.addr)));
        }
        if slot.is_some() {
            return Ok(());
        }

        self.set_state(ConnectivityState::Connecting);
        match self.transport.connect(&self.addr, self.connect_timeout).await {
            Ok(stream) => {
                *slot = Some(stream);
                self.set_state(ConnectivityState::Ready);
                tracing::debug!(addr = %self.addr, "subchannel connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectivityState::TransientFailure);
                tracing::debug!(addr = %self.addr, error = %e, "subchannel connect failed");
                Err(e)
            }
        }
    }

    /// Sends `request` and waits at most `timeout` for the response.
    ///
    /// Requests on one subchannel are serialized over its single stream.
    ///
    /// # Returns
    ///
    /// The raw response frame. A remote failure is still `Ok` here; the
    /// channel converts it with [`Response::into_result`].
    ///
    /// # Errors
    ///
    /// - [`CorralError::Connection`] / [`CorralError::Io`] on a broken
    ///   stream, leaving the state `TransientFailure`
    /// - [`CorralError::Timeout`] when no response arrives in time, leaving
    ///   the state `Idle`
    ///
    /// On any error the stream is dropped and the next call reconnects.
    pub async fn call(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let mut slot = self.stream.lock().await;
        self.connect_locked(&mut slot).await?;

        let Some(stream) = slot.as_mut() else {
            return Err(CorralError::Connection(format!("subchannel {} has no stream", self.addr)));
        };

        let outcome = tokio::time::timeout(timeout, self.transport.send_request(stream, request)).await;
        let error = match outcome {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_) => CorralError::Timeout(timeout.as_millis() as u64),
        };

        // The stream may hold half a frame; never reuse it.
        *slot = None;
        if matches!(error, CorralError::Connection(_) | CorralError::Io(_)) {
            self.set_state(ConnectivityState::TransientFailure);
            tracing::debug!(addr = %self.addr, error = %error, "subchannel lost connection");
        } else {
            self.set_state(ConnectivityState::Idle);
        }
        Err(error)
    }

    /// Closes the connection for good.
    pub async fn shutdown(&self) {
        *self.state.lock() = ConnectivityState::Shutdown;
        self.stream.lock().await.take();
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
