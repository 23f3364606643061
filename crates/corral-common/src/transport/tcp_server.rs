use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{CorralError, Result};
use crate::protocol::{Request, Response};
use crate::shutdown::Shutdown;
use crate::transport::codec::JsonCodec;
use crate::transport::tcp::TcpTransport;

/// Accept loop serving length-prefixed JSON frames.
///
/// Each connection is kept alive and processes requests sequentially until
/// the peer closes it.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| CorralError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| CorralError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Serves requests with `handler` until `shutdown` fires.
    ///
    /// Handler errors are turned into error responses coded with their kind;
    /// they never close the connection.
    pub async fn run_with_handler<F, Fut>(&self, handler: F, shutdown: Shutdown) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => {
                    tracing::debug!("tcp server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            tracing::debug!(peer = %peer_addr, "connection established");

            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.wait() => {}
                    result = handle_connection(stream, handler) => {
                        if let Err(e) = result {
                            tracing::debug!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    }
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    loop {
        let buf = match TcpTransport::receive_message(&mut stream).await {
            Ok(buf) => buf,
            // Peer hung up between frames.
            Err(CorralError::Connection(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let request = match JsonCodec::decode_request(&buf) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode request");
                send_response(&mut stream, &Response::error(0, e.to_string())).await?;
                continue;
            }
        };

        let request_id = request.id;
        let response = match handler(request).await {
            Ok(response) => response,
            Err(e) => Response::from_error(request_id, &e),
        };

        send_response(&mut stream, &response).await?;
    }
}

async fn send_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let encoded = JsonCodec::encode_response(response)?;
    TcpTransport::send_message(stream, &encoded).await
}
