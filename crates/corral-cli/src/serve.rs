//! Demo service for `corral serve`.
//!
//! Echoes every request back, gated by an [`AdmissionController`], and keeps
//! itself registered for as long as it runs.

use std::net::IpAddr;
use std::sync::Arc;

use corral_common::transport::TcpServer;
use corral_common::{AdmissionController, Request, Response, Result, Shutdown};
use corral_registry::{Registration, ServiceKind, ServiceRegistry};
use serde_json::json;

/// Request handler that echoes method and args under admission control.
#[derive(Clone)]
pub struct EchoService {
    name: Arc<str>,
    admission: AdmissionController,
}

impl EchoService {
    pub fn new(name: &str, admission: AdmissionController) -> Self {
        Self {
            name: name.into(),
            admission,
        }
    }

    /// Capacity and shutdown rejections come back as errors, which the
    /// server turns into error responses.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let _ticket = self.admission.acquire().await?;
        Ok(Response::success(
            request.id,
            json!({
                "served_by": &*self.name,
                "method": request.method,
                "args": request.args,
            }),
        ))
    }
}

/// Serves `echo` on `server`, registered under `service` at `advertise_ip`,
/// until `shutdown` fires. Deregisters before returning.
pub async fn run_serve(
    server: TcpServer,
    service: ServiceRegistry,
    advertise_ip: IpAddr,
    version: &str,
    echo: EchoService,
    shutdown: Shutdown,
) -> Result<Registration> {
    let port = server.local_addr()?.port();
    let registration = service.register(advertise_ip, port, ServiceKind::Rpc, version).await?;

    let handler = move |request: Request| {
        let echo = echo.clone();
        async move { echo.handle(request).await }
    };
    let served = server.run_with_handler(handler, shutdown).await;

    if let Err(e) = service.deregister(&registration.sequence).await {
        tracing::warn!(sequence = %registration.sequence, error = %e, "failed to deregister");
    }
    served.map(|()| registration)
}
