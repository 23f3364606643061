//! Shared building blocks for the corral connection layer.
//!
//! - [`error`]: the [`CorralError`] taxonomy used by every crate
//! - [`shutdown`]: the process-wide shutdown broadcast
//! - [`admission`]: ticket-based concurrency limiting
//! - [`protocol`] / [`transport`]: request/response frames and their TCP framing

pub mod admission;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod transport;

pub use admission::{AdmissionConfig, AdmissionController, Ticket};
pub use error::{CorralError, Result};
pub use protocol::{ErrorCode, Request, Response};
pub use shutdown::Shutdown;
