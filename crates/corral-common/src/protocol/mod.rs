//! Request/response frames exchanged between a channel and an endpoint.

pub mod requests;
pub mod responses;


pub use requests::{MethodName, Request, RequestId, RpcArgs};
pub use responses::{ErrorCode, Response, RpcResult};
