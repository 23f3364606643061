//! Response frame returned by an endpoint.

use serde::{Deserialize, Serialize};

use super::RequestId;
use crate::error::{CorralError, Result};

pub type RpcResult = serde_json::Value;

/// Machine-readable kind of a failed response.
///
/// Lets callers tell an admission rejection apart from a handler failure
/// without parsing the message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The server refused the call for lack of capacity; retry later.
    Capacity,
    /// The server is shutting down.
    Shutdown,
    Internal,
}

impl ErrorCode {
    pub fn of(error: &CorralError) -> Self {
        match error {
            CorralError::Capacity => ErrorCode::Capacity,
            CorralError::Shutdown => ErrorCode::Shutdown,
            _ => ErrorCode::Internal,
        }
    }
}

/// Reply to a [`Request`](super::Request).
///
/// Exactly one of `result` and `error` is set, mirrored by `success`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Option<RpcResult>,
    pub error: Option<String>,
    pub success: bool,
    /// Absent on success and on frames from peers that do not send it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl Response {
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
            success: true,
            code: None,
        }
    }

    pub fn error(id: RequestId, error: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(error.into()),
            success: false,
            code: None,
        }
    }

    /// Error response carrying the kind of `error` alongside its message.
    pub fn from_error(id: RequestId, error: &CorralError) -> Self {
        Response {
            code: Some(ErrorCode::of(error)),
            ..Response::error(id, error.to_string())
        }
    }

    /// Converts the frame into the caller-facing result.
    ///
    /// A failure coded [`ErrorCode::Capacity`] or [`ErrorCode::Shutdown`]
    /// comes back as that same error; any other failure becomes
    /// [`CorralError::Remote`]. A successful frame without a result is
    /// malformed.
    pub fn into_result(self) -> Result<RpcResult> {
        if self.success {
            return self
                .result
                .ok_or_else(|| CorralError::InvalidResponse("success without result".into()));
        }

        match self.code {
            Some(ErrorCode::Capacity) => Err(CorralError::Capacity),
            Some(ErrorCode::Shutdown) => Err(CorralError::Shutdown),
            Some(ErrorCode::Internal) | None => Err(CorralError::Remote(
                self.error.unwrap_or_else(|| "unknown error".into()),
            )),
        }
    }
}
