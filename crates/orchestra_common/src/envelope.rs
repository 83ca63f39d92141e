//! Envelope - the uniform success/failure wrapper for every kernel operation
//!
//! Success: `{ok: true, data, message?, meta?, traceId?}`
//! Failure: `{ok: false, error: {code, message, details?, requestId?}, message?, meta?, traceId?}`

use crate::error::{ErrorCode, KernelError, KernelResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl From<&KernelError> for ErrorBody {
    fn from(err: &KernelError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: err.details().map(str::to_string),
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            message: None,
            meta: None,
            trace_id: None,
        }
    }

    pub fn failure(err: &KernelError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
            message: None,
            meta: None,
            trace_id: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Attach a trace id; failures also echo it as the error's request id.
    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        if let (Some(error), Some(id)) = (self.error.as_mut(), trace_id.as_ref()) {
            error.request_id = Some(id.clone());
        }
        self.trace_id = trace_id;
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Convert back into a result on the client side.
    pub fn into_result(self) -> Result<T, ErrorBody> {
        match (self.ok, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(ErrorBody {
                code: ErrorCode::Unknown,
                message: "Envelope carried neither data nor error".to_string(),
                details: None,
                request_id: None,
            }),
        }
    }
}

impl<T> From<KernelResult<T>> for Envelope<T> {
    fn from(result: KernelResult<T>) -> Self {
        match result {
            Ok(data) => Envelope::success(data),
            Err(e) => Envelope::failure(&e),
        }
    }
}
