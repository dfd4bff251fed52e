//! Request and response bodies, and the error-to-status mapping.

use axum::http::StatusCode;
use runwave_core::{CoreError, ErrorCode};
use serde::{Deserialize, Serialize};

/// Fixed message for executions that hit the deadline.
pub const TIMEOUT_MESSAGE: &str = "Execution timeout!";

/// Fixed message when no sandbox could be claimed.
pub const UNAVAILABLE_MESSAGE: &str = "The service is currently unavailable, try again later!";

/// Fixed message for languages without a command template.
pub const UNSUPPORTED_MESSAGE: &str = "Unsupported language!";

/// Fixed message for internal faults.
pub const INTERNAL_MESSAGE: &str = "Internal server error";

/// Body of `POST /execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    /// Source code to run.
    pub code: String,
    /// Language identifier (`python`, `javascript`, ...).
    pub language: String,
}

/// Response of `POST /execute`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResponse {
    /// Successful execution.
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
        }
    }

    /// Failed request.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }

    /// Map an execution result to a status and body.
    ///
    /// Failures of the submitted code itself are reported with 200 and the
    /// raw diagnostic; everything else uses a fixed message.
    pub fn from_result(result: Result<String, CoreError>) -> (StatusCode, Self) {
        let err = match result {
            Ok(output) => return (StatusCode::OK, Self::output(output)),
            Err(err) => err,
        };

        match err.code() {
            Some(ErrorCode::ExecutionFailed) => (StatusCode::OK, Self::error(err.to_string())),
            Some(ErrorCode::Timeout) => (StatusCode::OK, Self::error(TIMEOUT_MESSAGE)),
            Some(ErrorCode::PodNotFound | ErrorCode::PodUpdateFailed) => {
                (StatusCode::SERVICE_UNAVAILABLE, Self::error(UNAVAILABLE_MESSAGE))
            }
            Some(ErrorCode::UnsupportedLanguage) => {
                (StatusCode::BAD_REQUEST, Self::error(UNSUPPORTED_MESSAGE))
            }
            None => (StatusCode::INTERNAL_SERVER_ERROR, Self::error(INTERNAL_MESSAGE)),
        }
    }
}
