//! The `{result, error, stdout}` envelope returned for every call.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outcome of one call, or of one streamed item.
///
/// `error` is empty on success; on failure `result` is null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub result: Value,
    pub error: String,
    #[serde(default)]
    pub stdout: String,
}

impl ResultEnvelope {
    pub fn ok(result: Value, stdout: impl Into<String>) -> Self {
        Self {
            result,
            error: String::new(),
            stdout: stdout.into(),
        }
    }

    pub fn failed(error: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: error.into(),
            stdout: stdout.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "result": self.result,
            "error": self.error,
            "stdout": self.stdout,
        })
    }

    /// Compact JSON text, as sent in a WebSocket frame.
    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}

impl IntoResponse for ResultEnvelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// `{"detail": ...}` error body with the given status.
pub fn detail_response(status: StatusCode, detail: impl Into<Value>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json() {
        let ok = ResultEnvelope::ok(json!("Hello, world!"), "");
        assert_eq!(
            ok.to_json(),
            json!({"result": "Hello, world!", "error": "", "stdout": ""})
        );
        assert!(!ok.is_error());

        let failed = ResultEnvelope::failed("boom", "partial\noutput");
        assert_eq!(failed.result, Value::Null);
        assert!(failed.is_error());

        let parsed: ResultEnvelope =
            serde_json::from_str(r#"{"result": 1, "error": ""}"#).unwrap();
        assert_eq!(parsed.stdout, "");
    }

    #[test]
    fn test_detail_response_status() {
        let response = detail_response(StatusCode::UNAUTHORIZED, "Bearer token required");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
