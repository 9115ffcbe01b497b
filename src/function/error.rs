//! Error taxonomy for registration, validation and execution.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// A function could not be turned into a route.
///
/// Fatal to that one function; the gateway keeps registering the others.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error(
        "Annotation missing for parameter `{param}` in function `{function}`. \
         Please add type annotations to all parameters."
    )]
    MissingAnnotation { function: String, param: String },

    #[error("parameter `{param}` in function `{function}` uses the reserved name `envs`")]
    ReservedParameter { function: String, param: String },

    #[error("parameter `{param}` is declared twice in function `{function}`")]
    DuplicateParameter { function: String, param: String },

    #[error("parameter `{param}` in function `{function}` cannot be injected: {reason}")]
    UnsupportedInjection {
        function: String,
        param: String,
        reason: &'static str,
    },

    #[error("invalid function name `{0}`")]
    InvalidName(String),
}

/// One problem found while validating an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location of the offending value, e.g. `["body", "items", 2]`.
    pub loc: Vec<Value>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ValidationIssue {
    pub fn new(loc: Vec<Value>, msg: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            loc,
            msg: msg.into(),
            kind: kind.into(),
        }
    }

    /// A required field is absent.
    pub fn missing(loc: Vec<Value>) -> Self {
        Self::new(loc, "field required", "value_error.missing")
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = self
            .loc
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(f, "{}\n  {} (type={})", loc, self.msg, self.kind)
    }
}

/// Malformed or incomplete inbound payload. Surfaces as HTTP 422 or as an
/// error envelope on a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn single(loc: Vec<Value>, msg: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(vec![ValidationIssue::new(loc, msg, kind)])
    }

    /// The `{"detail": [...]}` response body.
    pub fn detail(&self) -> Value {
        json!({ "detail": self.issues })
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.issues.len();
        write!(
            f,
            "{} validation error{}",
            count,
            if count == 1 { "" } else { "s" }
        )?;
        for issue in &self.issues {
            write!(f, "\n{}", issue)?;
        }
        Ok(())
    }
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        (StatusCode::UNPROCESSABLE_ENTITY, Json(self.detail())).into_response()
    }
}

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Arguments could not be converted to the parameter types.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The function itself failed (returned `Err` or panicked).
    #[error("{0}")]
    Execution(String),
}

impl CallError {
    pub fn execution(err: impl fmt::Display) -> Self {
        CallError::Execution(err.to_string())
    }
}

/// The peer went away or the socket failed. Never reported to clients as an
/// application error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("client disconnected with code {code}{}", fmt_reason(.reason))]
    Disconnected { code: u16, reason: String },

    #[error("transport failure: {0}")]
    Io(String),

    #[error("could not decode message: {0}")]
    Decode(String),
}

fn fmt_reason(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(" and reason {}", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_counts_issues() {
        let err = ValidationError::new(vec![
            ValidationIssue::missing(vec![json!("body"), json!("interval")]),
            ValidationIssue::new(
                vec![json!("body"), json!("items"), json!(1)],
                "value is not a valid integer",
                "type_error.integer",
            ),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 validation errors"));
        assert!(text.contains("body -> interval"));
        assert!(text.contains("body -> items -> 1"));
    }

    #[test]
    fn test_validation_detail_shape() {
        let err = ValidationError::single(vec![json!("body")], "bad", "value_error");
        assert_eq!(
            err.detail(),
            json!({"detail": [{"loc": ["body"], "msg": "bad", "type": "value_error"}]})
        );
    }

    #[test]
    fn test_transport_error_reason() {
        let err = TransportError::Disconnected {
            code: 1001,
            reason: "going away".into(),
        };
        assert_eq!(
            err.to_string(),
            "client disconnected with code 1001 and reason going away"
        );
        let err = TransportError::Disconnected {
            code: 1000,
            reason: String::new(),
        };
        assert_eq!(err.to_string(), "client disconnected with code 1000");
    }
}
