//! Inbound request decoding for function routes.

use crate::function::error::{ValidationError, ValidationIssue};
use crate::function::schema::{CallEnvelope, InputSchema};
use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Multipart part holding the JSON for the non-file fields.
pub const INPUT_DATA_PART: &str = "input_data";

/// A file received as a multipart part.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(filename: Option<String>, content_type: Option<String>, data: Bytes) -> Self {
        Self {
            filename,
            content_type,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Contents as UTF-8, if they are valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Why a request body could not be turned into a call.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The body itself could not be read (too large, bad multipart framing).
    #[error("{message}")]
    Body { status: StatusCode, message: String },
}

impl IntoResponse for DecodeError {
    fn into_response(self) -> Response {
        match self {
            DecodeError::Invalid(err) => err.into_response(),
            DecodeError::Body { status, message } => (status, message).into_response(),
        }
    }
}

/// Parse and validate a JSON body. An empty body is treated as `{}`.
pub fn decode_json(body: &[u8], schema: &InputSchema) -> Result<CallEnvelope, DecodeError> {
    let value = parse_json(body, vec![Value::from("body")])?;
    Ok(schema.validate(value)?)
}

/// Decode a request for a route: JSON, or multipart when the route takes files.
pub async fn decode_request(
    req: Request<Body>,
    schema: &InputSchema,
) -> Result<CallEnvelope, DecodeError> {
    if schema.file_fields.is_empty() {
        let body = Bytes::from_request(req, &())
            .await
            .map_err(|rejection| DecodeError::Body {
                status: rejection.status(),
                message: rejection.body_text(),
            })?;
        return decode_json(&body, schema);
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|rejection| DecodeError::Body {
            status: rejection.status(),
            message: rejection.body_text(),
        })?;

    let mut input: Option<Value> = None;
    let mut files = HashMap::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| DecodeError::Body {
        status: err.status(),
        message: err.body_text(),
    })? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let filename = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(str::to_owned);
        let data = field.bytes().await.map_err(|err| DecodeError::Body {
            status: err.status(),
            message: err.body_text(),
        })?;

        if name == INPUT_DATA_PART {
            input = Some(parse_json(
                &data,
                vec![Value::from("body"), Value::from(INPUT_DATA_PART)],
            )?);
        } else if schema.is_file_field(&name) {
            files.insert(name, UploadFile::new(filename, content_type, data));
        }
    }

    let input = input.ok_or_else(|| {
        ValidationError::new(vec![ValidationIssue::missing(vec![
            Value::from("body"),
            Value::from(INPUT_DATA_PART),
        ])])
    })?;
    Ok(schema.validate_with_files(input, files)?)
}

fn parse_json(bytes: &[u8], loc: Vec<Value>) -> Result<Value, ValidationError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(bytes).map_err(|err| {
        let mut loc = loc;
        loc.push(Value::from(err.column()));
        ValidationError::single(loc, err.to_string(), "value_error.jsondecode")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::schema::{FieldSpec, SemanticType};
    use serde_json::json;

    fn schema(with_file: bool) -> InputSchema {
        InputSchema {
            name: "InputUpload".into(),
            fields: vec![
                FieldSpec::required("title", SemanticType::String),
                FieldSpec::envs(),
            ],
            file_fields: if with_file {
                vec![FieldSpec::required("document", SemanticType::File)]
            } else {
                vec![]
            },
        }
    }

    fn multipart_request(body: &'static str) -> Request<Body> {
        Request::post("/upload")
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body.replace('\n', "\r\n")))
            .unwrap()
    }

    #[test]
    fn test_decode_json_reports_parse_errors() {
        let err = decode_json(b"{not json", &schema(false)).unwrap_err();
        match err {
            DecodeError::Invalid(err) => assert_eq!(err.issues[0].kind, "value_error.jsondecode"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_body_is_an_empty_object() {
        let err = decode_json(b"", &schema(false)).unwrap_err();
        match err {
            DecodeError::Invalid(err) => {
                assert_eq!(err.issues[0].loc, vec![json!("body"), json!("title")])
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_json_request() {
        let req = Request::post("/upload")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"title":"hello"}"#))
            .unwrap();
        let envelope = decode_request(req, &schema(false)).await.unwrap();
        assert_eq!(envelope.fields["title"], json!("hello"));
    }

    #[tokio::test]
    async fn test_decode_multipart_request() {
        let req = multipart_request(
            "--XBOUNDARY
Content-Disposition: form-data; name=\"input_data\"

{\"title\":\"report\"}
--XBOUNDARY
Content-Disposition: form-data; name=\"document\"; filename=\"a.txt\"
Content-Type: text/plain

hello file
--XBOUNDARY--
",
        );
        let envelope = decode_request(req, &schema(true)).await.unwrap();
        assert_eq!(envelope.fields["title"], json!("report"));
        let file = &envelope.files["document"];
        assert_eq!(file.filename.as_deref(), Some("a.txt"));
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.text(), Some("hello file"));
    }

    #[tokio::test]
    async fn test_multipart_without_input_data() {
        let req = multipart_request(
            "--XBOUNDARY
Content-Disposition: form-data; name=\"document\"; filename=\"a.txt\"

x
--XBOUNDARY--
",
        );
        match decode_request(req, &schema(true)).await.unwrap_err() {
            DecodeError::Invalid(err) => {
                assert_eq!(err.issues[0].loc, vec![json!("body"), json!("input_data")])
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
