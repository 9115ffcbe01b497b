//! HTTP payload types: uploads, request decoding and the result envelope.

mod request;
mod response;

pub use request::{decode_json, decode_request, DecodeError, UploadFile, INPUT_DATA_PART};
pub use response::{detail_response, ResultEnvelope};
