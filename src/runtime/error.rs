//! Startup and serve errors.

use crate::function::RegistrationError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("invalid bind address {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
