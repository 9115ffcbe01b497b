//! # servegate - expose plain functions as network endpoints
//!
//! servegate turns ordinary Rust functions into validated HTTP and WebSocket
//! endpoints. A function annotated with [`servable`] is reflected at compile
//! time into a [`FunctionDecl`]; at registration the gateway classifies its
//! parameters, synthesizes input/output schemas and mounts a route for it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     hyper http1 accept loop                         │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Router ── observe ── auth ── EnvScope ── function ── envelope      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │ POST /sync_a │  │ GET  /ws_b   │  │ /healthz ... │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use servegate::prelude::*;
//!
//! #[servable]
//! fn sync_http(interval: u64) -> String {
//!     std::thread::sleep(std::time::Duration::from_secs(interval));
//!     "Hello, world!".to_string()
//! }
//!
//! #[servable(websocket)]
//! fn countdown(from: u32) -> impl Iterator<Item = u32> {
//!     (0..=from).rev()
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut gateway = Gateway::with_defaults();
//!     gateway.register(SyncHttpFunction)?;
//!     gateway.register(CountdownFunction)?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Call lifecycle
//!
//! 1. **Decode**: the body is validated against the route's [`InputSchema`].
//! 2. **Authorize**: routes with an authorizer require `Authorization: Bearer`.
//! 3. **Scope**: the call's `envs` overlay the process environment ([`EnvScope`]).
//! 4. **Execute**: blocking functions run on the worker pool, async ones are awaited.
//! 5. **Respond**: a `{result, error, stdout}` envelope per call or per streamed item.
//!
//! ## Metrics
//!
//! Per-route counters are always served as JSON on `/metrics`. The same
//! numbers are also emitted as `servegate_*_total` counters through the
//! [`metrics`] facade. Those are no-ops until the host installs a recorder;
//! the demo binary installs a Prometheus exporter when built with the
//! `prometheus` feature.

extern crate self as servegate;

pub mod auth;
pub mod capture;
pub mod env_scope;
pub mod function;
pub mod http;
pub mod observe;
pub mod runtime;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::auth::{AuthContext, Authorizer};
    pub use crate::echo;
    pub use crate::function::{
        CallArgs, CallContext, CallError, DynamicFunction, FunctionDecl, Output, ParamDecl,
        RegistrationError, ReturnDecl, RouteKind, ServableFunction, TransportError,
    };
    pub use crate::http::{ResultEnvelope, UploadFile};
    pub use crate::runtime::{Connection, Gateway, GatewayConfig, StreamSender};
    pub use async_trait::async_trait;
    pub use servegate_macro::servable;
}

// Re-export for convenience
pub use auth::{AuthContext, Authorizer};
pub use env_scope::EnvScope;
pub use function::schema::{FieldSpec, InputSchema, OutputSchema, SemanticType};
pub use function::{
    CallArgs, CallContext, CallError, DynamicFunction, FieldType, FunctionDecl, Injection, Output,
    OutputShape, ParamDecl, Registration, RegistrationError, ReturnDecl, RouteKind, RouteSpec,
    ServableFunction, TransportError,
};
pub use http::{ResultEnvelope, UploadFile};
pub use runtime::{Connection, Gateway, GatewayConfig, StreamSender};
pub use servegate_macro::servable;

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
    pub use futures;
    pub use serde_json;
}
