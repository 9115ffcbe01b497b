//! The servable function trait and the per-call values passed to it.

use crate::auth::{AuthContext, Authorizer};
use crate::capture::Capture;
use crate::function::error::{CallError, ValidationError, ValidationIssue};
use crate::function::manifest::FunctionDecl;
use crate::http::UploadFile;
use crate::runtime::{Connection, StreamSender, WorkerPool};
use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A function the gateway can mount as a route.
///
/// Usually generated by `#[servable]`; implement it by hand (or use
/// [`DynamicFunction`](crate::function::DynamicFunction)) when the parameter
/// list is only known at runtime.
#[async_trait]
pub trait ServableFunction: Send + Sync {
    /// Describe the signature. Called once at registration.
    fn declaration(&self) -> FunctionDecl;

    /// Bearer-token check for this route, if any.
    fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        None
    }

    /// Whether `call` moves its own blocking work onto the worker pool (via
    /// [`CallContext::run_blocking`]). When `false`, the gateway runs the
    /// whole call on the pool for declarations marked `blocking`.
    fn offloads_blocking(&self) -> bool {
        false
    }

    /// Run the function with validated arguments.
    async fn call(&self, args: CallArgs, ctx: CallContext) -> Result<Output, CallError>;
}

/// Validated arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    fields: Map<String, Value>,
    files: HashMap<String, UploadFile>,
}

impl CallArgs {
    pub fn new(fields: Map<String, Value>, files: HashMap<String, UploadFile>) -> Self {
        Self { fields, files }
    }

    /// Remove a field and convert it to `T`.
    ///
    /// A conversion failure is a validation error: nested objects are only
    /// fully checked here, against the parameter's own `Deserialize` impl.
    pub fn take<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, CallError> {
        let value = self.fields.remove(name).unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|err| {
            CallError::Validation(ValidationError::single(
                vec![Value::from("body"), Value::from(name)],
                err.to_string(),
                "value_error",
            ))
        })
    }

    pub fn take_file(&mut self, name: &str) -> Result<UploadFile, CallError> {
        self.files.remove(name).ok_or_else(|| {
            CallError::Validation(ValidationError::new(vec![ValidationIssue::missing(vec![
                Value::from("body"),
                Value::from(name),
            ])]))
        })
    }

    pub fn take_optional_file(&mut self, name: &str) -> Option<UploadFile> {
        self.files.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Per-call context: identity, injected handles and the worker pool.
#[derive(Clone)]
pub struct CallContext {
    route: Arc<str>,
    request_id: String,
    auth: Option<AuthContext>,
    sender: Option<StreamSender>,
    connection: Option<Connection>,
    capture: Capture,
    pool: WorkerPool,
}

impl CallContext {
    pub fn new(route: impl Into<Arc<str>>, request_id: impl Into<String>, pool: WorkerPool) -> Self {
        Self {
            route: route.into(),
            request_id: request_id.into(),
            auth: None,
            sender: None,
            connection: None,
            capture: Capture::new(),
            pool,
        }
    }

    pub fn with_auth(mut self, auth: Option<AuthContext>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_sender(mut self, sender: StreamSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    pub fn auth_context(&self) -> Result<AuthContext, CallError> {
        self.auth
            .clone()
            .ok_or_else(|| CallError::Execution("no auth context for this call".into()))
    }

    pub fn stream_sender(&self) -> Result<StreamSender, CallError> {
        self.sender
            .clone()
            .ok_or_else(|| CallError::Execution("stream sender requires a websocket route".into()))
    }

    pub fn connection(&self) -> Result<Connection, CallError> {
        self.connection
            .clone()
            .ok_or_else(|| CallError::Execution("connection requires a websocket route".into()))
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    /// Run blocking work on the worker pool with this call's output capture.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, CallError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.pool.run(self.capture.clone(), f).await
    }

    /// Drain an iterator on the worker pool, yielding items as they are made.
    pub fn run_blocking_iter<F, I, E>(&self, f: F) -> Output
    where
        F: FnOnce() -> Result<I, E> + Send + 'static,
        I: IntoIterator + 'static,
        I::Item: Serialize,
        E: fmt::Display + 'static,
    {
        self.pool.run_iter(self.capture.clone(), f)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("route", &self.route)
            .field("request_id", &self.request_id)
            .field("auth", &self.auth)
            .field("streaming", &self.sender.is_some())
            .finish()
    }
}

/// What a function produced.
///
/// The variant is fixed by the declared return type, so handlers dispatch on
/// it statically.
pub enum Output {
    Single(Value),
    /// Items in production order; an `Err` item ends the sequence with an error.
    Stream(BoxStream<'static, Result<Value, String>>),
}

impl Output {
    pub fn single<T: Serialize>(value: T) -> Result<Self, CallError> {
        serde_json::to_value(value)
            .map(Output::Single)
            .map_err(|err| CallError::Execution(format!("failed to serialize result: {}", err)))
    }

    pub fn unit() -> Self {
        Output::Single(Value::Null)
    }

    pub fn stream<S, T>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Serialize,
    {
        let items = AssertUnwindSafe(stream)
            .catch_unwind()
            .map(|item| match item {
                Ok(value) => serde_json::to_value(value).map_err(|err| err.to_string()),
                Err(panic) => Err(panic_message(panic)),
            });
        Output::Stream(items.boxed())
    }

    /// Flatten into one value: streams become a JSON array.
    pub async fn collect(self) -> Result<Value, String> {
        match self {
            Output::Single(value) => Ok(value),
            Output::Stream(mut items) => {
                let mut values = Vec::new();
                while let Some(item) = items.next().await {
                    values.push(item?);
                }
                Ok(Value::Array(values))
            }
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Single(value) => f.debug_tuple("Single").field(value).finish(),
            Output::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Await `fut`, turning a panic into an execution error.
pub async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, CallError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| CallError::Execution(panic_message(panic)))
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("function panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("function panicked: {}", s)
    } else {
        "function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_converts_and_reports_location() {
        let mut fields = Map::new();
        fields.insert("n".into(), json!(5));
        fields.insert("bad".into(), json!("x"));
        let mut args = CallArgs::new(fields, HashMap::new());

        let n: u8 = args.take("n").unwrap();
        assert_eq!(n, 5);

        match args.take::<u8>("bad") {
            Err(CallError::Validation(err)) => {
                assert_eq!(err.issues[0].loc, vec![json!("body"), json!("bad")]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_take_missing_optional_is_none() {
        let mut args = CallArgs::default();
        let value: Option<String> = args.take("absent").unwrap();
        assert!(value.is_none());
        assert!(args.take_file("upload").is_err());
    }

    #[tokio::test]
    async fn test_collect_stream_into_array() {
        let output = Output::stream(futures::stream::iter(vec!["a", "b"]));
        assert_eq!(output.collect().await.unwrap(), json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_catch_panic() {
        let err = catch_panic(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(err, CallError::Execution("function panicked: boom".into()));
    }
}
