//! HTTP route handler: decode, authorize, scope, execute, envelope.

use crate::auth::authorize;
use crate::capture::Capture;
use crate::env_scope::{merge_envs, EnvScope};
use crate::function::{CallArgs, CallContext, CallError, Route};
use crate::http::decode_request;
use crate::observe::{DurationTracker, Transport};
use crate::runtime::{dispatch, generate_request_id, Shared};
use axum::extract::Request;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) async fn handle_call(route: Arc<Route>, shared: Arc<Shared>, req: Request) -> Response {
    let spec = route.spec.clone();
    let _tracker = DurationTracker::start(
        spec.name.clone(),
        Transport::Http,
        route.stats.clone(),
        shared.config.flush_interval(),
    );
    let request_id = generate_request_id();
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let envelope = match decode_request(req, &spec.input).await {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!("[{}] Rejected request for {}: {}", request_id, spec.name, err);
            return err.into_response();
        }
    };

    let auth = match &route.authorizer {
        Some(authorizer) => match authorize(authorizer.as_ref(), auth_header.as_deref()).await {
            Ok(auth) => Some(auth),
            Err(err) => {
                warn!("[{}] Unauthorized call to {}: {}", request_id, spec.name, err);
                return err.into_response();
            }
        },
        None => None,
    };

    let envs = merge_envs(&shared.config.env, &envelope.envs);
    let _scope = EnvScope::enter(&envs);
    let capture = Capture::new();
    let ctx = CallContext::new(spec.name.as_str(), request_id.clone(), shared.pool.clone())
        .with_auth(auth)
        .with_capture(capture.clone());
    let args = CallArgs::new(envelope.fields, envelope.files);

    let result = capture
        .scope(async {
            let output = dispatch(&route, &shared.pool, &capture, args, ctx).await?;
            let value = output.collect().await.map_err(CallError::Execution)?;
            Ok::<_, CallError>(value)
        })
        .await;

    match result {
        Ok(value) => spec.output.ok(value, capture.drain()).into_response(),
        Err(CallError::Validation(err)) => {
            debug!("[{}] Invalid arguments for {}: {}", request_id, spec.name, err);
            err.into_response()
        }
        Err(CallError::Execution(message)) => {
            error!("[{}] {} failed: {}", request_id, spec.name, message);
            spec.output.failed(message, capture.drain()).into_response()
        }
    }
}
