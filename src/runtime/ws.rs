//! Streaming route handler: one WebSocket session per connection.

use crate::auth::{authorize, AuthContext, AuthError};
use crate::capture::Capture;
use crate::env_scope::{merge_envs, EnvScope};
use crate::function::{CallArgs, CallContext, Injection, Output, Route, TransportError};
use crate::http::ResultEnvelope;
use crate::observe::{DurationTracker, Transport};
use crate::runtime::connection::{Connection, Inbox, Outbox, StreamSender};
use crate::runtime::{dispatch, generate_request_id, Shared};
use axum::extract::ws::{close_code, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Lifecycle of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Validating,
    Executing,
    Emitting,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Validating => "validating",
            ConnectionState::Executing => "executing",
            ConnectionState::Emitting => "emitting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Session {
    id: String,
    route: Arc<Route>,
    shared: Arc<Shared>,
    state: ConnectionState,
    outbox: Outbox,
    inbox: Inbox,
}

impl Session {
    fn transition(&mut self, next: ConnectionState) {
        debug!(
            "[{}] {} connection {} -> {}",
            self.id, self.route.spec.name, self.state, next
        );
        self.state = next;
    }
}

/// How one message was handled.
enum Turn {
    Completed,
    Failed,
    Disconnected(TransportError),
}

/// Upgrade the request and run the session on the new socket.
pub(crate) async fn handle_upgrade(route: Arc<Route>, shared: Arc<Shared>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| run_session(socket, route, shared, auth_header, peer))
}

async fn run_session(
    socket: WebSocket,
    route: Arc<Route>,
    shared: Arc<Shared>,
    auth_header: Option<String>,
    peer: Option<SocketAddr>,
) {
    let (sink, stream) = socket.split();
    let (outbox, writer) = Outbox::spawn(sink);
    let mut session = Session {
        id: generate_request_id(),
        route,
        shared,
        state: ConnectionState::Connecting,
        outbox,
        inbox: Inbox::new(stream),
    };
    info!(
        "[{}] WebSocket connection to {} from {}",
        session.id,
        session.route.spec.path,
        peer.map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    // One call per connection; the ticker flushes time while the socket is open.
    let _tracker = DurationTracker::start(
        session.route.spec.name.clone(),
        Transport::Ws,
        session.route.stats.clone(),
        session.shared.config.flush_interval(),
    );

    let auth = match handshake(&session, auth_header.as_deref()).await {
        Ok(auth) => auth,
        Err(err) => {
            warn!(
                "[{}] Rejecting connection to {}: {}",
                session.id, session.route.spec.name, err
            );
            session.transition(ConnectionState::Closing);
            let _ = session
                .outbox
                .close(close_code::POLICY, err.close_reason())
                .await;
            finish(session, writer).await;
            return;
        }
    };
    session.transition(ConnectionState::Open);

    loop {
        let text = match session.inbox.recv_text().await {
            Ok(text) => text,
            Err(err) => {
                info!("[{}] {}", session.id, err);
                finish(session, writer).await;
                return;
            }
        };

        match handle_message(&mut session, &text, auth.clone()).await {
            Turn::Disconnected(err) => {
                info!("[{}] {}", session.id, err);
                finish(session, writer).await;
                return;
            }
            Turn::Failed => session.transition(ConnectionState::Open),
            Turn::Completed if session.route.spec.multi_turn => {
                session.transition(ConnectionState::Open)
            }
            Turn::Completed => break,
        }
    }

    session.transition(ConnectionState::Closing);
    let _ = session.outbox.close(close_code::NORMAL, "").await;
    finish(session, writer).await;
}

async fn handshake(
    session: &Session,
    auth_header: Option<&str>,
) -> Result<Option<AuthContext>, AuthError> {
    match &session.route.authorizer {
        Some(authorizer) => authorize(authorizer.as_ref(), auth_header).await.map(Some),
        None => Ok(None),
    }
}

async fn finish(mut session: Session, writer: tokio::task::JoinHandle<()>) {
    let id = session.id.clone();
    session.transition(ConnectionState::Closed);
    drop(session);
    if let Err(err) = writer.await {
        debug!("[{}] WebSocket writer ended abnormally: {}", id, err);
    }
}

async fn handle_message(session: &mut Session, text: &str, auth: Option<AuthContext>) -> Turn {
    session.transition(ConnectionState::Validating);
    let spec = session.route.spec.clone();

    let envelope = match serde_json::from_str::<Value>(text)
        .map_err(|err| err.to_string())
        .and_then(|value| spec.input.validate(value).map_err(|err| err.to_string()))
    {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!("[{}] Invalid message for {}: {}", session.id, spec.name, err);
            return send(session, &spec.output.failed(err, String::new()), Turn::Failed).await;
        }
    };

    session.transition(ConnectionState::Executing);
    let envs = merge_envs(&session.shared.config.env, &envelope.envs);
    let _scope = EnvScope::enter(&envs);
    let capture = Capture::new();

    let mut ctx = CallContext::new(spec.name.as_str(), session.id.clone(), session.shared.pool.clone())
        .with_auth(auth)
        .with_capture(capture.clone());
    if spec.injections.contains(&Injection::StreamSender) {
        ctx = ctx.with_sender(StreamSender::new(session.outbox.clone(), capture.clone()));
    }
    if spec.injections.contains(&Injection::Connection) {
        ctx = ctx.with_connection(Connection::new(
            session.outbox.clone(),
            session.inbox.clone(),
            Handle::current(),
        ));
    }

    let args = CallArgs::new(envelope.fields, envelope.files);
    let result = capture
        .scope(dispatch(
            &session.route,
            &session.shared.pool,
            &capture,
            args,
            ctx,
        ))
        .await;
    let output = match result {
        Ok(output) => output,
        Err(err) => {
            warn!("[{}] {} failed: {}", session.id, spec.name, err);
            let failed = spec.output.failed(err.to_string(), capture.drain());
            return send(session, &failed, Turn::Failed).await;
        }
    };

    session.transition(ConnectionState::Emitting);
    match output {
        Output::Single(value) => {
            let envelope = spec.output.ok(value, capture.drain());
            send(session, &envelope, Turn::Completed).await
        }
        Output::Stream(mut items) => {
            while let Some(item) = capture.scope(items.next()).await {
                let (envelope, failed) = match item {
                    Ok(value) => (spec.output.ok(value, capture.drain()), false),
                    Err(err) => (spec.output.failed(err, capture.drain()), true),
                };
                if let Err(err) = session.outbox.send_envelope(&envelope).await {
                    return Turn::Disconnected(err);
                }
                if failed {
                    return Turn::Failed;
                }
            }
            Turn::Completed
        }
    }
}

async fn send(session: &Session, envelope: &ResultEnvelope, turn: Turn) -> Turn {
    match session.outbox.send_envelope(envelope).await {
        Ok(()) => turn,
        Err(err) => Turn::Disconnected(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Validating.to_string(), "validating");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
