//! Gateway: route registration, router assembly and the accept loop.

use crate::function::{
    Registration, RegistrationError, Route, RouteKind, RouteSpec, RouteTable, ServableFunction,
};
use crate::runtime::{http_route, ws, GatewayConfig, GatewayError, Shared, WorkerPool};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, MethodRouter};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const HEALTH_PATH: &str = "/healthz";
const DRY_RUN_PATH: &str = "/dry_run";
const METRICS_PATH: &str = "/metrics";
const ROUTES_PATH: &str = "/routes";

/// Serves registered functions over HTTP and WebSocket.
///
/// Register everything first, then call [`run`](Self::run) or
/// [`serve`](Self::serve). The route table is frozen once serving starts.
pub struct Gateway {
    config: GatewayConfig,
    routes: RouteTable,
    pool: WorkerPool,
}

impl Gateway {
    /// Create a new gateway.
    pub fn new(config: GatewayConfig) -> Self {
        let pool = WorkerPool::new(config.max_blocking_workers);
        Self {
            config,
            routes: RouteTable::new(),
            pool,
        }
    }

    /// Create a new gateway with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(GatewayConfig::default())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register a function.
    pub fn register<F>(&mut self, function: F) -> Result<Registration, RegistrationError>
    where
        F: ServableFunction + 'static,
    {
        self.register_arc(Arc::new(function))
    }

    pub fn register_arc(
        &mut self,
        function: Arc<dyn ServableFunction>,
    ) -> Result<Registration, RegistrationError> {
        self.routes.register(function)
    }

    /// Register several functions. A function that fails registration is
    /// logged and skipped; the rest are still registered.
    pub fn register_all<I>(&mut self, functions: I) -> Vec<Registration>
    where
        I: IntoIterator<Item = Arc<dyn ServableFunction>>,
    {
        let mut registered = Vec::new();
        for function in functions {
            match self.register_arc(function) {
                Ok(registration) => registered.push(registration),
                Err(err) => error!("Failed to register function: {}", err),
            }
        }
        registered
    }

    /// Specs of every registered route, in registration order.
    pub fn routes(&self) -> Vec<Arc<RouteSpec>> {
        self.routes.iter().map(|route| route.spec.clone()).collect()
    }

    /// Build the axum router for the registered routes.
    ///
    /// Built-in endpoints are always mounted. When a function owns the same
    /// path, the built-in `GET` handler sits next to the function's `POST`.
    pub fn router(&self) -> Router {
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            pool: self.pool.clone(),
        });
        let routes: Arc<Vec<Arc<Route>>> = Arc::new(self.routes.iter().cloned().collect());
        let mut builtins = self.builtin_endpoints(&routes);

        let mut router = Router::new();
        for route in routes.iter() {
            let path = route.spec.path.clone();
            let handler_route = route.clone();
            let shared = shared.clone();
            let mut method_router = match route.spec.kind {
                RouteKind::Http => post(move |req: Request| {
                    http_route::handle_call(handler_route, shared, req)
                }),
                RouteKind::Stream => get(move |req: Request| {
                    ws::handle_upgrade(handler_route, shared, req)
                }),
            };
            if let Some(builtin) = builtins.remove(path.as_str()) {
                match route.spec.kind {
                    RouteKind::Http => {
                        debug!("{} serves both the function and the built-in endpoint", path);
                        method_router = method_router.merge(builtin);
                    }
                    RouteKind::Stream => warn!(
                        "{} is a streaming function, not mounting the built-in endpoint",
                        path
                    ),
                }
            }
            router = router.route(&path, method_router);
            debug!("Mounted {}", path);
        }

        let mut system = Router::new();
        for (path, method_router) in builtins {
            system = system.route(path, method_router);
        }

        router
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .layer(TraceLayer::new_for_http())
            .merge(system)
    }

    fn builtin_endpoints(&self, routes: &Arc<Vec<Arc<Route>>>) -> HashMap<&'static str, MethodRouter> {
        let mut builtins: HashMap<&'static str, MethodRouter> = HashMap::new();
        builtins.insert(HEALTH_PATH, get(health));
        if self.routes.has_streaming_routes() {
            builtins.insert(DRY_RUN_PATH, get(dry_run_ws));
        } else {
            builtins.insert(DRY_RUN_PATH, get(health));
        }
        if self.config.enable_metrics {
            let routes = routes.clone();
            let pool = self.pool.clone();
            builtins.insert(
                METRICS_PATH,
                get(move || async move { Json(metrics_snapshot(&routes, &pool)) }),
            );
        }
        if self.config.enable_routes {
            let routes = routes.clone();
            builtins.insert(
                ROUTES_PATH,
                get(move || async move {
                    Json(Value::Array(
                        routes.iter().map(|route| route.spec.describe()).collect(),
                    ))
                }),
            );
        }
        builtins
    }

    /// Start the HTTP server on the configured address.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self.config.bind_addr();
        let socket_addr: SocketAddr = addr.parse().map_err(|err| GatewayError::Bind {
            addr: addr.clone(),
            reason: format!("{}", err),
        })?;
        let listener = TcpListener::bind(socket_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the process exits.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Connections already accepted keep
    /// running to completion.
    pub async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send,
    {
        let router = self.router();
        let addr = listener.local_addr()?;
        info!(
            "Gateway listening on {} with {} route(s)",
            addr,
            self.routes.len()
        );

        tokio::pin!(shutdown);
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Gateway on {} shutting down", addr);
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let router = router.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |mut req: hyper::Request<Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(remote_addr));
                    router.clone().oneshot(req)
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving connection from {}: {:?}", remote_addr, err);
                }
            });
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn dry_run_ws(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(|mut socket| async move {
        let status = json!({"status": "ok"}).to_string();
        if socket.send(Message::Text(status.into())).await.is_ok() {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "".into(),
                })))
                .await;
        }
    })
}

fn metrics_snapshot(routes: &[Arc<Route>], pool: &WorkerPool) -> Value {
    let mut per_route = Map::new();
    for route in routes {
        per_route.insert(
            route.spec.name.clone(),
            json!({
                "path": route.spec.path,
                "kind": route.spec.kind,
                "stats": route.stats.snapshot(),
            }),
        );
    }
    json!({
        "routes": per_route,
        "workers": {
            "size": pool.size(),
            "available": pool.available(),
        },
    })
}
