//! Gateway runtime: configuration, the server loop and the route handlers.

mod config;
mod connection;
mod error;
mod http_route;
mod pool;
mod server;
mod ws;

pub use config::GatewayConfig;
pub use connection::{Connection, StreamSender};
pub use error::GatewayError;
pub use pool::WorkerPool;
pub use server::Gateway;
pub use ws::ConnectionState;

use crate::capture::Capture;
use crate::function::{catch_panic, CallArgs, CallContext, CallError, Output, Route};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// State shared by every handler of one router.
pub(crate) struct Shared {
    pub(crate) config: GatewayConfig,
    pub(crate) pool: WorkerPool,
}

/// Generate a unique request ID.
pub(crate) fn generate_request_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}-{}", timestamp, SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Invoke a route's function. Blocking declarations that do not offload their
/// own work are driven on the worker pool.
pub(crate) async fn dispatch(
    route: &Route,
    pool: &WorkerPool,
    capture: &Capture,
    args: CallArgs,
    ctx: CallContext,
) -> Result<Output, CallError> {
    if route.spec.blocking && !route.function.offloads_blocking() {
        let function = route.function.clone();
        return pool
            .run_future(capture.clone(), async move { function.call(args, ctx).await })
            .await?;
    }
    catch_panic(route.function.call(args, ctx)).await?
}
