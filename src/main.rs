//! servegate demo gateway
//!
//! Serves a handful of sample functions over HTTP and WebSocket.

use servegate::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Sleep for `interval` seconds, then greet.
#[servable]
fn sync_http(interval: u64) -> String {
    std::thread::sleep(Duration::from_secs(interval));
    "Hello, world!".to_string()
}

/// Repeat a greeting without blocking the event loop.
#[servable]
async fn greet(name: String, #[default(1)] times: u32) -> Vec<String> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    (0..times).map(|_| format!("Hello, {}!", name)).collect()
}

/// Count down from `from` to zero, one message per number.
#[servable(websocket)]
fn countdown(from: u32) -> impl Iterator<Item = u32> {
    (0..=from).rev().map(|n| {
        std::thread::sleep(Duration::from_millis(200));
        n
    })
}

/// Ask the client a follow-up question before answering.
#[servable(websocket, multi_turn)]
async fn chat(prompt: String, conn: Connection) -> Result<String, TransportError> {
    let mood = conn.ask(format!("How do you feel about {}?", prompt)).await?;
    Ok(format!("{} makes you feel {}", prompt, mood))
}

/// Return the caller's identity.
#[servable(auth = check_token)]
fn whoami(auth: AuthContext) -> serde_json::Value {
    servegate::echo!("authorized call for {}", auth.value());
    auth.value().clone()
}

async fn check_token(token: String) -> Option<AuthContext> {
    let expected = std::env::var("SERVEGATE_DEMO_TOKEN").unwrap_or_else(|_| "secret".into());
    (token == expected).then(|| AuthContext::new(serde_json::json!({"user": "demo"})))
}

/// Serve the `servegate_*` counters on a Prometheus scrape endpoint.
#[cfg(feature = "prometheus")]
fn install_prometheus_exporter() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = std::env::var("SERVEGATE_PROMETHEUS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9000".into())
        .parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting servegate demo...");

    #[cfg(feature = "prometheus")]
    install_prometheus_exporter()?;

    let config = GatewayConfig::from_env()?.env("ENVIRONMENT", "development");
    let port = config.port;
    let mut gateway = Gateway::new(config);

    gateway.register(SyncHttpFunction)?;
    gateway.register(GreetFunction)?;
    gateway.register(CountdownFunction)?;
    gateway.register(ChatFunction)?;
    gateway.register(WhoamiFunction)?;

    tracing::info!(
        "Try: curl -X POST -d '{{\"interval\": 1}}' http://localhost:{}/sync_http",
        port
    );
    tracing::info!(
        "Try: curl -X POST -H 'Authorization: Bearer secret' -d '{{}}' http://localhost:{}/whoami",
        port
    );
    tracing::info!("Routes: curl http://localhost:{}/routes", port);

    gateway.run().await?;
    Ok(())
}
