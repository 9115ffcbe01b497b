//! Per-route call counters and duration accounting.
//!
//! Every HTTP request and every WebSocket connection counts as one call and
//! adds its wall-clock duration. Long-lived connections flush partial
//! durations on a fixed interval so the totals move while the socket is open.

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Which handler a call arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Ws,
}

impl Transport {
    fn calls_metric(self) -> &'static str {
        match self {
            Transport::Http => "servegate_http_calls_total",
            Transport::Ws => "servegate_ws_calls_total",
        }
    }

    fn duration_metric(self) -> &'static str {
        match self {
            Transport::Http => "servegate_http_duration_microseconds_total",
            Transport::Ws => "servegate_ws_duration_microseconds_total",
        }
    }
}

/// Counters for one route.
#[derive(Debug, Default)]
pub struct RouteStats {
    calls: AtomicU64,
    duration_micros: AtomicU64,
    active: AtomicU64,
}

impl RouteStats {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_micros.load(Ordering::Relaxed))
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls(),
            duration_seconds: self.duration().as_secs_f64(),
            active: self.active(),
        }
    }
}

/// Point-in-time view of a route's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub duration_seconds: f64,
    pub active: u64,
}

struct Flusher {
    route: String,
    transport: Transport,
    stats: Arc<RouteStats>,
    last: Mutex<Instant>,
}

impl Flusher {
    fn flush(&self) {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        if micros == 0 {
            return;
        }
        self.stats
            .duration_micros
            .fetch_add(micros, Ordering::Relaxed);
        counter!(self.transport.duration_metric(), "route" => self.route.clone())
            .increment(micros);
    }
}

/// Tracks one call from entry to drop.
///
/// Creating it counts the call. A background ticker flushes the elapsed time
/// every `flush_interval`; dropping it stops the ticker and flushes the rest.
pub struct DurationTracker {
    flusher: Arc<Flusher>,
    ticker: Option<JoinHandle<()>>,
}

impl DurationTracker {
    pub fn start(
        route: impl Into<String>,
        transport: Transport,
        stats: Arc<RouteStats>,
        flush_interval: Duration,
    ) -> Self {
        let route = route.into();
        stats.calls.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        counter!(transport.calls_metric(), "route" => route.clone()).increment(1);

        let start = Instant::now();
        let flusher = Arc::new(Flusher {
            route,
            transport,
            stats,
            last: Mutex::new(start),
        });

        let ticker = (!flush_interval.is_zero()).then(|| {
            let flusher = flusher.clone();
            tokio::spawn(async move {
                let mut interval = interval_at(start + flush_interval, flush_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    debug!("Flushing partial duration for route {}", flusher.route);
                    flusher.flush();
                }
            })
        });

        Self { flusher, ticker }
    }
}

impl Drop for DurationTracker {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.flusher.flush();
        self.flusher.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tracker_counts_once_and_accumulates() {
        let stats = Arc::new(RouteStats::default());
        {
            let _tracker = DurationTracker::start(
                "SyncHttp",
                Transport::Http,
                stats.clone(),
                Duration::from_secs(5),
            );
            assert_eq!(stats.calls(), 1);
            assert_eq!(stats.active(), 1);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(stats.calls(), 1);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.duration(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_flushes_partial_durations() {
        let stats = Arc::new(RouteStats::default());
        let tracker =
            DurationTracker::start("Chat", Transport::Ws, stats.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(stats.duration(), Duration::from_secs(10));

        drop(tracker);
        assert_eq!(stats.duration(), Duration::from_secs(11));
        assert_eq!(stats.calls(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RouteStats::default();
        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(value["calls"], 0);
        assert_eq!(value["active"], 0);
    }
}
