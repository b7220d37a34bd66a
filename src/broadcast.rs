//! Per-user event fan-out.
//!
//! One producer (the orchestrator) appends to the BuildLog and then fans the
//! event to every sink the user has connected. Appending first is what makes
//! any sink's delivery order a prefix of the log. Sinks are capped at three
//! per user (oldest closed on overflow) and dropped on send failure; a
//! heartbeat pings the survivors every 30 seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::events::BuildEvent;
use crate::models::{LogLevel, LogSource};
use crate::store::BuildStore;

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Concurrent sinks per user; the oldest is closed when one more connects.
pub const MAX_SINKS_PER_USER: usize = 3;
/// Outbound buffer per sink; a sink this far behind is dropped.
const SINK_BUFFER: usize = 256;

struct Sink {
    id: u64,
    tx: mpsc::Sender<String>,
}

pub struct Broadcaster {
    store: Arc<BuildStore>,
    sinks: Mutex<HashMap<i64, Vec<Sink>>>,
    next_sink_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(store: Arc<BuildStore>) -> Self {
        Self {
            store,
            sinks: Mutex::new(HashMap::new()),
            next_sink_id: AtomicU64::new(1),
        }
    }

    /// Connect an observer for a user. Returns the sink id and the receive
    /// half; the receiver closing (dropped or evicted) ends the subscription.
    pub async fn subscribe(&self, user_id: i64) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SINK_BUFFER);
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let mut sinks = self.sinks.lock().await;
        let list = sinks.entry(user_id).or_default();
        if list.len() >= MAX_SINKS_PER_USER {
            // Closing the channel is the eviction; the WS task sees EOF.
            list.remove(0);
        }
        list.push(Sink { id, tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, user_id: i64, sink_id: u64) {
        let mut sinks = self.sinks.lock().await;
        if let Some(list) = sinks.get_mut(&user_id) {
            list.retain(|s| s.id != sink_id);
            if list.is_empty() {
                sinks.remove(&user_id);
            }
        }
    }

    pub async fn sink_count(&self, user_id: i64) -> usize {
        self.sinks
            .lock()
            .await
            .get(&user_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Persist a build event as a log row, then fan it out to the user's
    /// sinks. The append happens before any send.
    pub async fn emit(
        &self,
        user_id: i64,
        build_id: &str,
        source: LogSource,
        level: LogLevel,
        event: &BuildEvent,
    ) {
        if let Err(e) =
            self.store
                .append_log(build_id, source, level, &event.log_message(), Some(event.kind()))
        {
            tracing::error!(build_id, error = %e, "failed to persist event log row");
        }
        self.fan_out(user_id, event).await;
    }

    /// Persist and fan out a plain log line (console output mirror).
    pub async fn emit_line(
        &self,
        user_id: i64,
        build_id: &str,
        source: LogSource,
        level: LogLevel,
        message: &str,
    ) {
        let event = BuildEvent::BuildLog {
            build_id: build_id.to_string(),
            source: source.as_str().to_string(),
            level: level.as_str().to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self
            .store
            .append_log(build_id, source, level, message, Some("build_log"))
        {
            tracing::error!(build_id, error = %e, "failed to persist log row");
        }
        self.fan_out(user_id, &event).await;
    }

    async fn fan_out(&self, user_id: i64, event: &BuildEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                return;
            }
        };
        let mut sinks = self.sinks.lock().await;
        if let Some(list) = sinks.get_mut(&user_id) {
            list.retain(|sink| sink.tx.try_send(payload.clone()).is_ok());
            if list.is_empty() {
                sinks.remove(&user_id);
            }
        }
    }

    /// Ping every connected sink; drop the ones that error out. Runs forever;
    /// spawn it once at startup.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let payload = match serde_json::to_string(&BuildEvent::Heartbeat {
                ts: chrono::Utc::now(),
            }) {
                Ok(json) => json,
                Err(_) => continue,
            };
            let mut sinks = self.sinks.lock().await;
            sinks.retain(|_, list| {
                list.retain(|sink| sink.tx.try_send(payload.clone()).is_ok());
                !list.is_empty()
            });
        }
    }
}
