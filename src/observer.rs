//! Aggregate-only metrics handle. Accepts increments/decrements and never receives payload
//! bytes or client identifiers, per the "ambient global state for metrics" strategy in
//! `spec.md` §9: pass an observer handle explicitly instead of a global singleton.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Observer {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    connections_current: AtomicI64,
    connections_total: AtomicU64,
    rooms_current: AtomicI64,
    rooms_created_total: AtomicU64,
    messages_relayed_total: AtomicU64,
    media_relayed_total: AtomicU64,
    admission_rejections_total: AtomicU64,
    rate_limit_closes_total: AtomicU64,
    slow_consumer_closes_total: AtomicU64,
    token_replays_total: AtomicU64,
    store_errors_total: AtomicU64,
    ready: AtomicBool,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer {
    pub fn new() -> Self {
        let inner = Arc::new(Counters::default());
        inner.ready.store(true, Ordering::Relaxed);
        Self { inner }
    }

    pub fn connection_opened(&self) {
        self.inner.connections_current.fetch_add(1, Ordering::Relaxed);
        self.inner.connections_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn connection_closed(&self) {
        self.inner.connections_current.fetch_sub(1, Ordering::Relaxed);
    }
    /// Bumps the monotonic creation counter. `rooms_current` is not touched here — it's a gauge
    /// sampled directly from the store (`set_rooms_current`), since a room can also disappear by
    /// TTL expiry with no call site to pair against an increment.
    pub fn room_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the `rooms_current` gauge to a freshly sampled count (`RoomStore::room_count`),
    /// rather than incrementing/decrementing it at each membership change.
    pub fn set_rooms_current(&self, count: i64) {
        self.inner.rooms_current.store(count, Ordering::Relaxed);
    }
    pub fn message_relayed(&self) {
        self.inner.messages_relayed_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn media_relayed(&self) {
        self.inner.media_relayed_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn admission_rejected(&self) {
        self.inner.admission_rejections_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn rate_limit_close(&self) {
        self.inner.rate_limit_closes_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn slow_consumer_close(&self) {
        self.inner.slow_consumer_closes_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn token_replay(&self) {
        self.inner.token_replays_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn store_error(&self) {
        self.inner.store_errors_total.fetch_add(1, Ordering::Relaxed);
        self.inner.ready.store(false, Ordering::Relaxed);
    }
    pub fn store_recovered(&self) {
        self.inner.ready.store(true, Ordering::Relaxed);
    }
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    /// Prometheus-style text exposition. No client identifiers, IPs, or payloads ever flow
    /// through `Counters`, so there is nothing to redact here.
    pub fn render_prometheus(&self) -> String {
        format!(
            "relay_connections_current {}\n\
             relay_connections_total {}\n\
             relay_rooms_current {}\n\
             relay_rooms_created_total {}\n\
             relay_messages_relayed_total {}\n\
             relay_media_relayed_total {}\n\
             relay_admission_rejections_total {}\n\
             relay_rate_limit_closes_total {}\n\
             relay_slow_consumer_closes_total {}\n\
             relay_token_replays_total {}\n\
             relay_store_errors_total {}\n\
             relay_ready {}\n",
            self.inner.connections_current.load(Ordering::Relaxed),
            self.inner.connections_total.load(Ordering::Relaxed),
            self.inner.rooms_current.load(Ordering::Relaxed),
            self.inner.rooms_created_total.load(Ordering::Relaxed),
            self.inner.messages_relayed_total.load(Ordering::Relaxed),
            self.inner.media_relayed_total.load(Ordering::Relaxed),
            self.inner.admission_rejections_total.load(Ordering::Relaxed),
            self.inner.rate_limit_closes_total.load(Ordering::Relaxed),
            self.inner.slow_consumer_closes_total.load(Ordering::Relaxed),
            self.inner.token_replays_total.load(Ordering::Relaxed),
            self.inner.store_errors_total.load(Ordering::Relaxed),
            if self.inner.ready.load(Ordering::Relaxed) { 1 } else { 0 },
        )
    }

    pub fn render_json(&self) -> serde_json::Value {
        serde_json::json!({
            "connections_current": self.inner.connections_current.load(Ordering::Relaxed),
            "connections_total": self.inner.connections_total.load(Ordering::Relaxed),
            "rooms_current": self.inner.rooms_current.load(Ordering::Relaxed),
            "rooms_created_total": self.inner.rooms_created_total.load(Ordering::Relaxed),
            "messages_relayed_total": self.inner.messages_relayed_total.load(Ordering::Relaxed),
            "media_relayed_total": self.inner.media_relayed_total.load(Ordering::Relaxed),
            "admission_rejections_total": self.inner.admission_rejections_total.load(Ordering::Relaxed),
            "rate_limit_closes_total": self.inner.rate_limit_closes_total.load(Ordering::Relaxed),
            "slow_consumer_closes_total": self.inner.slow_consumer_closes_total.load(Ordering::Relaxed),
            "token_replays_total": self.inner.token_replays_total.load(Ordering::Relaxed),
            "store_errors_total": self.inner.store_errors_total.load(Ordering::Relaxed),
            "ready": self.inner.ready.load(Ordering::Relaxed),
        })
    }
}
