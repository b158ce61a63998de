//! Connection Context and the outbound connection registry (`spec.md` §3, §4.2). Each connection
//! task owns its `ConnectionContext` exclusively (token buckets, keep-alive state); the registry
//! only holds what other tasks need to reach it — a channel to push outbound frames/closes, and
//! an atomic approximation of how much is queued, so the router's broadcast path never has to
//! take a per-connection lock to fan a message out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{mpsc, RwLock};

use crate::error::CloseCode;
use crate::meters::IpMeter;
use crate::token_bucket::TokenBucket;

/// 96 bits of randomness, hex-encoded, per `spec.md` §6.9's logging-field contract.
pub fn generate_conn_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A message queued for a connection's write half.
pub enum Outbound {
    Frame { payload: Arc<str>, len: usize },
    /// A protocol-level WebSocket ping, dispatched by the keep-alive sweep — distinct from the
    /// application-level `PING`/`PONG` tags a client can send over `Frame`.
    Ping,
    Close(CloseCode, &'static str),
}

/// Liveness state for the keep-alive driver (`spec.md` §4.7), shared between the connection's own
/// read loop (which clears it on PONG) and the sweep task (which sends pings and schedules the
/// matching timeout check) so the sweep never needs to reach into a connection task's private
/// state. `generation` is bumped every time a ping goes out, so a timeout check scheduled against
/// one ping never fires against a later one — see `ConnectionRegistry::check_ping_timeout`.
struct Liveness {
    awaiting_pong: AtomicBool,
    generation: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            awaiting_pong: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }
}

struct RegistryEntry {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered_bytes: Arc<AtomicUsize>,
    liveness: Arc<Liveness>,
}

/// Handle to a single registered connection, returned to callers that need to enqueue outbound
/// traffic without touching the registry's lock again.
#[derive(Clone)]
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered_bytes: Arc<AtomicUsize>,
}

/// What the keep-alive sweep should do for one connection this tick: send it a fresh ping,
/// tagged with the generation the caller must hand back to `check_ping_timeout`.
pub enum SweepAction {
    SendPing(String, ConnHandle, u64),
}

impl ConnHandle {
    /// Enqueues `payload` unless the connection's outbound queue is already carrying more than
    /// `max_buffered_bytes`, in which case the caller should treat this as the slow-consumer
    /// condition and close instead (`spec.md` §5, outbound buffer bound).
    pub fn try_send_frame(&self, payload: Arc<str>, max_buffered_bytes: usize) -> Result<(), SlowConsumer> {
        let len = payload.len();
        if self.buffered_bytes.load(Ordering::Acquire) + len > max_buffered_bytes {
            return Err(SlowConsumer);
        }
        self.buffered_bytes.fetch_add(len, Ordering::AcqRel);
        let _ = self.tx.send(Outbound::Frame { payload, len });
        Ok(())
    }

    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close(code, reason));
    }

    /// Enqueues a protocol-level ping, called by the keep-alive sweep for a `SweepAction::SendPing`.
    pub fn send_ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }
}

pub struct SlowConsumer;

/// Called by the connection's own write loop after actually writing a frame to the socket, so
/// the buffered-bytes estimate reflects what's still queued rather than what was ever enqueued.
pub fn mark_frame_written(buffered_bytes: &Arc<AtomicUsize>, len: usize) {
    buffered_bytes.fetch_sub(len.min(buffered_bytes.load(Ordering::Acquire)), Ordering::AcqRel);
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its receiver half (consumed by that connection's
    /// write loop) plus the shared buffered-bytes counter (decremented by the same loop).
    pub async fn register(&self, conn_id: &str) -> (mpsc::UnboundedReceiver<Outbound>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered_bytes = Arc::new(AtomicUsize::new(0));
        let mut entries = self.entries.write().await;
        entries.insert(
            conn_id.to_string(),
            RegistryEntry {
                tx,
                buffered_bytes: buffered_bytes.clone(),
                liveness: Arc::new(Liveness::new()),
            },
        );
        (rx, buffered_bytes)
    }

    pub async fn unregister(&self, conn_id: &str) {
        self.entries.write().await.remove(conn_id);
    }

    /// Enqueues a close with `code`/`reason` to every currently-registered connection, for
    /// graceful shutdown (`spec.md` §4.9: "send close to all, await in-flight cleanup until a
    /// bounded timeout"). Does not wait for the sends to land; the caller times that out.
    pub async fn close_all(&self, code: CloseCode, reason: &'static str) {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            let _ = entry.tx.send(Outbound::Close(code, reason));
        }
    }

    pub async fn handle(&self, conn_id: &str) -> Option<ConnHandle> {
        let entries = self.entries.read().await;
        entries.get(conn_id).map(|e| ConnHandle {
            tx: e.tx.clone(),
            buffered_bytes: e.buffered_bytes.clone(),
        })
    }

    /// Clears the awaiting-pong flag for `conn_id`. Called by that connection's own read loop
    /// when a PONG arrives; never called cross-task for any other purpose.
    pub async fn mark_pong(&self, conn_id: &str) {
        if let Some(entry) = self.entries.read().await.get(conn_id) {
            entry.liveness.awaiting_pong.store(false, Ordering::Release);
        }
    }

    /// One keep-alive sweep tick (`spec.md` §4.7): every connection that isn't already waiting on
    /// an unanswered ping gets a fresh one. A connection already awaiting a ping is left alone —
    /// its own timeout, scheduled by the caller at `ping_sent_at + ping_timeout` when that ping
    /// went out, is what will terminate it if it never answers (`check_ping_timeout`). Takes a
    /// snapshot under the read lock and releases it before touching any per-connection state, so
    /// the sweep never holds the registry lock while a send could block.
    pub async fn sweep(&self) -> Vec<SweepAction> {
        let snapshot: Vec<(String, ConnHandle, Arc<Liveness>)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(id, e)| {
                    (
                        id.clone(),
                        ConnHandle {
                            tx: e.tx.clone(),
                            buffered_bytes: e.buffered_bytes.clone(),
                        },
                        e.liveness.clone(),
                    )
                })
                .collect()
        };

        let mut actions = Vec::with_capacity(snapshot.len());
        for (conn_id, handle, liveness) in snapshot {
            if liveness.awaiting_pong.load(Ordering::Acquire) {
                continue;
            }
            let generation = liveness.generation.fetch_add(1, Ordering::AcqRel) + 1;
            liveness.awaiting_pong.store(true, Ordering::Release);
            actions.push(SweepAction::SendPing(conn_id, handle, generation));
        }
        actions
    }

    /// Checked exactly `ping_timeout` after a ping went out (`spec.md` §4.7, B4): terminates only
    /// if that same ping is still unanswered. A pong that arrived in between, or a newer ping
    /// already dispatched by a later sweep tick, bumps past `generation` and this becomes a no-op
    /// — so a stale check can never close a connection that has since recovered.
    pub async fn check_ping_timeout(&self, conn_id: &str, generation: u64) -> Option<ConnHandle> {
        let entries = self.entries.read().await;
        let entry = entries.get(conn_id)?;
        let still_outstanding = entry.liveness.awaiting_pong.load(Ordering::Acquire)
            && entry.liveness.generation.load(Ordering::Acquire) == generation;
        still_outstanding.then(|| ConnHandle {
            tx: entry.tx.clone(),
            buffered_bytes: entry.buffered_bytes.clone(),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Per-connection mutable state, owned exclusively by that connection's task (`spec.md` §5:
/// "no data is shared across connection tasks except through the Room Router / Room Store").
pub struct ConnectionContext {
    pub conn_id: String,
    pub remote_ip: String,
    pub room_id: Option<String>,
    pub label: Option<String>,
    pub msg_bucket: TokenBucket,
    pub byte_bucket: TokenBucket,
}

impl ConnectionContext {
    pub fn new(conn_id: String, remote_ip: String, msg_bucket: TokenBucket, byte_bucket: TokenBucket) -> Self {
        Self {
            conn_id,
            remote_ip,
            room_id: None,
            label: None,
            msg_bucket,
            byte_bucket,
        }
    }

    pub fn is_in_room(&self) -> bool {
        self.room_id.is_some()
    }
}

/// RAII guard that releases the connection's IP-meter slot on drop, mirroring the teacher's
/// `PresenceGuard` shape for "release on task exit, however it exits".
pub struct IpSlotGuard<'a> {
    meter: &'a IpMeter,
    ip: String,
}

impl<'a> IpSlotGuard<'a> {
    pub fn acquire(meter: &'a IpMeter, ip: &str) -> Option<Self> {
        if meter.try_inc(ip) {
            Some(Self {
                meter,
                ip: ip.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for IpSlotGuard<'_> {
    fn drop(&mut self) {
        self.meter.dec(&self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_is_24_hex_chars() {
        let id = generate_conn_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn conn_ids_are_not_trivially_repeated() {
        assert_ne!(generate_conn_id(), generate_conn_id());
    }

    #[tokio::test]
    async fn register_then_handle_allows_send_and_unregister_removes_it() {
        let registry = ConnectionRegistry::new();
        let (mut rx, buffered) = registry.register("c1").await;
        let handle = registry.handle("c1").await.expect("registered");
        handle.try_send_frame(Arc::from("hello"), 1024).unwrap();
        assert_eq!(buffered.load(Ordering::Acquire), 5);

        match rx.recv().await.unwrap() {
            Outbound::Frame { payload, len } => {
                assert_eq!(&*payload, "hello");
                assert_eq!(len, 5);
                mark_frame_written(&buffered, len);
            }
            Outbound::Close(..) => panic!("expected frame"),
            Outbound::Ping => panic!("expected frame"),
        }
        assert_eq!(buffered.load(Ordering::Acquire), 0);

        registry.unregister("c1").await;
        assert!(registry.handle("c1").await.is_none());
    }

    #[tokio::test]
    async fn over_budget_send_reports_slow_consumer() {
        let registry = ConnectionRegistry::new();
        let (_rx, _buffered) = registry.register("c1").await;
        let handle = registry.handle("c1").await.unwrap();
        let big: Arc<str> = Arc::from("x".repeat(100));
        assert!(handle.try_send_frame(big, 10).is_err());
    }

    #[test]
    fn ip_slot_guard_releases_on_drop() {
        let meter = IpMeter::new(1);
        {
            let _guard = IpSlotGuard::acquire(&meter, "9.9.9.9").unwrap();
            assert_eq!(meter.count("9.9.9.9"), 1);
        }
        assert_eq!(meter.count("9.9.9.9"), 0);
    }

    fn expect_one_ping(actions: &[SweepAction]) -> (&str, u64) {
        match actions {
            [SweepAction::SendPing(id, _, generation)] => (id.as_str(), *generation),
            other => panic!("expected exactly one SendPing action, got {} actions", other.len()),
        }
    }

    #[tokio::test]
    async fn sweep_then_check_timeout_terminates_if_unanswered() {
        // B4
        let registry = ConnectionRegistry::new();
        registry.register("c1").await;

        let actions = registry.sweep().await;
        let (conn_id, generation) = expect_one_ping(&actions);
        assert_eq!(conn_id, "c1");

        assert!(registry.check_ping_timeout(conn_id, generation).await.is_some());
    }

    #[tokio::test]
    async fn pong_before_the_check_clears_the_timeout() {
        let registry = ConnectionRegistry::new();
        registry.register("c1").await;

        let actions = registry.sweep().await;
        let (conn_id, generation) = expect_one_ping(&actions);
        registry.mark_pong(conn_id).await;

        assert!(registry.check_ping_timeout(conn_id, generation).await.is_none());
    }

    #[tokio::test]
    async fn sweep_does_not_repeat_a_ping_while_one_is_outstanding() {
        let registry = ConnectionRegistry::new();
        registry.register("c1").await;

        registry.sweep().await;
        let second = registry.sweep().await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn stale_timeout_check_is_ignored_after_a_newer_ping() {
        let registry = ConnectionRegistry::new();
        registry.register("c1").await;

        let first = registry.sweep().await;
        let (conn_id, stale_generation) = expect_one_ping(&first);
        let conn_id = conn_id.to_string();
        registry.mark_pong(&conn_id).await;
        registry.sweep().await; // dispatches a newer ping, bumping the generation

        assert!(registry.check_ping_timeout(&conn_id, stale_generation).await.is_none());
    }
}
