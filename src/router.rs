//! The Room Router: in-process fan-out and rotating QR tokens for rooms that have at least one
//! locally-connected member (`spec.md` §4.6). Modeled on the teacher's `PresenceTracker`: an
//! outer map under a single `RwLock`, with per-room state behind its own `Mutex` so broadcast
//! and rotation in one room never contend with another.
//!
//! The Room Router is a *local* mirror of membership for fast fan-out; the Room Store
//! (`crate::store`) remains the authoritative record of who is allowed in a room. A process
//! restart loses the router's state but not the store's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct RoomEntryInner {
    conns: HashSet<String>,
    qr_token: String,
    qr_expires_at_ms: i64,
    next_rotation: Instant,
}

struct RoomEntry {
    inner: std::sync::Mutex<RoomEntryInner>,
}

/// Outcome of a rotation sweep tick for one room, used by the caller to know which connections
/// to push a `QR_ROTATED` frame to.
pub struct RotatedRoom {
    pub room_id: String,
    pub qr_token: String,
    pub qr_expires_at_ms: i64,
    pub members: Vec<String>,
}

#[derive(Default)]
pub struct Router {
    rooms: RwLock<HashMap<String, Arc<RoomEntry>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a locally-connected member in the router's view of `room_id`, minting the
    /// room's first QR token if this is the first local member seen for it. Returns the current
    /// token so the caller can hand it back in a `ROOM_CREATED`/`JOINED` frame.
    pub async fn track_local_join(
        &self,
        room_id: &str,
        conn_id: &str,
        qr_token: impl FnOnce() -> (String, i64),
        qr_rotation: Duration,
    ) -> (String, i64) {
        let entry = self.entry_for(room_id).await;
        let mut inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.conns.is_empty() && inner.qr_token.is_empty() {
            let (token, exp) = qr_token();
            inner.qr_token = token;
            inner.qr_expires_at_ms = exp;
            inner.next_rotation = Instant::now() + qr_rotation;
        }
        inner.conns.insert(conn_id.to_string());
        (inner.qr_token.clone(), inner.qr_expires_at_ms)
    }

    /// Removes a locally-connected member. If this empties the room's local membership, the
    /// entry is dropped from the outer map entirely, mirroring `PresenceTracker::leave`.
    pub async fn track_local_leave(&self, room_id: &str, conn_id: &str) {
        let should_evict = {
            let rooms = self.rooms.read().await;
            let Some(entry) = rooms.get(room_id) else {
                return;
            };
            let mut inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.conns.remove(conn_id);
            inner.conns.is_empty()
        };
        if should_evict {
            let mut rooms = self.rooms.write().await;
            if let Some(entry) = rooms.get(room_id) {
                let inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.conns.is_empty() {
                    drop(inner);
                    rooms.remove(room_id);
                }
            }
        }
    }

    /// Snapshot of locally-connected member ids, for fan-out.
    pub async fn local_members(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        match rooms.get(room_id) {
            Some(entry) => {
                let inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.conns.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn current_token(&self, room_id: &str) -> Option<(String, i64)> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|entry| {
            let inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
            (inner.qr_token.clone(), inner.qr_expires_at_ms)
        })
    }

    /// One sweep tick: rotates the QR token for every locally-tracked room whose
    /// `next_rotation` deadline has passed, using absolute deadlines (not a fixed-period
    /// ticker) so a delayed sweep doesn't compound into back-to-back rotations — the same
    /// "tolerate missed ticks" strategy as the keep-alive driver.
    pub async fn rotate_due(
        &self,
        now: Instant,
        qr_rotation: Duration,
        mint: impl Fn(&str) -> (String, i64),
    ) -> Vec<RotatedRoom> {
        let rooms = self.rooms.read().await;
        let mut rotated = Vec::new();
        for (room_id, entry) in rooms.iter() {
            let mut inner = entry.inner.lock().unwrap_or_else(|e| e.into_inner());
            if now < inner.next_rotation {
                continue;
            }
            let (token, exp) = mint(room_id);
            inner.qr_token = token.clone();
            inner.qr_expires_at_ms = exp;
            inner.next_rotation = now + qr_rotation;
            rotated.push(RotatedRoom {
                room_id: room_id.clone(),
                qr_token: token,
                qr_expires_at_ms: exp,
                members: inner.conns.iter().cloned().collect(),
            });
        }
        rotated
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn entry_for(&self, room_id: &str) -> Arc<RoomEntry> {
        if let Some(entry) = self.rooms.read().await.get(room_id) {
            return entry.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(RoomEntry {
                    inner: std::sync::Mutex::new(RoomEntryInner {
                        conns: HashSet::new(),
                        qr_token: String::new(),
                        qr_expires_at_ms: 0,
                        next_rotation: Instant::now(),
                    }),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_local_join_mints_token_and_subsequent_joins_reuse_it() {
        let router = Router::new();
        let (token_a, exp_a) = router
            .track_local_join("r1", "a", || ("tok-1".to_string(), 1_000), Duration::from_secs(60))
            .await;
        let (token_b, exp_b) = router
            .track_local_join("r1", "b", || ("tok-2".to_string(), 2_000), Duration::from_secs(60))
            .await;
        assert_eq!(token_a, "tok-1");
        assert_eq!(exp_a, 1_000);
        assert_eq!(token_b, "tok-1");
        assert_eq!(exp_b, 1_000);

        let mut members = router.local_members("r1").await;
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn last_local_leave_evicts_the_room_entry() {
        let router = Router::new();
        router
            .track_local_join("r1", "a", || ("tok-1".to_string(), 1_000), Duration::from_secs(60))
            .await;
        assert_eq!(router.room_count().await, 1);
        router.track_local_leave("r1", "a").await;
        assert_eq!(router.room_count().await, 0);
        assert!(router.current_token("r1").await.is_none());
    }

    #[tokio::test]
    async fn rotate_due_only_rotates_rooms_past_their_deadline() {
        let router = Router::new();
        router
            .track_local_join("r1", "a", || ("tok-1".to_string(), 1_000), Duration::from_millis(10))
            .await;
        router
            .track_local_join("r2", "b", || ("tok-2".to_string(), 1_000), Duration::from_secs(600))
            .await;

        let soon = Instant::now() + Duration::from_millis(50);
        let rotated = router
            .rotate_due(soon, Duration::from_millis(10), |room_id| {
                (format!("{room_id}-rotated"), 9_999)
            })
            .await;

        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].room_id, "r1");
        assert_eq!(rotated[0].qr_token, "r1-rotated");
        assert_eq!(rotated[0].members, vec!["a".to_string()]);
    }
}
