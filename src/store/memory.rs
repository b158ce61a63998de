//! In-memory `RoomStore` fake used by protocol-engine and router tests, so those suites don't
//! need a live Redis. TTLs are tracked as absolute deadlines and checked lazily on access,
//! mirroring the "no timer, check on access" approach used elsewhere in this crate (the token
//! bucket, the rate limiter this project's teacher ships).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{JoinOutcome, RoomStore, StoreError};

struct RoomRecord {
    members: HashSet<String>,
    jtis: HashSet<String>,
    jti_markers: HashMap<String, Instant>,
    expires_at: Instant,
}

impl RoomRecord {
    fn empty(ttl: Duration) -> Self {
        Self {
            members: HashSet::new(),
            jtis: HashSet::new(),
            jti_markers: HashMap::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn touch(&mut self, ttl: Duration) {
        self.expires_at = Instant::now() + ttl;
    }
}

#[derive(Default)]
pub struct InMemoryRoomStore {
    rooms: Mutex<HashMap<String, RoomRecord>>,
}

impl InMemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire_if_due(rooms: &mut HashMap<String, RoomRecord>, room_id: &str) {
        let expired = rooms
            .get(room_id)
            .map(|r| Instant::now() >= r.expires_at)
            .unwrap_or(false);
        if expired {
            rooms.remove(room_id);
        }
    }
}

#[async_trait::async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn create_empty(&self, room_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        Self::expire_if_due(&mut rooms, room_id);
        rooms
            .entry(room_id.to_string())
            .and_modify(|r| r.touch(ttl))
            .or_insert_with(|| RoomRecord::empty(ttl));
        Ok(())
    }

    async fn create_with(&self, room_id: &str, conn_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        let mut record = RoomRecord::empty(ttl);
        record.members.insert(conn_id.to_string());
        rooms.insert(room_id.to_string(), record);
        Ok(())
    }

    async fn try_join(
        &self,
        room_id: &str,
        conn_id: &str,
        max: u32,
        ttl: Duration,
    ) -> Result<JoinOutcome, StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        Self::expire_if_due(&mut rooms, room_id);
        let Some(record) = rooms.get_mut(room_id) else {
            return Ok(JoinOutcome::NoRoom);
        };

        if record.members.contains(conn_id) {
            record.touch(ttl);
            let count = record.members.len() as u32;
            return Ok(JoinOutcome::Joined {
                count,
                label: format!("P{count}"),
            });
        }

        if record.members.len() as u32 >= max {
            return Ok(JoinOutcome::Full);
        }

        record.members.insert(conn_id.to_string());
        record.touch(ttl);
        let count = record.members.len() as u32;
        Ok(JoinOutcome::Joined {
            count,
            label: format!("P{count}"),
        })
    }

    async fn leave(&self, room_id: &str, conn_id: &str, ttl: Duration) -> Result<u32, StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        let Some(record) = rooms.get_mut(room_id) else {
            return Ok(0);
        };
        if !record.members.remove(conn_id) {
            return Ok(record.members.len() as u32);
        }
        let remaining = record.members.len() as u32;
        if remaining == 0 {
            rooms.remove(room_id);
        } else {
            record.touch(ttl);
        }
        Ok(remaining)
    }

    async fn touch(&self, room_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(record) = rooms.get_mut(room_id) {
            record.touch(ttl);
        }
        Ok(())
    }

    async fn mark_jti(&self, room_id: &str, jti: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        let Some(record) = rooms.get_mut(room_id) else {
            // No room means nothing to replay against; treat as fresh so the caller's
            // subsequent try_join is what actually reports NoRoom.
            return Ok(true);
        };

        let expired = record
            .jti_markers
            .get(jti)
            .map(|exp| Instant::now() >= *exp)
            .unwrap_or(true);
        if !expired {
            return Ok(false);
        }

        record.jti_markers.insert(jti.to_string(), Instant::now() + ttl);
        record.jtis.insert(jti.to_string());
        Ok(true)
    }

    async fn exists(&self, room_id: &str) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        Self::expire_if_due(&mut rooms, room_id);
        Ok(rooms.contains_key(room_id))
    }

    async fn room_count(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let rooms = self.rooms.lock().unwrap();
        Ok(rooms.values().filter(|r| now < r.expires_at).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::from_secs(600)
    }

    #[tokio::test]
    async fn create_with_then_join_increments_count() {
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        let outcome = store.try_join("r1", "b", 10, ttl()).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                count: 2,
                label: "P2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn join_no_room_reports_no_room() {
        let store = InMemoryRoomStore::new();
        let outcome = store.try_join("missing", "a", 10, ttl()).await.unwrap();
        assert_eq!(outcome, JoinOutcome::NoRoom);
    }

    #[tokio::test]
    async fn join_at_capacity_reports_full() {
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        store.try_join("r1", "b", 2, ttl()).await.unwrap();
        let outcome = store.try_join("r1", "c", 2, ttl()).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Full);
    }

    #[tokio::test]
    async fn rejoin_after_leave_succeeds() {
        // B1
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        store.try_join("r1", "b", 2, ttl()).await.unwrap();
        assert_eq!(
            store.try_join("r1", "c", 2, ttl()).await.unwrap(),
            JoinOutcome::Full
        );
        store.leave("r1", "b", ttl()).await.unwrap();
        assert!(matches!(
            store.try_join("r1", "c", 2, ttl()).await.unwrap(),
            JoinOutcome::Joined { .. }
        ));
    }

    #[tokio::test]
    async fn already_member_refreshes_without_changing_count() {
        // R2
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        store.try_join("r1", "b", 10, ttl()).await.unwrap();
        let before = store.try_join("r1", "b", 10, ttl()).await.unwrap();
        assert_eq!(
            before,
            JoinOutcome::Joined {
                count: 2,
                label: "P2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn last_leave_removes_room_and_jti_markers() {
        // I7 / S6
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        store.mark_jti("r1", "jti-1", ttl()).await.unwrap();
        store.leave("r1", "a", ttl()).await.unwrap();
        assert!(!store.exists("r1").await.unwrap());
        // A fresh create_with on the same id must not see stale jtis.
        store.create_with("r1", "z", ttl()).await.unwrap();
        assert!(store.mark_jti("r1", "jti-1", ttl()).await.unwrap());
    }

    #[tokio::test]
    async fn mark_jti_is_single_use_until_ttl_expires() {
        // I2
        let store = InMemoryRoomStore::new();
        store.create_with("r1", "a", ttl()).await.unwrap();
        assert!(store.mark_jti("r1", "jti-1", ttl()).await.unwrap());
        assert!(!store.mark_jti("r1", "jti-1", ttl()).await.unwrap());
        assert!(!store
            .mark_jti("r1", "jti-1", Duration::from_millis(1))
            .await
            .unwrap());
    }
}
