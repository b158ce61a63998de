//! The Room Store: authoritative room membership and single-use `jti` markers, held in an
//! external key-value store (`spec.md` §4.5). `RoomStore` is a trait so the protocol engine can
//! be tested against an in-memory fake without a live Redis instance.

mod memory;
mod redis_store;

pub use memory::InMemoryRoomStore;
pub use redis_store::RedisRoomStore;

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Covers both "freshly joined" and "already a member" (`spec.md` §9 Open Question: the
    /// label is always derived from the current count, so the two cases are observably
    /// identical and are not distinguished in the return type).
    Joined { count: u32, label: String },
    NoRoom,
    Full,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("external store unreachable: {0}")]
    Unreachable(String),
}

#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
    /// Sets meta + count=0 with TTL. Idempotent: calling again on an existing room just
    /// refreshes its TTL.
    async fn create_empty(&self, room_id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Sets meta, members={conn}, count=1, and clears jtis, all with TTL.
    async fn create_with(&self, room_id: &str, conn_id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic join: `NoRoom` if meta absent, `Joined` with a refreshed TTL if already a member,
    /// `Full` if `count >= max`, otherwise adds the member and refreshes TTLs.
    async fn try_join(
        &self,
        room_id: &str,
        conn_id: &str,
        max: u32,
        ttl: Duration,
    ) -> Result<JoinOutcome, StoreError>;

    /// Removes `conn_id` from membership if present and decrements count. Deletes every room
    /// key (meta/members/count/jtis/jti(*)) when the count reaches zero; otherwise refreshes
    /// TTLs. Returns the remaining member count.
    async fn leave(&self, room_id: &str, conn_id: &str, ttl: Duration) -> Result<u32, StoreError>;

    /// Refreshes every key's TTL for the room on member activity.
    async fn touch(&self, room_id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Set-if-absent on the `(room_id, jti)` marker. On success, also adds `jti` to the room's
    /// consumed-token set and refreshes that set's TTL. Returns whether the mark was fresh
    /// (`false` means replay).
    async fn mark_jti(&self, room_id: &str, jti: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn exists(&self, room_id: &str) -> Result<bool, StoreError>;

    /// Count of rooms currently live in the store. Sampled periodically to drive the
    /// `rooms_current` metric directly from the store's own bookkeeping, rather than tracked via
    /// increment/decrement at each call site — a room destroyed by TTL expiry rather than an
    /// explicit last-leave has no call site to decrement from.
    async fn room_count(&self) -> Result<u64, StoreError>;
}
