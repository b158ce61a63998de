//! Batched, backpressure-aware broadcast (`spec.md` §4.8 fan-out algorithm). A broadcast takes a
//! membership snapshot from the router, then walks it in batches of 50 with a cooperative yield
//! between batches, so one room's fan-out never starves another room's on a shared executor.

use std::sync::Arc;

use crate::connection::ConnectionRegistry;
use crate::error::CloseCode;
use crate::observer::Observer;
use crate::router::Router;

const BATCH_SIZE: usize = 50;

/// Delivers `payload` to every locally-tracked member of `room_id`, skipping `exclude` (the
/// sender, for frames that must not echo) and closing any recipient whose outbound buffer is
/// already over budget instead of blocking the rest of the room.
pub async fn broadcast(
    router: &Router,
    registry: &ConnectionRegistry,
    observer: &Observer,
    room_id: &str,
    payload: Arc<str>,
    exclude: Option<&str>,
    max_buffered_bytes: usize,
) {
    let members = router.local_members(room_id).await;

    for batch in members.chunks(BATCH_SIZE) {
        for conn_id in batch {
            if Some(conn_id.as_str()) == exclude {
                continue;
            }
            let Some(handle) = registry.handle(conn_id).await else {
                continue;
            };
            if handle.try_send_frame(payload.clone(), max_buffered_bytes).is_err() {
                handle.close(CloseCode::PolicyViolation, "slow consumer");
                observer.slow_consumer_close();
            }
        }
        tokio::task::yield_now().await;
    }
}
