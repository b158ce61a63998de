//! Background sweep tasks: keep-alive liveness and QR rotation (`spec.md` §4.7, §4.6). Both are
//! driven by absolute deadlines rather than a fixed-period ticker accumulating drift, the same
//! "tolerate missed ticks" strategy the teacher's `retention::spawn_retention_task` uses for its
//! own periodic cleanup loop — except these log through `tracing` rather than `eprintln!`.

use std::sync::Arc;
use std::time::Instant;

use crate::connection::SweepAction;
use crate::protocol::qr_rotated_frame;
use crate::RelayState;

/// One tick per `ping_interval`: pings everything that isn't already waiting on one. Each ping
/// also schedules its own timeout check exactly `ping_timeout` later (`spec.md` §4.7, B4), rather
/// than leaving detection to the next `ping_interval` tick — with `ping_interval` commonly much
/// larger than `ping_timeout`, piggybacking on the next tick would let a silent peer linger for
/// close to two intervals instead of `ping_interval + ping_timeout`. Never holds the registry
/// lock while sending (`ConnectionRegistry::sweep` already snapshots and releases it).
pub async fn run_keepalive_sweep(state: Arc<RelayState>) {
    let mut interval = tokio::time::interval(state.config.ping_interval());
    loop {
        interval.tick().await;
        let actions = state.registry.sweep().await;
        for action in actions {
            let SweepAction::SendPing(conn_id, handle, generation) = action;
            handle.send_ping();
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(state.config.ping_timeout()).await;
                if let Some(handle) = state.registry.check_ping_timeout(&conn_id, generation).await {
                    tracing::debug!(conn_id = %conn_id, "keep-alive timeout, terminating");
                    handle.close(crate::error::CloseCode::PolicyViolation, "keep-alive timeout");
                }
            });
        }
    }
}

/// One tick per `qr_rotation`: rotates every locally-tracked room past its deadline and fans the
/// new token out to its current members, and refreshes the `rooms_current` gauge from the store
/// (`RoomStore::room_count`) — the one place this process periodically talks to every room
/// regardless of whether it has a locally-tracked member, so it doubles as the gauge's sample
/// point.
pub async fn run_qr_rotation_sweep(state: Arc<RelayState>) {
    let qr_rotation = state.config.qr_rotation();
    let mut interval = tokio::time::interval(qr_rotation);
    loop {
        interval.tick().await;

        match state.store.room_count().await {
            Ok(count) => state.observer.set_rooms_current(count as i64),
            Err(e) => {
                tracing::warn!(error = %e, "room_count failed during rotation sweep");
                state.observer.store_error();
            }
        }

        let now_unix_ms = chrono::Utc::now().timestamp_millis();
        let rotated = state
            .router
            .rotate_due(Instant::now(), qr_rotation, |room_id| {
                let jti = crate::protocol::random_id_128();
                let exp = now_unix_ms + qr_rotation.as_millis() as i64;
                (state.codec.mint(room_id, exp, &jti), exp)
            })
            .await;

        for room in rotated {
            if let Err(e) = state.store.touch(&room.room_id, state.config.room_key_ttl()).await {
                tracing::warn!(room = %crate::fingerprint::fingerprint(&room.room_id), error = %e, "touch failed during rotation");
                state.observer.store_error();
                continue;
            }
            let payload = qr_rotated_frame(&room.room_id, &room.qr_token, room.qr_expires_at_ms);
            for conn_id in &room.members {
                if let Some(handle) = state.registry.handle(conn_id).await {
                    let _ = handle.try_send_frame(payload.clone(), state.config.max_ws_frame_bytes * 4);
                }
            }
        }
    }
}
