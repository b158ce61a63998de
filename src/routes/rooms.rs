use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use std::time::Duration;

use crate::fingerprint::fingerprint;
use crate::protocol::random_id_128;
use crate::rate_limit::{RateLimitConfig, RateLimited, RateLimiter};
use crate::RelayState;

use super::ClientIp;

/// Creates an empty room the same way the first `ROOM_CREATE` socket would, so a client can mint
/// a room id up front and hand its fingerprint out-of-band before anyone connects (`spec.md` §6).
#[post("/rooms")]
pub async fn create_room(
    state: &State<RelayState>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
) -> Result<RateLimited<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let rl = rate_limiter.check_with_info(&format!("rooms:{}", ip.0), rate_config.rooms_max, rate_config.rooms_window_secs);
    if !rl.allowed {
        return Err((
            Status::TooManyRequests,
            Json(serde_json::json!({
                "error": format!("rate limited: max {} room creations per window", rate_config.rooms_max),
                "retry_after_secs": rl.retry_after_secs,
                "limit": rl.limit,
                "remaining": 0
            })),
        ));
    }

    let room_id = random_id_128();
    state
        .store
        .create_empty(&room_id, state.config.room_key_ttl())
        .await
        .map_err(|e| {
            state.observer.store_error();
            (
                Status::ServiceUnavailable,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        })?;
    state.observer.store_recovered();
    state.observer.room_created();

    Ok(RateLimited::new(
        Json(serde_json::json!({
            "room_id": room_id,
            "fingerprint": fingerprint(&room_id),
            "network_ip": Option::<String>::None,
        })),
        rl,
    ))
}

/// Mints a short-lived reconnect token for an existing room (`spec.md` §6). 404 if the room's
/// store record has already expired or never existed — there is no other source of truth.
#[get("/rooms/<room_id>/token")]
pub async fn get_room_token(
    state: &State<RelayState>,
    room_id: &str,
) -> Result<Json<serde_json::Value>, Status> {
    let exists = state.store.exists(room_id).await.map_err(|_| Status::ServiceUnavailable)?;
    if !exists {
        return Err(Status::NotFound);
    }

    let now_unix_ms = chrono::Utc::now().timestamp_millis();
    let exp_unix_ms = now_unix_ms + Duration::from_secs(60).as_millis() as i64;
    let jti = random_id_128();
    let token = state.codec.mint(room_id, exp_unix_ms, &jti);

    Ok(Json(serde_json::json!({
        "room_id": room_id,
        "token": token,
        "exp_unix_ms": exp_unix_ms,
    })))
}
