use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, State};

use crate::RelayState;

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ghostline-relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Reflects Room Store reachability (`spec.md` §6, §4.9): unready the instant a store call
/// surfaces a connection-level failure, ready again on the next successful one.
#[get("/ready")]
pub fn ready(state: &State<RelayState>) -> (Status, Json<serde_json::Value>) {
    if state.observer.is_ready() {
        (Status::Ok, Json(serde_json::json!({"ready": true})))
    } else {
        (Status::ServiceUnavailable, Json(serde_json::json!({"ready": false})))
    }
}

/// Always OK while the process is running; distinct from `/ready`, which depends on an external
/// collaborator.
#[get("/live")]
pub fn live() -> Json<serde_json::Value> {
    Json(serde_json::json!({"live": true}))
}

/// Negotiates Prometheus text vs JSON by `Accept`, matching `spec.md` §6's "Prometheus-style
/// text or JSON by accept header". Never carries client identifiers, IPs, or ciphertext — the
/// `Observer` it reads from only ever holds aggregate counters.
#[get("/metrics")]
pub fn metrics(state: &State<RelayState>, accept: AcceptsJson) -> (ContentType, String) {
    if accept.0 {
        (ContentType::JSON, state.observer.render_json().to_string())
    } else {
        (ContentType::Plain, state.observer.render_prometheus())
    }
}

pub struct AcceptsJson(bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AcceptsJson {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let wants_json = req
            .headers()
            .get_one("Accept")
            .map(|a| a.contains("application/json"))
            .unwrap_or(false);
        Outcome::Success(AcceptsJson(wants_json))
    }
}

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "too many requests"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "not found"}))
}
