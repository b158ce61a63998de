// Route module decomposition — each domain area in its own file.
// Shared types (request guards) live here; route functions in submodules.

mod rooms;
mod system;

pub use rooms::{create_room, get_room_token};
pub use system::{health, live, metrics, not_found, ready, too_many_requests};

// --- Shared request guards ---

use rocket::request::{FromRequest, Outcome, Request};

/// The caller's IP, preferring a proxy-set `X-Forwarded-For` over the socket's own remote
/// address, used both for admission-style HTTP rate limiting and for log correlation.
pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}
