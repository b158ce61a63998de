use std::sync::Arc;

use ghostline_relay::config::Config;
use ghostline_relay::store::InMemoryRoomStore;
use ghostline_relay::{build_rocket, RelayState};
use rocket::local::blocking::Client;

/// Builds a test `RelayState` against the in-memory `RoomStore` fake instead of a live Redis,
/// the same substitution the protocol-engine unit tests make, just driven through the full
/// Rocket HTTP surface.
pub fn test_config() -> Config {
    Config {
        join_token_secret: "x".repeat(32),
        kv_url: "redis://localhost".to_string(),
        ..Config::default()
    }
}

pub fn test_client() -> Client {
    let state = RelayState::new(Arc::new(InMemoryRoomStore::new()), Arc::new(test_config()));
    let rocket = build_rocket(state);
    Client::tracked(rocket).expect("valid rocket instance")
}
