//! Typed, layered configuration: built-in defaults -> optional `relay.toml` -> `RELAY_*` env vars.
//!
//! Layering mirrors how `timokoesters-conduit` builds its `Config` from `conduit.toml` plus
//! environment overrides via `figment`.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address for the raw WebSocket listener (not the Rocket HTTP surface).
    pub ws_bind_addr: String,

    pub room_max_participants: u32,
    pub room_key_ttl_ms: u64,
    pub qr_rotation_ms: u64,

    pub max_ws_frame_bytes: usize,
    pub max_ct_bytes: usize,

    pub max_msgs_per_10s: u32,
    pub max_bytes_per_10s: u64,

    pub max_conns_per_ip: u32,
    pub max_total_connections: u32,

    pub ws_ping_interval_ms: u64,
    pub ws_ping_timeout_ms: u64,

    pub graceful_shutdown_deadline_ms: u64,

    /// MAC key for the join token codec. Must be >= 32 bytes. Required: no safe default.
    pub join_token_secret: String,

    /// External key-value store connection string. Required: no safe default.
    pub kv_url: String,
    pub kv_connect_timeout_ms: u64,
    pub kv_max_retries_per_request: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_bind_addr: "0.0.0.0:9001".to_string(),
            room_max_participants: 10,
            room_key_ttl_ms: 600_000,
            qr_rotation_ms: 60_000,
            max_ws_frame_bytes: 262_144,
            max_ct_bytes: 65_536,
            max_msgs_per_10s: 200,
            max_bytes_per_10s: 1_048_576,
            max_conns_per_ip: 50,
            max_total_connections: 10_000,
            ws_ping_interval_ms: 30_000,
            ws_ping_timeout_ms: 5_000,
            graceful_shutdown_deadline_ms: 30_000,
            join_token_secret: String::new(),
            kv_url: String::new(),
            kv_connect_timeout_ms: 2_000,
            kv_max_retries_per_request: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Figment(#[from] figment::Error),
    #[error("join_token_secret must be set and at least 32 bytes")]
    SecretTooShort,
    #[error("kv_url must be set")]
    MissingKvUrl,
}

impl Config {
    /// Loads configuration from defaults, an optional `relay.toml`, then `RELAY_*` env vars
    /// (highest priority), validating the fields `spec.md` §6 calls out as required or bounded.
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("relay.toml"))
            .merge(Env::prefixed("RELAY_"));

        let mut config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.join_token_secret.len() < 32 {
            return Err(ConfigError::SecretTooShort);
        }
        if self.kv_url.is_empty() {
            return Err(ConfigError::MissingKvUrl);
        }
        // room_max_participants is described as a "bound" (1..50) rather than a hard
        // rejection, so out-of-range values are clamped with a startup warning.
        let clamped = self.room_max_participants.clamp(1, 50);
        if clamped != self.room_max_participants {
            tracing::warn!(
                requested = self.room_max_participants,
                clamped,
                "room_max_participants out of bounds, clamping"
            );
            self.room_max_participants = clamped;
        }
        if self.room_key_ttl_ms < 60_000 {
            tracing::warn!(
                requested = self.room_key_ttl_ms,
                "room_key_ttl_ms below 60_000ms minimum, clamping"
            );
            self.room_key_ttl_ms = 60_000;
        }
        if self.qr_rotation_ms < 10_000 {
            tracing::warn!(
                requested = self.qr_rotation_ms,
                "qr_rotation_ms below 10_000ms minimum, clamping"
            );
            self.qr_rotation_ms = 10_000;
        }
        Ok(())
    }

    pub fn room_key_ttl(&self) -> Duration {
        Duration::from_millis(self.room_key_ttl_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws_ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_ping_timeout_ms)
    }

    pub fn qr_rotation(&self) -> Duration {
        Duration::from_millis(self.qr_rotation_ms)
    }

    pub fn graceful_shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_participant_cap() {
        let mut config = Config {
            join_token_secret: "x".repeat(32),
            kv_url: "redis://localhost".to_string(),
            room_max_participants: 500,
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.room_max_participants, 50);
    }

    #[test]
    fn rejects_short_secret() {
        let mut config = Config {
            join_token_secret: "short".to_string(),
            kv_url: "redis://localhost".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::SecretTooShort)));
    }

    #[test]
    fn rejects_missing_kv_url() {
        let mut config = Config {
            join_token_secret: "x".repeat(32),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingKvUrl)));
    }
}
