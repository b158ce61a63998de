pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod fingerprint;
pub mod meters;
pub mod observer;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod routes;
pub mod store;
pub mod sweep;
pub mod token_bucket;
pub mod ws;

use std::sync::Arc;

use rocket_cors::CorsOptions;

use codec::TokenCodec;
use config::Config;
use connection::ConnectionRegistry;
use meters::{GlobalMeter, IpMeter};
use observer::Observer;
use protocol::Engine;
use rate_limit::{RateLimitConfig, RateLimiter};
use router::Router;
use store::RoomStore;

/// Everything a connection task or an HTTP handler needs to reach the room store, the
/// in-process router, and the shared protocol engine. Built once in `main.rs` and handed to
/// both the Rocket HTTP surface and the raw WebSocket accept loop; every field is an `Arc` or
/// otherwise cheaply `Clone`, so the same backing state can be shared between the two listeners
/// without a wrapping `Arc<RelayState>` on the Rocket side (Rocket owns its managed state).
#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<dyn RoomStore>,
    pub router: Arc<Router>,
    pub codec: Arc<TokenCodec>,
    pub config: Arc<Config>,
    pub observer: Observer,
    pub registry: Arc<ConnectionRegistry>,
    pub ip_meter: Arc<IpMeter>,
    pub global_meter: Arc<GlobalMeter>,
    pub engine: Arc<Engine>,
}

impl RelayState {
    pub fn new(store: Arc<dyn RoomStore>, config: Arc<Config>) -> Self {
        let router = Arc::new(Router::new());
        let codec = Arc::new(TokenCodec::new(config.join_token_secret.as_bytes().to_vec()));
        let engine = Arc::new(Engine::new(store.clone(), router.clone(), codec.clone(), config.clone()));

        Self {
            ip_meter: Arc::new(IpMeter::new(config.max_conns_per_ip)),
            global_meter: Arc::new(GlobalMeter::new(config.max_total_connections)),
            store,
            router,
            codec,
            config,
            observer: Observer::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            engine,
        }
    }
}

/// Builds the Rocket HTTP surface: room provisioning plus the `/health`, `/ready`, `/live`,
/// `/metrics` operational endpoints. The raw WebSocket listener is a separate server, started
/// alongside this one in `main.rs` (`spec.md` §2: the relay exposes a small HTTP utility surface
/// next to the WebSocket port, not behind it).
pub fn build_rocket(state: RelayState) -> rocket::Rocket<rocket::Build> {
    let rate_limit_config = RateLimitConfig::from_env();
    let rate_limiter = RateLimiter::new();

    let cors = CorsOptions::default().to_cors().expect("failed to build CORS layer");

    rocket::build()
        .manage(state)
        .manage(rate_limit_config)
        .manage(rate_limiter)
        .attach(cors)
        .register("/", rocket::catchers![routes::too_many_requests, routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::create_room,
                routes::get_room_token,
                routes::health,
                routes::ready,
                routes::live,
                routes::metrics,
            ],
        )
}
