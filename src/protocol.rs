//! The Protocol Engine: parses the typed wire envelope, enforces the connection state machine,
//! and orchestrates the token codec, room store, and router (`spec.md` §4.8).
//!
//! Dispatch is by a string tag, per the "dynamic message dispatch by a string tag" strategy in
//! `spec.md` §9: `parse_frame` is the only place that names tags, and every handler below returns
//! a `Result<Vec<Effect>, RelayError>` rather than writing to a socket itself, so `error::resolve`
//! stays the single place that decides close-vs-error-frame.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::codec::TokenCodec;
use crate::config::Config;
use crate::connection::ConnectionContext;
use crate::error::{CloseCode, RelayError, WireErrorCode};
use crate::router::Router;
use crate::store::{JoinOutcome, RoomStore};

/// A fully parsed, tag-dispatched client frame. The parser is the only place that interprets the
/// `t` field; everything downstream matches on this enum exhaustively.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Ping,
    RoomCreate,
    JoinRequest {
        rid: String,
        token: String,
        label: Option<String>,
    },
    Leave {
        rid: String,
    },
    AppMsg {
        rid: String,
        ciphertext_b64: String,
    },
    MediaMsg {
        rid: String,
        mime: String,
        size: u64,
        chunk_size: u64,
        chunks: Vec<String>,
        from: Option<String>,
    },
}

impl ClientFrame {
    /// The wire tag this frame was parsed from, used only for logging (never the body).
    pub fn tag(&self) -> &'static str {
        match self {
            ClientFrame::Ping => "PING",
            ClientFrame::RoomCreate => "ROOM_CREATE",
            ClientFrame::JoinRequest { .. } => "JOIN_REQUEST",
            ClientFrame::Leave { .. } => "LEAVE",
            ClientFrame::AppMsg { .. } => "APP_MSG",
            ClientFrame::MediaMsg { .. } => "MEDIA_MSG",
        }
    }
}

#[derive(Deserialize)]
struct JoinRequestBody {
    rid: String,
    token: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct LeaveBody {
    rid: String,
}

#[derive(Deserialize)]
struct AppMsgBody {
    rid: String,
    #[serde(rename = "ciphertextB64")]
    ciphertext_b64: String,
}

#[derive(Deserialize)]
struct MediaMsgBody {
    rid: String,
    mime: String,
    size: u64,
    chunk_size: u64,
    chunks: Vec<String>,
    #[serde(default)]
    from: Option<String>,
}

/// Parses one raw text frame into `{v, t, id, body}`, then dispatches `body` by `t`. Any
/// structural problem is a schema violation, which the caller closes with `1003` per `spec.md`
/// §4.8 ("All incoming frames MUST be schema-validated; any violation → close with
/// unsupported-data"). Error text for tags carrying opaque payload fields (`APP_MSG`,
/// `MEDIA_MSG`) is kept generic so a malformed ciphertext/chunk value is never echoed into a
/// message that could end up in a log line.
pub fn parse_frame(raw: &str) -> Result<(ClientFrame, Option<String>), RelayError> {
    let envelope: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| RelayError::SchemaViolation("invalid json".into()))?;

    let v = envelope.get("v").and_then(|v| v.as_u64());
    if v != Some(1) {
        return Err(RelayError::SchemaViolation("unsupported envelope version".into()));
    }
    let tag = envelope
        .get("t")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::SchemaViolation("missing tag".into()))?;
    let id = envelope.get("id").and_then(|v| v.as_str()).map(str::to_string);
    let body = envelope.get("body").cloned().unwrap_or(serde_json::Value::Null);

    let frame = match tag {
        "PING" => ClientFrame::Ping,
        "ROOM_CREATE" => ClientFrame::RoomCreate,
        "JOIN_REQUEST" => {
            let b: JoinRequestBody = serde_json::from_value(body)
                .map_err(|e| RelayError::SchemaViolation(format!("JOIN_REQUEST: {e}")))?;
            ClientFrame::JoinRequest {
                rid: b.rid,
                token: b.token,
                label: b.label,
            }
        }
        "LEAVE" => {
            let b: LeaveBody = serde_json::from_value(body)
                .map_err(|e| RelayError::SchemaViolation(format!("LEAVE: {e}")))?;
            ClientFrame::Leave { rid: b.rid }
        }
        "APP_MSG" => {
            let b: AppMsgBody =
                serde_json::from_value(body).map_err(|_| RelayError::SchemaViolation("APP_MSG: malformed body".into()))?;
            ClientFrame::AppMsg {
                rid: b.rid,
                ciphertext_b64: b.ciphertext_b64,
            }
        }
        "MEDIA_MSG" => {
            let b: MediaMsgBody = serde_json::from_value(body)
                .map_err(|_| RelayError::SchemaViolation("MEDIA_MSG: malformed body".into()))?;
            ClientFrame::MediaMsg {
                rid: b.rid,
                mime: b.mime,
                size: b.size,
                chunk_size: b.chunk_size,
                chunks: b.chunks,
                from: b.from,
            }
        }
        other => return Err(RelayError::SchemaViolation(format!("unknown tag: {other}"))),
    };

    Ok((frame, id))
}

#[derive(Serialize)]
struct Hello {
    server_time_ms: i64,
}

#[derive(Serialize)]
struct Pong {}

#[derive(Serialize)]
struct RoomCreated<'a> {
    rid: &'a str,
    qr_token: &'a str,
    qr_exp: i64,
    max: u32,
}

#[derive(Serialize)]
struct Joined<'a> {
    rid: &'a str,
    participants: u32,
    max: u32,
    label: &'a str,
    next_token: &'a str,
    next_token_exp: i64,
}

#[derive(Serialize)]
struct Left<'a> {
    rid: &'a str,
}

#[derive(Serialize)]
struct QrRotated<'a> {
    rid: &'a str,
    qr_token: &'a str,
    qr_exp: i64,
}

#[derive(Serialize)]
struct RoomStats<'a> {
    rid: &'a str,
    participants: u32,
    max: u32,
}

#[derive(Serialize)]
struct SystemMsg<'a> {
    text: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct AppMsgOut<'a> {
    rid: &'a str,
    #[serde(rename = "ciphertextB64")]
    ciphertext_b64: &'a str,
}

#[derive(Serialize)]
struct MediaMsgOut<'a> {
    rid: &'a str,
    mime: &'a str,
    size: u64,
    chunk_size: u64,
    chunks: &'a [String],
    from: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorOut {
    code: WireErrorCode,
    retryable: bool,
}

/// Serializes `{v:1, t, id, body}` once; the resulting `Arc<str>` is what gets cloned into every
/// recipient's outbound queue without re-serializing per recipient.
fn envelope(tag: &'static str, id: Option<&str>, body: impl Serialize) -> Arc<str> {
    let value = serde_json::json!({
        "v": 1,
        "t": tag,
        "id": id,
        "body": body,
    });
    Arc::from(value.to_string())
}

pub fn hello_frame(server_time_ms: i64) -> Arc<str> {
    envelope("HELLO", None, Hello { server_time_ms })
}

/// Renders the wire `ERROR` frame for a `RelayError` that resolved to an error-frame outcome,
/// per the retryability table in `spec.md` §7. `retryable` is taken from `error::resolve` rather
/// than recomputed from `code` here, because one wire code can carry different retryability
/// depending on which `RelayError` produced it (an external-store failure reuses `NO_ROOM` but
/// is retryable, unlike a `NO_ROOM` from an actual membership check).
pub fn error_frame(id: Option<&str>, code: WireErrorCode, retryable: bool) -> Arc<str> {
    envelope("ERROR", id, ErrorOut { code, retryable })
}

/// What a handler wants done, in the order it must happen (`spec.md` §5: `ROOM_STATS` follows
/// the `SYSTEM_MSG` that announced a transition, both follow the reply to the actor).
pub enum Effect {
    Reply(Arc<str>),
    /// `exclude` is the sender's own `conn_id` when the frame being relayed must not echo back
    /// to its origin (`spec.md` I3: "delivered ... to every other current member ... and to no
    /// one else").
    Broadcast {
        room_id: String,
        payload: Arc<str>,
        exclude: Option<String>,
    },
}

/// 128 bits of randomness, hex-encoded — used for room ids and token `jti`s (`spec.md` §3).
pub fn random_id_128() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Engine {
    store: Arc<dyn RoomStore>,
    router: Arc<Router>,
    codec: Arc<TokenCodec>,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(store: Arc<dyn RoomStore>, router: Arc<Router>, codec: Arc<TokenCodec>, config: Arc<Config>) -> Self {
        Self {
            store,
            router,
            codec,
            config,
        }
    }

    fn mark_jti_ttl(&self) -> Duration {
        self.config.room_key_ttl() + Duration::from_secs(5)
    }

    fn mint(&self, room_id: &str, ttl: Duration, now_unix_ms: i64) -> (String, i64) {
        let jti = random_id_128();
        let exp = now_unix_ms + ttl.as_millis() as i64;
        (self.codec.mint(room_id, exp, &jti), exp)
    }

    /// Runs one client frame against the connection's current state, mutating `ctx` on success
    /// and returning the ordered effects the caller (the connection's write loop) must apply.
    pub async fn handle(
        &self,
        ctx: &mut ConnectionContext,
        frame: ClientFrame,
        request_id: Option<&str>,
        now_unix_ms: i64,
    ) -> Result<Vec<Effect>, RelayError> {
        match frame {
            ClientFrame::Ping => Ok(vec![Effect::Reply(envelope("PONG", request_id, Pong {}))]),

            ClientFrame::RoomCreate => self.handle_room_create(ctx, request_id, now_unix_ms).await,

            ClientFrame::JoinRequest { rid, token, label } => {
                self.handle_join(ctx, rid, token, label, request_id, now_unix_ms).await
            }

            ClientFrame::Leave { rid } => self.handle_leave(ctx, rid, request_id).await,

            ClientFrame::AppMsg { rid, ciphertext_b64 } => {
                self.handle_app_msg(ctx, rid, ciphertext_b64).await
            }

            ClientFrame::MediaMsg {
                rid,
                mime,
                size,
                chunk_size,
                chunks,
                from,
            } => {
                self.handle_media_msg(ctx, rid, mime, size, chunk_size, chunks, from).await
            }
        }
    }

    async fn handle_room_create(
        &self,
        ctx: &mut ConnectionContext,
        request_id: Option<&str>,
        now_unix_ms: i64,
    ) -> Result<Vec<Effect>, RelayError> {
        if ctx.is_in_room() {
            return Err(RelayError::AlreadyInRoom);
        }

        let rid = random_id_128();
        let ttl = self.config.room_key_ttl();
        self.store.create_with(&rid, &ctx.conn_id, ttl).await?;

        let qr_rotation = self.config.qr_rotation();
        let (qr_token, qr_exp) = self
            .router
            .track_local_join(&rid, &ctx.conn_id, || self.mint(&rid, qr_rotation, now_unix_ms), qr_rotation)
            .await;

        ctx.room_id = Some(rid.clone());
        ctx.label = Some("P1".to_string());

        let max = self.config.room_max_participants;
        let reply = envelope(
            "ROOM_CREATED",
            request_id,
            RoomCreated {
                rid: &rid,
                qr_token: &qr_token,
                qr_exp,
                max,
            },
        );
        let stats = envelope(
            "ROOM_STATS",
            None,
            RoomStats {
                rid: &rid,
                participants: 1,
                max,
            },
        );

        Ok(vec![
            Effect::Reply(reply),
            Effect::Broadcast {
                room_id: rid,
                payload: stats,
                exclude: None,
            },
        ])
    }

    async fn handle_join(
        &self,
        ctx: &mut ConnectionContext,
        rid: String,
        token: String,
        label: Option<String>,
        request_id: Option<&str>,
        now_unix_ms: i64,
    ) -> Result<Vec<Effect>, RelayError> {
        if ctx.is_in_room() {
            return Err(RelayError::AlreadyInRoom);
        }

        let verified = self.codec.verify(&token, &rid, now_unix_ms)?;

        let fresh = self.store.mark_jti(&rid, &verified.jti, self.mark_jti_ttl()).await?;
        if !fresh {
            return Err(RelayError::TokenReplay);
        }

        let ttl = self.config.room_key_ttl();
        let outcome = self
            .store
            .try_join(&rid, &ctx.conn_id, self.config.room_max_participants, ttl)
            .await?;

        let (count, store_label) = match outcome {
            JoinOutcome::Joined { count, label } => (count, label),
            JoinOutcome::NoRoom => return Err(RelayError::NoRoom),
            JoinOutcome::Full => return Err(RelayError::RoomFull),
        };

        // Open question (spec.md §9): a client-supplied label overrides the store's P<count>
        // label when present; falling back to the store label matches the literal scenario S1
        // ("label: bob").
        let resolved_label = label.unwrap_or(store_label);

        let qr_rotation = self.config.qr_rotation();
        let (_, _) = self
            .router
            .track_local_join(&rid, &ctx.conn_id, || self.mint(&rid, qr_rotation, now_unix_ms), qr_rotation)
            .await;

        ctx.room_id = Some(rid.clone());
        ctx.label = Some(resolved_label.clone());

        // Treated as a reconnect capability only; expires independently of room TTL rather than
        // being clamped to it (spec.md §9, second open question).
        let (next_token, next_token_exp) = self.mint(&rid, ttl, now_unix_ms);

        let max = self.config.room_max_participants;
        let reply = envelope(
            "JOINED",
            request_id,
            Joined {
                rid: &rid,
                participants: count,
                max,
                label: &resolved_label,
                next_token: &next_token,
                next_token_exp,
            },
        );
        let entered = envelope(
            "SYSTEM_MSG",
            None,
            SystemMsg {
                text: &format!("this person has entered the chat with the name {resolved_label}"),
                kind: "info",
            },
        );
        let stats = envelope(
            "ROOM_STATS",
            None,
            RoomStats {
                rid: &rid,
                participants: count,
                max,
            },
        );

        Ok(vec![
            Effect::Reply(reply),
            Effect::Broadcast {
                room_id: rid.clone(),
                payload: entered,
                exclude: None,
            },
            Effect::Broadcast {
                room_id: rid,
                payload: stats,
                exclude: None,
            },
        ])
    }

    async fn handle_leave(
        &self,
        ctx: &mut ConnectionContext,
        rid: String,
        request_id: Option<&str>,
    ) -> Result<Vec<Effect>, RelayError> {
        if ctx.room_id.as_deref() != Some(rid.as_str()) {
            return Err(RelayError::NotInRoom);
        }

        let ttl = self.config.room_key_ttl();
        let remaining = self.store.leave(&rid, &ctx.conn_id, ttl).await?;
        self.router.track_local_leave(&rid, &ctx.conn_id).await;

        ctx.room_id = None;
        let left_label = ctx.label.take().unwrap_or_else(|| "someone".to_string());

        let mut effects = vec![Effect::Reply(envelope("LEFT", request_id, Left { rid: &rid }))];

        if remaining > 0 {
            let max = self.config.room_max_participants;
            let left_msg = envelope(
                "SYSTEM_MSG",
                None,
                SystemMsg {
                    text: &format!("{left_label} has left the chat"),
                    kind: "info",
                },
            );
            let stats = envelope(
                "ROOM_STATS",
                None,
                RoomStats {
                    rid: &rid,
                    participants: remaining,
                    max,
                },
            );
            effects.push(Effect::Broadcast {
                room_id: rid.clone(),
                payload: left_msg,
                exclude: None,
            });
            effects.push(Effect::Broadcast {
                room_id: rid,
                payload: stats,
                exclude: None,
            });
        }

        Ok(effects)
    }

    async fn handle_app_msg(
        &self,
        ctx: &mut ConnectionContext,
        rid: String,
        ciphertext_b64: String,
    ) -> Result<Vec<Effect>, RelayError> {
        if ctx.room_id.as_deref() != Some(rid.as_str()) {
            return Err(RelayError::NotInRoom);
        }
        if ciphertext_b64.len() > self.config.max_ct_bytes {
            return Err(RelayError::CiphertextTooLarge);
        }

        let ttl = self.config.room_key_ttl();
        self.store.touch(&rid, ttl).await?;

        let payload = envelope(
            "APP_MSG",
            None,
            AppMsgOut {
                rid: &rid,
                ciphertext_b64: &ciphertext_b64,
            },
        );

        Ok(vec![Effect::Broadcast {
            room_id: rid,
            payload,
            exclude: Some(ctx.conn_id.clone()),
        }])
    }

    async fn handle_media_msg(
        &self,
        ctx: &mut ConnectionContext,
        rid: String,
        mime: String,
        size: u64,
        chunk_size: u64,
        chunks: Vec<String>,
        from: Option<String>,
    ) -> Result<Vec<Effect>, RelayError> {
        if ctx.room_id.as_deref() != Some(rid.as_str()) {
            return Err(RelayError::NotInRoom);
        }

        const MAX_MEDIA_BYTES: u64 = 14 * 1024 * 1024;
        const MAX_CHUNKS: usize = 128;

        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        if total > MAX_MEDIA_BYTES || chunks.is_empty() || chunks.len() > MAX_CHUNKS {
            return Err(RelayError::MediaTooLarge);
        }

        let ttl = self.config.room_key_ttl();
        self.store.touch(&rid, ttl).await?;

        let payload = envelope(
            "MEDIA_MSG",
            None,
            MediaMsgOut {
                rid: &rid,
                mime: &mime,
                size,
                chunk_size,
                chunks: &chunks,
                from: from.as_deref(),
            },
        );

        Ok(vec![Effect::Broadcast {
            room_id: rid,
            payload,
            exclude: Some(ctx.conn_id.clone()),
        }])
    }
}

/// Renders the `QR_ROTATED` frame the rotation sweep broadcasts to a room's members.
pub fn qr_rotated_frame(rid: &str, qr_token: &str, qr_exp: i64) -> Arc<str> {
    envelope("QR_ROTATED", None, QrRotated { rid, qr_token, qr_exp })
}

/// Renders a `Close` the caller should send before actually closing the socket, for the one
/// close reason spoken as a frame: graceful shutdown. Most close paths (§4.9) send no frame.
pub fn close_reason(code: CloseCode) -> &'static str {
    match code {
        CloseCode::PolicyViolation => "policy violation",
        CloseCode::UnsupportedData => "unsupported data",
        CloseCode::InternalError => "internal error",
        CloseCode::GoingAway => "server shutting down",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionContext;
    use crate::store::InMemoryRoomStore;
    use crate::token_bucket::TokenBucket;
    use std::time::Duration as StdDuration;

    fn engine() -> Engine {
        let store: Arc<dyn RoomStore> = Arc::new(InMemoryRoomStore::new());
        let router = Arc::new(Router::new());
        let codec = Arc::new(TokenCodec::new(b"0123456789abcdef0123456789abcdef".to_vec()));
        let config = Arc::new(Config {
            join_token_secret: "x".repeat(32),
            kv_url: "redis://localhost".to_string(),
            room_max_participants: 2,
            ..Config::default()
        });
        Engine::new(store, router, codec, config)
    }

    fn ctx(conn_id: &str) -> ConnectionContext {
        ConnectionContext::new(
            conn_id.to_string(),
            "127.0.0.1".to_string(),
            TokenBucket::new(200, 200, StdDuration::from_secs(10)),
            TokenBucket::new(1_048_576, 1_048_576, StdDuration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn ping_replies_pong_without_touching_state() {
        let engine = engine();
        let mut a = ctx("a");
        let effects = engine.handle(&mut a, ClientFrame::Ping, Some("req-1"), 0).await.unwrap();
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Reply(_)));
        assert!(!a.is_in_room());
    }

    #[tokio::test]
    async fn room_create_then_join_relays_without_echo() {
        // S1
        let engine = engine();
        let mut a = ctx("a");
        let created = engine
            .handle(&mut a, ClientFrame::RoomCreate, Some("req-1"), 0)
            .await
            .unwrap();
        let rid = a.room_id.clone().unwrap();
        let Effect::Reply(reply) = &created[0] else { panic!("expected reply") };
        let reply_json: serde_json::Value = serde_json::from_str(reply).unwrap();
        let token = reply_json["body"]["qr_token"].as_str().unwrap().to_string();

        let mut b = ctx("b");
        let joined = engine
            .handle(
                &mut b,
                ClientFrame::JoinRequest {
                    rid: rid.clone(),
                    token,
                    label: Some("bob".to_string()),
                },
                Some("req-2"),
                0,
            )
            .await
            .unwrap();
        assert_eq!(b.label.as_deref(), Some("bob"));
        assert_eq!(joined.len(), 3);

        let msg = engine
            .handle(
                &mut a,
                ClientFrame::AppMsg {
                    rid: rid.clone(),
                    ciphertext_b64: "AAA".to_string(),
                },
                None,
                0,
            )
            .await
            .unwrap();
        match &msg[0] {
            Effect::Broadcast { room_id, exclude, .. } => {
                assert_eq!(room_id, &rid);
                assert_eq!(exclude.as_deref(), Some("a"));
            }
            _ => panic!("expected broadcast"),
        }
    }

    #[tokio::test]
    async fn replayed_token_is_rejected() {
        // S2
        let engine = engine();
        let mut a = ctx("a");
        let created = engine
            .handle(&mut a, ClientFrame::RoomCreate, None, 0)
            .await
            .unwrap();
        let rid = a.room_id.clone().unwrap();
        let Effect::Reply(reply) = &created[0] else { panic!("expected reply") };
        let reply_json: serde_json::Value = serde_json::from_str(reply).unwrap();
        let token = reply_json["body"]["qr_token"].as_str().unwrap().to_string();

        let mut b = ctx("b");
        engine
            .handle(
                &mut b,
                ClientFrame::JoinRequest {
                    rid: rid.clone(),
                    token: token.clone(),
                    label: None,
                },
                None,
                0,
            )
            .await
            .unwrap();

        let mut c = ctx("c");
        let err = engine
            .handle(
                &mut c,
                ClientFrame::JoinRequest {
                    rid,
                    token,
                    label: None,
                },
                None,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenReplay));
    }

    #[tokio::test]
    async fn over_capacity_join_is_rejected() {
        // S3: room_max_participants is 2 in the test engine.
        let engine = engine();
        let mut a = ctx("a");
        engine.handle(&mut a, ClientFrame::RoomCreate, None, 0).await.unwrap();
        let rid = a.room_id.clone().unwrap();

        let mut b = ctx("b");
        let join_b = engine
            .handle(
                &mut b,
                ClientFrame::JoinRequest {
                    rid: rid.clone(),
                    token: fresh_token(&engine, &rid),
                    label: None,
                },
                None,
                0,
            )
            .await
            .unwrap();
        assert!(!join_b.is_empty());

        let mut c = ctx("c");
        let token_c = fresh_token(&engine, &rid);
        let err = engine
            .handle(
                &mut c,
                ClientFrame::JoinRequest {
                    rid,
                    token: token_c,
                    label: None,
                },
                None,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RoomFull));
    }

    fn fresh_token(engine: &Engine, rid: &str) -> String {
        let jti = random_id_128();
        engine.codec.mint(rid, 1_000_000, &jti)
    }

    #[tokio::test]
    async fn oversized_ciphertext_is_rejected() {
        // B2
        let engine = engine();
        let mut a = ctx("a");
        engine.handle(&mut a, ClientFrame::RoomCreate, None, 0).await.unwrap();
        let rid = a.room_id.clone().unwrap();

        let max = engine.config.max_ct_bytes;
        let ok = "x".repeat(max);
        let too_big = "x".repeat(max + 1);

        assert!(engine
            .handle(
                &mut a,
                ClientFrame::AppMsg {
                    rid: rid.clone(),
                    ciphertext_b64: ok,
                },
                None,
                0,
            )
            .await
            .is_ok());

        let err = engine
            .handle(
                &mut a,
                ClientFrame::AppMsg {
                    rid,
                    ciphertext_b64: too_big,
                },
                None,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::CiphertextTooLarge));
    }

    #[tokio::test]
    async fn last_leave_means_subsequent_join_sees_no_room() {
        // S6
        let engine = engine();
        let mut a = ctx("a");
        engine.handle(&mut a, ClientFrame::RoomCreate, None, 0).await.unwrap();
        let rid = a.room_id.clone().unwrap();

        let token = fresh_token(&engine, &rid);
        engine
            .handle(&mut a, ClientFrame::Leave { rid: rid.clone() }, None, 0)
            .await
            .unwrap();

        let mut z = ctx("z");
        let err = engine
            .handle(
                &mut z,
                ClientFrame::JoinRequest {
                    rid,
                    token,
                    label: None,
                },
                None,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoRoom));
    }

    #[test]
    fn unknown_tag_is_a_schema_violation() {
        let raw = r#"{"v":1,"t":"NOT_A_TAG","id":"1","body":{}}"#;
        let err = parse_frame(raw).unwrap_err();
        assert!(matches!(err, RelayError::SchemaViolation(_)));
    }

    #[test]
    fn ping_parses_with_no_body() {
        let raw = r#"{"v":1,"t":"PING","id":"1"}"#;
        let (frame, id) = parse_frame(raw).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
        assert_eq!(id.as_deref(), Some("1"));
    }
}
