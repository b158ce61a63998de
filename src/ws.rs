//! The raw WebSocket front door (`spec.md` §4.1, §4.2, §4.3): admission, per-connection
//! read/write loops, and the tagged-dispatch/fan-out wiring between them. This is a second,
//! independent listener alongside the Rocket HTTP surface built in `lib.rs`, not a route on it —
//! the wire protocol here is JSON-over-text-frame, not HTTP.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use tokio::sync::watch;

use crate::connection::{generate_conn_id, mark_frame_written, ConnectionContext, IpSlotGuard, Outbound};
use crate::error::{self, CloseCode, Resolution};
use crate::fanout;
use crate::protocol::{error_frame, hello_frame, ClientFrame, Effect};
use crate::token_bucket::TokenBucket;
use crate::RelayState;

/// Accepts connections until `shutdown` fires, admitting each one against the global and
/// per-IP ceilings before ever completing the WebSocket handshake (`spec.md` §4.1: admission
/// rejections close the socket immediately with no frame sent). Stopping the accept loop is
/// only the first half of graceful shutdown (`spec.md` §4.9, §6.11); the caller is still
/// responsible for closing already-admitted sockets and waiting out the shutdown deadline.
pub async fn run(state: Arc<RelayState>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&state.config.ws_bind_addr).await?;
    tracing::info!(addr = %state.config.ws_bind_addr, "websocket listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ip = peer_addr.ip().to_string();
                let state = state.clone();
                tokio::spawn(async move {
                    admit_and_serve(state, stream, ip).await;
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("websocket listener stopping: no longer accepting new connections");
                return Ok(());
            }
        }
    }
}

async fn admit_and_serve(state: Arc<RelayState>, stream: TcpStream, ip: String) {
    if !state.global_meter.try_inc() {
        state.observer.admission_rejected();
        return;
    }
    let Some(ip_guard) = IpSlotGuard::acquire(&state.ip_meter, &ip) else {
        state.global_meter.dec();
        state.observer.admission_rejected();
        return;
    };

    // tungstenite's own ceiling is deliberately looser than `max_ws_frame_bytes`: the exact
    // boundary (B3 — one byte over closes with policy-violation, not a bare socket drop) is
    // enforced explicitly in `run_one_frame`, which can still send a close frame. This is only a
    // backstop against frames too large to ever be a legitimate oversized-frame *report*.
    let ws_config = WebSocketConfig::default().max_message_size(Some(state.config.max_ws_frame_bytes * 4));
    let ws_stream = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake failed");
            drop(ip_guard);
            state.global_meter.dec();
            return;
        }
    };

    state.observer.connection_opened();
    let conn_id = generate_conn_id();
    let (mut rx, buffered_bytes) = state.registry.register(&conn_id).await;
    let max_buffered_bytes = state.config.max_ws_frame_bytes * 4;

    let (mut sink, mut source) = ws_stream.split();

    let handle = state.registry.handle(&conn_id).await.expect("just registered");
    let _ = handle.try_send_frame(hello_frame(chrono::Utc::now().timestamp_millis()), max_buffered_bytes);

    let writer_conn_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame { payload, len } => {
                    if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                    mark_frame_written(&buffered_bytes, len);
                }
                Outbound::Ping => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: code.code().into(),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        tracing::debug!(conn_id = %writer_conn_id, "writer task exiting");
    });

    let msg_bucket = TokenBucket::new(
        state.config.max_msgs_per_10s as u64,
        state.config.max_msgs_per_10s as u64,
        Duration::from_secs(10),
    );
    let byte_bucket = TokenBucket::new(
        state.config.max_bytes_per_10s,
        state.config.max_bytes_per_10s,
        Duration::from_secs(10),
    );
    let mut ctx = ConnectionContext::new(conn_id.clone(), ip, msg_bucket, byte_bucket);

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                if !run_one_frame(&state, &mut ctx, &text).await {
                    break;
                }
            }
            Message::Pong(_) => state.registry.mark_pong(&conn_id).await,
            Message::Close(_) => break,
            // Pings are answered by the underlying protocol implementation; binary frames have
            // no place in this wire format.
            Message::Ping(_) => {}
            Message::Binary(_) | Message::Frame(_) => {
                handle.close(CloseCode::UnsupportedData, "unsupported data");
                break;
            }
        }
    }

    cleanup(&state, &mut ctx).await;
    drop(ip_guard);
    state.global_meter.dec();
    state.registry.unregister(&conn_id).await;
    state.observer.connection_closed();
    writer.abort();
}

/// Charges the connection's rate-limit buckets, parses one wire frame, runs it through the
/// protocol engine, and applies the resulting effects. Returns `false` when the connection
/// should be torn down (a close was issued).
async fn run_one_frame(state: &Arc<RelayState>, ctx: &mut ConnectionContext, text: &str) -> bool {
    let max_buffered_bytes = state.config.max_ws_frame_bytes * 4;

    if text.len() > state.config.max_ws_frame_bytes {
        return resolve_and_apply(
            state,
            ctx,
            request_id_unknown(),
            crate::error::RelayError::OversizedFrame,
            max_buffered_bytes,
        )
        .await;
    }

    if !ctx.byte_bucket.take(text.len() as u64) || !ctx.msg_bucket.take(1) {
        state.observer.rate_limit_close();
        if let Some(handle) = state.registry.handle(&ctx.conn_id).await {
            handle.close(CloseCode::PolicyViolation, "rate limit exceeded");
        }
        return false;
    }

    let (frame, request_id) = match crate::protocol::parse_frame(text) {
        Ok(parsed) => parsed,
        Err(e) => return resolve_and_apply(state, ctx, request_id_unknown(), e, max_buffered_bytes).await,
    };

    let tag = frame.tag();
    let now_unix_ms = chrono::Utc::now().timestamp_millis();
    match state.engine.handle(ctx, frame, request_id.as_deref(), now_unix_ms).await {
        Ok(effects) => {
            if tag == "APP_MSG" {
                state.observer.message_relayed();
            } else if tag == "MEDIA_MSG" {
                state.observer.media_relayed();
            } else if tag == "ROOM_CREATE" {
                state.observer.room_created();
            }
            if matches!(tag, "ROOM_CREATE" | "JOIN_REQUEST" | "LEAVE" | "APP_MSG" | "MEDIA_MSG") {
                // Every one of these tags makes at least one RoomStore call; reaching here means
                // it succeeded, so readiness recovers on the next successful call as `spec.md`
                // §4.9 requires, without polling the store on a timer.
                state.observer.store_recovered();
            }
            apply_effects(state, ctx, effects, max_buffered_bytes).await;
            true
        }
        Err(e) => resolve_and_apply(state, ctx, request_id, e, max_buffered_bytes).await,
    }
}

fn request_id_unknown() -> Option<String> {
    None
}

async fn resolve_and_apply(
    state: &Arc<RelayState>,
    ctx: &ConnectionContext,
    request_id: Option<String>,
    err: crate::error::RelayError,
    max_buffered_bytes: usize,
) -> bool {
    if matches!(err, crate::error::RelayError::TokenReplay) {
        state.observer.token_replay();
    }
    if matches!(err, crate::error::RelayError::Store(_)) {
        state.observer.store_error();
    }

    match error::resolve(&err) {
        Resolution::ErrorFrame(code, retryable) => {
            if let Some(handle) = state.registry.handle(&ctx.conn_id).await {
                let _ = handle.try_send_frame(error_frame(request_id.as_deref(), code, retryable), max_buffered_bytes);
            }
            true
        }
        Resolution::Close(code, reason) => {
            if matches!(code, CloseCode::PolicyViolation) {
                state.observer.rate_limit_close();
            }
            if let Some(handle) = state.registry.handle(&ctx.conn_id).await {
                handle.close(code, reason);
            }
            false
        }
    }
}

async fn apply_effects(state: &Arc<RelayState>, ctx: &ConnectionContext, effects: Vec<Effect>, max_buffered_bytes: usize) {
    for effect in effects {
        match effect {
            Effect::Reply(payload) => {
                if let Some(handle) = state.registry.handle(&ctx.conn_id).await {
                    let _ = handle.try_send_frame(payload, max_buffered_bytes);
                }
            }
            Effect::Broadcast { room_id, payload, exclude } => {
                fanout::broadcast(
                    &state.router,
                    &state.registry,
                    &state.observer,
                    &room_id,
                    payload,
                    exclude.as_deref(),
                    max_buffered_bytes,
                )
                .await;
            }
        }
    }
}

/// Runs the same `LEAVE` path a client-initiated leave would, so a disconnect or termination
/// tells the rest of the room exactly once, through the one place membership changes already
/// flow through.
async fn cleanup(state: &Arc<RelayState>, ctx: &mut ConnectionContext) {
    let Some(room_id) = ctx.room_id.clone() else {
        return;
    };
    let now_unix_ms = chrono::Utc::now().timestamp_millis();
    if let Ok(effects) = state
        .engine
        .handle(ctx, ClientFrame::Leave { rid: room_id }, None, now_unix_ms)
        .await
    {
        let max_buffered_bytes = state.config.max_ws_frame_bytes * 4;
        for effect in effects {
            if let Effect::Broadcast { room_id, payload, exclude } = effect {
                fanout::broadcast(
                    &state.router,
                    &state.registry,
                    &state.observer,
                    &room_id,
                    payload,
                    exclude.as_deref(),
                    max_buffered_bytes,
                )
                .await;
            }
        }
    }
}
