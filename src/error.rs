//! Internal error taxonomy, kept distinct from the wire-level `ERROR` frame codes.
//!
//! `RelayError` is what Rust code returns and propagates with `?`. `error::to_wire` is the
//! single place that maps a `RelayError` onto the observable behavior `spec.md` §7 describes:
//! an `ERROR` frame, a close code, or (for admission) nothing at all.

use thiserror::Error;

use crate::codec::TokenError;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    PolicyViolation,
    UnsupportedData,
    InternalError,
    GoingAway,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::PolicyViolation => 1008,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InternalError => 1011,
            CloseCode::GoingAway => 1001,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Stable wire error codes, part of the protocol contract (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    AlreadyInRoom,
    NotInRoom,
    NoRoom,
    RoomFull,
    TokenFormat,
    TokenMac,
    TokenExpired,
    TokenReplay,
    TokenRoomMismatch,
    CiphertextTooLarge,
    MediaTooLarge,
}

impl WireErrorCode {
    /// Whether the client may meaningfully retry the same logical action.
    pub fn retryable(self) -> bool {
        use WireErrorCode::*;
        match self {
            AlreadyInRoom => false,
            NotInRoom => false,
            NoRoom => false,
            RoomFull => true,
            TokenFormat => false,
            TokenMac => true,
            TokenExpired => true,
            TokenReplay => true,
            TokenRoomMismatch => false,
            CiphertextTooLarge => false,
            MediaTooLarge => false,
        }
    }
}

/// The outcome of resolving a `RelayError`: either an `ERROR` frame is sent back to the
/// originating connection, or the connection is closed with a close code and reason.
///
/// `ErrorFrame` carries its own `retryable` flag rather than deriving it from `WireErrorCode`
/// alone: a transient external-store failure is reported through an existing wire code (there is
/// no dedicated one in the stable contract, `spec.md` §6) but must still read `retryable=true`
/// per `spec.md` §7, which the code's own default retryability would get wrong.
#[derive(Debug, Clone)]
pub enum Resolution {
    ErrorFrame(WireErrorCode, bool),
    Close(CloseCode, &'static str),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("membership: already in room")]
    AlreadyInRoom,
    #[error("membership: not in room")]
    NotInRoom,
    #[error("membership: no such room")]
    NoRoom,
    #[error("membership: room full")]
    RoomFull,
    #[error("token: {0}")]
    Token(#[from] TokenError),
    #[error("token replay")]
    TokenReplay,
    #[error("ciphertext exceeds max_ct_bytes")]
    CiphertextTooLarge,
    #[error("media payload exceeds 14 MiB or chunk bounds")]
    MediaTooLarge,
    #[error("frame exceeds max_ws_frame_bytes")]
    OversizedFrame,
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("slow consumer")]
    SlowConsumer,
    #[error("external store: {0}")]
    Store(#[from] StoreError),
    #[error("internal: {0}")]
    Internal(String),
}

/// The single function that decides close-vs-error-frame, per the centralization strategy in
/// `spec.md` §9.
pub fn resolve(err: &RelayError) -> Resolution {
    use Resolution::*;
    match err {
        RelayError::AlreadyInRoom => ErrorFrame(WireErrorCode::AlreadyInRoom, WireErrorCode::AlreadyInRoom.retryable()),
        RelayError::NotInRoom => ErrorFrame(WireErrorCode::NotInRoom, WireErrorCode::NotInRoom.retryable()),
        RelayError::NoRoom => ErrorFrame(WireErrorCode::NoRoom, WireErrorCode::NoRoom.retryable()),
        RelayError::RoomFull => ErrorFrame(WireErrorCode::RoomFull, WireErrorCode::RoomFull.retryable()),
        RelayError::Token(TokenError::Format) => ErrorFrame(WireErrorCode::TokenFormat, WireErrorCode::TokenFormat.retryable()),
        RelayError::Token(TokenError::Mac) => ErrorFrame(WireErrorCode::TokenMac, WireErrorCode::TokenMac.retryable()),
        RelayError::Token(TokenError::Expired) => ErrorFrame(WireErrorCode::TokenExpired, WireErrorCode::TokenExpired.retryable()),
        RelayError::Token(TokenError::RoomMismatch) => {
            ErrorFrame(WireErrorCode::TokenRoomMismatch, WireErrorCode::TokenRoomMismatch.retryable())
        }
        RelayError::TokenReplay => ErrorFrame(WireErrorCode::TokenReplay, WireErrorCode::TokenReplay.retryable()),
        RelayError::CiphertextTooLarge => {
            ErrorFrame(WireErrorCode::CiphertextTooLarge, WireErrorCode::CiphertextTooLarge.retryable())
        }
        RelayError::MediaTooLarge => ErrorFrame(WireErrorCode::MediaTooLarge, WireErrorCode::MediaTooLarge.retryable()),
        // `spec.md` §6/B3: one byte over `max_ws_frame_bytes` closes with policy-violation rather
        // than an ERROR frame, same as any other frame-level (not message-level) violation.
        RelayError::OversizedFrame => Close(CloseCode::PolicyViolation, "oversized frame"),
        RelayError::SchemaViolation(_) => Close(CloseCode::UnsupportedData, "unsupported data"),
        RelayError::RateLimited => Close(CloseCode::PolicyViolation, "rate limit exceeded"),
        RelayError::SlowConsumer => Close(CloseCode::PolicyViolation, "slow consumer"),
        // `spec.md` §7: "External store: transient failure surfaces as retryable ERROR". There
        // is no dedicated wire code for it, so it rides on NO_ROOM (the closest "can't confirm
        // membership" signal) with retryable forced to true rather than NO_ROOM's own default.
        RelayError::Store(StoreError::Unreachable(_)) => ErrorFrame(WireErrorCode::NoRoom, true),
        RelayError::Internal(_) => Close(CloseCode::InternalError, "internal error"),
    }
}
