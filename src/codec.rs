//! Join Token Codec: mints and verifies MAC-signed capability tokens carrying
//! `{v, rid, exp, jti}` (`spec.md` §4.4).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PROTOCOL_VERSION: u8 = 1;
const SEPARATOR: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Format,
    Mac,
    Expired,
    RoomMismatch,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            TokenError::Format => "malformed token",
            TokenError::Mac => "token MAC verification failed",
            TokenError::Expired => "token expired",
            TokenError::RoomMismatch => "token issued for a different room",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenPayload {
    v: u8,
    rid: String,
    exp: i64,
    jti: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub room_id: String,
    pub exp_unix_ms: i64,
    pub jti: String,
}

pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mints `base64url(payload).base64url(mac)` for `{v:1, rid, exp, jti}`.
    pub fn mint(&self, room_id: &str, exp_unix_ms: i64, jti: &str) -> String {
        let payload = TokenPayload {
            v: PROTOCOL_VERSION,
            rid: room_id.to_string(),
            exp: exp_unix_ms,
            jti: jti.to_string(),
        };
        let payload_bytes = serde_json::to_vec(&payload).expect("token payload always serializes");
        let mac = self.mac_for(&payload_bytes);

        format!(
            "{}{SEPARATOR}{}",
            URL_SAFE_NO_PAD.encode(&payload_bytes),
            URL_SAFE_NO_PAD.encode(mac)
        )
    }

    /// Verifies a token against an expected `room_id` and the current time. Checks format,
    /// MAC (constant-time via `hmac::Mac::verify_slice`), room match, and expiry, in that order
    /// so a format error never leaks MAC-validity information.
    pub fn verify(
        &self,
        token: &str,
        expected_room_id: &str,
        now_unix_ms: i64,
    ) -> Result<VerifiedToken, TokenError> {
        let (payload_b64, mac_b64) = token.split_once(SEPARATOR).ok_or(TokenError::Format)?;
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Format)?;
        let mac_bytes = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| TokenError::Format)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(&payload_bytes);
        mac.verify_slice(&mac_bytes).map_err(|_| TokenError::Mac)?;

        let payload: TokenPayload =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Format)?;

        if payload.v != PROTOCOL_VERSION {
            return Err(TokenError::Format);
        }
        if payload.rid != expected_room_id {
            return Err(TokenError::RoomMismatch);
        }
        if payload.exp <= now_unix_ms {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken {
            room_id: payload.rid,
            exp_unix_ms: payload.exp,
            jti: payload.jti,
        })
    }

    fn mac_for(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"0123456789abcdef0123456789abcdef".to_vec())
    }

    #[test]
    fn round_trip_mint_verify() {
        // R1
        let codec = codec();
        let token = codec.mint("room-1", 10_000, "jti-1");
        let verified = codec.verify(&token, "room-1", 5_000).unwrap();
        assert_eq!(verified.room_id, "room-1");
        assert_eq!(verified.exp_unix_ms, 10_000);
        assert_eq!(verified.jti, "jti-1");
    }

    #[test]
    fn bit_flip_in_payload_half_fails_mac_or_format() {
        let codec = codec();
        let token = codec.mint("room-1", 10_000, "jti-1");
        let (payload, mac) = token.split_once('.').unwrap();
        let mut bytes = payload.as_bytes().to_vec();
        bytes[0] ^= 0x01;
        let tampered = format!("{}.{}", String::from_utf8_lossy(&bytes), mac);
        let err = codec.verify(&tampered, "room-1", 5_000).unwrap_err();
        assert!(matches!(err, TokenError::Mac | TokenError::Format));
    }

    #[test]
    fn bit_flip_in_mac_half_fails_mac() {
        let codec = codec();
        let token = codec.mint("room-1", 10_000, "jti-1");
        let (payload, mac) = token.split_once('.').unwrap();
        let mut mac_bytes = mac.as_bytes().to_vec();
        mac_bytes[0] ^= 0x01;
        let tampered = format!("{}.{}", payload, String::from_utf8_lossy(&mac_bytes));
        let err = codec.verify(&tampered, "room-1", 5_000).unwrap_err();
        assert!(matches!(err, TokenError::Mac | TokenError::Format));
    }

    #[test]
    fn expired_token_rejected() {
        let codec = codec();
        let token = codec.mint("room-1", 1_000, "jti-1");
        let err = codec.verify(&token, "room-1", 2_000).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn room_mismatch_rejected() {
        let codec = codec();
        let token = codec.mint("room-1", 10_000, "jti-1");
        let err = codec.verify(&token, "room-2", 5_000).unwrap_err();
        assert_eq!(err, TokenError::RoomMismatch);
    }

    #[test]
    fn malformed_token_rejected() {
        let codec = codec();
        let err = codec.verify("not-a-token", "room-1", 5_000).unwrap_err();
        assert_eq!(err, TokenError::Format);
    }
}
