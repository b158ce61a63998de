//! A deterministic, non-secret short hash of a room id, shown to humans so they can compare
//! rooms without exchanging the full id (`spec.md` §3, Fingerprint).

use sha2::{Digest, Sha256};

/// Six groups of four uppercase hex characters, e.g. `A1B2-C3D4-E5F6-...`. Deterministic and
/// collision-resistant enough for "do these two screens show the same room" comparison; it is
/// never used for access control.
pub fn fingerprint(room_id: &str) -> String {
    let digest = Sha256::digest(room_id.as_bytes());
    let hex = digest.iter().take(10).map(|b| format!("{b:02X}")).collect::<String>();
    hex.as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(fingerprint("room-a"), fingerprint("room-a"));
    }

    #[test]
    fn differs_for_different_rooms() {
        assert_ne!(fingerprint("room-a"), fingerprint("room-b"));
    }

    #[test]
    fn formatted_in_dash_groups() {
        let fp = fingerprint("room-a");
        assert_eq!(fp.len(), 24); // 5 groups of 4 + 4 dashes
        assert_eq!(fp.matches('-').count(), 4);
    }
}
