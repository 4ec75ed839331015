//! Challenge-response verification of client identities.
//!
//! A room hands each connection a fresh random challenge; the client proves
//! control of its claimed public key by returning a signed event whose
//! content is the exact challenge string. The verifier is a pure predicate.
//! It never retries; the room decides whether to offer another challenge.

use rand::Rng;

use crate::signer::Event;

/// Event kind clients must use for auth responses.
pub const AUTH_EVENT_KIND: u32 = 27235;

/// Maximum allowed clock skew on the signed event, in seconds.
pub const MAX_TIME_SKEW_SECS: i64 = 300;

/// A fresh 32-byte random challenge, hex-encoded.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Verifies a serialized signed event against a claimed pubkey and the
/// challenge issued to this connection.
///
/// Checks, in order: the payload parses, the signature is valid over the
/// event, the event pubkey matches the claim, the content is the exact
/// challenge, the kind is [`AUTH_EVENT_KIND`], and `created_at` is within
/// [`MAX_TIME_SKEW_SECS`] of `now`. Any discrepancy fails.
pub fn verify_auth_response(
    claimed_pubkey: &str,
    challenge: &str,
    signed_payload: &str,
    now: i64,
) -> bool {
    let Ok(event) = serde_json::from_str::<Event>(signed_payload) else {
        return false;
    };
    if !event.verify() {
        return false;
    }
    if event.pubkey != claimed_pubkey {
        return false;
    }
    if event.content != challenge {
        return false;
    }
    if event.kind != AUTH_EVENT_KIND {
        return false;
    }
    if (now - event.created_at).abs() > MAX_TIME_SKEW_SECS {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{EventDraft, Keys};

    const NOW: i64 = 1_700_000_000;

    fn response(keys: &Keys, challenge: &str, kind: u32, created_at: i64) -> String {
        let event = keys.sign_event(EventDraft {
            kind,
            tags: Vec::new(),
            content: challenge.to_string(),
            created_at,
        });
        serde_json::to_string(&event).expect("serializable")
    }

    #[test]
    fn challenges_are_unique_hex() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn valid_response_passes() {
        let keys = Keys::generate();
        let challenge = generate_challenge();
        let payload = response(&keys, &challenge, AUTH_EVENT_KIND, NOW);
        assert!(verify_auth_response(
            keys.public_key(),
            &challenge,
            &payload,
            NOW
        ));
    }

    #[test]
    fn wrong_pubkey_fails() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let challenge = generate_challenge();
        let payload = response(&keys, &challenge, AUTH_EVENT_KIND, NOW);
        assert!(!verify_auth_response(
            other.public_key(),
            &challenge,
            &payload,
            NOW
        ));
    }

    #[test]
    fn wrong_challenge_fails() {
        let keys = Keys::generate();
        let payload = response(&keys, &generate_challenge(), AUTH_EVENT_KIND, NOW);
        assert!(!verify_auth_response(
            keys.public_key(),
            &generate_challenge(),
            &payload,
            NOW
        ));
    }

    #[test]
    fn wrong_kind_fails() {
        let keys = Keys::generate();
        let challenge = generate_challenge();
        let payload = response(&keys, &challenge, 1, NOW);
        assert!(!verify_auth_response(
            keys.public_key(),
            &challenge,
            &payload,
            NOW
        ));
    }

    #[test]
    fn stale_or_future_timestamp_fails() {
        let keys = Keys::generate();
        let challenge = generate_challenge();

        let stale = response(&keys, &challenge, AUTH_EVENT_KIND, NOW - 301);
        assert!(!verify_auth_response(
            keys.public_key(),
            &challenge,
            &stale,
            NOW
        ));

        let future = response(&keys, &challenge, AUTH_EVENT_KIND, NOW + 301);
        assert!(!verify_auth_response(
            keys.public_key(),
            &challenge,
            &future,
            NOW
        ));

        let edge = response(&keys, &challenge, AUTH_EVENT_KIND, NOW - 300);
        assert!(verify_auth_response(
            keys.public_key(),
            &challenge,
            &edge,
            NOW
        ));
    }

    #[test]
    fn garbage_payload_fails() {
        assert!(!verify_auth_response("ab", "cd", "not json", NOW));
        assert!(!verify_auth_response("ab", "cd", "{}", NOW));
    }
}
