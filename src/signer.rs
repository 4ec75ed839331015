//! Signed discovery events and key handling.
//!
//! The discovery fabric speaks signed events: a canonical JSON body hashed
//! with SHA-256 into the event id, then Schnorr-signed (BIP-340) with the
//! node's secret key. Everything above this module treats events as opaque
//! signed objects; this is the only place that touches key material.

use std::sync::OnceLock;

use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

fn verify_ctx() -> &'static Secp256k1<VerifyOnly> {
    static CTX: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::verification_only)
}

/// A signed event as it travels over the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// The unsigned fields of an event, handed to [`Keys::sign_event`].
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub created_at: i64,
}

impl Event {
    /// Recomputes the canonical id of this event from its signable fields.
    pub fn compute_id(&self) -> String {
        hex::encode(id_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
    }

    /// Full cryptographic verification: the id must match the canonical hash
    /// and the signature must be valid for `pubkey` over that id.
    pub fn verify(&self) -> bool {
        if self.id != self.compute_id() {
            return false;
        }
        let Ok(id_bytes) = hex::decode(&self.id) else {
            return false;
        };
        let Ok(digest) = <[u8; 32]>::try_from(id_bytes.as_slice()) else {
            return false;
        };
        let Ok(pubkey_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let message = Message::from_digest(digest);
        verify_ctx().verify_schnorr(&sig, &message, &pubkey).is_ok()
    }

    /// First value of the first tag named `key`, if any.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().is_some_and(|k| k == key))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All tags named `key`, as value slices (everything after the key).
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a [String]> {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|k| k == key))
            .map(|tag| &tag[1..])
    }
}

fn id_digest(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    // Canonical form: the JSON array [0, pubkey, created_at, kind, tags, content]
    // with no whitespace. serde_json emits exactly that.
    let body = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let serialized = body.to_string();
    Sha256::digest(serialized.as_bytes()).into()
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secret key must be 64 hex chars or a bech32 nsec string")]
    MalformedSecret,
    #[error("secret key is not a valid curve scalar")]
    InvalidScalar,
}

/// A node signing identity: secret key plus derived x-only public key.
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    public_key: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Keys {
    /// Parses a secret key from 64-char hex or a bech32 `nsec` string.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let input = input.trim();
        let bytes = if let Some(stripped) = decode_nsec(input) {
            stripped
        } else {
            hex::decode(input).map_err(|_| KeyError::MalformedSecret)?
        };
        let secret = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidScalar)?;
        Ok(Self::from_secret(secret))
    }

    /// Generates a fresh random identity. Used for tests and ephemeral nodes.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self::from_secret(secret);
            }
        }
    }

    fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            secp,
            keypair,
            public_key: hex::encode(xonly.serialize()),
        }
    }

    /// Hex-encoded x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Hashes and signs a draft into a complete event.
    pub fn sign_event(&self, draft: EventDraft) -> Event {
        let digest = id_digest(
            &self.public_key,
            draft.created_at,
            draft.kind,
            &draft.tags,
            &draft.content,
        );
        let message = Message::from_digest(digest);
        let sig = self.secp.sign_schnorr_no_aux_rand(&message, &self.keypair);
        Event {
            id: hex::encode(digest),
            pubkey: self.public_key.clone(),
            created_at: draft.created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig: hex::encode(sig.as_ref()),
        }
    }
}

fn decode_nsec(input: &str) -> Option<Vec<u8>> {
    if !input.starts_with("nsec1") {
        return None;
    }
    let (hrp, data) = bech32::decode(input).ok()?;
    if hrp.as_str() != "nsec" {
        return None;
    }
    Some(data)
}
