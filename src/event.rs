//! Nostr event model, canonical hashing and Schnorr signatures.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – identifier for parameterized replaceable events
/// - `nonce` – proof-of-work counter and target difficulty
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its fields, e.g. `Tag::new(["d", "world-1"])`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag type, the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Optional marker used by NIP-10 `e` tags (`["e", id, relay, marker]`).
    pub fn marker(&self) -> Option<&str> {
        self.0.get(3).map(String::as_str)
    }
}

/// Signed Nostr event as delivered by relays.
///
/// ```json
/// {
///   "id": "aa11…",
///   "pubkey": "79be…",
///   "kind": 31002,
///   "created_at": 1700000000,
///   "tags": [["d", "world-1"]],
///   "content": "{\"title\":\"X\"}",
///   "sig": "deadbeef…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `0`, `1` or `31002`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    pub tags: Vec<Tag>,
    /// Event content body, frequently JSON.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Value of the `d` tag, empty when absent.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Recompute the id and check the Schnorr signature against `pubkey`.
    pub fn verify(&self) -> Result<(), ValidationError> {
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
        .map_err(|e| ValidationError::MalformedEvent(format!("canonical form: {e}")))?;
        if hex::encode(hash) != self.id {
            return Err(ValidationError::MalformedEvent(
                "id does not match content hash".into(),
            ));
        }
        let pk_bytes = hex::decode(&self.pubkey)
            .map_err(|_| ValidationError::MalformedEvent("pubkey is not hex".into()))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|_| ValidationError::MalformedEvent("pubkey is not a curve point".into()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| ValidationError::InvalidSignature)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| ValidationError::InvalidSignature)?;
        let msg = Message::from_digest(hash);
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| ValidationError::InvalidSignature)
    }
}

/// Event fields prior to hashing and signing.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// New event stamped with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Override the creation timestamp.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Hash and sign with `keypair`; the author is the keypair's x-only key.
    pub fn sign(self, keypair: &Keypair) -> Result<Event, serde_json::Error> {
        self.mine(keypair, 0)
    }

    /// Sign after searching for a NIP-13 `nonce` tag that gives the id at
    /// least `difficulty` leading zero bits. `difficulty == 0` skips mining.
    pub fn mine(self, keypair: &Keypair, difficulty: u8) -> Result<Event, serde_json::Error> {
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        let UnsignedEvent {
            created_at,
            kind,
            mut tags,
            content,
        } = self;

        let mut hash = event_hash(&pubkey, created_at, kind, &tags, &content)?;
        if difficulty > 0 {
            tags.retain(|t| t.name() != Some("nonce"));
            tags.push(Tag(vec!["nonce".into(), "0".into(), difficulty.to_string()]));
            let slot = tags.len() - 1;
            let mut nonce: u64 = 0;
            loop {
                tags[slot].0[1] = nonce.to_string();
                hash = event_hash(&pubkey, created_at, kind, &tags, &content)?;
                if leading_zero_bits(&hash) >= u32::from(difficulty) {
                    break;
                }
                nonce += 1;
            }
        }

        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest(hash);
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind,
            created_at,
            tags,
            content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Recompute the Nostr event hash over `[0, pubkey, created_at, kind, tags, content]`.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], serde_json::Error> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Count leading zero bits of a hash (NIP-13 difficulty).
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
