//! Integrity checks, deduplication and kind classification for inbound events.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::{
    content::{Parsers, KIND_MERIT, KIND_UNIT_TRANSFER},
    error::ValidationError,
    event::Event,
    projection::{Projected, ReplaceableKey},
};

/// Storage semantics of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    /// Stored by id, never replaced.
    Regular,
    /// One current event per `(pubkey, kind)`.
    Replaceable,
    /// Delivered to handlers, never stored.
    Ephemeral,
    /// One current event per `(pubkey, kind, d)`.
    Parameterized,
}

/// Processing stage of an inbound event, used in log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Discarded,
    Routed,
    Projected,
    Persisted,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Discarded => "discarded",
            Stage::Routed => "routed",
            Stage::Projected => "projected",
            Stage::Persisted => "persisted",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind → class mapping: NIP-01 ranges plus per-kind overrides.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    overrides: HashMap<u32, KindClass>,
}

impl Default for Taxonomy {
    /// NIP-01 ranges with the ledger kinds pinned to `Regular`.
    fn default() -> Self {
        Taxonomy::nip01()
            .with(KIND_UNIT_TRANSFER, KindClass::Regular)
            .with(KIND_MERIT, KindClass::Regular)
    }
}

impl Taxonomy {
    /// Plain NIP-01 ranges with no overrides.
    pub fn nip01() -> Self {
        Taxonomy {
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: u32, class: KindClass) -> Self {
        self.overrides.insert(kind, class);
        self
    }

    pub fn classify(&self, kind: u32) -> KindClass {
        if let Some(class) = self.overrides.get(&kind) {
            return *class;
        }
        match kind {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Parameterized,
            _ => KindClass::Regular,
        }
    }

    /// Replaceable slot for `ev`, `None` for regular and ephemeral kinds.
    pub fn key_for(&self, ev: &Event) -> Option<ReplaceableKey> {
        match self.classify(ev.kind) {
            KindClass::Replaceable => Some(ReplaceableKey::new(&ev.pubkey, ev.kind, "")),
            KindClass::Parameterized => {
                Some(ReplaceableKey::new(&ev.pubkey, ev.kind, ev.identifier()))
            }
            KindClass::Regular | KindClass::Ephemeral => None,
        }
    }
}

/// Validated, classified and parsed event ready for projection.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub class: KindClass,
    pub key: Option<ReplaceableKey>,
    pub entry: Projected,
}

impl Routed {
    pub fn event(&self) -> &Event {
        &self.entry.event
    }
}

/// Check field presence, types and hex lengths, then recompute the id and
/// verify the signature.
pub fn accept(raw: &Value) -> Result<Event, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::MalformedEvent("event is not an object".into()))?;
    for field in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"] {
        if !obj.contains_key(field) {
            return Err(ValidationError::MalformedEvent(format!("missing {field}")));
        }
    }
    let ev: Event = serde_json::from_value(raw.clone())
        .map_err(|e| ValidationError::MalformedEvent(e.to_string()))?;
    check_hex("id", &ev.id, 64)?;
    check_hex("pubkey", &ev.pubkey, 64)?;
    if !is_hex(&ev.sig, 128) {
        return Err(ValidationError::InvalidSignature);
    }
    ev.verify()?;
    Ok(ev)
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn check_hex(field: &str, value: &str, len: usize) -> Result<(), ValidationError> {
    if is_hex(value, len) {
        Ok(())
    } else {
        Err(ValidationError::MalformedEvent(format!(
            "{field} must be {len} hex characters"
        )))
    }
}

/// Stateful router owned by the ingest task.
pub struct Router {
    taxonomy: Taxonomy,
    parsers: Parsers,
    seen: HashSet<String>,
}

impl Router {
    pub fn new(taxonomy: Taxonomy, parsers: Parsers) -> Self {
        Self {
            taxonomy,
            parsers,
            seen: HashSet::new(),
        }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Whether `id` has already been applied.
    pub fn is_duplicate(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record `id` as applied; later copies are not applied again.
    pub fn mark_seen(&mut self, id: &str) {
        self.seen.insert(id.to_string());
    }

    /// Classify and parse a validated event.
    pub fn route(&self, event: Event) -> Routed {
        let class = self.taxonomy.classify(event.kind);
        let key = self.taxonomy.key_for(&event);
        let content = self.parsers.parse(&event);
        Routed {
            class,
            key,
            entry: Projected { event, content },
        }
    }

    /// Route an event that is already trusted, e.g. one read back from the cache.
    pub fn route_trusted(&mut self, event: Event) -> Routed {
        self.mark_seen(&event.id);
        self.route(event)
    }

    pub fn parsers(&self) -> &Parsers {
        &self.parsers
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new(Taxonomy::default(), Parsers::default())
    }
}
