//! Per-kind content decoders.
//!
//! Every parser has the same contract: given a validated [`Event`], return a
//! typed [`Content`] or a [`ParseError`]. The registry turns errors and unknown
//! kinds into [`RawContent`] so no event is ever dropped because its payload
//! predates or postdates the schema this build understands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::Event;

pub const KIND_PROFILE: u32 = 0;
pub const KIND_NOTE: u32 = 1;
pub const KIND_REACTION: u32 = 7;
pub const KIND_UNIT_TRANSFER: u32 = 11000;
pub const KIND_MERIT: u32 = 11001;
pub const KIND_WORLD: u32 = 31002;
pub const KIND_PLAYLIST: u32 = 31003;
pub const KIND_EXPERIENCE: u32 = 31004;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("no parser for kind {0}")]
    Unsupported(u32),
}

/// Kind-0 profile metadata. Unknown fields are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub nip05: Option<String>,
    /// Lightning payment address.
    #[serde(default)]
    pub lud16: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kind-1 text note with NIP-10 thread references.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub text: String,
    pub root: Option<String>,
    pub reply_to: Option<String>,
    pub mentions: Vec<String>,
}

impl Note {
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

/// Kind-7 reaction to another event.
#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub content: String,
    pub target_event: String,
    pub target_author: Option<String>,
}

/// Kind-11000 unit transfer from the author to the `p`-tagged recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitTransfer {
    pub amount: f64,
    pub memo: Option<String>,
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeritAction {
    Gain,
    Spend,
    Award,
    #[serde(other)]
    Other,
}

/// Kind-11001 merit ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MeritTransaction {
    pub amount: f64,
    pub merit_type: Option<String>,
    pub action: MeritAction,
    pub affected: Option<String>,
}

/// Title/description payload shared by the parameterized application kinds
/// (worlds, playlists, experiences). Unknown fields are kept in `extra`.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub identifier: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub extra: Map<String, Value>,
}

/// Decoded payload of a recognized kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Profile(Profile),
    Note(Note),
    Reaction(Reaction),
    UnitTransfer(UnitTransfer),
    MeritTransaction(MeritTransaction),
    World(CatalogEntry),
    Playlist(CatalogEntry),
    Experience(CatalogEntry),
}

/// Payload retained verbatim because no parser accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContent {
    pub kind: u32,
    pub content: String,
    pub reason: String,
}

/// Outcome of content decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedContent {
    Typed(Content),
    Raw(RawContent),
}

impl ParsedContent {
    pub fn typed(&self) -> Option<&Content> {
        match self {
            ParsedContent::Typed(c) => Some(c),
            ParsedContent::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ParsedContent::Raw(_))
    }
}

/// Signature every kind-specific parser satisfies.
pub type ParseFn = fn(&Event) -> Result<Content, ParseError>;

/// Registry of parsers keyed by kind.
#[derive(Clone)]
pub struct Parsers {
    by_kind: HashMap<u32, ParseFn>,
}

impl Default for Parsers {
    fn default() -> Self {
        let mut parsers = Parsers::empty();
        parsers.register(KIND_PROFILE, parse_profile);
        parsers.register(KIND_NOTE, parse_note);
        parsers.register(KIND_REACTION, parse_reaction);
        parsers.register(KIND_UNIT_TRANSFER, parse_unit_transfer);
        parsers.register(KIND_MERIT, parse_merit);
        parsers.register(KIND_WORLD, |ev| parse_catalog(ev).map(Content::World));
        parsers.register(KIND_PLAYLIST, |ev| parse_catalog(ev).map(Content::Playlist));
        parsers.register(KIND_EXPERIENCE, |ev| {
            parse_catalog(ev).map(Content::Experience)
        });
        parsers
    }
}

impl Parsers {
    /// Registry without any parser; every event decodes to `Raw`.
    pub fn empty() -> Self {
        Parsers {
            by_kind: HashMap::new(),
        }
    }

    /// Install or replace the parser for `kind`.
    pub fn register(&mut self, kind: u32, parser: ParseFn) {
        self.by_kind.insert(kind, parser);
    }

    pub fn parse(&self, ev: &Event) -> ParsedContent {
        let result = match self.by_kind.get(&ev.kind) {
            Some(parser) => parser(ev),
            None => Err(ParseError::Unsupported(ev.kind)),
        };
        match result {
            Ok(content) => ParsedContent::Typed(content),
            Err(e) => ParsedContent::Raw(RawContent {
                kind: ev.kind,
                content: ev.content.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn parse_profile(ev: &Event) -> Result<Content, ParseError> {
    Ok(Content::Profile(serde_json::from_str(&ev.content)?))
}

fn parse_note(ev: &Event) -> Result<Content, ParseError> {
    let e_tags: Vec<_> = ev
        .tags
        .iter()
        .filter(|t| t.name() == Some("e") && t.value().is_some())
        .collect();
    let marked = |marker: &str| {
        e_tags
            .iter()
            .find(|t| t.marker() == Some(marker))
            .and_then(|t| t.value())
            .map(str::to_string)
    };
    let (root, reply_to) = if e_tags.iter().any(|t| t.marker().is_some()) {
        let root = marked("root");
        let reply = marked("reply").or_else(|| root.clone());
        (root, reply)
    } else {
        // Deprecated positional form: first is the root, last is the direct parent.
        let first = e_tags.first().and_then(|t| t.value()).map(str::to_string);
        let last = e_tags.last().and_then(|t| t.value()).map(str::to_string);
        (first, last)
    };
    Ok(Content::Note(Note {
        text: ev.content.clone(),
        root,
        reply_to,
        mentions: ev.tag_values("p").map(str::to_string).collect(),
    }))
}

fn parse_reaction(ev: &Event) -> Result<Content, ParseError> {
    let target_event = ev
        .tag_values("e")
        .last()
        .ok_or(ParseError::Missing("e tag"))?
        .to_string();
    Ok(Content::Reaction(Reaction {
        content: ev.content.clone(),
        target_event,
        target_author: ev.tag_values("p").last().map(str::to_string),
    }))
}

#[derive(Deserialize)]
struct TransferBody {
    amount: f64,
    #[serde(default)]
    memo: Option<String>,
}

fn parse_unit_transfer(ev: &Event) -> Result<Content, ParseError> {
    let body: TransferBody = serde_json::from_str(&ev.content)?;
    Ok(Content::UnitTransfer(UnitTransfer {
        amount: body.amount,
        memo: body.memo,
        recipient: ev.tag_value("p").map(str::to_string),
    }))
}

#[derive(Deserialize)]
struct MeritBody {
    amount: f64,
    #[serde(rename = "type", default)]
    merit_type: Option<String>,
    action: MeritAction,
}

fn parse_merit(ev: &Event) -> Result<Content, ParseError> {
    let body: MeritBody = serde_json::from_str(&ev.content)?;
    Ok(Content::MeritTransaction(MeritTransaction {
        amount: body.amount,
        merit_type: body.merit_type,
        action: body.action,
        affected: ev.tag_value("p").map(str::to_string),
    }))
}

fn parse_catalog(ev: &Event) -> Result<CatalogEntry, ParseError> {
    let mut obj: Map<String, Value> = serde_json::from_str(&ev.content)?;
    let mut take = |key: &str| match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            obj.insert(key.to_string(), other);
            None
        }
        None => None,
    };
    let title = take("title");
    let description = take("description");
    Ok(CatalogEntry {
        identifier: ev.identifier().to_string(),
        title,
        description,
        extra: obj,
    })
}
