//! In-memory projections: latest state per replaceable key plus an id-keyed
//! set of regular events.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    content::{Content, MeritAction, ParsedContent, Profile},
    event::Event,
    filter::{any_match, Filter},
    router::{KindClass, Routed},
};

/// Identity of a replaceable slot. `identifier` is the `d` tag value for
/// parameterized kinds and empty for plain replaceable kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplaceableKey {
    pub pubkey: String,
    pub kind: u32,
    pub identifier: String,
}

impl ReplaceableKey {
    pub fn new(pubkey: impl Into<String>, kind: u32, identifier: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            kind,
            identifier: identifier.into(),
        }
    }
}

/// Validated event together with its decoded content.
#[derive(Debug, Clone, PartialEq)]
pub struct Projected {
    pub event: Event,
    pub content: ParsedContent,
}

/// Result of applying an event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// New slot or new regular event.
    Inserted,
    /// Newer event superseded the stored one.
    Replaced,
    /// Older, tied or already-present event; nothing changed.
    Stale,
}

impl Upsert {
    pub fn changed(self) -> bool {
        !matches!(self, Upsert::Stale)
    }
}

#[derive(Default)]
struct Projections {
    replaceable: HashMap<ReplaceableKey, Projected>,
    regular: HashMap<String, Projected>,
}

/// Shared handle to the projections of one client instance.
///
/// Clones share state. Separate `ProjectionStore::default()` values are
/// independent.
#[derive(Clone, Default)]
pub struct ProjectionStore {
    inner: Arc<RwLock<Projections>>,
}

impl ProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry` under `key` unless the current entry is at least as new.
    pub fn upsert_replaceable(&self, key: ReplaceableKey, entry: Projected) -> Upsert {
        let mut inner = self.inner.write();
        match inner.replaceable.get(&key) {
            Some(current) if entry.event.created_at <= current.event.created_at => Upsert::Stale,
            Some(_) => {
                inner.replaceable.insert(key, entry);
                Upsert::Replaced
            }
            None => {
                inner.replaceable.insert(key, entry);
                Upsert::Inserted
            }
        }
    }

    /// Add a regular event. Re-adding a known id is a no-op.
    pub fn append(&self, entry: Projected) -> Upsert {
        let mut inner = self.inner.write();
        if inner.regular.contains_key(&entry.event.id) {
            return Upsert::Stale;
        }
        inner.regular.insert(entry.event.id.clone(), entry);
        Upsert::Inserted
    }

    /// Apply a routed event by class. `None` for ephemeral kinds, which are
    /// never stored.
    pub fn apply(&self, routed: &Routed) -> Option<Upsert> {
        match (routed.class, &routed.key) {
            (KindClass::Ephemeral, _) => None,
            (_, Some(key)) => Some(self.upsert_replaceable(key.clone(), routed.entry.clone())),
            (_, None) => Some(self.append(routed.entry.clone())),
        }
    }

    /// Whether `routed` is what the store currently holds for its slot.
    /// Ephemeral events always count as current.
    pub fn holds(&self, routed: &Routed) -> bool {
        let id = &routed.event().id;
        let inner = self.inner.read();
        match (routed.class, &routed.key) {
            (KindClass::Ephemeral, _) => true,
            (_, Some(key)) => inner.replaceable.get(key).is_some_and(|p| &p.event.id == id),
            (_, None) => inner.regular.contains_key(id),
        }
    }

    pub fn replaceable(&self, key: &ReplaceableKey) -> Option<Projected> {
        self.inner.read().replaceable.get(key).cloned()
    }

    /// Current entries of a replaceable kind, newest first.
    pub fn replaceables(&self, kind: u32) -> Vec<Projected> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .replaceable
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(_, v)| v.clone())
            .collect();
        sort_newest_first(&mut out);
        out
    }

    /// Regular events, optionally restricted to one kind, newest first.
    pub fn events(&self, kind: Option<u32>) -> Vec<Projected> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .regular
            .values()
            .filter(|p| kind.map_or(true, |k| p.event.kind == k))
            .cloned()
            .collect();
        sort_newest_first(&mut out);
        out
    }

    /// Look up an event by id in either map.
    pub fn get(&self, id: &str) -> Option<Projected> {
        let inner = self.inner.read();
        inner
            .regular
            .get(id)
            .or_else(|| inner.replaceable.values().find(|p| p.event.id == id))
            .cloned()
    }

    /// Every stored event matching any of `filters`, newest first.
    pub fn matching(&self, filters: &[Filter]) -> Vec<Event> {
        self.matching_entries(filters).into_iter().map(|p| p.event).collect()
    }

    /// Projected entries matching any of `filters`, newest first.
    pub fn matching_entries(&self, filters: &[Filter]) -> Vec<Projected> {
        let inner = self.inner.read();
        let mut out: Vec<Projected> = inner
            .replaceable
            .values()
            .chain(inner.regular.values())
            .filter(|p| any_match(filters, &p.event))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.event
                .created_at
                .cmp(&a.event.created_at)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });
        out
    }

    /// Parsed kind-0 metadata for `pubkey`. `None` if absent or unparseable.
    pub fn profile(&self, pubkey: &str) -> Option<Profile> {
        let key = ReplaceableKey::new(pubkey, 0, "");
        match self.inner.read().replaceable.get(&key)?.content {
            ParsedContent::Typed(Content::Profile(ref p)) => Some(p.clone()),
            _ => None,
        }
    }

    /// `display_name`, then `name`, then the first 8 characters of the pubkey.
    pub fn display_name(&self, pubkey: &str) -> String {
        let profile = self.profile(pubkey);
        let named = profile.as_ref().and_then(|p| {
            [p.display_name.as_deref(), p.name.as_deref()]
                .into_iter()
                .flatten()
                .find(|s| !s.is_empty())
                .map(str::to_string)
        });
        named.unwrap_or_else(|| truncate_pubkey(pubkey))
    }

    pub fn picture(&self, pubkey: &str) -> Option<String> {
        self.profile(pubkey)?.picture
    }

    pub fn lud16(&self, pubkey: &str) -> Option<String> {
        self.profile(pubkey)?.lud16
    }

    /// Net units moved through kind-11000 transfers: received minus sent.
    pub fn unit_balance(&self, pubkey: &str) -> f64 {
        let inner = self.inner.read();
        inner
            .regular
            .values()
            .filter_map(|p| match &p.content {
                ParsedContent::Typed(Content::UnitTransfer(t)) => Some((&p.event, t)),
                _ => None,
            })
            .map(|(ev, t)| {
                let mut delta = 0.0;
                if ev.pubkey == pubkey {
                    delta -= t.amount;
                }
                if t.recipient.as_deref() == Some(pubkey) {
                    delta += t.amount;
                }
                delta
            })
            .sum()
    }

    /// Merits gained or awarded minus merits spent. Entries without a `p`
    /// tag count for their author.
    pub fn merit_balance(&self, pubkey: &str) -> f64 {
        let inner = self.inner.read();
        inner
            .regular
            .values()
            .filter_map(|p| match &p.content {
                ParsedContent::Typed(Content::MeritTransaction(m)) => Some((&p.event, m)),
                _ => None,
            })
            .filter(|(ev, m)| m.affected.as_deref().unwrap_or(&ev.pubkey) == pubkey)
            .map(|(_, m)| match m.action {
                MeritAction::Gain | MeritAction::Award => m.amount,
                MeritAction::Spend => -m.amount,
                MeritAction::Other => 0.0,
            })
            .sum()
    }

    /// Number of stored events (current replaceable entries plus regular events).
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.replaceable.len() + inner.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_newest_first(entries: &mut [Projected]) {
    entries.sort_by(|a, b| {
        b.event
            .created_at
            .cmp(&a.event.created_at)
            .then_with(|| a.event.id.cmp(&b.event.id))
    });
}

fn truncate_pubkey(pubkey: &str) -> String {
    let head: String = pubkey.chars().take(8).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Parsers;
    use crate::event::{tests::signed, Tag};
    use crate::router::{Router, Taxonomy};

    fn projected(ev: Event) -> Projected {
        let content = Parsers::default().parse(&ev);
        Projected { event: ev, content }
    }

    fn raw_event(id: &str, pubkey: &str, kind: u32, created_at: u64, tags: Vec<Tag>, content: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    #[test]
    fn newer_replaces_older_regardless_of_order() {
        let older = signed(1, 31002, Some("world-1"), 90, r#"{"title":"old"}"#);
        let newer = signed(1, 31002, Some("world-1"), 100, r#"{"title":"new"}"#);
        let key = ReplaceableKey::new(older.pubkey.clone(), 31002, "world-1");

        for order in [[&older, &newer], [&newer, &older]] {
            let store = ProjectionStore::new();
            for ev in order {
                store.upsert_replaceable(key.clone(), projected(ev.clone()));
            }
            assert_eq!(store.replaceable(&key).unwrap().event.created_at, 100);
            assert_eq!(store.len(), 1);
        }
    }

    #[test]
    fn tie_keeps_existing() {
        let a = signed(1, 0, None, 50, r#"{"name":"first"}"#);
        let b = signed(1, 0, None, 50, r#"{"name":"second"}"#);
        let key = ReplaceableKey::new(a.pubkey.clone(), 0, "");
        let store = ProjectionStore::new();
        assert_eq!(store.upsert_replaceable(key.clone(), projected(a)), Upsert::Inserted);
        assert_eq!(store.upsert_replaceable(key.clone(), projected(b)), Upsert::Stale);
        assert_eq!(store.display_name(&key.pubkey), "first");
    }

    #[test]
    fn append_is_idempotent() {
        let ev = signed(1, 1, None, 5, "hello");
        let store = ProjectionStore::new();
        assert_eq!(store.append(projected(ev.clone())), Upsert::Inserted);
        assert_eq!(store.append(projected(ev.clone())), Upsert::Stale);
        assert_eq!(store.events(Some(1)).len(), 1);
        assert_eq!(store.get(&ev.id).unwrap().event, ev);
    }

    #[test]
    fn events_are_sorted_newest_first() {
        let store = ProjectionStore::new();
        for ts in [3, 9, 1] {
            store.append(projected(signed(1, 1, None, ts, "n")));
        }
        store.append(projected(signed(1, 7, None, 4, "+")));
        let ts: Vec<_> = store.events(Some(1)).iter().map(|p| p.event.created_at).collect();
        assert_eq!(ts, vec![9, 3, 1]);
        assert_eq!(store.events(None).len(), 4);
    }

    #[test]
    fn profile_accessors() {
        let ev = signed(
            2,
            0,
            None,
            10,
            r#"{"name":"ana","picture":"https://x/a.png","lud16":"ana@ln.example"}"#,
        );
        let pk = ev.pubkey.clone();
        let store = ProjectionStore::new();
        store.upsert_replaceable(ReplaceableKey::new(&pk, 0, ""), projected(ev));
        assert_eq!(store.display_name(&pk), "ana");
        assert_eq!(store.picture(&pk).as_deref(), Some("https://x/a.png"));
        assert_eq!(store.lud16(&pk).as_deref(), Some("ana@ln.example"));
    }

    #[test]
    fn display_name_falls_back_to_truncated_pubkey() {
        let store = ProjectionStore::new();
        let pk = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        assert_eq!(store.display_name(pk), "79be667e...");

        // unparseable profile behaves like a missing one
        let ev = raw_event("id0", pk, 0, 1, vec![], "{broken");
        store.upsert_replaceable(ReplaceableKey::new(pk, 0, ""), projected(ev));
        assert!(store.profile(pk).is_none());
        assert_eq!(store.display_name(pk), "79be667e...");
    }

    #[test]
    fn display_name_prefers_display_name() {
        let store = ProjectionStore::new();
        let ev = raw_event("id1", "pk", 0, 1, vec![], r#"{"name":"n","display_name":"D"}"#);
        store.upsert_replaceable(ReplaceableKey::new("pk", 0, ""), projected(ev));
        assert_eq!(store.display_name("pk"), "D");
    }

    #[test]
    fn unit_and_merit_balances() {
        let store = ProjectionStore::new();
        store.append(projected(raw_event(
            "t1",
            "alice",
            11000,
            1,
            vec![Tag::new(["p", "bob"])],
            r#"{"amount":10}"#,
        )));
        store.append(projected(raw_event(
            "t2",
            "bob",
            11000,
            2,
            vec![Tag::new(["p", "alice"])],
            r#"{"amount":4,"memo":"change"}"#,
        )));
        assert_eq!(store.unit_balance("alice"), -6.0);
        assert_eq!(store.unit_balance("bob"), 6.0);

        store.append(projected(raw_event(
            "m1",
            "alice",
            11001,
            3,
            vec![],
            r#"{"amount":5,"type":"meritos","action":"gain"}"#,
        )));
        store.append(projected(raw_event(
            "m2",
            "alice",
            11001,
            4,
            vec![],
            r#"{"amount":2,"type":"meritos","action":"spend"}"#,
        )));
        store.append(projected(raw_event(
            "m3",
            "carol",
            11001,
            5,
            vec![Tag::new(["p", "alice"])],
            r#"{"amount":1,"type":"meritos","action":"award"}"#,
        )));
        assert_eq!(store.merit_balance("alice"), 4.0);
        assert_eq!(store.merit_balance("carol"), 0.0);
    }

    #[test]
    fn matching_spans_both_maps() {
        let store = ProjectionStore::new();
        let note = signed(1, 1, None, 5, "hi");
        let profile = signed(1, 0, None, 6, "{}");
        store.append(projected(note.clone()));
        store.upsert_replaceable(ReplaceableKey::new(&profile.pubkey, 0, ""), projected(profile.clone()));
        let all = store.matching(&[Filter::new().authors([note.pubkey.clone()])]);
        assert_eq!(all, vec![profile, note.clone()]);
        assert_eq!(store.matching(&[Filter::new().kinds([1])]), vec![note]);
    }

    #[test]
    fn holds_only_the_current_entry() {
        let store = ProjectionStore::new();
        let router = Router::new(Taxonomy::nip01(), Parsers::default());
        let older = router.route(signed(1, 0, None, 1, "{}"));
        let newer = router.route(signed(1, 0, None, 2, "{}"));
        let note = router.route(signed(1, 1, None, 1, "n"));
        assert!(!store.holds(&older));
        store.apply(&older);
        store.apply(&newer);
        store.apply(&note);
        assert!(!store.holds(&older));
        assert!(store.holds(&newer));
        assert!(store.holds(&note));
        assert!(store.holds(&router.route(signed(1, 20001, None, 1, "e"))));
    }

    #[test]
    fn apply_dispatches_by_class() {
        let router = crate::router::Router::default();
        let store = ProjectionStore::new();
        let ephemeral = router.route(signed(1, 20001, None, 1, "typing"));
        assert_eq!(store.apply(&ephemeral), None);
        let note = router.route(signed(1, 1, None, 1, "n"));
        assert_eq!(store.apply(&note), Some(Upsert::Inserted));
        assert_eq!(store.apply(&note), Some(Upsert::Stale));
        let world = router.route(signed(1, 31002, Some("w"), 1, "{}"));
        assert_eq!(store.apply(&world), Some(Upsert::Inserted));
        let newer = router.route(signed(1, 31002, Some("w"), 2, "{}"));
        assert_eq!(store.apply(&newer), Some(Upsert::Replaced));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn clones_share_state_but_instances_do_not() {
        let a = ProjectionStore::new();
        let a2 = a.clone();
        let b = ProjectionStore::new();
        a.append(projected(signed(1, 1, None, 1, "x")));
        assert_eq!(a2.len(), 1);
        assert!(b.is_empty());
    }
}
