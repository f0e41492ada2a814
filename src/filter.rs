//! Subscription filters: the NIP-01 query predicate sent to relays and
//! evaluated locally against cached projections.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter parameters used when building a Nostr `REQ`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Restrict to specific event ids.
    pub ids: Option<Vec<String>>,
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed by tag name without the `#` prefix (e.g. `p`).
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events requested from each relay.
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Require tag `name` to carry one of `values`, e.g. `.tag("p", [me])`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.trim_start_matches('#').to_string();
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Serialize into the JSON object carried by `REQ`. Empty lists are omitted.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let strings = |v: &[String]| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = self.ids.as_deref().filter(|v| !v.is_empty()) {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = self.authors.as_deref().filter(|v| !v.is_empty()) {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = self.kinds.as_deref().filter(|v| !v.is_empty()) {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(format!("#{tag}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        Value::Object(map)
    }

    /// Build a `Filter` from a NIP-01 filter JSON object, skipping ill-typed entries.
    pub fn from_value(val: &Value) -> Self {
        let strings = |key: &str| {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        };
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let (Some(name), Some(arr)) = (key.strip_prefix('#'), v.as_array()) {
                    tags.insert(
                        name.to_string(),
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect(),
                    );
                }
            }
        }
        Filter {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }

    /// Evaluate the predicate locally. `limit` only bounds relay replies and is ignored.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (tag, values) in &self.tags {
            if !ev.tag_values(tag).any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

/// True when any filter in the set matches, as relays evaluate a multi-filter `REQ`.
pub fn any_match(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn sample_event(pubkey: &str, kind: u32, created_at: u64, tags: Vec<Tag>) -> Event {
        Event {
            id: "aa11".into(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn serializes_nip01_shape() {
        let f = Filter::new()
            .authors(["p1"])
            .kinds([1, 31002])
            .tag("#p", ["me"])
            .since(10)
            .limit(100);
        let v = f.to_value();
        assert_eq!(
            v,
            serde_json::json!({
                "authors": ["p1"],
                "kinds": [1, 31002],
                "#p": ["me"],
                "since": 10,
                "limit": 100
            })
        );
        assert_eq!(Filter::from_value(&v), f);
    }

    #[test]
    fn empty_lists_are_omitted() {
        let f = Filter {
            authors: Some(vec![]),
            ..Filter::default()
        };
        assert_eq!(f.to_value(), serde_json::json!({}));
    }

    #[test]
    fn tag_constraint_requires_matching_value() {
        let f = Filter::new().kinds([11000]).tag("p", ["me"]);
        let to_me = sample_event("p1", 11000, 1, vec![Tag::new(["p", "me"])]);
        let to_other = sample_event("p1", 11000, 1, vec![Tag::new(["p", "you"])]);
        assert!(f.matches(&to_me));
        assert!(!f.matches(&to_other));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let f = Filter::new().since(10).until(20);
        assert!(f.matches(&sample_event("p", 1, 10, vec![])));
        assert!(f.matches(&sample_event("p", 1, 20, vec![])));
        assert!(!f.matches(&sample_event("p", 1, 21, vec![])));
        assert!(!f.matches(&sample_event("p", 1, 9, vec![])));
    }

    #[test]
    fn any_match_is_a_union() {
        let mine = Filter::new().authors(["me"]);
        let tagged = Filter::new().tag("p", ["me"]);
        let ev = sample_event("other", 1, 1, vec![Tag::new(["p", "me"])]);
        assert!(any_match(&[mine.clone(), tagged], &ev));
        assert!(!any_match(&[mine], &ev));
    }

    #[test]
    fn from_value_skips_bad_entries() {
        let v = serde_json::json!({"kinds": [1, "x", 7], "authors": [3, "a"], "limit": "n"});
        let f = Filter::from_value(&v);
        assert_eq!(f.kinds, Some(vec![1, 7]));
        assert_eq!(f.authors, Some(vec!["a".to_string()]));
        assert_eq!(f.limit, None);
    }

    #[test]
    fn from_value_drops_out_of_range_kinds() {
        // 2^32 + 1 would wrap to kind 1
        let v = serde_json::json!({"kinds": [4_294_967_297u64, 0]});
        assert_eq!(Filter::from_value(&v).kinds, Some(vec![0]));
    }
}
