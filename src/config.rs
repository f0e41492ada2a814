//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::{
    client::ClientConfig,
    filter::Filter,
    relay::{ReconnectPolicy, RelayOptions},
};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the durable cache.
    pub cache_root: PathBuf,
    /// Relays to synchronize with.
    pub relays: Vec<String>,
    /// Hex secret key. Without it the client is read-only.
    pub secret_key: Option<String>,
    pub filter_authors: Option<Vec<String>>,
    pub filter_kinds: Option<Vec<u32>>,
    /// Optional `#p` tag filters.
    pub filter_tag_p: Option<Vec<String>>,
    pub filter_since: Option<u64>,
    pub filter_limit: Option<usize>,
    /// Start subscriptions at the newest cached match instead of `filter_since`.
    pub resume: bool,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// `0` retries forever.
    pub reconnect_max_attempts: u32,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub channel_capacity: usize,
    pub pow_difficulty: u8,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let cache_root = PathBuf::from(env::var("CACHE_ROOT").context("CACHE_ROOT is not set")?);
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let secret_key = non_empty("SECRET_KEY");
        let filter_authors = non_empty("FILTER_AUTHORS").map(csv_strings).filter(|v| !v.is_empty());
        let filter_kinds = non_empty("FILTER_KINDS").map(csv_u32).filter(|v| !v.is_empty());
        let filter_tag_p = non_empty("FILTER_TAG_P").map(csv_strings).filter(|v| !v.is_empty());
        let filter_since = parse_opt("FILTER_SINCE")?;
        let filter_limit = parse_opt("FILTER_LIMIT")?;
        let resume = env::var("RESUME").unwrap_or_else(|_| "0".into()) == "1";
        let reconnect_initial = Duration::from_millis(parse_or("RECONNECT_INITIAL_MS", 1_000)?);
        let reconnect_max = Duration::from_millis(parse_or("RECONNECT_MAX_MS", 30_000)?);
        let reconnect_max_attempts = parse_or("RECONNECT_MAX_ATTEMPTS", 0)?;
        let connect_timeout = Duration::from_secs(parse_or("CONNECT_TIMEOUT_SECS", 10)?);
        let publish_timeout = Duration::from_secs(parse_or("PUBLISH_TIMEOUT_SECS", 10)?);
        let channel_capacity = parse_or("CHANNEL_CAPACITY", 256)?;
        let pow_difficulty = parse_or("POW_DIFFICULTY", 0)?;
        let tor_socks = non_empty("TOR_SOCKS");
        Ok(Self {
            cache_root,
            relays,
            secret_key,
            filter_authors,
            filter_kinds,
            filter_tag_p,
            filter_since,
            filter_limit,
            resume,
            reconnect_initial,
            reconnect_max,
            reconnect_max_attempts,
            connect_timeout,
            publish_timeout,
            channel_capacity,
            pow_difficulty,
            tor_socks,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        let reconnect = ReconnectPolicy {
            initial: self.reconnect_initial,
            max: self.reconnect_max,
            max_attempts: self.reconnect_max_attempts,
            ..ReconnectPolicy::default()
        };
        ClientConfig {
            relay: RelayOptions {
                reconnect,
                connect_timeout: self.connect_timeout,
                tor_socks: self.tor_socks.clone(),
                ..RelayOptions::default()
            },
            publish_timeout: self.publish_timeout,
            channel_capacity: self.channel_capacity,
            pow_difficulty: self.pow_difficulty,
            resume_from_cache: self.resume,
            ..ClientConfig::default()
        }
    }

    /// Subscription filters for a sync run.
    ///
    /// Configured `FILTER_*` values form a single filter. With none set, an
    /// identity follows what it wrote and what mentions it; an anonymous
    /// session takes recent public events.
    pub fn filters(&self, own_pubkey: Option<&str>) -> Vec<Filter> {
        let configured = self.filter_authors.is_some()
            || self.filter_kinds.is_some()
            || self.filter_tag_p.is_some();
        let mut filters = if configured {
            let mut f = Filter::new();
            if let Some(authors) = &self.filter_authors {
                f = f.authors(authors.iter().cloned());
            }
            if let Some(kinds) = &self.filter_kinds {
                f = f.kinds(kinds.iter().copied());
            }
            if let Some(tags) = &self.filter_tag_p {
                f = f.tag("p", tags.iter().cloned());
            }
            vec![f]
        } else if let Some(pk) = own_pubkey {
            vec![Filter::new().authors([pk]), Filter::new().tag("p", [pk])]
        } else {
            vec![Filter::new().limit(100)]
        };
        for f in filters.iter_mut() {
            if let Some(since) = self.filter_since {
                f.since = Some(since);
            }
            if let Some(limit) = self.filter_limit {
                f.limit = Some(limit);
            }
        }
        filters
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    non_empty(key)
        .map(|s| s.trim().parse().with_context(|| format!("invalid {key}")))
        .transpose()
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(key)?.unwrap_or(default))
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 17] = [
        "CACHE_ROOT",
        "RELAYS",
        "SECRET_KEY",
        "FILTER_AUTHORS",
        "FILTER_KINDS",
        "FILTER_TAG_P",
        "FILTER_SINCE",
        "FILTER_LIMIT",
        "RESUME",
        "RECONNECT_INITIAL_MS",
        "RECONNECT_MAX_MS",
        "RECONNECT_MAX_ATTEMPTS",
        "CONNECT_TIMEOUT_SECS",
        "PUBLISH_TIMEOUT_SECS",
        "CHANNEL_CAPACITY",
        "POW_DIFFICULTY",
        "TOR_SOCKS",
    ];

    fn load(contents: &str) -> Result<Settings> {
        for v in VARS.iter() {
            env::remove_var(v);
        }
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, contents).unwrap();
        Settings::from_env(env_path.to_str().unwrap())
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = load(concat!(
            "CACHE_ROOT=/tmp/nsync\n",
            "RELAYS=ws://r1, wss://r2\n",
            "SECRET_KEY=\n",
            "FILTER_AUTHORS=aa,bb\n",
            "FILTER_KINDS=0,1,31002\n",
            "FILTER_TAG_P=cc\n",
            "FILTER_SINCE=1700000000\n",
            "FILTER_LIMIT=50\n",
            "RECONNECT_INITIAL_MS=250\n",
            "RECONNECT_MAX_ATTEMPTS=3\n",
            "POW_DIFFICULTY=8\n",
            "TOR_SOCKS=127.0.0.1:9050\n",
        ))
        .unwrap();
        assert_eq!(cfg.cache_root, PathBuf::from("/tmp/nsync"));
        assert_eq!(cfg.relays, vec!["ws://r1", "wss://r2"]);
        assert!(cfg.secret_key.is_none());
        assert_eq!(cfg.filter_kinds.as_deref(), Some(&[0, 1, 31002][..]));
        assert_eq!(cfg.filter_since, Some(1_700_000_000));
        assert_eq!(cfg.tor_socks.as_deref(), Some("127.0.0.1:9050"));

        let client = cfg.client_config();
        assert_eq!(client.relay.reconnect.initial, Duration::from_millis(250));
        assert_eq!(client.relay.reconnect.max, Duration::from_secs(30));
        assert_eq!(client.relay.reconnect.max_attempts, 3);
        assert_eq!(client.pow_difficulty, 8);
        assert!(!client.resume_from_cache);

        let filters = cfg.filters(Some("ignored"));
        assert_eq!(filters.len(), 1);
        assert_eq!(
            filters[0],
            Filter::new()
                .authors(["aa", "bb"])
                .kinds([0, 1, 31002])
                .tag("p", ["cc"])
                .since(1_700_000_000)
                .limit(50)
        );
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = load("CACHE_ROOT=/tmp\n").unwrap();
        assert!(cfg.relays.is_empty());
        assert!(cfg.tor_socks.is_none());
        assert!(cfg.filter_authors.is_none());
        assert!(cfg.filter_kinds.is_none());
        assert_eq!(cfg.reconnect_max_attempts, 0);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.channel_capacity, 256);
        assert_eq!(cfg.filters(None), vec![Filter::new().limit(100)]);
        assert_eq!(
            cfg.filters(Some("me")),
            vec![Filter::new().authors(["me"]), Filter::new().tag("p", ["me"])]
        );
    }

    #[test]
    fn empty_filters_are_none() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = load(concat!(
            "CACHE_ROOT=/tmp\n",
            "FILTER_AUTHORS=\n",
            "FILTER_KINDS=x\n",
            "FILTER_TAG_P= , \n",
        ))
        .unwrap();
        assert!(cfg.filter_authors.is_none());
        assert!(cfg.filter_kinds.is_none());
        assert!(cfg.filter_tag_p.is_none());
    }

    #[test]
    fn missing_cache_root_errors() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        assert!(load("RELAYS=ws://r1\n").is_err());
    }

    #[test]
    fn invalid_number_errors() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let err = load("CACHE_ROOT=/tmp\nCHANNEL_CAPACITY=lots\n").unwrap_err();
        assert!(err.to_string().contains("CHANNEL_CAPACITY"));
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
        assert_eq!(csv_u32("1, 2, x,3"), vec![1, 2, 3]);
        assert!(csv_u32("").is_empty());
    }
}
