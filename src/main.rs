//! Command line interface for the sync client. Supports initialization, key
//! generation, relay management, synchronizing into the local cache,
//! inspecting cached projections and publishing events.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nsync::{
    config::Settings,
    relay::parse_relay_url,
    Client, FileCache, KeyManager, NoKeys, StaticKeys, SubscriptionEvent, Tag,
};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nsync",
    author,
    version,
    about = "Offline-first Nostr sync client",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the cache directory for the configured identity.
    Init,
    /// Generate a new identity.
    Keygen {
        /// Store the secret key as `SECRET_KEY` in the env file.
        #[arg(long)]
        save: bool,
    },
    /// Manage the relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Synchronize from the configured relays into the local cache.
    Sync {
        /// Keep streaming for this many seconds; `0` stops once every relay
        /// has sent its stored events.
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },
    /// Print cached projections.
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
    /// Sign and publish an event to the configured relays.
    Publish {
        #[arg(long)]
        kind: u32,
        #[arg(long, default_value = "")]
        content: String,
        /// Tag as `name=value[,value...]`; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

/// Operations available under `nsync relay`.
#[derive(Subcommand)]
enum RelayAction {
    Add { url: String },
    Remove { url: String },
}

/// Views available under `nsync show`.
#[derive(Subcommand)]
enum ShowTarget {
    /// Profile summary and ledger balances for a public key.
    Profile { pubkey: String },
    /// Current entries of a replaceable kind.
    Replaceable { kind: u32 },
    /// Regular events, newest first.
    Events {
        #[arg(long)]
        kind: Option<u32>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            let keys = keys_from(&cfg)?;
            let owner = owner_of(keys.as_ref());
            let dir = cfg.cache_root.join(&owner);
            fs::create_dir_all(&dir)?;
            println!("cache ready at {}", display_path(&dir));
        }
        Commands::Keygen { save } => {
            let keys = StaticKeys::generate();
            println!("public key: {}", keys.public_hex());
            if save {
                if cfg.secret_key.is_some() {
                    bail!("SECRET_KEY already set in {}", cli.env);
                }
                write_env_var(&cli.env, "SECRET_KEY", &keys.secret_hex())?;
                println!("secret key saved to {}", cli.env);
            } else {
                println!("secret key: {}", keys.secret_hex());
            }
        }
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg)?,
        Commands::Sync { seconds } => sync(&cfg, seconds).await?,
        Commands::Show { what } => show(&cfg, what).await?,
        Commands::Publish {
            kind,
            content,
            tags,
        } => {
            let tags = tags
                .iter()
                .map(String::as_str)
                .map(parse_tag)
                .collect::<anyhow::Result<Vec<_>>>()?;
            publish(&cfg, kind, tags, content).await?;
        }
    }
    Ok(())
}

fn keys_from(cfg: &Settings) -> anyhow::Result<Arc<dyn KeyManager>> {
    Ok(match &cfg.secret_key {
        Some(hex_key) => Arc::new(StaticKeys::from_hex(hex_key).context("parsing SECRET_KEY")?),
        None => Arc::new(NoKeys),
    })
}

fn owner_of(keys: &dyn KeyManager) -> String {
    keys.public_key()
        .map(|pk| hex::encode(pk.serialize()))
        .unwrap_or_else(|| nsync::PUBLIC_OWNER.to_string())
}

fn build_client(cfg: &Settings) -> anyhow::Result<Client> {
    let keys = keys_from(cfg)?;
    let config = cfg.client_config();
    let cache =
        Arc::new(FileCache::new(cfg.cache_root.clone()).with_taxonomy(config.taxonomy.clone()));
    Ok(Client::new(config, keys, cache))
}

async fn sync(cfg: &Settings, seconds: u64) -> anyhow::Result<()> {
    let mut client = build_client(cfg)?;
    let loaded = client.load().await?;
    let filters = cfg.filters(client.public_key().as_deref());
    let mut stream = client.connect(&cfg.relays, filters).await?;

    let mut received = 0usize;
    let reachable = client.wait_connected(cfg.connect_timeout).await;
    if !reachable {
        warn!("no relay reachable; keeping cached state");
    }
    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let until = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(until);
    while reachable {
        tokio::select! {
            _ = &mut until => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            item = stream.recv() => match item {
                Some(SubscriptionEvent::Event { .. }) => received += 1,
                Some(SubscriptionEvent::AllEose) if deadline.is_none() => break,
                Some(SubscriptionEvent::Closed { relay, reason }) => {
                    warn!(%relay, %reason, "relay closed subscription");
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    client.disconnect().await;
    if client.pending_writes() > 0 {
        warn!(pending = client.pending_writes(), "some events were not written to the cache");
    }
    println!(
        "{received} new events, {loaded} from cache, {} in store",
        client.store().len()
    );
    Ok(())
}

async fn show(cfg: &Settings, what: ShowTarget) -> anyhow::Result<()> {
    let client = build_client(cfg)?;
    client.load().await?;
    let store = client.store();
    match what {
        ShowTarget::Profile { pubkey } => {
            println!("name: {}", store.display_name(&pubkey));
            if let Some(picture) = store.picture(&pubkey) {
                println!("picture: {picture}");
            }
            if let Some(lud16) = store.lud16(&pubkey) {
                println!("lud16: {lud16}");
            }
            println!("units: {}", store.unit_balance(&pubkey));
            println!("merits: {}", store.merit_balance(&pubkey));
        }
        ShowTarget::Replaceable { kind } => {
            for entry in store.replaceables(kind) {
                println!("{}", serde_json::to_string(&entry.event)?);
            }
        }
        ShowTarget::Events { kind, limit } => {
            for entry in store.events(kind).into_iter().take(limit) {
                println!("{}", serde_json::to_string(&entry.event)?);
            }
        }
    }
    Ok(())
}

async fn publish(cfg: &Settings, kind: u32, tags: Vec<Tag>, content: String) -> anyhow::Result<()> {
    let mut client = build_client(cfg)?;
    if !client.can_publish() {
        bail!("SECRET_KEY is not set; run `nsync keygen --save` first");
    }
    client.start(&cfg.relays)?;
    if !client.wait_connected(cfg.connect_timeout).await {
        client.disconnect().await;
        bail!("no relay reachable");
    }
    let res = client.publish_content(kind, tags, content).await;
    client.disconnect().await;
    let outcome = res?;
    println!("{}", outcome.event.id);
    for relay in &outcome.accepted {
        println!("accepted by {relay}");
    }
    for (relay, reason) in &outcome.rejected {
        println!("rejected by {relay}: {reason}");
    }
    Ok(())
}

/// Parse `name=value[,value...]` into a tag.
fn parse_tag(raw: &str) -> anyhow::Result<Tag> {
    let Some((name, values)) = raw.split_once('=') else {
        bail!("tag must look like name=value: {raw}");
    };
    if name.is_empty() {
        bail!("tag name is empty: {raw}");
    }
    Ok(Tag::new(std::iter::once(name).chain(values.split(','))))
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_root = base_dir.join("nsync-data");
    let mut content = String::new();
    content.push_str(&format!("CACHE_ROOT={}\n", display_path(&cache_root)));
    content.push_str("RELAYS=\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("FILTER_AUTHORS=\n");
    content.push_str("FILTER_KINDS=\n");
    content.push_str("FILTER_TAG_P=\n");
    content.push_str("RESUME=1\n");
    content.push_str("POW_DIFFICULTY=0\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    match action {
        RelayAction::Add { url } => {
            parse_relay_url(&url)?;
            if relays.iter().any(|existing| existing == &url) {
                bail!("relay already configured: {url}");
            }
            relays.push(url);
        }
        RelayAction::Remove { url } => {
            let before = relays.len();
            relays.retain(|existing| existing != &url);
            if relays.len() == before {
                bail!("relay not configured: {url}");
            }
        }
    }
    write_env_var(env_path, "RELAYS", &relays.join(","))
}

/// Replace or append `key=value` in the env file and the process environment.
fn write_env_var(env_path: &str, key: &str, value: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let prefix = format!("{key}=");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with(&prefix) {
            new_content.push_str(&format!("{key}={value}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("{key}={value}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var(key, value);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
