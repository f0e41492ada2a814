//! Offline-first Nostr synchronization client.
//!
//! Events from a set of relays are validated, routed by kind, folded into
//! convergent in-memory projections and written to a per-identity file
//! cache so the next session starts from where this one stopped.

pub mod cache;
pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod message;
pub mod projection;
pub mod relay;
pub mod router;
pub mod subscription;

pub use cache::{DurableCache, FileCache, MemoryCache, PUBLIC_OWNER};
pub use client::{Client, ClientConfig, PublishOutcome};
pub use content::{Content, ParsedContent, Parsers};
pub use error::{ClientError, ConnectionError, StorageError, ValidationError};
pub use event::{Event, Tag, UnsignedEvent};
pub use filter::Filter;
pub use keys::{KeyManager, NoKeys, StaticKeys};
pub use projection::{Projected, ProjectionStore, ReplaceableKey};
pub use relay::{ConnectionState, ReconnectPolicy, RelayOptions};
pub use router::{KindClass, Taxonomy};
pub use subscription::{EventStream, SubscriptionEvent};
