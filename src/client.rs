//! Client facade: ties relays, subscriptions, routing, projections and the
//! durable cache together.
//!
//! Inbound frames from every relay funnel through one bounded channel into a
//! single ingest task, the only writer of the projection store while
//! connected. Each event moves through [`Stage`]s:
//!
//! ```text
//! received -> validated -> discarded (duplicate)
//!                       -> routed -> projected -> persisted
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{DurableCache, PUBLIC_OWNER},
    content::Parsers,
    error::{ClientError, Result, StorageError},
    event::{Event, Tag, UnsignedEvent},
    filter::Filter,
    keys::KeyManager,
    message::{ClientMessage, RelayMessage},
    projection::ProjectionStore,
    relay::{ConnectionState, Inbound, RelayOptions, RelayPool},
    router::{accept, KindClass, Router, Stage, Taxonomy},
    subscription::{EventStream, SubscriptionEvent, Subscriptions},
};

/// Failed cache writes kept for retry before the oldest are dropped.
const MAX_PENDING_WRITES: usize = 10_000;

/// Tunables for a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub relay: RelayOptions,
    /// How long `publish` waits for `OK` frames.
    pub publish_timeout: Duration,
    /// Capacity of the inbound frame channel and of each handler channel.
    pub channel_capacity: usize,
    /// NIP-13 difficulty for published events; `0` disables mining.
    pub pow_difficulty: u8,
    /// Start new subscriptions at the newest matching cached event.
    pub resume_from_cache: bool,
    pub taxonomy: Taxonomy,
    pub parsers: Parsers,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: RelayOptions::default(),
            publish_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            pow_difficulty: 0,
            resume_from_cache: false,
            taxonomy: Taxonomy::default(),
            parsers: Parsers::default(),
        }
    }
}

/// One relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub relay: String,
    pub accepted: bool,
    pub message: String,
}

/// Result of a publish that at least one relay accepted.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub event: Event,
    pub accepted: Vec<String>,
    /// `(relay, reason)` for each explicit rejection.
    pub rejected: Vec<(String, String)>,
    /// Relays that did not answer before the timeout.
    pub unanswered: Vec<String>,
}

type Confirmations = Arc<Mutex<HashMap<String, mpsc::Sender<Ack>>>>;

struct Session {
    pool: RelayPool,
    ingest: JoinHandle<()>,
    token: CancellationToken,
}

/// Entry point for applications.
pub struct Client {
    config: ClientConfig,
    keys: Arc<dyn KeyManager>,
    store: ProjectionStore,
    subscriptions: Subscriptions,
    router: Arc<Mutex<Router>>,
    persister: Arc<Persister>,
    confirmations: Confirmations,
    session: Option<Session>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        keys: Arc<dyn KeyManager>,
        cache: Arc<dyn DurableCache>,
    ) -> Self {
        let owner = keys
            .public_key()
            .map(|pk| hex::encode(pk.serialize()))
            .unwrap_or_else(|| PUBLIC_OWNER.to_string());
        let router = Router::new(config.taxonomy.clone(), config.parsers.clone());
        Self {
            config,
            keys,
            store: ProjectionStore::new(),
            subscriptions: Subscriptions::new(),
            router: Arc::new(Mutex::new(router)),
            persister: Arc::new(Persister::new(cache, owner)),
            confirmations: Arc::default(),
            session: None,
        }
    }

    /// Projections owned by this client.
    pub fn store(&self) -> &ProjectionStore {
        &self.store
    }

    /// Hex public key of the local identity.
    pub fn public_key(&self) -> Option<String> {
        self.keys.public_key().map(|pk| hex::encode(pk.serialize()))
    }

    /// False for read-only sessions without a secret key.
    pub fn can_publish(&self) -> bool {
        self.keys.secret_key().is_some()
    }

    /// Cache partition for this identity.
    pub fn owner(&self) -> &str {
        &self.persister.owner
    }

    /// Fold cached events into the projections. Call before `connect`; the
    /// ingest task is the only writer once connected.
    pub async fn load(&self) -> Result<usize> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let cache = self.persister.cache.clone();
        let owner = self.persister.owner.clone();
        let events = tokio::task::spawn_blocking(move || cache.load(&owner)).await??;
        let total = events.len();
        let mut applied = 0;
        let mut router = self.router.lock();
        for event in events {
            if router.is_duplicate(&event.id) {
                continue;
            }
            let routed = router.route_trusted(event);
            if self.store.apply(&routed).is_some_and(|u| u.changed()) {
                applied += 1;
            }
        }
        info!(owner = %self.persister.owner, total, applied, "loaded cached events");
        Ok(applied)
    }

    /// Start relay connections and subscribe to `filters`.
    pub async fn connect(&mut self, relays: &[String], filters: Vec<Filter>) -> Result<EventStream> {
        self.start(relays)?;
        self.subscribe(filters).await
    }

    /// Start relay connections without subscribing. Used by publish-only
    /// sessions.
    pub fn start(&mut self, relays: &[String]) -> Result<()> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let pool = RelayPool::connect(
            relays,
            self.config.relay.clone(),
            self.subscriptions.clone(),
            tx,
            token.clone(),
        );
        if pool.urls().is_empty() {
            warn!("no usable relay urls; running from cache only");
        }
        let ingest = Ingest {
            store: self.store.clone(),
            subscriptions: self.subscriptions.clone(),
            router: self.router.clone(),
            persister: self.persister.clone(),
            confirmations: self.confirmations.clone(),
            token: token.clone(),
        };
        let ingest = tokio::spawn(ingest.run(rx));
        info!(relays = pool.urls().len(), "client connecting");
        self.session = Some(Session {
            pool,
            ingest,
            token,
        });
        Ok(())
    }

    /// Wait until at least one relay is connected or `limit` elapses.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let Some(session) = &self.session else {
            return false;
        };
        if session.pool.urls().is_empty() {
            return false;
        }
        while !session.pool.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    /// Register a subscription and send its REQ to every connected relay.
    /// Relays that connect later receive it on connect.
    ///
    /// The stream starts with every matching entry already in the store, as
    /// [`SubscriptionEvent::Cached`] items, oldest first.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<EventStream> {
        let filters = if self.config.resume_from_cache {
            filters.into_iter().map(|f| self.resume(f)).collect()
        } else {
            filters
        };
        let stream = self.subscriptions.register_with(
            filters.clone(),
            self.config.channel_capacity,
            |filters| self.store.matching_entries(filters),
        );
        let id = stream.id().to_string();
        if let Some(session) = &self.session {
            self.subscriptions
                .expect_eose(&id, session.pool.connected_urls());
            let req = ClientMessage::Req {
                subscription_id: id.clone(),
                filters,
            };
            let sent = session.pool.send_all(&req).await;
            debug!(subscription = %id, relays = sent.len(), "subscribed");
        } else {
            debug!(subscription = %id, "subscribed while offline");
        }
        Ok(stream)
    }

    fn resume(&self, filter: Filter) -> Filter {
        if filter.since.is_some() {
            return filter;
        }
        match self.store.matching(std::slice::from_ref(&filter)).first() {
            Some(newest) => {
                let since = newest.created_at;
                filter.since(since)
            }
            None => filter,
        }
    }

    /// Stop routing for `id` and send `CLOSE`. Nothing is delivered or
    /// projected for `id` once this returns.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        if !self.subscriptions.remove(id) {
            return Err(ClientError::UnknownSubscription(id.to_string()));
        }
        if let Some(session) = &self.session {
            let close = ClientMessage::Close {
                subscription_id: id.to_string(),
            };
            session.pool.send_all(&close).await;
        }
        debug!(subscription = %id, "unsubscribed");
        Ok(())
    }

    /// Sign, optionally mine, and send `unsigned` to every connected relay,
    /// then wait for `OK` frames. Succeeds when at least one relay accepts.
    pub async fn publish(&self, unsigned: UnsignedEvent) -> Result<PublishOutcome> {
        let keypair = self.keys.keypair().ok_or(ClientError::NoKeyAvailable)?;
        let session = self.session.as_ref().ok_or(ClientError::NotConnected)?;
        if !session.pool.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let difficulty = self.config.pow_difficulty;
        let event = if difficulty > 0 {
            tokio::task::spawn_blocking(move || unsigned.mine(&keypair, difficulty)).await??
        } else {
            unsigned.sign(&keypair)?
        };

        let (ack_tx, mut ack_rx) = mpsc::channel(session.pool.urls().len().max(1) * 2);
        self.confirmations.lock().insert(event.id.clone(), ack_tx);
        let sent = session
            .pool
            .send_all(&ClientMessage::Event(event.clone()))
            .await;
        if sent.is_empty() {
            self.confirmations.lock().remove(&event.id);
            return Err(ClientError::NotConnected);
        }
        info!(id = %event.id, kind = event.kind, relays = sent.len(), "published event");

        let deadline = Instant::now() + self.config.publish_timeout;
        let mut waiting: HashSet<String> = sent.into_iter().collect();
        let mut accepted = vec![];
        let mut rejected = vec![];
        while !waiting.is_empty() {
            match timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(ack)) => {
                    if !waiting.remove(&ack.relay) {
                        continue;
                    }
                    if ack.accepted {
                        accepted.push(ack.relay);
                    } else {
                        warn!(relay = %ack.relay, id = %event.id, reason = %ack.message, "event rejected");
                        rejected.push((ack.relay, ack.message));
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.confirmations.lock().remove(&event.id);

        if !accepted.is_empty() {
            return Ok(PublishOutcome {
                event,
                accepted,
                rejected,
                unanswered: waiting.into_iter().collect(),
            });
        }
        if rejected.is_empty() {
            return Err(ClientError::Timeout(self.config.publish_timeout));
        }
        let details = rejected
            .iter()
            .map(|(relay, reason)| format!("{relay}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ClientError::PublishRejected {
            event_id: event.id,
            details,
        })
    }

    /// Publish a new event of `kind` stamped with the current time.
    pub async fn publish_content(
        &self,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Result<PublishOutcome> {
        self.publish(UnsignedEvent::new(kind, tags, content)).await
    }

    /// Publish `value` as JSON content.
    pub async fn publish_json(&self, kind: u32, tags: Vec<Tag>, value: &Value) -> Result<PublishOutcome> {
        let content = serde_json::to_string(value)?;
        self.publish_content(kind, tags, content).await
    }

    /// Close every subscription and connection. Projections and cache are
    /// kept. Calling it again is a no-op.
    pub async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        {
            // the ingest task checks the token under this lock before projecting
            let _guard = self.subscriptions.lock();
            session.token.cancel();
        }
        let closed = self.subscriptions.clear();
        session.pool.shutdown().await;
        if let Err(e) = session.ingest.await {
            warn!(error = %e, "ingest task ended abnormally");
        }
        self.confirmations.lock().clear();
        info!(subscriptions = closed.len(), "client disconnected");
    }

    /// True when at least one relay is connected.
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.pool.is_connected())
    }

    pub fn relay_states(&self) -> HashMap<String, ConnectionState> {
        self.session
            .as_ref()
            .map(|s| s.pool.states())
            .unwrap_or_default()
    }

    /// Change notifications for one relay.
    pub fn watch_relay(&self, url: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.session.as_ref()?.pool.watch_state(url)
    }

    /// Cache writes waiting for retry.
    pub fn pending_writes(&self) -> usize {
        self.persister.pending.lock().len()
    }
}

/// Writes projected events to the durable cache, keeping failed writes for
/// the next attempt.
struct Persister {
    cache: Arc<dyn DurableCache>,
    owner: String,
    pending: Mutex<VecDeque<Event>>,
}

impl Persister {
    fn new(cache: Arc<dyn DurableCache>, owner: String) -> Self {
        Self {
            cache,
            owner,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Write `event` together with any earlier failed writes in one transaction.
    async fn persist(&self, event: Event) -> bool {
        let mut batch: Vec<Event> = self.pending.lock().drain(..).collect();
        batch.push(event);
        let cache = self.cache.clone();
        let owner = self.owner.clone();
        let res = tokio::task::spawn_blocking(move || {
            let res = write_batch(cache.as_ref(), &owner, &batch);
            (res, batch)
        })
        .await;
        match res {
            Ok((Ok(()), batch)) => {
                debug!(stage = %Stage::Persisted, count = batch.len(), "cache updated");
                true
            }
            Ok((Err(e), batch)) => {
                warn!(error = %e, queued = batch.len(), "cache write failed; will retry");
                self.requeue(batch);
                false
            }
            Err(e) => {
                warn!(error = %e, "cache task failed");
                false
            }
        }
    }

    fn requeue(&self, batch: Vec<Event>) {
        let mut pending = self.pending.lock();
        for ev in batch.into_iter().rev() {
            pending.push_front(ev);
        }
        while pending.len() > MAX_PENDING_WRITES {
            if let Some(dropped) = pending.pop_front() {
                warn!(id = %dropped.id, "dropping unwritten cache entry");
            }
        }
    }
}

fn write_batch(
    cache: &dyn DurableCache,
    owner: &str,
    batch: &[Event],
) -> std::result::Result<(), StorageError> {
    let mut txn = cache.begin(owner)?;
    for ev in batch {
        txn.put(ev)?;
    }
    txn.commit()
}

/// Single consumer of every relay's inbound frames.
struct Ingest {
    store: ProjectionStore,
    subscriptions: Subscriptions,
    router: Arc<Mutex<Router>>,
    persister: Arc<Persister>,
    confirmations: Confirmations,
    token: CancellationToken,
}

impl Ingest {
    async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = inbound.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.handle(item).await;
        }
        debug!("ingest task stopped");
    }

    async fn handle(&self, item: Inbound) {
        match item {
            Inbound::Connected { relay } => self.subscriptions.expect_eose_from(&relay),
            Inbound::Lost { relay } => {
                for handler in self.subscriptions.relay_lost(&relay) {
                    handler.deliver(SubscriptionEvent::AllEose, &self.token).await;
                }
            }
            Inbound::Message { relay, message } => match message {
                RelayMessage::Event {
                    subscription_id,
                    event,
                } => self.on_event(relay, subscription_id, event).await,
                RelayMessage::Eose { subscription_id } => {
                    if let Some((handler, done)) = self.subscriptions.eose(&subscription_id, &relay) {
                        debug!(%relay, subscription = %subscription_id, "end of stored events");
                        handler
                            .deliver(SubscriptionEvent::EndOfStoredEvents { relay }, &self.token)
                            .await;
                        if done {
                            handler.deliver(SubscriptionEvent::AllEose, &self.token).await;
                        }
                    }
                }
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    info!(%relay, subscription = %subscription_id, reason = %message, "subscription closed by relay");
                    if let Some((handler, done)) = self.subscriptions.eose(&subscription_id, &relay) {
                        handler
                            .deliver(
                                SubscriptionEvent::Closed {
                                    relay,
                                    reason: message,
                                },
                                &self.token,
                            )
                            .await;
                        if done {
                            handler.deliver(SubscriptionEvent::AllEose, &self.token).await;
                        }
                    }
                }
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                } => {
                    let waiter = self.confirmations.lock().get(&event_id).cloned();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.try_send(Ack {
                                relay,
                                accepted,
                                message,
                            });
                        }
                        None => debug!(%relay, id = %event_id, "unsolicited OK"),
                    }
                }
                RelayMessage::Notice(notice) => info!(%relay, %notice, "relay notice"),
            },
        }
    }

    async fn on_event(&self, relay: String, subscription_id: String, raw: Value) {
        debug!(stage = %Stage::Received, %relay, subscription = %subscription_id);
        let event = match accept(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(stage = %Stage::Discarded, %relay, error = %e, "rejected event");
                return;
            }
        };
        debug!(stage = %Stage::Validated, id = %event.id);
        let duplicate = self.router.lock().is_duplicate(&event.id);
        let routed = self.router.lock().route(event);
        debug!(stage = %Stage::Routed, id = %routed.event().id, class = ?routed.class);

        // `None` when the event was applied before
        let change = {
            let active = self.subscriptions.lock();
            if self.token.is_cancelled() || !active.contains_key(&subscription_id) {
                debug!(subscription = %subscription_id, "subscription no longer active; dropping event");
                return;
            }
            (!duplicate).then(|| {
                let change = self.store.apply(&routed);
                self.router.lock().mark_seen(&routed.event().id);
                change
            })
        };

        let current = match change {
            Some(Some(upsert)) if upsert.changed() => {
                debug!(stage = %Stage::Projected, id = %routed.event().id, ?upsert);
                self.persister.persist(routed.event().clone()).await;
                true
            }
            Some(Some(_)) => {
                debug!(id = %routed.event().id, "stale replaceable event");
                false
            }
            Some(None) => {
                debug_assert_eq!(routed.class, KindClass::Ephemeral);
                true
            }
            None => {
                debug!(stage = %Stage::Discarded, id = %routed.event().id, "duplicate");
                self.store.holds(&routed)
            }
        };
        if !current {
            return;
        }

        let handlers = self.subscriptions.matching(routed.event(), &subscription_id);
        for handler in handlers {
            let item = SubscriptionEvent::Event {
                relay: relay.clone(),
                entry: routed.entry.clone(),
            };
            handler.deliver(item, &self.token).await;
        }
    }
}
