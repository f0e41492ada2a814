//! Subscription registry: binds wire subscription ids to bounded handler
//! channels and tracks end-of-stored-events per relay.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    event::Event,
    filter::{any_match, Filter},
    message::ClientMessage,
    projection::Projected,
};

pub type SubscriptionId = String;

/// Random 8-character hex subscription id.
pub fn generate_subscription_id() -> SubscriptionId {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Item delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A validated event that changed the projections (or an ephemeral one).
    Event { relay: String, entry: Projected },
    /// A matching entry already in the local store when the subscription
    /// was registered. These come first, oldest first.
    Cached { entry: Projected },
    /// `relay` finished sending stored events.
    EndOfStoredEvents { relay: String },
    /// Every relay the REQ went to has sent EOSE, closed it, or dropped.
    AllEose,
    /// `relay` refused or ended the subscription.
    Closed { relay: String, reason: String },
}

/// Receiving half handed to the subscriber.
///
/// Yields nothing once the subscription has been removed, even if items were
/// still buffered.
#[derive(Debug)]
pub struct EventStream {
    id: SubscriptionId,
    backlog: VecDeque<SubscriptionEvent>,
    rx: mpsc::Receiver<SubscriptionEvent>,
    closed: CancellationToken,
}

impl EventStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.next().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Stream for EventStream {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed.is_cancelled() {
            return Poll::Ready(None);
        }
        if let Some(item) = self.backlog.pop_front() {
            return Poll::Ready(Some(item));
        }
        self.rx.poll_recv(cx)
    }
}

/// Sending half used by the ingest task.
#[derive(Debug, Clone)]
pub struct Handler {
    sender: mpsc::Sender<SubscriptionEvent>,
    closed: CancellationToken,
}

impl Handler {
    /// Wait for channel capacity and deliver. Gives up when the subscription
    /// is removed or `shutdown` fires. Returns whether the item was queued.
    pub async fn deliver(&self, item: SubscriptionEvent, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            _ = shutdown.cancelled() => false,
            res = self.sender.send(item) => res.is_ok(),
        }
    }
}

/// Registry entry for one live subscription.
#[derive(Debug)]
pub struct Entry {
    filters: Vec<Filter>,
    handler: Handler,
    pending_eose: HashSet<String>,
    eose_done: bool,
    delivered: HashSet<String>,
}

impl Entry {
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn handler(&self) -> Handler {
        self.handler.clone()
    }

    fn settle(&mut self, relay: &str) -> bool {
        self.pending_eose.remove(relay);
        if !self.eose_done && self.pending_eose.is_empty() {
            self.eose_done = true;
            return true;
        }
        false
    }
}

/// Shared registry of active subscriptions.
#[derive(Clone, Default)]
pub struct Subscriptions {
    inner: Arc<Mutex<HashMap<SubscriptionId, Entry>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `filters` under a fresh id with a handler channel of `capacity`.
    pub fn register(&self, filters: Vec<Filter>, capacity: usize) -> EventStream {
        self.register_with(filters, capacity, |_| Vec::new())
    }

    /// Like [`register`](Self::register), but the stream first yields
    /// `backlog(&filters)` as [`SubscriptionEvent::Cached`] items.
    ///
    /// `backlog` runs with the registry locked and must return entries newest
    /// first. Its events count as delivered, so a later relay copy is not
    /// passed on again.
    pub fn register_with<F>(&self, filters: Vec<Filter>, capacity: usize, backlog: F) -> EventStream
    where
        F: FnOnce(&[Filter]) -> Vec<Projected>,
    {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let mut inner = self.inner.lock();
        let mut id = generate_subscription_id();
        while inner.contains_key(&id) {
            id = generate_subscription_id();
        }
        let cached = backlog(&filters);
        let delivered = cached.iter().map(|p| p.event.id.clone()).collect();
        let backlog = cached
            .into_iter()
            .rev()
            .map(|entry| SubscriptionEvent::Cached { entry })
            .collect();
        inner.insert(
            id.clone(),
            Entry {
                filters,
                handler: Handler {
                    sender,
                    closed: closed.clone(),
                },
                pending_eose: HashSet::new(),
                eose_done: false,
                delivered,
            },
        );
        EventStream {
            id,
            backlog,
            rx,
            closed,
        }
    }

    /// Drop the binding. The handler stream ends immediately.
    pub fn remove(&self, id: &str) -> bool {
        match self.inner.lock().remove(id) {
            Some(entry) => {
                entry.handler.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop every binding, returning the removed ids.
    pub fn clear(&self) -> Vec<SubscriptionId> {
        let mut inner = self.inner.lock();
        inner
            .drain()
            .map(|(id, entry)| {
                entry.handler.closed.cancel();
                id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filters(&self, id: &str) -> Option<Vec<Filter>> {
        self.inner.lock().get(id).map(|e| e.filters.clone())
    }

    /// Lock the registry. While the guard is held no subscription can be
    /// added or removed.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.inner.lock()
    }

    /// REQ frames for every active subscription, replayed after a (re)connect.
    pub fn req_messages(&self) -> Vec<ClientMessage> {
        self.inner
            .lock()
            .iter()
            .map(|(id, e)| ClientMessage::Req {
                subscription_id: id.clone(),
                filters: e.filters.clone(),
            })
            .collect()
    }

    /// Expect EOSE from `relays` for subscription `id`.
    pub fn expect_eose<I>(&self, id: &str, relays: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(entry) = self.inner.lock().get_mut(id) {
            if !entry.eose_done {
                entry.pending_eose.extend(relays);
            }
        }
    }

    /// `relay` just (re)connected and will be sent every REQ again.
    pub fn expect_eose_from(&self, relay: &str) {
        for entry in self.inner.lock().values_mut() {
            if !entry.eose_done {
                entry.pending_eose.insert(relay.to_string());
            }
        }
    }

    /// Record EOSE from `relay`. Returns the handler plus whether this
    /// completed the subscription's initial sync.
    pub fn eose(&self, id: &str, relay: &str) -> Option<(Handler, bool)> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(id)?;
        let completed = entry.settle(relay);
        Some((entry.handler(), completed))
    }

    /// `relay` dropped: it will not send EOSE for anything in flight. Returns
    /// handlers whose initial sync completes as a result.
    pub fn relay_lost(&self, relay: &str) -> Vec<Handler> {
        self.inner
            .lock()
            .values_mut()
            .filter(|e| e.pending_eose.contains(relay))
            .filter_map(|e| e.settle(relay).then(|| e.handler()))
            .collect()
    }

    /// Handlers of subscription `origin` plus every other active subscription
    /// whose filters match `event`, skipping any that already got it. The
    /// returned handlers are recorded as having received `event`.
    pub fn matching(&self, event: &Event, origin: &str) -> Vec<Handler> {
        self.inner
            .lock()
            .iter_mut()
            .filter(|(id, e)| id.as_str() == origin || any_match(&e.filters, event))
            .filter_map(|(_, e)| e.delivered.insert(event.id.clone()).then(|| e.handler()))
            .collect()
    }
}
