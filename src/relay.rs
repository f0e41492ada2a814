//! Relay connections: one task per endpoint, each running an explicit
//! reconnect state machine and owning the only writer for its socket.

use std::{collections::HashMap, time::Duration};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ConnectionError,
    message::{ClientMessage, RelayMessage},
    subscription::Subscriptions,
};

/// Lifecycle of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting before the next connection attempt.
    Backoff,
    /// Stopped: cancelled, or gave up after the maximum number of attempts.
    Disconnected,
}

/// Capped exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Jitter factor range applied to every delay.
    pub jitter: (f64, f64),
    /// Give up after this many consecutive failures; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: (0.85, 1.15),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Jittered delay, still capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let (lo, hi) = self.jitter;
        let factor = if hi > lo {
            rand::thread_rng().gen_range(lo..hi)
        } else {
            lo
        };
        let secs = self.base_delay(attempt).as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

/// Connection options shared by every relay in a pool.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// SOCKS5 proxy, e.g. a local Tor daemon at `127.0.0.1:9050`.
    pub tor_socks: Option<String>,
    /// Capacity of each relay's outbound frame queue.
    pub outbound_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            tor_socks: None,
            outbound_capacity: 64,
        }
    }
}

/// What relay tasks report to the ingest task.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Connected and about to replay every REQ.
    Connected { relay: String },
    Message { relay: String, message: RelayMessage },
    /// Connection dropped; anything in flight from this relay is lost.
    Lost { relay: String },
}

struct RelayHandle {
    url: String,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<ClientMessage>,
}

/// Set of relay connections sharing one cancellation token.
pub struct RelayPool {
    relays: Vec<RelayHandle>,
    tasks: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

/// Accept only `ws://` and `wss://` URLs with a host.
pub fn parse_relay_url(raw: &str) -> Result<Url, ConnectionError> {
    let url = Url::parse(raw).map_err(|e| ConnectionError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
        return Err(ConnectionError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

impl RelayPool {
    /// Spawn one connection task per valid URL. Invalid URLs are logged and skipped.
    pub fn connect(
        urls: &[String],
        options: RelayOptions,
        subscriptions: Subscriptions,
        inbound: mpsc::Sender<Inbound>,
        token: CancellationToken,
    ) -> Self {
        let mut relays = vec![];
        let mut tasks = vec![];
        for raw in urls {
            if relays.iter().any(|r: &RelayHandle| &r.url == raw) {
                continue;
            }
            if let Err(e) = parse_relay_url(raw) {
                warn!(relay = %raw, error = %e, "skipping relay");
                continue;
            }
            let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
            let (out_tx, out_rx) = mpsc::channel(options.outbound_capacity.max(1));
            let task = RelayTask {
                url: raw.clone(),
                options: options.clone(),
                subscriptions: subscriptions.clone(),
                inbound: inbound.clone(),
                outbound: out_rx,
                state: state_tx,
                token: token.clone(),
            };
            tasks.push(tokio::spawn(task.run()));
            relays.push(RelayHandle {
                url: raw.clone(),
                state: state_rx,
                outbound: out_tx,
            });
        }
        Self {
            relays,
            tasks,
            token,
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url.clone()).collect()
    }

    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.relays
            .iter()
            .map(|r| (r.url.clone(), *r.state.borrow()))
            .collect()
    }

    /// Change notifications for one relay's state.
    pub fn watch_state(&self, url: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.relays
            .iter()
            .find(|r| r.url == url)
            .map(|r| r.state.clone())
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| *r.state.borrow() == ConnectionState::Connected)
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.relays
            .iter()
            .any(|r| *r.state.borrow() == ConnectionState::Connected)
    }

    /// Queue `msg` on every connected relay. Returns the relays it was queued on.
    /// Disconnected relays receive subscriptions through REQ replay instead.
    pub async fn send_all(&self, msg: &ClientMessage) -> Vec<String> {
        let mut sent = vec![];
        for relay in &self.relays {
            if *relay.state.borrow() != ConnectionState::Connected {
                continue;
            }
            let queued = tokio::select! {
                _ = self.token.cancelled() => false,
                res = relay.outbound.send(msg.clone()) => res.is_ok(),
            };
            if queued {
                sent.push(relay.url.clone());
            }
        }
        sent
    }

    /// Cancel every connection task and wait for them to finish.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "relay task ended abnormally");
            }
        }
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
}

struct RelayTask {
    url: String,
    options: RelayOptions,
    subscriptions: Subscriptions,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<ClientMessage>,
    state: watch::Sender<ConnectionState>,
    token: CancellationToken,
}

impl RelayTask {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            debug!(relay = %self.url, "connecting");
            let attempt = tokio::select! {
                _ = self.token.cancelled() => break,
                res = timeout(
                    self.options.connect_timeout,
                    connect_ws(&self.url, self.options.tor_socks.as_deref()),
                ) => res.unwrap_or(Err(ConnectionError::Timeout)),
            };
            match attempt {
                Ok(ws) => {
                    failures = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    info!(relay = %self.url, "connected");
                    let ended = self.session(ws).await;
                    // no new frames may be queued for a socket that is gone
                    self.state.send_replace(ConnectionState::Backoff);
                    match ended {
                        Ok(SessionEnd::Cancelled) => break,
                        Ok(SessionEnd::Closed) => info!(relay = %self.url, "connection closed"),
                        Err(e) => warn!(relay = %self.url, error = %e, "connection failed"),
                    }
                    if !self.forward(Inbound::Lost { relay: self.url.clone() }).await {
                        break;
                    }
                }
                Err(e) => warn!(relay = %self.url, error = %e, "connect failed"),
            }

            failures += 1;
            if self.options.reconnect.exhausted(failures) {
                warn!(relay = %self.url, failures, "giving up on relay");
                break;
            }
            self.state.send_replace(ConnectionState::Backoff);
            let delay = self.options.reconnect.delay(failures - 1);
            debug!(relay = %self.url, ?delay, "backing off");
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        debug!(relay = %self.url, "relay task stopped");
    }

    /// Hand a report to the ingest task, giving up on cancellation.
    async fn forward(&self, item: Inbound) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            res = self.inbound.send(item) => res.is_ok(),
        }
    }

    async fn session(&mut self, ws: RelaySocket) -> Result<SessionEnd, ConnectionError> {
        let (mut sink, mut stream) = ws.split();

        let carried = carry_over(&mut self.outbound);
        if !self.forward(Inbound::Connected { relay: self.url.clone() }).await {
            return Ok(SessionEnd::Cancelled);
        }
        for msg in self.subscriptions.req_messages().iter().chain(&carried) {
            sink.send(Message::Text(msg.to_frame())).await?;
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Cancelled);
                }
                out = self.outbound.recv() => match out {
                    Some(msg) => sink.send(Message::Text(msg.to_frame())).await?,
                    None => return Ok(SessionEnd::Cancelled),
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(txt))) => match RelayMessage::parse(&txt) {
                        Some(message) => {
                            let item = Inbound::Message { relay: self.url.clone(), message };
                            if !self.forward(item).await {
                                return Ok(SessionEnd::Cancelled);
                            }
                        }
                        None => debug!(relay = %self.url, "ignoring unrecognized frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

/// Drain frames queued for the previous session. Subscription frames are
/// dropped since every REQ is replayed from the registry; published events
/// are kept so their `OK` can still arrive.
fn carry_over(outbound: &mut mpsc::Receiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut carried = vec![];
    while let Ok(msg) = outbound.try_recv() {
        if matches!(msg, ClientMessage::Event(_)) {
            carried.push(msg);
        }
    }
    carried
}

type RelaySocket = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Open a WebSocket to `relay`, optionally through a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelaySocket, ConnectionError> {
    let url = parse_relay_url(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectionError::InvalidUrl(relay.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ConnectionError::InvalidUrl(relay.to_string()))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_options() -> RelayOptions {
        RelayOptions {
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(50),
                ..ReconnectPolicy::default()
            },
            connect_timeout: Duration::from_secs(2),
            ..RelayOptions::default()
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.base_delay(0), Duration::from_secs(1));
        assert_eq!(p.base_delay(1), Duration::from_millis(1500));
        assert_eq!(p.base_delay(2), Duration::from_millis(2250));
        assert_eq!(p.base_delay(20), Duration::from_secs(30));
        for attempt in 0..30 {
            let d = p.delay(attempt);
            let base = p.base_delay(attempt).as_secs_f64();
            assert!(d.as_secs_f64() >= base * 0.85 - 1e-9);
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn max_attempts_zero_is_unlimited() {
        let p = ReconnectPolicy::default();
        assert!(!p.exhausted(1_000));
        let p = ReconnectPolicy {
            max_attempts: 3,
            ..p
        };
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }

    #[test]
    fn relay_urls_must_be_websocket() {
        assert!(parse_relay_url("wss://relay.example.com").is_ok());
        assert!(parse_relay_url("ws://127.0.0.1:7777").is_ok());
        assert!(matches!(
            parse_relay_url("https://relay.example.com"),
            Err(ConnectionError::InvalidUrl(_))
        ));
        assert!(parse_relay_url("not a url").is_err());
    }

    #[tokio::test]
    async fn replays_subscriptions_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let subs = Subscriptions::new();
        let stream = subs.register(vec![Filter::new().kinds([1])], 4);
        let sub_id = stream.id().to_string();

        let server = tokio::spawn(async move {
            let mut reqs = vec![];
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                if let Some(Ok(Message::Text(txt))) = ws.next().await {
                    reqs.push(txt);
                }
                // dropping the socket forces a reconnect
            }
            reqs
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut pool = RelayPool::connect(
            &[url.clone()],
            fast_options(),
            subs.clone(),
            tx,
            CancellationToken::new(),
        );
        let reqs = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(reqs.len(), 2);
        for req in reqs {
            assert!(req.starts_with("[\"REQ\""));
            assert!(req.contains(&sub_id));
        }

        let mut connected = 0;
        while let Ok(Some(item)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if matches!(item, Inbound::Connected { .. }) {
                connected += 1;
            }
        }
        assert!(connected >= 2);
        pool.shutdown().await;
        assert_eq!(pool.states()[&url], ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn forwards_frames_and_sends_through_single_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"["NOTICE","hello"]"#.into()))
                .await
                .unwrap();
            let got = ws.next().await;
            (got, ws)
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut pool = RelayPool::connect(
            &[url.clone()],
            fast_options(),
            Subscriptions::new(),
            tx,
            CancellationToken::new(),
        );
        let mut state = pool.watch_state(&url).unwrap();
        wait_for(&mut state, ConnectionState::Connected).await;
        assert!(pool.is_connected());

        let notice = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Inbound::Message { message, .. }) = rx.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(notice, RelayMessage::Notice("hello".into()));

        let close = ClientMessage::Close {
            subscription_id: "abc".into(),
        };
        assert_eq!(pool.send_all(&close).await, vec![url.clone()]);
        let (got, _ws) = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(matches!(got, Some(Ok(Message::Text(t))) if t == r#"["CLOSE","abc"]"#));
        pool.shutdown().await;
        assert_eq!(pool.states()[&url], ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_keeps_queued_events_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let event = crate::event::tests::signed(1, 1, None, 1, "queued");
        tx.try_send(ClientMessage::Req {
            subscription_id: "a".into(),
            filters: vec![],
        })
        .unwrap();
        tx.try_send(ClientMessage::Event(event.clone())).unwrap();
        tx.try_send(ClientMessage::Close {
            subscription_id: "a".into(),
        })
        .unwrap();
        assert_eq!(carry_over(&mut rx), vec![ClientMessage::Event(event)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaves_connected_state_when_the_socket_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (hang_up, hung_up) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            let _ = hung_up.await;
            drop(ws);
            listener
        });

        let mut options = fast_options();
        options.reconnect.initial = Duration::from_secs(5);
        options.reconnect.max = Duration::from_secs(5);
        let (tx, _rx) = mpsc::channel(16);
        let mut pool = RelayPool::connect(
            &[url.clone()],
            options,
            Subscriptions::new(),
            tx,
            CancellationToken::new(),
        );
        let mut state = pool.watch_state(&url).unwrap();
        wait_for(&mut state, ConnectionState::Connected).await;
        hang_up.send(()).unwrap();
        let _listener = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        wait_for(&mut state, ConnectionState::Backoff).await;
        assert!(pool.connected_urls().is_empty());
        let frame = ClientMessage::Close {
            subscription_id: "x".into(),
        };
        assert!(pool.send_all(&frame).await.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // bind then drop so the port refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut options = fast_options();
        options.reconnect.max_attempts = 2;
        let (tx, _rx) = mpsc::channel(16);
        let mut pool = RelayPool::connect(
            &[url.clone(), "http://nope".into()],
            options,
            Subscriptions::new(),
            tx,
            CancellationToken::new(),
        );
        assert_eq!(pool.urls(), vec![url.clone()]);
        let mut state = pool.watch_state(&url).unwrap();
        wait_for(&mut state, ConnectionState::Disconnected).await;
        assert!(!pool.is_connected());
        pool.shutdown().await;
    }
}
