// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport.
//!
//! A [`MemoryBroker`] stands in for one cluster of either kind. Tests (and
//! demos) use it to run real connectors without Redis, and to inject faults
//! a real cluster only produces under duress:
//!
//! - [`set_online(false)`](MemoryBroker::set_online) kills every open
//!   connection and refuses dials until it is brought back
//! - [`drop_connections()`](MemoryBroker::drop_connections) kills open
//!   connections but accepts the redial
//! - [`reject_next_publishes(n)`](MemoryBroker::reject_next_publishes)
//!   makes the next `n` publishes fail while connected
//! - [`set_publish_delay(d)`](MemoryBroker::set_publish_delay) slows
//!   publish acknowledgments
//! - [`deny_subject(s)`](MemoryBroker::deny_subject) refuses subscriptions
//!
//! Durable brokers keep a log with consumer groups (pending entries are
//! redelivered to the next subscription of the group). Pub/sub brokers fan
//! out to live subscribers only and drop headers, like Redis Pub/Sub; the
//! origin path rides in the payload envelope (see [`wrap_origin`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use message_replicator::transport::memory::{MemoryBroker, MemoryDialer};
//! use message_replicator::config::EndpointKind;
//!
//! let a = MemoryBroker::new("a", EndpointKind::CorePubSub);
//! let dialer = MemoryDialer::new().with_broker("memory://a", a.clone());
//! a.publish("orders", b"hello".to_vec());
//! ```

use super::{
    unwrap_origin, wrap_origin, AckToken, BoxFuture, Delivery, Dialer, Message, SubscribeRequest, Subscription,
    Transport,
};
use crate::config::{EndpointConfig, EndpointKind, StartPosition};
use crate::error::{ReplicatorError, Result};
use crate::pool::epoch_millis;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

struct Entry {
    id: u64,
    at_ms: u64,
    message: Message,
}

#[derive(Default)]
struct Group {
    /// Index into the log of the next never-delivered entry.
    next: usize,
    /// Delivered but not acknowledged.
    pending: BTreeSet<u64>,
    acked: u64,
}

#[derive(Default)]
struct Topic {
    log: Vec<Entry>,
    live: Vec<mpsc::UnboundedSender<Message>>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    reject_publishes: usize,
    publish_delay: Duration,
    denied: HashSet<String>,
}

struct BrokerInner {
    name: String,
    kind: EndpointKind,
    online: AtomicBool,
    /// Bumped whenever open connections are killed.
    epoch: watch::Sender<u64>,
    dials: AtomicU64,
    appended: Notify,
    state: Mutex<BrokerState>,
}

impl BrokerInner {
    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn check_alive(&self, epoch: u64) -> Result<()> {
        if self.online.load(Ordering::Acquire) && self.current_epoch() == epoch {
            Ok(())
        } else {
            Err(ReplicatorError::connection(&self.name, "connection lost"))
        }
    }

    fn append(&self, message: Message) -> u64 {
        let id = {
            let mut state = self.state.lock();
            let topic = state.topics.entry(message.subject.clone()).or_default();
            let id = topic.log.len() as u64 + 1;
            if self.kind == EndpointKind::CorePubSub {
                topic.live.retain(|tx| tx.send(message.clone()).is_ok());
            }
            topic.log.push(Entry {
                id,
                at_ms: epoch_millis(),
                message,
            });
            id
        };
        self.appended.notify_waiters();
        id
    }
}

/// A simulated cluster.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an online broker.
    pub fn new(name: &str, kind: EndpointKind) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                name: name.to_string(),
                kind,
                online: AtomicBool::new(true),
                epoch,
                dials: AtomicU64::new(0),
                appended: Notify::new(),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.inner.kind
    }

    // ─────────────────────────────────────────────────────────────────────
    // Producer side (bypasses connections, like a client of the cluster)
    // ─────────────────────────────────────────────────────────────────────

    /// Publish as an outside producer. Returns the entry id.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> u64 {
        self.publish_message(Message::new(subject, payload))
    }

    pub fn publish_message(&self, mut message: Message) -> u64 {
        if self.inner.kind == EndpointKind::CorePubSub {
            message.headers.clear();
        }
        self.inner.append(message)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    /// Everything ever published on `subject`, in order, as a subscriber
    /// would receive it.
    pub fn messages(&self, subject: &str) -> Vec<Message> {
        let pubsub = self.inner.kind == EndpointKind::CorePubSub;
        let state = self.inner.state.lock();
        state
            .topics
            .get(subject)
            .map(|t| {
                t.log
                    .iter()
                    .map(|e| {
                        if pubsub {
                            unwrap_origin(e.message.subject.clone(), e.message.payload.clone())
                        } else {
                            e.message.clone()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payload bytes exactly as stored, envelope included.
    pub fn raw_payloads(&self, subject: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(subject)
            .map(|t| t.log.iter().map(|e| e.message.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn payloads(&self, subject: &str) -> Vec<Vec<u8>> {
        self.messages(subject).into_iter().map(|m| m.payload).collect()
    }

    /// Entries delivered to `group` and not yet acknowledged.
    pub fn pending_count(&self, subject: &str, group: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .topics
            .get(subject)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    pub fn acked_count(&self, subject: &str, group: &str) -> u64 {
        let state = self.inner.state.lock();
        state
            .topics
            .get(subject)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.acked)
            .unwrap_or(0)
    }

    /// Live pub/sub subscribers on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .topics
            .get(subject)
            .map(|t| t.live.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Successful dials so far.
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fault injection
    // ─────────────────────────────────────────────────────────────────────

    /// Going offline kills open connections and refuses dials.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was && !online {
            self.kill_connections();
        }
        debug!(broker = %self.inner.name, online, "Memory broker availability changed");
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Kill open connections; new dials still succeed.
    pub fn drop_connections(&self) {
        self.kill_connections();
    }

    fn kill_connections(&self) {
        self.inner.epoch.send_modify(|e| *e += 1);
        let mut state = self.inner.state.lock();
        for topic in state.topics.values_mut() {
            topic.live.clear();
        }
    }

    /// Fail the next `n` publishes with a rejection.
    pub fn reject_next_publishes(&self, n: usize) {
        self.inner.state.lock().reject_publishes = n;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.inner.state.lock().publish_delay = delay;
    }

    pub fn deny_subject(&self, subject: &str) {
        self.inner.state.lock().denied.insert(subject.to_string());
    }

    fn connect(&self) -> Result<MemoryTransport> {
        if !self.is_online() {
            return Err(ReplicatorError::connection(&self.inner.name, "connection refused"));
        }
        self.inner.dials.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryTransport {
            epoch: self.inner.current_epoch(),
            inner: Arc::clone(&self.inner),
        })
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("online", &self.is_online())
            .finish()
    }
}

/// A connection to a [`MemoryBroker`], valid until the broker kills it.
pub struct MemoryTransport {
    inner: Arc<BrokerInner>,
    epoch: u64,
}

impl MemoryTransport {
    fn start_index(topic: &Topic, start: &StartPosition) -> usize {
        match start {
            StartPosition::NewOnly => topic.log.len(),
            StartPosition::DeliverAll => 0,
            StartPosition::Sequence(id) => {
                let after = id.split('-').next().and_then(|n| n.parse::<usize>().ok()).unwrap_or(0);
                after.min(topic.log.len())
            }
            StartPosition::Time(ms) => topic
                .log
                .iter()
                .position(|e| e.at_ms >= *ms)
                .unwrap_or(topic.log.len()),
        }
    }

    fn subscribe_live(&self, request: &SubscribeRequest) -> Subscription {
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        self.inner
            .state
            .lock()
            .topics
            .entry(request.subject.clone())
            .or_default()
            .live
            .push(live_tx);

        let (tx, rx) = mpsc::channel(request.capacity.max(1));
        let mut epoch_rx = self.inner.epoch.subscribe();
        let epoch = self.epoch;

        let reader = tokio::spawn(async move {
            if *epoch_rx.borrow_and_update() != epoch {
                return;
            }
            loop {
                tokio::select! {
                    changed = epoch_rx.changed() => {
                        if changed.is_err() || *epoch_rx.borrow() != epoch {
                            break;
                        }
                    }
                    message = live_rx.recv() => match message {
                        Some(Message { subject, payload, .. }) => {
                            let message = unwrap_origin(subject, payload);
                            if tx.send(Delivery { message, ack: None }).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Subscription::new(rx, reader)
    }

    fn subscribe_durable(&self, request: &SubscribeRequest) -> Subscription {
        let redeliver: Vec<u64> = {
            let mut state = self.inner.state.lock();
            let topic = state.topics.entry(request.subject.clone()).or_default();
            if !topic.groups.contains_key(&request.group) {
                let next = Self::start_index(topic, &request.start);
                topic.groups.insert(
                    request.group.clone(),
                    Group {
                        next,
                        ..Default::default()
                    },
                );
            }
            topic
                .groups
                .get(&request.group)
                .map(|g| g.pending.iter().copied().collect())
                .unwrap_or_default()
        };

        let (tx, rx) = mpsc::channel(request.capacity.max(1));
        let inner = Arc::clone(&self.inner);
        let epoch = self.epoch;
        let subject = request.subject.clone();
        let group = request.group.clone();

        let reader = tokio::spawn(async move {
            let mut epoch_rx = inner.epoch.subscribe();
            let mut redeliver = redeliver.into_iter();

            loop {
                let appended = inner.appended.notified();
                tokio::pin!(appended);

                if inner.check_alive(epoch).is_err() {
                    break;
                }

                let next = redeliver
                    .by_ref()
                    .find_map(|id| Self::pending_entry(&inner, &subject, &group, id))
                    .or_else(|| Self::take_next(&inner, &subject, &group));

                match next {
                    Some((id, message)) => {
                        let delivery = Delivery {
                            message,
                            ack: Some(AckToken {
                                subject: subject.clone(),
                                group: group.clone(),
                                id: id.to_string(),
                            }),
                        };
                        tokio::select! {
                            sent = tx.send(delivery) => if sent.is_err() { break },
                            _ = epoch_rx.changed() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = &mut appended => {}
                            _ = epoch_rx.changed() => {}
                        }
                    }
                }
            }
        });

        Subscription::new(rx, reader)
    }

    /// A replayed entry, unless it was acknowledged since the replay began.
    fn pending_entry(inner: &BrokerInner, subject: &str, group: &str, id: u64) -> Option<(u64, Message)> {
        let state = inner.state.lock();
        let topic = state.topics.get(subject)?;
        if !topic.groups.get(group)?.pending.contains(&id) {
            return None;
        }
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        topic.log.get(index).map(|e| (e.id, e.message.clone()))
    }

    fn take_next(inner: &BrokerInner, subject: &str, group: &str) -> Option<(u64, Message)> {
        let mut state = inner.state.lock();
        let topic = state.topics.get_mut(subject)?;
        let Topic { log, groups, .. } = topic;
        let group = groups.get_mut(group)?;
        let entry = log.get(group.next)?;
        group.next += 1;
        group.pending.insert(entry.id);
        Some((entry.id, entry.message.clone()))
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> EndpointKind {
        self.inner.kind
    }

    fn supports_headers(&self) -> bool {
        self.inner.kind == EndpointKind::DurableStream
    }

    fn publish<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.check_alive(self.epoch)?;

            let delay = self.inner.state.lock().publish_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                self.inner.check_alive(self.epoch)?;
            }

            {
                let mut state = self.inner.state.lock();
                if state.reject_publishes > 0 {
                    state.reject_publishes -= 1;
                    return Err(ReplicatorError::Publish {
                        subject: message.subject.clone(),
                        message: "rejected by broker".to_string(),
                    });
                }
            }

            let mut message = message.clone();
            if !self.supports_headers() {
                message.payload = wrap_origin(&message);
                message.headers.clear();
            }
            self.inner.append(message);
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, request: &'a SubscribeRequest) -> BoxFuture<'a, Subscription> {
        Box::pin(async move {
            self.inner.check_alive(self.epoch)?;
            if self.inner.state.lock().denied.contains(&request.subject) {
                return Err(ReplicatorError::Subscribe {
                    subject: request.subject.clone(),
                    message: "permission denied".to_string(),
                });
            }

            Ok(match self.inner.kind {
                EndpointKind::CorePubSub => self.subscribe_live(request),
                EndpointKind::DurableStream => self.subscribe_durable(request),
            })
        })
    }

    fn ack<'a>(&'a self, token: &'a AckToken) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.check_alive(self.epoch)?;
            let id: u64 = token
                .id
                .parse()
                .map_err(|_| ReplicatorError::Internal(format!("bad ack id '{}'", token.id)))?;

            let mut state = self.inner.state.lock();
            if let Some(group) = state
                .topics
                .get_mut(&token.subject)
                .and_then(|t| t.groups.get_mut(&token.group))
            {
                if group.pending.remove(&id) {
                    group.acked += 1;
                }
            }
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.inner.check_alive(self.epoch) })
    }
}

/// Maps server addresses to [`MemoryBroker`]s.
#[derive(Clone, Default)]
pub struct MemoryDialer {
    brokers: Arc<RwLock<HashMap<String, MemoryBroker>>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route dials for `server` to `broker`.
    pub fn with_broker(self, server: &str, broker: MemoryBroker) -> Self {
        self.register(server, broker);
        self
    }

    pub fn register(&self, server: &str, broker: MemoryBroker) {
        self.brokers.write().insert(server.to_string(), broker);
    }
}

impl Dialer for MemoryDialer {
    fn dial<'a>(&'a self, endpoint: &'a EndpointConfig, server: &'a str) -> BoxFuture<'a, Arc<dyn Transport>> {
        Box::pin(async move {
            let broker = self
                .brokers
                .read()
                .get(server)
                .cloned()
                .ok_or_else(|| ReplicatorError::connection(&endpoint.name, format!("no route to {}", server)))?;

            if broker.kind() != endpoint.kind {
                return Err(ReplicatorError::Config(format!(
                    "endpoint '{}' is {} but {} is {}",
                    endpoint.name,
                    endpoint.kind,
                    server,
                    broker.kind()
                )));
            }

            let transport: Arc<dyn Transport> = Arc::new(broker.connect()?);
            Ok(transport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subject: &str, start: StartPosition) -> SubscribeRequest {
        SubscribeRequest {
            subject: subject.to_string(),
            group: "g".to_string(),
            consumer: "c".to_string(),
            start,
            capacity: 16,
        }
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery timed out")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_pubsub_delivers_to_live_subscribers_only() {
        let broker = MemoryBroker::new("a", EndpointKind::CorePubSub);
        broker.publish("x", b"before".to_vec());

        let transport = broker.connect().unwrap();
        let mut sub = transport.subscribe(&request("x", StartPosition::NewOnly)).await.unwrap();
        broker.publish("x", b"after".to_vec());

        let delivery = next(&mut sub).await;
        assert_eq!(delivery.message.payload, b"after");
        assert!(delivery.ack.is_none());
    }

    #[tokio::test]
    async fn test_pubsub_strips_headers() {
        let broker = MemoryBroker::new("a", EndpointKind::CorePubSub);
        let transport = broker.connect().unwrap();
        let message = Message::new("x", b"m".to_vec()).with_header("k", "v");
        transport.publish(&message).await.unwrap();
        assert!(broker.messages("x")[0].headers.is_empty());
        assert_eq!(broker.raw_payloads("x"), vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn test_pubsub_carries_origin_in_envelope() {
        let broker = MemoryBroker::new("a", EndpointKind::CorePubSub);
        let transport = broker.connect().unwrap();
        let mut sub = transport.subscribe(&request("x", StartPosition::NewOnly)).await.unwrap();

        let message = Message::new("x", b"m".to_vec()).with_header("k", "v").forwarded("x", "ab");
        transport.publish(&message).await.unwrap();

        let delivery = next(&mut sub).await;
        assert_eq!(delivery.message.payload, b"m");
        assert!(delivery.message.was_forwarded_by("ab"));
        assert!(!delivery.message.headers.contains_key("k"));

        assert_ne!(broker.raw_payloads("x")[0], b"m".to_vec());
        assert_eq!(broker.payloads("x"), vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn test_durable_deliver_all_and_ack() {
        let broker = MemoryBroker::new("b", EndpointKind::DurableStream);
        broker.publish("x", b"1".to_vec());
        broker.publish("x", b"2".to_vec());

        let transport = broker.connect().unwrap();
        let mut sub = transport.subscribe(&request("x", StartPosition::DeliverAll)).await.unwrap();

        let first = next(&mut sub).await;
        let second = next(&mut sub).await;
        assert_eq!(first.message.payload, b"1");
        assert_eq!(second.message.payload, b"2");
        assert_eq!(broker.pending_count("x", "g"), 2);

        transport.ack(first.ack.as_ref().unwrap()).await.unwrap();
        assert_eq!(broker.pending_count("x", "g"), 1);
        assert_eq!(broker.acked_count("x", "g"), 1);
    }

    #[tokio::test]
    async fn test_durable_redelivers_pending_to_next_subscription() {
        let broker = MemoryBroker::new("b", EndpointKind::DurableStream);
        broker.publish("x", b"1".to_vec());

        let transport = broker.connect().unwrap();
        let mut sub = transport.subscribe(&request("x", StartPosition::DeliverAll)).await.unwrap();
        let _unacked = next(&mut sub).await;
        drop(sub);

        let mut again = transport.subscribe(&request("x", StartPosition::DeliverAll)).await.unwrap();
        assert_eq!(next(&mut again).await.message.payload, b"1");
    }

    #[tokio::test]
    async fn test_durable_sequence_start() {
        let broker = MemoryBroker::new("b", EndpointKind::DurableStream);
        for n in 1..=3u8 {
            broker.publish("x", vec![n]);
        }
        let transport = broker.connect().unwrap();
        let mut sub = transport
            .subscribe(&request("x", StartPosition::Sequence("2".to_string())))
            .await
            .unwrap();
        assert_eq!(next(&mut sub).await.message.payload, vec![3]);
    }

    #[tokio::test]
    async fn test_offline_kills_connection_and_subscription() {
        let broker = MemoryBroker::new("a", EndpointKind::CorePubSub);
        let transport = broker.connect().unwrap();
        let mut sub = transport.subscribe(&request("x", StartPosition::NewOnly)).await.unwrap();

        broker.set_online(false);

        let ended = tokio::time::timeout(Duration::from_secs(1), sub.next()).await.unwrap();
        assert!(ended.is_none());
        assert!(transport.ping().await.is_err());
        assert!(transport.publish(&Message::new("x", Vec::new())).await.unwrap_err().is_connection_error());
        assert!(broker.connect().is_err());

        broker.set_online(true);
        // Old connection stays dead, a new dial works
        assert!(transport.ping().await.is_err());
        assert!(broker.connect().is_ok());
    }

    #[tokio::test]
    async fn test_reject_next_publishes() {
        let broker = MemoryBroker::new("b", EndpointKind::DurableStream);
        let transport = broker.connect().unwrap();
        broker.reject_next_publishes(1);

        let message = Message::new("x", b"m".to_vec());
        let err = transport.publish(&message).await.unwrap_err();
        assert!(matches!(err, ReplicatorError::Publish { .. }));
        assert!(!err.is_connection_error());
        transport.publish(&message).await.unwrap();
        assert_eq!(broker.messages("x").len(), 1);
    }

    #[tokio::test]
    async fn test_denied_subject() {
        let broker = MemoryBroker::new("b", EndpointKind::DurableStream);
        broker.deny_subject("secret");
        let transport = broker.connect().unwrap();
        let err = transport.subscribe(&request("secret", StartPosition::NewOnly)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_dialer_routes_and_checks_kind() {
        let broker = MemoryBroker::new("a", EndpointKind::CorePubSub);
        let dialer = MemoryDialer::new().with_broker("memory://a", broker.clone());

        let endpoint = EndpointConfig::for_testing("a", EndpointKind::CorePubSub, "memory://a");
        assert!(dialer.dial(&endpoint, "memory://a").await.is_ok());
        assert_eq!(broker.dial_count(), 1);

        assert!(dialer.dial(&endpoint, "memory://missing").await.is_err());

        let wrong = EndpointConfig::for_testing("a", EndpointKind::DurableStream, "memory://a");
        let err = dialer.dial(&wrong, "memory://a").await.err().unwrap();
        assert!(err.is_config_error());
    }
}
