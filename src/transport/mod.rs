// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport capability interface.
//!
//! An endpoint speaks one of two messaging models ([`EndpointKind`]):
//!
//! | Kind | Backing | Ack | Headers | Flow control |
//! |------|---------|-----|---------|--------------|
//! | `CorePubSub` | Redis Pub/Sub | No | Origin only, in-band | No |
//! | `DurableStream` | Redis Streams + consumer groups | `XACK` | Yes | Yes |
//!
//! The [`Transport`] trait is what connectors see. A [`Dialer`] builds a
//! transport for one server of an endpoint; the pool owns dialing and
//! redialing. [`memory`] holds an in-process implementation for tests.
//!
//! # Origin Envelope
//!
//! Core pub/sub has no headers, but echo suppression needs the origin path
//! to survive a hop. Transports without headers frame forwarded payloads
//! with [`wrap_origin`] and open them with [`unwrap_origin`]:
//!
//! ```text
//! +----------+----------------+-------------+---------+
//! | "\0RPL"  | origin len u32 | origin path | payload |
//! +----------+----------------+-------------+---------+
//! ```
//!
//! A message with no origin path goes out as the bare payload, so traffic
//! from outside producers is never touched. Anything that does not parse as
//! an envelope is delivered as-is.
//!
//! # Implementing a Transport
//!
//! ```rust,no_run
//! use message_replicator::transport::{AckToken, BoxFuture, Message, SubscribeRequest, Subscription, Transport};
//! use message_replicator::config::EndpointKind;
//!
//! struct Null;
//!
//! impl Transport for Null {
//!     fn kind(&self) -> EndpointKind { EndpointKind::CorePubSub }
//!     fn supports_headers(&self) -> bool { false }
//!     fn publish<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, ()> { Box::pin(async { Ok(()) }) }
//!     fn subscribe<'a>(&'a self, _request: &'a SubscribeRequest) -> BoxFuture<'a, Subscription> {
//!         Box::pin(async { Ok(Subscription::closed()) })
//!     }
//!     fn ack<'a>(&'a self, _token: &'a AckToken) -> BoxFuture<'a, ()> { Box::pin(async { Ok(()) }) }
//!     fn ping(&self) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//! }
//! ```

pub mod memory;
pub mod redis;

pub use crate::config::{EndpointKind, StartPosition};

use crate::config::EndpointConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Header carrying the names of connectors that already forwarded a message.
pub const ORIGIN_HEADER: &str = "Replicator-Origin";

/// A message in flight between endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Connectors that already forwarded this message, oldest first.
    pub fn origin_path(&self) -> Vec<&str> {
        self.headers
            .get(ORIGIN_HEADER)
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Whether `connector` appears in the origin path.
    pub fn was_forwarded_by(&self, connector: &str) -> bool {
        self.origin_path().iter().any(|name| *name == connector)
    }

    /// Copy for republishing on `subject` with `connector` appended to the origin path.
    pub fn forwarded(&self, subject: &str, connector: &str) -> Message {
        let mut headers = self.headers.clone();
        let path = match headers.get(ORIGIN_HEADER) {
            Some(existing) if !existing.trim().is_empty() => format!("{},{}", existing, connector),
            _ => connector.to_string(),
        };
        headers.insert(ORIGIN_HEADER.to_string(), path);
        Message {
            subject: subject.to_string(),
            payload: self.payload.clone(),
            headers,
        }
    }
}

/// Handle for acknowledging one durable delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    /// Stream key the entry was read from.
    pub subject: String,
    pub group: String,
    /// Stream entry id.
    pub id: String,
}

/// One message handed to a connector by a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Present when the source requires an explicit ack.
    pub ack: Option<AckToken>,
}

/// What to subscribe to, and how.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subject: String,
    /// Consumer group on durable streams. Ignored by pub/sub.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
    pub start: StartPosition,
    /// Bound on deliveries buffered between the reader and the connector.
    pub capacity: usize,
}

/// A live subscription.
///
/// Deliveries arrive in source order. `next()` returning `None` means the
/// underlying connection was lost; the subscriber decides whether to
/// resubscribe. Dropping the subscription stops its reader task.
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
    reader: Option<JoinHandle<()>>,
    counter: Option<Arc<AtomicUsize>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Delivery>, reader: JoinHandle<()>) -> Self {
        Self {
            rx,
            reader: Some(reader),
            counter: None,
        }
    }

    /// A subscription that has already ended.
    pub fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self {
            rx,
            reader: None,
            counter: None,
        }
    }

    /// Count this subscription in `counter` until it is dropped.
    pub(crate) fn tracked(mut self, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        self.counter = Some(counter);
        self
    }

    /// Next delivery, or `None` once the source connection is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// A delivery that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(counter) = self.counter.take() {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.reader.as_ref().map(|r| !r.is_finished()))
            .finish()
    }
}

/// One live connection to an endpoint.
///
/// Implementations must be cheap to share (`Arc<dyn Transport>`). Errors
/// that mean the connection itself is broken should be reported as
/// connection-class errors (see
/// [`ReplicatorError::is_connection_error`](crate::error::ReplicatorError::is_connection_error))
/// so the pool re-checks it.
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> EndpointKind;

    /// Whether published headers reach subscribers.
    fn supports_headers(&self) -> bool;

    /// Publish and wait for the endpoint to accept the message.
    fn publish<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()>;

    /// Start delivering messages for `request.subject`.
    fn subscribe<'a>(&'a self, request: &'a SubscribeRequest) -> BoxFuture<'a, Subscription>;

    /// Acknowledge a delivery. No-op for kinds without acks.
    fn ack<'a>(&'a self, token: &'a AckToken) -> BoxFuture<'a, ()>;

    /// Cheap liveness probe.
    fn ping(&self) -> BoxFuture<'_, ()>;

    /// Release the connection.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Builds transports for the endpoint pool.
pub trait Dialer: Send + Sync + 'static {
    /// Connect to one server of `endpoint`.
    fn dial<'a>(&'a self, endpoint: &'a EndpointConfig, server: &'a str) -> BoxFuture<'a, Arc<dyn Transport>>;
}

const ENVELOPE_MAGIC: &[u8] = b"\0RPL";

/// Payload bytes for a transport without headers, origin path in front.
pub fn wrap_origin(message: &Message) -> Vec<u8> {
    let Some(origin) = message.headers.get(ORIGIN_HEADER).filter(|o| !o.trim().is_empty()) else {
        return message.payload.clone();
    };
    let Ok(len) = u32::try_from(origin.len()) else {
        return message.payload.clone();
    };

    let mut framed = Vec::with_capacity(ENVELOPE_MAGIC.len() + 4 + origin.len() + message.payload.len());
    framed.extend_from_slice(ENVELOPE_MAGIC);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(origin.as_bytes());
    framed.extend_from_slice(&message.payload);
    framed
}

/// Rebuild a message from payload bytes that may carry an origin envelope.
pub fn unwrap_origin(subject: impl Into<String>, bytes: Vec<u8>) -> Message {
    match split_envelope(&bytes) {
        Some((origin, payload)) => Message::new(subject, payload.to_vec()).with_header(ORIGIN_HEADER, origin),
        None => Message::new(subject, bytes),
    }
}

fn split_envelope(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let rest = bytes.strip_prefix(ENVELOPE_MAGIC)?;
    let len: [u8; 4] = rest.get(..4)?.try_into().ok()?;
    let len = usize::try_from(u32::from_be_bytes(len)).ok()?;
    let rest = &rest[4..];
    if rest.len() < len {
        return None;
    }
    let (origin, payload) = rest.split_at(len);
    Some((std::str::from_utf8(origin).ok()?, payload))
}

/// True if a pub/sub subject needs a pattern subscription.
pub fn is_pattern(subject: &str) -> bool {
    subject.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_path_empty() {
        let message = Message::new("orders", b"hi".to_vec());
        assert!(message.origin_path().is_empty());
        assert!(!message.was_forwarded_by("one"));
    }

    #[test]
    fn test_forwarded_appends_connector() {
        let message = Message::new("orders", b"hi".to_vec());
        let once = message.forwarded("orders-copy", "one");
        assert_eq!(once.subject, "orders-copy");
        assert_eq!(once.payload, b"hi");
        assert_eq!(once.origin_path(), vec!["one"]);

        let twice = once.forwarded("orders", "two");
        assert_eq!(twice.origin_path(), vec!["one", "two"]);
        assert!(twice.was_forwarded_by("one"));
        assert!(twice.was_forwarded_by("two"));
        assert!(!twice.was_forwarded_by("three"));
    }

    #[test]
    fn test_forwarded_keeps_other_headers() {
        let message = Message::new("orders", Vec::new()).with_header("trace-id", "abc");
        let copy = message.forwarded("orders", "one");
        assert_eq!(copy.headers.get("trace-id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_was_forwarded_by_exact_match() {
        let message = Message::new("x", Vec::new()).with_header(ORIGIN_HEADER, "one-a, two");
        assert!(!message.was_forwarded_by("one"));
        assert!(message.was_forwarded_by("one-a"));
        assert!(message.was_forwarded_by("two"));
    }

    #[test]
    fn test_envelope_carries_origin_and_payload() {
        let message = Message::new("x", b"body".to_vec()).forwarded("x", "ab").forwarded("x", "cd");
        let wire = wrap_origin(&message);
        assert_ne!(wire, message.payload);

        let opened = unwrap_origin("x", wire);
        assert_eq!(opened.payload, b"body");
        assert_eq!(opened.origin_path(), vec!["ab", "cd"]);
        assert_eq!(opened.headers.len(), 1);
    }

    #[test]
    fn test_envelope_skipped_without_origin() {
        let message = Message::new("x", b"plain".to_vec()).with_header("trace-id", "abc");
        assert_eq!(wrap_origin(&message), b"plain");
        assert_eq!(unwrap_origin("x", b"plain".to_vec()), Message::new("x", b"plain".to_vec()));
    }

    #[test]
    fn test_truncated_envelope_delivered_as_is() {
        let mut wire = wrap_origin(&Message::new("x", b"p".to_vec()).forwarded("x", "connector"));
        wire.truncate(8);
        let opened = unwrap_origin("x", wire.clone());
        assert_eq!(opened.payload, wire);
        assert!(opened.origin_path().is_empty());

        let short = unwrap_origin("x", b"\0RP".to_vec());
        assert_eq!(short.payload, b"\0RP");
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("orders.*"));
        assert!(is_pattern("orders.?"));
        assert!(is_pattern("orders.[ab]"));
        assert!(!is_pattern("orders.eu"));
    }

    #[tokio::test]
    async fn test_closed_subscription_ends() {
        let mut sub = Subscription::closed();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tracked_subscription_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::closed().tracked(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(sub);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
