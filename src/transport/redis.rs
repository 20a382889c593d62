// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed transports.
//!
//! | Kind | Publish | Subscribe | Ack |
//! |------|---------|-----------|-----|
//! | `CorePubSub` | `PUBLISH` | `SUBSCRIBE` / `PSUBSCRIBE` | none |
//! | `DurableStream` | `XADD` | `XGROUP CREATE` + `XREADGROUP` | `XACK` |
//!
//! # Stream Entry Layout
//!
//! ```text
//! XADD <subject> * data <payload> h:<header> <value> ...
//! ```
//!
//! Pub/Sub has nowhere to put headers, so messages crossing a `CorePubSub`
//! endpoint lose them. The origin path used for echo suppression survives
//! inside the payload envelope (see [`wrap_origin`]).
//!
//! # Consumer Groups
//!
//! Each durable subscription reads through a consumer group on a dedicated
//! connection (a blocking `XREADGROUP` would stall a shared multiplexed
//! one). On (re)subscribe the reader first drains the consumer's pending
//! entries, then switches to `>` for new ones, so anything delivered but
//! not acknowledged before a disconnect is delivered again.

use super::{
    is_pattern, unwrap_origin, wrap_origin, AckToken, BoxFuture, Delivery, Dialer, Message, SubscribeRequest,
    Subscription, Transport,
};
use crate::config::{EndpointConfig, EndpointKind, StartPosition};
use crate::error::{ReplicatorError, Result};
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Stream field holding the payload.
const DATA_FIELD: &str = "data";

/// Prefix for stream fields holding headers.
const HEADER_PREFIX: &str = "h:";

/// Dials Redis servers for both endpoint kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisDialer;

impl RedisDialer {
    pub fn new() -> Self {
        Self
    }
}

impl Dialer for RedisDialer {
    fn dial<'a>(&'a self, endpoint: &'a EndpointConfig, server: &'a str) -> BoxFuture<'a, Arc<dyn Transport>> {
        Box::pin(async move {
            let info = connection_info(endpoint, server)?;
            let client = Client::open(info).map_err(|e| ReplicatorError::Connection {
                endpoint: endpoint.name.clone(),
                message: format!("Invalid Redis URL '{}': {}", server, e),
            })?;

            let mut conn = client
                .get_connection_manager()
                .await
                .map_err(|e| ReplicatorError::redis("CONNECT", e))?;

            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicatorError::redis("PING", e))?;

            if let Some(client_id) = &endpoint.client_id {
                let name: String = client_id.chars().filter(|c| !c.is_whitespace()).collect();
                let named: redis::RedisResult<()> = redis::cmd("CLIENT").arg("SETNAME").arg(&name).query_async(&mut conn).await;
                if let Err(e) = named {
                    debug!(endpoint = %endpoint.name, error = %e, "CLIENT SETNAME rejected");
                }
            }

            let transport: Arc<dyn Transport> = match endpoint.kind {
                EndpointKind::CorePubSub => Arc::new(RedisPubSubTransport {
                    endpoint: endpoint.name.clone(),
                    client,
                    conn,
                }),
                EndpointKind::DurableStream => Arc::new(RedisStreamTransport {
                    endpoint: endpoint.name.clone(),
                    client,
                    conn,
                    block_timeout: endpoint.block_timeout_duration(),
                    batch_size: endpoint.batch_size.max(1),
                }),
            };
            Ok(transport)
        })
    }
}

/// Build connection info for one server, applying endpoint credentials.
///
/// `credentials` is either `password` or `username:password`.
pub(crate) fn connection_info(endpoint: &EndpointConfig, server: &str) -> Result<ConnectionInfo> {
    let mut info = server.into_connection_info().map_err(|e| ReplicatorError::Connection {
        endpoint: endpoint.name.clone(),
        message: format!("Invalid Redis URL '{}': {}", server, e),
    })?;

    if let Some(credentials) = &endpoint.credentials {
        match credentials.split_once(':') {
            Some((user, password)) if !user.is_empty() => {
                info.redis.username = Some(user.to_string());
                info.redis.password = Some(password.to_string());
            }
            _ => info.redis.password = Some(credentials.trim_start_matches(':').to_string()),
        }
    }

    Ok(info)
}

async fn ping(conn: &ConnectionManager) -> Result<()> {
    let mut conn = conn.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| ReplicatorError::redis("PING", e))?;
    Ok(())
}

/// Map a refusal to subscribe. Connection trouble stays retryable.
fn subscribe_error(subject: &str, operation: &str, e: RedisError) -> ReplicatorError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        ReplicatorError::redis(operation, e)
    } else {
        ReplicatorError::Subscribe {
            subject: subject.to_string(),
            message: e.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pub/Sub
// ═══════════════════════════════════════════════════════════════════════════

/// Fire-and-forget transport over Redis Pub/Sub.
pub struct RedisPubSubTransport {
    endpoint: String,
    client: Client,
    conn: ConnectionManager,
}

impl Transport for RedisPubSubTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::CorePubSub
    }

    fn supports_headers(&self) -> bool {
        false
    }

    fn publish<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let receivers: i64 = conn
                .publish(&message.subject, wrap_origin(message))
                .await
                .map_err(|e| ReplicatorError::redis("PUBLISH", e))?;
            trace!(endpoint = %self.endpoint, subject = %message.subject, receivers, "Published");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, request: &'a SubscribeRequest) -> BoxFuture<'a, Subscription> {
        Box::pin(async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| ReplicatorError::redis("SUBSCRIBE", e))?;

            if is_pattern(&request.subject) {
                pubsub
                    .psubscribe(&request.subject)
                    .await
                    .map_err(|e| subscribe_error(&request.subject, "PSUBSCRIBE", e))?;
            } else {
                pubsub
                    .subscribe(&request.subject)
                    .await
                    .map_err(|e| subscribe_error(&request.subject, "SUBSCRIBE", e))?;
            }

            let (tx, rx) = mpsc::channel(request.capacity.max(1));
            let endpoint = self.endpoint.clone();
            let subject = request.subject.clone();

            let reader = tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let message = unwrap_origin(msg.get_channel_name(), msg.get_payload_bytes().to_vec());
                    if tx.send(Delivery { message, ack: None }).await.is_err() {
                        return;
                    }
                }
                debug!(endpoint = %endpoint, subject = %subject, "Pub/Sub connection closed");
            });

            Ok(Subscription::new(rx, reader))
        })
    }

    fn ack<'a>(&'a self, _token: &'a AckToken) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(ping(&self.conn))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Streams
// ═══════════════════════════════════════════════════════════════════════════

/// Durable transport over Redis Streams and consumer groups.
pub struct RedisStreamTransport {
    endpoint: String,
    client: Client,
    conn: ConnectionManager,
    block_timeout: Duration,
    batch_size: usize,
}

impl RedisStreamTransport {
    async fn ensure_group(&self, request: &SubscribeRequest) -> Result<()> {
        let mut conn = self.conn.clone();
        let start = group_start_id(&request.start);
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&request.subject, &request.group, &start)
            .await;

        match created {
            Ok(()) => {
                debug!(
                    endpoint = %self.endpoint,
                    subject = %request.subject,
                    group = %request.group,
                    start = %start,
                    "Created consumer group"
                );
                Ok(())
            }
            // Group survives restarts; its position wins over the configured start
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(subscribe_error(&request.subject, "XGROUP CREATE", e)),
        }
    }
}

impl Transport for RedisStreamTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::DurableStream
    }

    fn supports_headers(&self) -> bool {
        true
    }

    fn publish<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let fields = entry_fields(message);
            let id: String = conn
                .xadd(&message.subject, "*", &fields)
                .await
                .map_err(|e| ReplicatorError::redis("XADD", e))?;
            trace!(endpoint = %self.endpoint, subject = %message.subject, stream_id = %id, "Appended");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, request: &'a SubscribeRequest) -> BoxFuture<'a, Subscription> {
        Box::pin(async move {
            self.ensure_group(request).await?;

            let reader_conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| ReplicatorError::redis("CONNECT", e))?;

            let (tx, rx) = mpsc::channel(request.capacity.max(1));
            let reader = GroupReader {
                endpoint: self.endpoint.clone(),
                subject: request.subject.clone(),
                group: request.group.clone(),
                consumer: request.consumer.clone(),
                block_ms: self.block_timeout.as_millis() as usize,
                count: self.batch_size,
            };
            let handle = tokio::spawn(reader.run(reader_conn, tx));

            Ok(Subscription::new(rx, handle))
        })
    }

    fn ack<'a>(&'a self, token: &'a AckToken) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .xack(&token.subject, &token.group, &[&token.id])
                .await
                .map_err(|e| ReplicatorError::redis("XACK", e))?;
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(ping(&self.conn))
    }
}

/// Reads one consumer's view of a group into a subscription channel.
struct GroupReader {
    endpoint: String,
    subject: String,
    group: String,
    consumer: String,
    block_ms: usize,
    count: usize,
}

impl GroupReader {
    async fn run(self, mut conn: MultiplexedConnection, tx: mpsc::Sender<Delivery>) {
        // "0" replays this consumer's pending entries; ">" asks for new ones
        let mut cursor = "0".to_string();

        loop {
            let replaying = cursor != ">";
            let mut opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(self.count);
            if !replaying {
                opts = opts.block(self.block_ms);
            }

            let reply: StreamReadReply = match conn.xread_options(&[&self.subject], &[&cursor], &opts).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        subject = %self.subject,
                        error = %e,
                        "XREADGROUP failed, ending subscription"
                    );
                    return;
                }
            };

            let entries: Vec<_> = reply.keys.into_iter().flat_map(|key| key.ids).collect();

            if replaying {
                match entries.last() {
                    Some(last) => cursor = last.id.clone(),
                    None => {
                        cursor = ">".to_string();
                        continue;
                    }
                }
            }

            for entry in entries {
                let message = match parse_entry(&self.subject, &entry.map) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            endpoint = %self.endpoint,
                            stream_id = %entry.id,
                            error = %e,
                            "Malformed stream entry, acknowledging and skipping"
                        );
                        let _: redis::RedisResult<i64> = conn.xack(&self.subject, &self.group, &[&entry.id]).await;
                        continue;
                    }
                };

                let delivery = Delivery {
                    message,
                    ack: Some(AckToken {
                        subject: self.subject.clone(),
                        group: self.group.clone(),
                        id: entry.id,
                    }),
                };
                if tx.send(delivery).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Consumer group start id for a start position.
pub(crate) fn group_start_id(start: &StartPosition) -> String {
    match start {
        StartPosition::NewOnly => "$".to_string(),
        StartPosition::DeliverAll => "0".to_string(),
        StartPosition::Sequence(id) => id.clone(),
        // Last possible id before `ms`, so delivery starts at the first entry at or after it
        StartPosition::Time(0) => "0".to_string(),
        StartPosition::Time(ms) => format!("{}-{}", ms - 1, u64::MAX),
    }
}

/// Stream fields for a message: payload first, then headers.
pub(crate) fn entry_fields(message: &Message) -> Vec<(String, Vec<u8>)> {
    let mut fields = Vec::with_capacity(1 + message.headers.len());
    fields.push((DATA_FIELD.to_string(), message.payload.clone()));
    for (name, value) in &message.headers {
        fields.push((format!("{}{}", HEADER_PREFIX, name), value.as_bytes().to_vec()));
    }
    fields
}

/// Rebuild a message from stream fields.
pub(crate) fn parse_entry(subject: &str, fields: &HashMap<String, redis::Value>) -> Result<Message> {
    let mut message = Message::new(subject, get_bytes_field(fields, DATA_FIELD)?);
    for name in fields.keys() {
        if let Some(header) = name.strip_prefix(HEADER_PREFIX) {
            let value = get_bytes_field(fields, name)?;
            let value = String::from_utf8(value)
                .map_err(|e| ReplicatorError::Internal(format!("Invalid UTF-8 in header {}: {}", header, e)))?;
            message.headers.insert(header.to_string(), value);
        }
    }
    Ok(message)
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| ReplicatorError::Internal(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(ReplicatorError::Internal(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_start_id() {
        assert_eq!(group_start_id(&StartPosition::NewOnly), "$");
        assert_eq!(group_start_id(&StartPosition::DeliverAll), "0");
        assert_eq!(group_start_id(&StartPosition::Sequence("1700000000000-3".to_string())), "1700000000000-3");
        assert_eq!(group_start_id(&StartPosition::Time(0)), "0");
        assert_eq!(
            group_start_id(&StartPosition::Time(1_700_000_000_000)),
            format!("1699999999999-{}", u64::MAX)
        );
    }

    #[test]
    fn test_entry_fields_layout() {
        let message = Message::new("orders", b"payload".to_vec())
            .with_header("Replicator-Origin", "one")
            .with_header("trace", "abc");
        let fields = entry_fields(&message);

        assert_eq!(fields[0], ("data".to_string(), b"payload".to_vec()));
        assert!(fields.contains(&("h:Replicator-Origin".to_string(), b"one".to_vec())));
        assert!(fields.contains(&("h:trace".to_string(), b"abc".to_vec())));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_parse_entry() {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), redis::Value::BulkString(vec![1, 2, 3]));
        fields.insert("h:Replicator-Origin".to_string(), redis::Value::BulkString(b"one,two".to_vec()));
        fields.insert("other".to_string(), redis::Value::Int(7));

        let message = parse_entry("orders", &fields).unwrap();
        assert_eq!(message.subject, "orders");
        assert_eq!(message.payload, vec![1, 2, 3]);
        assert_eq!(message.origin_path(), vec!["one", "two"]);
        assert_eq!(message.headers.len(), 1);
    }

    #[test]
    fn test_parse_entry_missing_data() {
        let fields = HashMap::new();
        assert!(parse_entry("orders", &fields).is_err());
    }

    #[test]
    fn test_parse_entry_bad_header_utf8() {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), redis::Value::BulkString(Vec::new()));
        fields.insert("h:x".to_string(), redis::Value::BulkString(vec![0xFF, 0xFE]));
        assert!(parse_entry("orders", &fields).is_err());
    }

    #[test]
    fn test_get_bytes_field() {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), redis::Value::BulkString(vec![1, 2, 3, 4]));
        fields.insert("text".to_string(), redis::Value::SimpleString("hello".to_string()));
        fields.insert("num".to_string(), redis::Value::Int(42));

        assert_eq!(get_bytes_field(&fields, "data").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(get_bytes_field(&fields, "text").unwrap(), b"hello".to_vec());
        assert!(get_bytes_field(&fields, "num").is_err());
        assert!(get_bytes_field(&fields, "missing").is_err());
    }

    #[test]
    fn test_connection_info_password_only() {
        let mut endpoint = EndpointConfig::for_testing("a", EndpointKind::DurableStream, "redis://localhost:6379");
        endpoint.credentials = Some("secret".to_string());
        let info = connection_info(&endpoint, "redis://localhost:6379").unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
        assert!(info.redis.username.is_none());
    }

    #[test]
    fn test_connection_info_user_and_password() {
        let mut endpoint = EndpointConfig::for_testing("a", EndpointKind::DurableStream, "redis://localhost:6379");
        endpoint.credentials = Some("replicator:secret".to_string());
        let info = connection_info(&endpoint, "redis://localhost:6379").unwrap();
        assert_eq!(info.redis.username.as_deref(), Some("replicator"));
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_connection_info_invalid_url() {
        let endpoint = EndpointConfig::for_testing("a", EndpointKind::DurableStream, "not a url");
        let err = connection_info(&endpoint, "not a url").unwrap_err();
        assert!(err.is_connection_error());
    }
}
