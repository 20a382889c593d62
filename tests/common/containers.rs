// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container acting as one cluster, plus producer/inspection helpers.
pub struct TestCluster<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestCluster<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self { container, redis_url }
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append an entry the way an outside producer would.
    pub async fn xadd(&self, stream: &str, payload: &[u8], headers: &[(&str, &str)]) -> redis::RedisResult<String> {
        let mut conn = self.connection().await?;
        let mut fields: Vec<(String, Vec<u8>)> = vec![("data".to_string(), payload.to_vec())];
        for (name, value) in headers {
            fields.push((format!("h:{}", name), value.as_bytes().to_vec()));
        }
        conn.xadd(stream, "*", &fields).await
    }

    /// Payloads currently in `stream`, oldest first.
    pub async fn stream_payloads(&self, stream: &str) -> redis::RedisResult<Vec<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamRangeReply = conn.xrange_all(stream).await?;
        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| entry.get::<Vec<u8>>("data"))
            .collect())
    }

    /// Raw field map of every entry in `stream`.
    pub async fn stream_entries(&self, stream: &str) -> redis::RedisResult<Vec<redis::streams::StreamId>> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamRangeReply = conn.xrange_all(stream).await?;
        Ok(reply.ids)
    }

    pub async fn stream_len(&self, stream: &str) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        conn.xlen(stream).await
    }

    /// Unacknowledged entries of `group` on `stream`.
    pub async fn pending_count(&self, stream: &str, group: &str) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count())
    }

    /// PUBLISH on a pub/sub channel. Returns the number of receivers.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        conn.publish(channel, payload).await
    }
}
