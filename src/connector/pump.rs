//! The message pump: one task per running connector.
//!
//! The pump:
//! 1. Subscribes on the source once the source endpoint is connected
//! 2. Accepts deliveries into an ordered pending queue
//! 3. Drops echoes of its own forwards
//! 4. Publishes the queue head to the destination, acking durable sources
//! 5. Retries the head with backoff, never letting a later message pass it
//!
//! # Pausing
//!
//! All waiting happens in one `tokio::select!` over the stop signal, the
//! endpoint state watches, the retry timer and the subscription. With the
//! destination down nothing is published. Durable sources are simply not
//! read while paused or while the queue is full; the broker holds the
//! backlog. Pub/sub sources cannot be paused, so they keep being read and a
//! full queue turns deliveries into counted overflow failures.
//!
//! # Graceful Shutdown
//!
//! On stop the subscription is dropped (no new deliveries) and the queue is
//! forwarded until it is empty or the drain deadline passes. A publish that
//! is already in progress when stop arrives keeps running, bounded by the
//! same deadline, and the connector reports `Draining` from that moment.
//! Whatever is left is counted as dropped on shutdown.

use super::types::{ConnectorState, StatsCell};
use crate::config::FailurePolicy;
use crate::error::{ReplicatorError, Result};
use crate::events::{DropReason, EventBus, ReplicatorEvent};
use crate::metrics;
use crate::pool::{epoch_millis, ConnectionState, EndpointHandle};
use crate::resilience::{Backoff, RateLimiter};
use crate::transport::{AckToken, Delivery, Message, SubscribeRequest, Subscription};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// State shared between a [`Connector`](super::Connector) and its pump.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) state_tx: watch::Sender<ConnectorState>,
    pub(crate) stats: StatsCell,
    pub(crate) events: EventBus,
    /// Error that stopped the last run, handed back by `start()`.
    pub(crate) fatal: Mutex<Option<ReplicatorError>>,
}

impl Shared {
    pub(crate) fn new(name: &str, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(ConnectorState::Stopped);
        Self {
            name: name.to_string(),
            state_tx,
            stats: StatsCell::default(),
            events,
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectorState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectorState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            metrics::set_connector_state(&self.name, state.label());
            self.events.emit(ReplicatorEvent::ConnectorStateChanged {
                connector: self.name.clone(),
                state,
            });
        }
    }

    fn record_error(&self, error: &ReplicatorError) {
        let message = error.to_string();
        self.stats.update(|s| s.last_error = Some(message));
    }
}

/// Everything a pump needs, resolved at `start()`.
pub(crate) struct PumpSettings {
    pub(crate) request: SubscribeRequest,
    pub(crate) destination_subject: String,
    pub(crate) echo_suppression: bool,
    pub(crate) policy: FailurePolicy,
    pub(crate) max_retries: u32,
    pub(crate) retry_backoff: Backoff,
    pub(crate) resubscribe_backoff: Backoff,
    pub(crate) publish_timeout: Duration,
    pub(crate) max_pending: usize,
    pub(crate) drain_timeout: Duration,
    pub(crate) rate_limiter: Option<RateLimiter>,
}

/// An accepted message waiting to be forwarded.
struct Pending {
    delivery: Delivery,
    attempts: u32,
    accepted_at: Instant,
}

/// Why the forwarding loop ended.
enum Exit {
    /// Stop requested; drain until the deadline.
    Stop(Option<Instant>),
    Failed(ReplicatorError),
}

pub(crate) struct Pump {
    shared: Arc<Shared>,
    source: EndpointHandle,
    destination: EndpointHandle,
    settings: PumpSettings,
    stop_rx: watch::Receiver<bool>,
    queue: VecDeque<Pending>,
    retry_at: Option<Instant>,
}

impl Pump {
    pub(crate) fn new(
        shared: Arc<Shared>,
        source: EndpointHandle,
        destination: EndpointHandle,
        settings: PumpSettings,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            source,
            destination,
            settings,
            stop_rx,
            queue: VecDeque::new(),
            retry_at: None,
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    /// Run until stopped or failed. Leaves the connector Stopped or Failed.
    pub(crate) async fn run(mut self) {
        info!(
            source = %self.source.name(),
            destination = %self.destination.name(),
            subject = %self.settings.request.subject,
            "Starting connector pump"
        );

        match self.forward_loop().await {
            Exit::Stop(deadline) => {
                self.drain(deadline).await;
                self.shared.set_state(ConnectorState::Stopped);
                info!("Connector pump stopped");
            }
            Exit::Failed(error) => {
                self.abandon_queue();
                self.shared.record_error(&error);
                let reason = error.to_string();
                *self.shared.fatal.lock() = Some(error);
                self.shared.set_state(ConnectorState::Failed(reason));
            }
        }
    }

    async fn forward_loop(&mut self) -> Exit {
        let ack_source = self.source.kind().requires_ack();
        let mut source_rx = self.source.watch_state();
        let mut destination_rx = self.destination.watch_state();
        let mut source_watch_open = true;
        let mut destination_watch_open = true;

        let mut subscription: Option<Subscription> = None;
        let mut resubscribe_at: Option<Instant> = None;
        let mut resubscribe_attempt: u32 = 0;

        loop {
            if *self.stop_rx.borrow() {
                return Exit::Stop(None);
            }

            // (Re)subscribe once the source is up
            if subscription.is_none()
                && self.source.is_connected()
                && resubscribe_at.map_or(true, |at| Instant::now() >= at)
            {
                resubscribe_at = None;
                match self.subscribe().await {
                    Ok(sub) => {
                        subscription = Some(sub);
                        resubscribe_attempt = 0;
                        if self.shared.state() == ConnectorState::Starting {
                            self.shared.set_state(ConnectorState::Running);
                        } else {
                            info!("Resubscribed to source");
                        }
                    }
                    Err(e) if !e.is_retryable() => {
                        return Exit::Failed(e);
                    }
                    Err(e) => {
                        if e.is_connection_error() {
                            self.source.report_failure();
                        }
                        resubscribe_attempt = resubscribe_attempt.saturating_add(1);
                        let delay = self.settings.resubscribe_backoff.delay_for_attempt(resubscribe_attempt);
                        warn!(
                            attempt = resubscribe_attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Source subscribe failed, retrying"
                        );
                        resubscribe_at = Some(Instant::now() + delay);
                    }
                }
            }

            let destination_up = self.destination.is_connected();

            // Pick up whatever is already buffered, in order
            if let Some(sub) = subscription.as_mut() {
                while self.can_accept(ack_source, destination_up) {
                    let Some(delivery) = sub.try_next() else { break };
                    if let Err(e) = self.accept(delivery).await {
                        return Exit::Failed(e);
                    }
                }
            }

            if destination_up && self.retry_at.is_none() && !self.queue.is_empty() {
                let mut deadline = None;
                if let Err(e) = self.forward_head(&mut deadline).await {
                    return Exit::Failed(e);
                }
                if deadline.is_some() {
                    return Exit::Stop(deadline);
                }
                continue;
            }

            let can_accept = subscription.is_some() && self.can_accept(ack_source, destination_up);
            let subscribed = subscription.is_some();
            let retry_at = self.retry_at;

            tokio::select! {
                biased;

                _ = self.stop_rx.changed() => return Exit::Stop(None),

                changed = destination_rx.changed(), if destination_watch_open => {
                    if changed.is_err() {
                        destination_watch_open = false;
                    }
                }

                changed = source_rx.changed(), if source_watch_open && !subscribed => {
                    if changed.is_err() {
                        source_watch_open = false;
                    }
                }

                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                }

                _ = sleep_until_opt(resubscribe_at), if !subscribed => {}

                delivery = next_delivery(&mut subscription), if can_accept => match delivery {
                    Some(delivery) => {
                        if let Err(e) = self.accept(delivery).await {
                            return Exit::Failed(e);
                        }
                    }
                    None => {
                        subscription = None;
                        self.shared.stats.update(|s| s.source_disconnects += 1);
                        self.source.report_failure();
                        let delay = self.settings.resubscribe_backoff.delay_for_attempt(1);
                        resubscribe_at = Some(Instant::now() + delay);
                        warn!(
                            source = %self.source.name(),
                            "Source subscription lost, pausing until it is back"
                        );
                    }
                },
            }
        }
    }

    fn can_accept(&self, ack_source: bool, destination_up: bool) -> bool {
        if ack_source {
            destination_up && self.queue.len() < self.settings.max_pending
        } else {
            true
        }
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let limit = self.settings.publish_timeout;
        match timeout(limit, self.source.subscribe(&self.settings.request)).await {
            Ok(result) => result,
            Err(_) => Err(ReplicatorError::timeout("subscribe", limit)),
        }
    }

    /// Take one delivery off the source.
    async fn accept(&mut self, delivery: Delivery) -> Result<()> {
        // A resubscribe replays this consumer's pending entries, some of
        // which are still queued here
        if let Some(token) = &delivery.ack {
            if self.queue.iter().any(|p| p.delivery.ack.as_ref() == Some(token)) {
                debug!(id = %token.id, "Skipped replay of an entry already queued");
                return Ok(());
            }
        }

        let bytes = delivery.message.payload.len() as u64;
        self.shared.stats.update(|s| {
            s.received += 1;
            s.bytes_in += bytes;
            s.in_flight += 1;
            s.last_activity_ms = epoch_millis();
        });
        metrics::record_received(self.name(), bytes as usize);

        if self.settings.echo_suppression && delivery.message.was_forwarded_by(self.name()) {
            debug!(subject = %delivery.message.subject, "Suppressed echo of own forward");
            self.shared.stats.update(|s| {
                s.suppressed += 1;
                s.in_flight -= 1;
            });
            metrics::record_suppressed(self.name());
            if let Some(token) = &delivery.ack {
                self.ack(token).await;
            }
            return Ok(());
        }

        if self.queue.len() >= self.settings.max_pending {
            let capacity = self.settings.max_pending;
            let error = ReplicatorError::BufferOverflow {
                connector: self.shared.name.clone(),
                capacity,
            };
            self.shared.stats.update(|s| {
                s.failed += 1;
                s.in_flight -= 1;
                s.last_error = Some(error.to_string());
            });
            metrics::record_failed(self.name(), "overflow", 1);
            self.shared.events.emit(ReplicatorEvent::MessagesDropped {
                connector: self.shared.name.clone(),
                count: 1,
                reason: DropReason::Overflow,
            });
            return match self.settings.policy {
                FailurePolicy::FailFast => Err(error),
                FailurePolicy::BestEffort => Ok(()),
            };
        }

        self.queue.push_back(Pending {
            delivery,
            attempts: 0,
            accepted_at: Instant::now(),
        });
        metrics::set_in_flight(self.name(), self.queue.len());
        Ok(())
    }

    /// Publish the queue head once.
    ///
    /// On success the head is settled. On failure it either stays at the
    /// head with `retry_at` set, or is settled as failed when its retries are
    /// exhausted. If stop arrives mid-publish, `deadline` is set to the drain
    /// deadline and the publish continues under it.
    async fn forward_head(&mut self, deadline: &mut Option<Instant>) -> Result<()> {
        let Some(head) = self.queue.front() else {
            return Ok(());
        };
        let outgoing = head.delivery.message.forwarded(&self.settings.destination_subject, &self.shared.name);

        if let Some(limiter) = &self.settings.rate_limiter {
            if limiter.acquire().await {
                debug!("Publish throttled by rate limit");
            }
        }

        let started = Instant::now();
        let result = self.publish(&outgoing, deadline).await;
        metrics::record_publish_latency(self.name(), started.elapsed());

        match result {
            Ok(()) => {
                let Some(done) = self.queue.pop_front() else {
                    return Ok(());
                };
                if let Some(token) = &done.delivery.ack {
                    self.ack(token).await;
                }
                let bytes = outgoing.payload.len() as u64;
                self.shared.stats.update(|s| {
                    s.forwarded += 1;
                    s.bytes_out += bytes;
                    s.in_flight = s.in_flight.saturating_sub(1);
                    s.last_activity_ms = epoch_millis();
                });
                metrics::record_forwarded(self.name(), bytes as usize, done.accepted_at.elapsed());
                metrics::set_in_flight(self.name(), self.queue.len());
                Ok(())
            }
            Err(ReplicatorError::NotConnected { .. }) => {
                // Destination went away between the state check and the
                // publish; wait for it without spending an attempt
                self.retry_at = Some(Instant::now() + self.settings.retry_backoff.delay_for_attempt(1));
                Ok(())
            }
            Err(error) => {
                if error.is_connection_error() {
                    self.destination.report_failure();
                }
                self.shared.record_error(&error);
                self.publish_failed(error).await
            }
        }
    }

    async fn publish(&mut self, message: &Message, deadline: &mut Option<Instant>) -> Result<()> {
        let destination = &self.destination;
        let shared = &self.shared;
        let stop_rx = &mut self.stop_rx;
        let publish_timeout = self.settings.publish_timeout;
        let drain_timeout = self.settings.drain_timeout;

        let publish = destination.publish(message);
        tokio::pin!(publish);
        let started = Instant::now();

        loop {
            let give_up_at = match *deadline {
                Some(d) => (started + publish_timeout).min(d),
                None => started + publish_timeout,
            };

            tokio::select! {
                biased;
                result = timeout_at(give_up_at, &mut publish) => {
                    return result.unwrap_or_else(|_| Err(ReplicatorError::timeout("publish", give_up_at - started)));
                }
                _ = stop_rx.changed(), if deadline.is_none() => {
                    *deadline = Some(Instant::now() + drain_timeout);
                    shared.set_state(ConnectorState::Draining);
                }
            }
        }
    }

    async fn publish_failed(&mut self, error: ReplicatorError) -> Result<()> {
        let max_retries = self.settings.max_retries;
        let Some(head) = self.queue.front_mut() else {
            return Ok(());
        };
        head.attempts += 1;
        let attempts = head.attempts;

        if attempts <= max_retries {
            let delay = self.settings.retry_backoff.delay_for_attempt(attempts);
            self.retry_at = Some(Instant::now() + delay);
            self.shared.stats.update(|s| s.retries += 1);
            metrics::record_retry(self.name());
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Publish failed, retrying"
            );
            return Ok(());
        }

        let Some(failed) = self.queue.pop_front() else {
            return Ok(());
        };
        self.shared.stats.update(|s| {
            s.failed += 1;
            s.in_flight = s.in_flight.saturating_sub(1);
        });
        metrics::record_failed(self.name(), "retries_exhausted", 1);
        metrics::set_in_flight(self.name(), self.queue.len());
        self.shared.events.emit(ReplicatorEvent::ForwardFailed {
            connector: self.shared.name.clone(),
            subject: self.settings.destination_subject.clone(),
            attempts,
            error: error.to_string(),
        });

        match self.settings.policy {
            FailurePolicy::FailFast => Err(ReplicatorError::RetriesExhausted {
                connector: self.shared.name.clone(),
                attempts,
                last_error: error.to_string(),
            }),
            FailurePolicy::BestEffort => {
                // Counted as failed; ack so the group does not hand it back forever
                if let Some(token) = &failed.delivery.ack {
                    self.ack(token).await;
                }
                Ok(())
            }
        }
    }

    async fn ack(&self, token: &AckToken) {
        let limit = self.settings.publish_timeout;
        match timeout(limit, self.source.ack(token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(id = %token.id, error = %e, "Source ack failed, message may be redelivered"),
            Err(_) => warn!(id = %token.id, "Source ack timed out, message may be redelivered"),
        }
    }

    /// Forward what is queued until empty or the deadline passes.
    async fn drain(&mut self, deadline: Option<Instant>) {
        self.shared.set_state(ConnectorState::Draining);
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.settings.drain_timeout);
        let mut destination_rx = self.destination.watch_state();

        if !self.queue.is_empty() {
            info!(
                pending = self.queue.len(),
                drain_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Draining pending messages"
            );
        }

        while !self.queue.is_empty() && Instant::now() < deadline {
            if let Some(at) = self.retry_at.take() {
                sleep_until(at.min(deadline)).await;
                continue;
            }

            if !self.destination.is_connected() {
                let reconnected = timeout_at(
                    deadline,
                    destination_rx.wait_for(|s| *s == ConnectionState::Connected),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
                if !reconnected {
                    break;
                }
                continue;
            }

            let mut bounded = Some(deadline);
            if let Err(e) = self.forward_head(&mut bounded).await {
                warn!(error = %e, "Forwarding failed during drain, abandoning the rest");
                break;
            }
        }

        let dropped = self.queue.len() as u64;
        self.queue.clear();
        self.retry_at = None;
        self.shared.stats.update(|s| {
            s.dropped_on_shutdown += dropped;
            s.in_flight = 0;
        });
        metrics::set_in_flight(self.name(), 0);

        if dropped > 0 {
            metrics::record_dropped_on_shutdown(self.name(), dropped);
            self.shared.events.emit(ReplicatorEvent::MessagesDropped {
                connector: self.shared.name.clone(),
                count: dropped,
                reason: DropReason::Shutdown,
            });
        }
    }

    /// Count everything still queued as failed. Used when the connector dies.
    fn abandon_queue(&mut self) {
        let abandoned = self.queue.len() as u64;
        self.queue.clear();
        self.retry_at = None;
        self.shared.stats.update(|s| {
            s.failed += abandoned;
            s.in_flight = 0;
        });
        metrics::set_in_flight(self.name(), 0);

        if abandoned > 0 {
            metrics::record_failed(self.name(), "connector_failed", abandoned);
            self.shared.events.emit(ReplicatorEvent::MessagesDropped {
                connector: self.shared.name.clone(),
                count: abandoned,
                reason: DropReason::ConnectorFailed,
            });
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_delivery(subscription: &mut Option<Subscription>) -> Option<Delivery> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}
