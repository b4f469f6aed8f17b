//! Delivery of light commands to the broker.
//!
//! The control loop hands intents over a bounded channel with `try_send` and
//! never waits on the network. [`ActuatorPublisher::run`] owns the connection:
//! it reconnects with [`Backoff`] forever, drops intents while disconnected
//! and says goodbye to the broker once every sender is gone. A lost connection
//! waits one backoff step before it is redialled.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::trigger::CommandIntent;
use crate::{Result, VisualiserError};

mod backoff;
mod codec;
mod mqtt;

pub use backoff::Backoff;
pub use codec::{encode, WireMessage};
pub use mqtt::{connect_packet, publish_packet, BrokerConnector, BrokerSession, MqttSession, TcpConnector};

/// Intents buffered between the control loop and the publisher.
pub const DEFAULT_QUEUE: usize = 256;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Broker link as seen by the publisher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters shared between the publisher task and its handles.
#[derive(Debug, Default)]
pub struct PublisherStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`PublisherStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PublisherCounters {
    /// Wire messages handed to the broker.
    pub sent: u64,
    /// Intents discarded because no connection was up.
    pub dropped: u64,
    /// Intents lost to encoding or transport errors.
    pub failed: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherCounters {
        PublisherCounters {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Sending side, owned by the control loop. Dropping the last handle shuts
/// the publisher down gracefully.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    intents: mpsc::Sender<CommandIntent>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<PublisherStats>,
}

impl PublisherHandle {
    /// Queues an intent without waiting. False when the queue is full or the
    /// publisher has stopped.
    pub fn try_publish(&self, intent: CommandIntent) -> bool {
        match self.intents.try_send(intent) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(intent)) => {
                tracing::trace!(device = %intent.device_id, "intent queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Current broker link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that sees every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }
}

/// Owns the broker connection and turns intents into MQTT publishes.
pub struct ActuatorPublisher {
    connector: Box<dyn BrokerConnector>,
    backoff: Backoff,
    intents: mpsc::Receiver<CommandIntent>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<PublisherStats>,
}

impl ActuatorPublisher {
    /// Creates the task and its handle. `capacity` bounds the intent queue.
    pub fn new(
        connector: Box<dyn BrokerConnector>,
        backoff: Backoff,
        capacity: usize,
    ) -> (Self, PublisherHandle) {
        let (sender, intents) = mpsc::channel(capacity.max(1));
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(PublisherStats::default());

        let publisher = Self {
            connector,
            backoff,
            intents,
            state,
            stats: stats.clone(),
        };
        let handle = PublisherHandle {
            intents: sender,
            state: state_rx,
            stats,
        };
        (publisher, handle)
    }

    /// Runs until every [`PublisherHandle`] has been dropped.
    pub async fn run(self) {
        let Self {
            connector,
            mut backoff,
            mut intents,
            state,
            stats,
        } = self;
        let endpoint = connector.endpoint();
        let mut outage = Outage::default();

        loop {
            state.send_replace(ConnectionState::Connecting);
            let attempt = drain_while(connector.connect(), &mut intents, &stats, &mut outage).await;
            let mut session = match attempt {
                None => break,
                Some(Ok(session)) => session,
                Some(Err(err)) => {
                    state.send_replace(ConnectionState::Disconnected);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        broker = %endpoint,
                        attempt = backoff.attempt(),
                        retry_in = ?delay,
                        "broker connection failed: {err}"
                    );
                    if drain_while(tokio::time::sleep(delay), &mut intents, &stats, &mut outage)
                        .await
                        .is_none()
                    {
                        break;
                    }
                    continue;
                }
            };

            // Anything queued while connecting is already stale.
            while let Ok(intent) = intents.try_recv() {
                outage.drop_intent(&intent, &stats);
            }
            backoff.reset();
            state.send_replace(ConnectionState::Connected);
            tracing::info!(broker = %endpoint, dropped = outage.dropped, "connected to broker");
            outage = Outage::default();

            let mut keep_alive = connector.keep_alive().map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                tokio::select! {
                    intent = intents.recv() => {
                        let Some(intent) = intent else {
                            if let Err(err) = session.disconnect().await {
                                tracing::debug!("disconnect from broker failed: {err}");
                            }
                            state.send_replace(ConnectionState::Disconnected);
                            tracing::info!(broker = %endpoint, "publisher stopped");
                            return;
                        };
                        if let Err(err) = deliver(session.as_mut(), &intent, &stats).await {
                            tracing::warn!(broker = %endpoint, "broker connection lost: {err}");
                            break;
                        }
                    }
                    _ = tick(&mut keep_alive) => {
                        if let Err(err) = session.ping().await {
                            tracing::warn!(broker = %endpoint, "keep-alive failed: {err}");
                            break;
                        }
                    }
                }
            }

            state.send_replace(ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            tracing::debug!(broker = %endpoint, retry_in = ?delay, "reconnecting");
            if drain_while(tokio::time::sleep(delay), &mut intents, &stats, &mut outage)
                .await
                .is_none()
            {
                break;
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        tracing::info!(broker = %endpoint, "publisher stopped");
    }
}

impl std::fmt::Debug for ActuatorPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorPublisher")
            .field("broker", &self.connector.endpoint())
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// One connect/disconnect round trip.
pub async fn probe(connector: &dyn BrokerConnector) -> Result<()> {
    let mut session = tokio::time::timeout(PROBE_TIMEOUT, connector.connect())
        .await
        .map_err(|_| VisualiserError::Broker("timed out".into()))??;
    session.disconnect().await
}

#[derive(Debug, Default)]
struct Outage {
    dropped: u64,
}

impl Outage {
    fn drop_intent(&mut self, intent: &CommandIntent, stats: &PublisherStats) {
        if self.dropped == 0 {
            tracing::warn!(
                device = %intent.device_id,
                "broker not connected, dropping light commands until it is"
            );
        }
        self.dropped += 1;
        stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Awaits `fut`, discarding intents that arrive meanwhile. None when the
/// intent channel closed first.
async fn drain_while<F: Future>(
    fut: F,
    intents: &mut mpsc::Receiver<CommandIntent>,
    stats: &PublisherStats,
    outage: &mut Outage,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            intent = intents.recv() => match intent {
                Some(intent) => outage.drop_intent(&intent, stats),
                None => return None,
            },
        }
    }
}

/// Publishes one intent. Only transport errors are returned; anything
/// wrong with the intent itself is logged and counted.
async fn deliver(
    session: &mut dyn BrokerSession,
    intent: &CommandIntent,
    stats: &PublisherStats,
) -> Result<()> {
    let messages = match encode(intent) {
        Ok(messages) => messages,
        Err(err) => {
            tracing::warn!(device = %intent.device_id, "dropping command: {err}");
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };

    for message in &messages {
        if let Err(err) = session.publish(message).await {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        stats.sent.fetch_add(1, Ordering::Relaxed);
    }
    tracing::trace!(
        device = %intent.device_id,
        power = ?intent.command.power,
        colour = %intent.command.colour,
        brightness = intent.command.brightness,
        "published"
    );
    Ok(())
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
