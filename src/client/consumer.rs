use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::{select, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    body::SequencedBody,
    dedup::DedupFilter,
    idle::{ConsumerState, IdleMonitor, SharedState},
    sequence::Classification,
    supervisor::{ConnectionSupervisor, Recovery},
    Error,
};
use crate::{
    broker::{self, CloseCause, Connection, Connector, Delivery, Event, Message},
    config::{OutputConfig, RelayConfig},
    hex::body_display,
};

/// Handles deliveries from one queue. Every delivery must end up acked.
#[async_trait]
trait Stage: Send {
    async fn on_delivery(
        &mut self,
        conn: &Connection,
        delivery: Delivery,
    ) -> Result<(), broker::Error>;
}

enum End {
    Cancelled,
    Closed(CloseCause),
}

/// Consumes `queue` through whatever link the supervisor holds, following
/// it across reconnects until the operator cancels or the link closes for
/// good.
async fn consume<C: Connector, S: Stage>(
    supervisor: &mut ConnectionSupervisor<C>,
    queue: &str,
    prefetch: u16,
    start_node: usize,
    stage: &mut S,
) -> Result<(), Error> {
    match supervisor.open(start_node).await {
        Ok(()) => {}
        Err(Error::ShuttingDown) => return Ok(()),
        Err(e) => Err(e)?,
    }
    loop {
        let shutdown = supervisor.shutdown_token().clone();
        let end = match supervisor.connection_mut() {
            Some(conn) => drain(conn, queue, prefetch, &shutdown, stage).await,
            None => End::Closed(CloseCause::Io("no open link".into())),
        };
        match end {
            End::Cancelled => break,
            End::Closed(cause) => {
                if supervisor.on_close(&cause) == Recovery::Stop {
                    break;
                }
                match supervisor.reconnect().await {
                    Ok(()) => continue,
                    Err(Error::ShuttingDown) => break,
                    Err(e) => Err(e)?,
                }
            }
        }
    }
    supervisor.close();
    Ok(())
}

async fn drain<S: Stage>(
    conn: &mut Connection,
    queue: &str,
    prefetch: u16,
    shutdown: &CancellationToken,
    stage: &mut S,
) -> End {
    if let Err(e) = conn.qos(prefetch).and_then(|()| conn.consume(queue)) {
        debug!("link closed before consuming: {}", e);
    }
    info!("consuming {} with prefetch {}", queue, prefetch);
    loop {
        select! {
            _ = shutdown.cancelled() => return End::Cancelled,
            event = conn.next_event() => match event {
                Some(Event::Delivery(delivery)) => {
                    let tag = delivery.delivery_tag;
                    if let Err(e) = stage.on_delivery(conn, delivery).await {
                        // the close event follows
                        debug!("could not finish delivery {}: {}", tag, e);
                    }
                }
                Some(Event::Closed(cause)) => return End::Closed(cause),
                Some(other) => trace!("ignoring {:?}", other),
                None => return End::Closed(CloseCause::Io("link dropped".into())),
            }
        }
    }
}

/// Counters of a relay run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub relayed: u64,
    pub duplicates: u64,
}

/// Moves messages from one queue to another, dropping duplicates when
/// enabled.
pub struct RelayConsumer<C> {
    supervisor: ConnectionSupervisor<C>,
    stage: RelayStage,
}

struct RelayStage {
    config: RelayConfig,
    dedup: DedupFilter,
    last_message: Option<Instant>,
    stats: RelayStats,
}

impl<C: Connector> RelayConsumer<C> {
    pub fn new(supervisor: ConnectionSupervisor<C>, config: RelayConfig) -> Self {
        Self {
            supervisor,
            stage: RelayStage {
                dedup: DedupFilter::new(config.dedup_policy),
                config,
                last_message: None,
                stats: RelayStats::default(),
            },
        }
    }

    pub async fn run(mut self) -> Result<RelayStats, Error> {
        let config = self.stage.config.clone();
        let span = debug_span!("relay", from = %config.in_queue, to = %config.out_queue);
        consume(
            &mut self.supervisor,
            &config.in_queue,
            config.prefetch,
            config.start_node,
            &mut self.stage,
        )
        .instrument(span)
        .await?;
        let stats = self.stage.stats;
        info!(
            "relay done: {} received, {} relayed, {} duplicates",
            stats.received, stats.relayed, stats.duplicates
        );
        Ok(stats)
    }
}

impl RelayStage {
    fn processing_delay(&self) -> Option<Duration> {
        if self.config.max_ms == 0 {
            return None;
        }
        let low = self.config.min_ms.min(self.config.max_ms);
        let ms = rand::thread_rng().gen_range(low..=self.config.max_ms);
        Some(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for RelayStage {
    async fn on_delivery(
        &mut self,
        conn: &Connection,
        delivery: Delivery,
    ) -> Result<(), broker::Error> {
        let now = Instant::now();
        if let Some(last) = self.last_message {
            if now.duration_since(last) > self.config.idle_reset {
                self.dedup.on_idle();
            }
        }
        self.last_message = Some(now);
        self.stats.received += 1;

        if self.config.dedup {
            let id = match &delivery.properties.correlation_id {
                Some(id) => id.as_bytes(),
                None => &delivery.body[..],
            };
            if self.dedup.is_duplicate(id) {
                self.stats.duplicates += 1;
                warn!(
                    "duplicate {} (redelivered: {})",
                    body_display(&delivery.body),
                    delivery.redelivered
                );
                return conn.ack(delivery.delivery_tag);
            }
        }

        conn.publish(
            Message::builder()
                .routing_key(self.config.out_queue.as_str())
                .body(delivery.body)
                .properties(delivery.properties)
                .build(),
        )?;
        conn.ack(delivery.delivery_tag)?;
        self.stats.relayed += 1;

        if let Some(delay) = self.processing_delay() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Counters of an output run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub received: u64,
    pub in_order: u64,
    pub duplicates: u64,
    pub forward_jumps: u64,
    pub backward_jumps: u64,
    pub malformed: u64,
}

/// Validates the final sequence of every key, with an idle monitor
/// checkpointing and clearing the state between bursts.
pub struct OutputConsumer<C> {
    supervisor: ConnectionSupervisor<C>,
    stage: OutputStage,
}

struct OutputStage {
    config: OutputConfig,
    state: SharedState,
    stats: OutputStats,
}

impl<C: Connector> OutputConsumer<C> {
    pub fn new(supervisor: ConnectionSupervisor<C>, config: OutputConfig) -> Self {
        let state = ConsumerState::new(config.dedup_policy, config.expected_start).shared();
        Self {
            supervisor,
            stage: OutputStage {
                config,
                state,
                stats: OutputStats::default(),
            },
        }
    }

    /// State shared with the idle monitor.
    pub fn state(&self) -> SharedState {
        self.stage.state.clone()
    }

    pub async fn run(mut self) -> Result<OutputStats, Error> {
        let config = self.stage.config.clone();
        let monitor_stop = self.supervisor.shutdown_token().child_token();
        let monitor = IdleMonitor::new(
            self.stage.state.clone(),
            config.idle_threshold,
            config.idle_tick,
        )
        .spawn(monitor_stop.clone());

        let span = debug_span!("output", queue = %config.queue);
        let result = consume(
            &mut self.supervisor,
            &config.queue,
            config.prefetch,
            config.start_node,
            &mut self.stage,
        )
        .instrument(span)
        .await;

        monitor_stop.cancel();
        if let Err(e) = monitor.await {
            warn!("idle monitor failed: {}", e);
        }
        result?;

        let state = self.stage.state.lock().await;
        if !state.validator.is_empty() {
            info!("final state: {}", state.validator.summary_line());
        }
        let stats = self.stage.stats;
        info!(
            "output done: {} received, {} in order, {} forward jumps, {} backward jumps, {} duplicates, {} malformed",
            stats.received,
            stats.in_order,
            stats.forward_jumps,
            stats.backward_jumps,
            stats.duplicates,
            stats.malformed
        );
        Ok(stats)
    }
}

#[async_trait]
impl Stage for OutputStage {
    async fn on_delivery(
        &mut self,
        conn: &Connection,
        delivery: Delivery,
    ) -> Result<(), broker::Error> {
        let mut state = self.state.lock().await;
        state.touch();
        self.stats.received += 1;

        if self.config.dedup && state.dedup.is_duplicate(&delivery.body) {
            self.stats.duplicates += 1;
            warn!("duplicate {}", body_display(&delivery.body));
            return conn.ack(delivery.delivery_tag);
        }

        match SequencedBody::parse(&delivery.body) {
            Ok(body) => match state.validator.classify(&body.key, body.value) {
                Classification::InOrder => {
                    self.stats.in_order += 1;
                    info!("{}={}", body.key, body.value);
                }
                classification => {
                    match classification {
                        Classification::ForwardJump(_) => self.stats.forward_jumps += 1,
                        Classification::BackwardJump(_) => self.stats.backward_jumps += 1,
                        _ => self.stats.duplicates += 1,
                    }
                    warn!("{}={} {}", body.key, body.value, classification);
                }
            },
            Err(e) => {
                self.stats.malformed += 1;
                warn!("malformed body {}: {}", body_display(&delivery.body), e);
            }
        }
        conn.ack(delivery.delivery_tag)
    }
}
