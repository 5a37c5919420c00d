use std::pin::Pin;

use futures::future::OptionFuture;
use tokio::{select, time::Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    confirm::{ConfirmTracker, Summary, Undelivered},
    flow::FlowController,
    supervisor::{ConnectionSupervisor, Recovery},
    Error,
};
use crate::{
    broker::{CloseCause, Connection, Connector, Event},
    config::PublisherConfig,
    HexDisplayExt,
};

/// How a publisher run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub summary: Summary,
    /// Positions that were nacked, returned or never confirmed.
    pub undelivered: Undelivered,
    /// The target number of confirmations was reached.
    pub completed: bool,
    /// Highest position published.
    pub positions: u64,
    pub pauses: u64,
}

/// Why driving one link stopped.
#[derive(Debug)]
enum Drive {
    Completed,
    Cancelled,
    Closed(CloseCause),
}

/// Where a burst of publishes stopped.
enum Burst {
    /// Everything still needed is in flight.
    Waiting,
    Paused,
    Done(Drive),
}

/// Publishes positions 1, 2, 3, ... until the broker has confirmed
/// `target` of them.
///
/// Positions come from one counter for the whole run. When a link fails,
/// publishes it never confirmed are abandoned rather than resent, and the
/// next link carries on from the next position.
pub struct Publisher<C> {
    supervisor: ConnectionSupervisor<C>,
    session: Session,
}

/// Everything a run keeps across links.
struct Session {
    tracker: ConfirmTracker,
    flow: FlowController,
    config: PublisherConfig,
    run_id: String,
    position: u64,
}

impl<C: Connector> Publisher<C> {
    pub fn new(supervisor: ConnectionSupervisor<C>, config: PublisherConfig) -> Self {
        let run_id = rand::random::<[u8; 4]>().hex().to_string();
        Self {
            supervisor,
            session: Session {
                tracker: ConfirmTracker::new(config.target, config.progress_every),
                flow: FlowController::new(config.flow.clone()),
                config,
                run_id,
                position: 0,
            },
        }
    }

    pub async fn run(mut self) -> Result<Outcome, Error> {
        let span = debug_span!("publisher", run = %self.session.run_id);
        async move {
            if self.session.config.target == 0 {
                info!("nothing to publish");
                return Ok(self.session.outcome(true));
            }
            match self.supervisor.open(self.session.config.start_node).await {
                Ok(()) => {}
                Err(Error::ShuttingDown) => return Ok(self.session.outcome(false)),
                Err(e) => Err(e)?,
            }

            let completed = loop {
                let shutdown = self.supervisor.shutdown_token().clone();
                let drive = match self.supervisor.connection_mut() {
                    Some(conn) => self.session.drive(conn, &shutdown).await,
                    None => Drive::Closed(CloseCause::Io("no open link".into())),
                };
                match drive {
                    Drive::Completed => break true,
                    Drive::Cancelled => {
                        info!("cancelled at position {}", self.session.position);
                        break false;
                    }
                    Drive::Closed(cause) => {
                        self.session.tracker.reset_channel(&cause);
                        if self.supervisor.on_close(&cause) == Recovery::Stop {
                            break false;
                        }
                        match self.supervisor.reconnect().await {
                            Ok(()) => continue,
                            Err(Error::ShuttingDown) => break false,
                            Err(e) => Err(e)?,
                        }
                    }
                }
            };

            self.supervisor.close();
            let outcome = self.session.outcome(completed);
            info!("publisher done: {}", outcome.summary);
            if !outcome.undelivered.is_empty() {
                warn!("undelivered positions: {}", outcome.undelivered);
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

impl Session {
    fn outcome(&self, completed: bool) -> Outcome {
        Outcome {
            summary: self.tracker.summary(),
            undelivered: self.tracker.undelivered().clone(),
            completed,
            positions: self.position,
            pauses: self.flow.pauses(),
        }
    }

    /// Publishes on one link and handles its events until the target is
    /// reached, the link closes or the operator cancels.
    async fn drive(&mut self, conn: &mut Connection, shutdown: &CancellationToken) -> Drive {
        if let Err(e) = conn.confirm_select() {
            debug!("link closed before confirm mode: {}", e);
        }
        let mut resume: OptionFuture<Pin<Box<Sleep>>> = None.into();
        let mut paused = false;
        loop {
            if !paused {
                match self.publish_burst(conn).await {
                    Burst::Done(drive) => return drive,
                    Burst::Paused => {
                        paused = true;
                        let delay = self.flow.resume_delay();
                        resume = Some(Box::pin(tokio::time::sleep(delay))).into();
                    }
                    Burst::Waiting => {}
                }
            }
            select! {
                _ = shutdown.cancelled() => return Drive::Cancelled,
                event = conn.next_event() => match event {
                    Some(event) => {
                        if let Some(drive) = self.handle(event) {
                            return drive;
                        }
                    }
                    None => return Drive::Closed(CloseCause::Io("link dropped".into())),
                },
                Some(()) = &mut resume => {
                    debug!("resuming at position {}", self.position + 1);
                    paused = false;
                    resume = None.into();
                }
            }
        }
    }

    /// Publishes until everything still needed is in flight or flow control
    /// calls for a pause. Each batch boundary is sampled right after it was
    /// published: confirmations that already arrived are handled first, so
    /// the pause decision sees a current pending count. After a pause the
    /// next burst runs through to the following boundary unchecked.
    async fn publish_burst(&mut self, conn: &mut Connection) -> Burst {
        loop {
            if self.in_flight_covers_target() {
                return Burst::Waiting;
            }
            let next = self.position + 1;
            let correlation_id = self.correlation_id(next);
            let message = self
                .config
                .shape
                .message(next, correlation_id, self.config.mandatory);
            if let Err(e) = conn.publish(message) {
                // the close event is still on its way
                debug!("stopped publishing at {}: {}", next, e);
                return Burst::Waiting;
            }
            self.tracker.on_publish(next);
            self.position = next;

            if self.flow.is_sample_point(next) {
                tokio::task::yield_now().await;
                while let Some(event) = conn.try_next_event() {
                    if let Some(drive) = self.handle(event) {
                        return Burst::Done(drive);
                    }
                }
                if self.in_flight_covers_target() {
                    return Burst::Waiting;
                }
                if self.flow.should_pause(next, self.tracker.pending()) {
                    return Burst::Paused;
                }
            }
        }
    }

    fn correlation_id(&self, position: u64) -> String {
        format!("{}-{}", self.run_id, position)
    }

    /// Reads the position back out of one of this run's correlation ids.
    fn position_of(&self, correlation_id: &str) -> Option<u64> {
        correlation_id
            .strip_prefix(self.run_id.as_str())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    fn in_flight_covers_target(&self) -> bool {
        self.tracker.pending() as u64 + self.tracker.resolved() >= self.tracker.target()
    }

    fn handle(&mut self, event: Event) -> Option<Drive> {
        match event {
            Event::Confirm(confirm) => {
                if self.tracker.on_confirm(&confirm).completed {
                    return Some(Drive::Completed);
                }
            }
            Event::Returned {
                routing_key,
                properties,
                body,
                ..
            } => {
                let position = properties
                    .correlation_id
                    .as_deref()
                    .and_then(|id| self.position_of(id));
                self.tracker.on_return(position, &routing_key, &body);
            }
            Event::Delivery(delivery) => {
                warn!(
                    "ignoring delivery {} on a publishing link",
                    delivery.delivery_tag
                );
            }
            Event::Closed(cause) => return Some(Drive::Closed(cause)),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use super::*;
    use crate::{
        broker::memory::MemoryCluster,
        client::{
            body::SequenceShape,
            roster::{Node, NodeRoster},
        },
        config::{FlowConfig, SupervisorConfig},
    };

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn cluster() -> (MemoryCluster, NodeRoster) {
        let nodes = [addr(1), addr(2)];
        let cluster = MemoryCluster::with_nodes(&nodes).await;
        cluster.declare_queue("sequence").await;
        let roster = NodeRoster::new(
            nodes
                .iter()
                .enumerate()
                .map(|(i, &addr)| Node {
                    name: format!("node{}", i + 1),
                    addr,
                })
                .collect(),
        );
        (cluster, roster)
    }

    fn publisher(
        cluster: &MemoryCluster,
        roster: NodeRoster,
        target: u64,
        shutdown: CancellationToken,
    ) -> Publisher<MemoryCluster> {
        let supervisor = ConnectionSupervisor::new(
            cluster.clone(),
            roster,
            SupervisorConfig::default(),
            shutdown,
        );
        Publisher::new(
            supervisor,
            PublisherConfig::builder()
                .target(target)
                .shape(SequenceShape::plain("sequence"))
                .build(),
        )
    }

    #[tokio::test]
    async fn zero_target_completes_without_a_link() {
        let (cluster, roster) = cluster().await;
        let outcome = publisher(&cluster, roster, 0, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.positions, 0);
        assert_eq!(cluster.published().await, 0);
    }

    #[tokio::test]
    async fn publishes_exactly_the_target() {
        let (cluster, roster) = cluster().await;
        let outcome = publisher(&cluster, roster, 2_500, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.positions, 2_500);
        assert_eq!(outcome.summary.positive, 2_500);
        assert_eq!(outcome.summary.pending, 0);
        assert_eq!(cluster.queue_depth("sequence").await, Some(2_500));
    }

    #[tokio::test]
    async fn unroutable_messages_are_returned_then_confirmed() {
        let (cluster, roster) = cluster().await;
        let supervisor = ConnectionSupervisor::new(
            cluster.clone(),
            roster,
            SupervisorConfig::default(),
            CancellationToken::new(),
        );
        let outcome = Publisher::new(
            supervisor,
            PublisherConfig::builder()
                .target(10)
                .shape(SequenceShape::plain("nowhere"))
                .build(),
        )
        .run()
        .await
        .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.summary.returned, 10);
        assert_eq!(outcome.summary.positive, 10);
        assert_eq!(outcome.undelivered.unroutable, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_while_confirms_are_held() {
        let (cluster, roster) = cluster().await;
        cluster.hold_confirms(true).await;
        let supervisor = ConnectionSupervisor::new(
            cluster.clone(),
            roster,
            SupervisorConfig::default(),
            CancellationToken::new(),
        );
        let publisher = Publisher::new(
            supervisor,
            PublisherConfig::builder()
                .target(30)
                .shape(SequenceShape::plain("sequence"))
                .flow(
                    FlowConfig::builder()
                        .high_water(5)
                        .batch(10)
                        .resume_delay(Duration::from_secs(2))
                        .build(),
                )
                .build(),
        );
        let run = tokio::spawn(publisher.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        // paused right after sampling position 10
        assert_eq!(cluster.published().await, 10);

        // one window later, with confirms still held, it ran to the next
        // boundary and paused there
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cluster.published().await, 20);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cluster.published().await, 30);

        cluster.hold_confirms(false).await;
        let outcome = run.await.unwrap().unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.positions, 30);
        assert_eq!(outcome.pauses, 2);
    }

    #[tokio::test]
    async fn operator_cancel_stops_cleanly() {
        let (cluster, roster) = cluster().await;
        cluster.hold_confirms(true).await;
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(publisher(&cluster, roster, 100, shutdown.clone()).run());
        tokio::task::yield_now().await;
        shutdown.cancel();
        let outcome = run.await.unwrap().unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.summary.positive, 0);
    }
}
