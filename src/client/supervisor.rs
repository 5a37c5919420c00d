use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{roster::NodeRoster, Error};
use crate::{
    broker::{self, CloseCause, Connection, Connector},
    config::SupervisorConfig,
};

/// What to do after a link closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Stop,
    Reconnect,
}

/// Owns the link to the broker and walks the roster when it fails.
///
/// The cursor only ever moves forward by one node. After the last node it
/// wraps to the first, sleeping `cooldown` before trying it. Cancelling the
/// shutdown token stops every retry; nothing reconnects after that.
pub struct ConnectionSupervisor<C> {
    connector: C,
    roster: NodeRoster,
    cursor: usize,
    config: SupervisorConfig,
    shutdown: CancellationToken,
    current: Option<Connection>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(
        connector: C,
        roster: NodeRoster,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            roster,
            cursor: 0,
            config,
            shutdown,
            current: None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn roster(&self) -> &NodeRoster {
        &self.roster
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The open link, if any.
    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.current.as_mut()
    }

    /// Opens a link to the node at `index`, replacing the current one.
    pub async fn connect(&mut self, index: usize) -> Result<(), Error> {
        if self.is_shutting_down() {
            Err(Error::ShuttingDown)?
        }
        self.cursor = index;
        if let Some(mut old) = self.current.take() {
            old.close();
        }
        let Some(node) = self.roster.get(index) else {
            return Err(broker::Error::NotFound(format!("roster index {index}")).into());
        };
        info!("connecting to {} at {}", node.name, node.addr);
        let connection = self.connector.connect(node.addr).await?;
        debug!("connected to {}", node.name);
        self.current = Some(connection);
        Ok(())
    }

    /// Connects to `start`, falling back to the rest of the roster.
    pub async fn open(&mut self, start: usize) -> Result<(), Error> {
        match self.connect(start).await {
            Ok(()) => Ok(()),
            Err(Error::ShuttingDown) => Err(Error::ShuttingDown),
            Err(e) => {
                warn!("could not open link: {}", e);
                self.reconnect().await
            }
        }
    }

    /// Advances to the next node until one accepts a link. Returns
    /// `ShuttingDown` if the operator cancels in the meantime.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        if self.roster.is_empty() {
            Err(broker::Error::NotFound("empty roster".into()))?
        }
        loop {
            if self.is_shutting_down() {
                Err(Error::ShuttingDown)?
            }
            let mut next = self.cursor + 1;
            if next >= self.roster.len() {
                warn!(
                    "tried every node, waiting {:?} before starting over",
                    self.config.cooldown
                );
                select! {
                    _ = self.shutdown.cancelled() => Err(Error::ShuttingDown)?,
                    _ = tokio::time::sleep(self.config.cooldown) => {}
                }
                next = 0;
            }
            match self.connect(next).await {
                Ok(()) => return Ok(()),
                Err(Error::ShuttingDown) => Err(Error::ShuttingDown)?,
                Err(e) => warn!("could not open link: {}", e),
            }
        }
    }

    /// Forgets the closed link and decides whether to come back. Only a
    /// cancelled shutdown token or a close this side asked for stops the
    /// run; a close code sent by the node never does.
    pub fn on_close(&mut self, cause: &CloseCause) -> Recovery {
        let local = self
            .current
            .take()
            .is_some_and(|connection| connection.closed_locally());
        if local || self.is_shutting_down() {
            info!("link closed: {}", cause);
            return Recovery::Stop;
        }
        warn!("link lost: {}", cause);
        Recovery::Reconnect
    }

    /// Closes the current link cleanly.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.current.take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::{sync::mpsc, time::Instant};

    use super::*;
    use crate::client::roster::Node;

    fn addr(index: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6000 + index as u16))
    }

    fn roster(len: usize) -> NodeRoster {
        NodeRoster::new(
            (0..len)
                .map(|i| Node {
                    name: format!("node{}", i + 1),
                    addr: addr(i),
                })
                .collect(),
        )
    }

    /// Refuses `always_down`, and every node for the first `failures`
    /// attempts.
    #[derive(Clone, Default)]
    struct Flaky {
        attempts: Arc<Mutex<Vec<usize>>>,
        always_down: Option<usize>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for Flaky {
        async fn connect(&self, addr: SocketAddr) -> Result<Connection, broker::Error> {
            let index = (addr.port() - 6000) as usize;
            self.attempts.lock().unwrap().push(index);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing || self.always_down == Some(index) {
                return Err(broker::Error::NodeUnavailable(addr));
            }
            let (tx, _rx) = mpsc::unbounded_channel();
            let (_events_tx, events_rx) = mpsc::unbounded_channel();
            Ok(Connection::new(addr, tx, events_rx))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn walks_the_roster_and_cools_down_on_wrap() {
        let connector = Flaky {
            always_down: Some(0),
            ..Default::default()
        };
        let attempts = connector.attempts.clone();
        let mut supervisor = ConnectionSupervisor::new(
            connector,
            roster(3),
            SupervisorConfig::default(),
            CancellationToken::new(),
        );

        supervisor.open(0).await.unwrap();
        assert_eq!(supervisor.cursor(), 1);

        let io = CloseCause::Io("node gone".into());
        assert_eq!(supervisor.on_close(&io), Recovery::Reconnect);
        supervisor.reconnect().await.unwrap();
        assert_eq!(supervisor.cursor(), 2);

        assert_eq!(supervisor.on_close(&io), Recovery::Reconnect);
        let before = Instant::now();
        supervisor.reconnect().await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert_eq!(supervisor.cursor(), 1);

        assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pass_of_failures_sleeps_once() {
        let connector = Flaky::default();
        connector.failures.store(4, Ordering::SeqCst);
        let attempts = connector.attempts.clone();
        let mut supervisor = ConnectionSupervisor::new(
            connector,
            roster(3),
            SupervisorConfig::default(),
            CancellationToken::new(),
        );

        let before = Instant::now();
        supervisor.open(0).await.unwrap();
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10));
        assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 0, 1]);
        assert!(supervisor.connection_mut().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_cooldown() {
        let connector = Flaky::default();
        connector.failures.store(usize::MAX, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let mut supervisor = ConnectionSupervisor::new(
            connector,
            roster(2),
            SupervisorConfig::default(),
            shutdown.clone(),
        );

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });
        assert!(matches!(supervisor.open(0).await, Err(Error::ShuttingDown)));
        cancel.await.unwrap();
        assert!(supervisor.is_shutting_down());
    }

    #[test]
    fn only_local_closes_stop_the_run() {
        let mut supervisor = ConnectionSupervisor::new(
            Flaky::default(),
            roster(1),
            SupervisorConfig::default(),
            CancellationToken::new(),
        );
        // a node closing with the operator code is still a lost link
        assert_eq!(supervisor.on_close(&CloseCause::Operator), Recovery::Reconnect);
        let admin = CloseCause::Administrative {
            code: broker::CLOSE_ADMINISTRATIVE,
            reason: "forced".into(),
        };
        assert_eq!(supervisor.on_close(&admin), Recovery::Reconnect);
        supervisor.shutdown_token().cancel();
        assert_eq!(supervisor.on_close(&admin), Recovery::Stop);
    }

    #[tokio::test]
    async fn closing_the_link_ourselves_stops_the_run() {
        let mut supervisor = ConnectionSupervisor::new(
            Flaky::default(),
            roster(1),
            SupervisorConfig::default(),
            CancellationToken::new(),
        );
        supervisor.connect(0).await.unwrap();
        supervisor.connection_mut().unwrap().close();
        assert_eq!(supervisor.on_close(&CloseCause::Operator), Recovery::Stop);
        assert!(!supervisor.is_shutting_down());
    }
}
