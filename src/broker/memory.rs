// The in-process cluster is a broker in its own right: queues, a default
// exchange, consistent-hash exchanges, publisher confirms, prefetch-limited
// consumers and redelivery of unacknowledged messages. All nodes share a
// single state, which stands in for queues mirrored to every node, so a
// client that fails over to another node sees the same queues.
//
// Each link gets a task that applies its commands under the state lock.
// Deliveries and returns are pushed to a link's event queue while the lock is
// held, so their order matches the order the state changed in. Confirms are
// collected per burst of commands and flushed as cumulative confirms.

use std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::Error, ring::HashRing, CloseCause, Command, Confirm, Connection, Connector, Delivery,
    Event, Message, Polarity, Properties, CLOSE_NOT_FOUND,
};

/// Upper bound on commands applied per lock acquisition. Confirms are
/// flushed after each burst.
const COMMAND_BURST: usize = 256;

type LinkID = u64;

/// A handle to the shared broker state. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<SocketAddr, bool>,
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, HashRing>,
    links: HashMap<LinkID, Link>,
    next_link_id: LinkID,
    published: u64,
    hold_confirms: bool,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    consumers: Vec<LinkID>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    properties: Properties,
    redelivered: bool,
}

struct Link {
    node: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    kill: CancellationToken,
    confirm_mode: bool,
    next_publish_tag: u64,
    unflushed_confirms: Vec<(u64, Polarity)>,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, (String, Stored)>,
    consuming: Vec<String>,
}

impl Link {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cluster with every given node up.
    pub async fn with_nodes(nodes: &[SocketAddr]) -> Self {
        let cluster = Self::new();
        for node in nodes {
            cluster.add_node(*node).await;
        }
        cluster
    }

    pub async fn add_node(&self, node: SocketAddr) {
        self.state.lock().await.nodes.insert(node, true);
    }

    /// Marks a node up or down. Taking a node down drops its links as an
    /// i/o failure; while down it refuses new links.
    pub async fn set_node_up(&self, node: SocketAddr, up: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(&node) {
            Some(flag) => *flag = up,
            None => Err(Error::UnknownNode(node))?,
        }
        if !up {
            let cause = CloseCause::Io(format!("node {node} went down"));
            let dropped = state.close_node_links(node, cause);
            debug!("node {} down, dropped {} links", node, dropped);
        }
        Ok(())
    }

    /// Force-closes every link on a node with the given cause, returning how
    /// many were closed.
    pub async fn close_node_connections(&self, node: SocketAddr, cause: CloseCause) -> usize {
        self.state.lock().await.close_node_links(node, cause)
    }

    pub async fn declare_queue(&self, name: &str) {
        self.state
            .lock()
            .await
            .queues
            .entry(name.to_owned())
            .or_default();
    }

    pub async fn declare_hash_exchange(&self, name: &str) {
        self.state
            .lock()
            .await
            .exchanges
            .entry(name.to_owned())
            .or_default();
    }

    /// Binds a queue to a consistent-hash exchange with the given weight.
    pub async fn bind(&self, queue: &str, exchange: &str, weight: u32) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            Err(Error::NotFound(format!("queue '{queue}'")))?
        }
        match state.exchanges.get_mut(exchange) {
            Some(ring) => ring.bind(queue, weight),
            None => Err(Error::NotFound(format!("exchange '{exchange}'")))?,
        }
        Ok(())
    }

    /// Drops every ready message of a queue, returning how many there were.
    pub async fn purge(&self, queue: &str) -> Result<usize, Error> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(queue) {
            Some(queue) => Ok(std::mem::take(&mut queue.ready).len()),
            None => Err(Error::NotFound(format!("queue '{queue}'"))),
        }
    }

    /// Ready (not yet delivered) messages in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().await.queues.get(queue).map(|q| q.ready.len())
    }

    /// Total publishes the cluster accepted, routed or not.
    pub async fn published(&self) -> u64 {
        self.state.lock().await.published
    }

    /// While held, confirms accumulate instead of being sent. Releasing
    /// flushes everything that accumulated.
    pub async fn hold_confirms(&self, hold: bool) {
        let mut state = self.state.lock().await;
        state.hold_confirms = hold;
        if !hold {
            let ids: Vec<LinkID> = state.links.keys().copied().collect();
            for id in ids {
                state.flush_confirms(id);
            }
        }
    }

    async fn run_link(
        self,
        id: LinkID,
        mut commands: mpsc::UnboundedReceiver<Command>,
        kill: CancellationToken,
    ) {
        loop {
            let first = select! {
                command = commands.recv() => command,
                _ = kill.cancelled() => {
                    trace!("link closed by broker");
                    return;
                }
            };
            let Some(first) = first else {
                debug!("client went away");
                self.state.lock().await.detach(id, None);
                return;
            };

            let mut state = self.state.lock().await;
            let mut next = Some(first);
            let mut applied = 0;
            while let Some(command) = next {
                if command == Command::Close {
                    debug!("client closed the link");
                    state.detach(id, None);
                    return;
                }
                state.apply(id, command);
                if !state.links.contains_key(&id) {
                    return;
                }
                applied += 1;
                if applied == COMMAND_BURST {
                    break;
                }
                next = commands.try_recv().ok();
            }
            state.flush_confirms(id);
        }
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, addr: SocketAddr) -> Result<Connection, Error> {
        let mut state = self.state.lock().await;
        match state.nodes.get(&addr) {
            Some(true) => {}
            Some(false) => Err(Error::NodeUnavailable(addr))?,
            None => Err(Error::UnknownNode(addr))?,
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let id = state.next_link_id;
        state.next_link_id += 1;
        state.links.insert(
            id,
            Link {
                node: addr,
                events: events_tx,
                kill: kill.clone(),
                confirm_mode: false,
                next_publish_tag: 1,
                unflushed_confirms: Vec::new(),
                prefetch: 0,
                next_delivery_tag: 1,
                unacked: BTreeMap::new(),
                consuming: Vec::new(),
            },
        );
        drop(state);

        let span = debug_span!("memory_link", node = %addr, link = id);
        tokio::spawn(self.clone().run_link(id, commands_rx, kill).instrument(span));
        debug!("opened link {} on node {}", id, addr);
        Ok(Connection::new(addr, commands_tx, events_rx))
    }
}

impl State {
    fn apply(&mut self, id: LinkID, command: Command) {
        match command {
            Command::ConfirmSelect => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.confirm_mode = true;
                }
            }
            Command::Publish(message) => self.publish(id, message),
            Command::Qos { prefetch } => {
                let consuming = match self.links.get_mut(&id) {
                    Some(link) => {
                        link.prefetch = prefetch;
                        link.consuming.clone()
                    }
                    None => return,
                };
                for queue in consuming {
                    self.dispatch(&queue);
                }
            }
            Command::Consume { queue } => {
                match self.queues.get_mut(&queue) {
                    Some(q) => q.consumers.push(id),
                    None => {
                        warn!("consume on unknown queue '{}', closing link", queue);
                        self.detach(
                            id,
                            Some(CloseCause::Administrative {
                                code: CLOSE_NOT_FOUND,
                                reason: format!("no queue '{queue}'"),
                            }),
                        );
                        return;
                    }
                }
                if let Some(link) = self.links.get_mut(&id) {
                    link.consuming.push(queue.clone());
                }
                self.dispatch(&queue);
            }
            Command::Ack { delivery_tag } => {
                let acked = self
                    .links
                    .get_mut(&id)
                    .and_then(|link| link.unacked.remove(&delivery_tag));
                match acked {
                    Some((queue, _)) => self.dispatch(&queue),
                    None => warn!("ack for unknown delivery tag {}", delivery_tag),
                }
            }
            Command::Close => self.detach(id, None),
        }
    }

    fn publish(&mut self, id: LinkID, message: Message) {
        self.published += 1;
        let polarity = match self.route(&message.exchange, &message.routing_key) {
            None => {
                warn!("publish to unknown exchange '{}'", message.exchange);
                Polarity::Negative
            }
            Some(queues) if queues.is_empty() => {
                if message.mandatory {
                    if let Some(link) = self.links.get(&id) {
                        let _ = link.events.send(Event::Returned {
                            exchange: message.exchange.clone(),
                            routing_key: message.routing_key.clone(),
                            properties: message.properties.clone(),
                            body: message.body.clone(),
                        });
                    }
                }
                trace!(
                    "message to '{}' with key '{}' matched no queue",
                    message.exchange,
                    message.routing_key
                );
                Polarity::Positive
            }
            Some(queues) => {
                let stored = Stored {
                    body: message.body,
                    properties: message.properties,
                    redelivered: false,
                };
                for queue in &queues {
                    if let Some(q) = self.queues.get_mut(queue) {
                        q.ready.push_back(stored.clone());
                    }
                }
                for queue in &queues {
                    self.dispatch(queue);
                }
                Polarity::Positive
            }
        };

        if let Some(link) = self.links.get_mut(&id) {
            if link.confirm_mode {
                let tag = link.next_publish_tag;
                link.next_publish_tag += 1;
                link.unflushed_confirms.push((tag, polarity));
            }
        }
    }

    /// Returns the queues a message goes to, or `None` if the exchange
    /// doesn't exist.
    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_owned())
                    .into_iter()
                    .collect(),
            );
        }
        let ring = self.exchanges.get(exchange)?;
        Some(ring.route(routing_key).map(str::to_owned).into_iter().collect())
    }

    /// Hands ready messages of a queue to consumers with spare prefetch,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&index| {
                    self.links
                        .get(&queue.consumers[index])
                        .map_or(false, Link::has_capacity)
                });
            let Some(index) = chosen else {
                return;
            };
            queue.next_consumer = (index + 1) % count;
            let link_id = queue.consumers[index];
            let Some(stored) = queue.ready.pop_front() else {
                return;
            };
            let Some(link) = self.links.get_mut(&link_id) else {
                queue.ready.push_front(stored);
                queue.consumers.remove(index);
                continue;
            };

            let delivery_tag = link.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                redelivered: stored.redelivered,
                body: stored.body.clone(),
                properties: stored.properties.clone(),
            };
            if link.events.send(Event::Delivery(delivery)).is_err() {
                // the client is gone, its link task will detach it
                queue.ready.push_front(stored);
                queue.consumers.remove(index);
                continue;
            }
            link.next_delivery_tag += 1;
            link.unacked.insert(delivery_tag, (queue_name.to_owned(), stored));
        }
    }

    /// Sends accumulated confirms, one per run of equal polarity. A run
    /// longer than one tag goes out as a cumulative confirm; every tag
    /// before the run was already confirmed, so it covers exactly the run.
    fn flush_confirms(&mut self, id: LinkID) {
        if self.hold_confirms {
            return;
        }
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        let pending = std::mem::take(&mut link.unflushed_confirms);
        let mut iter = pending.into_iter().peekable();
        while let Some((first_tag, polarity)) = iter.next() {
            let mut last_tag = first_tag;
            while let Some(&(tag, next_polarity)) = iter.peek() {
                if next_polarity != polarity {
                    break;
                }
                last_tag = tag;
                iter.next();
            }
            let _ = link.events.send(Event::Confirm(Confirm {
                delivery_tag: last_tag,
                multiple: last_tag > first_tag,
                polarity,
            }));
        }
    }

    fn close_node_links(&mut self, node: SocketAddr, cause: CloseCause) -> usize {
        let ids: Vec<LinkID> = self
            .links
            .iter()
            .filter(|(_, link)| link.node == node)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.detach(*id, Some(cause.clone()));
        }
        ids.len()
    }

    /// Removes a link, putting its unacknowledged deliveries back at the head
    /// of their queues. With a cause, the client is told why.
    fn detach(&mut self, id: LinkID, cause: Option<CloseCause>) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        for queue in &link.consuming {
            if let Some(q) = self.queues.get_mut(queue) {
                q.consumers.retain(|consumer| *consumer != id);
                q.next_consumer = 0;
            }
        }
        let requeued = link.unacked.len();
        for (_, (queue, mut stored)) in link.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                stored.redelivered = true;
                q.ready.push_front(stored);
            }
        }
        if requeued > 0 {
            debug!("requeued {} unacknowledged messages from link {}", requeued, id);
        }
        if let Some(cause) = cause {
            let _ = link.events.send(Event::Closed(cause));
        }
        link.kill.cancel();
        for queue in &link.consuming {
            self.dispatch(queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn cluster_with_queue(queue: &str) -> MemoryCluster {
        let cluster = MemoryCluster::with_nodes(&[addr(1), addr(2)]).await;
        cluster.declare_queue(queue).await;
        cluster
    }

    fn plain(queue: &str, body: &str) -> Message {
        Message::builder().routing_key(queue).body(body).build()
    }

    async fn next_confirm(conn: &mut Connection) -> Confirm {
        match conn.next_event().await {
            Some(Event::Confirm(confirm)) => confirm,
            other => panic!("expected a confirm, got {other:?}"),
        }
    }

    async fn next_delivery(conn: &mut Connection) -> Delivery {
        match conn.next_event().await {
            Some(Event::Delivery(delivery)) => delivery,
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_unknown_and_down_nodes() {
        let cluster = cluster_with_queue("q").await;
        assert!(matches!(
            cluster.connect(addr(9)).await,
            Err(Error::UnknownNode(_))
        ));
        cluster.set_node_up(addr(2), false).await.unwrap();
        assert!(matches!(
            cluster.connect(addr(2)).await,
            Err(Error::NodeUnavailable(_))
        ));
        assert!(cluster.connect(addr(1)).await.is_ok());
    }

    #[tokio::test]
    async fn burst_of_publishes_is_confirmed_cumulatively() {
        let cluster = cluster_with_queue("q").await;
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.confirm_select().unwrap();
        for i in 1..=5 {
            conn.publish(plain("q", &i.to_string())).unwrap();
        }
        let confirm = next_confirm(&mut conn).await;
        assert_eq!(
            confirm,
            Confirm {
                delivery_tag: 5,
                multiple: true,
                polarity: Polarity::Positive
            }
        );
        assert_eq!(cluster.queue_depth("q").await, Some(5));
    }

    #[tokio::test]
    async fn unknown_exchange_is_nacked() {
        let cluster = cluster_with_queue("q").await;
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.confirm_select().unwrap();
        conn.publish(Message::builder().exchange("nope").routing_key("1").body("1").build())
            .unwrap();
        let confirm = next_confirm(&mut conn).await;
        assert_eq!(confirm.polarity, Polarity::Negative);
        assert!(!confirm.multiple);
    }

    #[tokio::test]
    async fn unroutable_mandatory_message_is_returned_then_acked() {
        let cluster = cluster_with_queue("q").await;
        cluster.declare_hash_exchange("hashing").await;
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.confirm_select().unwrap();
        conn.publish(
            Message::builder()
                .exchange("hashing")
                .routing_key("1")
                .mandatory(true)
                .body("a=1")
                .build(),
        )
        .unwrap();
        assert!(matches!(
            conn.next_event().await,
            Some(Event::Returned { .. })
        ));
        assert_eq!(next_confirm(&mut conn).await.polarity, Polarity::Positive);
    }

    #[tokio::test]
    async fn hash_exchange_routes_a_key_to_one_queue() {
        let cluster = MemoryCluster::with_nodes(&[addr(1)]).await;
        cluster.declare_hash_exchange("hashing").await;
        for queue in ["h001", "h002", "h003"] {
            cluster.declare_queue(queue).await;
            cluster.bind(queue, "hashing", 10).await.unwrap();
        }
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.confirm_select().unwrap();
        for i in 0..30 {
            conn.publish(
                Message::builder()
                    .exchange("hashing")
                    .routing_key("7")
                    .body(format!("h={i}"))
                    .build(),
            )
            .unwrap();
        }
        next_confirm(&mut conn).await;
        let mut depths = Vec::new();
        for queue in ["h001", "h002", "h003"] {
            depths.push(cluster.queue_depth(queue).await.unwrap());
        }
        depths.sort();
        assert_eq!(depths, vec![0, 0, 30]);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let cluster = cluster_with_queue("q").await;
        let mut publisher = cluster.connect(addr(1)).await.unwrap();
        for i in 1..=3 {
            publisher.publish(plain("q", &i.to_string())).unwrap();
        }
        publisher.close();

        let mut consumer = cluster.connect(addr(2)).await.unwrap();
        consumer.qos(1).unwrap();
        consumer.consume("q").unwrap();
        let first = next_delivery(&mut consumer).await;
        assert_eq!(first.body, b"1");
        assert_eq!(first.delivery_tag, 1);
        tokio::task::yield_now().await;
        assert!(consumer.try_next_event().is_none());
        consumer.ack(first.delivery_tag).unwrap();
        let second = next_delivery(&mut consumer).await;
        assert_eq!(second.body, b"2");
        assert_eq!(second.delivery_tag, 2);
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_link_loss() {
        let cluster = cluster_with_queue("q").await;
        let publisher = cluster.connect(addr(1)).await.unwrap();
        publisher.publish(plain("q", "1")).unwrap();
        publisher.publish(plain("q", "2")).unwrap();

        let mut first = cluster.connect(addr(2)).await.unwrap();
        first.qos(10).unwrap();
        first.consume("q").unwrap();
        next_delivery(&mut first).await;
        next_delivery(&mut first).await;

        let closed = cluster
            .close_node_connections(addr(2), CloseCause::Io("test".into()))
            .await;
        assert_eq!(closed, 1);
        assert!(matches!(
            first.next_event().await,
            Some(Event::Closed(CloseCause::Io(_)))
        ));
        assert_eq!(cluster.queue_depth("q").await, Some(2));

        let mut second = cluster.connect(addr(1)).await.unwrap();
        second.consume("q").unwrap();
        let again = next_delivery(&mut second).await;
        assert_eq!(again.body, b"1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn consuming_unknown_queue_closes_the_link() {
        let cluster = cluster_with_queue("q").await;
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.consume("missing").unwrap();
        match conn.next_event().await {
            Some(Event::Closed(CloseCause::Administrative { code, .. })) => {
                assert_eq!(code, CLOSE_NOT_FOUND)
            }
            other => panic!("expected a close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn held_confirms_flush_on_release() {
        let cluster = cluster_with_queue("q").await;
        cluster.hold_confirms(true).await;
        let mut conn = cluster.connect(addr(1)).await.unwrap();
        conn.confirm_select().unwrap();
        for i in 1..=3 {
            conn.publish(plain("q", &i.to_string())).unwrap();
        }
        tokio::task::yield_now().await;
        assert!(conn.try_next_event().is_none());
        cluster.hold_confirms(false).await;
        assert_eq!(next_confirm(&mut conn).await.delivery_tag, 3);
    }
}
