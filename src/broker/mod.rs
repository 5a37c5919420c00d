// The broker link is modelled as two ordered queues: commands flow from the
// client to the broker and events flow back. Nothing on the client side ever
// handles two events at once, which is what keeps confirmation counting
// deterministic for a given run.
//
// Two transports produce a `Connection`. The in-process cluster in `memory`
// is the broker itself, shared by every node it hosts. `endpoint` carries the
// same commands and events across a QUIC stream so that publishers and
// consumers can run as separate processes against a `sequin node`.

use std::{fmt, net::SocketAddr};

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

pub mod endpoint;
mod error;
pub mod memory;
pub mod ring;
mod wire;

pub use error::Error;

/// Port a `sequin node` listens on when none is given.
pub const DEFAULT_PORT: u16 = 5701;

/// Close code for a shutdown requested by the operator of either end.
pub const CLOSE_OPERATOR: u32 = 0;
/// Close code for a link the broker's administrator forced closed.
pub const CLOSE_ADMINISTRATIVE: u32 = 320;
/// Close code for a link dropped because its node failed.
pub const CLOSE_IO: u32 = 541;
/// Close code sent when a command names a queue that doesn't exist.
pub const CLOSE_NOT_FOUND: u32 = 404;

/// Message properties the pipeline cares about.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Properties {
    pub content_type: Option<String>,
    /// Persistent messages survive a broker restart on real brokers. The
    /// in-process cluster keeps everything in memory regardless.
    pub persistent: bool,
    pub correlation_id: Option<String>,
}

/// An outgoing message.
#[derive(Archive, Serialize, Deserialize, TypedBuilder, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Message {
    /// The exchange to publish to. The empty name is the default exchange,
    /// which routes straight to the queue named by the routing key.
    #[builder(default, setter(into))]
    pub exchange: String,
    #[builder(setter(into))]
    pub routing_key: String,
    /// Ask the broker to hand the message back if no queue takes it.
    #[builder(default)]
    pub mandatory: bool,
    #[builder(setter(into))]
    pub body: Vec<u8>,
    #[builder(default)]
    pub properties: Properties,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Polarity {
    Positive,
    Negative,
}

/// A publisher confirmation. With `multiple` set it covers every
/// unconfirmed tag up to and including `delivery_tag`.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub polarity: Polarity,
}

/// A message handed to a consumer.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Set when the message was handed out before and never acknowledged.
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// Why a link went away.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum CloseCause {
    /// Someone asked for a clean shutdown. Never retried.
    Operator,
    /// The broker closed the link on purpose.
    Administrative { code: u32, reason: String },
    /// The link or its node failed.
    Io(String),
}

impl CloseCause {
    /// Returns the close code carried on the QUIC link for this cause.
    pub fn code(&self) -> u32 {
        match self {
            CloseCause::Operator => CLOSE_OPERATOR,
            CloseCause::Administrative { code, .. } => *code,
            CloseCause::Io(_) => CLOSE_IO,
        }
    }

    /// Rebuilds a cause from a close code and reason.
    pub fn from_code(code: u32, reason: String) -> Self {
        match code {
            CLOSE_OPERATOR => CloseCause::Operator,
            CLOSE_IO => CloseCause::Io(reason),
            code => CloseCause::Administrative { code, reason },
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CloseCause::Operator => "closed by operator",
            CloseCause::Administrative { reason, .. } => reason,
            CloseCause::Io(reason) => reason,
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Operator => write!(f, "operator requested close"),
            CloseCause::Administrative { code, reason } => {
                write!(f, "administrative close ({code}): {reason}")
            }
            CloseCause::Io(reason) => write!(f, "i/o failure: {reason}"),
        }
    }
}

/// Client to broker.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Command {
    /// Put the link into confirm mode. Publishes from here on get tags
    /// starting at 1.
    ConfirmSelect,
    Publish(Message),
    /// Limit unacknowledged deliveries on this link. Zero means unlimited.
    Qos { prefetch: u16 },
    Consume { queue: String },
    Ack { delivery_tag: u64 },
    Close,
}

/// Broker to client, in the order the broker produced them.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Event {
    Confirm(Confirm),
    /// A mandatory message that no queue took.
    Returned {
        exchange: String,
        routing_key: String,
        properties: Properties,
        body: Vec<u8>,
    },
    Delivery(Delivery),
    /// Always the last event on a link.
    Closed(CloseCause),
}

/// One open link to a broker node.
///
/// Commands are queued without waiting for the broker; the only thing that
/// can fail is the link itself being gone.
pub struct Connection {
    remote_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    closed: bool,
    closed_locally: bool,
}

impl Connection {
    pub fn new(
        remote_addr: SocketAddr,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            remote_addr,
            commands,
            events,
            closed: false,
            closed_locally: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// False once the link closed, either side asked to close it, or the
    /// transport stopped accepting commands.
    pub fn is_open(&self) -> bool {
        !self.closed && !self.commands.is_closed()
    }

    pub(crate) fn submit(&self, command: Command) -> Result<(), Error> {
        if self.closed {
            Err(Error::Closed)?
        }
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    pub fn confirm_select(&self) -> Result<(), Error> {
        self.submit(Command::ConfirmSelect)
    }

    pub fn publish(&self, message: Message) -> Result<(), Error> {
        self.submit(Command::Publish(message))
    }

    pub fn qos(&self, prefetch: u16) -> Result<(), Error> {
        self.submit(Command::Qos { prefetch })
    }

    pub fn consume(&self, queue: &str) -> Result<(), Error> {
        self.submit(Command::Consume {
            queue: queue.to_owned(),
        })
    }

    pub fn ack(&self, delivery_tag: u64) -> Result<(), Error> {
        self.submit(Command::Ack { delivery_tag })
    }

    /// Waits for the next event. Returns `None` once the link is gone and
    /// every event before that was consumed.
    pub async fn next_event(&mut self) -> Option<Event> {
        let event = self.events.recv().await;
        self.observe(&event);
        event
    }

    /// Returns an event that already arrived, without waiting.
    pub fn try_next_event(&mut self) -> Option<Event> {
        let event = self.events.try_recv().ok();
        if let Some(Event::Closed(_)) = event {
            self.closed = true;
        }
        event
    }

    fn observe(&mut self, event: &Option<Event>) {
        if matches!(event, Some(Event::Closed(_)) | None) {
            self.closed = true;
        }
    }

    /// Asks the broker for a clean close. Further commands fail.
    pub fn close(&mut self) {
        if !self.closed {
            let _ = self.commands.send(Command::Close);
            self.closed = true;
            self.closed_locally = true;
        }
    }

    /// Whether this side asked for the close.
    pub fn closed_locally(&self) -> bool {
        self.closed_locally
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Opens links to broker nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Connection, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_round_trip_to_causes() {
        let causes = [
            CloseCause::Operator,
            CloseCause::Io("node down".into()),
            CloseCause::Administrative {
                code: CLOSE_ADMINISTRATIVE,
                reason: "forced".into(),
            },
        ];
        for cause in causes {
            let rebuilt = CloseCause::from_code(cause.code(), cause.reason().into());
            assert_eq!(cause, rebuilt);
        }
    }

    #[tokio::test]
    async fn commands_fail_once_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new("127.0.0.1:1".parse().unwrap(), tx, events_rx);
        assert!(conn.is_open());
        conn.ack(1).unwrap();
        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(conn.ack(2), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn closed_event_marks_connection_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new("127.0.0.1:1".parse().unwrap(), tx, events_rx);
        events_tx
            .send(Event::Closed(CloseCause::Io("gone".into())))
            .unwrap();
        assert!(matches!(conn.next_event().await, Some(Event::Closed(_))));
        assert!(!conn.is_open());
    }
}
