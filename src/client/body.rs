use std::{fmt, str};

use crate::broker::{Message, Properties};

/// Producer keys for keyed sequences, in the order positions cycle through
/// them.
pub const KEYS: [&str; 10] = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];

/// Key reported for bodies that are a bare integer.
pub const PLAIN_KEY: &str = "seq";

#[derive(Debug, PartialEq, Eq)]
pub enum BodyError {
    NotUtf8,
    EmptyKey,
    BadValue(String),
    /// A keyed sequence needs between 1 and 10 keys.
    KeyCount(usize),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::NotUtf8 => write!(f, "body is not UTF-8"),
            BodyError::EmptyKey => write!(f, "body has an empty key"),
            BodyError::BadValue(value) => write!(f, "{value:?} is not a sequence number"),
            BodyError::KeyCount(n) => {
                write!(f, "{n} keys requested, 1 to {} supported", KEYS.len())
            }
        }
    }
}

impl std::error::Error for BodyError {}

/// What the publisher puts on the wire for each position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceShape {
    /// The bare position, sent to `queue` through the default exchange.
    Plain { queue: String },
    /// `key=value` bodies cycling over the first `keys` keys, sent to a
    /// hash exchange with the key index as routing key.
    Keyed { exchange: String, keys: usize },
}

impl SequenceShape {
    pub fn plain(queue: impl Into<String>) -> Self {
        SequenceShape::Plain {
            queue: queue.into(),
        }
    }

    pub fn keyed(exchange: impl Into<String>, keys: usize) -> Result<Self, BodyError> {
        if keys == 0 || keys > KEYS.len() {
            Err(BodyError::KeyCount(keys))?
        }
        Ok(SequenceShape::Keyed {
            exchange: exchange.into(),
            keys,
        })
    }

    /// Positions start at 1.
    pub fn body(&self, position: u64) -> String {
        match self {
            SequenceShape::Plain { .. } => position.to_string(),
            SequenceShape::Keyed { keys, .. } => {
                let (index, value) = Self::split(position, *keys);
                format!("{}={}", KEYS[index], value)
            }
        }
    }

    /// Exchange and routing key for `position`.
    pub fn route(&self, position: u64) -> (&str, String) {
        match self {
            SequenceShape::Plain { queue } => ("", queue.clone()),
            SequenceShape::Keyed { exchange, keys } => {
                let (index, _) = Self::split(position, *keys);
                (exchange.as_str(), index.to_string())
            }
        }
    }

    pub fn message(&self, position: u64, correlation_id: String, mandatory: bool) -> Message {
        let (exchange, routing_key) = self.route(position);
        Message::builder()
            .exchange(exchange)
            .routing_key(routing_key)
            .mandatory(mandatory)
            .body(self.body(position))
            .properties(Properties {
                content_type: Some("text/plain".into()),
                persistent: true,
                correlation_id: Some(correlation_id),
            })
            .build()
    }

    fn split(position: u64, keys: usize) -> (usize, u64) {
        let keys = keys as u64;
        let zero_based = position.saturating_sub(1);
        ((zero_based % keys) as usize, zero_based / keys + 1)
    }
}

/// A parsed `key=value` or bare-integer body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencedBody {
    pub key: String,
    pub value: u64,
}

impl SequencedBody {
    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        let text = str::from_utf8(body).map_err(|_| BodyError::NotUtf8)?.trim();
        let (key, value) = match text.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (PLAIN_KEY, text),
        };
        if key.is_empty() {
            Err(BodyError::EmptyKey)?
        }
        let value = value
            .parse()
            .map_err(|_| BodyError::BadValue(value.to_owned()))?;
        Ok(Self {
            key: key.to_owned(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_positions_cycle_keys_then_values() {
        let shape = SequenceShape::keyed("hashing", 3).unwrap();
        let bodies: Vec<_> = (1..=7).map(|p| shape.body(p)).collect();
        assert_eq!(bodies, ["a=1", "b=1", "c=1", "a=2", "b=2", "c=2", "a=3"]);
        assert_eq!(shape.route(5), ("hashing", "1".to_owned()));
    }

    #[test]
    fn plain_positions_go_to_the_queue() {
        let shape = SequenceShape::plain("sequence");
        let message = shape.message(42, "run-42".into(), true);
        assert_eq!(message.body, b"42");
        assert_eq!(message.exchange, "");
        assert_eq!(message.routing_key, "sequence");
        assert!(message.mandatory);
        assert!(message.properties.persistent);
        assert_eq!(message.properties.correlation_id.as_deref(), Some("run-42"));
    }

    #[test]
    fn key_count_is_bounded() {
        assert_eq!(SequenceShape::keyed("x", 0), Err(BodyError::KeyCount(0)));
        assert_eq!(SequenceShape::keyed("x", 11), Err(BodyError::KeyCount(11)));
        assert!(SequenceShape::keyed("x", 10).is_ok());
    }

    #[test]
    fn parses_keyed_and_plain_bodies() {
        assert_eq!(
            SequencedBody::parse(b"d=17").unwrap(),
            SequencedBody {
                key: "d".into(),
                value: 17
            }
        );
        assert_eq!(SequencedBody::parse(b"42").unwrap().key, PLAIN_KEY);
        assert_eq!(SequencedBody::parse(b"=3"), Err(BodyError::EmptyKey));
        assert_eq!(
            SequencedBody::parse(b"a=x"),
            Err(BodyError::BadValue("x".into()))
        );
        assert_eq!(SequencedBody::parse(&[0xff, 0xfe]), Err(BodyError::NotUtf8));
    }
}
