use std::fmt;

use hashbrown::HashMap;

/// Where a value falls relative to the last one seen for its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    InOrder,
    /// Same value as last time.
    Duplicate,
    /// Values were skipped. Carries the distance from the last value (or
    /// from the expected start for a new key).
    ForwardJump(u64),
    /// The value went backwards by this much.
    BackwardJump(u64),
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::InOrder => write!(f, "in order"),
            Classification::Duplicate => write!(f, "duplicate"),
            Classification::ForwardJump(n) => write!(f, "jumped forward by {n}"),
            Classification::BackwardJump(n) => write!(f, "jumped back by {n}"),
        }
    }
}

/// Tracks the last value seen per producer key. Reports anomalies, never
/// rejects: every classified value becomes the key's last value.
#[derive(Clone, Debug)]
pub struct SequenceValidator {
    expected_start: u64,
    last: HashMap<String, u64>,
}

impl SequenceValidator {
    pub fn new(expected_start: u64) -> Self {
        Self {
            expected_start,
            last: HashMap::new(),
        }
    }

    pub fn classify(&mut self, key: &str, value: u64) -> Classification {
        let classification = match self.last.get(key) {
            None if value == self.expected_start => Classification::InOrder,
            None if value > self.expected_start => {
                Classification::ForwardJump(value - self.expected_start)
            }
            None => Classification::BackwardJump(self.expected_start - value),
            Some(&prev) if value == prev => Classification::Duplicate,
            Some(&prev) if value == prev.saturating_add(1) => Classification::InOrder,
            Some(&prev) if value > prev => Classification::ForwardJump(value - prev),
            Some(&prev) => Classification::BackwardJump(prev - value),
        };
        match self.last.get_mut(key) {
            Some(last) => *last = value,
            None => {
                self.last.insert(key.to_owned(), value);
            }
        }
        classification
    }

    pub fn last(&self, key: &str) -> Option<u64> {
        self.last.get(key).copied()
    }

    /// `key=value` for every tracked key, sorted by key.
    pub fn summary_line(&self) -> String {
        let mut entries: Vec<_> = self.last.iter().collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
