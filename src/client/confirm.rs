use std::{collections::BTreeMap, fmt};

use tracing::{info, warn};

use crate::{
    broker::{CloseCause, Confirm, Polarity, CLOSE_NOT_FOUND},
    hex::body_display,
};

/// What one confirmation did to the tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending tags this confirmation removed.
    pub resolved: u64,
    /// The highest progress watermark crossed, if any.
    pub progress: Option<u64>,
    /// Set on the one confirmation that reached the target.
    pub completed: bool,
}

/// Counters at a point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub issued: u64,
    pub positive: u64,
    pub negative: u64,
    pub pending: u64,
    pub returned: u64,
    pub anomalies: u64,
    pub abandoned: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} positive and {} negative confirms for {} published ({} pending, {} returned, {} unknown tags, {} abandoned)",
            self.positive,
            self.negative,
            self.issued,
            self.pending,
            self.returned,
            self.anomalies,
            self.abandoned,
        )
    }
}

/// What became of a published position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Published, no confirmation yet.
    PendingResponse,
    Success,
    /// The broker nacked it.
    Failed,
    /// No queue took it; the broker returned it.
    Unroutable,
    /// Its channel closed before a confirmation arrived.
    PossiblyLost,
    /// Its channel was closed because the exchange doesn't exist.
    NoExchangeFound,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SendStatus::PendingResponse => "pending",
            SendStatus::Success => "delivered",
            SendStatus::Failed => "failed",
            SendStatus::Unroutable => "unroutable",
            SendStatus::PossiblyLost => "possibly lost",
            SendStatus::NoExchangeFound => "no exchange",
        })
    }
}

/// Positions that didn't end in a plain positive confirmation, in publish
/// order. Nothing here is resent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Undelivered {
    pub failed: Vec<u64>,
    pub unroutable: Vec<u64>,
    pub possibly_lost: Vec<u64>,
    pub no_exchange: Vec<u64>,
}

impl Undelivered {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
            && self.unroutable.is_empty()
            && self.possibly_lost.is_empty()
            && self.no_exchange.is_empty()
    }

    /// Each list with the status its positions ended in.
    pub fn by_status(&self) -> [(SendStatus, &[u64]); 4] {
        [
            (SendStatus::Failed, self.failed.as_slice()),
            (SendStatus::Unroutable, self.unroutable.as_slice()),
            (SendStatus::PossiblyLost, self.possibly_lost.as_slice()),
            (SendStatus::NoExchangeFound, self.no_exchange.as_slice()),
        ]
    }

    /// The recorded status of `position`, `Success` if none was recorded.
    #[cfg(test)]
    fn status_of(&self, position: u64) -> SendStatus {
        self.by_status()
            .into_iter()
            .find(|(_, positions)| positions.binary_search(&position).is_ok())
            .map_or(SendStatus::Success, |(status, _)| status)
    }
}

impl fmt::Display for Undelivered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (status, positions)) in self.by_status().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} [{}]", status, Ranges(positions))?;
        }
        Ok(())
    }
}

/// Sorted positions written as `1-3,7`.
struct Ranges<'a>(&'a [u64]);

impl fmt::Display for Ranges<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0.iter().copied().peekable();
        let mut first = true;
        while let Some(start) = rest.next() {
            let mut end = start;
            while rest.peek() == Some(&(end + 1)) {
                end += 1;
                rest.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

/// Publisher-side bookkeeping of every message the broker hasn't confirmed
/// yet.
///
/// Tags are assigned here in the same order the broker assigns them on the
/// channel, starting at 1. A tag leaves the pending set exactly once; a
/// confirmation naming a tag that is no longer pending is counted as an
/// anomaly and changes nothing else. Every tag remembers the position it
/// carried, so positions that weren't delivered can be reported.
pub struct ConfirmTracker {
    target: u64,
    progress_every: u64,
    pending: BTreeMap<u64, u64>,
    undelivered: Undelivered,
    next_tag: u64,
    issued: u64,
    positive: u64,
    negative: u64,
    returned: u64,
    anomalies: u64,
    abandoned: u64,
    watermark: u64,
    completed: bool,
}

impl ConfirmTracker {
    pub fn new(target: u64, progress_every: u64) -> Self {
        Self {
            target,
            progress_every,
            pending: BTreeMap::new(),
            undelivered: Undelivered::default(),
            next_tag: 1,
            issued: 0,
            positive: 0,
            negative: 0,
            returned: 0,
            anomalies: 0,
            abandoned: 0,
            watermark: 0,
            completed: false,
        }
    }

    /// Records the publish of `position` and returns the tag the broker
    /// will confirm it under. Positions must increase.
    pub fn on_publish(&mut self, position: u64) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.issued += 1;
        self.pending.insert(tag, position);
        tag
    }

    pub fn on_ack(&mut self, delivery_tag: u64, multiple: bool) -> Resolution {
        self.resolve(delivery_tag, multiple, Polarity::Positive)
    }

    pub fn on_nack(&mut self, delivery_tag: u64, multiple: bool) -> Resolution {
        self.resolve(delivery_tag, multiple, Polarity::Negative)
    }

    pub fn on_confirm(&mut self, confirm: &Confirm) -> Resolution {
        self.resolve(confirm.delivery_tag, confirm.multiple, confirm.polarity)
    }

    /// A message no queue took. Its tag stays pending; the broker confirms
    /// it separately. `position` is the returned message's position when it
    /// could be recovered from it.
    pub fn on_return(&mut self, position: Option<u64>, routing_key: &str, body: &[u8]) {
        self.returned += 1;
        warn!(
            "undeliverable: {} (routing key {:?})",
            body_display(body),
            routing_key
        );
        if let Some(position) = position {
            insert_sorted(&mut self.undelivered.unroutable, position);
        }
    }

    /// Drops every tag of a channel that went away. The next channel numbers
    /// its publishes from 1 again. Returns how many tags were abandoned.
    pub fn reset_channel(&mut self, cause: &CloseCause) -> u64 {
        let abandoned = self.pending.len() as u64;
        if abandoned > 0 {
            warn!("abandoning {} unconfirmed publishes: {}", abandoned, cause);
        }
        let lost = match cause {
            CloseCause::Administrative { code, .. } if *code == CLOSE_NOT_FOUND => {
                &mut self.undelivered.no_exchange
            }
            _ => &mut self.undelivered.possibly_lost,
        };
        lost.extend(std::mem::take(&mut self.pending).into_values());
        self.abandoned += abandoned;
        self.next_tag = 1;
        abandoned
    }

    fn resolve(&mut self, delivery_tag: u64, multiple: bool, polarity: Polarity) -> Resolution {
        let covered = if multiple {
            let above = match delivery_tag.checked_add(1) {
                Some(first_above) => self.pending.split_off(&first_above),
                None => BTreeMap::new(),
            };
            std::mem::replace(&mut self.pending, above)
        } else {
            self.pending
                .remove_entry(&delivery_tag)
                .into_iter()
                .collect()
        };
        let resolved = covered.len() as u64;

        if resolved == 0 {
            self.anomalies += 1;
            warn!(
                "could not remove delivery tag {} (multiple: {})",
                delivery_tag, multiple
            );
            return Resolution::default();
        }

        match polarity {
            Polarity::Positive => self.positive += resolved,
            Polarity::Negative => {
                self.negative += resolved;
                warn!("broker rejected {} publishes up to tag {}", resolved, delivery_tag);
                for position in covered.into_values() {
                    insert_sorted(&mut self.undelivered.failed, position);
                }
            }
        }

        let mut outcome = Resolution {
            resolved,
            ..Default::default()
        };
        if self.progress_every > 0 {
            while self.resolved() >= self.watermark + self.progress_every {
                self.watermark += self.progress_every;
                info!(
                    "{} confirmed: {} positive, {} negative",
                    self.watermark, self.positive, self.negative
                );
                outcome.progress = Some(self.watermark);
            }
        }
        if !self.completed && self.resolved() >= self.target {
            self.completed = true;
            outcome.completed = true;
            info!("target of {} reached: {}", self.target, self.summary());
        }
        outcome
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Positive plus negative confirmations so far.
    pub fn resolved(&self) -> u64 {
        self.positive + self.negative
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Where `position` stands right now.
    #[cfg(test)]
    fn status(&self, position: u64) -> SendStatus {
        if self.pending.values().any(|&pending| pending == position) {
            return SendStatus::PendingResponse;
        }
        self.undelivered.status_of(position)
    }

    pub fn undelivered(&self) -> &Undelivered {
        &self.undelivered
    }

    pub fn summary(&self) -> Summary {
        Summary {
            issued: self.issued,
            positive: self.positive,
            negative: self.negative,
            pending: self.pending.len() as u64,
            returned: self.returned,
            anomalies: self.anomalies,
            abandoned: self.abandoned,
        }
    }
}

/// Positions mostly arrive in order; keeps the list sorted when they don't.
fn insert_sorted(positions: &mut Vec<u64>, position: u64) {
    match positions.last() {
        Some(&last) if last >= position => {
            if let Err(at) = positions.binary_search(&position) {
                positions.insert(at, position);
            }
        }
        _ => positions.push(position),
    }
}
