use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    select,
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    dedup::{DedupFilter, DedupPolicy},
    sequence::SequenceValidator,
};

/// Per-consumer state touched by both the receive path and the idle
/// monitor. Always accessed through [`SharedState`].
pub struct ConsumerState {
    pub dedup: DedupFilter,
    pub validator: SequenceValidator,
    pub last_message: Instant,
}

pub type SharedState = Arc<Mutex<ConsumerState>>;

impl ConsumerState {
    pub fn new(policy: DedupPolicy, expected_start: u64) -> Self {
        Self {
            dedup: DedupFilter::new(policy),
            validator: SequenceValidator::new(expected_start),
            last_message: Instant::now(),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Marks a message as received now and returns the gap since the
    /// previous one.
    pub fn touch(&mut self) -> Duration {
        let now = Instant::now();
        let gap = now.duration_since(self.last_message);
        self.last_message = now;
        gap
    }
}

/// Summarizes and clears consumer state once messages stop arriving.
///
/// Checks run every `tick` under the same lock the receive path holds, so a
/// message is either fully classified before a clear or classified against
/// the cleared state.
pub struct IdleMonitor {
    state: SharedState,
    threshold: Duration,
    tick: Duration,
}

impl IdleMonitor {
    pub fn new(state: SharedState, threshold: Duration, tick: Duration) -> Self {
        Self {
            state,
            threshold,
            tick,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check().await;
                }
            }
        }
        debug!("idle monitor stopped");
    }

    /// Emits and returns the summary line if the consumer is idle with
    /// state to report, clearing that state.
    pub async fn check(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let idle = state.last_message.elapsed();
        let clearable_history =
            state.dedup.policy() == DedupPolicy::ClearOnIdle && !state.dedup.is_empty();
        if idle <= self.threshold || (state.validator.is_empty() && !clearable_history) {
            return None;
        }
        let line = state.validator.summary_line();
        info!(
            "checkpoint at {} after {:.1}s idle: {}",
            Utc::now().format("%H:%M:%S%.3f"),
            idle.as_secs_f64(),
            line
        );
        state.validator.clear();
        state.dedup.on_idle();
        Some(line)
    }
}
