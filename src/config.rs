//! Tunables for every pipeline stage. Defaults are the values the demo
//! topology was sized for.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::client::{body::SequenceShape, dedup::DedupPolicy};

/// Publisher backpressure.
#[derive(TypedBuilder, Clone, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    /// Pause once more than this many publishes await confirmation.
    #[builder(default = 10_000)]
    pub high_water: usize,
    /// The pause condition is only sampled at positions divisible by this.
    #[builder(default = 1_000)]
    pub batch: u64,
    #[builder(default = Duration::from_secs(2))]
    pub resume_delay: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Sleep after every node in the roster failed once.
    #[builder(default = Duration::from_secs(5))]
    pub cooldown: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct PublisherConfig {
    /// Number of confirmations (positive or negative) that ends the run.
    pub target: u64,
    pub shape: SequenceShape,
    /// Log a progress line every time this many more messages resolved.
    #[builder(default = 10_000)]
    pub progress_every: u64,
    #[builder(default)]
    pub flow: FlowConfig,
    /// Roster index of the first node to try.
    #[builder(default = 0)]
    pub start_node: usize,
    /// Ask the broker to return messages no queue takes.
    #[builder(default = true)]
    pub mandatory: bool,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct RelayConfig {
    #[builder(setter(into))]
    pub in_queue: String,
    #[builder(setter(into))]
    pub out_queue: String,
    #[builder(default = 1)]
    pub prefetch: u16,
    /// Artificial processing delay bounds, in milliseconds. No delay when
    /// `max_ms` is zero.
    #[builder(default = 0)]
    pub min_ms: u64,
    #[builder(default = 0)]
    pub max_ms: u64,
    #[builder(default = false)]
    pub dedup: bool,
    #[builder(default = DedupPolicy::ClearOnIdle)]
    pub dedup_policy: DedupPolicy,
    /// Dedup history is forgotten when a message arrives after a gap longer
    /// than this.
    #[builder(default = Duration::from_secs(5))]
    pub idle_reset: Duration,
    #[builder(default = 0)]
    pub start_node: usize,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct OutputConfig {
    #[builder(setter(into))]
    pub queue: String,
    #[builder(default = 1)]
    pub prefetch: u16,
    /// First value expected for a key nobody has seen yet.
    #[builder(default = 1)]
    pub expected_start: u64,
    #[builder(default = false)]
    pub dedup: bool,
    #[builder(default = DedupPolicy::ClearOnIdle)]
    pub dedup_policy: DedupPolicy,
    /// State is summarized and cleared after this long without a message.
    #[builder(default = Duration::from_secs(2))]
    pub idle_threshold: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub idle_tick: Duration,
    #[builder(default = 0)]
    pub start_node: usize,
}
