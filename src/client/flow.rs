use std::time::Duration;

use tracing::info;

use crate::config::FlowConfig;

/// Sampled backpressure for the publisher.
///
/// The pause condition is only looked at once a position that is a multiple
/// of the batch size has been published. A paused publisher stops issuing
/// publishes for one `resume_delay`, then carries on to the next multiple.
#[derive(Clone, Debug)]
pub struct FlowController {
    config: FlowConfig,
    pauses: u64,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self { config, pauses: 0 }
    }

    /// Whether position `position` is a sampling point.
    pub fn is_sample_point(&self, position: u64) -> bool {
        position % self.config.batch.max(1) == 0
    }

    /// Returns true if publishing must stop after `position` with
    /// `pending` publishes still unconfirmed. Counts the pause.
    pub fn should_pause(&mut self, position: u64, pending: usize) -> bool {
        let pause = self.is_sample_point(position) && pending > self.config.high_water;
        if pause {
            self.pauses += 1;
            info!(
                "{} publishes unconfirmed at position {}, pausing for {:?}",
                pending, position, self.config.resume_delay
            );
        }
        pause
    }

    pub fn resume_delay(&self) -> Duration {
        self.config.resume_delay
    }

    pub fn batch(&self) -> u64 {
        self.config.batch.max(1)
    }

    /// How often publishing paused so far.
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pauses_at_batch_boundaries_above_high_water() {
        let mut flow = FlowController::new(FlowConfig::default());
        assert!(!flow.should_pause(11_000, 10_000));
        assert!(!flow.should_pause(11_001, 10_500));
        assert!(!flow.should_pause(10_999, 50_000));
        assert!(flow.should_pause(11_000, 10_001));
        assert!(flow.should_pause(12_000, 10_001));
        assert_eq!(flow.pauses(), 2);
    }

    #[test]
    fn custom_limits() {
        let mut flow = FlowController::new(
            FlowConfig::builder()
                .high_water(5)
                .batch(10)
                .resume_delay(Duration::from_millis(50))
                .build(),
        );
        assert!(flow.should_pause(20, 6));
        assert!(!flow.should_pause(21, 6));
        assert_eq!(flow.resume_delay(), Duration::from_millis(50));
    }

    #[test]
    fn zero_batch_samples_every_position() {
        let mut flow = FlowController::new(FlowConfig::builder().batch(0).high_water(0).build());
        assert!(flow.should_pause(3, 1));
        assert_eq!(flow.batch(), 1);
    }
}
