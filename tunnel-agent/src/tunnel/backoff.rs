//! Reconnection backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff for the reconnect loop: the delay doubles per failed
/// attempt up to a cap, with uniform jitter so a fleet of agents does not
/// reconnect in lockstep after a backend restart.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Base delay of the next attempt, before jitter.
    #[allow(dead_code)]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to sleep before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        jittered(base)
    }

    /// Reset the schedule (call after a successful connection).
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}
