/// Reconnect delay schedule: exponential with jitter
use rand::Rng;
use std::time::Duration;

const JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt
    pub fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt, or None once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let base = self.base_delay();
        self.attempt += 1;

        let spread = rand::thread_rng().gen_range(-JITTER..=JITTER);
        let jittered = base.as_secs_f64() * (1.0 + spread);
        Some(Duration::from_secs_f64(jittered).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
