use std::time::Duration;

use tokio::time::Instant;

/// minimum seconds between connection attempts, indexed by the number of attempts so far (mod 8)
const BACKOFF_SECONDS: [u64; 8] = [1, 1, 2, 2, 2, 4, 4, 8];

/// Gates reconnect attempts: an attempt is permitted only if enough time has passed since the
///  previous one. Every permitted attempt counts, regardless of its outcome; a successful
///  connection should [ReconnectBackoff::reset] the policy.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempts: usize,
    last_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new() -> ReconnectBackoff {
        Default::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// the wait required before the next attempt
    pub fn current_delay(&self) -> Duration {
        Duration::from_secs(BACKOFF_SECONDS[self.attempts & 7])
    }

    #[must_use]
    pub fn try_again(&mut self) -> bool {
        self.try_again_at(Instant::now())
    }

    #[must_use]
    pub fn try_again_at(&mut self, now: Instant) -> bool {
        if let Some(last_attempt) = self.last_attempt {
            if now.saturating_duration_since(last_attempt) < self.current_delay() {
                return false;
            }
        }

        self.attempts = self.attempts.wrapping_add(1);
        self.last_attempt = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}
