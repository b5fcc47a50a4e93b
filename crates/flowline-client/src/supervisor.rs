use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Linear-backoff reconnect policy: the n-th consecutive attempt waits
/// `base_delay * n`, and the link goes `Disconnected` once the attempt cap
/// is spent. `reset` re-arms the schedule from the first attempt.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    base_delay: Duration,
    max_attempts: u32,
    attempt: u32,
    state: LinkState,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::with_policy(DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempt: 1,
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt, or `None` once the cap is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt > self.max_attempts {
            self.state = LinkState::Disconnected;
            return None;
        }
        let delay = self.base_delay * self.attempt;
        self.attempt += 1;
        self.state = LinkState::Reconnecting;
        Some(delay)
    }

    pub fn on_connected(&mut self) {
        self.attempt = 1;
        self.state = LinkState::Connected;
    }

    pub fn reset(&mut self) {
        self.attempt = 1;
        self.state = LinkState::Disconnected;
    }
}
