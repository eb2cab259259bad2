use std::thread;
use std::time::{Duration, Instant};

/// How long and how often to poll a device for readiness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Give up after this long without progress.
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Factor the interval grows by after each unsuccessful poll.
    pub backoff: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_interval: Duration::from_micros(100),
            max_interval: Duration::from_millis(10),
            backoff: 2.0,
        }
    }
}

impl PollPolicy {
    /// Constant interval, no backoff.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            timeout,
            initial_interval: interval,
            max_interval: interval,
            backoff: 1.0,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Gave up after {waited:?} ({attempts} polls)")]
pub struct PollTimeout {
    pub waited: Duration,
    pub attempts: u32,
}

/// Sleep-between-polls helper with exponential backoff and an idle deadline.
#[derive(Debug)]
pub(crate) struct Poller {
    policy: PollPolicy,
    interval: Duration,
    started: Instant,
    attempts: u32,
}

impl Poller {
    pub(crate) fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            interval: policy.initial_interval,
            started: Instant::now(),
            attempts: 0,
        }
    }

    /// Wait before the next poll, or time out if the deadline has passed.
    pub(crate) fn wait(&mut self) -> Result<(), PollTimeout> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("Poller::wait");

        self.attempts += 1;
        let waited = self.started.elapsed();
        if waited >= self.policy.timeout {
            return Err(PollTimeout {
                waited,
                attempts: self.attempts,
            });
        }

        let remaining = self.policy.timeout - waited;
        thread::sleep(self.interval.min(remaining));
        self.interval = self
            .interval
            .mul_f64(self.policy.backoff.max(1.0))
            .min(self.policy.max_interval.max(self.policy.initial_interval));
        Ok(())
    }

    /// Progress was made: restart the deadline and the backoff.
    pub(crate) fn reset(&mut self) {
        self.started = Instant::now();
        self.interval = self.policy.initial_interval;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_out() {
        let mut poller = Poller::new(PollPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)));
        let mut polls = 0;
        let timeout = loop {
            match poller.wait() {
                Ok(()) => polls += 1,
                Err(timeout) => break timeout,
            }
            assert!(polls < 1000);
        };
        assert!(timeout.waited >= Duration::from_millis(5));
        assert_eq!(timeout.attempts, polls + 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            timeout: Duration::from_secs(1),
            initial_interval: Duration::from_micros(10),
            max_interval: Duration::from_micros(40),
            backoff: 2.0,
        };
        let mut poller = Poller::new(policy);
        for _ in 0..4 {
            poller.wait().unwrap();
        }
        assert_eq!(poller.interval, Duration::from_micros(40));

        poller.reset();
        assert_eq!(poller.interval, Duration::from_micros(10));
        assert_eq!(poller.attempts(), 4);
    }
}
