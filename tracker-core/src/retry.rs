//! Bounded retry bookkeeping shared by the parameter and storage paths.
//!
//! Counters are owned by the consumer context and only touched from the
//! control loop, so plain integers suffice.

/// What the caller should do after a transient failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryVerdict {
    /// Re-enqueue the triggering event; carries the attempt number (1-based).
    Retry(u16),
    /// The ceiling was reached; the counter has been cleared.
    Escalate,
}

/// Counts consecutive transient failures against a fixed ceiling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryCounter {
    attempts: u16,
    limit: u16,
}

impl RetryCounter {
    #[must_use]
    pub const fn new(limit: u16) -> Self {
        Self { attempts: 0, limit }
    }

    /// Records one failure.
    ///
    /// The `limit`-th consecutive failure escalates and clears the counter, so
    /// a burst of exactly `limit` failures escalates exactly once.
    pub fn record_failure(&mut self) -> RetryVerdict {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.limit {
            self.attempts = 0;
            RetryVerdict::Escalate
        } else {
            RetryVerdict::Retry(self.attempts)
        }
    }

    /// Clears the counter after a success or a reinit.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[must_use]
    pub const fn attempts(&self) -> u16 {
        self.attempts
    }

    #[must_use]
    pub const fn limit(&self) -> u16 {
        self.limit
    }
}
