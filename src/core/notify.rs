//! Purpose: Wait policies and deadline bookkeeping for blocking ring operations.
//! Exports: `Wait`, `Deadline`.
//! Role: Shared vocabulary for space waits, blocking reads and writer handoff.
//! Invariants: `Wait::Never` never sleeps; `Wait::Forever` only returns on a wake.

use std::time::{Duration, Instant};

/// How long a caller is willing to block when a ring operation cannot
/// proceed immediately (no data to read, no space to write, writer busy).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wait {
    /// Fail fast: the operation reports its no-progress error immediately.
    Never,
    /// Block up to the given duration, then fail with `Timeout`.
    For(Duration),
    /// Block until progress is possible, the ring closes, or an interrupt.
    Forever,
}

impl Wait {
    pub(crate) fn blocks(self) -> bool {
        !matches!(self, Wait::Never)
    }
}

/// Countdown companion to a `Wait`, started when a blocking operation
/// first finds it cannot proceed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub(crate) fn start(wait: Wait) -> Self {
        let end = match wait {
            Wait::Never => Some(Instant::now()),
            Wait::For(timeout) => Some(Instant::now() + timeout),
            Wait::Forever => None,
        };
        Self { end }
    }

    /// Time left. `None` means unbounded; `Some(ZERO)` means expired.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::{Deadline, Wait};
    use std::time::Duration;

    #[test]
    fn never_does_not_block() {
        assert!(!Wait::Never.blocks());
        assert!(Wait::For(Duration::from_millis(1)).blocks());
        assert!(Wait::Forever.blocks());
    }

    #[test]
    fn bounded_deadline_counts_down() {
        let deadline = Deadline::start(Wait::For(Duration::from_secs(60)));
        let remaining = deadline.remaining().expect("bounded");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
        assert!(!deadline.expired());
    }

    #[test]
    fn zero_wait_is_immediately_expired() {
        let deadline = Deadline::start(Wait::For(Duration::ZERO));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn forever_never_expires() {
        let deadline = Deadline::start(Wait::Forever);
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.expired());
    }
}
