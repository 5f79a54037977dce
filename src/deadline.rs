use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

/// Absolute expiry time of a submitted transfer on the monotonic clock.
///
/// The unset deadline (infinite timeout) orders after every set deadline, so
/// an ascending sort puts transfers that can never expire at the end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const NONE: Deadline = Deadline(None);

    /// Deadline `timeout` from now. A zero timeout means no deadline.
    pub fn after(timeout: Duration) -> Deadline {
        if timeout.is_zero() {
            Deadline(None)
        } else {
            Deadline(Some(Instant::now() + timeout))
        }
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn expired_at(&self, now: Instant) -> bool {
        self.0.is_some_and(|t| t <= now)
    }

    /// Time remaining until the deadline, clamped at zero once expired.
    /// `None` if the deadline is unset.
    pub fn until(&self, now: Instant) -> Option<Duration> {
        self.0.map(|t| t.saturating_duration_since(now))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
