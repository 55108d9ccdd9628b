//! Canonical identifier types used across connection and scheduling code.

/// Process-wide monotonically increasing client identifier.
///
/// Ids start at 1; 0 is never allocated so it can serve as an absent-filter sentinel in
/// commands that take an id argument.
pub type ClientId = u64;

/// Index of the event-loop worker thread that owns a connection.
pub type WorkerId = u16;

/// Strongly typed worker-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerCount(u16);

impl WorkerCount {
    /// Creates a validated worker-count value.
    ///
    /// Returns `None` for zero because every connection must have an owning worker.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns `true` when `worker` addresses a valid worker in this pool.
    #[must_use]
    pub fn contains(self, worker: WorkerId) -> bool {
        worker < self.0
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn worker_count_rejects_zero() {
        assert_that!(WorkerCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(u16::MAX)]
    fn worker_count_accepts_positive_values(#[case] input: u16) {
        let count = WorkerCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
        assert_that!(count.contains(input - 1), eq(true));
        assert_that!(count.contains(input), eq(false));
    }
}
