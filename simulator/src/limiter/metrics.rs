use std::fmt;

/// Running totals for a single producer.
///
/// The three counters always satisfy `executed = succeeded + failed` and are
/// monotonically non-decreasing; snapshots are taken under the producer's
/// lock so readers never observe a partially updated triple.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Number of creations attempted.
    pub executed: u32,
    /// Number of creations that succeeded.
    pub succeeded: u32,
    /// Number of creations that failed.
    pub failed: u32,
}

impl Metrics {
    /// Fold one batch worth of results into the totals.
    pub(crate) fn add(&mut self, executed: u32, succeeded: u32, failed: u32) {
        self.executed += executed;
        self.succeeded += succeeded;
        self.failed += failed;
    }

    /// Component-wise difference against an earlier snapshot.
    ///
    /// Counters are monotone, so the difference never underflows when
    /// `earlier` really was sampled first.
    pub fn delta(&self, earlier: &Metrics) -> Metrics {
        Metrics {
            executed: self.executed - earlier.executed,
            succeeded: self.succeeded - earlier.succeeded,
            failed: self.failed - earlier.failed,
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(executed: {}, succeeded: {}, failed: {})",
            self.executed, self.succeeded, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_the_identity() {
        let mut metrics = Metrics::default();
        metrics.add(3, 2, 1);
        metrics.add(2, 2, 0);
        assert_eq!(metrics.executed, 5);
        assert_eq!(metrics.succeeded, 4);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.executed, metrics.succeeded + metrics.failed);
    }

    #[test]
    fn delta_is_component_wise() {
        let mut earlier = Metrics::default();
        earlier.add(3, 3, 0);
        let mut later = earlier;
        later.add(4, 2, 2);
        assert_eq!(
            later.delta(&earlier),
            Metrics {
                executed: 4,
                succeeded: 2,
                failed: 2
            }
        );
    }

    #[test]
    fn display_matches_the_log_format() {
        let mut metrics = Metrics::default();
        metrics.add(2, 1, 1);
        assert_eq!(
            metrics.to_string(),
            "(executed: 2, succeeded: 1, failed: 1)"
        );
    }
}
