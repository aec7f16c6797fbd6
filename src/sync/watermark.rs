// ABOUTME: Watermark - per-table synchronization progress marker
// ABOUTME: Ordered (last_run_at, last_processed_id) pair that only ever moves forward

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Upper bound of previously synchronized data for one table.
///
/// `last_run_at` is the highest change timestamp (greatest of the create and
/// modify columns) seen in the source, and `last_processed_id` the highest
/// primary key among the rows carrying that timestamp. Ordering is
/// lexicographic over the two fields with "absent" sorting first, which is
/// also how the run log picks the latest successful watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Watermark {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_processed_id: Option<i64>,
}

impl Watermark {
    pub fn new(last_run_at: DateTime<Utc>, last_processed_id: i64) -> Self {
        Self {
            last_run_at: Some(last_run_at),
            last_processed_id: Some(last_processed_id),
        }
    }

    /// The watermark of a table that has never completed a successful run.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.last_run_at.is_none() && self.last_processed_id.is_none()
    }

    /// Lower bound for change detection. Tables without history look back a
    /// bounded window instead of scanning everything.
    pub fn since(&self, now: DateTime<Utc>, lookback: chrono::Duration) -> DateTime<Utc> {
        self.last_run_at.unwrap_or_else(|| {
            now.checked_sub_signed(lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        })
    }

    /// The later of `self` and `candidate`.
    ///
    /// A recorded watermark must never move backwards, so every write goes
    /// through here.
    pub fn advance(self, candidate: Watermark) -> Watermark {
        if candidate < self {
            tracing::warn!(
                "Ignoring watermark regression from {} to {}",
                self,
                candidate
            );
            self
        } else {
            candidate
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.last_run_at, self.last_processed_id) {
            (None, None) => write!(f, "(none)"),
            (at, id) => write!(
                f,
                "({}, id {})",
                at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(Watermark::empty() < Watermark::new(at(1), 1));
        assert!(Watermark::new(at(1), 500) < Watermark::new(at(2), 1));
        assert!(Watermark::new(at(2), 1) < Watermark::new(at(2), 2));
    }

    #[test]
    fn test_advance_never_regresses() {
        let current = Watermark::new(at(5), 103);
        assert_eq!(current.advance(Watermark::new(at(4), 999)), current);
        assert_eq!(current.advance(Watermark::empty()), current);
        let later = Watermark::new(at(6), 1);
        assert_eq!(current.advance(later), later);
    }

    #[test]
    fn test_since_uses_lookback_when_empty() {
        let now = at(12);
        let lookback = chrono::Duration::days(30);
        assert_eq!(Watermark::empty().since(now, lookback), now - lookback);
        assert_eq!(Watermark::new(at(3), 7).since(now, lookback), at(3));

        let huge = chrono::Duration::days(200_000_000);
        assert_eq!(Watermark::empty().since(now, huge), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_display() {
        assert_eq!(Watermark::empty().to_string(), "(none)");
        assert!(Watermark::new(at(1), 103).to_string().contains("id 103"));
    }
}
