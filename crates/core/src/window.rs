//! Half-open reservation windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Half-open interval `[start, end)`.
///
/// Construction guarantees `start < end`, so zero-length and inverted windows
/// never reach the capacity math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ValueObject for TimeWindow {}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DomainResult<Self> {
        if end <= start {
            return Err(DomainError::validation("end time must be after start time"));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// `a.start < b.end && b.start < a.end`
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Same start, end pushed back by `by`.
    pub fn extended_by(&self, by: Duration) -> DomainResult<Self> {
        Self::new(self.start, self.end + by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn rejects_zero_length_and_inverted() {
        assert!(TimeWindow::new(at(10), at(10)).is_err());
        assert!(TimeWindow::new(at(12), at(10)).is_err());
    }

    #[test]
    fn touching_windows_do_not_overlap() {
        let a = TimeWindow::new(at(10), at(12)).unwrap();
        let b = TimeWindow::new(at(12), at(13)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn partial_overlap_is_symmetric() {
        let a = TimeWindow::new(at(10), at(12)).unwrap();
        let b = TimeWindow::new(at(11), at(13)).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn extension_keeps_start() {
        let a = TimeWindow::new(at(10), at(12)).unwrap();
        let b = a.extended_by(Duration::minutes(90)).unwrap();
        assert_eq!(b.start(), at(10));
        assert_eq!(b.end(), at(13) + Duration::minutes(30));
    }
}
