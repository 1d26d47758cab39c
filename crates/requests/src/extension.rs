//! Extension sub-record and the per-request daily hour budget.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use campusres_core::{DomainError, DomainResult};

/// Smallest extension that may be requested, in hours.
pub const MIN_EXTENSION_HOURS: f64 = 0.1;
/// Largest single extension, in hours.
pub const MAX_EXTENSION_HOURS: f64 = 3.0;
/// Extension hours a request may be granted per calendar day.
pub const DAILY_EXTENSION_BUDGET_HOURS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExtensionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionStatus::Pending => "PENDING",
            ExtensionStatus::Approved => "APPROVED",
            ExtensionStatus::Rejected => "REJECTED",
        }
    }
}

/// Limits applied to extension requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtensionPolicy {
    pub min_hours: f64,
    pub max_hours: f64,
    pub daily_budget_hours: f64,
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        Self {
            min_hours: MIN_EXTENSION_HOURS,
            max_hours: MAX_EXTENSION_HOURS,
            daily_budget_hours: DAILY_EXTENSION_BUDGET_HOURS,
        }
    }
}

impl ExtensionPolicy {
    /// Validate requested hours and convert them to whole minutes.
    pub fn minutes_for(&self, hours: f64) -> DomainResult<u32> {
        // NaN fails both comparisons.
        if !(hours >= self.min_hours && hours <= self.max_hours) {
            return Err(DomainError::validation(format!(
                "extension hours must be between {} and {}",
                self.min_hours, self.max_hours
            )));
        }
        Ok(hours_to_minutes(hours))
    }

    pub fn daily_budget_minutes(&self) -> u32 {
        hours_to_minutes(self.daily_budget_hours)
    }
}

fn hours_to_minutes(hours: f64) -> u32 {
    (hours * 60.0).round().max(0.0) as u32
}

/// Granted extension minutes for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionBudget {
    pub day: NaiveDate,
    pub used_minutes: u32,
}

impl ExtensionBudget {
    /// Minutes still grantable on `day`. A different day starts fresh.
    pub fn remaining_on(budget: Option<&ExtensionBudget>, day: NaiveDate, policy: &ExtensionPolicy) -> u32 {
        let total = policy.daily_budget_minutes();
        match budget {
            Some(b) if b.day == day => total.saturating_sub(b.used_minutes),
            _ => total,
        }
    }
}

/// Extension embedded in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub minutes: u32,
    pub reason: String,
    pub status: ExtensionStatus,
    /// Calendar day whose budget this extension draws from.
    pub budget_day: NaiveDate,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl Extension {
    pub fn hours(&self) -> f64 {
        f64::from(self.minutes) / 60.0
    }

    pub fn is_pending(&self) -> bool {
        self.status == ExtensionStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_inclusive() {
        let policy = ExtensionPolicy::default();
        assert_eq!(policy.minutes_for(0.1).unwrap(), 6);
        assert_eq!(policy.minutes_for(3.0).unwrap(), 180);
        assert_eq!(policy.minutes_for(1.5).unwrap(), 90);
    }

    #[test]
    fn out_of_range_and_nan_are_rejected() {
        let policy = ExtensionPolicy::default();
        for hours in [3.1, 0.05, 0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(policy.minutes_for(hours), Err(DomainError::Validation(_))), "{hours}");
        }
    }

    #[test]
    fn budget_resets_on_a_new_day() {
        let policy = ExtensionPolicy::default();
        let day = NaiveDate::from_ymd_opt(2030, 3, 1).unwrap();
        let used = ExtensionBudget { day, used_minutes: 150 };
        assert_eq!(ExtensionBudget::remaining_on(Some(&used), day, &policy), 30);
        assert_eq!(
            ExtensionBudget::remaining_on(Some(&used), day.succ_opt().unwrap(), &policy),
            180
        );
        assert_eq!(ExtensionBudget::remaining_on(None, day, &policy), 180);
    }
}
