//! Session selection predicates.
//!
//! `SessionFilter` drives non-destructive listing and may be empty, in which
//! case it matches every session. `PruneFilter` carries the same predicates
//! but feeds a destructive candidate search, so an empty one is rejected
//! instead of silently selecting the whole dataset.
//!
//! Date predicates compare a session's `started_at` against UTC day
//! boundaries. All set predicates combine with logical AND.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::session::Session;

/// Error message returned when a prune filter selects nothing in particular.
pub const PRUNE_FILTER_REQUIRED: &str = "at least one filter is required";

/// Parses a `YYYY-MM-DD` calendar date.
pub fn parse_date(field: &str, raw: &str) -> DomainResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| DomainError::InvalidDate {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

fn start_of_day(day: NaiveDate) -> Option<DateTime<Utc>> {
    day.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn start_of_next_day(day: NaiveDate) -> Option<DateTime<Utc>> {
    day.succ_opt().and_then(start_of_day)
}

// ============================================================================
// Started Range
// ============================================================================

/// Half-open `[from, until)` window over `started_at`, derived from the
/// date predicates of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartedRange {
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
}

impl StartedRange {
    /// Returns true when neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.until.is_none()
    }

    /// Returns true if `ts` falls inside the window.
    ///
    /// A missing timestamp only satisfies an unbounded window.
    pub fn contains(&self, ts: Option<DateTime<Utc>>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(ts) = ts else {
            return false;
        };
        self.from.map_or(true, |from| ts >= from) && self.until.map_or(true, |until| ts < until)
    }

    fn tighten_from(&mut self, bound: Option<DateTime<Utc>>) {
        if let Some(bound) = bound {
            self.from = Some(self.from.map_or(bound, |cur| cur.max(bound)));
        }
    }

    fn tighten_until(&mut self, bound: Option<DateTime<Utc>>) {
        if let Some(bound) = bound {
            self.until = Some(self.until.map_or(bound, |cur| cur.min(bound)));
        }
    }
}

// ============================================================================
// Session Filter
// ============================================================================

/// Optional predicates over sessions. The default value matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Exact UTC start day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,

    /// Inclusive first start day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,

    /// Inclusive last start day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,

    /// Inclusive lower bound on `message_count`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_messages: Option<u64>,

    /// Inclusive upper bound on `message_count`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u64>,

    /// Exact project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Exact machine label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
}

impl SessionFilter {
    /// Returns true if no predicate is set.
    pub fn is_empty(&self) -> bool {
        !predicates_set(
            self.date,
            self.date_from,
            self.date_to,
            self.min_messages,
            self.max_messages,
            self.project.as_deref(),
            self.machine.as_deref(),
        )
    }

    /// Folds `date`, `date_from` and `date_to` into one `started_at` window.
    pub fn started_range(&self) -> StartedRange {
        let mut range = StartedRange::default();
        if let Some(day) = self.date {
            range.tighten_from(start_of_day(day));
            range.tighten_until(start_of_next_day(day));
        }
        if let Some(day) = self.date_from {
            range.tighten_from(start_of_day(day));
        }
        if let Some(day) = self.date_to {
            range.tighten_until(start_of_next_day(day));
        }
        range
    }

    /// Returns true if `session` satisfies every set predicate.
    pub fn matches(&self, session: &Session) -> bool {
        if !self.started_range().contains(session.started_at) {
            return false;
        }
        if positive(self.min_messages).is_some_and(|min| session.message_count < min) {
            return false;
        }
        if positive(self.max_messages).is_some_and(|max| session.message_count > max) {
            return false;
        }
        if let Some(project) = non_empty(self.project.as_deref()) {
            if session.project != project {
                return false;
            }
        }
        if let Some(machine) = non_empty(self.machine.as_deref()) {
            if session.machine.as_deref() != Some(machine) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Prune Filter
// ============================================================================

/// Predicates selecting sessions for deletion.
///
/// Same shape as [`SessionFilter`], but an empty prune filter is an error
/// rather than "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_messages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
}

impl PruneFilter {
    /// Returns false iff every predicate is at its zero value.
    ///
    /// `min_messages = 0`, `max_messages = 0` and empty strings count as
    /// zero values, the same way the HTTP listing treats them, so a prune
    /// from the CLI and a listing over HTTP agree on what "unset" means.
    pub fn has_filters(&self) -> bool {
        predicates_set(
            self.date,
            self.date_from,
            self.date_to,
            self.min_messages,
            self.max_messages,
            self.project.as_deref(),
            self.machine.as_deref(),
        )
    }

    /// Converts to the equivalent listing filter.
    ///
    /// # Errors
    ///
    /// `DomainError::Validation` ("at least one filter is required") when
    /// [`has_filters`](Self::has_filters) is false.
    pub fn to_session_filter(&self) -> DomainResult<SessionFilter> {
        if !self.has_filters() {
            return Err(DomainError::validation(PRUNE_FILTER_REQUIRED));
        }
        Ok(SessionFilter {
            date: self.date,
            date_from: self.date_from,
            date_to: self.date_to,
            min_messages: positive(self.min_messages),
            max_messages: positive(self.max_messages),
            project: non_empty(self.project.as_deref()).map(str::to_string),
            machine: non_empty(self.machine.as_deref()).map(str::to_string),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Message-count bounds of zero are zero values.
fn positive(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

fn predicates_set(
    date: Option<NaiveDate>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    min_messages: Option<u64>,
    max_messages: Option<u64>,
    project: Option<&str>,
    machine: Option<&str>,
) -> bool {
    date.is_some()
        || date_from.is_some()
        || date_to.is_some()
        || positive(min_messages).is_some()
        || positive(max_messages).is_some()
        || non_empty(project).is_some()
        || non_empty(machine).is_some()
}
