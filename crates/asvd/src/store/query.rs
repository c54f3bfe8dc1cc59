//! SQL translation of session filters and search queries.

use asv_core::{format_timestamp, SessionFilter};
use rusqlite::types::Value;

/// Listing order: newest start first, sessions without a start last.
pub(crate) const SESSION_ORDER: &str = "ORDER BY started_at IS NULL, started_at DESC, id";

/// A `WHERE` clause with its positional parameters.
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    conditions: Vec<&'static str>,
    pub(crate) params: Vec<Value>,
}

impl WhereClause {
    fn push(&mut self, condition: &'static str, param: Value) {
        self.conditions.push(condition);
        self.params.push(param);
    }

    /// Renders ` WHERE a AND b`, or an empty string when nothing is set.
    pub(crate) fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    /// Renders ` AND a AND b` for appending to an existing condition.
    pub(crate) fn and_sql(&self) -> String {
        self.conditions
            .iter()
            .map(|condition| format!(" AND {condition}"))
            .collect()
    }
}

fn sql_int(value: u64) -> Value {
    Value::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Translates a filter into conditions over the `sessions` table.
///
/// Mirrors [`SessionFilter::matches`]: rows with a NULL `started_at` fail
/// any date bound because SQL comparisons against NULL are false.
pub(crate) fn session_where(filter: &SessionFilter) -> WhereClause {
    let mut clause = WhereClause::default();
    let range = filter.started_range();
    if let Some(from) = range.from {
        clause.push("started_at >= ?", Value::Text(format_timestamp(&from)));
    }
    if let Some(until) = range.until {
        clause.push("started_at < ?", Value::Text(format_timestamp(&until)));
    }
    if let Some(min) = filter.min_messages.filter(|min| *min > 0) {
        clause.push("message_count >= ?", sql_int(min));
    }
    if let Some(max) = filter.max_messages.filter(|max| *max > 0) {
        clause.push("message_count <= ?", sql_int(max));
    }
    if let Some(project) = filter.project.as_deref().filter(|p| !p.is_empty()) {
        clause.push("project = ?", Value::Text(project.to_string()));
    }
    if let Some(machine) = filter.machine.as_deref().filter(|m| !m.is_empty()) {
        clause.push("machine = ?", Value::Text(machine.to_string()));
    }
    clause
}

/// Turns free text into an FTS5 query that matches all of its terms.
///
/// Each whitespace-separated term is quoted so operators and punctuation in
/// user input are matched literally. Returns `None` for blank input.
pub fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asv_core::parse_date;

    #[test]
    fn test_empty_filter_has_no_where() {
        let clause = session_where(&SessionFilter::default());
        assert_eq!(clause.sql(), "");
        assert_eq!(clause.and_sql(), "");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_exact_date_becomes_half_open_range() {
        let filter = SessionFilter {
            date: Some(parse_date("date", "2024-06-01").unwrap()),
            ..Default::default()
        };
        let clause = session_where(&filter);
        assert_eq!(clause.sql(), " WHERE started_at >= ? AND started_at < ?");
        assert_eq!(
            clause.params,
            vec![
                Value::Text("2024-06-01T00:00:00.000Z".to_string()),
                Value::Text("2024-06-02T00:00:00.000Z".to_string()),
            ]
        );
    }

    #[test]
    fn test_zero_values_are_ignored() {
        let filter = SessionFilter {
            min_messages: Some(0),
            max_messages: Some(0),
            project: Some(String::new()),
            ..Default::default()
        };
        let clause = session_where(&filter);
        assert_eq!(clause.sql(), "");
        assert_eq!(clause.and_sql(), "");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_and_sql_extends_an_existing_condition() {
        let filter = SessionFilter {
            max_messages: Some(10),
            machine: Some("laptop".to_string()),
            ..Default::default()
        };
        let clause = session_where(&filter);
        assert_eq!(clause.and_sql(), " AND message_count <= ? AND machine = ?");
        assert_eq!(clause.params.len(), 2);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("tokio spawn").as_deref(), Some("\"tokio\" \"spawn\""));
        assert_eq!(fts_query("a\"b OR").as_deref(), Some("\"a\"\"b\" \"OR\""));
        assert_eq!(fts_query("   "), None);
    }
}
