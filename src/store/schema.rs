//! Database schema constants for the sqlite storage backend.
//!
//! This module contains all SQL schema definitions for the step store.
//! Statements are kept one-per-constant so each can run as a single
//! prepared statement.

/// SQL schema for creating the steps table.
///
/// `parents` and `children` hold JSON arrays of step ids; `epoch` is a
/// unix timestamp (seconds) refreshed on every status transition.
pub const CREATE_STEPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    priority INTEGER NOT NULL DEFAULT 0,
    scope TEXT NOT NULL,
    tag TEXT NOT NULL,
    velocity DOUBLE,
    status TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    msg TEXT,
    trace TEXT,
    parents TEXT NOT NULL DEFAULT '[]',
    children TEXT NOT NULL DEFAULT '[]'
)
"#;

/// SQL schema for creating the tags table (tag -> velocity cap).
pub const CREATE_TAGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tags (
    tag TEXT PRIMARY KEY,
    velocity DOUBLE NOT NULL
)
"#;

/// Index backing status lookups (counts, error reports, bulk resets).
pub const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_steps_status ON steps(status)";

/// Index backing the dispatch query: it filters on status+scope and
/// orders by priority DESC, epoch ASC.
pub const CREATE_DISPATCH_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_steps_dispatch
ON steps(status, scope, priority DESC, epoch ASC)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_STEPS_TABLE,
        CREATE_TAGS_TABLE,
        CREATE_STATUS_INDEX,
        CREATE_DISPATCH_INDEX,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(statement.contains("IF NOT EXISTS"));
        }
    }
}
