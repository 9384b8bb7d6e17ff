//! Error types for the view engine.

use thiserror::Error;

/// Errors that can occur while deploying, processing, or repairing a view.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Invalid view definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("Invalid {kind} identifier '{name}'")]
    InvalidIdentifier { kind: &'static str, name: String },

    #[error(
        "Breaking schema change for view '{view}': {}. Redeploy with force-reindex to rebuild the view, or delete it first",
        describe_breaking(.removed_tables, .removed_columns, .changed_columns)
    )]
    BreakingChange {
        view: String,
        removed_tables: Vec<String>,
        /// `table.column` entries.
        removed_columns: Vec<String>,
        /// `table.column` entries.
        changed_columns: Vec<String>,
    },

    #[error("Unknown table '{table}' (valid tables: {valid})")]
    UnknownTable { table: String, valid: String },

    #[error("Invalid row for table '{table}': {reason}")]
    InvalidRow { table: String, reason: String },

    #[error("No transaction context set; cannot stamp rows for table '{table}'")]
    MissingTxContext { table: String },

    #[error("Failed to load handlers from '{path}': {reason}")]
    HandlerLoad { path: String, reason: String },

    #[error("View '{0}' not found")]
    ViewNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification bus error: {0}")]
    Bus(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ViewError {
    /// Shorthand for [`ViewError::InvalidDefinition`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised before any DDL runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDefinition { .. } | Self::InvalidIdentifier { .. }
        )
    }

    /// Returns `true` if a deploy was refused because of a breaking change.
    pub fn is_breaking(&self) -> bool {
        matches!(self, Self::BreakingChange { .. })
    }
}

fn describe_breaking(tables: &[String], removed: &[String], changed: &[String]) -> String {
    let mut parts = Vec::new();
    if !tables.is_empty() {
        parts.push(format!("removed tables [{}]", tables.join(", ")));
    }
    if !removed.is_empty() {
        parts.push(format!("removed columns [{}]", removed.join(", ")));
    }
    if !changed.is_empty() {
        parts.push(format!("changed columns [{}]", changed.join(", ")));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaking_change_message_names_everything() {
        let err = ViewError::BreakingChange {
            view: "swaps".into(),
            removed_tables: vec!["pools".into()],
            removed_columns: vec!["trades.fee".into()],
            changed_columns: vec!["trades.amount".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("removed tables [pools]"));
        assert!(msg.contains("removed columns [trades.fee]"));
        assert!(msg.contains("changed columns [trades.amount]"));
        assert!(msg.contains("force-reindex"));
        assert!(err.is_breaking());
        assert!(!err.is_validation());
    }
}
