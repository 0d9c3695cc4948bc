//! Change event representation
//!
//! A [`ChangeEvent`] is the normalized output of the decoder. Its payload is
//! always complete: continuation fragments are joined before an event
//! exists.
//!
//! `Commit` and `Rollback` events are transaction boundary markers. They
//! leave the decoder like any other event and are dropped by the
//! orchestrator before delivery.

use crate::common::PositionToken;
use serde::{Deserialize, Serialize};

/// Operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Schema change or truncate
    Ddl,
    /// Transaction committed (boundary)
    Commit,
    /// Transaction rolled back (boundary)
    Rollback,
}

impl OperationKind {
    /// Whether this kind marks a transaction boundary rather than a row change.
    pub fn is_boundary(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

/// Row change payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ChangePayload {
    /// Backend change text (Oracle `SQL_REDO`)
    Redo { sql: String },
    /// Decoded row images (pgoutput tuples)
    Tuple {
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    },
    /// Boundary markers carry nothing
    Empty,
}

/// Normalized change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation kind
    pub op: OperationKind,
    /// Log position of the change
    pub position: PositionToken,
    /// Backend transaction id (Oracle XID, PostgreSQL xid)
    pub transaction_id: Option<String>,
    /// Owning schema, when the backend reports it
    pub schema: Option<String>,
    /// Owning object (table), when the backend reports it
    pub object: Option<String>,
    /// Backend-internal object id
    pub object_id: Option<i64>,
    /// Physical row address (Oracle ROWID), when the backend reports it
    pub row_id: Option<String>,
    /// Row change payload
    pub payload: ChangePayload,
    /// Change timestamp (Unix epoch milliseconds), when known
    pub timestamp: Option<i64>,
    /// Source label ("oracle", "postgres", or the configured name)
    pub source: String,
}

impl ChangeEvent {
    /// Create an event with an empty payload; fill it with the `with_*`
    /// helpers.
    pub fn new(op: OperationKind, position: PositionToken, source: impl Into<String>) -> Self {
        Self {
            op,
            position,
            transaction_id: None,
            schema: None,
            object: None,
            object_id: None,
            row_id: None,
            payload: ChangePayload::Empty,
            timestamp: None,
            source: source.into(),
        }
    }

    pub fn with_transaction(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_object(mut self, schema: impl Into<String>, object: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.object = Some(object.into());
        self
    }

    pub fn with_object_id(mut self, id: i64) -> Self {
        self.object_id = Some(id);
        self
    }

    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    pub fn with_redo(mut self, sql: impl Into<String>) -> Self {
        self.payload = ChangePayload::Redo { sql: sql.into() };
        self
    }

    pub fn with_tuple(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.payload = ChangePayload::Tuple { before, after };
        self
    }

    pub fn with_timestamp(mut self, epoch_millis: i64) -> Self {
        self.timestamp = Some(epoch_millis);
        self
    }

    /// Whether this event is a transaction boundary marker.
    pub fn is_boundary(&self) -> bool {
        self.op.is_boundary()
    }

    /// `schema.object`, when both are known.
    pub fn qualified_name(&self) -> Option<String> {
        match (&self.schema, &self.object) {
            (Some(s), Some(o)) => Some(format!("{}.{}", s, o)),
            _ => None,
        }
    }

    /// Redo text, for events decoded from mining rows.
    pub fn redo_sql(&self) -> Option<&str> {
        match &self.payload {
            ChangePayload::Redo { sql } => Some(sql),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_kinds() {
        assert!(OperationKind::Commit.is_boundary());
        assert!(OperationKind::Rollback.is_boundary());
        assert!(!OperationKind::Insert.is_boundary());
        assert!(!OperationKind::Ddl.is_boundary());
    }

    #[test]
    fn test_builder() {
        let event = ChangeEvent::new(OperationKind::Insert, PositionToken::new(10), "oracle")
            .with_transaction("0A001B00C2000000")
            .with_object("SALES", "ORDERS")
            .with_object_id(73_001)
            .with_row_id("AAAR3sAAEAAAACXAAA")
            .with_redo("insert into \"SALES\".\"ORDERS\" values (1)");

        assert_eq!(event.qualified_name().as_deref(), Some("SALES.ORDERS"));
        assert_eq!(event.row_id.as_deref(), Some("AAAR3sAAEAAAACXAAA"));
        assert!(event.redo_sql().unwrap().starts_with("insert"));
        assert!(!event.is_boundary());
    }

    #[test]
    fn test_serialization() {
        let event = ChangeEvent::new(OperationKind::Update, PositionToken::new(99), "postgres")
            .with_tuple(None, Some(serde_json::json!({"id": "1"})));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "UPDATE");
        assert_eq!(json["position"], "99");
        assert_eq!(json["payload"]["format"], "tuple");

        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
