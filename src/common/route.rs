//! Subject derivation from change events
//!
//! Each source chooses one of two subject layouts at setup time:
//!
//! - `{database}.{schema}.{table}.{row_id}`
//! - `{database}.{schema}.{table}.{operation}.{row_id}`
//!
//! With the second layout, inserts, updates, and deletes to the same row
//! land on distinct subjects, so consumers can filter by operation with a
//! pattern like `mydb.public.users.delete.*`.

use crate::common::event::ChangeEvent;
use crate::subject::{Subject, SubjectError};
use serde::{Deserialize, Serialize};

/// Subject layout for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectTemplate {
    /// `{database}.{schema}.{table}.{row_id}`
    #[default]
    TableAndId,
    /// `{database}.{schema}.{table}.{operation}.{row_id}`
    TableOpAndId,
}

impl SubjectTemplate {
    /// Render the subject for a change event.
    ///
    /// Fails if any segment would violate subject validation (empty,
    /// reserved characters, or a composite row id pushing the subject
    /// past the token cap).
    pub fn subject(
        &self,
        database: &str,
        event: &ChangeEvent,
    ) -> Result<Subject, SubjectError> {
        let raw = match self {
            SubjectTemplate::TableAndId => format!(
                "{}.{}.{}.{}",
                database, event.schema, event.table, event.row_id
            ),
            SubjectTemplate::TableOpAndId => format!(
                "{}.{}.{}.{}.{}",
                database, event.schema, event.table, event.op, event.row_id
            ),
        };
        Subject::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::ChangeEvent;
    use serde_json::json;

    #[test]
    fn test_table_and_id() {
        let event = ChangeEvent::insert("public", "users", "1", json!({"id": 1}));
        let subject = SubjectTemplate::TableAndId
            .subject("mydb", &event)
            .unwrap();
        assert_eq!(subject.to_string(), "mydb.public.users.1");
    }

    #[test]
    fn test_table_op_and_id() {
        let event = ChangeEvent::delete("public", "users", "1", json!({"id": 1}));
        let subject = SubjectTemplate::TableOpAndId
            .subject("mydb", &event)
            .unwrap();
        assert_eq!(subject.to_string(), "mydb.public.users.delete.1");
    }

    #[test]
    fn test_composite_row_id() {
        let event = ChangeEvent::update("public", "order_items", "42.7", json!({}));
        let subject = SubjectTemplate::TableAndId
            .subject("mydb", &event)
            .unwrap();
        assert_eq!(subject.token_count(), 5);
        assert_eq!(subject.token(4), Some("7"));
    }

    #[test]
    fn test_invalid_segment_rejected() {
        let event = ChangeEvent::insert("public", "users", "a b", json!({}));
        assert!(SubjectTemplate::TableAndId.subject("mydb", &event).is_err());
    }
}
