//! Table backfill
//!
//! One-shot ingestion of a table's existing rows as insert-tagged events,
//! for sources that need history predating the replication slot. Uses
//! keyset pagination (`WHERE key > last ORDER BY key LIMIT n`, never
//! OFFSET) so memory stays bounded on tables of any size.
//!
//! A backfill may run while the slot is streaming live changes to the
//! same table: both paths funnel through the log's idempotent upsert, so
//! overlap costs a redundant update, never a conflict.
//!
//! Pagination orders by the key's text rendering; any consistent total
//! order visits every row exactly once, which is all coverage needs.

use crate::common::{ChangeEvent, Result, RiffleError, SubjectTemplate};
use crate::log::MessageLog;
use tokio_postgres::Client;
use tracing::{debug, info};

/// Backfill configuration for one table.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Schema of the table to scan
    pub schema: String,
    /// Table to scan
    pub table: String,
    /// Destination stream
    pub stream: String,
    /// Subject layout (should match the owning slot's)
    pub template: SubjectTemplate,
    /// Rows per page
    pub batch_size: usize,
    /// Key column for pagination; discovered from the primary key when
    /// not set
    pub key_column: Option<String>,
}

impl BackfillConfig {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            stream: stream.into(),
            template: SubjectTemplate::default(),
            batch_size: 1_000,
            key_column: None,
        }
    }

    fn validate(&self) -> Result<()> {
        for name in [&self.schema, &self.table] {
            validate_relation_name(name)?;
        }
        if let Some(key) = &self.key_column {
            validate_relation_name(key)?;
        }
        if self.batch_size == 0 {
            return Err(RiffleError::config("Backfill batch size must be nonzero"));
        }
        Ok(())
    }
}

/// Counters from a completed backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub rows: u64,
    pub batches: u64,
}

/// Run a backfill to completion.
pub async fn run_backfill(
    client: &Client,
    database: &str,
    config: &BackfillConfig,
    log: &MessageLog,
) -> Result<BackfillReport> {
    config.validate()?;

    let key_column = match &config.key_column {
        Some(key) => key.clone(),
        None => discover_key_column(client, &config.schema, &config.table).await?,
    };
    validate_relation_name(&key_column)?;

    info!(
        schema = %config.schema,
        table = %config.table,
        key = %key_column,
        "Backfill starting"
    );

    let query = format!(
        "SELECT row_to_json(t)::text, ({key})::text FROM {schema}.{table} t \
         WHERE $1::text IS NULL OR ({key})::text > $1 \
         ORDER BY ({key})::text LIMIT {limit}",
        key = quote_ident(&key_column),
        schema = quote_ident(&config.schema),
        table = quote_ident(&config.table),
        limit = config.batch_size,
    );

    let mut report = BackfillReport::default();
    let mut cursor: Option<String> = None;

    loop {
        let rows = client
            .query(query.as_str(), &[&cursor])
            .await
            .map_err(|e| RiffleError::replication(format!("backfill query failed: {e}")))?;
        if rows.is_empty() {
            break;
        }

        for row in &rows {
            let body: String = row.get(0);
            let key: String = row.get(1);
            let data: serde_json::Value = serde_json::from_str(&body)?;

            let event = ChangeEvent::insert(&config.schema, &config.table, key.clone(), data);
            let subject = config.template.subject(database, &event)?;
            log.append_or_update(&config.stream, subject, event.row).await;

            report.rows += 1;
            cursor = Some(key);
        }

        report.batches += 1;
        debug!(rows = report.rows, "Backfill progress");
    }

    info!(rows = report.rows, batches = report.batches, "Backfill complete");
    Ok(report)
}

/// Discover the single-column primary key of a table.
///
/// Composite primary keys are not paginatable by one key column and are
/// surfaced as a configuration error; set `key_column` to any unique
/// column instead.
async fn discover_key_column(client: &Client, schema: &str, table: &str) -> Result<String> {
    let rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary \
             ORDER BY a.attnum",
            &[&schema, &table],
        )
        .await
        .map_err(|e| RiffleError::replication(format!("key discovery failed: {e}")))?;

    match rows.len() {
        0 => Err(RiffleError::config(format!(
            "{schema}.{table} has no primary key; set key_column explicitly"
        ))),
        1 => Ok(rows[0].get(0)),
        n => Err(RiffleError::config(format!(
            "{schema}.{table} has a {n}-column primary key; set key_column explicitly"
        ))),
    }
}

fn validate_relation_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(RiffleError::config(format!("Invalid identifier: {name:?}")))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(BackfillConfig::new("public", "users", "s").validate().is_ok());

        assert!(BackfillConfig::new("public", "users; drop table x", "s")
            .validate()
            .is_err());
        assert!(BackfillConfig::new("", "users", "s").validate().is_err());

        let mut config = BackfillConfig::new("public", "users", "s");
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = BackfillConfig::new("public", "users", "s");
        config.key_column = Some("bad\"col".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
    }
}
