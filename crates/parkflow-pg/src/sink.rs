//! Durable sink that appends changed records to a Postgres table.
//!
//! Every commit runs in one transaction together with a row in
//! `__parkflow_commits`, so replaying an already committed batch after a
//! restart is a no-op.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parkflow_core::{Batch, Record};
use parkflow_sink::{Sink, SinkError, SinkKind, SinkResult};
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::connect::connect_postgres;
use crate::error::{to_sink_error, PgError, PgResult};

pub const DEFAULT_TABLE: &str = "parking_data";

const COMMITS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS __parkflow_commits (
    sink_name TEXT NOT NULL,
    seq BIGINT NOT NULL,
    row_count INT NOT NULL,
    committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (sink_name, seq)
)
"#;

pub struct PostgresSink {
    name: String,
    connection_string: String,
    table: String,
    client: Mutex<Client>,
}

impl PostgresSink {
    /// Connect and make sure the commit log table exists.
    pub async fn connect(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        table: &str,
    ) -> PgResult<Self> {
        let connection_string = connection_string.into();
        let table = quote_table(table)?;
        let client = connect_postgres(&connection_string).await?;
        client.batch_execute(COMMITS_TABLE_DDL).await?;

        Ok(Self {
            name: name.into(),
            connection_string,
            table,
            client: Mutex::new(client),
        })
    }

    /// Create the target table if it does not exist.
    pub async fn create_target_table(&self) -> PgResult<()> {
        let client = self.client.lock().await;
        client.batch_execute(&create_table_sql(&self.table)).await?;
        info!(table = %self.table, "Target table ready");
        Ok(())
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Durable
    }

    async fn commit(&self, batch: &Batch) -> SinkResult<()> {
        let params = batch
            .rows
            .iter()
            .map(RowParams::try_from)
            .collect::<SinkResult<Vec<_>>>()?;

        let mut client = self.client.lock().await;
        if client.is_closed() {
            debug!(sink = %self.name, "Reconnecting to Postgres");
            *client = connect_postgres(&self.connection_string).await?;
        }

        let seq = batch.seq as i64;
        let tx = client.transaction().await.map_err(to_sink_error)?;

        let already = tx
            .query_opt(
                "SELECT 1 FROM __parkflow_commits WHERE sink_name = $1 AND seq = $2",
                &[&self.name, &seq],
            )
            .await
            .map_err(to_sink_error)?;
        if already.is_some() {
            info!(sink = %self.name, seq = batch.seq, "Batch already committed, skipping");
            return Ok(());
        }

        let stmt = tx
            .prepare(&insert_sql(&self.table))
            .await
            .map_err(to_sink_error)?;
        for row in &params {
            tx.execute(&stmt, &[&row.parking_id, &row.spaces, &row.ferme, &row.date])
                .await
                .map_err(to_sink_error)?;
        }

        tx.execute(
            "INSERT INTO __parkflow_commits (sink_name, seq, row_count) VALUES ($1, $2, $3)",
            &[&self.name, &seq, &(params.len() as i32)],
        )
        .await
        .map_err(to_sink_error)?;
        tx.commit().await.map_err(to_sink_error)?;

        debug!(sink = %self.name, seq = batch.seq, rows = params.len(), "Committed batch to Postgres");
        Ok(())
    }
}

struct RowParams<'a> {
    parking_id: &'a str,
    spaces: i32,
    ferme: bool,
    date: Option<NaiveDateTime>,
}

impl<'a> TryFrom<&'a Record> for RowParams<'a> {
    type Error = SinkError;

    fn try_from(record: &'a Record) -> SinkResult<Self> {
        let spaces = i32::try_from(record.available_spaces).map_err(|_| {
            SinkError::Rejected(format!(
                "available spaces {} for '{}' does not fit an INT column",
                record.available_spaces, record.facility_key
            ))
        })?;
        Ok(Self {
            parking_id: &record.facility_key,
            spaces,
            ferme: record.closed,
            date: record.observed_at.map(|at| at.naive_utc()),
        })
    }
}

/// Quote a table name, optionally schema-qualified, as SQL identifiers.
pub fn quote_table(table: &str) -> PgResult<String> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(PgError::InvalidTable(table.to_string()));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{}\"", p.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}

fn insert_sql(quoted_table: &str) -> String {
    format!(
        "INSERT INTO {} (parking_id, nb_of_available_parking_spaces, ferme, date) \
         VALUES ($1, $2, $3, $4)",
        quoted_table
    )
}

fn create_table_sql(quoted_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         parking_id TEXT NOT NULL,\n    \
         nb_of_available_parking_spaces INT NOT NULL,\n    \
         ferme BOOLEAN NOT NULL,\n    \
         date TIMESTAMP\n)",
        quoted_table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_quote_table() {
        assert_eq!(quote_table("parking_data").unwrap(), "\"parking_data\"");
        assert_eq!(
            quote_table("public.parking_data").unwrap(),
            "\"public\".\"parking_data\""
        );
        assert_eq!(quote_table("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_table("").is_err());
        assert!(quote_table("a.b.c").is_err());
        assert!(quote_table("public.").is_err());
    }

    #[test]
    fn test_insert_sql_columns() {
        let sql = insert_sql("\"parking_data\"");
        assert!(sql.starts_with("INSERT INTO \"parking_data\" (parking_id, nb_of_available_parking_spaces, ferme, date)"));
        assert!(sql.ends_with("($1, $2, $3, $4)"));
    }

    #[test]
    fn test_row_params_conversion() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let record = Record::new("P1", 42, true).observed_at(at);
        let params = RowParams::try_from(&record).unwrap();

        assert_eq!(params.parking_id, "P1");
        assert_eq!(params.spaces, 42);
        assert!(params.ferme);
        assert_eq!(params.date, Some(at.naive_utc()));

        let untimed = Record::new("P2", 0, false);
        assert_eq!(RowParams::try_from(&untimed).unwrap().date, None);
    }

    #[test]
    fn test_out_of_range_spaces_is_rejected() {
        let record = Record::new("P1", i64::from(i32::MAX) + 1, false);
        let err = RowParams::try_from(&record).err().unwrap();
        assert!(err.is_permanent());
    }
}
