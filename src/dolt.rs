//! dolt.rs
//!
//! Versioned store backed by a Dolt sql-server. Dolt speaks the MySQL wire
//! protocol, so everything here is plain `sqlx` against a single connection:
//! version control goes through the `DOLT_*` stored procedures.

use std::str::FromStr;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor, MySql, QueryBuilder};
use tracing::{debug, info};
use url::Url;

use crate::errors::IngestError;
use crate::store::{RepositoryProvider, TableStore, VersionedRepository};
use crate::table::{ImportMode, TableData};

/// MySQL allows at most 65535 placeholders per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Width of key columns. Longer key values are rejected before loading.
const MAX_KEY_CHARS: usize = 255;

/// Connection settings for a Dolt sql-server plus the remote host that
/// short `owner/repo` names resolve against.
#[derive(Debug, Clone)]
pub struct DoltServer {
    options: MySqlConnectOptions,
    remote_host: Url,
}

impl DoltServer {
    pub fn new(database_url: &str, remote_host: &str) -> Result<Self, IngestError> {
        let options = MySqlConnectOptions::from_str(database_url)?;
        let remote_host =
            Url::parse(remote_host).map_err(|e| IngestError::Url(remote_host.to_string(), e))?;
        Ok(DoltServer {
            options,
            remote_host,
        })
    }

    /// Open a session on an existing database served by this server.
    pub async fn open(&self, database: &str) -> Result<DoltSession, IngestError> {
        let conn = MySqlConnection::connect_with(&self.options.clone().database(database)).await?;
        info!(database, "Opened Dolt database");
        Ok(DoltSession {
            conn,
            database: database.to_string(),
        })
    }

    /// Resolve `owner/repo` against the remote host; full URLs pass through.
    pub fn remote_url(&self, remote: &str) -> Result<Url, IngestError> {
        if let Ok(url) = Url::parse(remote) {
            return Ok(url);
        }
        self.remote_host
            .join(remote)
            .map_err(|e| IngestError::Url(remote.to_string(), e))
    }
}

impl RepositoryProvider for DoltServer {
    type Repo = DoltSession;

    async fn checkout(&self, remote: &str, workspace: &str) -> Result<DoltSession, IngestError> {
        let url = self.remote_url(remote)?;
        let mut conn = MySqlConnection::connect_with(&self.options).await?;

        sqlx::query("CALL DOLT_CLONE(?, ?)")
            .bind(url.as_str())
            .bind(workspace)
            .execute(&mut conn)
            .await?;
        conn.execute(format!("USE {}", quote_ident(workspace)).as_str())
            .await?;

        info!(remote = %url, workspace, "Cloned remote repository");
        Ok(DoltSession {
            conn,
            database: workspace.to_string(),
        })
    }
}

/// One connection pinned to one Dolt database.
pub struct DoltSession {
    conn: MySqlConnection,
    database: String,
}

impl DoltSession {
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl TableStore for DoltSession {
    async fn bulk_import(
        &mut self,
        table: &str,
        data: &TableData,
        primary_key: &[String],
        mode: ImportMode,
    ) -> Result<u64, IngestError> {
        if data.columns.is_empty() {
            return Err(IngestError::Schema {
                table: table.to_string(),
                reason: "source has no header columns".to_string(),
            });
        }
        let key_positions = data
            .column_positions(primary_key)
            .map_err(|missing| IngestError::Schema {
                table: table.to_string(),
                reason: format!("key column {missing} is not in the header"),
            })?;
        check_key_lengths(table, data, &key_positions)?;

        let mut tx = self.conn.begin().await?;

        (&mut *tx)
            .execute(create_table_sql(table, &data.columns, primary_key).as_str())
            .await?;

        if mode == ImportMode::Replace {
            (&mut *tx)
                .execute(format!("DELETE FROM {}", quote_ident(table)).as_str())
                .await?;
        }

        // Keyless updates match on the whole row so re-running a load adds nothing.
        if mode == ImportMode::Update && primary_key.is_empty() {
            let mut written = 0;
            for chunk in data.rows.chunks(rows_per_statement(&data.columns)) {
                let mut qb = insert_missing_rows(table, &data.columns, chunk);
                written += qb.build().execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            debug!(table, rows = written, %mode, "Keyless import finished");
            return Ok(written);
        }

        let column_list = data
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut written = 0;
        for chunk in data.rows.chunks(rows_per_statement(&data.columns)) {
            let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                column_list
            ));
            qb.push_values(chunk, |mut b, row| {
                for (i, value) in row.iter().enumerate() {
                    // Empty non-key fields load as NULL; key fields stay as written.
                    if value.is_empty() && !key_positions.contains(&i) {
                        b.push_bind(None::<&str>);
                    } else {
                        b.push_bind(value.as_str());
                    }
                }
            });
            if mode != ImportMode::Append {
                qb.push(on_duplicate_clause(&data.columns, primary_key));
            }
            qb.build().execute(&mut *tx).await?;
            written += chunk.len() as u64;
        }

        tx.commit().await?;
        debug!(table, rows = written, %mode, "Bulk import finished");
        Ok(written)
    }
}

impl VersionedRepository for DoltSession {
    async fn commit(&mut self, message: &str) -> Result<bool, IngestError> {
        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dolt_status")
            .fetch_one(&mut self.conn)
            .await?;
        if pending == 0 {
            return Ok(false);
        }

        sqlx::query("CALL DOLT_ADD('-A')")
            .execute(&mut self.conn)
            .await?;
        sqlx::query("CALL DOLT_COMMIT('-m', ?)")
            .bind(message)
            .execute(&mut self.conn)
            .await?;
        info!(database = %self.database, message, "Committed working set");
        Ok(true)
    }

    async fn push(&mut self, remote: &str, branch: &str) -> Result<(), IngestError> {
        sqlx::query("CALL DOLT_PUSH(?, ?)")
            .bind(remote)
            .bind(branch)
            .execute(&mut self.conn)
            .await?;
        info!(database = %self.database, remote, branch, "Pushed");
        Ok(())
    }

    async fn release(mut self) -> Result<(), IngestError> {
        let drop = format!("DROP DATABASE {}", quote_ident(&self.database));
        self.conn.execute(drop.as_str()).await?;
        self.conn.close().await?;
        Ok(())
    }
}

/// Backtick-quote an identifier, doubling any embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn rows_per_statement(columns: &[String]) -> usize {
    (MAX_BIND_PARAMS / columns.len().max(1)).max(1)
}

/// Reject key values wider than the key column before anything is written.
fn check_key_lengths(
    table: &str,
    data: &TableData,
    key_positions: &[usize],
) -> Result<(), IngestError> {
    for row in &data.rows {
        for &i in key_positions {
            if row[i].chars().count() > MAX_KEY_CHARS {
                return Err(IngestError::Schema {
                    table: table.to_string(),
                    reason: format!(
                        "value of key column {} is longer than {MAX_KEY_CHARS} characters",
                        data.columns[i]
                    ),
                });
            }
        }
    }
    Ok(())
}

/// `INSERT ... SELECT` of `rows` that skips any row already present in
/// `table`, compared column by column with NULL-safe equality.
fn insert_missing_rows<'a>(
    table: &str,
    columns: &[String],
    rows: &'a [Vec<String>],
) -> QueryBuilder<'a, MySql> {
    let table = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM ("
    ));
    for (n, row) in rows.iter().enumerate() {
        if n > 0 {
            qb.push(" UNION ALL ");
        }
        qb.push("SELECT ");
        let mut select = qb.separated(", ");
        for (column, value) in columns.iter().zip(row) {
            if value.is_empty() {
                select.push_bind(None::<&str>);
            } else {
                select.push_bind(value.as_str());
            }
            select.push_unseparated(format!(" AS {}", quote_ident(column)));
        }
    }
    let matches = columns
        .iter()
        .map(|c| format!("dst.{0} <=> src.{0}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    qb.push(format!(
        ") AS src WHERE NOT EXISTS (SELECT 1 FROM {table} AS dst WHERE {matches})"
    ));
    qb
}

/// Key columns get a `VARCHAR(255)` so they can be indexed; everything else is text.
fn create_table_sql(table: &str, columns: &[String], primary_key: &[String]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            if primary_key.contains(c) {
                format!("{} VARCHAR({MAX_KEY_CHARS}) NOT NULL", quote_ident(c))
            } else {
                format!("{} LONGTEXT", quote_ident(c))
            }
        })
        .collect();
    if !primary_key.is_empty() {
        let keys = primary_key
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        defs.push(format!("PRIMARY KEY ({keys})"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        defs.join(", ")
    )
}

fn on_duplicate_clause(columns: &[String], primary_key: &[String]) -> String {
    let mut updates: Vec<String> = columns
        .iter()
        .filter(|c| !primary_key.contains(c))
        .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
        .collect();
    if updates.is_empty() {
        // Key-only tables: nothing to overwrite, but the clause still swallows duplicates.
        let first = quote_ident(&columns[0]);
        updates.push(format!("{first} = {first}"));
    }
    format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", "))
}
