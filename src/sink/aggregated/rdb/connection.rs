use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::types::ToSqlOutput;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql as PgToSql;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use super::dialect::{DatabaseUrl, Dialect};

/// How long SQLite waits on a lock held by another writer.
const SQLITE_BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A bind parameter accepted by both drivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlParam {
    fn as_pg(&self) -> &(dyn PgToSql + Sync) {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v,
            Self::Text(v) => v,
        }
    }
}

impl rusqlite::ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Int(v) => ToSqlOutput::from(*v),
            Self::Float(v) => ToSqlOutput::from(*v),
            Self::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

/// A row read back as an integer id followed by text columns.
pub type IdRow = (i64, Vec<String>);

type SqliteHandle = Arc<Mutex<rusqlite::Connection>>;

/// Runs a blocking SQLite call on the blocking thread pool.
async fn run_sqlite<T, F>(conn: &SqliteHandle, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || f(&mut conn.lock()))
        .await
        .map_err(|e| anyhow!("sqlite task failed: {e}"))?
}

/// One exclusive database connection, opened per write.
///
/// SQLite calls run on `spawn_blocking`; Postgres is driven by a spawned
/// connection task.
pub enum RdbConnection {
    Sqlite(SqliteHandle),
    Postgres {
        client: tokio_postgres::Client,
        driver: JoinHandle<()>,
    },
}

impl RdbConnection {
    /// Opens a connection for the given URL.
    pub async fn open(url: &DatabaseUrl) -> Result<Self> {
        match url.dialect {
            Dialect::Sqlite => {
                let target = url.target.clone();
                let conn = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection> {
                    let conn = rusqlite::Connection::open(&target)
                        .with_context(|| format!("opening sqlite database {target}"))?;
                    conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
                        .context("setting sqlite busy timeout")?;
                    Ok(conn)
                })
                .await
                .map_err(|e| anyhow!("sqlite open task failed: {e}"))??;

                Ok(Self::Sqlite(Arc::new(Mutex::new(conn))))
            }
            Dialect::Postgres => {
                let (client, connection) = tokio_postgres::connect(&url.target, NoTls)
                    .await
                    .context("connecting to postgres")?;

                let driver = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres connection error");
                    }
                });

                Ok(Self::Postgres { client, driver })
            }
        }
    }

    /// Runs one or more statements without parameters.
    pub async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        match self {
            Self::Sqlite(conn) => {
                let sql = sql.to_owned();
                run_sqlite(conn, move |c| c.execute_batch(&sql).context("sqlite batch execute"))
                    .await
            }
            Self::Postgres { client, .. } => client
                .batch_execute(sql)
                .await
                .context("postgres batch execute"),
        }
    }

    /// Runs one statement and returns the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        match self {
            Self::Sqlite(conn) => {
                let sql = sql.to_owned();
                let params = params.to_vec();
                run_sqlite(conn, move |c| {
                    let changed = c
                        .execute(&sql, rusqlite::params_from_iter(params.iter()))
                        .with_context(|| format!("sqlite execute: {sql}"))?;
                    Ok(changed as u64)
                })
                .await
            }
            Self::Postgres { client, .. } => {
                let pg_params: Vec<&(dyn PgToSql + Sync)> =
                    params.iter().map(SqlParam::as_pg).collect();
                client
                    .execute(sql, &pg_params)
                    .await
                    .with_context(|| format!("postgres execute: {sql}"))
            }
        }
    }

    /// Runs a single-row insert and returns the id the engine assigned, if
    /// it reports one.
    pub async fn insert_returning_id(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<i64>> {
        match self {
            Self::Sqlite(conn) => {
                let sql = sql.to_owned();
                let params = params.to_vec();
                run_sqlite(conn, move |c| {
                    let changed = c
                        .execute(&sql, rusqlite::params_from_iter(params.iter()))
                        .with_context(|| format!("sqlite insert: {sql}"))?;
                    Ok((changed == 1).then(|| c.last_insert_rowid()))
                })
                .await
            }
            Self::Postgres { client, .. } => {
                let pg_params: Vec<&(dyn PgToSql + Sync)> =
                    params.iter().map(SqlParam::as_pg).collect();
                let row = client
                    .query_opt(sql, &pg_params)
                    .await
                    .with_context(|| format!("postgres insert: {sql}"))?;
                row.map(|r| r.try_get::<_, i64>(0))
                    .transpose()
                    .context("reading inserted id")
            }
        }
    }

    /// Reads rows whose first column is an integer id and whose remaining
    /// `text_columns` columns are text.
    pub async fn query_id_rows(&mut self, sql: &str, text_columns: usize) -> Result<Vec<IdRow>> {
        match self {
            Self::Sqlite(conn) => {
                let sql = sql.to_owned();
                run_sqlite(conn, move |c| {
                    let mut stmt = c
                        .prepare(&sql)
                        .with_context(|| format!("sqlite prepare: {sql}"))?;
                    let rows = stmt
                        .query_map([], |row| {
                            let id: i64 = row.get(0)?;
                            let mut texts = Vec::with_capacity(text_columns);
                            for i in 1..=text_columns {
                                texts.push(row.get::<_, String>(i)?);
                            }
                            Ok((id, texts))
                        })
                        .with_context(|| format!("sqlite query: {sql}"))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                        .context("reading sqlite rows")
                })
                .await
            }
            Self::Postgres { client, .. } => {
                let rows = client
                    .query(sql, &[])
                    .await
                    .with_context(|| format!("postgres query: {sql}"))?;

                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let id: i64 = row.try_get(0).context("reading id column")?;
                    let mut texts = Vec::with_capacity(text_columns);
                    for i in 1..=text_columns {
                        texts.push(row.try_get::<_, String>(i).context("reading text column")?);
                    }
                    out.push((id, texts));
                }
                Ok(out)
            }
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.batch_execute("BEGIN").await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.batch_execute("COMMIT").await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.batch_execute("ROLLBACK").await
    }

    /// Closes the connection.
    pub async fn close(self) -> Result<()> {
        match self {
            Self::Sqlite(conn) => match Arc::try_unwrap(conn) {
                Ok(conn) => tokio::task::spawn_blocking(move || {
                    conn.into_inner()
                        .close()
                        .map_err(|(_, e)| e)
                        .context("closing sqlite connection")
                })
                .await
                .map_err(|e| anyhow!("sqlite close task failed: {e}"))?,
                // Still shared; the last handle closes it on drop.
                Err(_) => Ok(()),
            },
            Self::Postgres { client, driver } => {
                drop(client);
                if let Err(e) = driver.await {
                    debug!(error = %e, "postgres driver task join failed");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sqlite_url(dir: &TempDir) -> DatabaseUrl {
        let path = dir.path().join("conn.db");
        DatabaseUrl::parse(&format!("sqlite://{}", path.to_string_lossy())).expect("url")
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_on_blocking_pool() {
        let dir = TempDir::new().expect("tempdir");
        let mut conn = RdbConnection::open(&sqlite_url(&dir)).await.expect("open");

        conn.batch_execute("CREATE TABLE names (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .expect("create");
        let id = conn
            .insert_returning_id(
                "INSERT INTO names (name) VALUES (?1)",
                &[SqlParam::Text("a".to_string())],
            )
            .await
            .expect("insert");
        assert_eq!(id, Some(1));

        let changed = conn
            .execute(
                "UPDATE names SET name = ?1 WHERE id = ?2",
                &[SqlParam::Text("b".to_string()), SqlParam::Int(2)],
            )
            .await
            .expect("update");
        assert_eq!(changed, 0);

        let rows = conn
            .query_id_rows("SELECT id, name FROM names", 1)
            .await
            .expect("query");
        assert_eq!(rows, vec![(1, vec!["a".to_string()])]);

        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_sqlite_errors_carry_statement() {
        let dir = TempDir::new().expect("tempdir");
        let mut conn = RdbConnection::open(&sqlite_url(&dir)).await.expect("open");

        let err = conn
            .execute("UPDATE missing SET x = 1", &[])
            .await
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("UPDATE missing"));
        conn.close().await.expect("close");
    }
}
