use std::fmt;

use anyhow::{bail, Result};

/// SQL engine behind an rdb URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }

    /// Comma-separated placeholders `first..first+count`, wrapped in parentheses.
    pub fn placeholder_tuple(self, first: usize, count: usize) -> String {
        let items: Vec<String> = (first..first + count).map(|n| self.placeholder(n)).collect();
        format!("({})", items.join(", "))
    }

    /// Whether one insert-if-absent statement may carry several rows.
    pub const fn supports_multi_row_insert(self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Largest number of bind parameters in one statement.
    pub const fn max_bind_params(self) -> usize {
        match self {
            Self::Sqlite => 999,
            Self::Postgres => 65_535,
        }
    }

    /// Column definition for an auto-assigned primary key.
    pub const fn id_column(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    pub const fn int_type(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER",
            Self::Postgres => "BIGINT",
        }
    }

    pub const fn float_type(self) -> &'static str {
        match self {
            Self::Sqlite => "REAL",
            Self::Postgres => "DOUBLE PRECISION",
        }
    }

    pub const fn text_type(self) -> &'static str {
        match self {
            Self::Sqlite => "TEXT",
            Self::Postgres => "VARCHAR(255)",
        }
    }

    /// Statement inserting `rows` tuples of `columns` unless the primary key
    /// already exists.
    pub fn insert_if_absent(self, table: &str, columns: &[&str], rows: usize) -> String {
        let tuples: Vec<String> = (0..rows)
            .map(|i| self.placeholder_tuple(i * columns.len() + 1, columns.len()))
            .collect();
        let columns = columns.join(", ");
        let values = tuples.join(", ");

        match self {
            Self::Sqlite => format!("INSERT OR IGNORE INTO {table} ({columns}) VALUES {values}"),
            Self::Postgres => {
                format!("INSERT INTO {table} ({columns}) VALUES {values} ON CONFLICT DO NOTHING")
            }
        }
    }

    /// Plain insert of one row that reports the assigned id where the engine
    /// needs it spelled out.
    pub fn insert_returning_id(self, table: &str, columns: &[&str]) -> String {
        let values = self.placeholder_tuple(1, columns.len());
        let columns = columns.join(", ");

        match self {
            Self::Sqlite => format!("INSERT INTO {table} ({columns}) VALUES {values}"),
            Self::Postgres => format!("INSERT INTO {table} ({columns}) VALUES {values} RETURNING id"),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed rdb URL: the dialect and what its driver connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub dialect: Dialect,
    /// SQLite file path, or the full PostgreSQL connection string.
    pub target: String,
}

impl DatabaseUrl {
    /// Parse "sqlite://<path>" or "postgres://..." / "postgresql://...".
    pub fn parse(url: &str) -> Result<Self> {
        let lower = url.to_ascii_lowercase();

        if lower.starts_with("sqlite://") {
            let path = &url["sqlite://".len()..];
            if path.is_empty() {
                bail!("sqlite url has no path: {url}");
            }
            return Ok(Self {
                dialect: Dialect::Sqlite,
                target: path.to_string(),
            });
        }

        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            return Ok(Self {
                dialect: Dialect::Postgres,
                target: url.to_string(),
            });
        }

        bail!("unsupported rdb url scheme (expected sqlite:// or postgres://): {url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sqlite_url() {
        let url = DatabaseUrl::parse("sqlite:///var/lib/metrics.db").expect("parse");
        assert_eq!(url.dialect, Dialect::Sqlite);
        assert_eq!(url.target, "/var/lib/metrics.db");

        let url = DatabaseUrl::parse("SQLITE://metrics.db").expect("parse");
        assert_eq!(url.target, "metrics.db");
    }

    #[test]
    fn test_parse_postgres_url() {
        let raw = "postgresql://user:pw@db:5432/metrics";
        let url = DatabaseUrl::parse(raw).expect("parse");
        assert_eq!(url.dialect, Dialect::Postgres);
        assert_eq!(url.target, raw);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(DatabaseUrl::parse("mysql://localhost/metrics").is_err());
        assert!(DatabaseUrl::parse("sqlite://").is_err());
        assert!(DatabaseUrl::parse("metrics.db").is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Sqlite.placeholder(3), "?3");
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Postgres.placeholder_tuple(4, 3), "($4, $5, $6)");
    }

    #[test]
    fn test_insert_if_absent() {
        assert_eq!(
            Dialect::Sqlite.insert_if_absent("p_data", &["base_time", "metric_id", "segment_id"], 1),
            "INSERT OR IGNORE INTO p_data (base_time, metric_id, segment_id) VALUES (?1, ?2, ?3)"
        );
        assert_eq!(
            Dialect::Postgres.insert_if_absent("p_data", &["a", "b"], 2),
            "INSERT INTO p_data (a, b) VALUES ($1, $2), ($3, $4) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn test_insert_returning_id() {
        assert_eq!(
            Dialect::Sqlite.insert_returning_id("p_segment_values", &["name"]),
            "INSERT INTO p_segment_values (name) VALUES (?1)"
        );
        assert_eq!(
            Dialect::Postgres.insert_returning_id("p_segment_values", &["name"]),
            "INSERT INTO p_segment_values (name) VALUES ($1) RETURNING id"
        );
    }
}
