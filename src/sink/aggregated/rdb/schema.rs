use super::dialect::Dialect;
use super::layout::{slot_column, ROW_SLOTS};

/// Columns of the data table's primary key, in bind order.
pub const DATA_KEY_COLUMNS: [&str; 3] = ["base_time", "metric_id", "segment_id"];

/// Table names derived from the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub metric_tags: String,
    pub segment_values: String,
    pub data: String,
}

impl Tables {
    pub fn new(prefix: &str) -> Self {
        Self {
            metric_tags: format!("{prefix}_metric_tags"),
            segment_values: format!("{prefix}_segment_values"),
            data: format!("{prefix}_data"),
        }
    }
}

/// SQL text for one dialect and table prefix.
#[derive(Debug, Clone)]
pub struct Statements {
    pub dialect: Dialect,
    pub tables: Tables,
}

impl Statements {
    pub fn new(dialect: Dialect, prefix: &str) -> Self {
        Self {
            dialect,
            tables: Tables::new(prefix),
        }
    }

    /// Idempotent DDL for the three tables, one statement per entry.
    pub fn create_tables(&self) -> Vec<String> {
        let d = self.dialect;
        let t = &self.tables;

        let metric_tags = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   id {id},\n\
             \x20   metric_name {text} NOT NULL,\n\
             \x20   segment_name {text} NOT NULL DEFAULT '',\n\
             \x20   UNIQUE (metric_name, segment_name)\n\
             )",
            table = t.metric_tags,
            id = d.id_column(),
            text = d.text_type(),
        );

        let segment_values = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   id {id},\n\
             \x20   name {text} NOT NULL UNIQUE\n\
             )",
            table = t.segment_values,
            id = d.id_column(),
            text = d.text_type(),
        );

        let value_columns: Vec<String> = (0..ROW_SLOTS)
            .map(|slot| {
                format!(
                    "    {} {} NOT NULL DEFAULT 0",
                    slot_column(slot),
                    d.float_type()
                )
            })
            .collect();

        let data = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   base_time {int} NOT NULL,\n\
             \x20   metric_id {int} NOT NULL,\n\
             \x20   segment_id {int} NOT NULL DEFAULT 0,\n\
             {values},\n\
             \x20   PRIMARY KEY (base_time, metric_id, segment_id)\n\
             )",
            table = t.data,
            int = d.int_type(),
            values = value_columns.join(",\n"),
        );

        vec![metric_tags, segment_values, data]
    }

    pub fn select_metric_tags(&self) -> String {
        format!(
            "SELECT id, metric_name, segment_name FROM {}",
            self.tables.metric_tags
        )
    }

    pub fn insert_metric_tag(&self) -> String {
        self.dialect
            .insert_returning_id(&self.tables.metric_tags, &["metric_name", "segment_name"])
    }

    pub fn select_segment_values(&self) -> String {
        format!("SELECT id, name FROM {}", self.tables.segment_values)
    }

    pub fn insert_segment_value(&self) -> String {
        self.dialect
            .insert_returning_id(&self.tables.segment_values, &["name"])
    }

    /// Insert-if-absent for `rows` data row keys.
    pub fn create_data_rows(&self, rows: usize) -> String {
        self.dialect
            .insert_if_absent(&self.tables.data, &DATA_KEY_COLUMNS, rows)
    }

    /// Largest number of row keys one creation statement may carry.
    pub fn max_rows_per_insert(&self) -> usize {
        if self.dialect.supports_multi_row_insert() {
            self.dialect.max_bind_params() / DATA_KEY_COLUMNS.len()
        } else {
            1
        }
    }

    /// Increment statement for the given slots. Binds the slot deltas first,
    /// in order, followed by the three key columns.
    pub fn increment_slots(&self, slots: &[usize]) -> String {
        let d = self.dialect;
        let assignments: Vec<String> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let column = slot_column(*slot);
                format!("{column} = {column} + {}", d.placeholder(i + 1))
            })
            .collect();

        let n = slots.len();
        format!(
            "UPDATE {} SET {} WHERE base_time = {} AND metric_id = {} AND segment_id = {}",
            self.tables.data,
            assignments.join(", "),
            d.placeholder(n + 1),
            d.placeholder(n + 2),
            d.placeholder(n + 3),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let tables = Tables::new("ms");
        assert_eq!(tables.metric_tags, "ms_metric_tags");
        assert_eq!(tables.segment_values, "ms_segment_values");
        assert_eq!(tables.data, "ms_data");
    }

    #[test]
    fn test_create_tables_sqlite() {
        let ddl = Statements::new(Dialect::Sqlite, "ms").create_tables();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].contains("CREATE TABLE IF NOT EXISTS ms_metric_tags"));
        assert!(ddl[0].contains("segment_name TEXT NOT NULL DEFAULT ''"));
        assert!(ddl[1].contains("name TEXT NOT NULL UNIQUE"));
        assert!(ddl[2].contains("m0 REAL NOT NULL DEFAULT 0"));
        assert!(ddl[2].contains("m59 REAL NOT NULL DEFAULT 0"));
        assert!(!ddl[2].contains("m60"));
        assert!(ddl[2].contains("PRIMARY KEY (base_time, metric_id, segment_id)"));
    }

    #[test]
    fn test_create_tables_postgres() {
        let ddl = Statements::new(Dialect::Postgres, "ms").create_tables();
        assert!(ddl[0].contains("id BIGSERIAL PRIMARY KEY"));
        assert!(ddl[2].contains("base_time BIGINT NOT NULL"));
        assert!(ddl[2].contains("m7 DOUBLE PRECISION NOT NULL DEFAULT 0"));
    }

    #[test]
    fn test_increment_slots() {
        let sql = Statements::new(Dialect::Sqlite, "ms").increment_slots(&[3, 17]);
        assert_eq!(
            sql,
            "UPDATE ms_data SET m3 = m3 + ?1, m17 = m17 + ?2 \
             WHERE base_time = ?3 AND metric_id = ?4 AND segment_id = ?5"
        );
    }

    #[test]
    fn test_max_rows_per_insert() {
        assert_eq!(Statements::new(Dialect::Sqlite, "ms").max_rows_per_insert(), 1);
        assert_eq!(
            Statements::new(Dialect::Postgres, "ms").max_rows_per_insert(),
            21_845
        );
    }
}
