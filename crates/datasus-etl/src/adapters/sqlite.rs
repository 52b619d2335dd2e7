//! SQLite loader
//!
//! Writes each DBF table into its own `<stem>.sqlite` file next to the input,
//! in a table named after the stem. Column affinities follow the DBF field
//! types. All rows go in one transaction against a partial file that is
//! renamed into place only after commit.

use super::file_stem;
use crate::dbf::{DbfTable, FieldDescriptor, FieldType, Value};
use crate::error::Result;
use crate::identifier::DatasetIdentifier;
use crate::stage::{guard_existing, partial_path, Loader, StageOutcome};
use async_trait::async_trait;
use rusqlite::types::{Null, ToSqlOutput};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SQLITE_EXTENSION: &str = "sqlite";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteLoader;

impl SqliteLoader {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, input: &Path, overwrite: bool) -> Result<Option<PathBuf>> {
        let output = input.with_extension(SQLITE_EXTENSION);
        guard_existing(&output, overwrite).await?;

        let rows = tokio::task::spawn_blocking({
            let input = input.to_path_buf();
            let output = output.clone();
            move || load_sync(&input, &output)
        })
        .await??;

        info!("Loaded {} rows into {}", rows, output.display());
        Ok(Some(output))
    }
}

#[async_trait]
impl Loader for SqliteLoader {
    async fn load(&self, input: &Path, overwrite: bool) -> StageOutcome<Option<PathBuf>> {
        self.run(input, overwrite).await.into()
    }

    fn artifact_name(&self, identifier: &DatasetIdentifier) -> Option<String> {
        Some(identifier.filename_with(SQLITE_EXTENSION))
    }
}

fn load_sync(input: &Path, output: &Path) -> Result<usize> {
    let mut table = DbfTable::open(input)?;
    let staging = partial_path(output);
    if staging.exists() {
        std::fs::remove_file(&staging)?;
    }

    match write_table(&mut table, &staging, &file_stem(input)) {
        Ok(rows) => {
            std::fs::rename(&staging, output)?;
            Ok(rows)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            Err(e)
        }
    }
}

fn write_table(table: &mut DbfTable, path: &Path, name: &str) -> Result<usize> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;

    let fields = table.fields().to_vec();
    let columns = fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), column_type(f)))
        .collect::<Vec<_>>()
        .join(", ");
    let create = format!("CREATE TABLE {} ({})", quote_ident(name), columns);
    debug!(sql = %create, "Creating table");
    tx.execute_batch(&create)?;

    let placeholders = vec!["?"; fields.len()].join(", ");
    let mut rows = 0;
    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(name),
            placeholders
        ))?;
        for record in table.records() {
            let values = record?;
            insert.execute(params_from_iter(values.iter()))?;
            rows += 1;
        }
    }

    tx.commit()?;
    Ok(rows)
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_type(field: &FieldDescriptor) -> &'static str {
    match field.field_type {
        FieldType::Numeric if field.is_integer() => "INTEGER",
        FieldType::Numeric | FieldType::Float => "REAL",
        FieldType::Logical => "INTEGER",
        FieldType::Character | FieldType::Date | FieldType::Other(_) => "TEXT",
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(Null),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Integer(n) => ToSqlOutput::from(*n),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Logical(b) => ToSqlOutput::from(*b),
        })
    }
}
