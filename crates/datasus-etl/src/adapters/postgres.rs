//! Postgres loader
//!
//! Loads each DBF table into `<schema>."<stem>"` of a shared database. There
//! is no file artifact, so idempotency is decided here: an existing table is
//! a [`EtlError::StorageConflict`] unless overwriting, in which case it is
//! dropped and recreated. Drop, create and inserts share one transaction.

use super::file_stem;
use super::sqlite::quote_ident;
use crate::dbf::{DbfTable, FieldDescriptor, FieldType, Value};
use crate::error::{EtlError, Result};
use crate::identifier::DatasetIdentifier;
use crate::stage::{Loader, StageOutcome};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::Postgres;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Records decoded per trip to the blocking pool
const INSERT_BATCH: usize = 1000;

pub struct PostgresLoader {
    pool: PgPool,
    schema: String,
}

impl PostgresLoader {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Open a small pool against `url`
    pub async fn connect(url: &str, schema: impl Into<String>, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, schema))
    }

    async fn run(&self, input: &Path, overwrite: bool) -> Result<Option<PathBuf>> {
        let table_name = file_stem(input);
        let mut table = tokio::task::spawn_blocking({
            let input = input.to_path_buf();
            move || DbfTable::open(&input)
        })
        .await??;

        let schema = quote_ident(&self.schema);
        let qualified = format!("{}.{}", schema, quote_ident(&table_name));

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&self.schema)
        .bind(&table_name)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            if !overwrite {
                return Err(EtlError::StorageConflict(table_name));
            }
            warn!(table = %qualified, "Dropping existing table");
            sqlx::query(&format!("DROP TABLE {}", qualified))
                .execute(&mut *tx)
                .await?;
        }

        let fields = table.fields().to_vec();
        let columns = fields
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.name), column_type(f)))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!(
            "CREATE TABLE {} (id SERIAL PRIMARY KEY, {})",
            qualified, columns
        ))
        .execute(&mut *tx)
        .await?;

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified,
            fields
                .iter()
                .map(|f| quote_ident(&f.name))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=fields.len())
                .map(|i| format!("${}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut rows = 0;
        loop {
            // Records are read off the runtime, one batch at a time
            let (returned, batch) = tokio::task::spawn_blocking(move || {
                let batch = table.read_batch(INSERT_BATCH);
                (table, batch)
            })
            .await?;
            table = returned;

            let batch = batch?;
            if batch.is_empty() {
                break;
            }
            for values in batch {
                let mut query = sqlx::query(&insert);
                for (field, value) in fields.iter().zip(values) {
                    query = bind_value(query, field, value);
                }
                query.execute(&mut *tx).await?;
                rows += 1;
            }
        }

        tx.commit().await?;
        info!("Loaded {} rows into {}", rows, qualified);
        Ok(None)
    }
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn load(&self, input: &Path, overwrite: bool) -> StageOutcome<Option<PathBuf>> {
        self.run(input, overwrite).await.into()
    }

    fn artifact_name(&self, _identifier: &DatasetIdentifier) -> Option<String> {
        None
    }
}

fn column_type(field: &FieldDescriptor) -> &'static str {
    match field.field_type {
        FieldType::Numeric if field.is_integer() => "BIGINT",
        FieldType::Numeric | FieldType::Float => "DOUBLE PRECISION",
        FieldType::Logical => "BOOLEAN",
        FieldType::Character | FieldType::Date | FieldType::Other(_) => "TEXT",
    }
}

/// Bind `value` with the Rust type matching the column created for `field`
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    field: &FieldDescriptor,
    value: Value,
) -> Query<'q, Postgres, PgArguments> {
    match column_type(field) {
        "BIGINT" => query.bind(match value {
            Value::Integer(n) => Some(n),
            Value::Real(f) => Some(f as i64),
            _ => None,
        }),
        "DOUBLE PRECISION" => query.bind(match value {
            Value::Integer(n) => Some(n as f64),
            Value::Real(f) => Some(f),
            _ => None,
        }),
        "BOOLEAN" => query.bind(match value {
            Value::Logical(b) => Some(b),
            _ => None,
        }),
        _ => query.bind(match value {
            Value::Null => None,
            Value::Text(s) => Some(s),
            Value::Integer(n) => Some(n.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Logical(b) => Some(b.to_string()),
        }),
    }
}
