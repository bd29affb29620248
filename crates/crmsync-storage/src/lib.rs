//! Relational mirror store: upsert statement templates, Postgres and in-memory backends.

use async_trait::async_trait;
use crmsync_core::{EntityRow, UpsertOutcome};
use thiserror::Error;

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{classify_database_error, DatabaseConfig, PgStore, UNIQUE_VIOLATION};

/// A unique constraint other than the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: &'static str,
    pub column: &'static str,
}

/// Insert-or-update template for one table.
///
/// `columns` lists every persisted column including `key_column`; all the others
/// are written back on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStatement {
    pub table: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
    pub unique_constraints: &'static [UniqueConstraint],
}

impl UpsertStatement {
    pub fn mutable_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .copied()
            .filter(move |column| *column != self.key_column)
    }

    /// Render the statement. Binds are `$1..$n` in `columns` order.
    ///
    /// The `IS DISTINCT FROM` guard turns an identical re-apply into a zero-row
    /// result, and `xmax = 0` tells a fresh insert apart from an update.
    pub fn to_sql(&self) -> String {
        let column_list = self.columns.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mutable = self.mutable_columns().collect::<Vec<_>>();
        let conflict_action = if mutable.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = mutable
                .iter()
                .map(|c| format!("{} = EXCLUDED.{}", quoted(c), quoted(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let current = mutable
                .iter()
                .map(|c| format!("t.{}", quoted(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let incoming = mutable
                .iter()
                .map(|c| format!("EXCLUDED.{}", quoted(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "DO UPDATE SET {assignments} WHERE ({current}) IS DISTINCT FROM ({incoming})"
            )
        };

        format!(
            "INSERT INTO public.\"{table}\" AS t ({column_list}) VALUES ({placeholders}) \
             ON CONFLICT (\"{key}\") {conflict_action} \
             RETURNING (xmax = 0) AS inserted",
            table = self.table,
            key = self.key_column,
        )
    }

    /// Build the conflict error for a unique violation on `constraint`.
    pub fn uniqueness_conflict(
        &self,
        row: &EntityRow,
        constraint: &str,
        detail: Option<String>,
    ) -> StoreError {
        let declared = self.unique_constraints.iter().find(|uc| uc.name == constraint);
        let value = declared
            .and_then(|uc| row.get(uc.column))
            .map(|v| v.display())
            .or_else(|| detail.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        StoreError::UniquenessConflict {
            table: self.table,
            constraint: constraint.to_string(),
            column: declared.map(|uc| uc.column),
            key: row.key.clone(),
            value,
            detail,
        }
    }
}

fn quoted(column: &str) -> String {
    format!("\"{column}\"")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection unavailable: {0}")]
    Connection(#[source] sqlx::Error),
    #[error(
        "uniqueness conflict on {table} ({constraint}): row {key} wants value `{value}` already held by another row"
    )]
    UniquenessConflict {
        table: &'static str,
        constraint: String,
        column: Option<&'static str>,
        key: String,
        value: String,
        detail: Option<String>,
    },
    #[error("row {key} for {table} has no value for column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
        key: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_uniqueness_conflict(&self) -> bool {
        matches!(self, StoreError::UniquenessConflict { .. })
    }
}

/// Source of exclusive connection leases over a shared pool.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn lease(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// One leased connection. Dropping the session returns it to the pool.
#[async_trait]
pub trait StoreSession: Send {
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn apply(
        &mut self,
        statement: &UpsertStatement,
        row: &EntityRow,
    ) -> Result<UpsertOutcome, StoreError>;
}
