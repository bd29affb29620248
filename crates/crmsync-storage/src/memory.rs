use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use crmsync_core::{ColumnValue, EntityRow, UpsertOutcome};
use tracing::debug;

use crate::{EntityStore, StoreError, StoreSession, UpsertStatement};

/// In-process store with the same primary-key, unique-constraint and no-op
/// semantics as the Postgres statements. Backs dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: Mutex<BTreeMap<&'static str, BTreeMap<String, EntityRow>>>,
    unavailable: AtomicBool,
    open_leases: AtomicUsize,
    total_leases: AtomicUsize,
    statements: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent lease fail as if the pool timed out.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed a row directly, bypassing constraint checks.
    pub fn seed(&self, table: &'static str, row: EntityRow) {
        let mut tables = self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.entry(table).or_default().insert(row.key.clone(), row);
    }

    pub fn rows(&self, table: &str) -> Vec<EntityRow> {
        let tables = self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &str) -> Option<EntityRow> {
        let tables = self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Upsert statements issued so far, including failed ones.
    pub fn statements_executed(&self) -> usize {
        self.inner.statements.load(Ordering::SeqCst)
    }

    pub fn open_leases(&self) -> usize {
        self.inner.open_leases.load(Ordering::SeqCst)
    }

    pub fn total_leases(&self) -> usize {
        self.inner.total_leases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn lease(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(sqlx::Error::PoolTimedOut));
        }
        self.inner.open_leases.fetch_add(1, Ordering::SeqCst);
        self.inner.total_leases.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySession {
    inner: Arc<MemoryInner>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.open_leases.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn ping(&mut self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    async fn apply(
        &mut self,
        statement: &UpsertStatement,
        row: &EntityRow,
    ) -> Result<UpsertOutcome, StoreError> {
        self.inner.statements.fetch_add(1, Ordering::SeqCst);

        let mut stored = EntityRow::new(row.key.clone());
        for column in statement.columns {
            let value = row.get(column).ok_or_else(|| StoreError::MissingColumn {
                table: statement.table,
                column,
                key: row.key.clone(),
            })?;
            stored.set(column, value.clone());
        }

        let mut tables = self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(statement.table).or_default();

        for constraint in statement.unique_constraints {
            // NULLs never collide under a unique constraint.
            let value = match stored.get(constraint.column) {
                None | Some(ColumnValue::Text(None) | ColumnValue::Json(None)) => continue,
                Some(value) => value,
            };
            let taken = table
                .values()
                .any(|other| other.key != stored.key && other.get(constraint.column) == Some(value));
            if taken {
                let detail = format!(
                    "Key ({})=({}) already exists.",
                    constraint.column,
                    value.display()
                );
                return Err(statement.uniqueness_conflict(&stored, constraint.name, Some(detail)));
            }
        }

        let outcome = match table.get(&stored.key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.columns == stored.columns => UpsertOutcome::Unaffected,
            Some(_) => UpsertOutcome::Updated,
        };
        if outcome.is_processed() {
            table.insert(stored.key.clone(), stored);
        }
        debug!(table = statement.table, key = %row.key, ?outcome, "memory upsert applied");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::CITIES;
    use crmsync_core::{CanonicalEntity, City};

    fn city(id: &str, name: &str) -> EntityRow {
        City {
            id: id.into(),
            name: name.into(),
            is_public: true,
        }
        .to_row()
    }

    #[tokio::test]
    async fn reapplying_the_same_row_is_a_noop() {
        let store = MemoryStore::new();
        let mut session = store.lease().await.unwrap();

        let first = session.apply(&CITIES, &city("10", "Bogota")).await.unwrap();
        let second = session.apply(&CITIES, &city("10", "Bogota")).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Unaffected);
        assert_eq!(store.rows("Cities").len(), 1);
    }

    #[tokio::test]
    async fn changed_values_update_in_place() {
        let store = MemoryStore::new();
        let mut session = store.lease().await.unwrap();
        session.apply(&CITIES, &city("10", "Bogota")).await.unwrap();

        let outcome = session.apply(&CITIES, &city("10", "Bogota DC")).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        let row = store.row("Cities", "10").unwrap();
        assert_eq!(row.get("name"), Some(&ColumnValue::text("Bogota DC")));
    }

    #[tokio::test]
    async fn secondary_unique_collision_is_a_conflict() {
        let store = MemoryStore::new();
        let mut session = store.lease().await.unwrap();
        session.apply(&CITIES, &city("10", "Bogota")).await.unwrap();

        let err = session.apply(&CITIES, &city("11", "Bogota")).await.unwrap_err();

        match err {
            StoreError::UniquenessConflict {
                constraint, value, key, ..
            } => {
                assert_eq!(constraint, "Cities_name_key");
                assert_eq!(value, "Bogota");
                assert_eq!(key, "11");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(store.row("Cities", "11").is_none());
    }

    #[tokio::test]
    async fn null_unique_values_do_not_collide() {
        let store = MemoryStore::new();
        let mut session = store.lease().await.unwrap();
        let nameless = |id: &str| {
            EntityRow::new(id)
                .with("id", ColumnValue::text(id))
                .with("name", ColumnValue::Text(None))
                .with("is_public", ColumnValue::Bool(true))
        };

        session.apply(&CITIES, &nameless("10")).await.unwrap();
        let outcome = session.apply(&CITIES, &nameless("11")).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(store.rows("Cities").len(), 2);
    }

    #[tokio::test]
    async fn missing_column_is_rejected() {
        let store = MemoryStore::new();
        let mut session = store.lease().await.unwrap();
        let row = EntityRow::new("10").with("id", ColumnValue::text("10"));

        let err = session.apply(&CITIES, &row).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { column: "name", .. }));
    }

    #[tokio::test]
    async fn dropping_a_session_releases_its_lease() {
        let store = MemoryStore::new();
        let session = store.lease().await.unwrap();
        assert_eq!(store.open_leases(), 1);
        drop(session);
        assert_eq!(store.open_leases(), 0);
        assert_eq!(store.total_leases(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_refuses_leases() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.lease().await, Err(StoreError::Connection(_))));
        assert_eq!(store.open_leases(), 0);
    }
}
