use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::{ColumnValue, EntityRow, UpsertOutcome};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgDatabaseError, PgPoolOptions, PgSslMode};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error};

use crate::{EntityStore, StoreError, StoreSession, UpsertStatement};

/// SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; wins over the individual parts when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub require_tls: bool,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            require_tls: false,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("require_tls", &self.require_tls)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return url.parse();
        }
        let ssl_mode = if self.require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(ssl_mode))
    }
}

/// Postgres-backed store over one pool shared by every sync job.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the pool without connecting; reachability is checked per job.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(config.connect_options()?);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn lease(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let conn = self.pool.acquire().await.map_err(StoreError::Connection)?;
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn ping(&mut self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&mut *self.conn)
            .await
            .map_err(StoreError::Connection)?;
        Ok(())
    }

    async fn apply(
        &mut self,
        statement: &UpsertStatement,
        row: &EntityRow,
    ) -> Result<UpsertOutcome, StoreError> {
        let sql = statement.to_sql();
        let mut query = sqlx::query(&sql);
        for column in statement.columns {
            let value = row.get(column).ok_or_else(|| StoreError::MissingColumn {
                table: statement.table,
                column,
                key: row.key.clone(),
            })?;
            query = bind_value(query, value);
        }

        let returned = query
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|err| classify_database_error(err, statement, row))?;

        let outcome = match returned {
            None => UpsertOutcome::Unaffected,
            Some(returned) if returned.try_get::<bool, _>("inserted")? => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        };
        debug!(table = statement.table, key = %row.key, ?outcome, "upsert applied");
        Ok(outcome)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ColumnValue::Text(v) => query.bind(v.clone()),
        ColumnValue::Bool(v) => query.bind(*v),
        ColumnValue::Int(v) => query.bind(*v),
        ColumnValue::Float(v) => query.bind(*v),
        ColumnValue::Json(v) => query.bind(v.clone()),
    }
}

/// Map a failed upsert to a [`StoreError`], singling out unique violations.
pub fn classify_database_error(
    err: sqlx::Error,
    statement: &UpsertStatement,
    row: &EntityRow,
) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let constraint = db_err.constraint().unwrap_or_default().to_string();
            let detail = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .map(str::to_string);
            error!(
                table = statement.table,
                key = %row.key,
                %constraint,
                detail = detail.as_deref().unwrap_or_default(),
                "unique constraint violation"
            );
            return statement.uniqueness_conflict(row, &constraint, detail);
        }
    }
    StoreError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::CITIES;

    #[test]
    fn connect_options_from_parts() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            port: 6543,
            database: "mirror".into(),
            user: "sync".into(),
            password: "pw".into(),
            ..Default::default()
        };
        let opts = config.connect_options().unwrap();
        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_database(), Some("mirror"));
        assert_eq!(opts.get_username(), "sync");
    }

    #[test]
    fn connect_options_prefer_url() {
        let config = DatabaseConfig {
            url: Some("postgres://u:p@elsewhere:5555/other".into()),
            ..Default::default()
        };
        let opts = config.connect_options().unwrap();
        assert_eq!(opts.get_host(), "elsewhere");
        assert_eq!(opts.get_port(), 5555);
        assert_eq!(opts.get_database(), Some("other"));
    }

    #[test]
    fn debug_output_hides_password() {
        let config = DatabaseConfig {
            password: "hunter2".into(),
            url: Some("postgres://u:hunter2@h/db".into()),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct ServerError {
        code: &'static str,
        constraint: Option<&'static str>,
        message: &'static str,
    }

    impl sqlx::error::DatabaseError for ServerError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.code {
                UNIQUE_VIOLATION => sqlx::error::ErrorKind::UniqueViolation,
                "23503" => sqlx::error::ErrorKind::ForeignKeyViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    fn server_error(code: &'static str, constraint: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(ServerError {
            code,
            constraint: Some(constraint),
            message: "constraint violated",
        }))
    }

    fn bogota(id: &str) -> EntityRow {
        EntityRow::new(id)
            .with("id", ColumnValue::text(id))
            .with("name", ColumnValue::text("Bogota"))
            .with("is_public", ColumnValue::Bool(true))
    }

    #[test]
    fn unique_violation_on_name_is_a_uniqueness_conflict() {
        let err = classify_database_error(
            server_error(UNIQUE_VIOLATION, "Cities_name_key"),
            &CITIES,
            &bogota("11"),
        );
        match err {
            StoreError::UniquenessConflict {
                table,
                constraint,
                column,
                key,
                value,
                detail,
            } => {
                assert_eq!(table, "Cities");
                assert_eq!(constraint, "Cities_name_key");
                assert_eq!(column, Some("name"));
                assert_eq!(key, "11");
                assert_eq!(value, "Bogota");
                assert_eq!(detail, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn other_constraint_violations_stay_generic() {
        let err = classify_database_error(
            server_error("23503", "Typologies_project_id_fkey"),
            &CITIES,
            &bogota("11"),
        );
        assert!(matches!(err, StoreError::Database(sqlx::Error::Database(_))));
        assert!(!err.is_uniqueness_conflict());
    }

    #[test]
    fn non_database_errors_stay_generic() {
        let row = EntityRow::new("1");
        let err = classify_database_error(sqlx::Error::RowNotFound, &CITIES, &row);
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }

    #[tokio::test]
    async fn lazy_pool_reports_unreachable_database_on_lease() {
        let config = DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 1,
            acquire_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let store = PgStore::connect_lazy(&config).unwrap();
        let err = match store.lease().await {
            Ok(_) => panic!("lease should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
