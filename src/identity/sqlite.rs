use async_trait::async_trait;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use uuid::Uuid;

use super::{LocalUser, NewUser, StoreError, StoreResult, UserStore};
use crate::config::SqliteConfig;

pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the pool described by `config`, running migrations if enabled.
    pub async fn connect(config: &SqliteConfig) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(config.create_if_missing)
                    .journal_mode(if config.wal_mode {
                        SqliteJournalMode::Wal
                    } else {
                        SqliteJournalMode::Delete
                    })
                    .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms)),
            )
            .await?;

        let store = Self::new(pool);
        if config.run_migrations {
            store.run_migrations().await?;
        }
        Ok(store)
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        tracing::info!("Running SQLite migrations");
        sqlx::migrate!("./migrations_sqlx/sqlite")
            .run(&self.pool)
            .await?;
        tracing::info!("SQLite migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn find_or_create_by_attribute(
        &self,
        attribute: &str,
        value: &str,
        new_user: NewUser,
    ) -> StoreResult<LocalUser> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, attribute, external_id, email, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (attribute, external_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(attribute)
        .bind(value)
        .bind(&new_user.email)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            tracing::info!(attribute, external_id = value, "Created local user");
        }

        let row = sqlx::query(
            r#"
            SELECT id, attribute, external_id, email, role_id, created_at
            FROM users
            WHERE attribute = ? AND external_id = ?
            "#,
        )
        .bind(attribute)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        let id: String = row.get("id");
        Ok(LocalUser {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Internal(format!("Invalid user id '{id}': {e}")))?,
            attribute: row.get("attribute"),
            external_id: row.get("external_id"),
            email: row.get("email"),
            role_id: row.get("role_id"),
            created_at: row.get("created_at"),
        })
    }
}
