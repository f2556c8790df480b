//! Administrative user accounts.
//!
//! The core only needs to look users up and create the bootstrap admin; the
//! rest of user management sits outside this crate.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::instrument;

use crm_core::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminUser {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: String,
    pub real_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserStoreError {
    #[error("username `{0}` is already taken")]
    Conflict(String),

    #[error("user store unavailable: {0}")]
    Storage(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<AdminUser>, UserStoreError>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<AdminUser>, UserStoreError>;

    /// Fails with `Conflict` when the username is taken.
    async fn insert(&self, user: AdminUser) -> Result<(), UserStoreError>;
}

/// In-memory store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<UserId, AdminUser>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<UserId, AdminUser>> {
        self.users.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<AdminUser>, UserStoreError> {
        Ok(self.read().values().find(|u| u.username == username).cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<AdminUser>, UserStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn insert(&self, user: AdminUser) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if users.values().any(|u| u.username == user.username) {
            return Err(UserStoreError::Conflict(user.username));
        }
        users.insert(user.id, user);
        Ok(())
    }
}

/// `users` table in Postgres.
#[derive(Clone)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(pool: &PgPool) -> Result<(), UserStoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                username VARCHAR(64) NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                email VARCHAR(255) NOT NULL DEFAULT '',
                real_name VARCHAR(128) NOT NULL DEFAULT '',
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_one_where(&self, column: &str, value: Bind<'_>) -> Result<Option<AdminUser>, UserStoreError> {
        let sql = format!(
            "SELECT id, username, password_hash, email, real_name, active, created_at
             FROM users WHERE {column} = $1"
        );
        let query = sqlx::query(&sql);
        let query = match value {
            Bind::Text(v) => query.bind(v),
            Bind::Id(v) => query.bind(*v.as_uuid()),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user", e))?;

        row.map(|row| {
            Ok::<_, sqlx::Error>(AdminUser {
                id: UserId::from_uuid(row.try_get("id")?),
                username: row.try_get("username")?,
                password_hash: row.try_get("password_hash")?,
                email: row.try_get("email")?,
                real_name: row.try_get("real_name")?,
                active: row.try_get("active")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("find_user", e))
    }
}

enum Bind<'a> {
    Text(&'a str),
    Id(UserId),
}

#[async_trait]
impl UserStore for PostgresUserStore {
    #[instrument(skip(self), err)]
    async fn find_by_username(&self, username: &str) -> Result<Option<AdminUser>, UserStoreError> {
        self.fetch_one_where("username", Bind::Text(username)).await
    }

    #[instrument(skip(self), err)]
    async fn find_by_id(&self, id: UserId) -> Result<Option<AdminUser>, UserStoreError> {
        self.fetch_one_where("id", Bind::Id(id)).await
    }

    #[instrument(skip(self, user), fields(username = %user.username), err)]
    async fn insert(&self, user: AdminUser) -> Result<(), UserStoreError> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, email, real_name, active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(&user.real_name)
        .bind(user.active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let unique_violation =
                matches!(&e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"));
            if unique_violation {
                UserStoreError::Conflict(user.username.clone())
            } else {
                map_sqlx_error("insert_user", e)
            }
        })?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> UserStoreError {
    UserStoreError::Storage(format!("{operation}: {err}"))
}
