use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::Did;

/// Local keyring: the identities this machine has verified and registered.
#[derive(Clone)]
pub struct IdentityStore {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub did: Did,
    pub email: String,
    pub secret_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl IdentityStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid identity database url '{database_url}'"))?
            .create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open identity database '{database_url}'"))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                did         TEXT PRIMARY KEY NOT NULL,
                email       TEXT NOT NULL,
                secret_key  BLOB NOT NULL,
                is_default  INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create identities table")?;
        Ok(())
    }

    /// Stores the identity and makes it the default one.
    pub async fn save_default_identity(&self, identity: &StoredIdentity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE identities SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO identities (did, email, secret_key, is_default, created_at) VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(did) DO UPDATE SET email = excluded.email, secret_key = excluded.secret_key, is_default = 1",
        )
        .bind(identity.did.as_str())
        .bind(&identity.email)
        .bind(&identity.secret_key)
        .bind(identity.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_default_identity(&self) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query(
            "SELECT did, email, secret_key, created_at FROM identities WHERE is_default = 1 LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredIdentity {
            did: Did(r.get::<String, _>(0)),
            email: r.get::<String, _>(1),
            secret_key: r.get::<Vec<u8>, _>(2),
            created_at: r.get::<DateTime<Utc>, _>(3),
        }))
    }

    /// Returns whether a row was removed.
    pub async fn delete_identity(&self, did: &Did) -> Result<bool> {
        let result = sqlx::query("DELETE FROM identities WHERE did = ?")
            .bind(did.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
