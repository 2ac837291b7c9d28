use crate::StorageError;
use chrono::{DateTime, Utc};
use mailtide_core::{Cursor, MailAccount};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Account records and sync cursors. Passwords are never written here.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %db_path.display(), "opened sqlite database");
        Self::migrate(pool).await
    }

    /// Private database that lives as long as the returned handle.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert_account(&self, account: &MailAccount) -> Result<(), StorageError> {
        let protocol = serde_json::to_string(&account.protocol)?;
        let cursor = serde_json::to_string(&account.cursor)?;

        sqlx::query(
            r#"
            INSERT INTO mail_accounts (
              id, alias, protocol, host, port, use_ssl, email_address,
              cursor_json, last_synced_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
              alias = excluded.alias,
              protocol = excluded.protocol,
              host = excluded.host,
              port = excluded.port,
              use_ssl = excluded.use_ssl,
              email_address = excluded.email_address,
              cursor_json = excluded.cursor_json,
              last_synced_at = excluded.last_synced_at,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(account.id.to_string())
        .bind(&account.alias)
        .bind(protocol)
        .bind(&account.host)
        .bind(i64::from(account.port))
        .bind(i64::from(account.use_ssl))
        .bind(&account.email)
        .bind(cursor)
        .bind(account.last_synced_at.map(|at| at.to_rfc3339()))
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<MailAccount>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, alias, protocol, host, port, use_ssl, email_address,
                   cursor_json, last_synced_at, created_at, updated_at
            FROM mail_accounts
            ORDER BY alias, email_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<MailAccount>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, alias, protocol, host, port, use_ssl, email_address,
                   cursor_json, last_synced_at, created_at, updated_at
            FROM mail_accounts
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_account).transpose()
    }

    /// Returns whether a record was removed.
    pub async fn delete_account(&self, account_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM mail_accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_cursor(
        &self,
        account_id: Uuid,
        cursor: &Cursor,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE mail_accounts
            SET cursor_json = ?2,
                last_synced_at = COALESCE(?3, last_synced_at),
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(cursor)?)
        .bind(synced_at.map(|at| at.to_rfc3339()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AccountNotFound(account_id));
        }

        Ok(())
    }

    fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Result<MailAccount, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let protocol_raw: String = row.try_get("protocol")?;
        let cursor_raw: String = row.try_get("cursor_json")?;
        let port_raw: i64 = row.try_get("port")?;
        let synced_raw: Option<String> = row.try_get("last_synced_at")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(MailAccount {
            id: parse_uuid(&id_raw, "mail_accounts.id")?,
            alias: row.try_get("alias")?,
            protocol: parse_json(&protocol_raw, "mail_accounts.protocol")?,
            host: row.try_get("host")?,
            port: u16::try_from(port_raw).map_err(|err| {
                StorageError::Data(format!("invalid port for mail_accounts.port: {err}"))
            })?,
            use_ssl: row.try_get::<i64, _>("use_ssl")? == 1,
            email: row.try_get("email_address")?,
            cursor: parse_json(&cursor_raw, "mail_accounts.cursor_json")?,
            last_synced_at: synced_raw
                .as_deref()
                .map(|raw| parse_datetime(raw, "mail_accounts.last_synced_at"))
                .transpose()?,
            created_at: parse_datetime(&created_raw, "mail_accounts.created_at")?,
            updated_at: parse_datetime(&updated_raw, "mail_accounts.updated_at")?,
        })
    }
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}
