use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cursor or protocol encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no mail account with id {0}")]
    AccountNotFound(Uuid),
    #[error("corrupt account record: {0}")]
    Data(String),
}
