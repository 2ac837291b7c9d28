use crate::{MailError, SyncController};
use chrono::Utc;
use mailtide_config::SyncConfig;
use mailtide_core::{AccountConfig, Cursor, MailAccount, MessageId, Protocol, SyncBatch};
use mailtide_storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::info;
use uuid::Uuid;

/// Account-level entry point: verified account records plus cursor bookkeeping
/// around [`SyncController`].
#[derive(Clone)]
pub struct MailService {
    storage: Storage,
    sync: SyncController,
    max_parallel_per_host: usize,
    account_locks: Arc<Mutex<HashMap<Uuid, Arc<Semaphore>>>>,
    host_semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl MailService {
    pub fn new(storage: Storage, sync: SyncController, max_parallel_per_host: usize) -> Self {
        Self {
            storage,
            sync,
            max_parallel_per_host: max_parallel_per_host.max(1),
            account_locks: Arc::new(Mutex::new(HashMap::new())),
            host_semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(storage: Storage, config: &SyncConfig) -> Self {
        Self::new(
            storage,
            SyncController::new(config.into()),
            config.max_parallel_per_host,
        )
    }

    /// One poll per account at a time.
    async fn acquire_account_permit(&self, account_id: Uuid) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut map = self.account_locks.lock().await;
            map.entry(account_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.acquire_owned().await.ok()
    }

    /// Limits concurrent sessions against one mail server.
    async fn acquire_host_permit(&self, host: &str) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut map = self.host_semaphores.lock().await;
            map.entry(host.trim().to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_parallel_per_host)))
                .clone()
        };

        sem.acquire_owned().await.ok()
    }

    /// Verifies the credentials against the server and stores the account with no cursor.
    pub async fn add_account(
        &self,
        alias: &str,
        config: &AccountConfig,
    ) -> Result<MailAccount, MailError> {
        validate_config(config)?;

        let _permit = self.acquire_host_permit(&config.host).await;
        self.sync.connect(config).await?;

        let alias = match alias.trim() {
            "" => config.email.trim(),
            alias => alias,
        };
        let account = MailAccount::new(alias, config);
        self.storage.upsert_account(&account).await?;

        info!(
            account_id = %account.id,
            protocol = %account.protocol,
            host = %account.host,
            "mail account added"
        );
        Ok(account)
    }

    pub async fn list_accounts(&self) -> Result<Vec<MailAccount>, MailError> {
        Ok(self.storage.list_accounts().await?)
    }

    pub async fn account(&self, account_id: Uuid) -> Result<MailAccount, MailError> {
        self.storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| MailError::Data(format!("unknown mail account {account_id}")))
    }

    pub async fn remove_account(&self, account_id: Uuid) -> Result<(), MailError> {
        let _permit = self.acquire_account_permit(account_id).await;
        if !self.storage.delete_account(account_id).await? {
            return Err(MailError::Data(format!(
                "unknown mail account {account_id}"
            )));
        }

        self.account_locks.lock().await.remove(&account_id);
        info!(account_id = %account_id, "mail account removed");
        Ok(())
    }

    /// Polls with the stored cursor and persists the cursor the poll returned.
    pub async fn poll_account(
        &self,
        account_id: Uuid,
        password: &str,
    ) -> Result<SyncBatch, MailError> {
        let _account_permit = self.acquire_account_permit(account_id).await;
        let account = self.account(account_id).await?;
        let _host_permit = self.acquire_host_permit(&account.host).await;

        let config = account.config(password);
        let batch = self.sync.poll(&config, &account.cursor).await?;

        self.storage
            .save_cursor(account_id, &batch.cursor, Some(Utc::now()))
            .await?;

        info!(
            account_id = %account_id,
            kind = ?batch.kind,
            messages = batch.messages.len(),
            "mail account polled"
        );
        Ok(batch)
    }

    /// Forgets the cursor so the next poll starts over with an initial sync.
    pub async fn reset_cursor(&self, account_id: Uuid) -> Result<(), MailError> {
        self.set_cursor(account_id, &Cursor::Unset).await
    }

    /// Replaces the stored cursor, e.g. with one carried over from another client.
    /// The next poll continues after it.
    pub async fn set_cursor(&self, account_id: Uuid, cursor: &Cursor) -> Result<(), MailError> {
        let _permit = self.acquire_account_permit(account_id).await;
        let account = self.account(account_id).await?;
        let fits = match (cursor, account.protocol) {
            (Cursor::At(MessageId::Uid(_)), Protocol::Imap)
            | (Cursor::At(MessageId::Uidl(_)), Protocol::Pop3) => true,
            (Cursor::At(_), _) => false,
            (Cursor::Unset | Cursor::Empty, _) => true,
        };
        if !fits {
            return Err(MailError::Data(format!(
                "cursor {cursor:?} does not belong to a {} mailbox",
                account.protocol
            )));
        }

        self.storage.save_cursor(account_id, cursor, None).await?;

        info!(account_id = %account_id, cursor = ?cursor, "mail account cursor replaced");
        Ok(())
    }
}

fn validate_config(config: &AccountConfig) -> Result<(), MailError> {
    if config.host.trim().is_empty() {
        return Err(MailError::Data("mail server host is required".to_string()));
    }
    if config.port == 0 {
        return Err(MailError::Data("mail server port must be non-zero".to_string()));
    }
    if config.email.trim().is_empty() {
        return Err(MailError::Data("email address is required".to_string()));
    }
    let fields = [
        ("mail server host", &config.host),
        ("email address", &config.email),
        ("password", &config.password),
    ];
    for (field, value) in fields {
        if value.chars().any(char::is_control) {
            return Err(MailError::Data(format!("{field} contains control characters")));
        }
    }
    Ok(())
}
