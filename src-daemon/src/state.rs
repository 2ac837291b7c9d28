use anyhow::Context;
use mailtide_config::{AppConfig, ConfigManager};
use mailtide_mail::MailService;
use mailtide_security::{SecretKey, SecretStore};
use mailtide_storage::Storage;
use uuid::Uuid;

const KEYCHAIN_SERVICE: &str = "io.mailtide.daemon";

pub struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) secrets: SecretStore,
    pub(crate) mail: MailService,
}

impl AppState {
    pub async fn initialize(config_manager: &ConfigManager, config: AppConfig) -> anyhow::Result<Self> {
        let db_path = config_manager.data_dir().join(&config.database.file_name);
        let storage = Storage::connect(&db_path)
            .await
            .context("initialize sqlite storage")?;

        let mail = MailService::from_config(storage, &config.sync);
        let secrets = SecretStore::new(KEYCHAIN_SERVICE);

        tracing::debug!(db = %db_path.display(), "mailtide state ready");
        Ok(Self {
            config,
            secrets,
            mail,
        })
    }

    pub fn password(&self, account_id: Uuid) -> anyhow::Result<String> {
        self.secrets
            .get(&SecretKey::mail_password(account_id))
            .context("load account password from keychain")?
            .with_context(|| format!("no password stored for account {account_id}"))
    }
}
