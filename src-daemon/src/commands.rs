use crate::state::AppState;
use anyhow::{bail, Context};
use mailtide_core::{AccountConfig, Cursor, Protocol, SyncBatch, SyncKind};
use mailtide_mail::MailError;
use mailtide_security::SecretKey;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::sleep;
use uuid::Uuid;

const USAGE: &str = "usage: mailtide <accounts | add-account <json> | remove-account <id> | poll <id> | reset-cursor <id> | set-cursor <id> <cursor> | watch>";

#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    Accounts,
    AddAccount(AddAccountPayload),
    RemoveAccount(Uuid),
    Poll(Uuid),
    ResetCursor(Uuid),
    /// Cursor in the untyped form other clients store: `EMPTY_MAILBOX` or a bare id.
    SetCursor(Uuid, String),
    Watch,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddAccountPayload {
    #[serde(default)]
    pub alias: Option<String>,
    pub protocol: Protocol,
    pub host: String,
    /// Protocol default for the TLS setting when omitted.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(rename = "useSSL", default = "default_use_ssl")]
    pub use_ssl: bool,
    pub email: String,
    pub password: String,
}

fn default_use_ssl() -> bool {
    true
}

impl AddAccountPayload {
    fn config(&self) -> AccountConfig {
        AccountConfig {
            protocol: self.protocol,
            host: self.host.trim().to_string(),
            port: self
                .port
                .unwrap_or_else(|| self.protocol.default_port(self.use_ssl)),
            use_ssl: self.use_ssl,
            email: self.email.trim().to_string(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollOutput<'a> {
    account_id: Uuid,
    kind: SyncKind,
    cursor: &'a Cursor,
    legacy_cursor: Option<String>,
    messages: &'a [mailtide_core::NormalizedMessage],
}

impl<'a> PollOutput<'a> {
    fn new(account_id: Uuid, batch: &'a SyncBatch) -> Self {
        Self {
            account_id,
            kind: batch.kind,
            cursor: &batch.cursor,
            legacy_cursor: batch.cursor.to_legacy(),
            messages: &batch.messages,
        }
    }
}

impl Command {
    pub(crate) fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let Some(name) = args.next() else {
            return Ok(Command::Watch);
        };

        let command = match name.as_str() {
            "accounts" => Command::Accounts,
            "watch" => Command::Watch,
            "add-account" => {
                let raw = args.next().context(USAGE)?;
                let payload = serde_json::from_str(&raw).context("parse add-account payload")?;
                Command::AddAccount(payload)
            }
            "remove-account" => Command::RemoveAccount(account_id_arg(args.next())?),
            "poll" => Command::Poll(account_id_arg(args.next())?),
            "reset-cursor" => Command::ResetCursor(account_id_arg(args.next())?),
            "set-cursor" => {
                let account_id = account_id_arg(args.next())?;
                Command::SetCursor(account_id, args.next().context(USAGE)?)
            }
            other => bail!("unknown command '{other}'\n{USAGE}"),
        };

        if let Some(extra) = args.next() {
            bail!("unexpected argument '{extra}'\n{USAGE}");
        }
        Ok(command)
    }
}

fn account_id_arg(raw: Option<String>) -> anyhow::Result<Uuid> {
    let raw = raw.context(USAGE)?;
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid account id '{raw}'"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn mail_error(err: MailError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

pub(crate) async fn run(state: &AppState, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Accounts => print_json(&state.mail.list_accounts().await.map_err(mail_error)?),
        Command::AddAccount(payload) => add_account(state, payload).await,
        Command::RemoveAccount(account_id) => {
            state
                .mail
                .remove_account(account_id)
                .await
                .map_err(mail_error)?;
            state
                .secrets
                .delete(&SecretKey::mail_password(account_id))
                .context("delete account password from keychain")?;
            print_json(&serde_json::json!({ "removed": account_id }))
        }
        Command::Poll(account_id) => {
            let password = state.password(account_id)?;
            let batch = state
                .mail
                .poll_account(account_id, &password)
                .await
                .map_err(mail_error)?;
            print_json(&PollOutput::new(account_id, &batch))
        }
        Command::ResetCursor(account_id) => {
            state
                .mail
                .reset_cursor(account_id)
                .await
                .map_err(mail_error)?;
            print_json(&serde_json::json!({ "reset": account_id }))
        }
        Command::SetCursor(account_id, raw) => {
            let account = state.mail.account(account_id).await.map_err(mail_error)?;
            let cursor = Cursor::from_legacy(account.protocol, Some(raw.as_str()))
                .with_context(|| format!("'{raw}' is not a {} cursor", account.protocol))?;
            state
                .mail
                .set_cursor(account_id, &cursor)
                .await
                .map_err(mail_error)?;
            print_json(&serde_json::json!({ "accountId": account_id, "cursor": cursor }))
        }
        Command::Watch => watch(state).await,
    }
}

async fn add_account(state: &AppState, payload: AddAccountPayload) -> anyhow::Result<()> {
    let config = payload.config();
    let alias = payload.alias.as_deref().unwrap_or_default();
    let account = state
        .mail
        .add_account(alias, &config)
        .await
        .map_err(mail_error)?;

    let stored = state
        .secrets
        .set(&SecretKey::mail_password(account.id), &config.password);
    if let Err(err) = stored {
        // an account without a password cannot be polled
        if let Err(cleanup) = state.mail.remove_account(account.id).await {
            tracing::warn!(account_id = %account.id, "rolling back account failed: {cleanup}");
        }
        return Err(anyhow::Error::new(err).context("store account password in keychain"));
    }

    print_json(&account)
}

/// Polls every account each interval until interrupted. New batches go to stdout
/// as one JSON object per line.
async fn watch(state: &AppState) -> anyhow::Result<()> {
    let interval = state.config.sync.poll_interval();
    tracing::info!(interval_secs = interval.as_secs(), "watching mail accounts");

    loop {
        if let Err(err) = poll_all(state).await {
            tracing::error!("mail poll cycle failed: {err:#}");
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("stopping mail watcher");
                return Ok(());
            }
            _ = sleep(interval) => {}
        }
    }
}

async fn poll_all(state: &AppState) -> anyhow::Result<()> {
    let accounts = state.mail.list_accounts().await.map_err(mail_error)?;
    let mut jobs = JoinSet::new();

    for account in accounts {
        let password = match state.password(account.id) {
            Ok(password) => password,
            Err(err) => {
                tracing::warn!(account_id = %account.id, "skipping account: {err:#}");
                continue;
            }
        };

        let mail = state.mail.clone();
        jobs.spawn(async move {
            let result = mail.poll_account(account.id, &password).await;
            (account.id, result)
        });
    }

    while let Some(joined) = jobs.join_next().await {
        let (account_id, result) = joined.context("join poll task")?;
        match result {
            Ok(batch) if batch.messages.is_empty() => {}
            Ok(batch) => print_json(&PollOutput::new(account_id, &batch))?,
            Err(err) if err.is_retryable() => {
                tracing::warn!(account_id = %account_id, "poll failed, retrying next cycle: {err}");
            }
            Err(err) => {
                tracing::error!(account_id = %account_id, "{}", err.user_message());
            }
        }
    }

    Ok(())
}
