use crate::{backend_for_protocol, parse_message, Listing, MailError, MailboxBackend, MailboxSession, Window};
use mailtide_config::SyncConfig;
use mailtide_core::{AccountConfig, Cursor, Protocol, SyncBatch, SyncKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Messages requested per fetch round trip.
const FETCH_CHUNK: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Messages delivered by an initial or healing sync.
    pub initial_batch_size: usize,
    /// Bounds opening and authenticating a session.
    pub connect_timeout: Duration,
    /// Bounds each round trip of an open session. A large backlog spans many rounds.
    pub io_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            initial_batch_size: config.initial_batch_size,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        }
    }
}

/// Drives one poll per call. Holds no per-account state: the caller owns the cursor.
#[derive(Clone)]
pub struct SyncController {
    settings: SyncSettings,
    backend: Option<Arc<dyn MailboxBackend>>,
}

impl SyncController {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            backend: None,
        }
    }

    /// Uses `backend` for every account instead of picking one per protocol.
    pub fn with_backend(settings: SyncSettings, backend: Arc<dyn MailboxBackend>) -> Self {
        Self {
            settings,
            backend: Some(backend),
        }
    }

    fn backend(&self, protocol: Protocol) -> Arc<dyn MailboxBackend> {
        match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => backend_for_protocol(protocol, self.settings.io_timeout),
        }
    }

    /// Checks that the server accepts the credentials. Nothing is fetched.
    pub async fn connect(&self, config: &AccountConfig) -> Result<(), MailError> {
        let backend = self.backend(config.protocol);
        bounded(
            self.settings.connect_timeout,
            &format!("connecting to {}:{}", config.host, config.port),
            backend.verify_connection(config),
        )
        .await?;

        info!(protocol = %config.protocol, host = %config.host, "mail server accepted credentials");
        Ok(())
    }

    /// Fetches what is new since `cursor`. On error nothing advances.
    pub async fn poll(&self, config: &AccountConfig, cursor: &Cursor) -> Result<SyncBatch, MailError> {
        let backend = self.backend(config.protocol);
        let batch = poll_backend(backend.as_ref(), config, cursor, &self.settings).await?;

        info!(
            protocol = %config.protocol,
            host = %config.host,
            kind = ?batch.kind,
            messages = batch.messages.len(),
            "mailbox poll finished"
        );
        Ok(batch)
    }
}

/// Runs `operation` under `limit`, reporting an expired limit as a connectivity failure.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    operation: impl Future<Output = Result<T, MailError>>,
) -> Result<T, MailError> {
    timeout(limit, operation).await.map_err(|_| {
        MailError::Connectivity(format!("{what} timed out after {}s", limit.as_secs()))
    })?
}

async fn poll_backend(
    backend: &dyn MailboxBackend,
    config: &AccountConfig,
    cursor: &Cursor,
    settings: &SyncSettings,
) -> Result<SyncBatch, MailError> {
    let mut session = bounded(
        settings.connect_timeout,
        &format!("connecting to {}:{}", config.host, config.port),
        backend.open(config),
    )
    .await?;
    let result = run_session(
        session.as_mut(),
        cursor,
        settings.initial_batch_size,
        settings.io_timeout,
    )
    .await;
    let closed = bounded(settings.io_timeout, "closing the session", session.close()).await;

    match (result, closed) {
        (Ok(batch), Err(err)) => {
            warn!(host = %config.host, "closing mailbox session failed: {err}");
            Ok(batch)
        }
        (result, _) => result,
    }
}

/// One poll against an open session. The caller closes the session.
///
/// `io_timeout` applies to each listing and to each chunk of fetched messages.
pub(crate) async fn run_session(
    session: &mut dyn MailboxSession,
    cursor: &Cursor,
    batch_size: usize,
    io_timeout: Duration,
) -> Result<SyncBatch, MailError> {
    let (window, kind) = match cursor {
        Cursor::Unset => (Window::Latest(batch_size), SyncKind::Initial),
        Cursor::Empty => (Window::All, SyncKind::Refresh),
        Cursor::At(id) => (Window::After(id), SyncKind::Refresh),
    };

    let listing = bounded(io_timeout, "listing the mailbox", session.list_identifiers(window)).await?;
    let (entries, kind) = match listing {
        Listing::Entries(entries) => (entries, kind),
        Listing::CursorLost => {
            warn!(
                cursor = ?cursor,
                "sync cursor not found in mailbox, re-fetching the latest messages"
            );
            let latest = session.list_identifiers(Window::Latest(batch_size));
            match bounded(io_timeout, "listing the mailbox", latest).await? {
                Listing::Entries(entries) => (entries, SyncKind::Healed),
                Listing::CursorLost => (Vec::new(), SyncKind::Healed),
            }
        }
    };

    let next_cursor = match entries.last() {
        Some(newest) => Cursor::At(newest.id.clone()),
        None if kind == SyncKind::Refresh => cursor.clone(),
        None => Cursor::Empty,
    };

    if entries.is_empty() {
        debug!(kind = ?kind, "no new messages");
        return Ok(SyncBatch {
            messages: Vec::new(),
            cursor: next_cursor,
            kind,
        });
    }

    let mut messages = Vec::with_capacity(entries.len());
    for chunk in entries.chunks(FETCH_CHUNK) {
        let raw = bounded(io_timeout, "fetching messages", session.fetch_raw(chunk)).await?;
        for message in &raw {
            match parse_message(message) {
                Ok(parsed) => messages.push(parsed),
                Err(err) => warn!(id = %message.id, "dropping unparsable message: {err}"),
            }
        }
    }
    messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));

    debug!(
        kind = ?kind,
        listed = entries.len(),
        delivered = messages.len(),
        "mailbox batch assembled"
    );
    Ok(SyncBatch {
        messages,
        cursor: next_cursor,
        kind,
    })
}
