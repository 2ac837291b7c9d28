use crate::{ImapBackend, MailError, Pop3Backend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtide_core::{AccountConfig, MessageId, Protocol};
use std::sync::Arc;
use std::time::Duration;

/// Header synthesized in front of every fetched message so the parser can
/// recover the identifier from the raw bytes alone.
pub const ID_HEADER: &str = "X-Mailtide-Id";

/// One message slot of the mailbox: 1-based position in server order plus its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub position: u32,
    pub id: MessageId,
}

/// Which identifiers a session should list.
#[derive(Debug, Clone, Copy)]
pub enum Window<'a> {
    /// The `k` most recent messages.
    Latest(usize),
    /// Everything newer than the given identifier.
    After(&'a MessageId),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// Oldest first.
    Entries(Vec<MailboxEntry>),
    /// The cursor identifier does not exist in this mailbox.
    CursorLost,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub seen: bool,
    /// Server receive time, when the protocol reports one.
    pub internal_date: Option<DateTime<Utc>>,
    /// RFC 822 bytes, starting with the [`ID_HEADER`] line.
    pub bytes: Vec<u8>,
}

impl RawMessage {
    pub fn new(
        id: MessageId,
        seen: bool,
        internal_date: Option<DateTime<Utc>>,
        message: &[u8],
    ) -> Self {
        let header = format!("{ID_HEADER}: {}\r\n", id.synthetic());
        let mut bytes = Vec::with_capacity(header.len() + message.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(message);

        Self {
            id,
            seen,
            internal_date,
            bytes,
        }
    }
}

#[async_trait]
pub trait MailboxBackend: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Opens an authenticated session on the inbox. The caller must `close` it.
    async fn open(&self, config: &AccountConfig) -> Result<Box<dyn MailboxSession>, MailError>;

    async fn verify_connection(&self, config: &AccountConfig) -> Result<(), MailError> {
        let session = self.open(config).await?;
        session.close().await
    }
}

/// A live, read-only view of one mailbox. Nothing here marks messages as read.
#[async_trait]
pub trait MailboxSession: Send {
    async fn list_identifiers(&mut self, window: Window<'_>) -> Result<Listing, MailError>;

    /// Messages the server refuses to hand out are left out of the result.
    async fn fetch_raw(&mut self, entries: &[MailboxEntry]) -> Result<Vec<RawMessage>, MailError>;

    async fn close(self: Box<Self>) -> Result<(), MailError>;
}

/// `io_timeout` bounds each socket read and write where the client can enforce it.
pub fn backend_for_protocol(protocol: Protocol, io_timeout: Duration) -> Arc<dyn MailboxBackend> {
    match protocol {
        Protocol::Imap => Arc::new(ImapBackend::default()),
        Protocol::Pop3 => Arc::new(Pop3Backend::with_io_timeout(io_timeout)),
    }
}

/// Index of the first element of the `count` most recent out of `len`.
pub(crate) fn tail_start(len: usize, count: usize) -> usize {
    len.saturating_sub(count)
}
