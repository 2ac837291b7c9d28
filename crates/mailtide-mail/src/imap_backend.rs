use crate::{Listing, MailError, MailboxBackend, MailboxEntry, MailboxSession, RawMessage, Window};
use async_trait::async_trait;
use chrono::Utc;
use mailtide_core::{AccountConfig, MessageId, Protocol};
use std::io::{Read, Write};
use tokio::task;
use tracing::{debug, warn};

const INBOX: &str = "INBOX";
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT])";

/// Inbox access over the blocking `imap` client, one worker thread per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapBackend;

#[async_trait]
impl MailboxBackend for ImapBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Imap
    }

    async fn open(&self, config: &AccountConfig) -> Result<Box<dyn MailboxSession>, MailError> {
        let config = config.clone();
        let session = task::spawn_blocking(move || connect(&config))
            .await
            .map_err(|err| MailError::Connectivity(format!("imap worker failed: {err}")))??;

        debug!(
            exists = session.status.exists,
            uid_next = ?session.status.uid_next,
            "imap inbox examined"
        );
        Ok(Box::new(session))
    }
}

fn connect(config: &AccountConfig) -> Result<ImapSession<::imap::Connection>, MailError> {
    let mode = if config.use_ssl {
        ::imap::ConnectionMode::Tls
    } else {
        ::imap::ConnectionMode::Auto
    };

    let client = ::imap::ClientBuilder::new(config.host.as_str(), config.port)
        .mode(mode)
        .connect()
        .map_err(|err| {
            MailError::Connectivity(format!(
                "connection to {}:{} failed: {err}",
                config.host, config.port
            ))
        })?;

    ImapSession::login(client, config)
}

#[derive(Debug, Clone, Copy)]
struct InboxStatus {
    exists: u32,
    uid_next: Option<u32>,
}

struct ImapSession<T: Read + Write> {
    /// `None` only while a worker thread holds the connection.
    connection: Option<::imap::Session<T>>,
    status: InboxStatus,
}

impl<T> ImapSession<T>
where
    T: Read + Write + Send + 'static,
{
    /// Authenticates and examines the inbox. Blocks the calling thread.
    fn login(client: ::imap::Client<T>, config: &AccountConfig) -> Result<Self, MailError> {
        let mut connection = client
            .login(&config.email, &config.password)
            .map_err(|(err, _client)| match err {
                ::imap::Error::No(_) | ::imap::Error::Bad(_) => {
                    MailError::Authentication(err.to_string())
                }
                other => MailError::Connectivity(format!("imap login failed: {other}")),
            })?;

        // EXAMINE keeps the mailbox read-only for the whole session
        let mailbox = connection.examine(INBOX).map_err(imap_error)?;
        Ok(Self {
            connection: Some(connection),
            status: InboxStatus {
                exists: mailbox.exists,
                uid_next: mailbox.uid_next,
            },
        })
    }

    /// Moves the connection onto a blocking worker for one round of commands.
    async fn blocking<R, F>(&mut self, op: F) -> Result<R, MailError>
    where
        F: FnOnce(&mut ::imap::Session<T>) -> Result<R, MailError> + Send + 'static,
        R: Send + 'static,
    {
        let mut connection = self
            .connection
            .take()
            .ok_or_else(|| MailError::Connectivity("imap connection was lost".to_string()))?;

        let (connection, result) = task::spawn_blocking(move || {
            let result = op(&mut connection);
            (connection, result)
        })
        .await
        .map_err(|err| MailError::Connectivity(format!("imap worker failed: {err}")))?;

        self.connection = Some(connection);
        result
    }

    async fn latest(&mut self, count: usize) -> Result<Vec<MailboxEntry>, MailError> {
        let Some(range) = sequence_tail(self.status.exists, count) else {
            return Ok(Vec::new());
        };

        self.blocking(move |connection| {
            let fetches = connection.fetch(&range, "UID").map_err(imap_error)?;
            let mut entries: Vec<MailboxEntry> = fetches
                .iter()
                .filter_map(|fetched| {
                    fetched.uid.map(|uid| MailboxEntry {
                        position: fetched.message,
                        id: MessageId::Uid(uid),
                    })
                })
                .collect();
            entries.sort_by_key(|entry| entry.position);
            Ok(entries)
        })
        .await
    }

    /// UIDs matching `query`, above `floor`, resolved to their sequence numbers.
    async fn search(&mut self, query: String, floor: u32) -> Result<Vec<MailboxEntry>, MailError> {
        self.blocking(move |connection| {
            let found = connection.uid_search(&query).map_err(imap_error)?;
            let uids = newer_uids(found, floor);
            if uids.is_empty() {
                return Ok(Vec::new());
            }

            let fetches = connection
                .uid_fetch(uid_set(&uids), "UID")
                .map_err(imap_error)?;
            let mut entries: Vec<MailboxEntry> = fetches
                .iter()
                .filter_map(|fetched| match fetched.uid {
                    Some(uid) if uid > floor => Some(MailboxEntry {
                        position: fetched.message,
                        id: MessageId::Uid(uid),
                    }),
                    _ => None,
                })
                .collect();
            entries.sort_by_key(|entry| match entry.id {
                MessageId::Uid(uid) => uid,
                MessageId::Uidl(_) => 0,
            });
            Ok(entries)
        })
        .await
    }
}

#[async_trait]
impl<T> MailboxSession for ImapSession<T>
where
    T: Read + Write + Send + 'static,
{
    async fn list_identifiers(&mut self, window: Window<'_>) -> Result<Listing, MailError> {
        let entries = match window {
            Window::Latest(count) => self.latest(count).await?,
            Window::All => self.search("ALL".to_string(), 0).await?,
            Window::After(MessageId::Uid(cursor)) => {
                let cursor = *cursor;
                if cursor_beyond_uid_next(cursor, self.status.uid_next) {
                    return Ok(Listing::CursorLost);
                }
                match cursor.checked_add(1) {
                    Some(next) => self.search(format!("UID {next}:*"), cursor).await?,
                    None => Vec::new(),
                }
            }
            Window::After(MessageId::Uidl(_)) => return Ok(Listing::CursorLost),
        };

        Ok(Listing::Entries(entries))
    }

    async fn fetch_raw(&mut self, entries: &[MailboxEntry]) -> Result<Vec<RawMessage>, MailError> {
        let uids: Vec<u32> = entries
            .iter()
            .filter_map(|entry| match entry.id {
                MessageId::Uid(uid) => Some(uid),
                MessageId::Uidl(_) => None,
            })
            .collect();
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        self.blocking(move |connection| {
            let fetches = connection
                .uid_fetch(uid_set(&uids), FETCH_QUERY)
                .map_err(imap_error)?;

            let mut messages = Vec::with_capacity(uids.len());
            for fetched in fetches.iter() {
                let Some(uid) = fetched.uid else {
                    continue;
                };
                let Some(header) = fetched.header() else {
                    warn!(uid, "imap server returned no header, skipping message");
                    continue;
                };

                let text = fetched.text().unwrap_or_default();
                let mut bytes = Vec::with_capacity(header.len() + text.len());
                bytes.extend_from_slice(header);
                bytes.extend_from_slice(text);

                let seen = fetched
                    .flags()
                    .into_iter()
                    .any(|flag| matches!(flag, ::imap::types::Flag::Seen));
                let internal_date = fetched
                    .internal_date()
                    .map(|datetime| datetime.with_timezone(&Utc));

                messages.push(RawMessage::new(
                    MessageId::Uid(uid),
                    seen,
                    internal_date,
                    &bytes,
                ));
            }
            Ok(messages)
        })
        .await
    }

    async fn close(mut self: Box<Self>) -> Result<(), MailError> {
        self.blocking(|connection| connection.logout().map_err(imap_error))
            .await
    }
}

/// After login every failure is a connectivity failure, NO and BAD replies included.
fn imap_error(err: ::imap::Error) -> MailError {
    match err {
        ::imap::Error::No(_) | ::imap::Error::Bad(_) => {
            MailError::Connectivity(format!("imap server rejected command: {err}"))
        }
        other => MailError::Connectivity(format!("imap error: {other}")),
    }
}

/// Sequence range covering the `count` newest of `exists` messages.
fn sequence_tail(exists: u32, count: usize) -> Option<String> {
    if exists == 0 || count == 0 {
        return None;
    }
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    let start = exists.saturating_sub(count).saturating_add(1);
    Some(format!("{start}:{exists}"))
}

/// A UID at or past UIDNEXT has never been assigned in this mailbox.
fn cursor_beyond_uid_next(cursor: u32, uid_next: Option<u32>) -> bool {
    uid_next.is_some_and(|next| cursor >= next)
}

/// `n+1:*` always matches the last message, even when its UID is not above `n`.
fn newer_uids(found: impl IntoIterator<Item = u32>, floor: u32) -> Vec<u32> {
    let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > floor).collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
