use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Legacy wire sentinel for a mailbox that was observed empty.
pub const EMPTY_MAILBOX: &str = "EMPTY_MAILBOX";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "IMAP")]
    Imap,
    #[serde(rename = "POP3")]
    Pop3,
}

impl Protocol {
    pub fn default_port(self, use_ssl: bool) -> u16 {
        match (self, use_ssl) {
            (Protocol::Imap, true) => 993,
            (Protocol::Imap, false) => 143,
            (Protocol::Pop3, true) => 995,
            (Protocol::Pop3, false) => 110,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Imap => "IMAP",
            Protocol::Pop3 => "POP3",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection details for one poll. Carries the password, so it is never persisted.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(rename = "useSSL")]
    pub use_ssl: bool,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum MessageId {
    /// IMAP UID, ascending within a mailbox.
    Uid(u32),
    /// POP3 UIDL, stable but unordered.
    Uidl(String),
}

impl MessageId {
    /// Protocol-tagged id exposed on [`NormalizedMessage::id`].
    pub fn synthetic(&self) -> String {
        match self {
            MessageId::Uid(uid) => format!("imap-{uid}"),
            MessageId::Uidl(uidl) => format!("pop3-{uidl}"),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            MessageId::Uid(_) => Protocol::Imap,
            MessageId::Uidl(_) => Protocol::Pop3,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Uid(uid) => write!(f, "{uid}"),
            MessageId::Uidl(uidl) => f.write_str(uidl),
        }
    }
}

/// Position of an account in its mailbox's identifier space.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum Cursor {
    /// Never synced.
    #[default]
    Unset,
    /// Last poll saw an empty mailbox.
    Empty,
    /// Newest identifier delivered so far.
    At(MessageId),
}

impl Cursor {
    /// Reads the untyped cursor format (`null`, `"EMPTY_MAILBOX"`, or a bare id).
    ///
    /// Returns `None` when the value cannot be an identifier of `protocol`,
    /// e.g. a non-numeric IMAP cursor.
    pub fn from_legacy(protocol: Protocol, raw: Option<&str>) -> Option<Self> {
        let Some(raw) = raw.map(str::trim) else {
            return Some(Cursor::Unset);
        };

        if raw == EMPTY_MAILBOX {
            return Some(Cursor::Empty);
        }

        match protocol {
            Protocol::Imap => raw.parse::<u32>().ok().map(|uid| Cursor::At(MessageId::Uid(uid))),
            Protocol::Pop3 if raw.is_empty() => None,
            Protocol::Pop3 => Some(Cursor::At(MessageId::Uidl(raw.to_string()))),
        }
    }

    pub fn to_legacy(&self) -> Option<String> {
        match self {
            Cursor::Unset => None,
            Cursor::Empty => Some(EMPTY_MAILBOX.to_string()),
            Cursor::At(id) => Some(id.to_string()),
        }
    }
}

/// A configured mailbox connection. The password lives in the keychain, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: Uuid,
    pub alias: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub email: String,
    pub cursor: Cursor,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailAccount {
    pub fn new(alias: impl Into<String>, config: &AccountConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            alias: alias.into(),
            protocol: config.protocol,
            host: config.host.clone(),
            port: config.port,
            use_ssl: config.use_ssl,
            email: config.email.clone(),
            cursor: Cursor::Unset,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn config(&self, password: impl Into<String>) -> AccountConfig {
        AccountConfig {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            use_ssl: self.use_ssl,
            email: self.email.clone(),
            password: password.into(),
        }
    }
}

/// Protocol-agnostic envelope of one mailbox entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub sender_name: String,
    pub sender_address: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Initial,
    Refresh,
    /// The cursor could not be located and the latest messages were re-fetched.
    /// The batch may repeat messages the caller already holds.
    Healed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Newest first by `received_at`.
    pub messages: Vec<NormalizedMessage>,
    pub cursor: Cursor,
    pub kind: SyncKind,
}
