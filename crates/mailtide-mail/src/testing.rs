//! Test doubles: an in-memory mailbox behind the backend traits plus scripted POP3
//! and IMAP servers.

use crate::{Listing, MailError, MailboxBackend, MailboxEntry, MailboxSession, RawMessage, Window};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mailtide_core::{AccountConfig, MessageId, Protocol};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_PASSWORD: &str = "secret";

struct StoredMessage {
    id: MessageId,
    seen: bool,
    raw: String,
    /// Served without the identifier header, so parsing fails.
    broken: bool,
}

struct MemoryState {
    messages: Vec<StoredMessage>,
    uid_next: u32,
    password: String,
    fail_listing: bool,
    fetch_delay: Duration,
    opened: usize,
    closed: usize,
    fetched: Vec<MessageId>,
}

#[derive(Clone)]
pub(crate) struct MemoryBackend {
    protocol: Protocol,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub(crate) fn imap() -> Self {
        Self::new(Protocol::Imap)
    }

    pub(crate) fn pop3() -> Self {
        Self::new(Protocol::Pop3)
    }

    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: Arc::new(Mutex::new(MemoryState {
                messages: Vec::new(),
                uid_next: 1,
                password: DEFAULT_PASSWORD.to_string(),
                fail_listing: false,
                fetch_delay: Duration::ZERO,
                opened: 0,
                closed: 0,
                fetched: Vec::new(),
            })),
        }
    }

    pub(crate) fn with_password(self, password: &str) -> Self {
        self.lock().password = password.to_string();
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory mailbox lock")
    }

    pub(crate) fn config(&self) -> AccountConfig {
        AccountConfig {
            protocol: self.protocol,
            host: "mail.example.com".to_string(),
            port: self.protocol.default_port(true),
            use_ssl: true,
            email: "me@example.com".to_string(),
            password: self.lock().password.clone(),
        }
    }

    pub(crate) fn push_uids(&self, uids: impl IntoIterator<Item = u32>) {
        for uid in uids {
            self.push_dated(uid, &minute_date(uid as usize));
        }
    }

    pub(crate) fn push_dated(&self, uid: u32, date: &str) {
        let mut state = self.lock();
        state.messages.push(StoredMessage {
            id: MessageId::Uid(uid),
            seen: false,
            raw: message_text(&format!("message {uid}"), date),
            broken: false,
        });
        state.uid_next = state.uid_next.max(uid + 1);
    }

    pub(crate) fn push_broken(&self, uid: u32) {
        self.push_uids([uid]);
        if let Some(message) = self.lock().messages.last_mut() {
            message.broken = true;
        }
    }

    pub(crate) fn push_uidls(&self, uidls: &[&str]) {
        let mut state = self.lock();
        for uidl in uidls {
            let index = state.messages.len() + 1;
            state.messages.push(StoredMessage {
                id: MessageId::Uidl((*uidl).to_string()),
                seen: false,
                raw: message_text(&format!("message {uidl}"), &minute_date(index)),
                broken: false,
            });
        }
    }

    /// Renumbers every UID from 1, as a server does after rebuilding its index.
    pub(crate) fn reindex(&self) {
        let mut state = self.lock();
        let mut next = 1;
        for message in state.messages.iter_mut() {
            if let MessageId::Uid(uid) = &mut message.id {
                *uid = next;
                next += 1;
            }
        }
        state.uid_next = next;
    }

    pub(crate) fn mark_seen(&self, uid: u32) {
        let mut state = self.lock();
        for message in state.messages.iter_mut() {
            if message.id == MessageId::Uid(uid) {
                message.seen = true;
            }
        }
    }

    pub(crate) fn is_seen(&self, uid: u32) -> bool {
        self.lock()
            .messages
            .iter()
            .any(|message| message.id == MessageId::Uid(uid) && message.seen)
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    /// Every fetched message costs `per_message` of (tokio) time.
    pub(crate) fn slow_fetch(&self, per_message: Duration) {
        self.lock().fetch_delay = per_message;
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        self.lock().opened
    }

    /// Sessions opened and not yet closed.
    pub(crate) fn open_sessions(&self) -> usize {
        let state = self.lock();
        state.opened - state.closed
    }

    pub(crate) fn fetched(&self) -> Vec<MessageId> {
        self.lock().fetched.clone()
    }
}

fn minute_date(index: usize) -> String {
    let timestamp = 1_704_067_200 + i64::try_from(index).unwrap_or(0) * 60;
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .expect("valid timestamp")
        .to_rfc2822()
}

fn message_text(subject: &str, date: &str) -> String {
    format!(
        "From: Sender <sender@example.com>\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         body of {subject}\r\n"
    )
}

#[async_trait]
impl MailboxBackend for MemoryBackend {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(&self, config: &AccountConfig) -> Result<Box<dyn MailboxSession>, MailError> {
        let mut state = self.lock();
        if config.password != state.password {
            return Err(MailError::Authentication("invalid credentials".to_string()));
        }
        state.opened += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn list_identifiers(&mut self, window: Window<'_>) -> Result<Listing, MailError> {
        let state = self.state.lock().expect("memory mailbox lock");
        if state.fail_listing {
            return Err(MailError::Connectivity("connection reset".to_string()));
        }

        let entries: Vec<MailboxEntry> = state
            .messages
            .iter()
            .enumerate()
            .map(|(index, message)| MailboxEntry {
                position: u32::try_from(index + 1).expect("position fits"),
                id: message.id.clone(),
            })
            .collect();

        Ok(match window {
            Window::Latest(count) => {
                let start = entries.len().saturating_sub(count);
                Listing::Entries(entries[start..].to_vec())
            }
            Window::All => Listing::Entries(entries),
            Window::After(MessageId::Uid(cursor)) if *cursor >= state.uid_next => {
                Listing::CursorLost
            }
            Window::After(MessageId::Uid(cursor)) => Listing::Entries(
                entries
                    .into_iter()
                    .filter(|entry| matches!(entry.id, MessageId::Uid(uid) if uid > *cursor))
                    .collect(),
            ),
            Window::After(cursor @ MessageId::Uidl(_)) => {
                match entries.iter().position(|entry| &entry.id == cursor) {
                    Some(index) => Listing::Entries(entries[index + 1..].to_vec()),
                    None => Listing::CursorLost,
                }
            }
        })
    }

    async fn fetch_raw(&mut self, entries: &[MailboxEntry]) -> Result<Vec<RawMessage>, MailError> {
        let delay = {
            let state = self.state.lock().expect("memory mailbox lock");
            state.fetch_delay * u32::try_from(entries.len()).expect("chunk fits")
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().expect("memory mailbox lock");
        let mut raw = Vec::new();
        for entry in entries {
            let Some(message) = state.messages.iter().find(|m| m.id == entry.id) else {
                continue;
            };
            raw.push(if message.broken {
                RawMessage {
                    id: message.id.clone(),
                    seen: message.seen,
                    internal_date: None,
                    bytes: message.raw.clone().into_bytes(),
                }
            } else {
                RawMessage::new(message.id.clone(), message.seen, None, message.raw.as_bytes())
            });
        }
        state.fetched.extend(entries.iter().map(|entry| entry.id.clone()));
        Ok(raw)
    }

    async fn close(self: Box<Self>) -> Result<(), MailError> {
        self.state.lock().expect("memory mailbox lock").closed += 1;
        Ok(())
    }
}

pub(crate) mod pop3 {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    /// Server-side view of one POP3 maildrop.
    pub(crate) struct Maildrop {
        password: String,
        messages: Vec<(String, String)>,
        refused: Vec<u32>,
    }

    impl Maildrop {
        pub(crate) fn new(password: &str) -> Self {
            Self {
                password: password.to_string(),
                messages: Vec::new(),
                refused: Vec::new(),
            }
        }

        pub(crate) fn with_messages(mut self, uidls: &[&str]) -> Self {
            for uidl in uidls {
                let index = self.messages.len() + 1;
                let raw = format!(
                    "From: sender@example.com\r\n\
                     Subject: message {uidl}\r\n\
                     Date: Mon, 1 Jan 2024 00:{index:02}:00 +0000\r\n\
                     \r\n\
                     body {uidl}\r\n"
                );
                self.messages.push(((*uidl).to_string(), raw));
            }
            self
        }

        pub(crate) fn with_raw(mut self, uidl: &str, raw: &str) -> Self {
            self.messages.push((uidl.to_string(), raw.to_string()));
            self
        }

        /// RETR of this message number answers -ERR.
        pub(crate) fn refusing(mut self, position: u32) -> Self {
            self.refused.push(position);
            self
        }

        fn reply(&self, verb: &str, arg: &str) -> String {
            match verb {
                "USER" => "+OK\r\n".to_string(),
                "PASS" if arg == self.password => "+OK maildrop locked\r\n".to_string(),
                "PASS" => "-ERR invalid password\r\n".to_string(),
                "STAT" => {
                    let size: usize = self.messages.iter().map(|(_, raw)| raw.len()).sum();
                    format!("+OK {} {size}\r\n", self.messages.len())
                }
                "UIDL" => {
                    let mut reply = "+OK\r\n".to_string();
                    for (index, (uidl, _)) in self.messages.iter().enumerate() {
                        reply.push_str(&format!("{} {uidl}\r\n", index + 1));
                    }
                    reply.push_str(".\r\n");
                    reply
                }
                "RETR" => {
                    let position = arg.parse::<u32>().unwrap_or(0);
                    let message = (position as usize)
                        .checked_sub(1)
                        .and_then(|index| self.messages.get(index));
                    match message {
                        Some((_, raw)) if !self.refused.contains(&position) => {
                            let mut reply = "+OK\r\n".to_string();
                            for line in raw.trim_end_matches("\r\n").split("\r\n") {
                                if line.starts_with('.') {
                                    reply.push('.');
                                }
                                reply.push_str(line);
                                reply.push_str("\r\n");
                            }
                            reply.push_str(".\r\n");
                            reply
                        }
                        _ => "-ERR no such message\r\n".to_string(),
                    }
                }
                _ => "-ERR unknown command\r\n".to_string(),
            }
        }
    }

    /// Serves `maildrop` on one end of an in-memory pipe. The task yields every
    /// command line it received once the client quits or hangs up.
    pub(crate) fn spawn_server(maildrop: Maildrop) -> (DuplexStream, JoinHandle<Vec<String>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let handle = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut log = Vec::new();

            if write.write_all(b"+OK fake pop3 ready\r\n").await.is_err() {
                return log;
            }

            while let Ok(Some(line)) = lines.next_line().await {
                log.push(line.clone());
                let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                let verb = verb.to_ascii_uppercase();

                if verb == "QUIT" {
                    let _ = write.write_all(b"+OK bye\r\n").await;
                    break;
                }

                let reply = maildrop.reply(&verb, arg.trim());
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }

            log
        });

        (client, handle)
    }
}

pub(crate) mod imap {
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    const INTERNAL_DATE: &str = "01-Jan-2024 00:00:00 +0000";

    struct ScriptedMessage {
        uid: u32,
        seen: bool,
        header: String,
        text: String,
    }

    /// Server-side view of one IMAP inbox.
    pub(crate) struct Inbox {
        password: String,
        messages: Vec<ScriptedMessage>,
        uid_next: u32,
        rejecting_search: bool,
    }

    impl Inbox {
        pub(crate) fn new(password: &str) -> Self {
            Self {
                password: password.to_string(),
                messages: Vec::new(),
                uid_next: 1,
                rejecting_search: false,
            }
        }

        pub(crate) fn with_uids(mut self, uids: impl IntoIterator<Item = u32>) -> Self {
            for uid in uids {
                let raw = super::message_text(
                    &format!("message {uid}"),
                    &super::minute_date(uid as usize),
                );
                let (header, text) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
                self.messages.push(ScriptedMessage {
                    uid,
                    seen: false,
                    header: format!("{header}\r\n\r\n"),
                    text: text.to_string(),
                });
                self.uid_next = self.uid_next.max(uid + 1);
            }
            self
        }

        pub(crate) fn seen(mut self, uid: u32) -> Self {
            for message in self.messages.iter_mut().filter(|m| m.uid == uid) {
                message.seen = true;
            }
            self
        }

        /// UID SEARCH answers NO.
        pub(crate) fn rejecting_search(mut self) -> Self {
            self.rejecting_search = true;
            self
        }

        fn reply(&self, tag: &str, command: &str) -> String {
            let upper = command.to_ascii_uppercase();

            if upper.starts_with("LOGIN ") {
                return if command.ends_with(&format!(" \"{}\"", self.password)) {
                    format!("{tag} OK LOGIN completed\r\n")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
                };
            }

            if upper.starts_with("EXAMINE ") {
                return format!(
                    "* FLAGS (\\Seen \\Answered)\r\n\
                     * {} EXISTS\r\n\
                     * 0 RECENT\r\n\
                     * OK [UIDVALIDITY 1] UIDs valid\r\n\
                     * OK [UIDNEXT {}] predicted next UID\r\n\
                     {tag} OK [READ-ONLY] EXAMINE completed\r\n",
                    self.messages.len(),
                    self.uid_next
                );
            }

            if let Some(criteria) = upper.strip_prefix("UID SEARCH ") {
                if self.rejecting_search {
                    return format!("{tag} NO search is not available\r\n");
                }
                let found: Vec<String> = self
                    .search(criteria.trim())
                    .iter()
                    .map(u32::to_string)
                    .collect();
                let mut reply = "* SEARCH".to_string();
                for uid in &found {
                    reply.push(' ');
                    reply.push_str(uid);
                }
                reply.push_str(&format!("\r\n{tag} OK SEARCH completed\r\n"));
                return reply;
            }

            if let Some(args) = upper.strip_prefix("UID FETCH ") {
                let (set, items) = args.split_once(' ').unwrap_or((args, ""));
                let uids = parse_set(set);
                let mut reply = String::new();
                for (index, message) in self.messages.iter().enumerate() {
                    if uids.contains(&message.uid) {
                        reply.push_str(&self.fetch_line(index + 1, message, items.contains("BODY.PEEK")));
                    }
                }
                reply.push_str(&format!("{tag} OK FETCH completed\r\n"));
                return reply;
            }

            if let Some(args) = upper.strip_prefix("FETCH ") {
                let set = args.split(' ').next().unwrap_or_default();
                let positions = parse_set(set);
                let mut reply = String::new();
                for (index, message) in self.messages.iter().enumerate() {
                    let position = u32::try_from(index + 1).expect("position fits");
                    if positions.contains(&position) {
                        reply.push_str(&self.fetch_line(index + 1, message, false));
                    }
                }
                reply.push_str(&format!("{tag} OK FETCH completed\r\n"));
                return reply;
            }

            format!("{tag} BAD unexpected command\r\n")
        }

        /// `n:*` always includes the highest UID, as real servers answer it.
        fn search(&self, criteria: &str) -> Vec<u32> {
            let uids: Vec<u32> = self.messages.iter().map(|m| m.uid).collect();
            if criteria == "ALL" {
                return uids;
            }

            let Some(range) = criteria.strip_prefix("UID ") else {
                return Vec::new();
            };
            let Some(max) = uids.iter().copied().max() else {
                return Vec::new();
            };
            let (low, high) = match range.split_once(':') {
                Some((low, "*")) => {
                    let low = low.parse::<u32>().unwrap_or(0);
                    (low.min(max), low.max(max))
                }
                Some((low, high)) => (
                    low.parse::<u32>().unwrap_or(0),
                    high.parse::<u32>().unwrap_or(0),
                ),
                None => {
                    let uid = range.parse::<u32>().unwrap_or(0);
                    (uid, uid)
                }
            };
            uids.into_iter()
                .filter(|uid| (low..=high).contains(uid))
                .collect()
        }

        fn fetch_line(&self, position: usize, message: &ScriptedMessage, with_body: bool) -> String {
            if !with_body {
                return format!("* {position} FETCH (UID {})\r\n", message.uid);
            }

            let flags = if message.seen { "\\Seen" } else { "" };
            format!(
                "* {position} FETCH (UID {} FLAGS ({flags}) INTERNALDATE \"{INTERNAL_DATE}\" \
                 BODY[HEADER] {{{}}}\r\n{} BODY[TEXT] {{{}}}\r\n{})\r\n",
                message.uid,
                message.header.len(),
                message.header,
                message.text.len(),
                message.text
            )
        }
    }

    /// Comma separated numbers and `a:b` ranges.
    fn parse_set(set: &str) -> Vec<u32> {
        let mut numbers = Vec::new();
        for part in set.split(',') {
            match part.split_once(':') {
                Some((low, high)) => {
                    let low = low.parse::<u32>().unwrap_or(0);
                    let high = high.parse::<u32>().unwrap_or(0);
                    numbers.extend(low..=high);
                }
                None => numbers.extend(part.parse::<u32>().ok()),
            }
        }
        numbers
    }

    /// Serves `inbox` to one client over loopback TCP. The thread yields every
    /// command line it received once the client logs out or hangs up.
    ///
    /// No greeting is sent: `imap::Client::new` expects the caller to have
    /// consumed it already.
    pub(crate) fn spawn_server(inbox: Inbox) -> (TcpStream, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        let handle = thread::spawn(move || {
            let mut log = Vec::new();
            let Ok((stream, _)) = listener.accept() else {
                return log;
            };
            let mut writer = stream.try_clone().expect("clone stream");
            let reader = BufReader::new(stream);

            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                let line = line.trim_end_matches('\r').to_string();
                log.push(line.clone());
                let (tag, command) = line.split_once(' ').unwrap_or((line.as_str(), ""));

                if command.eq_ignore_ascii_case("LOGOUT") {
                    let _ = writer.write_all(
                        format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n").as_bytes(),
                    );
                    break;
                }

                let reply = inbox.reply(tag, command);
                if writer.write_all(reply.as_bytes()).is_err() {
                    break;
                }
            }

            log
        });

        let client = TcpStream::connect(addr).expect("connect loopback");
        (client, handle)
    }
}
