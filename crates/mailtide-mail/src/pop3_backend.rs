use crate::backend::tail_start;
use crate::{Listing, MailError, MailboxBackend, MailboxEntry, MailboxSession, RawMessage, Window};
use async_trait::async_trait;
use mailtide_core::{AccountConfig, MessageId, Protocol};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// RFC 1939 mailbox access. POP3 keeps no flags, so every message reports as read.
#[derive(Debug, Clone)]
pub struct Pop3Backend {
    io_timeout: Duration,
}

impl Pop3Backend {
    /// Bounds every connect, read and write on the socket.
    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl MailboxBackend for Pop3Backend {
    fn protocol(&self) -> Protocol {
        Protocol::Pop3
    }

    async fn open(&self, config: &AccountConfig) -> Result<Box<dyn MailboxSession>, MailError> {
        let stream = connect_stream(config, self.io_timeout).await?;
        let session = Pop3Session::start(stream, config, self.io_timeout).await?;
        Ok(Box::new(session))
    }
}

pub(crate) trait Pop3Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Pop3Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

async fn connect_stream(
    config: &AccountConfig,
    io_timeout: Duration,
) -> Result<Box<dyn Pop3Stream>, MailError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = timeout(io_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| MailError::Connectivity(format!("connection to {addr} timed out")))?
        .map_err(|err| MailError::Connectivity(format!("connection to {addr} failed: {err}")))?;

    if !config.use_ssl {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(tls_client_config()?);
    let server_name = ServerName::try_from(config.host.clone()).map_err(|err| {
        MailError::Connectivity(format!("invalid server name '{}': {err}", config.host))
    })?;

    let tls = timeout(io_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| MailError::Connectivity(format!("TLS handshake with {addr} timed out")))?
        .map_err(|err| MailError::Connectivity(format!("TLS handshake with {addr} failed: {err}")))?;

    Ok(Box::new(tls))
}

fn tls_client_config() -> Result<Arc<ClientConfig>, MailError> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|err| MailError::Connectivity(format!("TLS setup failed: {err}")))?
            .with_root_certificates(root_store)
            .with_no_client_auth();
    Ok(Arc::new(config))
}

enum Reply {
    Ok(String),
    Err(String),
}

pub(crate) struct Pop3Session<S> {
    stream: BufReader<S>,
    io_timeout: Duration,
    /// UIDL listing; the maildrop is locked for the session, so one read is enough.
    entries: Option<Vec<MailboxEntry>>,
}

impl<S> Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Reads the greeting, authenticates with USER/PASS and issues STAT.
    pub(crate) async fn start(
        stream: S,
        config: &AccountConfig,
        io_timeout: Duration,
    ) -> Result<Self, MailError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            io_timeout,
            entries: None,
        };

        if let Reply::Err(message) = session.reply().await? {
            return Err(MailError::Connectivity(format!(
                "pop3 server refused connection: {message}"
            )));
        }

        session.login(&config.email, &config.password).await?;

        let (count, size) = session.stat().await?;
        debug!(host = %config.host, count, size, "pop3 maildrop opened");
        Ok(session)
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        if let Reply::Err(message) = self.command(&format!("USER {user}"), "USER").await? {
            return Err(MailError::Authentication(message));
        }
        if let Reply::Err(message) = self.command(&format!("PASS {password}"), "PASS").await? {
            return Err(MailError::Authentication(message));
        }
        Ok(())
    }

    async fn stat(&mut self) -> Result<(u32, u64), MailError> {
        let text = match self.command("STAT", "STAT").await? {
            Reply::Ok(text) => text,
            Reply::Err(message) => {
                return Err(MailError::Connectivity(format!("STAT rejected: {message}")))
            }
        };

        let mut parts = text.split_whitespace();
        let count = parts.next().and_then(|raw| raw.parse::<u32>().ok());
        let size = parts.next().and_then(|raw| raw.parse::<u64>().ok());
        match (count, size) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(MailError::Connectivity(format!(
                "unexpected STAT reply: {text}"
            ))),
        }
    }

    async fn uidl(&mut self) -> Result<Vec<MailboxEntry>, MailError> {
        if let Some(entries) = &self.entries {
            return Ok(entries.clone());
        }

        if let Reply::Err(message) = self.command("UIDL", "UIDL").await? {
            return Err(MailError::Connectivity(format!(
                "server does not support UIDL: {message}"
            )));
        }

        let mut entries = Vec::new();
        for line in self.read_multiline().await? {
            let line = String::from_utf8_lossy(&line);
            let mut parts = line.split_whitespace();
            let position = parts.next().and_then(|raw| raw.parse::<u32>().ok());
            let uidl = parts.next();
            match (position, uidl) {
                (Some(position), Some(uidl)) => entries.push(MailboxEntry {
                    position,
                    id: MessageId::Uidl(uidl.to_string()),
                }),
                _ => warn!(line = %line, "skipping malformed UIDL line"),
            }
        }
        entries.sort_by_key(|entry| entry.position);

        debug!(count = entries.len(), "pop3 uidl listing");
        self.entries = Some(entries.clone());
        Ok(entries)
    }

    /// `None` when the server refuses this one message.
    async fn retr(&mut self, position: u32) -> Result<Option<Vec<u8>>, MailError> {
        if let Reply::Err(message) = self.command(&format!("RETR {position}"), "RETR").await? {
            warn!(position, %message, "pop3 server refused RETR");
            return Ok(None);
        }

        let lines = self.read_multiline().await?;
        let mut message = Vec::with_capacity(lines.iter().map(|line| line.len() + 2).sum());
        for line in lines {
            message.extend_from_slice(&line);
            message.extend_from_slice(b"\r\n");
        }
        Ok(Some(message))
    }

    async fn quit(&mut self) -> Result<(), MailError> {
        let reply = self.command("QUIT", "QUIT").await;
        let _ = self.stream.get_mut().shutdown().await;
        if let Reply::Err(message) = reply? {
            warn!(%message, "pop3 server rejected QUIT");
        }
        Ok(())
    }

    /// Sends one command line. `verb` is what gets logged, so credentials stay out of traces.
    async fn command(&mut self, line: &str, verb: &str) -> Result<Reply, MailError> {
        if line.chars().any(char::is_control) {
            return Err(MailError::Data(format!(
                "{verb} argument contains control characters"
            )));
        }
        debug!(command = verb, "pop3 command");
        let payload = format!("{line}\r\n");
        timeout(self.io_timeout, async {
            self.stream.get_mut().write_all(payload.as_bytes()).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| MailError::Connectivity("pop3 write timed out".to_string()))?
        .map_err(|err| MailError::Connectivity(format!("pop3 write failed: {err}")))?;

        self.reply().await
    }

    async fn reply(&mut self) -> Result<Reply, MailError> {
        let line = self.read_line().await?;
        let line = String::from_utf8_lossy(&line);

        if let Some(rest) = line.strip_prefix("+OK") {
            return Ok(Reply::Ok(rest.trim().to_string()));
        }
        if let Some(rest) = line.strip_prefix("-ERR") {
            return Ok(Reply::Err(rest.trim().to_string()));
        }

        Err(MailError::Connectivity(format!(
            "unexpected pop3 reply: {line}"
        )))
    }

    /// Lines up to the terminating "." with byte-stuffing removed.
    async fn read_multiline(&mut self) -> Result<Vec<Vec<u8>>, MailError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == b"." {
                return Ok(lines);
            }
            match line.strip_prefix(b".") {
                Some(unstuffed) => lines.push(unstuffed.to_vec()),
                None => lines.push(line),
            }
        }
    }

    /// One line without its CRLF.
    async fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let read = timeout(self.io_timeout, self.stream.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| MailError::Connectivity("pop3 server timed out".to_string()))?
            .map_err(|err| MailError::Connectivity(format!("pop3 read failed: {err}")))?;

        if read == 0 {
            return Err(MailError::Connectivity(
                "pop3 connection closed by server".to_string(),
            ));
        }

        if buf.ends_with(b"\n") {
            buf.pop();
        }
        if buf.ends_with(b"\r") {
            buf.pop();
        }
        Ok(buf)
    }
}

#[async_trait]
impl<S> MailboxSession for Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn list_identifiers(&mut self, window: Window<'_>) -> Result<Listing, MailError> {
        let entries = self.uidl().await?;

        Ok(match window {
            Window::Latest(count) => {
                let start = tail_start(entries.len(), count);
                Listing::Entries(entries[start..].to_vec())
            }
            Window::All => Listing::Entries(entries),
            Window::After(MessageId::Uidl(cursor)) => match entries_after(&entries, cursor) {
                Some(newer) => Listing::Entries(newer),
                None => Listing::CursorLost,
            },
            Window::After(MessageId::Uid(_)) => Listing::CursorLost,
        })
    }

    async fn fetch_raw(&mut self, entries: &[MailboxEntry]) -> Result<Vec<RawMessage>, MailError> {
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(bytes) = self.retr(entry.position).await? {
                messages.push(RawMessage::new(entry.id.clone(), true, None, &bytes));
            }
        }
        Ok(messages)
    }

    async fn close(mut self: Box<Self>) -> Result<(), MailError> {
        self.quit().await
    }
}

/// Entries listed after `cursor`, or `None` when `cursor` is not in the listing.
fn entries_after(entries: &[MailboxEntry], cursor: &str) -> Option<Vec<MailboxEntry>> {
    let cursor = cursor.trim();
    let index = entries.iter().position(|entry| match &entry.id {
        MessageId::Uidl(uidl) => uidl.trim() == cursor,
        MessageId::Uid(_) => false,
    })?;
    Some(entries[index + 1..].to_vec())
}
