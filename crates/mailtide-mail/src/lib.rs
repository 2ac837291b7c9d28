mod backend;
mod error;
mod imap_backend;
mod parse;
mod pop3_backend;
mod service;
mod sync;
#[cfg(test)]
mod testing;

pub use backend::{
    backend_for_protocol, Listing, MailboxBackend, MailboxEntry, MailboxSession, RawMessage,
    Window, ID_HEADER,
};
pub use error::MailError;
pub use imap_backend::ImapBackend;
pub use parse::parse_message;
pub use pop3_backend::Pop3Backend;
pub use service::MailService;
pub use sync::{SyncController, SyncSettings};
