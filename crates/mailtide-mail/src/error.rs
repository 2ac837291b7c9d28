use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("connection failed: {0}")]
    Connectivity(String),
    #[error("mail parse error: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Storage(#[from] mailtide_storage::StorageError),
    #[error("invalid data: {0}")]
    Data(String),
}

impl MailError {
    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MailError::Connectivity(_))
    }

    /// Text shown to the account owner.
    pub fn user_message(&self) -> String {
        match self {
            MailError::Authentication(detail) => {
                format!("The server rejected the credentials ({detail}). Please re-enter your password.")
            }
            MailError::Connectivity(_) => {
                "Could not reach the mail server. Check the server settings and try again."
                    .to_string()
            }
            MailError::Parse(_) | MailError::Storage(_) | MailError::Data(_) => self.to_string(),
        }
    }
}

impl From<mailparse::MailParseError> for MailError {
    fn from(err: mailparse::MailParseError) -> Self {
        MailError::Parse(err.to_string())
    }
}
