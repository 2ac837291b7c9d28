use crate::SecurityError;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SecretStore {
    service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKey {
    pub namespace: String,
    pub id: String,
}

impl SecretKey {
    /// Password of a mail account.
    pub fn mail_password(account_id: Uuid) -> Self {
        Self {
            namespace: "mail-password".to_string(),
            id: account_id.to_string(),
        }
    }

    pub fn as_username(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl SecretStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        entry.set_password(value)?;
        Ok(())
    }

    pub fn get(&self, key: &SecretKey) -> Result<Option<String>, SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn delete(&self, key: &SecretKey) -> Result<(), SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => {
                tracing::warn!(key = %key.as_username(), "failed to delete keychain entry: {err}");
                Err(err.into())
            }
        }
    }
}
