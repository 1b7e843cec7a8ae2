use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "docsyncd";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("no credentials stored for account {0}")]
    NotFound(i64),
}

/// Resolves the opaque authorization header sent with every remote call.
#[derive(Debug, Clone)]
pub enum CredentialStore {
    /// One header for every account, taken from the environment.
    Static(String),
    Keyring,
}

impl CredentialStore {
    pub fn from_env_header(header: Option<String>) -> Self {
        match header.filter(|h| !h.trim().is_empty()) {
            Some(header) => Self::Static(header),
            None => Self::Keyring,
        }
    }

    pub fn auth_header(&self, account_id: i64) -> Result<String, StorageError> {
        match self {
            Self::Static(header) => Ok(header.clone()),
            Self::Keyring => match entry_for(account_id)?.get_password() {
                Ok(header) => Ok(header),
                Err(keyring::Error::NoEntry) => Err(StorageError::NotFound(account_id)),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
        }
    }

    pub fn save(&self, account_id: i64, header: &str) -> Result<(), StorageError> {
        match self {
            Self::Static(_) => Ok(()),
            Self::Keyring => {
                entry_for(account_id)?.set_password(header)?;
                Ok(())
            }
        }
    }

    pub fn delete(&self, account_id: i64) -> Result<(), StorageError> {
        match self {
            Self::Static(_) => Ok(()),
            Self::Keyring => match entry_for(account_id)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
        }
    }
}

fn entry_for(account_id: i64) -> Result<Entry, StorageError> {
    Ok(Entry::new(SERVICE_NAME, &keyring_user(account_id))?)
}

fn keyring_user(account_id: i64) -> String {
    format!("account-{account_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_env_header_falls_back_to_keyring() {
        assert!(matches!(
            CredentialStore::from_env_header(Some("  ".into())),
            CredentialStore::Keyring
        ));
        assert!(matches!(
            CredentialStore::from_env_header(None),
            CredentialStore::Keyring
        ));
    }

    #[test]
    fn static_header_is_shared_by_all_accounts() {
        let store = CredentialStore::from_env_header(Some("Basic abc".into()));
        assert_eq!(store.auth_header(1).unwrap(), "Basic abc");
        assert_eq!(store.auth_header(2).unwrap(), "Basic abc");
        store.save(1, "ignored").unwrap();
        store.delete(1).unwrap();
    }

    #[test]
    fn keyring_user_is_per_account() {
        assert_eq!(keyring_user(42), "account-42");
    }
}
