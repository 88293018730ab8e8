use keyring::Entry;
use tracing::debug;

use crate::{
    constants::KEYRING_SERVICE,
    error::{Error, Result},
};

/// Password storage keyed by username
pub trait SecretStore {
    fn get_password(&self, username: &str) -> Result<Option<String>>;

    fn set_password(&self, username: &str, password: &str) -> Result<()>;
}

/// The OS keychain (macOS Keychain, Windows Credential Manager, Secret Service)
pub struct OsKeyring;

impl OsKeyring {
    fn entry(username: &str) -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, username)
            .map_err(|e| Error::Keyring(format!("failed to create keyring entry: {e}")))
    }
}

impl SecretStore for OsKeyring {
    fn get_password(&self, username: &str) -> Result<Option<String>> {
        match Self::entry(username)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => {
                debug!(username, "No password in keychain");
                Ok(None)
            }
            Err(e) => Err(Error::Keyring(format!(
                "failed to retrieve password from keychain: {e}"
            ))),
        }
    }

    fn set_password(&self, username: &str, password: &str) -> Result<()> {
        Self::entry(username)?
            .set_password(password)
            .map_err(|e| Error::Keyring(format!("failed to store password in keychain: {e}")))
    }
}
