use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Client id and API key used to initialize the page-level Calendar client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiCredentials {
    pub client_id: String,
    pub api_key: String,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

pub trait CredentialStore: Send + Sync {
    fn save_credentials(&self, credentials: &ApiCredentials) -> Result<(), InfraError>;
    fn load_credentials(&self) -> Result<Option<ApiCredentials>, InfraError>;
    fn delete_credentials(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new("ghostcal.calendar.api", "default")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_credentials(&self, credentials: &ApiCredentials) -> Result<(), InfraError> {
        let payload = serde_json::to_string(credentials)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry()?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_credentials(&self) -> Result<Option<ApiCredentials>, InfraError> {
        let payload = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let credentials = serde_json::from_str::<ApiCredentials>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(credentials))
    }

    fn delete_credentials(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credentials: Mutex<Option<ApiCredentials>>,
}

impl InMemoryCredentialStore {
    pub fn with_credentials(credentials: ApiCredentials) -> Self {
        Self {
            credentials: Mutex::new(Some(credentials)),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_credentials(&self, credentials: &ApiCredentials) -> Result<(), InfraError> {
        let mut guard = self
            .credentials
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(credentials.clone());
        Ok(())
    }

    fn load_credentials(&self) -> Result<Option<ApiCredentials>, InfraError> {
        let guard = self
            .credentials
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.clone())
    }

    fn delete_credentials(&self) -> Result<(), InfraError> {
        let mut guard = self
            .credentials
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated_keyring() -> KeyringCredentialStore {
        KeyringCredentialStore::new(
            format!("ghostcal.test.{}", uuid::Uuid::new_v4()),
            "default",
        )
    }

    #[test]
    fn keyring_store_without_entry_is_empty() {
        let store = isolated_keyring();
        assert_eq!(store.load_credentials().expect("load"), None);
        store.delete_credentials().expect("delete missing entry");
    }

    #[test]
    fn in_memory_store_roundtrip_and_delete() {
        let store = InMemoryCredentialStore::default();
        assert_eq!(store.load_credentials().expect("load"), None);

        let credentials = ApiCredentials {
            client_id: "client".to_string(),
            api_key: "key".to_string(),
        };
        store.save_credentials(&credentials).expect("save");
        assert_eq!(store.load_credentials().expect("load"), Some(credentials));

        store.delete_credentials().expect("delete");
        assert_eq!(store.load_credentials().expect("load"), None);
    }

    #[test]
    fn blank_credentials_are_incomplete() {
        let credentials = ApiCredentials {
            client_id: " ".to_string(),
            api_key: "key".to_string(),
        };
        assert!(!credentials.is_complete());
    }
}
