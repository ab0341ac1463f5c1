use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use std::sync::Mutex;

pub const AUTHENTICATION_FAILED: &str = "Authentication failed. Please try again.";

/// The platform's OAuth token capability. `Ok(None)` means the user granted nothing.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_auth_token(&self, interactive: bool) -> Result<Option<String>, InfraError>;
}

/// Hands out a fixed token. Useful when the host has already run the OAuth flow.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: Mutex<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    pub fn revoke(&self) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn get_auth_token(&self, _interactive: bool) -> Result<Option<String>, InfraError> {
        let guard = self
            .token
            .lock()
            .map_err(|error| InfraError::Authentication(format!("token lock poisoned: {error}")))?;
        Ok(guard.clone().filter(|token| !token.trim().is_empty()))
    }
}
