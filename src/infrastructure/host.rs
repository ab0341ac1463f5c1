use crate::domain::messages::{Message, MessageResponse};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tab {
    pub id: Option<u32>,
    pub url: Option<String>,
    pub window_id: Option<u32>,
}

impl Tab {
    pub fn new(id: u32, url: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            url: Some(url.into()),
            window_id: None,
        }
    }

    pub fn in_window(mut self, window_id: u32) -> Self {
        self.window_id = Some(window_id);
        self
    }
}

/// Browser capabilities the background context calls into. Any call may
/// reject; callers decide whether that is fatal.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    async fn active_tab(&self) -> Result<Option<Tab>, InfraError>;

    async fn query_tabs(&self, url_prefix: &str) -> Result<Vec<Tab>, InfraError>;

    async fn reload_tab(&self, tab_id: u32) -> Result<(), InfraError>;

    async fn send_to_tab(&self, tab_id: u32, message: Message)
    -> Result<MessageResponse, InfraError>;

    async fn inject_content_script(
        &self,
        tab_id: u32,
        script: &str,
        stylesheet: &str,
    ) -> Result<(), InfraError>;

    async fn set_popup_enabled(&self, tab_id: u32, enabled: bool) -> Result<(), InfraError>;

    async fn set_action_icon(&self, icon_url: &str) -> Result<(), InfraError>;

    /// Window the user is currently in, if the host knows one.
    async fn focused_window(&self) -> Result<Option<u32>, InfraError>;

    async fn focus_window(&self, window_id: u32) -> Result<(), InfraError>;

    async fn activate_tab(&self, tab_id: u32) -> Result<(), InfraError>;

    /// Opens an active tab at `url` and returns it.
    async fn create_tab(&self, url: &str) -> Result<Tab, InfraError>;
}
