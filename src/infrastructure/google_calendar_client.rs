use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// `Ok(None)` for any non-success status; `Err` only for transport failures.
    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<GoogleCalendarEvent>, InfraError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestCalendarApi {
    client: Client,
    base_url: Url,
}

impl ReqwestCalendarApi {
    pub fn with_base_url(base_url: &str) -> Result<Self, InfraError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid calendar api base url: {error}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
        })
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::InvalidInput(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn event_endpoint(&self, calendar_id: &str, event_id: &str) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("calendar api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(calendar_id);
            segments.push("events");
            segments.push(event_id);
        }
        Ok(url)
    }
}

#[async_trait]
impl CalendarApi for ReqwestCalendarApi {
    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<GoogleCalendarEvent>, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = self.event_endpoint(calendar_id, event_id)?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::Remote(format!("network error while reading event: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Remote(format!("failed reading event response: {error}")))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), event_id, "event read returned non-success status");
            return Ok(None);
        }

        match serde_json::from_str::<GoogleCalendarEvent>(&body) {
            Ok(event) => Ok(Some(event)),
            Err(error) => {
                warn!(%error, event_id, "invalid event payload");
                Ok(None)
            }
        }
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = self.event_endpoint(calendar_id, event_id)?;
        let response = self
            .client
            .put(endpoint)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .map_err(|error| InfraError::Update(format!("network error: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Update(format!("failed reading update response: {error}")))?;

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                format!("http {}", status.as_u16())
            } else {
                format!("http {}; body={body}", status.as_u16())
            };
            return Err(InfraError::Update(message));
        }
        Ok(())
    }
}
