use crate::application::calendar_client::CalendarSession;
use crate::application::router::{HandlerError, MessageHandler};
use crate::domain::messages::{
    InitGapiPayload, Message, MessageType, ToggleEventGhostPayload, UpdateEventEnergyPayload,
};
use crate::domain::models::{
    CalendarEvent, ExtensionState, MAX_GHOST_OPACITY, Settings, StatePatch, validate_hhmm,
};
use crate::infrastructure::config::ExtensionConfig;
use crate::infrastructure::credential_store::{ApiCredentials, CredentialStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::calendar_id_from_event_id;
use crate::infrastructure::host::{HostPlatform, Tab};
use crate::infrastructure::storage::SettingsStore;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

pub const CALENDAR_ICON_URL: &str =
    "https://calendar.google.com/googlecalendar/images/favicons_2020q4/calendar_{day}.ico";
const DEFAULT_CALENDAR_ID: &str = "primary";

#[derive(Debug, Clone, Default)]
struct VersionedState {
    state: ExtensionState,
    version: u64,
}

/// Single owner of the extension state in the background context. Every
/// update is merged, persisted and rendered to the calendar tab in order.
pub struct StateCoordinator<S, H>
where
    S: SettingsStore,
    H: HostPlatform,
{
    config: ExtensionConfig,
    store: Arc<S>,
    host: Arc<H>,
    credentials: Option<Arc<dyn CredentialStore>>,
    calendar: Option<Arc<dyn CalendarSession>>,
    current: RwLock<VersionedState>,
    commit_lock: Mutex<()>,
    updates: watch::Sender<ExtensionState>,
}

impl<S, H> StateCoordinator<S, H>
where
    S: SettingsStore,
    H: HostPlatform,
{
    pub fn new(config: ExtensionConfig, store: Arc<S>, host: Arc<H>) -> Self {
        let (updates, _) = watch::channel(ExtensionState::default());
        Self {
            config,
            store,
            host,
            credentials: None,
            calendar: None,
            current: RwLock::new(VersionedState::default()),
            commit_lock: Mutex::new(()),
            updates,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_calendar_session(mut self, calendar: Arc<dyn CalendarSession>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn config(&self) -> &ExtensionConfig {
        &self.config
    }

    pub fn get_state(&self) -> ExtensionState {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Receives every committed state.
    pub fn subscribe(&self) -> watch::Receiver<ExtensionState> {
        self.updates.subscribe()
    }

    /// Loads persisted state (defaults when absent or unreadable) and pushes
    /// any active effects to every open calendar tab.
    pub async fn initialize_state(&self) -> ExtensionState {
        let _guard = self.commit_lock.lock().await;
        let loaded = match self.store.load().await {
            Ok(Some(state)) => ExtensionState {
                settings: state.settings.clone().normalized(),
                ..state
            },
            Ok(None) => {
                info!("no stored state; starting from defaults");
                ExtensionState::default()
            }
            Err(error) => {
                warn!(%error, "failed to load stored state; starting from defaults");
                ExtensionState::default()
            }
        };
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            current.state = loaded.clone();
            current.version += 1;
        }
        self.updates.send_replace(loaded.clone());
        self.render_to_calendar_tabs(render_messages(None, &loaded.settings))
            .await;
        loaded
    }

    /// Shallow merge, write-through persist, then render. Never fails: a
    /// store error is logged and the in-memory state is kept.
    pub async fn update_state(&self, patch: StatePatch) -> ExtensionState {
        self.commit(move |_| patch).await
    }

    /// Replaces settings with `compose(current settings)`.
    pub async fn update_settings<F>(&self, compose: F) -> ExtensionState
    where
        F: FnOnce(&Settings) -> Settings + Send,
    {
        self.commit(move |state| StatePatch::settings(compose(&state.settings)))
            .await
    }

    async fn commit<F>(&self, make_patch: F) -> ExtensionState
    where
        F: FnOnce(&ExtensionState) -> StatePatch + Send,
    {
        let _guard = self.commit_lock.lock().await;
        let (previous, next) = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let previous = current.state.clone();
            let next = make_patch(&previous).apply_to(&previous);
            current.state = next.clone();
            current.version += 1;
            (previous, next)
        };

        if let Err(error) = self.store.save(&next).await {
            warn!(%error, "failed to persist state; keeping in-memory update");
        }
        self.updates.send_replace(next.clone());
        self.fan_out(render_messages(Some(&previous.settings), &next.settings))
            .await;
        next
    }

    pub async fn toggle_ghosting(&self, enabled: bool) -> ExtensionState {
        self.update_settings(|settings| Settings {
            ghost_future_events: enabled,
            ..settings.clone()
        })
        .await
    }

    pub async fn toggle_event_ghost(&self, title: &str) -> Result<ExtensionState, InfraError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(InfraError::InvalidInput("event title must not be empty".to_string()));
        }
        let title = title.to_string();
        Ok(self
            .update_settings(move |settings| settings.with_toggled_ghost(&title))
            .await)
    }

    /// Any integer is accepted and clamped to `0..=100`.
    pub async fn update_ghost_opacity(&self, opacity: i64) -> ExtensionState {
        let clamped = opacity.clamp(0, i64::from(MAX_GHOST_OPACITY)) as u8;
        self.update_settings(move |settings| Settings {
            ghost_event_opacity: clamped,
            ..settings.clone()
        })
        .await
    }

    /// `None` or blank clears the cutoff; anything else must be `HH:MM`.
    pub async fn hide_mornings(&self, until: Option<String>) -> Result<ExtensionState, InfraError> {
        let until = until
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(value) = until.as_deref() {
            validate_hhmm(value, "hideUntilTime").map_err(InfraError::InvalidInput)?;
        }
        Ok(self
            .update_settings(move |settings| Settings {
                hide_until_time: until,
                ..settings.clone()
            })
            .await)
    }

    pub async fn select_event(&self, event: Option<CalendarEvent>) -> ExtensionState {
        self.update_state(StatePatch::selected_event(event)).await
    }

    pub fn is_calendar_page(&self, url: &str) -> bool {
        url.starts_with(&self.config.calendar_origin)
    }

    /// Probes the tab and injects the content script when nothing answers.
    pub async fn ensure_content_script(&self, tab_id: u32) -> Result<(), InfraError> {
        if self
            .host
            .send_to_tab(tab_id, Message::new(MessageType::Ping))
            .await
            .is_ok()
        {
            return Ok(());
        }
        debug!(tab_id, "content script not answering; injecting");
        match self
            .host
            .inject_content_script(tab_id, &self.config.content_script, &self.config.stylesheet)
            .await
        {
            Ok(()) => {
                info!(tab_id, "content script injected");
                Ok(())
            }
            Err(InfraError::Injection(message)) if message.to_ascii_lowercase().contains("already") => {
                debug!(tab_id, "content script already present");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub async fn reload_calendar_tabs(&self) -> Result<usize, InfraError> {
        let tabs = self.host.query_tabs(&self.config.calendar_origin).await?;
        let mut reloaded = 0;
        for tab_id in tabs.iter().filter_map(|tab| tab.id) {
            self.host.reload_tab(tab_id).await?;
            reloaded += 1;
        }
        Ok(reloaded)
    }

    /// Brings a calendar tab to the front, preferring one in the focused
    /// window, or opens a new one.
    pub async fn open_calendar(&self) -> Result<Tab, InfraError> {
        let tabs: Vec<Tab> = self
            .host
            .query_tabs(&self.config.calendar_origin)
            .await?
            .into_iter()
            .filter(|tab| tab.id.is_some())
            .collect();
        let focused = self.host.focused_window().await?;
        let existing = tabs
            .iter()
            .find(|tab| focused.is_some() && tab.window_id == focused)
            .or_else(|| tabs.first())
            .cloned();

        if let Some(tab) = existing {
            if let Some(window_id) = tab.window_id {
                self.host.focus_window(window_id).await?;
            }
            if let Some(tab_id) = tab.id {
                self.host.activate_tab(tab_id).await?;
                info!(tab_id, "switched to calendar tab");
            }
            return Ok(tab);
        }

        let tab = self.host.create_tab(&self.config.calendar_origin).await?;
        if let Some(window_id) = tab.window_id {
            self.host.focus_window(window_id).await?;
        }
        info!(tab_id = ?tab.id, "opened calendar tab");
        Ok(tab)
    }

    /// Toolbar button. On a calendar page the popup handles the click;
    /// anywhere else the calendar is opened.
    pub async fn on_action_clicked(&self, tab: &Tab) -> Result<Option<Tab>, InfraError> {
        if tab
            .url
            .as_deref()
            .is_some_and(|url| self.is_calendar_page(url))
        {
            return Ok(None);
        }
        self.open_calendar().await.map(Some)
    }

    pub async fn on_tab_activated(&self, tab: &Tab) -> Result<(), InfraError> {
        self.sync_popup(tab).await
    }

    /// Also makes sure a freshly loaded calendar page has its content script.
    pub async fn on_tab_updated(&self, tab: &Tab) -> Result<(), InfraError> {
        self.sync_popup(tab).await?;
        if let (Some(id), Some(url)) = (tab.id, tab.url.as_deref()) {
            if self.is_calendar_page(url) {
                self.ensure_content_script(id).await?;
            }
        }
        Ok(())
    }

    async fn sync_popup(&self, tab: &Tab) -> Result<(), InfraError> {
        let Some(id) = tab.id else {
            return Ok(());
        };
        let enabled = tab
            .url
            .as_deref()
            .is_some_and(|url| self.is_calendar_page(url));
        self.host.set_popup_enabled(id, enabled).await
    }

    pub async fn refresh_action_icon(&self, today: NaiveDate) -> Result<String, InfraError> {
        let url = calendar_icon_url(today);
        self.host.set_action_icon(&url).await?;
        Ok(url)
    }

    fn stored_credentials(&self) -> Result<Option<ApiCredentials>, InfraError> {
        let Some(store) = &self.credentials else {
            return Ok(None);
        };
        Ok(store
            .load_credentials()?
            .filter(ApiCredentials::is_complete))
    }

    /// Initializes the remote client from stored credentials and marks the
    /// state authorized. Without stored credentials nothing happens.
    pub async fn authenticate(&self) -> Result<ExtensionState, InfraError> {
        let Some(credentials) = self.stored_credentials()? else {
            info!("no stored api credentials; skipping authorization");
            return Ok(self.get_state());
        };
        if let Some(calendar) = &self.calendar {
            calendar
                .init(&credentials.client_id, &credentials.api_key)
                .await?;
        }
        Ok(self.update_state(StatePatch::authorized(true)).await)
    }

    /// Asks the active calendar tab to load the page client with stored credentials.
    pub async fn init_page_client(&self) -> Result<(), InfraError> {
        let credentials = self
            .stored_credentials()?
            .ok_or_else(|| InfraError::NotFound("api credentials".to_string()))?;
        let message = Message::with_payload(
            MessageType::InitGapi,
            &InitGapiPayload {
                client_id: credentials.client_id,
                api_key: credentials.api_key,
            },
        )?;
        self.notify_active_tab(message).await
    }

    /// Rewrites the page, then best-effort pushes the new title to the
    /// remote calendar. Returns the remote title when that succeeded.
    pub async fn update_event_energy(
        &self,
        request: UpdateEventEnergyPayload,
    ) -> Result<Option<String>, InfraError> {
        let message = Message::with_payload(MessageType::UpdateEventEnergy, &request)?;
        self.notify_active_tab(message).await?;

        let selected = self.get_state().selected_event;
        if let Some(event) = selected.filter(|event| event.title == request.event_title) {
            self.select_event(Some(CalendarEvent {
                energy: Some(request.energy),
                ..event
            }))
            .await;
        }

        let (Some(calendar), Some(event_id)) = (&self.calendar, request.event_id.as_deref()) else {
            return Ok(None);
        };
        let calendar_id = request
            .calendar_id
            .clone()
            .or_else(|| calendar_id_from_event_id(event_id))
            .unwrap_or_else(|| DEFAULT_CALENDAR_ID.to_string());
        match calendar
            .update_event_energy(&calendar_id, event_id, request.energy)
            .await
        {
            Ok(title) => Ok(Some(title)),
            Err(error) => {
                warn!(%error, event_id, "remote energy update failed");
                Ok(None)
            }
        }
    }

    /// Sends to the active tab when it is a calendar page.
    pub async fn notify_active_tab(&self, message: Message) -> Result<(), InfraError> {
        let tab = self
            .host
            .active_tab()
            .await?
            .ok_or_else(|| InfraError::NotFound("No active tab".to_string()))?;
        let (Some(tab_id), Some(url)) = (tab.id, tab.url.as_deref()) else {
            return Err(InfraError::NotFound("No active tab".to_string()));
        };
        if !self.is_calendar_page(url) {
            debug!(tab_id, kind = message.kind.as_str(), "active tab is not a calendar page");
            return Ok(());
        }
        self.ensure_content_script(tab_id).await?;
        self.host
            .send_to_tab(tab_id, message)
            .await?
            .into_result()
            .map(|_| ())
            .map_err(InfraError::Rejected)
    }

    async fn render_to_calendar_tabs(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let tabs = match self.host.query_tabs(&self.config.calendar_origin).await {
            Ok(tabs) => tabs,
            Err(error) => {
                warn!(%error, "failed to list calendar tabs");
                return;
            }
        };
        for tab_id in tabs.iter().filter_map(|tab| tab.id) {
            if let Err(error) = self.ensure_content_script(tab_id).await {
                warn!(%error, tab_id, "calendar tab has no content script");
                continue;
            }
            for message in &messages {
                let delivered = self
                    .host
                    .send_to_tab(tab_id, message.clone())
                    .await
                    .and_then(|response| response.into_result().map_err(InfraError::Rejected));
                if let Err(error) = delivered {
                    warn!(%error, tab_id, kind = message.kind.as_str(), "failed to render calendar tab");
                }
            }
        }
    }

    async fn fan_out(&self, messages: Vec<Message>) {
        for message in messages {
            let kind = message.kind.as_str().to_string();
            if let Err(error) = self.notify_active_tab(message).await {
                warn!(%error, kind = %kind, "failed to notify calendar tab");
            }
        }
    }
}

/// Messages that bring a page rendered with `previous` in line with `next`.
/// With no previous settings only active effects are sent.
pub fn render_messages(previous: Option<&Settings>, next: &Settings) -> Vec<Message> {
    let mut messages = Vec::new();
    let defaults = Settings::default();
    let baseline = previous.unwrap_or(&defaults);

    if next.ghost_future_events != baseline.ghost_future_events {
        messages.push(Message {
            kind: MessageType::ToggleGhost,
            payload: Some(Value::Bool(next.ghost_future_events)),
        });
    }
    let ghosting_changed = next.ghosted_events != baseline.ghosted_events
        || (previous.is_some() && next.ghost_event_opacity != baseline.ghost_event_opacity);
    if ghosting_changed {
        let payload = ToggleEventGhostPayload::render(next.ghosted_events.clone(), next.ghost_event_opacity);
        messages.push(Message {
            kind: MessageType::ToggleEventGhost,
            payload: serde_json::to_value(payload).ok(),
        });
    }
    if next.hide_until_time != baseline.hide_until_time {
        messages.push(Message {
            kind: MessageType::HideMornings,
            payload: Some(
                next.hide_until_time
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ),
        });
    }
    messages
}

pub fn calendar_icon_url(today: NaiveDate) -> String {
    CALENDAR_ICON_URL.replace("{day}", &today.day().to_string())
}

fn payload<T: for<'de> serde::Deserialize<'de>>(message: &Message) -> Result<T, HandlerError> {
    message.payload_as::<T>().map_err(HandlerError::Invalid)
}

fn to_data<T: serde::Serialize>(value: &T) -> Result<Option<Value>, HandlerError> {
    Ok(Some(serde_json::to_value(value).map_err(InfraError::from)?))
}

#[async_trait]
impl<S, H> MessageHandler for StateCoordinator<S, H>
where
    S: SettingsStore,
    H: HostPlatform,
{
    async fn handle(&self, message: Message) -> Result<Option<Value>, HandlerError> {
        match message.kind {
            MessageType::GetState => to_data(&self.get_state()),
            MessageType::UpdateState => {
                let patch = match message.payload {
                    None | Some(Value::Null) => StatePatch::default(),
                    Some(_) => payload::<StatePatch>(&message)?,
                };
                if let Some(settings) = patch.settings.as_ref() {
                    settings
                        .clone()
                        .normalized()
                        .validate()
                        .map_err(HandlerError::Invalid)?;
                }
                to_data(&self.update_state(patch).await)
            }
            MessageType::AuthRequired => {
                self.authenticate().await?;
                Ok(None)
            }
            MessageType::ToggleGhost => {
                let enabled = payload::<bool>(&message)?;
                to_data(&self.toggle_ghosting(enabled).await.settings)
            }
            MessageType::ToggleEventGhost => {
                let request = payload::<ToggleEventGhostPayload>(&message)?;
                match request.event_title {
                    Some(title) => to_data(&self.toggle_event_ghost(&title).await?.settings),
                    None => Ok(None),
                }
            }
            MessageType::UpdateGhostOpacity => {
                let value = payload::<f64>(&message)?;
                if !value.is_finite() {
                    return Err(HandlerError::Invalid("opacity must be a number".to_string()));
                }
                to_data(&self.update_ghost_opacity(value.round() as i64).await.settings)
            }
            MessageType::HideMornings => {
                let until = payload::<Option<String>>(&message)?;
                to_data(&self.hide_mornings(until).await?.settings)
            }
            MessageType::InitGapi => {
                self.init_page_client().await?;
                Ok(None)
            }
            MessageType::UpdateEventEnergy => {
                let request = payload::<UpdateEventEnergyPayload>(&message)?;
                to_data(&self.update_event_energy(request).await?)
            }
            MessageType::OpenCalendar => {
                self.open_calendar().await?;
                Ok(None)
            }
            MessageType::Ping => Ok(None),
            MessageType::Unknown(_) => Err(HandlerError::UnknownType),
        }
    }
}
