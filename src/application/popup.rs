use crate::application::router::{ChannelSender, HandlerError, MessageHandler};
use crate::domain::messages::{Message, MessageType, ToggleEventGhostPayload, UpdateEventEnergyPayload};
use crate::domain::models::{CalendarEvent, ExtensionState, QUICK_ENERGY_LEVELS, Settings};
use crate::infrastructure::event_mapper::calendar_id_from_event_id;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const NO_SELECTION: &str = "None";
pub const NO_GHOSTED_EVENTS: &str = "No ghosted events";

/// What the popup renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupView {
    pub ghost_future_events: bool,
    pub opacity: u8,
    pub opacity_label: String,
    pub selected_title: String,
    pub toggle_enabled: bool,
    pub ghosted_events: Vec<String>,
    pub energy_choices: Vec<String>,
    pub status: Option<String>,
}

impl Default for PopupView {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            ghost_future_events: settings.ghost_future_events,
            opacity: settings.ghost_event_opacity,
            opacity_label: format!("{}%", settings.ghost_event_opacity),
            selected_title: NO_SELECTION.to_string(),
            toggle_enabled: false,
            ghosted_events: Vec::new(),
            energy_choices: Vec::new(),
            status: None,
        }
    }
}

impl PopupView {
    pub fn empty_state(&self) -> Option<&'static str> {
        self.ghosted_events.is_empty().then_some(NO_GHOSTED_EVENTS)
    }

    pub fn apply_settings(&mut self, settings: &Settings) {
        self.ghost_future_events = settings.ghost_future_events;
        self.set_opacity(settings.ghost_event_opacity);
        self.ghosted_events = settings.ghosted_events.clone();
    }

    pub fn apply_selection(&mut self, selected: Option<&CalendarEvent>) {
        match selected.filter(|event| !event.title.is_empty()) {
            Some(event) => {
                self.selected_title = event.title.clone();
                self.toggle_enabled = true;
                self.energy_choices = QUICK_ENERGY_LEVELS.iter().map(|level| level.label()).collect();
            }
            None => {
                self.selected_title = NO_SELECTION.to_string();
                self.toggle_enabled = false;
                self.energy_choices.clear();
            }
        }
    }

    pub fn apply_state(&mut self, state: &ExtensionState) {
        self.apply_settings(&state.settings);
        self.apply_selection(state.selected_event.as_ref());
    }

    fn set_opacity(&mut self, opacity: u8) {
        self.opacity = opacity;
        self.opacity_label = format!("{opacity}%");
    }
}

/// `UPDATE_STATE` broadcast body; either part may be missing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateBroadcast {
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    selected_event: Option<CalendarEvent>,
}

/// Applies state broadcasts to the popup view.
pub struct PopupHandler {
    view: Arc<Mutex<PopupView>>,
}

impl PopupHandler {
    pub fn new(view: Arc<Mutex<PopupView>>) -> Self {
        Self { view }
    }
}

#[async_trait]
impl MessageHandler for PopupHandler {
    async fn handle(&self, message: Message) -> Result<Option<Value>, HandlerError> {
        match message.kind {
            MessageType::UpdateState => {
                let broadcast = match message.payload {
                    None | Some(Value::Null) => StateBroadcast::default(),
                    Some(_) => message
                        .payload_as::<StateBroadcast>()
                        .map_err(HandlerError::Invalid)?,
                };
                let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(settings) = broadcast.settings.as_ref() {
                    view.apply_settings(settings);
                }
                view.apply_selection(broadcast.selected_event.as_ref());
                Ok(None)
            }
            MessageType::Ping => Ok(None),
            _ => Err(HandlerError::UnknownType),
        }
    }
}

/// The popup's user actions, each a request to the background.
pub struct PopupController {
    background: ChannelSender,
    view: Arc<Mutex<PopupView>>,
}

impl PopupController {
    pub fn new(background: ChannelSender, view: Arc<Mutex<PopupView>>) -> Self {
        Self { background, view }
    }

    pub fn view(&self) -> PopupView {
        self.view.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_view(&self, update: impl FnOnce(&mut PopupView)) {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut view);
    }

    async fn request<T: for<'de> Deserialize<'de>>(&self, message: Message) -> Result<Option<T>, InfraError> {
        let result = self.background.request::<T>(message).await;
        match &result {
            Ok(_) => self.update_view(|view| view.status = None),
            Err(error) => {
                warn!(%error, "popup request failed");
                let status = error.to_string();
                self.update_view(|view| view.status = Some(status));
            }
        }
        result
    }

    async fn fetch_state(&self) -> Result<ExtensionState, InfraError> {
        Ok(self
            .request::<ExtensionState>(Message::new(MessageType::GetState))
            .await?
            .unwrap_or_default())
    }

    pub async fn load_initial_state(&self) -> Result<PopupView, InfraError> {
        let state = self.fetch_state().await?;
        self.update_view(|view| view.apply_state(&state));
        Ok(self.view())
    }

    pub async fn set_ghost_future_events(&self, enabled: bool) -> Result<(), InfraError> {
        let message = Message::with_payload(MessageType::ToggleGhost, &enabled)?;
        if let Some(settings) = self.request::<Settings>(message).await? {
            self.update_view(|view| view.apply_settings(&settings));
        }
        Ok(())
    }

    /// The label follows the slider immediately; the stored value is clamped by the background.
    pub async fn set_opacity(&self, opacity: i64) -> Result<(), InfraError> {
        self.update_view(|view| view.opacity_label = format!("{opacity}%"));
        let message = Message::with_payload(MessageType::UpdateGhostOpacity, &opacity)?;
        if let Some(settings) = self.request::<Settings>(message).await? {
            self.update_view(|view| view.apply_settings(&settings));
        }
        Ok(())
    }

    pub async fn set_hide_until(&self, until: Option<String>) -> Result<(), InfraError> {
        let message = Message::with_payload(MessageType::HideMornings, &until)?;
        if let Some(settings) = self.request::<Settings>(message).await? {
            self.update_view(|view| view.apply_settings(&settings));
        }
        Ok(())
    }

    /// Toggles the event currently selected on the page; no-op without one.
    pub async fn toggle_selected_event_ghost(&self) -> Result<bool, InfraError> {
        let state = self.fetch_state().await?;
        let Some(event) = state.selected_event else {
            debug!("no selected event to toggle");
            return Ok(false);
        };
        self.toggle_title(&event.title).await?;
        Ok(true)
    }

    pub async fn remove_ghosted(&self, title: &str) -> Result<(), InfraError> {
        self.toggle_title(title).await
    }

    async fn toggle_title(&self, title: &str) -> Result<(), InfraError> {
        let message = Message::with_payload(
            MessageType::ToggleEventGhost,
            &ToggleEventGhostPayload::toggle(title),
        )?;
        if let Some(settings) = self.request::<Settings>(message).await? {
            self.update_view(|view| view.apply_settings(&settings));
        }
        Ok(())
    }

    pub async fn open_calendar(&self) -> Result<(), InfraError> {
        self.request::<Value>(Message::new(MessageType::OpenCalendar))
            .await
            .map(|_| ())
    }

    /// Tags the selected event with an energy level.
    pub async fn set_selected_event_energy(&self, energy: i32) -> Result<Option<String>, InfraError> {
        let state = self.fetch_state().await?;
        let Some(event) = state.selected_event else {
            return Err(InfraError::NotFound("selected event".to_string()));
        };
        let message = Message::with_payload(
            MessageType::UpdateEventEnergy,
            &UpdateEventEnergyPayload {
                event_title: event.title.clone(),
                energy,
                calendar_id: calendar_id_from_event_id(&event.id),
                event_id: Some(event.id.clone()),
            },
        )?;
        self.request::<String>(message).await
    }
}

/// Relays every committed background state to the popup as `UPDATE_STATE`.
/// Ends when either side goes away.
pub fn forward_state_updates(
    mut updates: watch::Receiver<ExtensionState>,
    popup: ChannelSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update().clone();
            let message = match Message::with_payload(MessageType::UpdateState, &state) {
                Ok(message) => message,
                Err(error) => {
                    warn!(%error, "could not encode state broadcast");
                    continue;
                }
            };
            if let Err(error) = popup.send(message).await {
                debug!(%error, "popup closed; stopping state relay");
                break;
            }
        }
    })
}
