use crate::application::calendar_client::PageScriptLoader;
use crate::application::router::{ChannelSender, HandlerError, MessageHandler};
use crate::dom::annotator::Annotator;
use crate::dom::document::PageDom;
use crate::dom::locator::EventLocator;
use crate::dom::watcher::{MutationWatcher, StateSource, WatcherHandle};
use crate::domain::messages::{
    InitGapiPayload, Message, MessageType, ToggleEventGhostPayload, UpdateEventEnergyPayload,
};
use crate::domain::models::{CalendarEvent, ExtensionState, StatePatch};
use crate::infrastructure::credential_store::ApiCredentials;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Handles messages inside the calendar page.
pub struct ContentHandler<D> {
    dom: Arc<Mutex<D>>,
    locator: Arc<Mutex<EventLocator>>,
    annotator: Arc<Annotator>,
    loader: Option<Arc<dyn PageScriptLoader>>,
}

impl<D: PageDom + 'static> ContentHandler<D> {
    pub fn new(dom: Arc<Mutex<D>>, locator: EventLocator, annotator: Annotator) -> Self {
        Self {
            dom,
            locator: Arc::new(Mutex::new(locator)),
            annotator: Arc::new(annotator),
            loader: None,
        }
    }

    pub fn with_page_loader(mut self, loader: Arc<dyn PageScriptLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    fn page(&self) -> Result<MutexGuard<'_, D>, InfraError> {
        self.dom
            .lock()
            .map_err(|_| InfraError::Storage("page lock poisoned".to_string()))
    }

    pub fn selected_event(&self) -> Result<Option<CalendarEvent>, InfraError> {
        let page = self.page()?;
        let mut locator = self
            .locator
            .lock()
            .map_err(|_| InfraError::Storage("locator lock poisoned".to_string()))?;
        Ok(locator.locate_selected(&*page))
    }

    pub fn apply_state(&self, state: &ExtensionState) -> Result<(), InfraError> {
        let mut page = self.page()?;
        self.annotator.apply_settings(&mut *page, &state.settings);
        Ok(())
    }

    /// Watcher sharing this handler's page, locator and annotator.
    pub fn watcher(&self, source: Arc<dyn StateSource>, throttle: Duration) -> MutationWatcher<D> {
        MutationWatcher::new(
            self.dom.clone(),
            self.locator.clone(),
            self.annotator.clone(),
            source,
            throttle,
        )
    }
}

fn payload<T: for<'de> serde::Deserialize<'de>>(message: &Message) -> Result<T, HandlerError> {
    message.payload_as::<T>().map_err(HandlerError::Invalid)
}

#[async_trait]
impl<D: PageDom + 'static> MessageHandler for ContentHandler<D> {
    async fn handle(&self, message: Message) -> Result<Option<Value>, HandlerError> {
        match message.kind {
            MessageType::GetState => {
                let selected = self.selected_event()?;
                Ok(Some(serde_json::to_value(selected).map_err(InfraError::from)?))
            }
            MessageType::ToggleGhost => {
                let enabled = payload::<bool>(&message)?;
                let mut page = self.page()?;
                self.annotator.apply_future_ghosting(&mut *page, enabled);
                Ok(None)
            }
            MessageType::HideMornings => {
                let until = payload::<Option<String>>(&message)?;
                let mut page = self.page()?;
                self.annotator.hide_mornings(&mut *page, until.as_deref());
                Ok(None)
            }
            MessageType::ToggleEventGhost => {
                let request = payload::<ToggleEventGhostPayload>(&message)?;
                let (Some(titles), Some(opacity)) = (request.titles, request.opacity) else {
                    debug!("event ghost render without titles; ignoring");
                    return Ok(None);
                };
                let mut page = self.page()?;
                self.annotator.apply_event_ghosting(&mut *page, &titles, opacity);
                Ok(None)
            }
            MessageType::UpdateEventEnergy => {
                let request = payload::<UpdateEventEnergyPayload>(&message)?;
                let touched = {
                    let mut page = self.page()?;
                    self.annotator
                        .apply_energy(&mut *page, &request.event_title, request.energy)
                };
                Ok(Some(Value::from(touched)))
            }
            MessageType::InitGapi => {
                let request = payload::<InitGapiPayload>(&message)?;
                let loader = self
                    .loader
                    .as_ref()
                    .ok_or_else(|| HandlerError::Invalid("page client loader unavailable".to_string()))?;
                loader
                    .load(&ApiCredentials {
                        client_id: request.client_id,
                        api_key: request.api_key,
                    })
                    .await?;
                info!("page calendar client loaded");
                Ok(None)
            }
            MessageType::Ping => Ok(None),
            MessageType::UpdateState
            | MessageType::AuthRequired
            | MessageType::UpdateGhostOpacity
            | MessageType::OpenCalendar
            | MessageType::Unknown(_) => Err(HandlerError::UnknownType),
        }
    }
}

/// Reads state from the background context over its channel.
pub struct BackgroundStateSource {
    background: ChannelSender,
}

impl BackgroundStateSource {
    pub fn new(background: ChannelSender) -> Self {
        Self { background }
    }
}

#[async_trait]
impl StateSource for BackgroundStateSource {
    async fn current_state(&self) -> Result<ExtensionState, InfraError> {
        Ok(self
            .background
            .request::<ExtensionState>(Message::new(MessageType::GetState))
            .await?
            .unwrap_or_default())
    }
}

/// The content script's own initiatives: initial render, click-to-select
/// and the mutation watcher.
pub struct ContentScript<D> {
    handler: Arc<ContentHandler<D>>,
    background: ChannelSender,
    throttle: Duration,
}

impl<D: PageDom + 'static> ContentScript<D> {
    pub fn new(handler: Arc<ContentHandler<D>>, background: ChannelSender, throttle: Duration) -> Self {
        Self {
            handler,
            background,
            throttle,
        }
    }

    pub fn handler(&self) -> &Arc<ContentHandler<D>> {
        &self.handler
    }

    /// Fetches state from the background and applies every effect.
    pub async fn on_page_load(&self) -> Result<ExtensionState, InfraError> {
        let state = BackgroundStateSource::new(self.background.clone())
            .current_state()
            .await?;
        self.handler.apply_state(&state)?;
        Ok(state)
    }

    /// Reports the clicked (now selected) event to the background.
    pub async fn on_click(&self) -> Result<Option<CalendarEvent>, InfraError> {
        let Some(event) = self.handler.selected_event()? else {
            return Ok(None);
        };
        let message = Message::with_payload(
            MessageType::UpdateState,
            &StatePatch::selected_event(Some(event.clone())),
        )?;
        self.background
            .send(message)
            .await?
            .into_result()
            .map_err(InfraError::Rejected)?;
        Ok(Some(event))
    }

    pub fn watch(&self) -> WatcherHandle {
        let source = Arc::new(BackgroundStateSource::new(self.background.clone()));
        self.handler.watcher(source, self.throttle).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::coordinator::StateCoordinator;
    use crate::application::router::{MessageRouter, channel};
    use crate::dom::annotator::GHOSTED_CLASS;
    use crate::dom::document::{Document, ElementBuilder, ElementId};
    use crate::domain::models::Settings;
    use crate::infrastructure::config::ExtensionConfig;
    use crate::infrastructure::host::Tab;
    use crate::infrastructure::host::fake::RecordingHost;
    use crate::infrastructure::storage::InMemorySettingsStore;
    use chrono::{DateTime, Utc};

    fn noon() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T12:00:00Z")
            .expect("now")
            .with_timezone(&Utc)
    }

    fn page() -> (Arc<Mutex<Document>>, ElementId, ElementId) {
        let mut doc = Document::new();
        let body = doc.body();
        let standup = doc.append(
            body,
            ElementBuilder::new("div")
                .attr("data-eventid", "primary_standup")
                .attr("aria-selected", "true")
                .child(ElementBuilder::new("span").class("FAxxKc").text("Standup"))
                .child(ElementBuilder::new("time").attr("datetime", "2026-02-16T10:00:00Z")),
        );
        let review = doc.append(
            body,
            ElementBuilder::new("div")
                .attr("data-eventid", "primary_review")
                .child(ElementBuilder::new("span").class("FAxxKc").text("Review"))
                .child(ElementBuilder::new("time").attr("datetime", "2026-02-16T15:00:00Z")),
        );
        (Arc::new(Mutex::new(doc)), standup, review)
    }

    fn handler(doc: Arc<Mutex<Document>>) -> ContentHandler<Document> {
        ContentHandler::new(
            doc,
            EventLocator::new(Duration::from_secs(5)).expect("locator"),
            Annotator::new().expect("annotator").with_clock(Arc::new(noon)),
        )
    }

    #[tokio::test]
    async fn get_state_reports_selected_event() {
        let (doc, _, _) = page();
        let data = handler(doc)
            .handle(Message::new(MessageType::GetState))
            .await
            .expect("handled")
            .expect("data");
        let event: CalendarEvent = serde_json::from_value(data).expect("event");
        assert_eq!(event.id, "primary_standup");
        assert_eq!(event.title, "Standup");
    }

    #[tokio::test]
    async fn render_messages_apply_to_page() {
        let (doc, standup, review) = page();
        let handler = handler(doc.clone());

        handler
            .handle(Message::with_payload(MessageType::ToggleGhost, &true).expect("message"))
            .await
            .expect("ghost");
        handler
            .handle(
                Message::with_payload(
                    MessageType::ToggleEventGhost,
                    &ToggleEventGhostPayload::render(vec!["Standup".to_string()], 30),
                )
                .expect("message"),
            )
            .await
            .expect("event ghost");
        handler
            .handle(Message::with_payload(MessageType::HideMornings, &"11:00").expect("message"))
            .await
            .expect("hide");

        let doc = doc.lock().expect("doc lock");
        assert_eq!(doc.style(review, "opacity").as_deref(), Some("0.5"));
        assert_eq!(doc.style(standup, "opacity").as_deref(), Some("0.3"));
        assert!(doc.has_class(standup, GHOSTED_CLASS));
        assert_eq!(doc.style(standup, "display").as_deref(), Some("none"));
        assert_eq!(doc.style(review, "display"), None);
    }

    #[tokio::test]
    async fn toggle_request_without_titles_is_ignored() {
        let (doc, _, _) = page();
        let before = doc.lock().expect("doc lock").mutation_version();
        let result = handler(doc.clone())
            .handle(
                Message::with_payload(
                    MessageType::ToggleEventGhost,
                    &ToggleEventGhostPayload::toggle("Standup"),
                )
                .expect("message"),
            )
            .await
            .expect("handled");
        assert_eq!(result, None);
        assert_eq!(doc.lock().expect("doc lock").mutation_version(), before);
    }

    #[tokio::test]
    async fn energy_update_reports_touched_events() {
        let (doc, _, _) = page();
        let data = handler(doc.clone())
            .handle(
                Message::with_payload(
                    MessageType::UpdateEventEnergy,
                    &UpdateEventEnergyPayload {
                        event_title: "Review".to_string(),
                        energy: 0,
                        calendar_id: None,
                        event_id: None,
                    },
                )
                .expect("message"),
            )
            .await
            .expect("handled");
        assert_eq!(data, Some(Value::from(1)));
    }

    #[tokio::test]
    async fn background_only_kinds_are_unknown_here() {
        let (doc, _, _) = page();
        let result = handler(doc)
            .handle(Message::new(MessageType::AuthRequired))
            .await;
        assert!(matches!(result, Err(HandlerError::UnknownType)));
    }

    #[tokio::test]
    async fn init_without_loader_is_an_error() {
        let (doc, _, _) = page();
        let result = handler(doc)
            .handle(
                Message::with_payload(
                    MessageType::InitGapi,
                    &InitGapiPayload {
                        client_id: "id".to_string(),
                        api_key: "key".to_string(),
                    },
                )
                .expect("message"),
            )
            .await;
        assert!(matches!(result, Err(HandlerError::Invalid(_))));
    }

    #[tokio::test]
    async fn click_selects_event_in_background_and_load_applies_state() {
        let store = Arc::new(InMemorySettingsStore::default());
        let host = Arc::new(RecordingHost::with_active(Tab::new(
            7,
            "https://calendar.google.com/calendar/u/0/r",
        )));
        let coordinator = Arc::new(StateCoordinator::new(ExtensionConfig::default(), store, host.clone()));
        let (to_background, background_rx) = channel(16);
        MessageRouter::new("background", coordinator.clone()).listen(background_rx);

        let (doc, standup, review) = page();
        let content = Arc::new(handler(doc.clone()));
        let (to_content, content_rx) = channel(16);
        MessageRouter::new("content", content.clone()).listen(content_rx);
        host.connect(7, to_content);

        let script = ContentScript::new(content, to_background, Duration::from_millis(250));
        let selected = script.on_click().await.expect("click").expect("selected");
        assert_eq!(selected.title, "Standup");
        assert_eq!(
            coordinator.get_state().selected_event.map(|event| event.id),
            Some("primary_standup".to_string())
        );

        coordinator
            .update_settings(|settings| Settings {
                ghosted_events: vec!["Standup".to_string()],
                ghost_future_events: true,
                ..settings.clone()
            })
            .await;
        {
            let doc = doc.lock().expect("doc lock");
            assert!(doc.has_class(standup, GHOSTED_CLASS));
            assert_eq!(doc.style(review, "filter").as_deref(), Some("grayscale(50%)"));
        }

        let state = script.on_page_load().await.expect("load");
        assert!(state.settings.ghost_future_events);
        assert!(host.injected.lock().expect("inject lock").is_empty());
    }
}
