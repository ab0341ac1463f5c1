use crate::domain::messages::{InitGapiPayload, Message, MessageType};
use crate::infrastructure::credential_store::ApiCredentials;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use crate::infrastructure::google_calendar_client::CalendarApi;
use crate::infrastructure::host::{HostPlatform, Tab};
use crate::infrastructure::identity::{AUTHENTICATION_FAILED, IdentityProvider};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const TAB_CACHE_TTL: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `n * base_delay`.
    pub fn delay_after(&self, attempt: u8) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Loads the page-level calendar client in some page context.
#[async_trait]
pub trait PageScriptLoader: Send + Sync {
    async fn load(&self, credentials: &ApiCredentials) -> Result<(), InfraError>;
}

/// What the coordinator needs from a remote calendar session.
#[async_trait]
pub trait CalendarSession: Send + Sync {
    async fn init(&self, client_id: &str, api_key: &str) -> Result<(), InfraError>;

    /// Returns the title written to the remote event.
    async fn update_event_energy(
        &self,
        calendar_id: &str,
        event_id: &str,
        energy: i32,
    ) -> Result<String, InfraError>;
}

type SharedInit = Shared<BoxFuture<'static, Result<(), String>>>;

enum InitState {
    Uninitialized,
    Initializing {
        credentials: ApiCredentials,
        pending: SharedInit,
    },
    Ready {
        credentials: ApiCredentials,
    },
}

pub struct RemoteCalendarClient<A, I>
where
    A: CalendarApi,
    I: IdentityProvider,
{
    api: Arc<A>,
    identity: Arc<I>,
    loader: Option<Arc<dyn PageScriptLoader>>,
    retry_policy: RetryPolicy,
    state: Mutex<InitState>,
}

impl<A, I> RemoteCalendarClient<A, I>
where
    A: CalendarApi + 'static,
    I: IdentityProvider + 'static,
{
    pub fn new(api: Arc<A>, identity: Arc<I>) -> Self {
        Self {
            api,
            identity,
            loader: None,
            retry_policy: RetryPolicy::default(),
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_page_loader(mut self, loader: Arc<dyn PageScriptLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.state
            .lock()
            .map(|state| matches!(*state, InitState::Ready { .. }))
            .unwrap_or(false)
    }

    /// Idempotent: concurrent callers share one in-flight initialization and
    /// a ready client with the same credentials returns immediately.
    pub async fn init(&self, client_id: &str, api_key: &str) -> Result<(), InfraError> {
        let credentials = ApiCredentials {
            client_id: client_id.to_string(),
            api_key: api_key.to_string(),
        };
        let pending = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| InfraError::Remote("calendar client lock poisoned".to_string()))?;
            if let InitState::Ready { credentials: ready } = &*state {
                if *ready == credentials {
                    return Ok(());
                }
            }
            let in_flight = match &*state {
                InitState::Initializing {
                    credentials: pending_for,
                    pending,
                } if *pending_for == credentials => Some(pending.clone()),
                _ => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => {
                    let pending = self.start_init(credentials.clone());
                    *state = InitState::Initializing {
                        credentials: credentials.clone(),
                        pending: pending.clone(),
                    };
                    pending
                }
            }
        };

        let outcome = pending.await;
        let mut state = self
            .state
            .lock()
            .map_err(|_| InfraError::Remote("calendar client lock poisoned".to_string()))?;
        let still_current = matches!(
            &*state,
            InitState::Initializing { credentials: pending_for, .. } if *pending_for == credentials
        );
        match outcome {
            Ok(()) => {
                if still_current {
                    info!("remote calendar client ready");
                    *state = InitState::Ready { credentials };
                }
                Ok(())
            }
            Err(message) => {
                if still_current {
                    *state = InitState::Uninitialized;
                }
                Err(InfraError::Remote(format!("initialization failed: {message}")))
            }
        }
    }

    fn start_init(&self, credentials: ApiCredentials) -> SharedInit {
        let loader = self.loader.clone();
        async move {
            match loader {
                Some(loader) => loader.load(&credentials).await.map_err(|error| error.to_string()),
                None => Ok(()),
            }
        }
        .boxed()
        .shared()
    }

    /// Interactive token; absence maps to the user-facing authentication error.
    pub async fn get_auth_token(&self) -> Result<String, InfraError> {
        match self.identity.get_auth_token(true).await {
            Ok(Some(token)) if !token.trim().is_empty() => Ok(token),
            Ok(_) => Err(InfraError::Authentication(AUTHENTICATION_FAILED.to_string())),
            Err(error) => {
                warn!(%error, "identity provider failed");
                Err(InfraError::Authentication(AUTHENTICATION_FAILED.to_string()))
            }
        }
    }

    pub async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<GoogleCalendarEvent>, InfraError> {
        let token = self.get_auth_token().await?;
        self.api.get_event(&token, calendar_id, event_id).await
    }

    pub async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        let token = self.get_auth_token().await?;
        self.api.update_event(&token, calendar_id, event_id, event).await
    }

    /// Reads the event, swaps its summary and writes it back, retrying the
    /// read/write round with linear backoff. The token is fetched once;
    /// authentication failures are returned without retrying.
    pub async fn update_event_title(
        &self,
        calendar_id: &str,
        event_id: &str,
        title: &str,
    ) -> Result<(), InfraError> {
        let token = self.get_auth_token().await?;
        self.retry_title_update(&token, calendar_id, event_id, None, |_| title.to_string())
            .await
            .map(|_| ())
    }

    /// `known` is used for the first round instead of reading the event again.
    async fn retry_title_update<F>(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        mut known: Option<GoogleCalendarEvent>,
        title_for: F,
    ) -> Result<String, InfraError>
    where
        F: Fn(&GoogleCalendarEvent) -> String + Send + Sync,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 1;
        loop {
            let round = self
                .try_update_title(token, calendar_id, event_id, known.take(), &title_for)
                .await;
            match round {
                Ok(title) => return Ok(title),
                Err(error @ InfraError::Authentication(_)) => return Err(error),
                Err(error) if attempt < max_attempts => {
                    let delay = self.retry_policy.delay_after(attempt);
                    warn!(%error, attempt, delay_ms = delay.as_millis() as u64, "event title update failed; retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_update_title<F>(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        known: Option<GoogleCalendarEvent>,
        title_for: &F,
    ) -> Result<String, InfraError>
    where
        F: Fn(&GoogleCalendarEvent) -> String + Send + Sync,
    {
        let current = match known {
            Some(event) => event,
            None => self
                .api
                .get_event(token, calendar_id, event_id)
                .await?
                .ok_or_else(|| InfraError::Update(format!("event {event_id} not found")))?,
        };
        let title = title_for(&current);
        self.api
            .update_event(token, calendar_id, event_id, &current.with_summary(title.as_str()))
            .await?;
        Ok(title)
    }
}

#[async_trait]
impl<A, I> CalendarSession for RemoteCalendarClient<A, I>
where
    A: CalendarApi + 'static,
    I: IdentityProvider + 'static,
{
    async fn init(&self, client_id: &str, api_key: &str) -> Result<(), InfraError> {
        RemoteCalendarClient::init(self, client_id, api_key).await
    }

    /// The first read decides the title; a retried round re-reads the event
    /// and recomputes the suffix from what it finds.
    async fn update_event_energy(
        &self,
        calendar_id: &str,
        event_id: &str,
        energy: i32,
    ) -> Result<String, InfraError> {
        let token = self.get_auth_token().await?;
        let current = self
            .api
            .get_event(&token, calendar_id, event_id)
            .await?
            .ok_or_else(|| InfraError::NotFound(format!("event {event_id}")))?;
        self.retry_title_update(&token, calendar_id, event_id, Some(current), |event| {
            event.energy_title(energy)
        })
        .await
    }
}

/// Loads the page client by asking an open calendar tab to do it.
pub struct CalendarTabLoader<H> {
    host: Arc<H>,
    calendar_origin: String,
    cached: Mutex<Option<(Tab, Instant)>>,
}

impl<H: HostPlatform> CalendarTabLoader<H> {
    pub fn new(host: Arc<H>, calendar_origin: impl Into<String>) -> Self {
        Self {
            host,
            calendar_origin: calendar_origin.into(),
            cached: Mutex::new(None),
        }
    }

    async fn calendar_tab(&self) -> Result<u32, InfraError> {
        if let Ok(cached) = self.cached.lock() {
            if let Some((tab, stored_at)) = cached.as_ref() {
                if stored_at.elapsed() < TAB_CACHE_TTL {
                    if let Some(id) = tab.id {
                        return Ok(id);
                    }
                }
            }
        }
        let tab = self
            .host
            .query_tabs(&self.calendar_origin)
            .await?
            .into_iter()
            .find(|tab| tab.id.is_some())
            .ok_or_else(|| InfraError::NotFound("No calendar tab found".to_string()))?;
        let id = tab
            .id
            .ok_or_else(|| InfraError::NotFound("No calendar tab found".to_string()))?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((tab, Instant::now()));
        }
        Ok(id)
    }
}

#[async_trait]
impl<H: HostPlatform> PageScriptLoader for CalendarTabLoader<H> {
    async fn load(&self, credentials: &ApiCredentials) -> Result<(), InfraError> {
        let tab_id = self.calendar_tab().await?;
        let message = Message::with_payload(
            MessageType::InitGapi,
            &InitGapiPayload {
                client_id: credentials.client_id.clone(),
                api_key: credentials.api_key.clone(),
            },
        )?;
        debug!(tab_id, "asking calendar tab to load the page client");
        self.host
            .send_to_tab(tab_id, message)
            .await?
            .into_result()
            .map(|_| ())
            .map_err(InfraError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::host::fake::RecordingHost;
    use crate::infrastructure::identity::StaticTokenProvider;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCalendarApi {
        events: Mutex<VecDeque<Option<GoogleCalendarEvent>>>,
        fail_updates: Mutex<bool>,
        get_calls: AtomicUsize,
        update_calls: AtomicUsize,
        update_times: Mutex<Vec<Instant>>,
        written: Mutex<Vec<GoogleCalendarEvent>>,
    }

    impl FakeCalendarApi {
        fn serving(event: GoogleCalendarEvent) -> Self {
            let api = Self::default();
            api.events.lock().expect("events lock").push_back(Some(event));
            api
        }
    }

    #[async_trait]
    impl CalendarApi for FakeCalendarApi {
        async fn get_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _event_id: &str,
        ) -> Result<Option<GoogleCalendarEvent>, InfraError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let mut events = self.events.lock().expect("events lock");
            // the last queued answer repeats
            if events.len() > 1 {
                Ok(events.pop_front().flatten())
            } else {
                Ok(events.front().cloned().flatten())
            }
        }

        async fn update_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _event_id: &str,
            event: &GoogleCalendarEvent,
        ) -> Result<(), InfraError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.update_times.lock().expect("times lock").push(Instant::now());
            if *self.fail_updates.lock().expect("fail lock") {
                return Err(InfraError::Update("http 503".to_string()));
            }
            self.written.lock().expect("written lock").push(event.clone());
            Ok(())
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PageScriptLoader for CountingLoader {
        async fn load(&self, _credentials: &ApiCredentials) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(InfraError::Remote("gapi failed to load".to_string()));
            }
            Ok(())
        }
    }

    fn planning() -> GoogleCalendarEvent {
        GoogleCalendarEvent {
            id: Some("evt-1".to_string()),
            summary: Some("Planning ⚡ (+2)".to_string()),
            ..GoogleCalendarEvent::default()
        }
    }

    fn client(api: Arc<FakeCalendarApi>) -> RemoteCalendarClient<FakeCalendarApi, StaticTokenProvider> {
        RemoteCalendarClient::new(api, Arc::new(StaticTokenProvider::new("token-1")))
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_retries_three_times_with_linear_backoff() {
        let api = Arc::new(FakeCalendarApi::serving(planning()));
        *api.fail_updates.lock().expect("fail lock") = true;
        let client = client(api.clone());

        let started = Instant::now();
        let result = client.update_event_title("primary", "evt-1", "Planning").await;

        assert!(matches!(result, Err(InfraError::Update(_))));
        assert_eq!(api.update_calls.load(Ordering::SeqCst), 3);
        let times = api.update_times.lock().expect("times lock").clone();
        assert_eq!(times[1] - times[0], Duration::from_millis(1_000));
        assert_eq!(times[2] - times[1], Duration::from_millis(2_000));
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let api = Arc::new(FakeCalendarApi::default());
        {
            let mut events = api.events.lock().expect("events lock");
            events.push_back(None);
            events.push_back(Some(planning()));
        }
        let client = client(api.clone());

        client
            .update_event_title("primary", "evt-1", "Planning 🔋 (-1)")
            .await
            .expect("second attempt succeeds");
        assert_eq!(api.get_calls.load(Ordering::SeqCst), 2);
        let written = api.written.lock().expect("written lock").clone();
        assert_eq!(written[0].summary.as_deref(), Some("Planning 🔋 (-1)"));
    }

    #[tokio::test]
    async fn update_event_energy_rewrites_suffix() {
        let api = Arc::new(FakeCalendarApi::serving(planning()));
        let client = client(api.clone());

        let title = CalendarSession::update_event_energy(&client, "primary", "evt-1", -3)
            .await
            .expect("update");
        assert_eq!(title, "Planning 🔋 (-3)");
        assert_eq!(
            api.written.lock().expect("written lock")[0].summary.as_deref(),
            Some("Planning 🔋 (-3)")
        );
    }

    #[derive(Default)]
    struct CountingIdentity {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl IdentityProvider for CountingIdentity {
        async fn get_auth_token(&self, _interactive: bool) -> Result<Option<String>, InfraError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_is_not_retried() {
        let api = Arc::new(FakeCalendarApi::serving(planning()));
        let identity = Arc::new(CountingIdentity::default());
        let client = RemoteCalendarClient::new(api.clone(), identity.clone());

        let started = Instant::now();
        let result = client.update_event_title("primary", "evt-1", "Planning").await;

        assert!(
            matches!(result, Err(InfraError::Authentication(message)) if message == AUTHENTICATION_FAILED)
        );
        assert_eq!(identity.requests.load(Ordering::SeqCst), 1);
        assert_eq!(api.get_calls.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn energy_update_reads_event_once() {
        let api = Arc::new(FakeCalendarApi::serving(planning()));
        let client = client(api.clone());

        CalendarSession::update_event_energy(&client, "primary", "evt-1", 1)
            .await
            .expect("update");
        assert_eq!(api.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_token_is_authentication_error() {
        let identity = Arc::new(StaticTokenProvider::new("token-1"));
        identity.revoke();
        let client = RemoteCalendarClient::new(Arc::new(FakeCalendarApi::default()), identity);

        let result = client.get_event("primary", "evt-1").await;
        assert!(
            matches!(result, Err(InfraError::Authentication(message)) if message == AUTHENTICATION_FAILED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_init_shares_one_load() {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let client = client(Arc::new(FakeCalendarApi::default())).with_page_loader(loader.clone());

        let (first, second) = tokio::join!(client.init("id", "key"), client.init("id", "key"));
        first.expect("first init");
        second.expect("second init");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(client.is_ready());

        client.init("id", "key").await.expect("ready no-op");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        client.init("id", "other-key").await.expect("re-init");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_returns_to_uninitialized() {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let client = client(Arc::new(FakeCalendarApi::default())).with_page_loader(loader.clone());

        assert!(client.init("id", "key").await.is_err());
        assert!(!client.is_ready());
        assert!(client.init("id", "key").await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tab_loader_sends_init_to_calendar_tab() {
        let host = Arc::new(RecordingHost::with_active(Tab::new(
            7,
            "https://calendar.google.com/calendar/u/0/r/week",
        )));
        let loader = CalendarTabLoader::new(host.clone(), "https://calendar.google.com/calendar/");

        loader
            .load(&ApiCredentials {
                client_id: "id".to_string(),
                api_key: "key".to_string(),
            })
            .await
            .expect("load");

        let sent = host.sent.lock().expect("sent lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 7);
        assert_eq!(sent[0].1.kind, MessageType::InitGapi);
        assert_eq!(
            sent[0].1.payload,
            Some(serde_json::json!({ "clientId": "id", "apiKey": "key" }))
        );
    }

    #[tokio::test]
    async fn tab_loader_without_calendar_tab_is_not_found() {
        let host = Arc::new(RecordingHost::with_active(Tab::new(3, "https://example.com/")));
        let loader = CalendarTabLoader::new(host, "https://calendar.google.com/calendar/");
        let result = loader
            .load(&ApiCredentials {
                client_id: "id".to_string(),
                api_key: "key".to_string(),
            })
            .await;
        assert!(matches!(result, Err(InfraError::NotFound(_))));
    }
}
