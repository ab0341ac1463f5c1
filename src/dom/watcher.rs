use crate::dom::annotator::Annotator;
use crate::dom::document::PageDom;
use crate::dom::locator::EventLocator;
use crate::domain::models::ExtensionState;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Where the watcher gets the settings to reapply.
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn current_state(&self) -> Result<ExtensionState, InfraError>;
}

pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.join.await {
            warn!(%error, "mutation watcher task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Polls the page's mutation counter at most once per throttle interval and
/// reapplies every effect when it moved.
pub struct MutationWatcher<D> {
    dom: Arc<Mutex<D>>,
    locator: Arc<Mutex<EventLocator>>,
    annotator: Arc<Annotator>,
    source: Arc<dyn StateSource>,
    throttle: Duration,
}

impl<D: PageDom + 'static> MutationWatcher<D> {
    pub fn new(
        dom: Arc<Mutex<D>>,
        locator: Arc<Mutex<EventLocator>>,
        annotator: Arc<Annotator>,
        source: Arc<dyn StateSource>,
        throttle: Duration,
    ) -> Self {
        Self {
            dom,
            locator,
            annotator,
            source,
            throttle,
        }
    }

    /// Applies once immediately, then on every observed change until stopped.
    pub fn spawn(self) -> WatcherHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.throttle);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut seen: Option<u64> = None;
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            debug!("mutation watcher stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        seen = self.reapply_if_changed(seen).await;
                    }
                }
            }
        });
        WatcherHandle { shutdown, join }
    }

    async fn reapply_if_changed(&self, seen: Option<u64>) -> Option<u64> {
        let current = match self.dom.lock() {
            Ok(dom) => dom.mutation_version(),
            Err(_) => {
                warn!("page lock poisoned; skipping reapply");
                return seen;
            }
        };
        if seen == Some(current) {
            return seen;
        }

        if let Ok(mut locator) = self.locator.lock() {
            locator.invalidate();
        }
        let state = match self.source.current_state().await {
            Ok(state) => state,
            Err(error) => {
                warn!(%error, "could not read state for reapply");
                return seen;
            }
        };

        match self.dom.lock() {
            Ok(mut dom) => {
                self.annotator.apply_settings(&mut *dom, &state.settings);
                // our own writes bump the counter; start watching from here
                Some(dom.mutation_version())
            }
            Err(_) => {
                warn!("page lock poisoned; skipping reapply");
                seen
            }
        }
    }
}
