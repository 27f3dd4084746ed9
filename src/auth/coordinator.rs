// Single-flight token refresh
//
// Concurrent callers share one in-flight refresh. The slot is emptied before
// the shared result resolves, so a call made after settlement starts over.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};

type InflightRefresh = Shared<BoxFuture<'static, bool>>;

/// Collapses concurrent refresh demand into one network call
#[derive(Default)]
pub struct RefreshCoordinator {
    inflight: Arc<Mutex<Option<InflightRefresh>>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a refresh is outstanding
    pub fn is_refreshing(&self) -> bool {
        self.inflight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Run `attempt` unless a refresh is already in flight, in which case
    /// wait for that one instead. `attempt` is only invoked when a new
    /// refresh actually starts.
    pub async fn run<F>(&self, attempt: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, bool>,
    {
        let shared = {
            let mut slot = match self.inflight.lock() {
                Ok(slot) => slot,
                Err(_) => {
                    tracing::error!("Refresh coordinator lock poisoned");
                    return false;
                }
            };

            match slot.clone() {
                Some(existing) => {
                    tracing::debug!("Refresh already in flight, joining it");
                    existing
                }
                None => {
                    let release = self.inflight.clone();
                    let refresh = attempt();
                    let shared = async move {
                        let refreshed = refresh.await;
                        if let Ok(mut slot) = release.lock() {
                            *slot = None;
                        }
                        refreshed
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };

        shared.await
    }
}
