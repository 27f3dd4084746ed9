// Background expiry checks

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::manager::SessionManager;

/// Handle to the periodic refresh task
pub struct RefreshTask {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            tracing::warn!("Refresh task ended abnormally: {}", e);
        }
    }
}

/// Every `interval`, refresh the session if its token is close to expiry
pub fn spawn_refresh_task(session: SessionManager, interval: Duration) -> RefreshTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the first check happens one interval in
        ticker.tick().await;

        tracing::debug!("Token expiry check running every {:?}", interval);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("Token expiry check stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !session.is_authenticated().await {
                        continue;
                    }
                    if session.refresh_if_needed().await {
                        tracing::debug!("Proactive refresh completed");
                    }
                }
            }
        }
    });

    RefreshTask {
        shutdown_tx: Some(shutdown_tx),
        handle,
    }
}
