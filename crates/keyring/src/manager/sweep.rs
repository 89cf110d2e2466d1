//! Expiry sweep: rotate expired Active keys, retire expired Retiring keys.

use std::time::Duration;

use chrono::Utc;
use common::KeyState;
use tokio::time;
use tracing::{error, info, warn};

use super::KeyManager;

impl KeyManager {
    /// Process every non-Retired key whose expiry has passed.
    ///
    /// Expired Active keys are rotated; any other expired key is retired. A
    /// failure on one key is logged and counted, and the sweep moves on.
    pub async fn check_expired_keys(&self) {
        let now = Utc::now();
        let expired = match self.call("list_expired", self.store.list_expired(now)).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "expiry sweep could not list expired keys");
                return;
            }
        };

        let (mut rotated, mut retired, mut failed) = (0usize, 0usize, 0usize);
        for record in &expired {
            let meta = &record.metadata;
            let result = match meta.state {
                KeyState::Active => self.rotate_key(&meta.id).await.map(|_| rotated += 1),
                KeyState::Retiring | KeyState::Retired => {
                    self.retire_key(&meta.id).await.map(|()| retired += 1)
                }
            };
            if let Err(e) = result {
                failed += 1;
                self.metrics.sweep_failure(meta.key_type);
                warn!(
                    key_id = %meta.id,
                    key_type = %meta.key_type,
                    state = %meta.state,
                    error = %e,
                    "failed to process expired key"
                );
            }
        }

        info!(
            expired = expired.len(),
            rotated,
            retired,
            failed,
            "expiry sweep finished"
        );
    }
}

/// Spawn a background task that runs [`KeyManager::check_expired_keys`] on
/// a fixed interval.
///
/// The first sweep fires after one full interval (the host is expected to
/// sweep once at startup).
pub fn sweep_task(manager: KeyManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            manager.check_expired_keys().await;
        }
    })
}
