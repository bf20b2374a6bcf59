//! Background retention sweep.
//!
//! Runs [`Backend::purge_expired`] on a fixed interval until shut down. Each
//! pass holds the backend's exclusive lock only for its own duration.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::Backend;

/// Handle to a running sweep task.
pub struct SweepHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Signals the task to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!("Purge sweep task failed: {}", e);
        }
    }
}

/// Spawns the sweep configured in `[sweep]`, or returns `None` when disabled.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn spawn_purge_sweep(backend: Arc<Backend>) -> Option<SweepHandle> {
    let sweep = &backend.settings().sweep;
    if !sweep.enabled {
        log::debug!("Purge sweep disabled");
        return None;
    }
    let interval = sweep.interval();
    Some(spawn_with_interval(backend, interval))
}

/// Spawns a sweep with an explicit interval.
#[must_use]
pub fn spawn_with_interval(backend: Arc<Backend>, interval: Duration) -> SweepHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_purge_sweep(backend, interval, shutdown_rx));
    SweepHandle { shutdown_tx, task }
}

/// Sweep loop. Ticks immediately, then every `interval`.
pub async fn run_purge_sweep(
    backend: Arc<Backend>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    log::info!("Purge sweep started, interval {:?}", interval);

    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = timer.tick() => {
                match backend.purge_expired() {
                    Ok(summary) if !summary.is_empty() => {
                        log::info!(
                            "Purge sweep removed {} jws key(s), {} client key(s), {} verification record(s)",
                            summary.jws_keys.len(),
                            summary.client_keys.len(),
                            summary.verification_records
                        );
                    }
                    Ok(_) => {}
                    Err(report) => log::warn!("Purge sweep failed: {:?}", report),
                }
            }
        }
    }

    log::info!("Purge sweep stopped");
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::jws::keys::KeyKind;
    use crate::jws::keystore::KeyMaterial;
    use crate::storage::MemoryStorage;
    use crate::test_support::tests::{create_test_settings, fixed_now, ManualClock};

    #[tokio::test]
    async fn test_sweep_purges_expired_keys_and_stops() {
        let clock = ManualClock::new(fixed_now());
        let backend = Arc::new(
            Backend::new(create_test_settings(), Arc::new(MemoryStorage::new()))
                .with_clock(clock.clone()),
        );
        backend
            .configure_signing_key(KeyKind::Jws, &KeyMaterial::default())
            .expect("should configure key");
        backend
            .configure_signing_key(KeyKind::Jws, &KeyMaterial::default())
            .expect("should rotate key");
        clock.advance(ChronoDuration::hours(2));

        let handle = spawn_with_interval(backend.clone(), Duration::from_millis(10));

        let purged = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let listing = backend.list_keys(KeyKind::Jws).expect("should list keys");
                if listing.retained.is_empty() {
                    break listing;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweep should purge within the timeout");
        assert!(purged.active.is_some());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_sweep_is_not_spawned() {
        let backend = Arc::new(Backend::new(
            create_test_settings(),
            Arc::new(MemoryStorage::new()),
        ));
        assert!(spawn_purge_sweep(backend).is_none());
    }

    #[tokio::test]
    async fn test_enabled_sweep_shuts_down() {
        let mut settings = create_test_settings();
        settings.sweep.enabled = true;
        let backend = Arc::new(Backend::new(settings, Arc::new(MemoryStorage::new())));

        let handle = spawn_purge_sweep(backend).expect("sweep should be spawned");
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("sweep should stop promptly");
    }
}
