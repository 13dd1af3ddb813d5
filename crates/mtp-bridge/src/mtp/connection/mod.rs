//! MTP connection management.
//!
//! [`MtpConnectionManager`] owns everything that outlives a single call: the
//! handle pool, the cancelled-task registry, the global call lock, and the idle
//! sweeper. One MTP transaction is in flight at a time; the pool has its own lock
//! so sweeping doesn't wait for a slow transfer.
//!
//! ## Call flow
//!
//! caller → retry loop (global lock) → pool or opener → session → transaction
//! engine → check the handle back in → retry, or return.

mod cancellation;
mod device_ops;
mod directory_ops;
mod file_ops;
mod mutation_ops;
mod pool;
mod retry;

#[cfg(test)]
mod manager_test;

pub use cancellation::CancellationRegistry;
pub use file_ops::Download;
pub use pool::{DevicePool, Lease};

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::errors::MtpError;
use super::transport::DeviceOpener;
use super::types::MtpTransferProgress;
use crate::config::BridgeConfig;
use crate::ignore_poison::IgnorePoison;

/// Receives transfer progress, once per chunk.
pub type ProgressCallback = Arc<dyn Fn(&MtpTransferProgress) + Send + Sync>;

/// Best-effort hint to give memory back before a retry. No-op unless set.
pub type ReclaimHint = Arc<dyn Fn() + Send + Sync>;

/// Coordinator for all calls to one device.
pub struct MtpConnectionManager<O: DeviceOpener> {
    opener: Arc<O>,
    config: Arc<BridgeConfig>,
    pool: Arc<DevicePool<O::Transport>>,
    cancellations: Arc<CancellationRegistry>,
    /// Serializes every device call, acquire to check-in.
    call_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    /// Stops the idle sweeper. `None` when it isn't running. Dropping it stops the sweeper too.
    sweeper_shutdown: Mutex<Option<broadcast::Sender<()>>>,
    reclaim_hint: ReclaimHint,
}

impl<O: DeviceOpener> MtpConnectionManager<O> {
    pub fn new(opener: O, config: BridgeConfig) -> Self {
        let pool = DevicePool::new(config.pool.max_size);
        Self {
            opener: Arc::new(opener),
            config: Arc::new(config),
            pool: Arc::new(pool),
            cancellations: Arc::new(CancellationRegistry::new()),
            call_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            sweeper_shutdown: Mutex::new(None),
            reclaim_hint: Arc::new(|| {}),
        }
    }

    /// Sets the hook run before each Normal-class retry.
    pub fn with_reclaim_hint(mut self, hint: impl Fn() + Send + Sync + 'static) -> Self {
        self.reclaim_hint = Arc::new(hint);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &DevicePool<O::Transport> {
        &self.pool
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancels a transfer. Takes effect before the next chunk, or before the
    /// transfer starts if it hasn't yet.
    pub fn cancel_task(&self, task_id: &str) {
        debug!("MTP cancel requested for task {}", task_id);
        self.cancellations.mark(task_id);
    }

    pub fn is_task_cancelled(&self, task_id: &str) -> bool {
        self.cancellations.is_cancelled(task_id)
    }

    /// Drops a finished task's cancellation marker.
    pub fn forget_task(&self, task_id: &str) {
        self.cancellations.forget(task_id);
    }

    // ========================================================================
    // Pool lifecycle
    // ========================================================================

    /// Disposes every idle pooled handle. Returns how many were disposed.
    pub async fn clear_pool(&self) -> usize {
        let pool = Arc::clone(&self.pool);
        let cleared = tokio::task::spawn_blocking(move || pool.clear()).await.unwrap_or_else(|e| {
            warn!("MTP clear_pool worker failed: {}", e);
            0
        });
        debug!("MTP pool cleared ({} handle(s) disposed)", cleared);
        cleared
    }

    /// Starts the background task that disposes handles idle past the TTL.
    ///
    /// Must be called from inside a tokio runtime. Returns false if the sweeper
    /// is already running, the manager is shutting down, or there is no runtime.
    pub fn start_sweeper(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut slot = self.sweeper_shutdown.lock_ignore_poison();
        if slot.is_some() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("MTP sweeper not started: no tokio runtime");
            return false;
        };

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let pool = Arc::clone(&self.pool);
        let tick = self.config.pool.cleanup_tick;
        let ttl = self.config.pool.entry_ttl;

        runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // The first tick fires immediately; nothing can be idle yet.
            interval.tick().await;
            debug!("MTP pool sweeper started (tick {:?}, ttl {:?})", tick, ttl);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("MTP pool sweeper stopping");
                        break;
                    }

                    _ = interval.tick() => {
                        let pool = Arc::clone(&pool);
                        if let Err(e) = tokio::task::spawn_blocking(move || pool.sweep_idle(ttl)).await {
                            warn!("MTP pool sweep failed: {}", e);
                        }
                    }
                }
            }
        });

        *slot = Some(shutdown_tx);
        true
    }

    /// Stops the sweeper if it is running.
    pub fn stop_sweeper(&self) {
        if let Some(tx) = self.sweeper_shutdown.lock_ignore_poison().take() {
            let _ = tx.send(());
        }
    }

    /// Shuts the manager down.
    ///
    /// New calls fail with [`MtpError::ShuttingDown`] right away. Waits for the
    /// call in flight to finish, then disposes every pooled handle.
    pub async fn shutdown(&self) -> Result<(), MtpError> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("MTP shutdown already requested");
            return Ok(());
        }
        info!("MTP bridge shutting down");
        self.stop_sweeper();

        let _guard = self.call_lock.lock().await;
        let pool = Arc::clone(&self.pool);
        let disposed = tokio::task::spawn_blocking(move || pool.close())
            .await
            .map_err(|e| MtpError::Internal {
                message: format!("shutdown worker failed: {e}"),
            })?;
        info!("MTP bridge shut down ({} pooled handle(s) disposed)", disposed);
        Ok(())
    }
}
