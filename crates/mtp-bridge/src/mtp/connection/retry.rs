//! Retry orchestration around pooled device calls.
//!
//! Every call runs under the manager's global lock. Each attempt checks out a
//! handle (or opens one), makes sure a session is open, runs the operation on the
//! blocking pool, and checks the handle back in. The error decides what happens
//! next; see [`classify`].
//!
//! An attempt that outlives its timeout is flagged as abandoned and then joined,
//! so no worker touches the device once its attempt is over.

use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::MtpConnectionManager;
use super::cancellation::CancellationRegistry;
use super::pool::Lease;
use crate::config::{CallClass, RetryPolicy};
use crate::mtp::codes::ResponseCode;
use crate::mtp::device::MtpDevice;
use crate::mtp::errors::MtpError;
use crate::mtp::transport::{DeviceOpener, TransportErrorKind};

/// What the orchestrator does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The pooled handle was already dead. It has been evicted; try again right away.
    RetryNow,
    /// Transient condition. Try again after the backoff delay.
    RetryAfterBackoff,
    Fail,
}

/// Decides whether a failed attempt is worth repeating.
///
/// `pooled` is true if the attempt ran on a handle reused from the pool.
pub(crate) fn classify(error: &MtpError, pooled: bool) -> Disposition {
    if error.is_closed_connection() {
        return if pooled {
            Disposition::RetryNow
        } else {
            Disposition::RetryAfterBackoff
        };
    }
    match error {
        MtpError::Timeout { .. } | MtpError::SessionUnrecoverable { .. } => Disposition::RetryAfterBackoff,
        MtpError::Transport { kind, .. } => match kind {
            TransportErrorKind::Access => Disposition::Fail,
            _ => Disposition::RetryAfterBackoff,
        },
        MtpError::Protocol { code, .. } if *code == ResponseCode::DEVICE_BUSY => Disposition::RetryAfterBackoff,
        _ => Disposition::Fail,
    }
}

/// Per-attempt state handed to the operation.
pub(crate) struct CallContext {
    operation: &'static str,
    task_id: Option<String>,
    timeout: Duration,
    cancellations: Arc<CancellationRegistry>,
    /// Set by the orchestrator when it stops waiting for this attempt.
    abandoned: Arc<AtomicBool>,
}

impl CallContext {
    pub(crate) fn task_id(&self) -> &str {
        self.task_id.as_deref().unwrap_or_default()
    }

    /// Fails if the task was cancelled or the attempt was abandoned.
    ///
    /// Transfers call this from their progress callback, so it runs once per chunk.
    pub(crate) fn checkpoint(&self) -> Result<(), MtpError> {
        if self.abandoned.load(Ordering::Acquire) {
            return Err(MtpError::Timeout {
                operation: self.operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        if let Some(task_id) = &self.task_id
            && self.cancellations.is_cancelled(task_id)
        {
            return Err(MtpError::Cancelled {
                task_id: task_id.clone(),
            });
        }
        Ok(())
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

struct Attempt<R> {
    result: Result<R, MtpError>,
    pooled: bool,
}

impl<O: DeviceOpener> MtpConnectionManager<O> {
    /// Runs `op` on a device handle with the retry policy of `class`.
    ///
    /// `task_id` makes the call cancellable through [`MtpConnectionManager::cancel_task`].
    pub(crate) async fn with_device<R, F>(
        &self,
        class: CallClass,
        operation: &'static str,
        task_id: Option<&str>,
        op: F,
    ) -> Result<R, MtpError>
    where
        R: Send + 'static,
        F: Fn(&mut MtpDevice<O::Transport>, &CallContext) -> Result<R, MtpError> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        self.ensure_not_cancelled(task_id)?;

        let policy = self.config.retry.policy(class);
        let op = Arc::new(op);
        let _guard = self.call_lock.lock().await;
        self.ensure_running()?;

        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None;
        let mut backoff_due = false;
        for attempt in 1..=max_attempts {
            if backoff_due {
                let delay = policy.backoff.delay(attempt - 1);
                debug!("MTP {}: retrying in {} ms", operation, delay.as_millis());
                tokio::time::sleep(delay).await;
                if policy.reclaim_before_retry {
                    (self.reclaim_hint)();
                }
            }
            if attempt > 1 {
                self.ensure_running()?;
                self.ensure_not_cancelled(task_id)?;
            }

            let outcome = self.run_attempt(operation, task_id, &policy, Arc::clone(&op)).await;
            let error = match outcome.result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match classify(&error, outcome.pooled) {
                Disposition::RetryNow => {
                    debug!("MTP {}: pooled handle was closed ({}); retrying with another", operation, error);
                    backoff_due = false;
                }
                Disposition::RetryAfterBackoff => {
                    warn!(
                        "MTP {}: attempt {}/{} failed: {}",
                        operation, attempt, max_attempts, error
                    );
                    backoff_due = true;
                }
                Disposition::Fail => return Err(error),
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| MtpError::Internal {
            message: format!("{operation}: no attempt was made"),
        }))
    }

    /// One attempt: check out a handle, ensure a session, run `op`, check the handle back in.
    async fn run_attempt<R, F>(
        &self,
        operation: &'static str,
        task_id: Option<&str>,
        policy: &RetryPolicy,
        op: Arc<F>,
    ) -> Attempt<R>
    where
        R: Send + 'static,
        F: Fn(&mut MtpDevice<O::Transport>, &CallContext) -> Result<R, MtpError> + Send + Sync + 'static,
    {
        let abandoned = Arc::new(AtomicBool::new(false));
        let ctx = CallContext {
            operation,
            task_id: task_id.map(str::to_string),
            timeout: policy.timeout,
            cancellations: Arc::clone(&self.cancellations),
            abandoned: Arc::clone(&abandoned),
        };
        let pool = Arc::clone(&self.pool);
        let opener = Arc::clone(&self.opener);
        let timeout = policy.timeout;
        let recovery_delay = self.config.session.recovery_delay;

        let mut worker = tokio::task::spawn_blocking(move || {
            let mut lease = match pool.acquire(timeout) {
                Ok(Some(lease)) => lease,
                Ok(None) => match opener.open_device() {
                    Ok(transport) => Lease::fresh(MtpDevice::new(transport)),
                    Err(e) => {
                        return Attempt {
                            result: Err(e.into()),
                            pooled: false,
                        };
                    }
                },
                Err(e) => return Attempt { result: Err(e), pooled: false },
            };
            let pooled = lease.is_pooled();
            lease.device.set_timeout(timeout);

            let mut ran = false;
            let result = ctx
                .checkpoint()
                .and_then(|()| lease.device.ensure_session(recovery_delay))
                .and_then(|()| {
                    ran = true;
                    op(&mut lease.device, &ctx)
                });

            // A transfer stopped between chunks leaves the device mid data phase.
            let interrupted = ran && matches!(result, Err(MtpError::Cancelled { .. } | MtpError::LocalIo { .. }));
            if ctx.is_abandoned() {
                debug!("MTP {}: abandoned attempt finished; discarding its handle", ctx.operation);
                pool.evict(lease);
            } else if interrupted || result.as_ref().is_err_and(MtpError::poisons_connection) {
                pool.evict(lease);
            } else {
                pool.release(lease);
            }
            Attempt { result, pooled }
        });

        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(attempt)) => attempt,
            Ok(Err(e)) => Attempt {
                result: Err(MtpError::Internal {
                    message: format!("{operation} worker failed: {e}"),
                }),
                pooled: false,
            },
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                warn!("MTP {}: timed out after {} ms", operation, timeout.as_millis());
                // The worker still owns a handle and may be mid transfer. It stops at its
                // next checkpoint or when the bulk call times out, and must be done before
                // the next attempt or the caller's lock release.
                if let Err(e) = worker.await {
                    warn!("MTP {}: abandoned worker failed: {}", operation, e);
                }
                Attempt {
                    result: Err(MtpError::Timeout {
                        operation: operation.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    pooled: false,
                }
            }
        }
    }

    fn ensure_running(&self) -> Result<(), MtpError> {
        if self.is_shutting_down() {
            return Err(MtpError::ShuttingDown);
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self, task_id: Option<&str>) -> Result<(), MtpError> {
        match task_id {
            Some(task_id) if self.cancellations.is_cancelled(task_id) => Err(MtpError::Cancelled {
                task_id: task_id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
