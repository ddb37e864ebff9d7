//! Background lease renewal for a running thread

use crate::error::RuntimeError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use waypoint_checkpoint::{Checkpointer, Lease};

/// Floor for the renewal cadence of very short leases
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(5);

/// Holds a thread's lease for the duration of a run
///
/// A background task renews the lease every `interval`, or every third of
/// the lease's remaining lifetime when that is shorter: the checkpointer
/// decides the TTL, not the runtime. If a renewal fails the run's token is
/// cancelled and [`lost`](Self::lost) reports why, so the run stops at its
/// next step boundary.
pub(crate) struct LeaseKeeper {
    checkpointer: Arc<dyn Checkpointer>,
    lease: Arc<Mutex<Lease>>,
    lost: Arc<Mutex<Option<RuntimeError>>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    released: bool,
}

impl LeaseKeeper {
    /// Acquire the lease and start renewing it
    ///
    /// Returns `None` when the checkpointer does not use leases.
    pub async fn start(
        checkpointer: Arc<dyn Checkpointer>,
        thread_id: &str,
        interval: Duration,
        run: CancellationToken,
    ) -> crate::Result<Option<Self>> {
        let Some(lease) = checkpointer.acquire_lease(thread_id).await? else {
            return Ok(None);
        };
        debug!(
            thread_id,
            worker_id = %lease.worker_id,
            expires_at = %lease.expires_at,
            "Lease acquired"
        );

        let lease = Arc::new(Mutex::new(lease));
        let lost = Arc::new(Mutex::new(None));
        let stop = CancellationToken::new();

        let task = tokio::spawn(renew_loop(
            checkpointer.clone(),
            lease.clone(),
            lost.clone(),
            stop.clone(),
            interval,
            run,
        ));

        Ok(Some(Self {
            checkpointer,
            lease,
            lost,
            stop,
            task: Some(task),
            released: false,
        }))
    }

    /// Why the lease was lost, if it was
    pub fn lost(&self) -> Option<RuntimeError> {
        self.lost.lock().clone()
    }

    /// Stop renewing and give the lease back
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let lease = self.lease.lock().clone();
        match self.checkpointer.release_lease(&lease).await {
            Ok(()) => debug!(thread_id = %lease.thread_id, "Lease released"),
            Err(err) => warn!(thread_id = %lease.thread_id, error = %err, "Lease release failed"),
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.released {
            return;
        }
        // Dropped mid-run (e.g. an abandoned stream): give the lease back in
        // the background, otherwise it simply expires.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let checkpointer = self.checkpointer.clone();
            let lease = self.lease.lock().clone();
            handle.spawn(async move {
                if let Err(err) = checkpointer.release_lease(&lease).await {
                    debug!(
                        thread_id = %lease.thread_id,
                        error = %err,
                        "Lease release on drop failed"
                    );
                }
            });
        }
    }
}

async fn renew_loop(
    checkpointer: Arc<dyn Checkpointer>,
    lease: Arc<Mutex<Lease>>,
    lost: Arc<Mutex<Option<RuntimeError>>>,
    stop: CancellationToken,
    interval: Duration,
    run: CancellationToken,
) {
    loop {
        let wait = renew_cadence(interval, &lease.lock());
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let current = lease.lock().clone();
        match checkpointer.renew_lease(&current).await {
            Ok(renewed) => {
                debug!(
                    thread_id = %renewed.thread_id,
                    expires_at = %renewed.expires_at,
                    "Lease renewed"
                );
                *lease.lock() = renewed;
            }
            Err(err) => {
                if stop.is_cancelled() {
                    return;
                }
                let err = RuntimeError::from(err);
                warn!(
                    thread_id = %current.thread_id,
                    error = %err,
                    "Lease renewal failed, cancelling run"
                );
                *lost.lock() = Some(err);
                run.cancel();
                return;
            }
        }
    }
}

/// Time until the next renewal of `lease`
fn renew_cadence(configured: Duration, lease: &Lease) -> Duration {
    let third = lease.remaining().to_std().unwrap_or_default() / 3;
    configured.min(third).max(MIN_RENEW_INTERVAL)
}
