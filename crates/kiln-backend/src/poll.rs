//! The one polling primitive every backend wait goes through.
//!
//! Backend operations expose no push notification: creation, deletion,
//! and image snapshots all hand back an opaque handle whose status moves
//! `PENDING → DONE | ERROR` and can only be observed by re-reading it.
//! [`wait_terminal`] owns that loop — fixed interval, sleep before the
//! first check, shutdown observed during every sleep.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;

use kiln_core::{BackendError, BackendResult};

/// Interval between status checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Observed status of an asynchronous backend operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Done,
    Error(String),
}

/// Poll `check` at `interval` until it reports a terminal status.
///
/// Sleeps before the first check: freshly issued operations can 404 when
/// read back immediately. Returns `Cancelled` as soon as the shutdown
/// channel fires, including while sleeping; an `Error` status becomes a
/// `BackendError::Operation` carrying `what` as the operation name.
pub async fn wait_terminal<F, Fut>(
    what: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut check: F,
) -> BackendResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<OpStatus>>,
{
    if *shutdown.borrow() {
        return Err(BackendError::Cancelled(what));
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return Err(BackendError::Cancelled(what)),
        }
        match check().await? {
            OpStatus::Pending => {}
            OpStatus::Done => return Ok(()),
            OpStatus::Error(message) => {
                return Err(BackendError::Operation {
                    name: what.to_string(),
                    message,
                });
            }
        }
    }
}

/// A shutdown receiver that never fires.
///
/// Used for waits that must run to completion even though the loop's own
/// shutdown has already been requested — most importantly the deletion
/// waits during graceful cleanup.
pub fn no_shutdown() -> watch::Receiver<bool> {
    static HOLD: OnceLock<watch::Sender<bool>> = OnceLock::new();
    HOLD.get_or_init(|| watch::channel(false).0).subscribe()
}
