//! The capability contract every compute backend implements.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::disposition::RunnerDisposition;
use crate::error::BackendResult;

/// Per-invocation configuration for a golden-image bake.
///
/// Immutable once constructed; the operator overlay is merged into the
/// backend's base bootstrap document by the cloud-init merge engine.
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Operator-supplied cloud-init overlay, merged over the base prepare
    /// document. `None` leaves the base document unchanged.
    pub custom_overlay: Option<String>,
}

/// A compute backend capable of hosting ephemeral runners.
///
/// Implementations form a closed set selected once at startup. The
/// reconciliation loop never issues two calls concurrently, so backends
/// do not need to serialize their own operations.
pub trait Backend {
    /// Creation time of the currently aliased golden image, or `None`
    /// when no image has been published yet (not an error).
    fn image_created_at(
        &self,
    ) -> impl Future<Output = BackendResult<Option<DateTime<Utc>>>> + Send;

    /// Run the bake pipeline to publish a fresh golden image.
    ///
    /// Idempotent at the alias level: repeated success always leaves
    /// exactly one current image. Not safe to call concurrently with
    /// itself. The shutdown channel is observed at every polling point.
    fn prepare_image(
        &self,
        opts: &PrepareOptions,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Launch one runner from the current golden image, pre-seeded with
    /// registration credentials. Fails with [`BackendError::NoImage`] when
    /// no image alias exists.
    ///
    /// [`BackendError::NoImage`]: crate::error::BackendError::NoImage
    fn create_runner(
        &self,
        url: &str,
        token: &str,
        labels: &str,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Snapshot the current runner population, classified per state.
    fn runner_disposition(
        &self,
    ) -> impl Future<Output = BackendResult<RunnerDisposition>> + Send;

    /// Best-effort decommission of up to `count` non-active runners.
    ///
    /// With `wait = true` the call blocks until every requested deletion
    /// reaches a terminal state; with `wait = false` it returns once the
    /// deletions have been issued.
    fn delete_runners(
        &self,
        count: usize,
        wait: bool,
    ) -> impl Future<Output = BackendResult<()>> + Send;
}
