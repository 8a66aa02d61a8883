//! kiln-backend — compute backends behind the capability contract.
//!
//! Two implementations, selected once at startup:
//!
//! - [`GcpBackend`] — Compute Engine instances, images discovered by
//!   label, the image family as the golden-image alias;
//! - [`LxdBackend`] — containers on the local LXD daemon over its Unix
//!   socket, an image alias as the pointer, a state file inside each
//!   container as the status marker.
//!
//! What the backends share lives here too: the generalized bake pipeline
//! ([`bake`]) and the poll-until-terminal helper ([`poll`]) both follow
//! for every asynchronous operation.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use kiln_core::{Backend, BackendResult, PrepareOptions, RunnerDisposition};

pub mod bake;
pub mod gcp;
pub mod lxd;
pub mod poll;

pub use gcp::GcpBackend;
pub use lxd::LxdBackend;

/// Tag identifying every resource kiln owns: instance and image names are
/// prefixed with it, GCP labels and LXD config keys carry it, and the
/// golden-image alias is named after it. Lowercase because GCP label
/// values must be.
pub const RUNNER_TAG: &str = "kiln-runner";

/// Name of the short-lived instance the bake pipeline prepares images on.
pub const PREPARE_INSTANCE: &str = "kiln-runner-prepare";

/// The closed set of compute backends.
pub enum AnyBackend {
    Gcp(GcpBackend),
    Lxd(LxdBackend),
}

impl Backend for AnyBackend {
    async fn image_created_at(&self) -> BackendResult<Option<DateTime<Utc>>> {
        match self {
            AnyBackend::Gcp(backend) => backend.image_created_at().await,
            AnyBackend::Lxd(backend) => backend.image_created_at().await,
        }
    }

    async fn prepare_image(
        &self,
        opts: &PrepareOptions,
        shutdown: watch::Receiver<bool>,
    ) -> BackendResult<()> {
        match self {
            AnyBackend::Gcp(backend) => backend.prepare_image(opts, shutdown).await,
            AnyBackend::Lxd(backend) => backend.prepare_image(opts, shutdown).await,
        }
    }

    async fn create_runner(&self, url: &str, token: &str, labels: &str) -> BackendResult<()> {
        match self {
            AnyBackend::Gcp(backend) => backend.create_runner(url, token, labels).await,
            AnyBackend::Lxd(backend) => backend.create_runner(url, token, labels).await,
        }
    }

    async fn runner_disposition(&self) -> BackendResult<RunnerDisposition> {
        match self {
            AnyBackend::Gcp(backend) => backend.runner_disposition().await,
            AnyBackend::Lxd(backend) => backend.runner_disposition().await,
        }
    }

    async fn delete_runners(&self, count: usize, wait: bool) -> BackendResult<()> {
        match self {
            AnyBackend::Gcp(backend) => backend.delete_runners(count, wait).await,
            AnyBackend::Lxd(backend) => backend.delete_runners(count, wait).await,
        }
    }
}
