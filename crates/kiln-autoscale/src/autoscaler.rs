//! The autoscaler: periodic reconciliation of the runner pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kiln_core::{Backend, BackendError, PrepareOptions, TokenProvider};
use kiln_metrics::RunnerGauges;

/// A golden image older than this is rebaked at the next prepare check.
/// The comparison is strict: an image exactly this old is still fresh.
const MAX_IMAGE_AGE_HOURS: i64 = 24;

/// The image freshness check runs every this many ticks, counting tick 0.
const PREPARE_CHECK_TICKS: u64 = 500;

/// Errors from one reconciliation tick, wrapped with the operation that
/// failed. Logged by the loop; never fatal.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("get image created at: {0}")]
    ImageAge(#[source] BackendError),

    #[error("prepare image: {0}")]
    Prepare(#[source] BackendError),

    #[error("get runner disposition: {0}")]
    Disposition(#[source] BackendError),

    #[error("get registration token: {0}")]
    Token(#[source] anyhow::Error),

    #[error("create runner: {0}")]
    Create(#[source] BackendError),

    #[error("delete runners: {0}")]
    Cleanup(#[source] BackendError),
}

/// Operator-facing loop configuration.
#[derive(Debug, Clone, Default)]
pub struct AutoscalerConfig {
    /// How many idle runners to keep warm.
    pub target_idle: u32,
    /// Label string runners register with.
    pub labels: String,
    /// Bake options forwarded to `prepare_image`.
    pub prepare: PrepareOptions,
}

pub struct Autoscaler<B, T> {
    backend: B,
    tokens: T,
    config: AutoscalerConfig,
    gauges: Arc<RunnerGauges>,
}

impl<B: Backend, T: TokenProvider> Autoscaler<B, T> {
    pub fn new(backend: B, tokens: T, config: AutoscalerConfig, gauges: Arc<RunnerGauges>) -> Self {
        Self {
            backend,
            tokens,
            config,
            gauges,
        }
    }

    /// Bake a new golden image if the current one is stale or missing.
    async fn maybe_prepare(&self, shutdown: watch::Receiver<bool>) -> Result<(), AutoscaleError> {
        let created_at = self
            .backend
            .image_created_at()
            .await
            .map_err(AutoscaleError::ImageAge)?;

        if let Some(created_at) = created_at {
            let age = Utc::now().signed_duration_since(created_at);
            if age <= TimeDelta::hours(MAX_IMAGE_AGE_HOURS) {
                return Ok(());
            }
            info!(age_hours = age.num_hours(), "golden image is stale, rebaking");
        } else {
            info!("no golden image published yet, baking one");
        }

        let _preparing = self.gauges.begin_preparing();
        self.backend
            .prepare_image(&self.config.prepare, shutdown)
            .await
            .map_err(AutoscaleError::Prepare)
    }

    /// One reconciliation pass.
    ///
    /// A prepare failure is logged here and does not abort the tick; a
    /// failed creation aborts the remaining creations — the shortfall is
    /// picked up again next tick.
    pub async fn tick(
        &self,
        check_prepare: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AutoscaleError> {
        if check_prepare {
            if let Err(e) = self.maybe_prepare(shutdown).await {
                warn!(error = %e, "image preparation failed");
            }
        }

        let disposition = self
            .backend
            .runner_disposition()
            .await
            .map_err(AutoscaleError::Disposition)?;
        self.gauges.record_disposition(&disposition);
        info!(
            starting = disposition.starting,
            idle = disposition.idle,
            active = disposition.active,
            total = disposition.total(),
            "runner disposition"
        );

        let target = self.config.target_idle as usize;
        for have in disposition.available()..target {
            info!(have, target, "creating runner");
            let url = self.tokens.url();
            let token = self.tokens.token().await.map_err(AutoscaleError::Token)?;
            self.backend
                .create_runner(&url, &token, &self.config.labels)
                .await
                .map_err(AutoscaleError::Create)?;
            info!("runner created");
        }
        Ok(())
    }

    /// Best-effort decommission of the idle and starting runners.
    /// Invoked exactly once, after the loop has exited.
    async fn cleanup(&self) -> Result<(), AutoscaleError> {
        let disposition = self
            .backend
            .runner_disposition()
            .await
            .map_err(AutoscaleError::Disposition)?;

        let count = disposition.available();
        if count == 0 {
            return Ok(());
        }
        info!(count, "decommissioning idle and starting runners");
        self.backend
            .delete_runners(count, true)
            .await
            .map_err(AutoscaleError::Cleanup)
    }

    /// Drive reconciliation until the shutdown channel fires, then run
    /// cleanup and return.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            target_idle = self.config.target_idle,
            "autoscaler started"
        );

        let mut ticks: u64 = 0;
        loop {
            let check_prepare = ticks % PREPARE_CHECK_TICKS == 0;
            if let Err(e) = self.tick(check_prepare, shutdown.clone()).await {
                // Failures caused by the shutdown itself are not worth a log line.
                if !*shutdown.borrow() {
                    error!(error = %e, "reconciliation tick failed");
                }
            }
            ticks += 1;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "shutdown cleanup failed");
                    }
                    break;
                }
            }
        }
    }
}
