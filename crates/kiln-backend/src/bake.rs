//! The golden-image bake pipeline, generalized across backends.
//!
//! `PrepareImage` on every backend is the same six steps; only the
//! primitive operations differ. Backends implement [`BakeTarget`] and
//! hand themselves to [`run_bake`]:
//!
//! 1. compose the bootstrap document (merge engine + version pin),
//! 2. launch the short-lived prepare instance with the document injected,
//! 3. poll until the bootstrap script powers the instance off,
//! 4. snapshot its boot disk into a uniquely named, tagged image,
//! 5. repoint the alias at the new image,
//! 6. delete the superseded images and the prepare instance.
//!
//! Any step failure aborts the pipeline. Partially created resources (a
//! stuck prepare instance, an orphaned disk) are not rolled back; the
//! error tells the operator what was left behind. Cleanup failures in
//! step 6 are pipeline failures too, never swallowed.

use std::future::Future;

use rand::Rng;
use tokio::sync::watch;
use tracing::info;

use kiln_core::{BackendResult, InstancePhase, PrepareOptions};

use crate::poll::{OpStatus, POLL_INTERVAL, wait_terminal};

/// Primitive operations a backend exposes to the bake pipeline.
///
/// Methods that issue asynchronous backend operations wait for them
/// internally through [`wait_terminal`], observing the same shutdown
/// channel the pipeline does.
pub trait BakeTarget {
    /// Compose the first-boot document for the prepare instance.
    fn bootstrap_document(
        &self,
        opts: &PrepareOptions,
    ) -> impl Future<Output = BackendResult<String>> + Send;

    /// Launch the prepare instance with `document` injected as first-boot
    /// configuration, waiting until the instance exists and is booting.
    fn launch_prepare_instance(
        &self,
        document: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Current power phase of the prepare instance.
    fn prepare_instance_phase(&self) -> impl Future<Output = BackendResult<InstancePhase>> + Send;

    /// Snapshot the stopped prepare instance's boot disk into an image
    /// named `image_name`, tagged for later discovery. Returns the
    /// backend's canonical identifier for the new image.
    fn snapshot_image(
        &self,
        image_name: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> impl Future<Output = BackendResult<String>> + Send;

    /// Repoint the named alias at `image_id`: update it if it exists,
    /// create it otherwise.
    fn publish_alias(&self, image_id: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// Delete every previously tagged image except `keep_image_id`, then
    /// delete the prepare instance.
    fn prune(&self, keep_image_id: &str) -> impl Future<Output = BackendResult<()>> + Send;
}

/// Append a 5-letter lowercase suffix to `prefix`.
pub fn unique_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..5).map(|_| rng.random_range('a'..='z')).collect();
    format!("{prefix}-{suffix}")
}

/// Execute the bake pipeline against `target`.
pub async fn run_bake<T: BakeTarget>(
    target: &T,
    opts: &PrepareOptions,
    shutdown: watch::Receiver<bool>,
) -> BackendResult<()> {
    let document = target.bootstrap_document(opts).await?;

    info!("launching prepare instance");
    target.launch_prepare_instance(&document, &shutdown).await?;

    // The bootstrap script powers the machine off when it finishes; that
    // stop is the completion signal. There is no pipeline-side timeout —
    // the platform's max-runtime limit is the only backstop.
    wait_terminal(
        "prepare instance stop",
        POLL_INTERVAL,
        shutdown.clone(),
        move || async move {
            Ok(match target.prepare_instance_phase().await? {
                InstancePhase::Stopped => OpStatus::Done,
                InstancePhase::Running => OpStatus::Pending,
            })
        },
    )
    .await?;

    let image_name = unique_name(crate::RUNNER_TAG);
    info!(image = %image_name, "snapshotting prepare instance");
    let image_id = target.snapshot_image(&image_name, &shutdown).await?;

    target.publish_alias(&image_id).await?;
    info!(image = %image_name, "golden image published");

    target.prune(&image_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use kiln_core::BackendError;

    use crate::poll::no_shutdown;

    /// Records the pipeline's calls and fails on request at one step.
    struct ScriptedTarget {
        calls: Mutex<Vec<String>>,
        fail_at: Option<&'static str>,
        stop_after_polls: usize,
        polls: Mutex<usize>,
    }

    impl ScriptedTarget {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_at: None,
                stop_after_polls: 1,
                polls: Mutex::new(0),
            }
        }

        fn failing_at(step: &'static str) -> Self {
            Self {
                fail_at: Some(step),
                ..Self::new()
            }
        }

        fn record(&self, step: &'static str) -> BackendResult<()> {
            self.calls.lock().unwrap().push(step.to_string());
            if self.fail_at == Some(step) {
                return Err(BackendError::api(step, "scripted failure"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl BakeTarget for ScriptedTarget {
        async fn bootstrap_document(&self, _opts: &PrepareOptions) -> BackendResult<String> {
            self.record("bootstrap_document")?;
            Ok("#cloud-config\n".to_string())
        }

        async fn launch_prepare_instance(
            &self,
            document: &str,
            _shutdown: &watch::Receiver<bool>,
        ) -> BackendResult<()> {
            assert!(document.starts_with("#cloud-config"));
            self.record("launch_prepare_instance")
        }

        async fn prepare_instance_phase(&self) -> BackendResult<InstancePhase> {
            self.record("prepare_instance_phase")?;
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            Ok(if *polls >= self.stop_after_polls {
                InstancePhase::Stopped
            } else {
                InstancePhase::Running
            })
        }

        async fn snapshot_image(
            &self,
            image_name: &str,
            _shutdown: &watch::Receiver<bool>,
        ) -> BackendResult<String> {
            self.record("snapshot_image")?;
            Ok(format!("id-{image_name}"))
        }

        async fn publish_alias(&self, image_id: &str) -> BackendResult<()> {
            assert!(image_id.starts_with("id-"));
            self.record("publish_alias")
        }

        async fn prune(&self, _keep_image_id: &str) -> BackendResult<()> {
            self.record("prune")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn steps_run_in_order() {
        let target = ScriptedTarget::new();
        run_bake(&target, &PrepareOptions::default(), no_shutdown())
            .await
            .unwrap();

        assert_eq!(
            target.calls(),
            [
                "bootstrap_document",
                "launch_prepare_instance",
                "prepare_instance_phase",
                "snapshot_image",
                "publish_alias",
                "prune",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_instance_to_stop() {
        let target = ScriptedTarget {
            stop_after_polls: 4,
            ..ScriptedTarget::new()
        };
        run_bake(&target, &PrepareOptions::default(), no_shutdown())
            .await
            .unwrap();

        let phase_polls = target
            .calls()
            .iter()
            .filter(|c| *c == "prepare_instance_phase")
            .count();
        assert_eq!(phase_polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_aborts_before_snapshot() {
        let target = ScriptedTarget::failing_at("launch_prepare_instance");
        let err = run_bake(&target, &PrepareOptions::default(), no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Api { .. }));
        assert!(!target.calls().iter().any(|c| c == "snapshot_image"));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_failure_surfaces_after_publish() {
        // Incomplete cleanup must reach the operator even though the new
        // image is already live.
        let target = ScriptedTarget::failing_at("prune");
        let err = run_bake(&target, &PrepareOptions::default(), no_shutdown())
            .await
            .unwrap_err();

        assert!(target.calls().iter().any(|c| c == "publish_alias"));
        assert_eq!(err.to_string(), "prune: scripted failure");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_stop_wait_cancels() {
        let (tx, rx) = watch::channel(false);
        let target = ScriptedTarget {
            stop_after_polls: usize::MAX,
            ..ScriptedTarget::new()
        };

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(12)).await;
            let _ = tx.send(true);
        });

        let err = run_bake(&target, &PrepareOptions::default(), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Cancelled(_)));
        assert!(!target.calls().iter().any(|c| c == "snapshot_image"));
    }

    #[test]
    fn unique_names_are_prefixed_and_lowercase() {
        let name = unique_name("kiln-runner");
        let suffix = name.strip_prefix("kiln-runner-").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn unique_names_differ() {
        assert_ne!(unique_name("kiln-runner"), unique_name("kiln-runner"));
    }
}
