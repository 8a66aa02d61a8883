//! LXD backend — runner containers on the local hypervisor.
//!
//! Runner containers are ephemeral (stopping one destroys it) and tagged
//! with the `user.kiln-runner` config key. The golden image is reachable
//! through the `kiln-runner` image alias; baked images additionally carry
//! a 7-day expiry as a backstop on top of pipeline pruning.
//!
//! Runner status is a file the bootstrap scripts maintain inside each
//! container; an unreadable file means the runner has not come up yet.

mod api;

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use http::Method;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use kiln_core::{
    Backend, BackendError, BackendResult, InstanceObservation, InstancePhase, PrepareOptions,
    RunnerDisposition, classify, disposition::MARKER_ACTIVE,
};

use kiln_cloudinit::{prepare_document, runner_document};
use kiln_github::ReleaseClient;

use crate::bake::{BakeTarget, run_bake, unique_name};
use crate::poll::{OpStatus, POLL_INTERVAL, no_shutdown, wait_terminal};
use crate::{PREPARE_INSTANCE, RUNNER_TAG};

use api::{LxdAlias, LxdClient, LxdImage, LxdInstance, LxdOperation};

/// Config key marking runner containers as kiln-owned.
const CONFIG_KEY: &str = "user.kiln-runner";

/// File the bootstrap scripts write the runner's state marker to.
const STATE_FILE: &str = "/run/kiln-runner-state";

/// Where prepare containers boot from.
const BASE_SERVER: &str = "https://cloud-images.ubuntu.com/releases";
const BASE_ALIAS: &str = "jammy";

const ALIAS_DESCRIPTION: &str = "Prebaked kiln runner image";

/// Expiry backstop on baked images, should pruning ever fail.
const IMAGE_EXPIRY_DAYS: i64 = 7;

fn op_status(operation: &LxdOperation) -> OpStatus {
    match operation.status_code {
        200 => OpStatus::Done,
        code if code >= 400 => OpStatus::Error(if operation.err.is_empty() {
            format!("status code {code}")
        } else {
            operation.err.clone()
        }),
        _ => OpStatus::Pending,
    }
}

pub struct LxdBackend {
    api: LxdClient,
    releases: ReleaseClient,
}

impl LxdBackend {
    pub fn new(socket: impl Into<PathBuf>, releases: ReleaseClient) -> Self {
        Self {
            api: LxdClient::new(socket),
            releases,
        }
    }

    async fn alias(&self) -> BackendResult<Option<LxdAlias>> {
        self.api
            .get_opt(
                "get image alias",
                &format!("/1.0/images/aliases/{RUNNER_TAG}"),
            )
            .await
    }

    async fn wait_operation(
        &self,
        what: &'static str,
        operation_path: String,
        shutdown: watch::Receiver<bool>,
    ) -> BackendResult<()> {
        let api = &self.api;
        let path = operation_path.as_str();
        wait_terminal(what, POLL_INTERVAL, shutdown, move || async move {
            let operation: LxdOperation = api.get("get operation", path).await?;
            Ok(op_status(&operation))
        })
        .await
    }

    /// Containers carrying the kiln config key.
    async fn runner_instances(&self) -> BackendResult<Vec<LxdInstance>> {
        let instances: Vec<LxdInstance> = self
            .api
            .get("list instances", "/1.0/instances?recursion=1")
            .await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.config.get(CONFIG_KEY).map(String::as_str) == Some("true"))
            .collect())
    }

    /// The container's state marker, or `None` when it cannot be read.
    async fn state_marker(&self, instance: &str) -> Option<String> {
        self.api
            .read_instance_file(instance, STATE_FILE)
            .await
            .unwrap_or(None)
    }
}

impl BakeTarget for LxdBackend {
    async fn bootstrap_document(&self, opts: &PrepareOptions) -> BackendResult<String> {
        let version = self
            .releases
            .latest_runner_version()
            .await
            .map_err(|e| BackendError::Bootstrap(e.to_string()))?;

        let mut overlays = Vec::new();
        if let Some(custom) = opts.custom_overlay.as_deref() {
            overlays.push(custom);
        }
        prepare_document(&version, &overlays).map_err(|e| BackendError::Bootstrap(e.to_string()))
    }

    async fn launch_prepare_instance(
        &self,
        document: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> BackendResult<()> {
        // Not ephemeral: the stopped container is what gets snapshotted.
        let body = json!({
            "name": PREPARE_INSTANCE,
            "source": {
                "type": "image",
                "protocol": "simplestreams",
                "server": BASE_SERVER,
                "alias": BASE_ALIAS,
            },
            "config": {
                "security.nesting": "true",
                "user.vendor-data": document,
            },
            "profiles": ["default"],
            "type": "container",
        });
        let operation = self
            .api
            .start(
                "create prepare instance",
                Method::POST,
                "/1.0/instances",
                Some(body),
            )
            .await?;
        self.wait_operation("prepare instance creation", operation, shutdown.clone())
            .await?;

        let operation = self
            .api
            .start(
                "start prepare instance",
                Method::PUT,
                &format!("/1.0/instances/{PREPARE_INSTANCE}/state"),
                Some(json!({"action": "start"})),
            )
            .await?;
        self.wait_operation("prepare instance start", operation, shutdown.clone())
            .await
    }

    async fn prepare_instance_phase(&self) -> BackendResult<InstancePhase> {
        let instance: LxdInstance = self
            .api
            .get(
                "get prepare instance",
                &format!("/1.0/instances/{PREPARE_INSTANCE}"),
            )
            .await?;
        Ok(if instance.status == "Stopped" {
            InstancePhase::Stopped
        } else {
            InstancePhase::Running
        })
    }

    async fn snapshot_image(
        &self,
        image_name: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> BackendResult<String> {
        let expires_at = Utc::now() + TimeDelta::days(IMAGE_EXPIRY_DAYS);
        let body = json!({
            "source": {"type": "container", "name": PREPARE_INSTANCE},
            "properties": {"type": RUNNER_TAG, "description": image_name},
            "expires_at": expires_at.to_rfc3339(),
        });
        let operation = self
            .api
            .start("create image", Method::POST, "/1.0/images", Some(body))
            .await?;
        self.wait_operation("image creation", operation.clone(), shutdown.clone())
            .await?;

        // The finished operation's metadata carries the new fingerprint.
        let finished: LxdOperation = self.api.get("get image fingerprint", &operation).await?;
        let fingerprint = finished
            .metadata
            .get("fingerprint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BackendError::api("get image fingerprint", "operation metadata has no fingerprint")
            })?;
        Ok(fingerprint.to_string())
    }

    async fn publish_alias(&self, image_id: &str) -> BackendResult<()> {
        match self.alias().await? {
            Some(alias) => {
                self.api
                    .sync(
                        "update image alias",
                        Method::PUT,
                        &format!("/1.0/images/aliases/{}", alias.name),
                        Some(json!({"target": image_id, "description": ALIAS_DESCRIPTION})),
                    )
                    .await
            }
            None => {
                self.api
                    .sync(
                        "create image alias",
                        Method::POST,
                        "/1.0/images/aliases",
                        Some(json!({
                            "name": RUNNER_TAG,
                            "target": image_id,
                            "description": ALIAS_DESCRIPTION,
                        })),
                    )
                    .await
            }
        }
    }

    async fn prune(&self, keep_image_id: &str) -> BackendResult<()> {
        let images: Vec<LxdImage> = self.api.get("list images", "/1.0/images?recursion=1").await?;
        for image in images {
            if image.fingerprint != keep_image_id
                && image.properties.get("type").map(String::as_str) == Some(RUNNER_TAG)
            {
                debug!(fingerprint = %image.fingerprint, "deleting superseded image");
                self.api
                    .start(
                        "delete image",
                        Method::DELETE,
                        &format!("/1.0/images/{}", image.fingerprint),
                        None,
                    )
                    .await?;
            }
        }
        self.api
            .start(
                "delete prepare instance",
                Method::DELETE,
                &format!("/1.0/instances/{PREPARE_INSTANCE}"),
                None,
            )
            .await?;
        Ok(())
    }
}

impl Backend for LxdBackend {
    async fn image_created_at(&self) -> BackendResult<Option<DateTime<Utc>>> {
        let Some(alias) = self.alias().await? else {
            return Ok(None);
        };
        let image: LxdImage = self
            .api
            .get("get image", &format!("/1.0/images/{}", alias.target))
            .await?;
        Ok(Some(image.created_at))
    }

    async fn prepare_image(
        &self,
        opts: &PrepareOptions,
        shutdown: watch::Receiver<bool>,
    ) -> BackendResult<()> {
        run_bake(self, opts, shutdown).await
    }

    async fn create_runner(&self, url: &str, token: &str, labels: &str) -> BackendResult<()> {
        if self.alias().await?.is_none() {
            return Err(BackendError::NoImage);
        }

        let name = unique_name(RUNNER_TAG);
        let mut config = serde_json::Map::new();
        config.insert(CONFIG_KEY.to_string(), "true".into());
        config.insert("security.nesting".to_string(), "true".into());
        config.insert(
            "user.vendor-data".to_string(),
            runner_document(url, token, labels).into(),
        );
        let body = json!({
            "name": name,
            "source": {"type": "image", "alias": RUNNER_TAG},
            "config": config,
            "profiles": ["default"],
            "ephemeral": true,
            "type": "container",
        });

        let operation = self
            .api
            .start(
                "create runner instance",
                Method::POST,
                "/1.0/instances",
                Some(body),
            )
            .await?;
        self.wait_operation("runner instance creation", operation, no_shutdown())
            .await?;

        let operation = self
            .api
            .start(
                "start runner instance",
                Method::PUT,
                &format!("/1.0/instances/{name}/state"),
                Some(json!({"action": "start"})),
            )
            .await?;
        self.wait_operation("runner instance start", operation, no_shutdown())
            .await
    }

    async fn runner_disposition(&self) -> BackendResult<RunnerDisposition> {
        let instances = self.runner_instances().await?;

        let mut observations = Vec::with_capacity(instances.len());
        for instance in instances {
            let stopped = instance.status == "Stopped";
            let marker = if stopped {
                None
            } else {
                self.state_marker(&instance.name).await
            };
            observations.push(InstanceObservation {
                phase: if stopped {
                    InstancePhase::Stopped
                } else {
                    InstancePhase::Running
                },
                marker,
                name: instance.name,
            });
        }
        Ok(classify(&observations))
    }

    async fn delete_runners(&self, count: usize, wait: bool) -> BackendResult<()> {
        let instances = self.runner_instances().await?;

        let mut pending = Vec::new();
        for instance in &instances {
            if pending.len() == count {
                break;
            }
            if self.state_marker(&instance.name).await.as_deref() == Some(MARKER_ACTIVE) {
                continue;
            }
            // Stopping an ephemeral container destroys it.
            debug!(instance = %instance.name, "stopping runner");
            let operation = self
                .api
                .start(
                    "stop runner instance",
                    Method::PUT,
                    &format!("/1.0/instances/{}/state", instance.name),
                    Some(json!({"action": "stop", "force": true})),
                )
                .await?;
            pending.push(operation);
        }

        if wait {
            for operation in pending {
                self.wait_operation("runner instance stop", operation, no_shutdown())
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(status_code: u16, err: &str) -> LxdOperation {
        serde_json::from_value(json!({
            "status_code": status_code,
            "err": err,
            "metadata": null,
        }))
        .unwrap()
    }

    #[test]
    fn running_operation_is_pending() {
        assert_eq!(op_status(&operation(103, "")), OpStatus::Pending);
    }

    #[test]
    fn succeeded_operation_is_done() {
        assert_eq!(op_status(&operation(200, "")), OpStatus::Done);
    }

    #[test]
    fn failed_operation_carries_the_error() {
        assert_eq!(
            op_status(&operation(400, "container exited nonzero")),
            OpStatus::Error("container exited nonzero".to_string())
        );
    }

    #[test]
    fn failed_operation_without_message_reports_the_code() {
        assert_eq!(
            op_status(&operation(401, "")),
            OpStatus::Error("status code 401".to_string())
        );
    }
}
