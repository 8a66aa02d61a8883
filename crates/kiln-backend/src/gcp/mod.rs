//! Compute Engine backend.
//!
//! Every resource kiln owns carries the `type = kiln-runner` label, which
//! is also the listing filter. The golden image is reachable through the
//! `kiln-runner` image *family*: publishing a new image into the family
//! repoints the alias, and pruning removes every labelled image except
//! the newest.
//!
//! Runner status rides on the instance's `status` label, written by the
//! instance itself as it moves starting → idle → active.

mod api;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use kiln_core::{
    Backend, BackendError, BackendResult, InstanceObservation, InstancePhase, PrepareOptions,
    RunnerDisposition, classify,
    disposition::{MARKER_ACTIVE, MARKER_PREPARING, MARKER_STARTING},
};

use kiln_cloudinit::{prepare_document, runner_document};
use kiln_github::ReleaseClient;

use crate::bake::{BakeTarget, run_bake, unique_name};
use crate::poll::{POLL_INTERVAL, no_shutdown, wait_terminal};
use crate::{PREPARE_INSTANCE, RUNNER_TAG};

use api::{
    AccessConfig, AttachedDisk, ComputeClient, DiskInitializeParams, Image, Instance, Metadata,
    MetadataItem, NetworkInterface, Operation, RunDuration, Scheduling, ServiceAccount,
};

/// Platform-specific overlay merged into every prepare document: the
/// gcloud CLI the state-reporting hook needs.
const GCP_PREPARE_OVERLAY: &str = include_str!("overlay.yml");

/// Base image prepare instances boot from.
const PREPARE_SOURCE_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";

/// Platform-enforced ceiling on the prepare instance's runtime. A hung
/// bootstrap script is terminated (and deleted) by Compute Engine itself.
const PREPARE_MAX_RUN_SECONDS: u64 = 15 * 60;

fn type_filter() -> String {
    format!("labels.type={RUNNER_TAG}")
}

fn phase_from_status(status: &str) -> InstancePhase {
    match status {
        "STOPPING" | "STOPPED" | "TERMINATED" => InstancePhase::Stopped,
        _ => InstancePhase::Running,
    }
}

fn region_from_zone(zone: &str) -> String {
    match zone.rsplit_once('-') {
        Some((region, _)) => region.to_string(),
        None => zone.to_string(),
    }
}

fn user_data(document: &str) -> Metadata {
    Metadata {
        items: vec![MetadataItem {
            key: "user-data".to_string(),
            value: document.to_string(),
        }],
    }
}

fn type_labels(status: &str) -> std::collections::HashMap<String, String> {
    [
        ("type".to_string(), RUNNER_TAG.to_string()),
        ("status".to_string(), status.to_string()),
    ]
    .into()
}

pub struct GcpBackend {
    api: ComputeClient,
    /// Optional instance template runner and prepare instances launch
    /// from; when unset a default e2-medium shape is built inline.
    template: Option<String>,
    releases: ReleaseClient,
}

impl GcpBackend {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        template: Option<String>,
        releases: ReleaseClient,
    ) -> BackendResult<Self> {
        Ok(Self {
            api: ComputeClient::new(project, zone)?,
            template,
            releases,
        })
    }

    async fn current_image(&self) -> BackendResult<Option<Image>> {
        self.api.image_from_family(RUNNER_TAG).await
    }

    async fn wait_operation(
        &self,
        what: &'static str,
        operation: Operation,
        shutdown: watch::Receiver<bool>,
    ) -> BackendResult<()> {
        let api = &self.api;
        let operation = &operation;
        wait_terminal(what, POLL_INTERVAL, shutdown, move || async move {
            Ok(api.operation_status(operation).await?.op_status())
        })
        .await
    }

    /// The inline machine shape used when no instance template is
    /// configured: e2-medium, one auto-deleting boot disk, NAT on the
    /// default network, compute scope on the default service account.
    fn default_shape(&self, instance: &mut Instance, source_image: &str) {
        instance.machine_type = Some(format!(
            "zones/{}/machineTypes/e2-medium",
            self.api.zone()
        ));
        instance.disks = vec![AttachedDisk {
            auto_delete: true,
            boot: true,
            initialize_params: Some(DiskInitializeParams {
                source_image: Some(source_image.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        instance.network_interfaces = vec![NetworkInterface {
            network: "global/networks/default".to_string(),
            access_configs: vec![AccessConfig {
                name: "External NAT".to_string(),
                kind: "ONE_TO_ONE_NAT".to_string(),
                network_tier: "STANDARD".to_string(),
            }],
        }];
        instance.service_accounts = vec![ServiceAccount {
            email: "default".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/compute".to_string()],
        }];
    }
}

impl BakeTarget for GcpBackend {
    async fn bootstrap_document(&self, opts: &PrepareOptions) -> BackendResult<String> {
        let version = self
            .releases
            .latest_runner_version()
            .await
            .map_err(|e| BackendError::Bootstrap(e.to_string()))?;

        let mut overlays = vec![GCP_PREPARE_OVERLAY];
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
        let mut instance = Instance {
            name: PREPARE_INSTANCE.to_string(),
            labels: type_labels(MARKER_PREPARING),
            metadata: Some(user_data(document)),
            scheduling: Some(Scheduling {
                max_run_duration: Some(RunDuration {
                    seconds: PREPARE_MAX_RUN_SECONDS.to_string(),
                }),
                instance_termination_action: Some("DELETE".to_string()),
            }),
            ..Default::default()
        };
        if self.template.is_none() {
            self.default_shape(&mut instance, PREPARE_SOURCE_IMAGE);
        }

        let operation = self
            .api
            .insert_instance(&instance, self.template.as_deref())
            .await?;
        self.wait_operation("prepare instance creation", operation, shutdown.clone())
            .await
    }

    async fn prepare_instance_phase(&self) -> BackendResult<InstancePhase> {
        let instance = self.api.get_instance(PREPARE_INSTANCE).await?;
        Ok(phase_from_status(&instance.status))
    }

    async fn snapshot_image(
        &self,
        image_name: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> BackendResult<String> {
        let image = Image {
            name: image_name.to_string(),
            family: Some(RUNNER_TAG.to_string()),
            labels: [("type".to_string(), RUNNER_TAG.to_string())].into(),
            source_disk: Some(format!(
                "projects/{}/zones/{}/disks/{}",
                self.api.project(),
                self.api.zone(),
                PREPARE_INSTANCE
            )),
            storage_locations: vec![region_from_zone(self.api.zone())],
            ..Default::default()
        };

        let operation = self.api.insert_image(&image).await?;
        self.wait_operation("image creation", operation, shutdown.clone())
            .await?;
        Ok(image_name.to_string())
    }

    async fn publish_alias(&self, image_id: &str) -> BackendResult<()> {
        // Family membership is the alias here: the newest image in the
        // family became the target when its creation finished. Verify the
        // pointer actually moved before pruning anything.
        match self.current_image().await? {
            Some(image) if image.name == image_id => Ok(()),
            _ => Err(BackendError::api(
                "publish image",
                format!("family {RUNNER_TAG} does not resolve to {image_id}"),
            )),
        }
    }

    async fn prune(&self, keep_image_id: &str) -> BackendResult<()> {
        let images = self.api.list_images(&type_filter()).await?;
        for image in images {
            if image.name != keep_image_id {
                debug!(image = %image.name, "deleting superseded image");
                self.api.delete_image(&image.name).await?;
            }
        }
        self.api.delete_instance(PREPARE_INSTANCE).await?;
        Ok(())
    }
}

impl Backend for GcpBackend {
    async fn image_created_at(&self) -> BackendResult<Option<DateTime<Utc>>> {
        let Some(image) = self.current_image().await? else {
            return Ok(None);
        };
        let created_at = DateTime::parse_from_rfc3339(&image.creation_timestamp)
            .map_err(|e| BackendError::api("get image creation time", e))?;
        Ok(Some(created_at.with_timezone(&Utc)))
    }

    async fn prepare_image(
        &self,
        opts: &PrepareOptions,
        shutdown: watch::Receiver<bool>,
    ) -> BackendResult<()> {
        run_bake(self, opts, shutdown).await
    }

    async fn create_runner(&self, url: &str, token: &str, labels: &str) -> BackendResult<()> {
        let image = self.current_image().await?.ok_or(BackendError::NoImage)?;
        let source_image = format!(
            "projects/{}/global/images/{}",
            self.api.project(),
            image.name
        );

        let mut instance = Instance {
            name: unique_name(RUNNER_TAG),
            labels: type_labels(MARKER_STARTING),
            metadata: Some(user_data(&runner_document(url, token, labels))),
            ..Default::default()
        };

        if let Some(template_name) = self.template.as_deref() {
            // Copy the template's disks but point the boot disk at the
            // golden image, so extra disks (local SSDs) survive.
            let template = self.api.instance_template(template_name).await?;
            instance.disks = template.properties.disks;
            for disk in &mut instance.disks {
                if disk.boot {
                    disk.initialize_params
                        .get_or_insert_with(Default::default)
                        .source_image = Some(source_image.clone());
                    break;
                }
            }
        } else {
            self.default_shape(&mut instance, &source_image);
        }

        let operation = self
            .api
            .insert_instance(&instance, self.template.as_deref())
            .await?;
        self.wait_operation("runner instance creation", operation, no_shutdown())
            .await
    }

    async fn runner_disposition(&self) -> BackendResult<RunnerDisposition> {
        let instances = self.api.list_instances(&type_filter()).await?;
        let observations: Vec<InstanceObservation> = instances
            .into_iter()
            .map(|instance| InstanceObservation {
                phase: phase_from_status(&instance.status),
                marker: instance.labels.get("status").cloned(),
                name: instance.name,
            })
            .collect();
        Ok(classify(&observations))
    }

    async fn delete_runners(&self, count: usize, wait: bool) -> BackendResult<()> {
        let instances = self.api.list_instances(&type_filter()).await?;

        let mut operations = Vec::new();
        for instance in instances
            .iter()
            .filter(|i| i.labels.get("status").map(String::as_str) != Some(MARKER_ACTIVE))
            .take(count)
        {
            debug!(instance = %instance.name, "deleting runner");
            let operation = self.api.delete_instance(&instance.name).await?;
            operations.push(operation);
        }

        if wait {
            for operation in operations {
                self.wait_operation("runner deletion", operation, no_shutdown())
                    .await?;
            }
        }
        Ok(())
    }
}
