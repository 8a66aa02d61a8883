//! Minimal Compute Engine REST client.
//!
//! Only the calls the backend needs, authenticated through the instance
//! metadata server — the autoscaler is expected to run inside the project
//! it manages. Single request/response per call, no retries; failures
//! surface to the reconciliation loop wrapped with the operation name.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use kiln_core::{BackendError, BackendResult};

use crate::poll::OpStatus;

const COMPUTE_ROOT: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct ComputeClient {
    http: reqwest::Client,
    project: String,
    zone: String,
    token: Mutex<Option<CachedToken>>,
}

impl ComputeClient {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> BackendResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::api("build compute client", e))?;
        Ok(Self {
            http,
            project: project.into(),
            zone: zone.into(),
            token: Mutex::new(None),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn zonal(&self, suffix: &str) -> String {
        format!(
            "{COMPUTE_ROOT}/projects/{}/zones/{}/{suffix}",
            self.project, self.zone
        )
    }

    fn global(&self, suffix: &str) -> String {
        format!("{COMPUTE_ROOT}/projects/{}/global/{suffix}", self.project)
    }

    /// An access token from the metadata server, cached until shortly
    /// before it expires.
    async fn bearer(&self) -> BackendResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let op = "fetch access token";
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| BackendError::api(op, e))?;
        if !response.status().is_success() {
            return Err(BackendError::api(
                op,
                format!("metadata server returned {}", response.status()),
            ));
        }
        let token: MetadataToken = response.json().await.map_err(|e| BackendError::api(op, e))?;

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60)),
        });
        Ok(value)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        op: &'static str,
        request: reqwest::RequestBuilder,
    ) -> BackendResult<T> {
        let bearer = self.bearer().await?;
        let response = request
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| BackendError::api(op, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::api(op, format!("HTTP {status}: {body}")));
        }
        response.json().await.map_err(|e| BackendError::api(op, e))
    }

    pub async fn list_instances(&self, filter: &str) -> BackendResult<Vec<Instance>> {
        let list: InstanceList = self
            .execute(
                "list instances",
                self.http
                    .get(self.zonal("instances"))
                    .query(&[("filter", filter)]),
            )
            .await?;
        Ok(list.items)
    }

    pub async fn get_instance(&self, name: &str) -> BackendResult<Instance> {
        self.execute(
            "get instance",
            self.http.get(self.zonal(&format!("instances/{name}"))),
        )
        .await
    }

    pub async fn insert_instance(
        &self,
        instance: &Instance,
        source_template: Option<&str>,
    ) -> BackendResult<Operation> {
        let mut request = self.http.post(self.zonal("instances")).json(instance);
        if let Some(template) = source_template {
            request = request.query(&[("sourceInstanceTemplate", template)]);
        }
        self.execute("create instance", request).await
    }

    pub async fn delete_instance(&self, name: &str) -> BackendResult<Operation> {
        self.execute(
            "delete instance",
            self.http.delete(self.zonal(&format!("instances/{name}"))),
        )
        .await
    }

    pub async fn list_images(&self, filter: &str) -> BackendResult<Vec<Image>> {
        let list: ImageList = self
            .execute(
                "list images",
                self.http
                    .get(self.global("images"))
                    .query(&[("filter", filter)]),
            )
            .await?;
        Ok(list.items)
    }

    /// The image a family currently resolves to, or `None` when the
    /// family has no image yet.
    pub async fn image_from_family(&self, family: &str) -> BackendResult<Option<Image>> {
        let op = "get image from family";
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(self.global(&format!("images/family/{family}")))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| BackendError::api(op, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::api(op, format!("HTTP {status}: {body}")));
        }
        let image = response.json().await.map_err(|e| BackendError::api(op, e))?;
        Ok(Some(image))
    }

    pub async fn insert_image(&self, image: &Image) -> BackendResult<Operation> {
        self.execute("create image", self.http.post(self.global("images")).json(image))
            .await
    }

    pub async fn delete_image(&self, name: &str) -> BackendResult<Operation> {
        self.execute(
            "delete image",
            self.http.delete(self.global(&format!("images/{name}"))),
        )
        .await
    }

    pub async fn instance_template(&self, name: &str) -> BackendResult<InstanceTemplate> {
        self.execute(
            "get instance template",
            self.http
                .get(self.global(&format!("instanceTemplates/{name}"))),
        )
        .await
    }

    /// Re-read an operation. Zonal operations live under the zone,
    /// global ones (image creation/deletion) under the project.
    pub async fn operation_status(&self, operation: &Operation) -> BackendResult<Operation> {
        let url = if operation.zone.is_some() {
            self.zonal(&format!("operations/{}", operation.name))
        } else {
            self.global(&format!("operations/{}", operation.name))
        };
        self.execute("get operation", self.http.get(url)).await
    }
}

// ── Wire models ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstanceList {
    items: Vec<Instance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImageList {
    items: Vec<Image>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Scheduling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<AttachedDisk>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scheduling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_run_duration: Option<RunDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_termination_action: Option<String>,
}

/// Durations ride the REST API as int64-in-a-string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDuration {
    pub seconds: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDisk {
    pub auto_delete: bool,
    pub boot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<DiskInitializeParams>,
    /// Fields kiln does not interpret but must round-trip when copying
    /// disks out of an instance template.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskInitializeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    pub network: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub network_tier: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_disk: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub storage_locations: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub creation_timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Operation {
    pub name: String,
    pub status: String,
    pub zone: Option<String>,
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OperationError {
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OperationErrorDetail {
    pub code: String,
    pub message: String,
}

impl Operation {
    /// Reduce to the generic PENDING → DONE | ERROR observation.
    pub fn op_status(&self) -> OpStatus {
        if self.status != "DONE" {
            return OpStatus::Pending;
        }
        match &self.error {
            Some(error) => OpStatus::Error(
                error
                    .errors
                    .iter()
                    .map(|e| e.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            None => OpStatus::Done,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstanceTemplate {
    pub properties: TemplateProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateProperties {
    pub disks: Vec<AttachedDisk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_list_decodes() {
        let list: InstanceList = serde_json::from_str(
            r#"{
                "kind": "compute#instanceList",
                "items": [
                    {"name": "kiln-runner-abcde", "status": "RUNNING",
                     "labels": {"type": "kiln-runner", "status": "idle"}},
                    {"name": "kiln-runner-fghij", "status": "TERMINATED"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].labels["status"], "idle");
        assert!(list.items[1].labels.is_empty());
    }

    #[test]
    fn empty_instance_list_decodes() {
        let list: InstanceList =
            serde_json::from_str(r#"{"kind": "compute#instanceList"}"#).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn pending_operation_is_pending() {
        let operation: Operation =
            serde_json::from_str(r#"{"name": "op-1", "status": "RUNNING"}"#).unwrap();
        assert_eq!(operation.op_status(), OpStatus::Pending);
    }

    #[test]
    fn done_operation_without_error_is_done() {
        let operation: Operation =
            serde_json::from_str(r#"{"name": "op-1", "status": "DONE"}"#).unwrap();
        assert_eq!(operation.op_status(), OpStatus::Done);
    }

    #[test]
    fn done_operation_with_error_reports_messages() {
        let operation: Operation = serde_json::from_str(
            r#"{"name": "op-1", "status": "DONE",
                "error": {"errors": [
                    {"code": "QUOTA_EXCEEDED", "message": "quota exceeded"},
                    {"code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "no capacity"}
                ]}}"#,
        )
        .unwrap();

        assert_eq!(
            operation.op_status(),
            OpStatus::Error("quota exceeded; no capacity".to_string())
        );
    }

    #[test]
    fn instance_serializes_without_empty_fields() {
        let instance = Instance {
            name: "kiln-runner-prepare".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&instance).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["name"], "kiln-runner-prepare");
    }

    #[test]
    fn template_disks_round_trip_unknown_fields() {
        let disk: AttachedDisk = serde_json::from_str(
            r#"{"autoDelete": true, "boot": true, "deviceName": "persistent-disk-0",
                "initializeParams": {"sourceImage": "projects/x/global/images/old", "diskSizeGb": "100"}}"#,
        )
        .unwrap();

        let json = serde_json::to_value(&disk).unwrap();
        assert_eq!(json["deviceName"], "persistent-disk-0");
        assert_eq!(json["initializeParams"]["diskSizeGb"], "100");
    }
}
