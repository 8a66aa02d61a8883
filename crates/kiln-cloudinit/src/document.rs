//! Bootstrap document rendering.

use serde_yaml::Value;
use thiserror::Error;

use crate::merge::merge;

/// Base first-boot document for the image-preparation instance.
const PREPARE_TEMPLATE: &str = include_str!("../templates/prepare.yml");

/// First-boot document for runner instances.
const START_TEMPLATE: &str = include_str!("../templates/start.yml");

/// Errors composing a bootstrap document.
#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("decoding base document: {0}")]
    ParseBase(#[source] serde_yaml::Error),

    #[error("decoding overlay: {0}")]
    ParseOverlay(#[source] serde_yaml::Error),

    #[error("base document must be a mapping")]
    BaseNotMapping,

    #[error("encoding merged document: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// Render the prepare document: substitute the pinned runner release
/// version into the base template, then merge each overlay in order.
///
/// Overlays that are empty or whitespace-only are skipped, so a missing
/// operator overlay leaves the base document unchanged.
pub fn prepare_document(
    runner_version: &str,
    overlays: &[&str],
) -> Result<String, CloudInitError> {
    let base = PREPARE_TEMPLATE.replace("{{RUNNER_VERSION}}", runner_version);
    let mut document: Value =
        serde_yaml::from_str(&base).map_err(CloudInitError::ParseBase)?;
    if !document.is_mapping() {
        return Err(CloudInitError::BaseNotMapping);
    }

    for overlay in overlays {
        if overlay.trim().is_empty() {
            continue;
        }
        let overlay: Value =
            serde_yaml::from_str(overlay).map_err(CloudInitError::ParseOverlay)?;
        merge(&mut document, &overlay);
    }

    let rendered = serde_yaml::to_string(&document).map_err(CloudInitError::Serialize)?;
    // serde_yaml drops the comment header; cloud-init requires it back.
    Ok(format!("#cloud-config\n{rendered}"))
}

/// Render the start document for one runner: registration URL, one-time
/// token, and label string substituted into the embedded template.
pub fn runner_document(url: &str, token: &str, labels: &str) -> String {
    START_TEMPLATE
        .replace("{{URL}}", url)
        .replace("{{TOKEN}}", token)
        .replace("{{LABELS}}", labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERLAY: &str = "packages:\n  - gcc\nruncmd:\n  - id\n";

    #[test]
    fn prepare_document_pins_the_runner_version() {
        let doc = prepare_document("2.321.0", &[]).unwrap();
        assert!(doc.contains("actions-runner-linux-x64-2.321.0.tar.gz"));
        assert!(doc.contains("/releases/download/v2.321.0/"));
        assert!(!doc.contains("{{RUNNER_VERSION}}"));
    }

    #[test]
    fn prepare_document_keeps_the_cloud_config_header() {
        let doc = prepare_document("2.321.0", &[]).unwrap();
        assert!(doc.starts_with("#cloud-config\n"));
    }

    #[test]
    fn overlay_packages_and_commands_are_appended() {
        let doc = prepare_document("2.321.0", &[OVERLAY]).unwrap();
        assert!(doc.contains("docker-ce"));
        assert!(doc.contains("gcc"));
        assert!(doc.contains("- id"));
    }

    #[test]
    fn base_packages_come_before_overlay_packages() {
        let doc = prepare_document("2.321.0", &[OVERLAY]).unwrap();
        let docker = doc.find("docker-ce").unwrap();
        let gcc = doc.find("gcc").unwrap();
        assert!(docker < gcc);
    }

    #[test]
    fn empty_overlay_is_skipped() {
        let plain = prepare_document("2.321.0", &[]).unwrap();
        let with_empty = prepare_document("2.321.0", &["", "  \n"]).unwrap();
        assert_eq!(plain, with_empty);
    }

    #[test]
    fn overlays_merge_in_order() {
        let doc =
            prepare_document("2.321.0", &["packages:\n  - first\n", "packages:\n  - second\n"])
                .unwrap();
        let first = doc.find("- first").unwrap();
        let second = doc.find("- second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn malformed_overlay_is_an_error() {
        let err = prepare_document("2.321.0", &["{not yaml: ["]).unwrap_err();
        assert!(matches!(err, CloudInitError::ParseOverlay(_)));
    }

    #[test]
    fn runner_document_resolves_every_placeholder() {
        let doc = runner_document(
            "https://github.com/acme/widgets",
            "AAAATOKEN",
            "self-hosted,linux",
        );
        assert!(doc.contains("--url \"https://github.com/acme/widgets\""));
        assert!(doc.contains("--token \"AAAATOKEN\""));
        assert!(doc.contains("--labels \"self-hosted,linux\""));
        assert!(!doc.contains("{{"));
    }

    #[test]
    fn runner_document_reports_state_transitions() {
        let doc = runner_document("u", "t", "l");
        let starting = doc.find("report-state starting").unwrap();
        let idle = doc.find("report-state idle").unwrap();
        assert!(starting < idle);
        assert!(doc.contains("report-state active"));
    }
}
