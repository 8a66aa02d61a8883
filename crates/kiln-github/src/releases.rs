//! Latest `actions/runner` release lookup.

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::debug;

use crate::{API_ROOT, USER_AGENT};

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Resolves the runner release version pinned into prepare documents.
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    http: reqwest::Client,
}

impl ReleaseClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("building github client")?;
        Ok(Self { http })
    }

    /// The latest published `actions/runner` version, without the tag's
    /// `v` prefix. Resolved once per document build, never cached.
    pub async fn latest_runner_version(&self) -> anyhow::Result<String> {
        let endpoint = format!("{API_ROOT}/repos/actions/runner/releases/latest");
        let response = self
            .http
            .get(&endpoint)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("fetching latest runner release")?;

        if !response.status().is_success() {
            bail!(
                "fetching latest runner release: github returned {}",
                response.status()
            );
        }

        let release: Release = response.json().await.context("decoding runner release")?;
        let version = version_from_tag(&release.tag_name).to_string();
        debug!(%version, "resolved runner release");
        Ok(version)
    }
}

/// Strip the conventional `v` prefix from a release tag.
fn version_from_tag(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_strips_the_v_prefix() {
        assert_eq!(version_from_tag("v2.321.0"), "2.321.0");
    }

    #[test]
    fn version_without_prefix_passes_through() {
        assert_eq!(version_from_tag("2.321.0"), "2.321.0");
    }

    #[test]
    fn release_decodes() {
        let release: Release =
            serde_json::from_str(r#"{"tag_name":"v2.321.0","name":"v2.321.0"}"#).unwrap();
        assert_eq!(release.tag_name, "v2.321.0");
    }
}
