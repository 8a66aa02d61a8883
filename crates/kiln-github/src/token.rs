//! Repository-scoped runner registration tokens.

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::debug;

use kiln_core::TokenProvider;

use crate::{API_ROOT, USER_AGENT};

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
}

/// Fetches one-time registration tokens for a single repository.
#[derive(Debug, Clone)]
pub struct RegistrationTokenProvider {
    http: reqwest::Client,
    org: String,
    repo: String,
    pat: String,
}

impl RegistrationTokenProvider {
    pub fn new(
        org: impl Into<String>,
        repo: impl Into<String>,
        pat: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("building github client")?;
        Ok(Self {
            http,
            org: org.into(),
            repo: repo.into(),
            pat: pat.into(),
        })
    }
}

impl TokenProvider for RegistrationTokenProvider {
    fn url(&self) -> String {
        format!("https://github.com/{}/{}", self.org, self.repo)
    }

    async fn token(&self) -> anyhow::Result<String> {
        let endpoint = format!(
            "{API_ROOT}/repos/{}/{}/actions/runners/registration-token",
            self.org, self.repo
        );
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.pat)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("creating registration token")?;

        if !response.status().is_success() {
            bail!(
                "creating registration token: github returned {}",
                response.status()
            );
        }

        let token: RegistrationToken = response
            .json()
            .await
            .context("decoding registration token")?;
        debug!(org = %self.org, repo = %self.repo, "fetched registration token");
        Ok(token.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_the_repository_page() {
        let provider = RegistrationTokenProvider::new("acme", "widgets", "pat").unwrap();
        assert_eq!(provider.url(), "https://github.com/acme/widgets");
    }

    #[test]
    fn registration_token_decodes() {
        let token: RegistrationToken =
            serde_json::from_str(r#"{"token":"AABBCC","expires_at":"2026-08-08T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(token.token, "AABBCC");
    }
}
