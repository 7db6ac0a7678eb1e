use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::info;

/// Posts the rendered report as a review comment on the code host.
///
/// The token is an opaque secret passed through to the API; it is never
/// logged or echoed into the report.
#[derive(Debug, Clone)]
pub struct CommentPublisher {
    http: Client,
    api_base: String,
    token: String,
}

impl CommentPublisher {
    pub const TOKEN_ENV: &'static str = "GITHUB_TOKEN";

    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_api_base(token, "https://api.github.com")
    }

    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            bail!("publisher token must not be empty");
        }
        let http = Client::builder()
            .user_agent("mergegate/0.3")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build publisher HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Read the token from the conventional environment variable.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var(Self::TOKEN_ENV)
            .with_context(|| format!("environment variable {} must be set", Self::TOKEN_ENV))?;
        Self::new(token)
    }

    /// Post `body` as an issue comment on `owner/repo` issue or PR `number`.
    pub async fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        if !repo.contains('/') {
            bail!("repository must be given as owner/name (got `{repo}`)");
        }
        let url = format!("{}/repos/{}/issues/{}/comments", self.api_base, repo, number);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .json(&CommentBody { body })
            .send()
            .await
            .context("failed to reach the code host API")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("comment API error ({status}): {detail}");
        }
        info!(repo, number, "review comment posted");
        Ok(())
    }
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn rejects_empty_tokens() {
        assert!(CommentPublisher::new("   ").is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_repo_slugs() {
        let publisher = CommentPublisher::new("token").unwrap();
        let err = publisher
            .post_comment("not-a-slug", 1, "body")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("owner/name"));
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn posts_comment_payload() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/acme/widgets/issues/42/comments")
                .json_body(serde_json::json!({"body": "## Security Scan Report"}));
            then.status(201);
        });

        let publisher =
            CommentPublisher::with_api_base("token", server.base_url()).unwrap();
        publisher
            .post_comment("acme/widgets", 42, "## Security Scan Report")
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn surfaces_api_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path_contains("/comments");
            then.status(403).body("forbidden");
        });

        let publisher =
            CommentPublisher::with_api_base("token", server.base_url()).unwrap();
        let err = publisher
            .post_comment("acme/widgets", 42, "body")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
