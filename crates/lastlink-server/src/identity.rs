//! Session-token resolution against an external identity provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

/// Maps a bearer session token to a stable user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the token is not a valid session.
    async fn resolve(&self, token: &str) -> Result<Option<String>>;
}

/// Used when no identity provider is configured: no session is ever valid,
/// so only API keys authenticate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentity;

#[async_trait]
impl IdentityProvider for NoIdentity {
    async fn resolve(&self, _token: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Deserialize)]
struct UserInfo {
    sub: Option<String>,
    id: Option<String>,
}

/// Calls `GET {url}` with the caller's bearer token and reads the user id
/// from `sub` (or `id`) in the JSON response.
pub struct RemoteIdentity {
    client: reqwest::Client,
    url: String,
}

impl RemoteIdentity {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build identity reqwest client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentity {
    async fn resolve(&self, token: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .context("identity provider request")?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("identity provider rejected session token");
                return Ok(None);
            }
            s if !s.is_success() => anyhow::bail!("identity provider returned {s}"),
            _ => {}
        }

        let info: UserInfo = resp.json().await.context("parse identity response")?;
        Ok(info.sub.or(info.id).filter(|id| !id.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(mock: &MockServer) -> RemoteIdentity {
        RemoteIdentity::new(format!("{}/userinfo", mock.uri()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn resolves_sub_or_id() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(bearer_token("sess_a"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"sub": "user_a"})),
            )
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(bearer_token("sess_b"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "user_b"})),
            )
            .mount(&mock)
            .await;

        let p = provider(&mock).await;
        assert_eq!(p.resolve("sess_a").await.unwrap().as_deref(), Some("user_a"));
        assert_eq!(p.resolve("sess_b").await.unwrap().as_deref(), Some("user_b"));
    }

    #[tokio::test]
    async fn rejected_token_is_none() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        assert_eq!(provider(&mock).await.resolve("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn provider_failure_is_an_error() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock)
            .await;

        assert!(provider(&mock).await.resolve("tok").await.is_err());
    }

    #[tokio::test]
    async fn no_identity_never_resolves() {
        assert_eq!(NoIdentity.resolve("anything").await.unwrap(), None);
    }
}
