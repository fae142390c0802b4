//! Resend-compatible transactional mail provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{Notification, NotifyError, Notifier};

pub const DEFAULT_RESEND_URL: &str = "https://api.resend.com";

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

/// Sends mail through `POST {base_url}/emails` with a bearer API key.
pub struct ResendNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendNotifier {
    /// `timeout` bounds the whole HTTP exchange.
    pub fn new(api_key: String, base_url: String, from: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build mail reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError> {
        let body = SendEmailRequest {
            from: &self.from,
            to: [&message.to],
            subject: &message.subject,
            text: &message.text,
            html: &message.html,
        };

        let resp = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(to = %message.to, "mail accepted by provider");
        Ok(())
    }
}
