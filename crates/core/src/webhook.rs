//! Signed delivery of the terminal job payload to the caller's callback URL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::logging::redact_sensitive_text;
use crate::retry::{Sleeper, ThreadSleeper};
use crate::signing::RequestSigner;
use crate::types::WebhookPayload;

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    signer: RequestSigner,
    max_retries: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("signer", &self.signer)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl WebhookNotifier {
    pub fn new(signer: RequestSigner, config: &WebhookConfig) -> Result<Self> {
        Self::with_timeout(
            signer,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )
    }

    pub fn with_timeout(signer: RequestSigner, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for webhooks")?;

        Ok(Self {
            client,
            signer,
            max_retries,
            sleeper: Arc::new(ThreadSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// One signed POST. Transport failures and non-2xx responses are errors.
    pub fn send(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        let body = payload
            .to_json()
            .context("failed to serialize webhook payload")?;
        let headers = self.signer.webhook_headers(&body);

        let mut request = self.client.post(url);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .with_context(|| format!("webhook request to {} failed", redact_sensitive_text(url)))?;
        let status = response.status();
        response.error_for_status().with_context(|| {
            format!(
                "webhook endpoint {} returned HTTP {}",
                redact_sensitive_text(url),
                status.as_u16()
            )
        })?;

        info!(
            job_id = %payload.job_id,
            status = status.as_u16(),
            "Webhook delivered"
        );
        Ok(())
    }

    /// Makes one attempt plus up to `max_retries` retries, sleeping `2^n` seconds before
    /// retry `n >= 1`. Returns whether delivery succeeded; never fails.
    pub fn send_with_retry(&self, url: &str, payload: &WebhookPayload) -> bool {
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = Duration::from_secs(2u64.saturating_pow(attempt));
                warn!(
                    job_id = %payload.job_id,
                    attempt,
                    delay_s = delay.as_secs(),
                    "Retrying webhook delivery"
                );
                self.sleeper.sleep(delay);
            }

            match self.send(url, payload) {
                Ok(()) => return true,
                Err(error) => warn!(
                    job_id = %payload.job_id,
                    attempt,
                    max_attempts = attempts,
                    error = %format!("{error:#}"),
                    "Webhook delivery attempt failed"
                ),
            }
        }

        warn!(
            job_id = %payload.job_id,
            attempts,
            "Webhook delivery failed after all attempts"
        );
        false
    }
}
