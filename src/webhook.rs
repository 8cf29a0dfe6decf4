use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{Candidate, ThreadMessage};

#[derive(Debug, Serialize)]
struct ApprovedCandidate<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    match_id: Option<&'a str>,
    candidate_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ApprovalRequest<'a> {
    job_id: &'a str,
    approved_candidates: Vec<ApprovedCandidate<'a>>,
    manager_notes: &'a str,
}

#[derive(Debug, Serialize)]
struct ReplyRequest<'a> {
    job_id: &'a str,
    reply_body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ThreadsResponse {
    #[serde(default)]
    threads: Vec<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// What the relay answered for a thread refresh.
#[derive(Debug)]
pub enum ThreadFetch {
    Messages(Vec<ThreadMessage>),
    /// The relay has no upstream; local threads stay as they are.
    Fallback(String),
}

/// Outbound calls to the automation workflow and the relay. Nothing here is
/// retried; failures go back to whoever asked.
pub struct WebhookClient {
    client: reqwest::blocking::Client,
    approval_url: String,
    reply_url: String,
    relay_url: String,
    api_key: Option<String>,
}

impl WebhookClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            approval_url: config.approval_url.clone(),
            reply_url: config.reply_url.clone(),
            relay_url: config.relay_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    /// Posts `approved` for `job_id`. Returns how many were sent.
    pub fn send_approvals(&self, job_id: &str, approved: &[Candidate], notes: &str) -> Result<usize> {
        if approved.is_empty() {
            bail!("No candidates approved for job {}", job_id);
        }

        let request = ApprovalRequest {
            job_id,
            approved_candidates: approved
                .iter()
                .map(|c| ApprovedCandidate {
                    match_id: c.match_id.as_deref(),
                    candidate_id: &c.candidate_id,
                })
                .collect(),
            manager_notes: notes,
        };
        self.post(&self.approval_url, &request)
            .context("Failed to send approvals")?;
        info!(job_id, count = approved.len(), "Approvals sent");
        Ok(approved.len())
    }

    pub fn send_reply(&self, job_id: &str, body: &str) -> Result<()> {
        if body.trim().is_empty() {
            bail!("Reply body is empty");
        }
        let request = ReplyRequest {
            job_id,
            reply_body: body,
        };
        self.post(&self.reply_url, &request)
            .context("Failed to send reply")?;
        info!(job_id, "Reply sent");
        Ok(())
    }

    /// Asks the relay for the thread history of `job_id`.
    pub fn fetch_threads(&self, job_id: &str) -> Result<ThreadFetch> {
        let url = format!("{}/api/get-threads", self.relay_url);
        let response = self
            .client
            .get(&url)
            .query(&[("job_id", job_id)])
            .send()
            .with_context(|| format!("Failed to reach relay at {}", self.relay_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Thread refresh failed with status {}: {}",
                status,
                error_text
            ));
        }

        let body: ThreadsResponse = response
            .json()
            .context("Failed to parse thread refresh response")?;
        if let Some(message) = body.message {
            debug!(job_id, %message, "Relay returned fallback");
            return Ok(ThreadFetch::Fallback(message));
        }

        let mut messages = Vec::with_capacity(body.threads.len());
        for raw in body.threads {
            let message: ThreadMessage =
                serde_json::from_value(raw).context("Relay returned a malformed thread message")?;
            messages.push(message);
        }
        Ok(ThreadFetch::Messages(messages))
    }

    fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header("X-API-Key", key);
        }
        let response = request
            .send()
            .with_context(|| format!("Request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("Webhook returned status {}: {}", status, error_text));
        }
        Ok(())
    }
}
