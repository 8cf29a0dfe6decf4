use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:8888";
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8888";
pub const DEFAULT_APPROVAL_URL: &str = "https://n8n.352674918.xyz/webhook/mailtrix-approval";
pub const DEFAULT_REPLY_URL: &str = "https://n8n.352674918.xyz/webhook/mailtrix-reply";
pub const DEFAULT_POLL_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub bind: SocketAddr,
    pub relay_url: String,
    pub approval_url: String,
    pub reply_url: String,
    pub threads_url: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub stage: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = var("MAILTRIX_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("MAILTRIX_BIND is not a socket address: {}", bind))?;

        let poll_secs = match var("MAILTRIX_POLL_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("MAILTRIX_POLL_SECS is not a number: {}", v))?,
            None => DEFAULT_POLL_SECS,
        };

        Ok(Self {
            db_path: var("MAILTRIX_DB").map(PathBuf::from),
            bind,
            relay_url: var("MAILTRIX_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            approval_url: var("N8N_WEBHOOK_URL").unwrap_or_else(|| DEFAULT_APPROVAL_URL.to_string()),
            reply_url: var("N8N_REPLY_URL").unwrap_or_else(|| DEFAULT_REPLY_URL.to_string()),
            threads_url: var("N8N_GET_THREADS_URL"),
            api_key: var("APPROVAL_API_KEY"),
            poll_interval: Duration::from_secs(poll_secs.max(1)),
            stage: var("MAILTRIX_STAGE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        })
    }
}
