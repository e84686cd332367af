//! WhatsApp automation bridge client — delivers text messages through one or
//! more bridge hosts with health-gated failover and bounded retry.
//!
//! Bridge contract (paths relative to the configured prefix):
//! - `GET  {prefix}/health`       -> `{connected, status}`
//! - `POST {prefix}/send-message` -> `{success, id?, error?}`

use crate::hosts::{HostSelector, RoundRobin};
use campaign_core::config::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no host available")]
    NoHostAvailable,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The bridge answered and refused the message.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<BridgeError> },

    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Timeout-class failures are worth another attempt; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Fixed-delay retry for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_retries: config.max_retry_attempts,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, error: &BridgeError, attempts: u32) -> bool {
        error.is_transient() && attempts <= self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    fn down(error: String) -> Self {
        Self {
            connected: false,
            status: "error".to_string(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHealth {
    pub host: String,
    #[serde(flatten)]
    pub health: HealthReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub host: String,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    phone: &'a str,
    message: &'a str,
    #[serde(rename = "isGroup")]
    is_group: bool,
    typing: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

pub struct WhatsAppBridge {
    http: reqwest::Client,
    hosts: Vec<String>,
    api_prefix: String,
    selector: Arc<dyn HostSelector>,
    retry: RetryPolicy,
}

impl WhatsAppBridge {
    /// Client with round-robin host selection.
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_selector(config, Arc::new(RoundRobin::new()))
    }

    pub fn with_selector(
        config: &BridgeConfig,
        selector: Arc<dyn HostSelector>,
    ) -> Result<Self, BridgeError> {
        if config.hosts.is_empty() {
            return Err(BridgeError::Config("no bridge hosts configured".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        let hosts: Vec<String> = config
            .hosts
            .iter()
            .map(|h| h.trim_end_matches('/').to_string())
            .collect();

        info!(
            hosts = ?hosts,
            timeout_ms = config.request_timeout_ms,
            max_retries = config.max_retry_attempts,
            "WhatsApp bridge client initialized"
        );

        Ok(Self {
            http,
            hosts,
            api_prefix: normalize_prefix(&config.api_prefix),
            selector,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn url(&self, host: &str, endpoint: &str) -> String {
        format!("{}{}{}", host, self.api_prefix, endpoint)
    }

    /// Probe one host, or the host the selector picks when none is given.
    pub async fn check_health(&self, host: Option<&str>) -> HealthReport {
        let host = match host.or_else(|| self.selector.select(&self.hosts)) {
            Some(h) => h,
            None => return HealthReport::down("no hosts configured".to_string()),
        };

        let response = match self.http.get(self.url(host, "/health")).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(host = %host, error = %e, "Bridge health probe failed");
                return HealthReport::down(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return HealthReport::down(format!("HTTP {}", status.as_u16()));
        }
        match response.json::<HealthReport>().await {
            Ok(report) => report,
            Err(e) => HealthReport::down(format!("invalid health response: {e}")),
        }
    }

    /// First configured host whose probe reports connected.
    pub async fn get_best_host(&self) -> Option<&str> {
        for host in &self.hosts {
            if self.check_health(Some(host)).await.connected {
                return Some(host.as_str());
            }
        }
        None
    }

    /// Health of every configured host, in configuration order.
    pub async fn probe_all(&self) -> Vec<HostHealth> {
        let mut statuses = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            statuses.push(HostHealth {
                host: host.clone(),
                health: self.check_health(Some(host)).await,
            });
        }
        statuses
    }

    /// Deliver a text message. Timeout-class failures are retried per the
    /// retry policy; rejections fail immediately.
    pub async fn send_message(
        &self,
        phone: &str,
        message: &str,
        typing: bool,
    ) -> Result<SendReceipt, BridgeError> {
        let mut attempts = 0u32;
        loop {
            let host = self
                .get_best_host()
                .await
                .ok_or(BridgeError::NoHostAvailable)?;
            attempts += 1;

            match self.post_message(host, phone, message, typing).await {
                Ok(message_id) => {
                    debug!(host = %host, attempts, "Message accepted by bridge");
                    return Ok(SendReceipt {
                        message_id,
                        host: host.to_string(),
                        attempts,
                    });
                }
                Err(e) if self.retry.should_retry(&e, attempts) => {
                    warn!(
                        host = %host,
                        attempt = attempts,
                        max_retries = self.retry.max_retries,
                        error = %e,
                        "Transient bridge failure, retrying"
                    );
                    metrics::counter!("bridge.retries").increment(1);
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(BridgeError::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_message(
        &self,
        host: &str,
        phone: &str,
        message: &str,
        typing: bool,
    ) -> Result<Option<String>, BridgeError> {
        let body = SendMessageRequest {
            phone,
            message,
            is_group: false,
            typing,
        };
        let response = self
            .http
            .post(self.url(host, "/send-message"))
            .json(&body)
            .send()
            .await
            .map_err(BridgeError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let fallback = format!("HTTP {}", status.as_u16());
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error)
                .unwrap_or(fallback);
            return Err(BridgeError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SendMessageResponse =
            response.json().await.map_err(BridgeError::from_reqwest)?;
        if parsed.success {
            Ok(parsed.id)
        } else {
            Err(BridgeError::Rejected {
                status: status.as_u16(),
                message: parsed
                    .error
                    .unwrap_or_else(|| "bridge reported failure".to_string()),
            })
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
