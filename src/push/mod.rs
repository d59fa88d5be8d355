//! Push notification fan-out
//!
//! Looks up every registered token for the target user and sends in
//! parallel. Each delivery is independent: transient failures retry with
//! exponential backoff, permanently unregistered tokens are removed from
//! the store, and one bad endpoint never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{FcmConfig, TimeoutConfig};
use crate::store::FcmDeviceStore;

/// Delivery failure classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The provider no longer knows this token; drop it from the store
    Unregistered,
    /// Worth retrying (5xx, timeout, connection reset)
    Transient(String),
    /// Not worth retrying (bad credentials, malformed payload)
    Fatal(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Unregistered => write!(f, "token unregistered"),
            PushError::Transient(e) => write!(f, "transient: {}", e),
            PushError::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

/// One push provider endpoint
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        device_token: &str,
        title: &str,
        data: &HashMap<String, String>,
    ) -> Result<(), PushError>;
}

/// FCM HTTP sender
pub struct FcmHttpSender {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl FcmHttpSender {
    pub fn new(config: &FcmConfig, send_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(send_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.endpoint.clone(),
            server_key: config.server_key.clone(),
        }
    }
}

#[async_trait]
impl PushSender for FcmHttpSender {
    async fn send(
        &self,
        device_token: &str,
        title: &str,
        data: &HashMap<String, String>,
    ) -> Result<(), PushError> {
        let body = serde_json::json!({
            "to": device_token,
            "notification": { "title": title },
            "data": data,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PushError::Transient(format!("provider returned {}", status)));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PushError::Fatal("provider rejected credentials".to_string()));
        }
        if !status.is_success() {
            return Err(PushError::Fatal(format!("provider returned {}", status)));
        }

        // The legacy send endpoint reports per-token errors in the body
        let text = response.text().await.unwrap_or_default();
        if text.contains("NotRegistered") || text.contains("InvalidRegistration") {
            return Err(PushError::Unregistered);
        }

        Ok(())
    }
}

/// Fan-out service used by the ingestion pipeline
#[derive(Clone)]
pub struct PushService {
    sender: Arc<dyn PushSender>,
    devices: FcmDeviceStore,
    max_retries: u32,
    base_backoff: Duration,
}

impl PushService {
    pub fn new(sender: Arc<dyn PushSender>, devices: FcmDeviceStore, config: &FcmConfig) -> Self {
        Self {
            sender,
            devices,
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(250),
        }
    }

    /// Standard production wiring: FCM over HTTP with the configured timeout
    pub fn with_http_sender(
        devices: FcmDeviceStore,
        config: &FcmConfig,
        timeouts: &TimeoutConfig,
    ) -> Self {
        let sender = Arc::new(FcmHttpSender::new(
            config,
            Duration::from_secs(timeouts.push_send_secs),
        ));
        Self::new(sender, devices, config)
    }

    #[cfg(test)]
    fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Send a push to every device of `user_id`; returns how many deliveries
    /// succeeded
    pub async fn notify_user(
        &self,
        user_id: i64,
        title: &str,
        data: HashMap<String, String>,
    ) -> usize {
        let tokens = match self.devices.tokens_for_user(user_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(user_id, "token lookup failed: {}", e);
                return 0;
            }
        };

        if tokens.is_empty() {
            debug!(user_id, "no push tokens registered");
            return 0;
        }

        info!(user_id, tokens = tokens.len(), title, "fanning out push");

        let deliveries = tokens
            .iter()
            .map(|token| self.deliver(token, title, &data));
        let results = futures::future::join_all(deliveries).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    async fn deliver(&self, token: &str, title: &str, data: &HashMap<String, String>) -> bool {
        for attempt in 0..=self.max_retries {
            match self.sender.send(token, title, data).await {
                Ok(()) => {
                    debug!(token = %redact(token), "push delivered");
                    return true;
                }
                Err(PushError::Unregistered) => {
                    info!(token = %redact(token), "token unregistered, removing");
                    if let Err(e) = self.devices.delete_token(token).await {
                        warn!("failed to remove dead token: {}", e);
                    }
                    return false;
                }
                Err(PushError::Fatal(reason)) => {
                    warn!(token = %redact(token), %reason, "push failed permanently");
                    return false;
                }
                Err(PushError::Transient(reason)) => {
                    if attempt == self.max_retries {
                        warn!(token = %redact(token), %reason, "push failed after retries");
                        return false;
                    }
                    let backoff = self.backoff(attempt);
                    debug!(token = %redact(token), %reason, ?backoff, "push send retry");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        false
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff * 2u32.saturating_pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 4);
        base + Duration::from_millis(jitter)
    }
}

/// Tokens are credentials; only log a prefix
fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}
