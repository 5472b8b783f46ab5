//! Message broker client (RabbitMQ management HTTP API).
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached at the transport level.
    #[error("broker unreachable: {0}")]
    Unavailable(String),
    #[error("broker request timed out")]
    Timeout,
    /// The broker answered but refused the message (bad credentials,
    /// missing exchange, or an unroutable routing key).
    #[error("broker rejected publish: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Transport-level loss of the broker, as opposed to a refused or
    /// unroutable message. The publisher suspends claiming on these.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout)
    }
}

/// Delivery seam between the publisher and the outside world. `publish`
/// returns Ok only after the broker acknowledged routing the message.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: i64,
        payload: &str,
    ) -> Result<(), BrokerError>;

    /// Cheap reachability probe used while waiting out an outage.
    async fn ping(&self) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct HttpBroker {
    http: Client,
    base_url: Url,
    vhost: String,
    username: String,
    password: String,
}

impl fmt::Debug for HttpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBroker")
            .field("base_url", &self.base_url)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpBroker {
    pub fn from_config(cfg: &config::Broker) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.api_url).context("invalid broker.api_url")?;
        Ok(Self::with_base_url(
            base_url,
            cfg.vhost.clone(),
            cfg.username.clone(),
            cfg.password.clone(),
            Duration::from_millis(cfg.publish_timeout_ms),
        ))
    }

    pub fn with_base_url(
        base_url: Url,
        vhost: String,
        username: String,
        password: String,
        timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .user_agent("activity-relay/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            vhost,
            username,
            password,
        }
    }

    pub fn build_publish_request(
        &self,
        exchange: &str,
        body: &Value,
    ) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!(
                "api/exchanges/{}/{}/publish",
                encode_path_segment(&self.vhost),
                encode_path_segment(exchange),
            ))
            .context("invalid broker base URL")?;
        self.http
            .post(endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build publish request")
    }

    async fn execute_publish(
        &self,
        exchange: &str,
        body: Value,
    ) -> Result<(), BrokerError> {
        let request = self
            .build_publish_request(exchange, &body)
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;
        debug!(url = %request.url(), "publishing to broker");

        let res = self.http.execute(request).await.map_err(classify)?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BrokerError::Rejected(format!(
                "authentication failed ({status})"
            )));
        }
        if status.is_server_error() {
            let text = res.text().await.unwrap_or_default();
            return Err(BrokerError::Unavailable(format!("{status}: {text}")));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(%status, "broker refused publish: {}", text);
            return Err(BrokerError::Rejected(format!("{status}: {text}")));
        }

        let payload: PublishResponse = res
            .json()
            .await
            .map_err(|e| BrokerError::Rejected(format!("invalid publish response: {e}")))?;
        if !payload.routed {
            return Err(BrokerError::Rejected("message was not routed".to_string()));
        }
        Ok(())
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: i64,
        payload: &str,
    ) -> Result<(), BrokerError> {
        let body = build_publish_body(routing_key, message_id, payload);
        self.execute_publish(exchange, body).await
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let endpoint = self
            .base_url
            .join(&format!(
                "api/aliveness-test/{}",
                encode_path_segment(&self.vhost)
            ))
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;
        let res = self
            .http
            .get(endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(classify)?;
        if !res.status().is_success() {
            return Err(BrokerError::Unavailable(format!(
                "aliveness test returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: i64,
        payload: &str,
    ) -> Result<(), BrokerError> {
        HttpBroker::publish(self, exchange, routing_key, message_id, payload).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        HttpBroker::ping(self).await
    }
}

/// Publish body for the management API. The outbox entry id rides along
/// as the AMQP message id so consumers can deduplicate redeliveries; the
/// payload itself stays the bare activity snapshot.
pub fn build_publish_body(routing_key: &str, message_id: i64, payload: &str) -> Value {
    json!({
        "properties": {
            "message_id": message_id.to_string(),
            "delivery_mode": 2,
            "content_type": "application/json",
        },
        "routing_key": routing_key,
        "payload": payload,
        "payload_encoding": "string",
    })
}

fn classify(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout
    } else {
        BrokerError::Unavailable(err.to_string())
    }
}

/// Percent-encode one path segment (the default vhost is `/`).
fn encode_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Deserialize)]
struct PublishResponse {
    routed: bool,
}
