//! Entry point for activity tracking: validate, persist, hand off.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config;
use crate::db::{store, Pool};
use crate::error::{Error, Result};
use crate::model::{Activity, NewActivity};

/// External collaborator answering "does this user exist and may they
/// track activities". Any error is treated as a rejection downstream.
#[async_trait]
pub trait UserValidator: Send + Sync {
    async fn validate_user(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// HTTP implementation calling the user service.
#[derive(Debug, Clone)]
pub struct HttpUserValidator {
    http: Client,
    base_url: Url,
}

impl HttpUserValidator {
    pub fn from_config(cfg: &config::Validator) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid validator.base_url")?;
        Ok(Self::with_base_url(
            base_url,
            Duration::from_millis(cfg.timeout_ms),
        ))
    }

    pub fn with_base_url(base_url: Url, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("activity-relay/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    fn endpoint(&self, user_id: &str) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("validator base URL cannot be a base"))?
            .pop_if_empty()
            .extend(["api", "users", user_id, "validate"]);
        Ok(url)
    }
}

#[async_trait]
impl UserValidator for HttpUserValidator {
    async fn validate_user(&self, user_id: &str) -> anyhow::Result<bool> {
        let url = self.endpoint(user_id)?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("failed to reach user service")?;
        if !res.status().is_success() {
            anyhow::bail!("user service returned {}", res.status());
        }
        let valid: bool = res
            .json()
            .await
            .context("invalid user service response")?;
        Ok(valid)
    }
}

/// Orchestrates activity creation: request-shape checks, user validation
/// (failing closed), then the atomic persist-and-enqueue. Publishing is
/// someone else's job; a successful return only promises durable storage
/// and an eventual delivery attempt.
pub struct ActivityGateway {
    pool: Pool,
    validator: Arc<dyn UserValidator>,
}

impl ActivityGateway {
    pub fn new(pool: Pool, validator: Arc<dyn UserValidator>) -> Self {
        Self { pool, validator }
    }

    #[instrument(skip_all, fields(user_id = %new.user_id))]
    pub async fn track_activity(&self, new: &NewActivity) -> Result<Activity> {
        // Shape checks come first; a malformed request is rejected the
        // same way whether or not the validator is reachable.
        store::validate_new_activity(new)?;

        let valid = match self.validator.validate_user(&new.user_id).await {
            Ok(valid) => valid,
            Err(err) => {
                warn!(error = %err, "user validation unavailable, failing closed");
                false
            }
        };
        if !valid {
            return Err(Error::InvalidUser(new.user_id.clone()));
        }

        let activity = store::create_activity(&self.pool, new).await?;
        info!(activity_id = %activity.id, "activity tracked");
        Ok(activity)
    }

    pub async fn get_activity(&self, id: &str) -> Result<Activity> {
        store::get_activity(&self.pool, id).await
    }

    pub async fn list_activities(&self, user_id: &str) -> Result<Vec<Activity>> {
        store::list_activities_by_user(&self.pool, user_id).await
    }
}
