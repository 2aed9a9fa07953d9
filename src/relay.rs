use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{ConfigPatch, ConfigStore, ServiceConfig};
use crate::http::{self, Upstream, UpstreamError};
use crate::types::RateLimitInfo;

/// Why the readiness gate turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotReady {
    #[error("API key not configured. Run with --setup first.")]
    MissingCredential,
    #[error("Consent not acknowledged. Run with --setup to accept.")]
    ConsentNotGiven,
}

/// Everything that can go wrong while serving a relay operation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    NotReady(#[from] NotReady),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("configuration not persisted: {0}")]
    Persistence(String),
}

/// The readiness gate: a key must be configured and consent given. Checked
/// in that order, so a missing key masks missing consent.
pub fn readiness(config: &ServiceConfig) -> Result<(), NotReady> {
    if config.api_key.as_deref().map_or(true, str::is_empty) {
        return Err(NotReady::MissingCredential);
    }
    if !config.consent_acknowledged {
        return Err(NotReady::ConsentNotGiven);
    }
    Ok(())
}

/// Core of the relay: owns the configuration, the rate-limit snapshot and
/// the upstream client. One instance is built at startup and shared by every
/// request handler.
pub struct RelayService {
    config: RwLock<ServiceConfig>,
    rate_limit: RwLock<RateLimitInfo>,
    store: ConfigStore,
    upstream: Upstream,
}

impl RelayService {
    pub fn new(config: ServiceConfig, store: ConfigStore, upstream: Upstream) -> Self {
        Self {
            config: RwLock::new(config),
            rate_limit: RwLock::new(RateLimitInfo::default()),
            store,
            upstream,
        }
    }

    /// Copy of the current configuration.
    pub async fn config_snapshot(&self) -> ServiceConfig {
        self.config.read().await.clone()
    }

    /// Copy of the last committed rate-limit snapshot.
    pub async fn rate_limit(&self) -> RateLimitInfo {
        self.rate_limit.read().await.clone()
    }

    pub async fn check_readiness(&self) -> Result<(), NotReady> {
        let config = self.config.read().await;
        readiness(&config)
    }

    /// Forward a chat payload upstream and commit the rate-limit snapshot
    /// the response carried. Returns the upstream body verbatim together
    /// with that snapshot.
    ///
    /// The payload's `model` wins; when it names none, the configured
    /// default is written into the outgoing copy. Neither lock is held
    /// across the upstream call.
    pub async fn relay_chat(
        &self,
        mut payload: Map<String, Value>,
    ) -> Result<(Value, RateLimitInfo), RelayError> {
        let (api_key, organization, default_model) = {
            let config = self.config.read().await;
            readiness(&config)?;
            let api_key = config.api_key.clone().ok_or(NotReady::MissingCredential)?;
            (
                api_key,
                config.organization.clone(),
                config.default_model.clone(),
            )
        };

        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
            .unwrap_or(default_model);
        payload
            .entry("model")
            .or_insert_with(|| Value::String(model.clone()));
        debug!("relaying chat completion for model={}", model);

        let payload = Value::Object(payload);
        let outcome = self
            .upstream
            .chat_completion(&api_key, organization.as_deref(), &payload)
            .await?;

        let snapshot = http::extract_rate_limit(&outcome.headers, &model);
        *self.rate_limit.write().await = snapshot.clone();
        Ok((outcome.body, snapshot))
    }

    /// Confirm the configured key against the models endpoint. `Ok(false)`
    /// means no key is configured and nothing was called; an unexpected
    /// upstream status is an error, not `false`.
    pub async fn verify_key(&self) -> Result<bool, RelayError> {
        let (api_key, organization) = {
            let config = self.config.read().await;
            match config.api_key.clone().filter(|k| !k.is_empty()) {
                Some(key) => (key, config.organization.clone()),
                None => return Ok(false),
            }
        };
        self.upstream
            .list_models(&api_key, organization.as_deref())
            .await?;
        Ok(true)
    }

    /// Apply a partial configuration update and write the result through to
    /// disk. The write lock spans the disk write, so concurrent patches
    /// serialize and the file always holds one complete configuration. When
    /// the write fails the in-memory change stays and the error reports the
    /// gap.
    pub async fn apply_config_patch(&self, patch: ConfigPatch) -> Result<(), RelayError> {
        let mut config = self.config.write().await;
        config.apply_patch(patch);
        self.store
            .save(&config)
            .map_err(|e| RelayError::Persistence(e.to_string()))?;
        Ok(())
    }
}
