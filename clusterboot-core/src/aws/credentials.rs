//! Credentials used to sign AWS requests
//!
//! Static credentials come from the environment; otherwise the instance
//! role's temporary credentials are read from instance metadata and cached
//! until shortly before they expire.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::metadata::InstanceMetadataClient;
use crate::error::{BootstrapError, Result};

/// Refresh cached role credentials this long before they expire
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Access key material
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// When temporary credentials stop working
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Create credentials without an expiry
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            expires_at: None,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_key_id = lookup("AWS_ACCESS_KEY_ID").filter(|v| !v.is_empty())?;
        let secret_access_key = lookup("AWS_SECRET_ACCESS_KEY").filter(|v| !v.is_empty())?;
        let session_token = lookup("AWS_SESSION_TOKEN").filter(|v| !v.is_empty());
        Some(Self::new(access_key_id, secret_access_key, session_token))
    }

    /// True if the credentials expire within the refresh margin of `now`
    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => expiry - ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) <= now,
            None => false,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Instance role credential record as served by instance metadata
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleCredentials {
    pub code: String,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default, rename = "Type")]
    pub kind: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

impl RoleCredentials {
    /// True when metadata reports the record as usable
    pub fn is_success(&self) -> bool {
        self.code == "Success"
    }

    /// Convert into signing credentials
    pub fn to_credentials(&self) -> Credentials {
        let expires_at = self
            .expiration
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Credentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: Some(self.token.clone()),
            expires_at,
        }
    }
}

/// Only the non-secret part of the record is ever printed
impl fmt::Debug for RoleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCredentials")
            .field("code", &self.code)
            .field("last_updated", &self.last_updated)
            .field("type", &self.kind)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Source of signing credentials
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Instance role credentials from metadata, cached until near expiry
pub struct InstanceRoleCredentials {
    metadata: Arc<InstanceMetadataClient>,
    role: String,
    cached: Mutex<Option<Credentials>>,
}

impl InstanceRoleCredentials {
    pub fn new(metadata: Arc<InstanceMetadataClient>, role: impl Into<String>) -> Self {
        Self {
            metadata,
            role: role.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialsProvider for InstanceRoleCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref() {
            if !credentials.expires_soon(Utc::now()) {
                return Ok(credentials.clone());
            }
            debug!("Cached credentials for role {} expire soon, refreshing", self.role);
        }

        let record = self
            .metadata
            .role_credentials(&self.role)
            .await?
            .filter(RoleCredentials::is_success)
            .ok_or_else(|| BootstrapError::CredentialsUnavailable {
                reason: format!("no credentials for instance role {}", self.role),
            })?;

        info!("Loaded credentials for instance role {}: {:?}", self.role, record);
        let credentials = record.to_credentials();
        *cached = Some(credentials.clone());
        Ok(credentials)
    }
}

/// Environment credentials if present, instance role credentials otherwise
pub fn default_provider<F>(
    lookup: F,
    metadata: Arc<InstanceMetadataClient>,
    role: &str,
) -> Arc<dyn CredentialsProvider>
where
    F: Fn(&str) -> Option<String>,
{
    match Credentials::from_lookup(lookup) {
        Some(credentials) => {
            info!("Using static credentials from environment: {:?}", credentials);
            Arc::new(StaticCredentials::new(credentials))
        }
        None => Arc::new(InstanceRoleCredentials::new(metadata, role)),
    }
}
