//! Web Push delivery with VAPID authentication.
//!
//! Messages carry no payload: the push wakes the device, which then reads
//! its notifications through the normal REST path. That keeps the transport
//! free of per-subscription payload encryption.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::Serialize;

use crate::config::PushConfig;
use crate::models::notification::Notification;
use crate::models::push_subscription::PushSubscription;

/// Lifetime of a signed VAPID token. Push services reject anything over 24h.
const VAPID_TOKEN_TTL_SECS: i64 = 12 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The endpoint no longer exists; its subscription should be removed.
    PermanentlyFailed,
    TransientFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid VAPID private key: {0}")]
    InvalidPrivateKey(#[source] jsonwebtoken::errors::Error),
    #[error("invalid VAPID public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid push endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to sign VAPID token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Push-service collaborator. Implementations never return errors: every
/// failure is classified into a [`PushOutcome`].
#[async_trait]
pub trait PushService: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, notification: &Notification)
        -> PushOutcome;

    /// `false` when no push credentials are configured.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Used when VAPID keys are not configured.
pub struct DisabledPush;

#[async_trait]
impl PushService for DisabledPush {
    async fn send(&self, _: &PushSubscription, _: &Notification) -> PushOutcome {
        PushOutcome::TransientFailure
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize)]
struct VapidClaims<'a> {
    aud: &'a str,
    exp: i64,
    sub: &'a str,
}

pub struct WebPushClient {
    http: reqwest::Client,
    key: EncodingKey,
    public_key: String,
    subject: String,
    ttl_secs: u32,
}

impl WebPushClient {
    pub fn new(
        private_key_pem: &str,
        public_key: &str,
        config: &PushConfig,
    ) -> Result<Self, PushError> {
        let key =
            EncodingKey::from_ec_pem(private_key_pem.as_bytes()).map_err(PushError::InvalidPrivateKey)?;

        // Uncompressed P-256 point: 0x04 || X || Y.
        let raw = URL_SAFE_NO_PAD
            .decode(public_key.trim())
            .map_err(|e| PushError::InvalidPublicKey(e.to_string()))?;
        if raw.len() != 65 || raw[0] != 0x04 {
            return Err(PushError::InvalidPublicKey(format!(
                "expected 65-byte uncompressed point, got {} bytes",
                raw.len()
            )));
        }

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            key,
            public_key: public_key.trim().to_string(),
            subject: config.vapid_subject.clone(),
            ttl_secs: config.ttl_secs,
        })
    }

    /// `Authorization` header value for a request to `endpoint`.
    fn authorization(&self, endpoint: &str) -> Result<String, PushError> {
        let audience = push_audience(endpoint)?;
        let claims = VapidClaims {
            aud: &audience,
            exp: chrono::Utc::now().timestamp() + VAPID_TOKEN_TTL_SECS,
            sub: &self.subject,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.key)
            .map_err(PushError::Signing)?;
        Ok(format!("vapid t={}, k={}", token, self.public_key))
    }
}

#[async_trait]
impl PushService for WebPushClient {
    async fn send(&self, subscription: &PushSubscription, notification: &Notification) -> PushOutcome {
        let endpoint = subscription.endpoint.as_str();
        let auth = match self.authorization(endpoint) {
            Ok(a) => a,
            Err(e @ PushError::InvalidEndpoint(_)) => {
                tracing::info!(endpoint, error = %e, "unusable push endpoint");
                return PushOutcome::PermanentlyFailed;
            }
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "could not authorize push");
                return PushOutcome::TransientFailure;
            }
        };

        let result = self
            .http
            .post(endpoint)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header("TTL", self.ttl_secs.to_string())
            .header("Urgency", "normal")
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await;

        match result {
            Ok(resp) => {
                let outcome = classify_status(resp.status());
                tracing::debug!(
                    endpoint,
                    notification_id = notification.id,
                    status = resp.status().as_u16(),
                    ?outcome,
                    "push sent"
                );
                outcome
            }
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "push request failed");
                PushOutcome::TransientFailure
            }
        }
    }
}

/// Maps a push service response code to an outcome. Only 404 and 410 mean
/// the subscription is gone for good.
pub fn classify_status(status: StatusCode) -> PushOutcome {
    if status.is_success() {
        PushOutcome::Delivered
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        PushOutcome::PermanentlyFailed
    } else {
        PushOutcome::TransientFailure
    }
}

/// VAPID audience: the origin of the push endpoint.
fn push_audience(endpoint: &str) -> Result<String, PushError> {
    let url =
        reqwest::Url::parse(endpoint).map_err(|e| PushError::InvalidEndpoint(e.to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(PushError::InvalidEndpoint(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(PushError::InvalidEndpoint("missing host".to_string()));
    }
    Ok(url.origin().ascii_serialization())
}

/// Picks the transport from configuration.
pub fn from_config(config: &PushConfig) -> Result<std::sync::Arc<dyn PushService>, PushError> {
    match (&config.vapid_private_key_pem, &config.vapid_public_key) {
        (Some(pem), Some(public)) => Ok(std::sync::Arc::new(WebPushClient::new(pem, public, config)?)),
        _ => {
            tracing::info!("VAPID keys not configured, push delivery disabled");
            Ok(std::sync::Arc::new(DisabledPush))
        }
    }
}

/// Bounds a single push call.
pub async fn send_with_timeout(
    push: &dyn PushService,
    subscription: &PushSubscription,
    notification: &Notification,
    limit: Duration,
) -> PushOutcome {
    match tokio::time::timeout(limit, push.send(subscription, notification)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(endpoint = %subscription.endpoint, ?limit, "push timed out");
            PushOutcome::TransientFailure
        }
    }
}
