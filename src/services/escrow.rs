//! Escrow provider client.
//!
//! Holds are opened when a budget is approved (one per milestone), released
//! when the client pays a milestone out, and voided when a milestone is
//! cancelled or an approval has to be rolled back. Escrow references are
//! opaque; they are stored and passed back, never interpreted.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::milestones::EscrowRef;
use crate::error::ApiError;

#[derive(Debug, Clone, Error)]
pub enum EscrowError {
    /// Timeouts, connection failures and 5xx answers; safe to retry later.
    #[error("escrow provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the operation; retrying will not help.
    #[error("escrow provider rejected the request: {0}")]
    Rejected(String),
}

impl EscrowError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        ApiError::Escrow {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

/// What a hold is for. The provider de-duplicates opens on `idempotency_key`,
/// which is scoped to one approval attempt so a losing concurrent attempt
/// never shares holds with the winner.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowHoldRequest {
    pub attempt_id: Uuid,
    pub budget_id: Uuid,
    pub sequence_number: i32,
    pub amount: Decimal,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
}

impl EscrowHoldRequest {
    pub fn idempotency_key(&self) -> String {
        format!("hold:{}:{}", self.attempt_id, self.sequence_number)
    }
}

#[async_trait]
pub trait EscrowProvider: Send + Sync {
    async fn open_escrow(&self, request: &EscrowHoldRequest) -> Result<EscrowRef, EscrowError>;

    /// Pays the held funds out to the provider. Repeating a release for the
    /// same reference must not pay twice.
    async fn release(&self, escrow: &EscrowRef) -> Result<(), EscrowError>;

    /// Voids a hold without paying anyone.
    async fn cancel(&self, escrow: &EscrowRef) -> Result<(), EscrowError>;
}

/// HTTP client for the escrow provider with bounded retries.
#[derive(Clone)]
pub struct HttpEscrowClient {
    client: Client,
    base_url: url::Url,
    token: String,
    /// Per attempt; the shared client carries no timeout of its own.
    timeout: Duration,
    max_retry: Duration,
}

#[derive(Debug, Deserialize)]
struct OpenEscrowResponse {
    escrow_id: String,
}

#[derive(Debug, Deserialize)]
struct EscrowErrorResponse {
    message: String,
}

impl HttpEscrowClient {
    pub fn new(
        client: Client,
        base_url: url::Url,
        token: &str,
        timeout_seconds: u64,
        max_retry_seconds: u64,
    ) -> anyhow::Result<Self> {
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Escrow base URL '{}' cannot carry paths", base_url);
        }

        tracing::info!(base_url = %base_url, "Escrow client initialized");

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            timeout: Duration::from_secs(timeout_seconds),
            max_retry: Duration::from_secs(max_retry_seconds),
        })
    }

    /// `<base>/v1/escrows[/<ref>/<action>]` with the reference percent-encoded.
    fn endpoint(&self, escrow: Option<&EscrowRef>, action: Option<&str>) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", "escrows"]);
            if let Some(escrow) = escrow {
                segments.push(escrow.as_str());
            }
            if let Some(action) = action {
                segments.push(action);
            }
        }
        url
    }

    /// POSTs with retries on transient failures until `max_retry` elapses.
    async fn post_with_retry<B: Serialize + Sync>(
        &self,
        url: url::Url,
        idempotency_key: &str,
        body: &B,
    ) -> Result<reqwest::Response, EscrowError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(self.max_retry))
            .build();

        backoff::future::retry(policy, || async {
            debug!(url = %url, "Escrow provider request");

            let response = self
                .client
                .post(url.clone())
                .timeout(self.timeout)
                .bearer_auth(&self.token)
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Escrow provider request failed, will retry");
                    backoff::Error::transient(EscrowError::Unavailable(e.to_string()))
                })?;

            let status = response.status();
            if status.is_success() {
                return Ok::<_, backoff::Error<EscrowError>>(response);
            }

            let message = response
                .json::<EscrowErrorResponse>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| format!("status {}", status));

            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                warn!(status = %status, message = %message, "Escrow provider busy, will retry");
                Err(backoff::Error::transient(EscrowError::Unavailable(message)))
            } else {
                Err(backoff::Error::permanent(EscrowError::Rejected(message)))
            }
        })
        .await
    }
}

#[async_trait]
impl EscrowProvider for HttpEscrowClient {
    #[instrument(skip(self, request), fields(budget_id = %request.budget_id, seq = request.sequence_number))]
    async fn open_escrow(&self, request: &EscrowHoldRequest) -> Result<EscrowRef, EscrowError> {
        let response = self
            .post_with_retry(self.endpoint(None, None), &request.idempotency_key(), request)
            .await?;

        let body: OpenEscrowResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::Unavailable(format!("invalid open response: {}", e)))?;

        Ok(EscrowRef(body.escrow_id))
    }

    #[instrument(skip(self, escrow), fields(escrow = %escrow))]
    async fn release(&self, escrow: &EscrowRef) -> Result<(), EscrowError> {
        let key = format!("release:{}", escrow);
        self.post_with_retry(self.endpoint(Some(escrow), Some("release")), &key, &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, escrow), fields(escrow = %escrow))]
    async fn cancel(&self, escrow: &EscrowRef) -> Result<(), EscrowError> {
        let key = format!("cancel:{}", escrow);
        self.post_with_retry(self.endpoint(Some(escrow), Some("cancel")), &key, &serde_json::json!({}))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpEscrowClient {
        HttpEscrowClient::new(Client::new(), base.parse().unwrap(), "token", 5, 1).unwrap()
    }

    #[test]
    fn endpoints_encode_opaque_references() {
        let c = client("https://escrow.example.com/api/");
        let url = c.endpoint(Some(&EscrowRef("esc/42 a".into())), Some("release"));
        assert_eq!(
            url.as_str(),
            "https://escrow.example.com/api/v1/escrows/esc%2F42%20a/release"
        );
        assert_eq!(
            c.endpoint(None, None).as_str(),
            "https://escrow.example.com/api/v1/escrows"
        );
    }

    #[test]
    fn only_unavailable_is_retryable() {
        let err: ApiError = EscrowError::Unavailable("timeout".into()).into();
        assert!(matches!(err, ApiError::Escrow { retryable: true, .. }));
        let err: ApiError = EscrowError::Rejected("insufficient funds".into()).into();
        assert!(matches!(err, ApiError::Escrow { retryable: false, .. }));
    }

    #[test]
    fn hold_key_is_scoped_to_attempt() {
        let req = EscrowHoldRequest {
            attempt_id: Uuid::nil(),
            budget_id: Uuid::new_v4(),
            sequence_number: 2,
            amount: Decimal::new(3750, 2),
            payer_id: Uuid::nil(),
            payee_id: Uuid::nil(),
        };
        assert_eq!(
            req.idempotency_key(),
            "hold:00000000-0000-0000-0000-000000000000:2"
        );
    }
}
