// ============================================================================
// CARD PROVIDER CLIENT
// ============================================================================
//
// HTTP client for the external card-issuing provider. This is a network
// boundary: nothing here runs inside a ledger transaction, and the ledger
// never trusts the provider for balances.
//
// Auth: bearer access token obtained with an OAuth-style code exchange,
// cached process-wide and refreshed on demand with a 60 second expiry
// margin. All calls carry a fixed 10 second timeout.
//
// Responses use the provider envelope { code, message, data }; anything but
// code "000000" is an API error.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Provider success code.
const CODE_OK: &str = "000000";
/// Refresh the cached token this many seconds before it expires.
const TOKEN_EXPIRY_MARGIN: i64 = 60;
/// Per-request timeout.
pub const PROVIDER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request: code={code} msg={message}")]
    Api { code: String, message: String },
    #[error("provider returned empty {0}")]
    Missing(&'static str),
    #[error("invalid provider input: {0}")]
    InvalidInput(&'static str),
}

// ============================================================================
// WIRE TYPES (only the fields the ledger depends on)
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AuthCodeData {
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenData {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_in: i64,
    timestamp: i64,
}

/// Receipt for a transfer-in call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub id: String,
    #[serde(default)]
    pub client_transaction_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardBalance {
    #[serde(default)]
    pub available: String,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSummary {
    #[serde(default)]
    pub card_id: String,
    pub balance: CardBalance,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCard {
    pub id: String,
    pub status: String,
}

/// One card transaction as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTransaction {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub txn_type: i32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub fee: String,
    #[serde(default)]
    pub transaction_amount: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct TransactionPage {
    #[serde(default)]
    list: Vec<ProviderTransaction>,
    #[serde(default)]
    total: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateTokenData {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PinResult {
    #[serde(default)]
    success: bool,
}

/// Cardholder details submitted at issuance time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardholderRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: String,
    pub country_code: String,
    pub phone_number: String,
    pub city: String,
    pub country: String,
    pub street: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardholderInfo {
    pub holder_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardProduct {
    pub product_id: String,
    #[serde(default)]
    pub product_status: String,
    #[serde(default)]
    pub max_card_quota: u64,
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    #[serde(default)]
    rows: Vec<CardProduct>,
}

/// Filter for the paged transaction list.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub card_id: String,
    /// Provider transaction type ("0".."14"), empty for all.
    pub txn_type: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: usize,
    pub page: usize,
}

// ============================================================================
// GATEWAY TRAIT - the narrow seam the orchestrator consumes
// ============================================================================

/// The single provider operation that participates in a money flow. Kept as
/// a trait so the funding orchestration can be exercised without a network.
pub trait CardGateway: Send + Sync {
    fn transfer_in(
        &self,
        card_id: &str,
        client_transaction_id: &str,
        amount: Decimal,
    ) -> impl std::future::Future<Output = Result<TransferReceipt, ProviderError>> + Send;
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Default)]
struct TokenCache {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

/// Provider client. `Clone` shares the HTTP pool and the token cache.
#[derive(Clone)]
pub struct CardProvider {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    account_id: String,
    token: Arc<Mutex<TokenCache>>,
}

impl CardProvider {
    pub fn new(base_url: String, client_id: String, account_id: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            client_id,
            account_id,
            token: Arc::new(Mutex::new(TokenCache::default())),
        }
    }

    /// Build from environment: CARD_PROVIDER_URL, CARD_PROVIDER_CLIENT_ID,
    /// CARD_PROVIDER_ACCOUNT_ID.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("CARD_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api-sandbox.provider.test/open-api/v3".to_string()),
            std::env::var("CARD_PROVIDER_CLIENT_ID").unwrap_or_default(),
            std::env::var("CARD_PROVIDER_ACCOUNT_ID").unwrap_or_default(),
        )
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    // ========================================================================
    // TOKEN HANDLING
    // ========================================================================

    /// Current access token, refreshed when missing or about to expire.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cache = self.token.lock().await;

        let now = Utc::now().timestamp();
        if !cache.access_token.is_empty() && now < cache.expires_at - TOKEN_EXPIRY_MARGIN {
            return Ok(cache.access_token.clone());
        }

        let code = self.fetch_auth_code().await?;
        let data = self.exchange_code(&code).await?;
        if data.access_token.is_empty() {
            return Err(ProviderError::Missing("access token"));
        }

        cache.access_token = data.access_token.clone();
        cache.refresh_token = data.refresh_token;
        cache.expires_at = data.timestamp + data.expires_in;
        debug!(expires_at = cache.expires_at, "provider token refreshed");

        Ok(data.access_token)
    }

    async fn fetch_auth_code(&self) -> Result<String, ProviderError> {
        let url = format!("{}/oauth/authorize?clientId={}", self.base_url, self.client_id);
        let envelope: Envelope<AuthCodeData> =
            self.http.get(&url).send().await?.error_for_status()?.json().await?;
        let data = unwrap_envelope(envelope)?;
        if data.code.is_empty() {
            return Err(ProviderError::Missing("auth code"));
        }
        Ok(data.code)
    }

    async fn exchange_code(&self, code: &str) -> Result<AccessTokenData, ProviderError> {
        let url = format!("{}/oauth/access-token", self.base_url);
        let body = serde_json::json!({ "clientId": self.client_id, "code": code });
        let envelope: Envelope<AccessTokenData> =
            self.http.post(&url).json(&body).send().await?.error_for_status()?.json().await?;
        unwrap_envelope(envelope)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let envelope: Envelope<T> = self
            .http
            .get(url)
            .query(query)
            .header("x-access-token", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        unwrap_envelope(envelope)
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let envelope: Envelope<T> = self
            .http
            .post(url)
            .json(body)
            .header("x-access-token", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        unwrap_envelope(envelope)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Card balance and limits.
    pub async fn card_summary(&self, card_id: &str) -> Result<CardSummary, ProviderError> {
        if card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }
        let url = format!("{}/cards/{}/card-summary", self.base_url, card_id);
        self.get_json(&url, &[("accountId", self.account_id.clone())]).await
    }

    /// Paged transaction list, filterable by type/status/time window.
    pub async fn list_transactions(
        &self,
        query: &TransactionQuery,
    ) -> Result<(Vec<ProviderTransaction>, String), ProviderError> {
        if query.card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }

        let mut params: Vec<(&str, String)> = vec![
            ("accountId", self.account_id.clone()),
            ("cardId", query.card_id.clone()),
            ("limit", query.limit.max(1).min(100).to_string()),
            ("page", query.page.max(1).to_string()),
        ];
        if let Some(ref t) = query.txn_type {
            params.push(("type", t.clone()));
        }
        if let Some(ref s) = query.status {
            params.push(("status", s.clone()));
        }
        if let Some(ref t) = query.start_time {
            params.push(("startTime", t.clone()));
        }
        if let Some(ref t) = query.end_time {
            params.push(("endTime", t.clone()));
        }

        let url = format!("{}/cards/transaction-list", self.base_url);
        let page: TransactionPage = self.get_json(&url, &params).await?;
        Ok((page.list, page.total))
    }

    /// Freeze a card. The returned status should be FROZEN.
    pub async fn freeze_card(&self, card_id: &str) -> Result<ProviderCard, ProviderError> {
        if card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }
        let url = format!("{}/cards/{}/freeze", self.base_url, card_id);
        let body = serde_json::json!({ "accountId": self.account_id });
        self.post_json(&url, &body).await
    }

    /// Set the card PIN (6 digits).
    pub async fn set_pin(&self, card_id: &str, pin: &str) -> Result<bool, ProviderError> {
        if card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }
        if pin.len() != 6 {
            return Err(ProviderError::InvalidInput("pin length must be 6"));
        }
        let url = format!("{}/cards/{}/pin", self.base_url, card_id);
        let body = serde_json::json!({ "accountId": self.account_id, "pin": pin });
        let result: PinResult = self.post_json(&url, &body).await?;
        Ok(result.success)
    }

    /// Register a cardholder for a product. Called by the issuance worker,
    /// not by request handlers. Returns the provider's holder id.
    pub async fn create_cardholder(
        &self,
        product_id: &str,
        holder: &CardholderRequest,
    ) -> Result<String, ProviderError> {
        if product_id.is_empty() {
            return Err(ProviderError::InvalidInput("product id required"));
        }
        let url = format!("{}/cardholders/create", self.base_url);
        let body = serde_json::json!({
            "accountId": self.account_id,
            "productId": product_id,
            "holder": holder,
        });
        let info: CardholderInfo = self.post_json(&url, &body).await?;
        if info.holder_id.is_empty() {
            return Err(ProviderError::Missing("holder id"));
        }
        Ok(info.holder_id)
    }

    /// Update an existing cardholder's details.
    pub async fn update_cardholder(
        &self,
        holder_id: &str,
        product_id: &str,
        holder: &CardholderRequest,
    ) -> Result<String, ProviderError> {
        if holder_id.is_empty() {
            return Err(ProviderError::InvalidInput("holder id required"));
        }
        let url = format!("{}/cardholders/update", self.base_url);
        let body = serde_json::json!({
            "accountId": self.account_id,
            "holderId": holder_id,
            "productId": product_id,
            "holder": holder,
        });
        let info: CardholderInfo = self.post_json(&url, &body).await?;
        Ok(info.holder_id)
    }

    /// Available card products. The issuance worker picks an ENABLED one.
    pub async fn list_products(&self) -> Result<Vec<CardProduct>, ProviderError> {
        let url = format!("{}/cards/products", self.base_url);
        let page: ProductPage =
            self.get_json(&url, &[("accountId", self.account_id.clone())]).await?;
        Ok(page.rows)
    }

    /// One-time access token for the card detail iframe.
    pub async fn card_private_token(&self, card_id: &str) -> Result<String, ProviderError> {
        if card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }
        let url = format!("{}/cards/{}/private-info/access-token", self.base_url, card_id);
        let data: PrivateTokenData =
            self.get_json(&url, &[("accountId", self.account_id.clone())]).await?;
        if data.access_token.is_empty() {
            return Err(ProviderError::Missing("private token"));
        }
        Ok(data.access_token)
    }
}

impl CardGateway for CardProvider {
    /// Move funds onto a card. Idempotent per client transaction id, so a
    /// retried call after a timeout cannot double-fund.
    async fn transfer_in(
        &self,
        card_id: &str,
        client_transaction_id: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, ProviderError> {
        if card_id.is_empty() {
            return Err(ProviderError::InvalidInput("card id required"));
        }
        if client_transaction_id.is_empty() {
            return Err(ProviderError::InvalidInput("client transaction id required"));
        }

        let url = format!("{}/cards/transfer-in", self.base_url);
        let body = serde_json::json!({
            "accountId": self.account_id,
            "cardId": card_id,
            "clientTransactionId": client_transaction_id,
            "amount": format!("{:.2}", amount.round_dp(2)),
        });
        let receipt: TransferReceipt = self.post_json(&url, &body).await?;
        debug!(id = %receipt.id, tx = client_transaction_id, "transfer-in accepted");
        Ok(receipt)
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, ProviderError> {
    if envelope.code != CODE_OK {
        warn!(code = %envelope.code, message = %envelope.message, "provider api error");
        return Err(ProviderError::Api { code: envelope.code, message: envelope.message });
    }
    envelope.data.ok_or(ProviderError::Missing("data"))
}
