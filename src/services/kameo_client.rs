//! Typed client for the Kameo loan and bidding APIs
//!
//! Every call runs the same pipeline: reserve a rate-limit slot, make
//! sure the session is authenticated, send over the shared cookie-jar
//! client, feed `x-ratelimit-remaining` back into the limiter, classify
//! the response, decode. Transient failures retry with backoff; a 401
//! marks the session expired so the next attempt re-authenticates, and
//! a 429 puts the limiter into cooldown.

use super::platform_errors::PlatformError;
use super::rate_limiter::RateLimiter;
use super::retry::{with_retry, RetryConfig};
use super::session::SessionAuthenticator;
use crate::types::{
    AccountBalance, AccountOverview, BiddingStatus, BidPreview, BidReceipt, ListingFilters, Loan,
    LoanStatus, PaymentOption, SequenceToken, SubscriptionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, REFERER, RETRY_AFTER};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Mockable surface of the Kameo platform.
///
/// The bidding engine, discovery and jobs all talk to this trait, so
/// tests can script platform behavior without any network.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// One page of open investment options
    async fn fetch_investment_options(
        &self,
        filters: &ListingFilters,
        limit: u32,
        page: u32,
    ) -> Result<Vec<Loan>, PlatformError>;

    /// Live bidding state for one loan
    async fn fetch_bidding_status(&self, loan_id: i64) -> Result<BiddingStatus, PlatformError>;

    /// Dry-run a bid; the platform answers with a sequence hash and
    /// projected economics
    async fn preview_bid(
        &self,
        loan_id: i64,
        amount: i64,
        payment_option: PaymentOption,
    ) -> Result<BidPreview, PlatformError>;

    /// Place the bid previewed with this token. The token is consumed
    /// when the call is issued.
    async fn submit_bid(
        &self,
        loan_id: i64,
        amount: i64,
        payment_option: PaymentOption,
        token: SequenceToken,
    ) -> Result<BidReceipt, PlatformError>;

    /// Subscribe to notifications for a loan
    async fn subscribe_loan(&self, loan_id: i64) -> Result<SubscriptionStatus, PlatformError>;

    /// Account balances, SEK account first
    async fn fetch_account_balances(&self) -> Result<AccountOverview, PlatformError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListingEnvelope {
    #[serde(default)]
    data: ListingData,
}

#[derive(Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default, alias = "investment_options")]
    loans: Vec<RawLoan>,
}

/// Raw loan row from the investment-options API. Amounts arrive as
/// either numbers or formatted strings depending on the listing age.
#[derive(Debug, Deserialize)]
struct RawLoan {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    interest_rate: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    open_date: Option<String>,
    #[serde(default)]
    close_date: Option<String>,
    #[serde(default)]
    funding_progress: Option<serde_json::Value>,
    #[serde(default)]
    funded_amount: Option<serde_json::Value>,
    #[serde(default)]
    min_bid_amount: Option<serde_json::Value>,
    #[serde(default)]
    max_bid_amount: Option<serde_json::Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    risk_grade: Option<String>,
    #[serde(default)]
    duration_months: Option<i32>,
    #[serde(default)]
    origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBiddingStatus {
    #[serde(default)]
    sequence_hash: Option<String>,
    #[serde(default)]
    current_amount: Option<serde_json::Value>,
    #[serde(default)]
    target_amount: Option<serde_json::Value>,
    #[serde(default)]
    min_bid_amount: Option<serde_json::Value>,
    #[serde(default)]
    max_bid_amount: Option<serde_json::Value>,
    #[serde(default)]
    total_bidders: Option<u32>,
    #[serde(default)]
    my_bids: Vec<RawOwnBid>,
}

#[derive(Debug, Deserialize)]
struct RawOwnBid {
    #[serde(default)]
    amount: Option<serde_json::Value>,
}

/// Response of the bidding POST, for both previews and submits
#[derive(Debug, Deserialize)]
struct RawBidOutcome {
    #[serde(default)]
    sequence_hash: Option<String>,
    #[serde(default)]
    estimated_return: Option<serde_json::Value>,
    #[serde(default)]
    fees: Option<serde_json::Value>,
    #[serde(default)]
    heading: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    #[serde(default)]
    subscribed: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransferEnvelope {
    #[serde(default)]
    content: TransferContent,
}

#[derive(Debug, Default, Deserialize)]
struct TransferContent {
    #[serde(default)]
    data: TransferData,
}

#[derive(Debug, Default, Deserialize)]
struct TransferData {
    #[serde(default)]
    accounts: Vec<AccountBalance>,
    #[serde(default, rename = "xsrfToken")]
    xsrf_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the Kameo platform
pub struct KameoClient {
    http: Client,
    auth: Arc<SessionAuthenticator>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    web_base: String,
    api_base: String,
}

impl KameoClient {
    pub fn new(
        http: Client,
        auth: Arc<SessionAuthenticator>,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        web_base: String,
        api_base: String,
    ) -> Self {
        Self {
            http,
            auth,
            limiter,
            retry,
            web_base,
            api_base,
        }
    }

    fn listing_url(&self) -> String {
        format!("{}/loans/listing/investment-options", self.api_base)
    }

    fn bidding_url(&self, loan_id: i64) -> String {
        format!("{}/bidding/{}/load", self.api_base, loan_id)
    }

    fn subscribe_url(&self, loan_id: i64) -> String {
        format!("{}/loans/{}/subscribe", self.api_base, loan_id)
    }

    fn transfer_url(&self) -> String {
        format!("{}/ezjscore/call/kameo_transfer::init", self.web_base)
    }

    fn listing_referer(&self) -> String {
        format!("{}/aktuella-lan", self.web_base)
    }

    /// Run one request through the full pipeline with retries
    async fn call<T: DeserializeOwned>(
        &self,
        label: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, PlatformError> {
        with_retry(&self.retry, label, || {
            let attempt = req.try_clone();
            async move {
                let req = attempt.ok_or_else(|| {
                    PlatformError::Validation("request body cannot be replayed".to_string())
                })?;
                self.attempt_once(label, req).await
            }
        })
        .await
    }

    /// One pipeline pass: rate limit, auth, send, classify, decode
    async fn attempt_once<T: DeserializeOwned>(
        &self,
        label: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, PlatformError> {
        self.limiter.reserve().await;
        self.auth.ensure_authenticated().await?;

        let resp = req
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        self.observe_rate_headers(resp.headers()).await;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.auth.mark_expired().await;
            return Err(PlatformError::SessionExpired);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(resp.headers());
            self.limiter
                .start_cooldown(retry_after.map(Duration::from_secs))
                .await;
            return Err(PlatformError::RateLimited { retry_after });
        }

        let code = status.as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        if !status.is_success() {
            return Err(PlatformError::from_response(code, &body));
        }

        serde_json::from_str::<T>(&body).map_err(|e| {
            let excerpt: String = body.chars().take(200).collect();
            warn!("{} returned an undecodable body: {}", label, e);
            PlatformError::Validation(format!("{}: undecodable response: {} ({})", label, e, excerpt))
        })
    }

    async fn observe_rate_headers(&self, headers: &HeaderMap) {
        let limit = header_u32(headers, "x-ratelimit-limit");
        if let Some(remaining) = header_u32(headers, "x-ratelimit-remaining") {
            if let Some(limit) = limit {
                debug!("Server rate window: {}/{} remaining", remaining, limit);
            }
            self.limiter.observe_remaining(remaining).await;
        }
    }

    fn bid_payload(amount: i64, payment_option: PaymentOption, sequence_hash: &str) -> serde_json::Value {
        serde_json::json!({
            "amount": amount.to_string(),
            "intention": "add",
            "sequence_hash": sequence_hash,
            "payment_options": [payment_option.as_str()],
        })
    }
}

#[async_trait]
impl PlatformApi for KameoClient {
    async fn fetch_investment_options(
        &self,
        filters: &ListingFilters,
        limit: u32,
        page: u32,
    ) -> Result<Vec<Loan>, PlatformError> {
        let limit_s = limit.to_string();
        let page_s = page.to_string();
        let req = self
            .http
            .get(self.listing_url())
            .query(&[
                ("subscription_origin_sweden", flag(filters.sweden)),
                ("subscription_origin_norway", flag(filters.norway)),
                ("subscription_origin_denmark", flag(filters.denmark)),
                ("limit", limit_s.as_str()),
                ("page", page_s.as_str()),
            ])
            .header(REFERER, self.listing_referer());

        let envelope: ListingEnvelope = self.call("fetch_investment_options", req).await?;

        let loans: Vec<Loan> = envelope
            .data
            .loans
            .into_iter()
            .filter_map(parse_loan)
            .collect();

        debug!("Fetched {} loans from page {}", loans.len(), page);
        Ok(loans)
    }

    async fn fetch_bidding_status(&self, loan_id: i64) -> Result<BiddingStatus, PlatformError> {
        let req = self
            .http
            .get(self.bidding_url(loan_id))
            .header(REFERER, format!("{}/", self.web_base));

        let raw: RawBiddingStatus = self.call("fetch_bidding_status", req).await?;
        Ok(bidding_status_from(loan_id, raw))
    }

    async fn preview_bid(
        &self,
        loan_id: i64,
        amount: i64,
        payment_option: PaymentOption,
    ) -> Result<BidPreview, PlatformError> {
        // Empty sequence hash makes the platform answer with a fresh one
        let payload = Self::bid_payload(amount, payment_option, "");
        let req = self
            .http
            .post(self.bidding_url(loan_id))
            .header(REFERER, format!("{}/", self.web_base))
            .json(&payload);

        let raw: RawBidOutcome = self.call("preview_bid", req).await?;
        let preview = preview_from(raw)?;

        debug!(
            "Previewed bid of {} SEK on loan {} (hash {})",
            amount, loan_id, preview.sequence_hash
        );
        Ok(preview)
    }

    async fn submit_bid(
        &self,
        loan_id: i64,
        amount: i64,
        payment_option: PaymentOption,
        token: SequenceToken,
    ) -> Result<BidReceipt, PlatformError> {
        // The token dies here whatever happens next
        let hash = token.into_hash();
        let payload = Self::bid_payload(amount, payment_option, &hash);
        let req = self
            .http
            .post(self.bidding_url(loan_id))
            .header(REFERER, format!("{}/", self.web_base))
            .json(&payload);

        let raw: RawBidOutcome = self.call("submit_bid", req).await?;

        info!("Submitted bid of {} SEK on loan {}", amount, loan_id);
        Ok(BidReceipt {
            heading: raw.heading,
            messages: raw.messages,
        })
    }

    async fn subscribe_loan(&self, loan_id: i64) -> Result<SubscriptionStatus, PlatformError> {
        let req = self
            .http
            .post(self.subscribe_url(loan_id))
            .header(REFERER, self.listing_referer())
            .json(&serde_json::json!({}));

        let raw: RawSubscription = self.call("subscribe_loan", req).await?;
        Ok(SubscriptionStatus {
            subscribed: raw.subscribed.unwrap_or(true),
            message: raw.message,
        })
    }

    async fn fetch_account_balances(&self) -> Result<AccountOverview, PlatformError> {
        let req = self.http.get(self.transfer_url());

        let envelope: TransferEnvelope = self.call("fetch_account_balances", req).await?;
        Ok(AccountOverview {
            accounts: envelope.content.data.accounts,
            xsrf_token: envelope.content.data.xsrf_token,
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn flag(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Parse a listing row into a Loan. Rows without id, title, or a
/// positive amount are dropped.
fn parse_loan(raw: RawLoan) -> Option<Loan> {
    let loan_id = raw.id?;

    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }

    let amount = parse_amount(&raw.amount).filter(|a| *a > 0)?;

    let status = raw
        .status
        .as_deref()
        .and_then(|s| s.parse::<LoanStatus>().ok())
        .unwrap_or(LoanStatus::Unknown);

    let current_bid = parse_amount(&raw.funded_amount).unwrap_or(0);
    let min_bid = parse_amount(&raw.min_bid_amount).unwrap_or(0);
    let max_bid = parse_amount(&raw.max_bid_amount).unwrap_or(amount);

    Some(Loan {
        loan_id,
        title: title.to_string(),
        amount,
        interest_rate: parse_decimal(&raw.interest_rate),
        min_bid,
        max_bid,
        current_bid,
        funded_percentage: parse_decimal(&raw.funding_progress),
        status,
        opens_at: parse_datetime(raw.open_date.as_deref()),
        closes_at: parse_datetime(raw.close_date.as_deref()),
        url: raw.url,
        risk_grade: raw.risk_grade,
        duration_months: raw.duration_months,
        origin: raw.origin,
        has_own_bid: false,
    })
}

fn bidding_status_from(loan_id: i64, raw: RawBiddingStatus) -> BiddingStatus {
    let current_bid = parse_amount(&raw.current_amount).unwrap_or(0);
    let target = parse_amount(&raw.target_amount);

    let funded_percentage = target
        .filter(|t| *t > 0)
        .map(|t| Decimal::from(current_bid) * Decimal::from(100) / Decimal::from(t));

    BiddingStatus {
        loan_id,
        sequence_hash: raw.sequence_hash.filter(|h| !h.is_empty()),
        current_bid,
        min_bid: parse_amount(&raw.min_bid_amount).unwrap_or(0),
        max_bid: parse_amount(&raw.max_bid_amount).unwrap_or(0),
        total_bidders: raw.total_bidders,
        funded_percentage,
        own_bid_amounts: raw
            .my_bids
            .iter()
            .filter_map(|b| parse_amount(&b.amount))
            .collect(),
    }
}

fn preview_from(raw: RawBidOutcome) -> Result<BidPreview, PlatformError> {
    match raw.sequence_hash.filter(|h| !h.is_empty()) {
        Some(sequence_hash) => Ok(BidPreview {
            sequence_hash,
            estimated_return: parse_decimal(&raw.estimated_return),
            fees: parse_decimal(&raw.fees),
        }),
        None => {
            let detail = if raw.messages.is_empty() {
                "preview returned no sequence hash".to_string()
            } else {
                raw.messages.join("; ")
            };
            Err(PlatformError::Validation(detail))
        }
    }
}

/// Whole-SEK amount from either a JSON number or a formatted string
/// like "1 500 000,00"
fn parse_amount(value: &Option<serde_json::Value>) -> Option<i64> {
    match value.as_ref()? {
        serde_json::Value::Number(n) => n.as_f64().map(|f| f.round() as i64),
        serde_json::Value::String(s) => {
            let cleaned = s.replace(' ', "").replace('\u{a0}', "").replace(',', ".");
            cleaned.parse::<f64>().ok().map(|f| f.round() as i64)
        }
        _ => None,
    }
}

fn parse_decimal(value: &Option<serde_json::Value>) -> Option<Decimal> {
    match value.as_ref()? {
        serde_json::Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        serde_json::Value::String(s) => Decimal::from_str(s.trim().replace(',', ".").as_str()).ok(),
        _ => None,
    }
}

/// Parse timestamps as RFC 3339 first, then the platform's
/// "YYYY-MM-DD HH:MM:SS" form
fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
