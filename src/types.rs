//! Core types for the Kameo lending bot

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// A loan listing tracked by the bot.
///
/// Snapshot of one listing as returned by the investment-options API,
/// merged into the store by `loan_id`. Monetary amounts are whole SEK
/// integers exactly as the API reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub loan_id: i64,
    pub title: String,
    /// Principal amount in SEK
    pub amount: i64,
    pub interest_rate: Option<Decimal>,
    /// Smallest bid the platform accepts for this loan
    pub min_bid: i64,
    /// Largest bid the platform accepts for this loan
    pub max_bid: i64,
    /// Aggregate amount bid so far
    pub current_bid: i64,
    pub funded_percentage: Option<Decimal>,
    pub status: LoanStatus,
    pub opens_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub risk_grade: Option<String>,
    pub duration_months: Option<i32>,
    /// Listing origin country (sweden / norway / denmark)
    pub origin: Option<String>,
    /// Whether this account already has a bid on the loan
    pub has_own_bid: bool,
}

impl Loan {
    /// Amount still needed to fully fund the loan
    pub fn remaining_amount(&self) -> i64 {
        (self.amount - self.current_bid).max(0)
    }

    pub fn is_fully_funded(&self) -> bool {
        self.current_bid >= self.amount
    }

    /// Hours until bidding closes
    pub fn hours_until_close(&self) -> Option<f64> {
        self.closes_at.map(|end| {
            let duration = end.signed_duration_since(Utc::now());
            duration.num_minutes() as f64 / 60.0
        })
    }

    /// Format time remaining for display
    pub fn time_remaining_display(&self) -> String {
        match self.hours_until_close() {
            Some(h) if h <= 0.0 => "Closed".to_string(),
            Some(h) if h < 1.0 => format!("{:.0}m", h * 60.0),
            Some(h) if h < 24.0 => format!("{:.1}h", h),
            Some(h) => format!("{:.1}d", h / 24.0),
            None => "Unknown".to_string(),
        }
    }
}

/// Lifecycle status of a loan listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Open,
    Closed,
    Funded,
    Active,
    Completed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Open => "open",
            LoanStatus::Closed => "closed",
            LoanStatus::Funded => "funded",
            LoanStatus::Active => "active",
            LoanStatus::Completed => "completed",
            LoanStatus::Canceled => "canceled",
            LoanStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for LoanStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "open" => LoanStatus::Open,
            "closed" => LoanStatus::Closed,
            "funded" => LoanStatus::Funded,
            "active" => LoanStatus::Active,
            "completed" => LoanStatus::Completed,
            "canceled" | "cancelled" => LoanStatus::Canceled,
            _ => LoanStatus::Unknown,
        })
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a bid is funded on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentOption {
    /// Paid from the interest payment account ("ip")
    InterestPayment,
    /// Paid as a down payment ("dp")
    DownPayment,
}

impl PaymentOption {
    /// Wire code expected by the bidding API
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOption::InterestPayment => "ip",
            PaymentOption::DownPayment => "dp",
        }
    }
}

impl FromStr for PaymentOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ip" | "interest" => Ok(PaymentOption::InterestPayment),
            "dp" | "down" => Ok(PaymentOption::DownPayment),
            other => Err(format!("unknown payment option '{}', expected 'ip' or 'dp'", other)),
        }
    }
}

impl fmt::Display for PaymentOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which listing origins to include when fetching investment options
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ListingFilters {
    pub sweden: bool,
    pub norway: bool,
    pub denmark: bool,
}

impl Default for ListingFilters {
    fn default() -> Self {
        Self {
            sweden: true,
            norway: false,
            denmark: true,
        }
    }
}

/// Parameters for one bid placement attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRequest {
    pub loan_id: i64,
    /// Bid amount in whole SEK
    pub amount: i64,
    #[serde(default = "default_payment_option")]
    pub payment_option: PaymentOption,
    /// Minimum acceptable projected return; below it the attempt stops
    /// after the preview without submitting
    #[serde(default)]
    pub min_return: Option<Decimal>,
    /// Stop after the preview unconditionally
    #[serde(default)]
    pub preview_only: bool,
}

fn default_payment_option() -> PaymentOption {
    PaymentOption::InterestPayment
}

/// Short-lived server-issued token proving a submit follows a preview.
///
/// Moved (not cloned) into the submit call: once a submit has been issued
/// with a token, no other code path can present the same token again.
#[derive(Debug)]
pub struct SequenceToken {
    hash: String,
    issued_at: Instant,
}

impl SequenceToken {
    pub fn new(hash: String) -> Self {
        Self {
            hash,
            issued_at: Instant::now(),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_expired(&self, validity: Duration) -> bool {
        self.issued_at.elapsed() >= validity
    }

    /// Consume the token, yielding the hash for the submit payload
    pub fn into_hash(self) -> String {
        self.hash
    }
}

/// Bid attempt state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidState {
    Eligible,
    Previewed,
    Submitted,
    Confirmed,
    Failed,
}

impl fmt::Display for BidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BidState::Eligible => write!(f, "ELIGIBLE"),
            BidState::Previewed => write!(f, "PREVIEWED"),
            BidState::Submitted => write!(f, "SUBMITTED"),
            BidState::Confirmed => write!(f, "CONFIRMED"),
            BidState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Audit record of one bid placement attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAttempt {
    pub loan_id: i64,
    pub amount: i64,
    pub payment_option: PaymentOption,
    pub state: BidState,
    /// Sequence hash used for the submit call, when one was issued
    pub sequence_hash: Option<String>,
    pub estimated_return: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub started_at: DateTime<Utc>,
    pub previewed_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of verification polls issued
    pub verify_polls: u32,
    /// Error kind tag when the attempt failed
    pub failure_kind: Option<String>,
    pub failure: Option<String>,
}

impl BidAttempt {
    pub fn new(loan_id: i64, amount: i64, payment_option: PaymentOption) -> Self {
        Self {
            loan_id,
            amount,
            payment_option,
            state: BidState::Eligible,
            sequence_hash: None,
            estimated_return: None,
            fees: None,
            started_at: Utc::now(),
            previewed_at: None,
            submitted_at: None,
            finished_at: None,
            verify_polls: 0,
            failure_kind: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BidState::Confirmed | BidState::Failed)
    }
}

/// Bidding status for one loan, decoded from the bidding load endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingStatus {
    pub loan_id: i64,
    /// Fresh sequence hash when the server includes one
    pub sequence_hash: Option<String>,
    pub current_bid: i64,
    pub min_bid: i64,
    pub max_bid: i64,
    pub total_bidders: Option<u32>,
    pub funded_percentage: Option<Decimal>,
    /// Amounts of this account's bids on the loan
    pub own_bid_amounts: Vec<i64>,
}

impl BiddingStatus {
    pub fn has_own_bid_of(&self, amount: i64) -> bool {
        self.own_bid_amounts.contains(&amount)
    }
}

/// Preview response: the sequence hash plus projected economics
#[derive(Debug, Clone)]
pub struct BidPreview {
    pub sequence_hash: String,
    pub estimated_return: Option<Decimal>,
    pub fees: Option<Decimal>,
}

/// Submit response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidReceipt {
    pub heading: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// One account row from the balances endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub account_no: String,
    pub currency_code: String,
    #[serde(default)]
    pub available_cash: Option<Decimal>,
    #[serde(default)]
    pub reserved_cash: Option<Decimal>,
}

/// Account balances plus the session token the endpoint refreshes
#[derive(Debug, Clone, Default)]
pub struct AccountOverview {
    pub accounts: Vec<AccountBalance>,
    pub xsrf_token: Option<String>,
}

impl AccountOverview {
    /// Preferred account: SEK when present, otherwise the first one
    pub fn primary_account(&self) -> Option<&AccountBalance> {
        self.accounts
            .iter()
            .find(|a| a.currency_code == "SEK")
            .or_else(|| self.accounts.first())
    }
}

/// Loan subscription outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub subscribed: bool,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loan_status_parses_unknown_values() {
        assert_eq!("open".parse::<LoanStatus>().unwrap(), LoanStatus::Open);
        assert_eq!("cancelled".parse::<LoanStatus>().unwrap(), LoanStatus::Canceled);
        assert_eq!("prefunded".parse::<LoanStatus>().unwrap(), LoanStatus::Unknown);
    }

    #[test]
    fn test_payment_option_wire_codes() {
        assert_eq!("ip".parse::<PaymentOption>().unwrap(), PaymentOption::InterestPayment);
        assert_eq!("down".parse::<PaymentOption>().unwrap(), PaymentOption::DownPayment);
        assert!("xx".parse::<PaymentOption>().is_err());
        assert_eq!(PaymentOption::DownPayment.as_str(), "dp");
    }

    #[test]
    fn test_sequence_token_expiry() {
        let token = SequenceToken::new("abc123".to_string());
        assert!(!token.is_expired(Duration::from_secs(300)));
        assert!(token.is_expired(Duration::ZERO));
        assert_eq!(token.into_hash(), "abc123");
    }

    #[test]
    fn test_remaining_amount_never_negative() {
        let mut loan = sample_loan();
        loan.current_bid = loan.amount + 5_000;
        assert_eq!(loan.remaining_amount(), 0);
        assert!(loan.is_fully_funded());
    }

    #[test]
    fn test_primary_account_prefers_sek() {
        let overview = AccountOverview {
            accounts: vec![
                AccountBalance {
                    account_no: "9670-123".to_string(),
                    currency_code: "NOK".to_string(),
                    available_cash: None,
                    reserved_cash: None,
                },
                AccountBalance {
                    account_no: "9670-456".to_string(),
                    currency_code: "SEK".to_string(),
                    available_cash: None,
                    reserved_cash: None,
                },
            ],
            xsrf_token: None,
        };
        assert_eq!(overview.primary_account().unwrap().account_no, "9670-456");
    }

    fn sample_loan() -> Loan {
        Loan {
            loan_id: 4852,
            title: "Fastighetsprojekt Solna".to_string(),
            amount: 1_500_000,
            interest_rate: None,
            min_bid: 500,
            max_bid: 100_000,
            current_bid: 750_000,
            funded_percentage: None,
            status: LoanStatus::Open,
            opens_at: None,
            closes_at: None,
            url: None,
            risk_grade: None,
            duration_months: None,
            origin: None,
            has_own_bid: false,
        }
    }
}
