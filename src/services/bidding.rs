//! Bid placement state machine
//!
//! One `BidAttempt` per invocation, moving ELIGIBLE → PREVIEWED →
//! SUBMITTED → CONFIRMED (or FAILED). Eligibility is decided from the
//! stored loan snapshot without touching the network; previews hand
//! out a one-shot sequence token that the submit call consumes; a
//! rejected or expired token goes back to preview while the budget
//! allows. Confirmation is read back from the bidding status because
//! the submit response alone does not prove the bid landed. Every
//! attempt, failed ones included, is appended to the audit log.

use super::jobs::CancelSignal;
use super::kameo_client::PlatformApi;
use super::platform_errors::PlatformError;
use crate::db::Database;
use crate::types::{BidAttempt, BidRequest, BidState, Loan, LoanStatus, SequenceToken};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Tunables for one bid attempt
#[derive(Debug, Clone)]
pub struct BiddingConfig {
    /// Verification polls after a submit
    pub verify_polls: u32,
    /// Delay between verification polls
    pub verify_interval: Duration,
    /// Total previews allowed per attempt (first one included)
    pub preview_budget: u32,
    /// How long a sequence token stays usable after issue
    pub token_validity: Duration,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            verify_polls: 3,
            verify_interval: Duration::from_secs(2),
            preview_budget: 2,
            token_validity: Duration::from_secs(300),
        }
    }
}

/// Runs the bid protocol against the platform for one loan at a time
pub struct BiddingEngine {
    api: Arc<dyn PlatformApi>,
    db: Arc<Database>,
    config: BiddingConfig,
}

impl BiddingEngine {
    pub fn new(api: Arc<dyn PlatformApi>, db: Arc<Database>, config: BiddingConfig) -> Self {
        Self { api, db, config }
    }

    /// Place one bid. The returned attempt carries the final state and
    /// the full audit trail; it has already been recorded.
    ///
    /// `cancel` is honored at the checkpoints before the preview and
    /// before the submit. A submit that has already been issued always
    /// runs through verification.
    pub async fn place_bid(
        &self,
        loan: &Loan,
        request: &BidRequest,
        cancel: &CancelSignal,
    ) -> BidAttempt {
        let mut attempt = BidAttempt::new(request.loan_id, request.amount, request.payment_option);

        if let Some(reason) = ineligibility_reason(loan, request.amount) {
            warn!("Loan {} ineligible: {}", loan.loan_id, reason);
            let err = PlatformError::Ineligible {
                loan_id: loan.loan_id,
                reason,
            };
            return self.finish_failed(attempt, &err).await;
        }

        let mut previews_used: u32 = 0;
        let mut last_rejection: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                info!(
                    "Bid attempt on loan {} cancelled before preview",
                    attempt.loan_id
                );
                return self.record(attempt).await;
            }

            if previews_used >= self.config.preview_budget {
                let detail = match last_rejection {
                    Some(d) => format!("preview budget exhausted: {}", d),
                    None => "preview budget exhausted".to_string(),
                };
                return self
                    .finish_failed(attempt, &PlatformError::SequenceToken(detail))
                    .await;
            }
            previews_used += 1;

            let preview = match self
                .api
                .preview_bid(attempt.loan_id, attempt.amount, attempt.payment_option)
                .await
            {
                Ok(p) => p,
                Err(e) => return self.finish_failed(attempt, &e).await,
            };

            attempt.state = BidState::Previewed;
            attempt.previewed_at = Some(Utc::now());
            attempt.sequence_hash = Some(preview.sequence_hash.clone());
            attempt.estimated_return = preview.estimated_return;
            attempt.fees = preview.fees;
            let token = SequenceToken::new(preview.sequence_hash);

            if request.preview_only {
                info!(
                    "Preview only: stopping attempt on loan {} at PREVIEWED",
                    attempt.loan_id
                );
                return self.record(attempt).await;
            }

            if let Some(threshold) = request.min_return {
                let acceptable = attempt
                    .estimated_return
                    .map(|r| r >= threshold)
                    .unwrap_or(false);
                if !acceptable {
                    info!(
                        "Projected return {:?} below threshold {} on loan {}; stopping at PREVIEWED",
                        attempt.estimated_return, threshold, attempt.loan_id
                    );
                    return self.record(attempt).await;
                }
            }

            if cancel.is_cancelled() {
                info!(
                    "Bid attempt on loan {} cancelled before submit",
                    attempt.loan_id
                );
                return self.record(attempt).await;
            }

            if token.is_expired(self.config.token_validity) {
                debug!(
                    "Sequence token for loan {} expired before submit",
                    attempt.loan_id
                );
                last_rejection = Some("sequence token expired before submit".to_string());
                continue;
            }

            attempt.state = BidState::Submitted;
            attempt.submitted_at = Some(Utc::now());

            match self
                .api
                .submit_bid(attempt.loan_id, attempt.amount, attempt.payment_option, token)
                .await
            {
                Ok(receipt) => {
                    if let Some(heading) = &receipt.heading {
                        info!("Platform acknowledged bid on loan {}: {}", attempt.loan_id, heading);
                    }
                    return self.verify(attempt).await;
                }
                Err(PlatformError::SequenceToken(detail)) => {
                    warn!(
                        "Sequence token rejected for loan {}: {}; re-previewing",
                        attempt.loan_id, detail
                    );
                    last_rejection = Some(detail);
                    continue;
                }
                Err(e) => return self.finish_failed(attempt, &e).await,
            }
        }
    }

    /// Record a failed attempt for a request whose loan never reached
    /// the store. No network call is made.
    pub async fn fail_ineligible(&self, request: &BidRequest, reason: String) -> BidAttempt {
        let attempt = BidAttempt::new(request.loan_id, request.amount, request.payment_option);
        let err = PlatformError::Ineligible {
            loan_id: request.loan_id,
            reason,
        };
        self.finish_failed(attempt, &err).await
    }

    /// Poll the bidding status until our amount shows up among the own
    /// bids or the poll budget runs out
    async fn verify(&self, mut attempt: BidAttempt) -> BidAttempt {
        for poll in 1..=self.config.verify_polls {
            sleep(self.config.verify_interval).await;
            attempt.verify_polls = poll;

            match self.api.fetch_bidding_status(attempt.loan_id).await {
                Ok(status) if status.has_own_bid_of(attempt.amount) => {
                    attempt.state = BidState::Confirmed;
                    attempt.finished_at = Some(Utc::now());
                    info!(
                        "Bid of {} SEK on loan {} confirmed after {} poll(s)",
                        attempt.amount, attempt.loan_id, poll
                    );
                    if let Err(e) = self.db.mark_own_bid(attempt.loan_id).await {
                        warn!("Failed to flag own bid on loan {}: {}", attempt.loan_id, e);
                    }
                    return self.record(attempt).await;
                }
                Ok(_) => {
                    debug!(
                        "Bid not visible yet on loan {} (poll {}/{})",
                        attempt.loan_id, poll, self.config.verify_polls
                    );
                }
                Err(e) => {
                    warn!(
                        "Verification poll {} failed for loan {}: {}",
                        poll, attempt.loan_id, e
                    );
                }
            }
        }

        // Never retried from here: a resubmit could double the bid
        let err = PlatformError::Unverified {
            loan_id: attempt.loan_id,
            detail: format!(
                "bid not visible after {} verification polls",
                self.config.verify_polls
            ),
        };
        self.finish_failed(attempt, &err).await
    }

    async fn finish_failed(&self, mut attempt: BidAttempt, err: &PlatformError) -> BidAttempt {
        attempt.state = BidState::Failed;
        attempt.finished_at = Some(Utc::now());
        attempt.failure_kind = Some(err.kind().to_string());
        attempt.failure = Some(err.to_string());
        warn!("Bid attempt on loan {} failed: {}", attempt.loan_id, err);
        self.record(attempt).await
    }

    async fn record(&self, attempt: BidAttempt) -> BidAttempt {
        if let Err(e) = self.db.record_bid_attempt(&attempt).await {
            warn!(
                "Failed to record bid attempt for loan {}: {}",
                attempt.loan_id, e
            );
        }
        attempt
    }
}

/// First failed eligibility check, if any. Pure; no network.
fn ineligibility_reason(loan: &Loan, amount: i64) -> Option<String> {
    if loan.status != LoanStatus::Open {
        return Some(format!("bidding is not open (status {})", loan.status));
    }
    if loan.is_fully_funded() {
        return Some("loan is fully funded".to_string());
    }
    if loan.has_own_bid {
        return Some("an own bid already exists on this loan".to_string());
    }
    if loan.current_bid >= loan.max_bid {
        return Some(format!(
            "current funding {} SEK has reached the bid ceiling {} SEK",
            loan.current_bid, loan.max_bid
        ));
    }
    if amount < loan.min_bid {
        return Some(format!(
            "amount {} SEK is below the minimum bid {} SEK",
            amount, loan.min_bid
        ));
    }
    if amount > loan.max_bid {
        return Some(format!(
            "amount {} SEK is above the maximum bid {} SEK",
            amount, loan.max_bid
        ));
    }
    None
}
