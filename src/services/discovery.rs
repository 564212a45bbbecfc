//! Loan discovery
//!
//! Walks the paginated investment-options listing and upserts every
//! loan into the local store. Pagination stops on the first short page,
//! at the page cap, or at the cancellation checkpoint between pages.

use super::jobs::CancelSignal;
use super::kameo_client::PlatformApi;
use crate::db::Database;
use crate::types::ListingFilters;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Snapshot sent after each page
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryProgress {
    pub pages_fetched: u32,
    pub loans_discovered: usize,
}

/// Final tally of one discovery run
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub pages_fetched: u32,
    pub loans_discovered: usize,
    pub cancelled: bool,
}

pub struct LoanDiscovery {
    api: Arc<dyn PlatformApi>,
    db: Arc<Database>,
}

impl LoanDiscovery {
    pub fn new(api: Arc<dyn PlatformApi>, db: Arc<Database>) -> Self {
        Self { api, db }
    }

    /// Fetch up to `max_pages` pages of `limit` loans each and upsert
    /// them into the store. `progress` (when given) receives a snapshot
    /// after every page.
    pub async fn fetch_all(
        &self,
        filters: &ListingFilters,
        limit: u32,
        max_pages: u32,
        cancel: &CancelSignal,
        progress: Option<UnboundedSender<DiscoveryProgress>>,
    ) -> Result<DiscoveryOutcome> {
        let mut page: u32 = 1;
        let mut pages_fetched: u32 = 0;
        let mut total: usize = 0;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                info!("Discovery cancelled after {} page(s)", pages_fetched);
                cancelled = true;
                break;
            }
            if page > max_pages {
                warn!("Stopping discovery at the {}-page safety cap", max_pages);
                break;
            }

            let loans = self.api.fetch_investment_options(filters, limit, page).await?;
            pages_fetched += 1;
            let batch = loans.len();

            for loan in &loans {
                self.db.upsert_loan(loan).await?;
            }
            total += batch;

            debug!("Discovery page {}: {} loans", page, batch);
            if let Some(tx) = &progress {
                let _ = tx.send(DiscoveryProgress {
                    pages_fetched,
                    loans_discovered: total,
                });
            }

            // A short page is the last page
            if (batch as u32) < limit {
                break;
            }
            page += 1;
        }

        info!(
            "Discovered {} loans across {} page(s)",
            total, pages_fetched
        );
        Ok(DiscoveryOutcome {
            pages_fetched,
            loans_discovered: total,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::platform_errors::PlatformError;
    use crate::types::{
        AccountOverview, BiddingStatus, BidPreview, BidReceipt, Loan, LoanStatus, PaymentOption,
        SequenceToken, SubscriptionStatus,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn loan(id: i64) -> Loan {
        Loan {
            loan_id: id,
            title: format!("Projekt {}", id),
            amount: 1_000_000,
            interest_rate: None,
            min_bid: 500,
            max_bid: 100_000,
            current_bid: 0,
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

    struct PagedPlatform {
        pages: Vec<Vec<Loan>>,
        listing_calls: AtomicU32,
        cancel_after_first_page: StdMutex<Option<CancelSignal>>,
    }

    impl PagedPlatform {
        fn new(pages: Vec<Vec<Loan>>) -> Self {
            Self {
                pages,
                listing_calls: AtomicU32::new(0),
                cancel_after_first_page: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl PlatformApi for PagedPlatform {
        async fn fetch_investment_options(
            &self,
            _filters: &ListingFilters,
            _limit: u32,
            page: u32,
        ) -> Result<Vec<Loan>, PlatformError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if page == 1 {
                if let Some(signal) = self.cancel_after_first_page.lock().unwrap().take() {
                    signal.cancel();
                }
            }
            Ok(self
                .pages
                .get((page - 1) as usize)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_bidding_status(&self, loan_id: i64) -> Result<BiddingStatus, PlatformError> {
            Ok(BiddingStatus {
                loan_id,
                sequence_hash: None,
                current_bid: 0,
                min_bid: 0,
                max_bid: 0,
                total_bidders: None,
                funded_percentage: None,
                own_bid_amounts: vec![],
            })
        }

        async fn preview_bid(
            &self,
            _loan_id: i64,
            _amount: i64,
            _payment_option: PaymentOption,
        ) -> Result<BidPreview, PlatformError> {
            Err(PlatformError::Validation("not scripted".to_string()))
        }

        async fn submit_bid(
            &self,
            _loan_id: i64,
            _amount: i64,
            _payment_option: PaymentOption,
            _token: SequenceToken,
        ) -> Result<BidReceipt, PlatformError> {
            Err(PlatformError::Validation("not scripted".to_string()))
        }

        async fn subscribe_loan(&self, _loan_id: i64) -> Result<SubscriptionStatus, PlatformError> {
            Ok(SubscriptionStatus {
                subscribed: true,
                message: None,
            })
        }

        async fn fetch_account_balances(&self) -> Result<AccountOverview, PlatformError> {
            Ok(AccountOverview {
                accounts: vec![],
                xsrf_token: None,
            })
        }
    }

    async fn make_discovery(pages: Vec<Vec<Loan>>) -> (Arc<PagedPlatform>, Arc<Database>, LoanDiscovery) {
        let api = Arc::new(PagedPlatform::new(pages));
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let discovery = LoanDiscovery::new(api.clone(), db.clone());
        (api, db, discovery)
    }

    #[tokio::test]
    async fn test_short_page_ends_pagination() {
        let pages = vec![
            vec![loan(1), loan(2), loan(3)],
            vec![loan(4), loan(5), loan(6)],
            vec![loan(7)],
        ];
        let (api, db, discovery) = make_discovery(pages).await;

        let outcome = discovery
            .fetch_all(&ListingFilters::default(), 3, 10, &CancelSignal::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.loans_discovered, 7);
        assert!(!outcome.cancelled);
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 3);
        assert_eq!(db.get_loans().await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_page_cap_bounds_the_walk() {
        // every page full, so only the cap stops it
        let pages = (0..20)
            .map(|p| vec![loan(p * 2 + 1), loan(p * 2 + 2)])
            .collect();
        let (api, _db, discovery) = make_discovery(pages).await;

        let outcome = discovery
            .fetch_all(&ListingFilters::default(), 2, 4, &CancelSignal::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.pages_fetched, 4);
        assert_eq!(outcome.loans_discovered, 8);
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_checkpoint_between_pages() {
        let pages = (0..10).map(|p| vec![loan(p + 1), loan(p + 100)]).collect();
        let (api, _db, discovery) = make_discovery(pages).await;
        let cancel = CancelSignal::new();
        *api.cancel_after_first_page.lock().unwrap() = Some(cancel.clone());

        let outcome = discovery
            .fetch_all(&ListingFilters::default(), 2, 10, &cancel, None)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.pages_fetched, 1);
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_page() {
        let pages = vec![vec![loan(1), loan(2)], vec![loan(3)]];
        let (_api, _db, discovery) = make_discovery(pages).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        discovery
            .fetch_all(&ListingFilters::default(), 2, 10, &CancelSignal::new(), Some(tx))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.pages_fetched, 1);
        assert_eq!(first.loans_discovered, 2);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.loans_discovered, 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_rediscovery_updates_rather_than_duplicates() {
        let (_api, db, _discovery) = make_discovery(vec![]).await;

        let mut l = loan(42);
        db.upsert_loan(&l).await.unwrap();
        l.current_bid = 250_000;
        db.upsert_loan(&l).await.unwrap();

        let stored = db.get_loans().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].current_bid, 250_000);
    }
}
