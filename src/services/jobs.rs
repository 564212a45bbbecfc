//! Background job registry and execution
//!
//! Discovery and bidding run as tracked jobs: `start` registers the job
//! and spawns its work, callers poll `status` for a snapshot, `cancel`
//! raises a cooperative flag the operation checks at its checkpoints.
//! One mutex guards the registry, so no caller ever observes a job mid
//! transition. A periodic sweep drops terminal jobs past retention;
//! running jobs are never dropped.

use super::bidding::BiddingEngine;
use super::discovery::{DiscoveryProgress, LoanDiscovery};
use crate::db::Database;
use crate::types::{BidRequest, BidState, ListingFilters};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cooperative cancellation flag shared between a job and its operation
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// What a job should do
#[derive(Debug, Clone)]
pub enum JobSpec {
    FetchLoans {
        filters: ListingFilters,
        limit: u32,
        max_pages: u32,
    },
    PlaceBid(BidRequest),
}

impl JobSpec {
    fn kind(&self) -> &'static str {
        match self {
            JobSpec::FetchLoans { .. } => "fetch_loans",
            JobSpec::PlaceBid(_) => "place_bid",
        }
    }
}

/// Caller-facing copy of one job's state
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub kind: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

struct JobEntry {
    id: Uuid,
    kind: &'static str,
    state: JobState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    progress: Option<Value>,
    result: Option<Value>,
    error: Option<String>,
    cancel: CancelSignal,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            kind: self.kind.to_string(),
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            progress: self.progress.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// How long finished jobs remain queryable
    pub retention: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Registry of background operations
pub struct JobOrchestrator {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    discovery: Arc<LoanDiscovery>,
    engine: Arc<BiddingEngine>,
    db: Arc<Database>,
    config: JobsConfig,
}

impl JobOrchestrator {
    pub fn new(
        discovery: Arc<LoanDiscovery>,
        engine: Arc<BiddingEngine>,
        db: Arc<Database>,
        config: JobsConfig,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            discovery,
            engine,
            db,
            config,
        }
    }

    /// Register a job and start executing it; returns immediately
    pub async fn start(self: &Arc<Self>, spec: JobSpec) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancelSignal::new();
        let now = Utc::now();
        let entry = JobEntry {
            id,
            kind: spec.kind(),
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            progress: None,
            result: None,
            error: None,
            cancel: cancel.clone(),
        };
        self.jobs.lock().await.insert(id, entry);
        info!("Job {} queued ({})", id, spec.kind());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(id, spec, cancel).await;
        });
        id
    }

    /// Snapshot of one job; None when unknown or already purged
    pub async fn status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(&id).map(JobEntry::snapshot)
    }

    /// All known jobs, newest first
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(JobEntry::snapshot).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Mark a job cancelled and raise its flag. The operation stops at
    /// its next checkpoint; an already-terminal job is left as is.
    pub async fn cancel(&self, id: Uuid) -> Option<JobSnapshot> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(&id)?;
        if !entry.state.is_terminal() {
            let now = Utc::now();
            entry.state = JobState::Cancelled;
            entry.updated_at = now;
            entry.finished_at = Some(now);
            entry.cancel.cancel();
            info!("Job {} cancelled", id);
        }
        Some(entry.snapshot())
    }

    /// Drop terminal jobs whose last update is past retention
    pub async fn purge_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, e| !(e.state.is_terminal() && now - e.updated_at > retention));
        before - jobs.len()
    }

    /// Periodic retention sweep, runs until the handle is dropped
    pub fn spawn_retention_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                sleep(self.config.sweep_interval).await;
                let purged = self.purge_expired().await;
                if purged > 0 {
                    debug!("Purged {} finished job(s)", purged);
                }
            }
        })
    }

    async fn execute(self: Arc<Self>, id: Uuid, spec: JobSpec, cancel: CancelSignal) {
        if !self.transition_running(id).await {
            // cancelled before it ever ran
            return;
        }
        let outcome = match spec {
            JobSpec::FetchLoans {
                filters,
                limit,
                max_pages,
            } => {
                self.run_fetch_loans(id, filters, limit, max_pages, &cancel)
                    .await
            }
            JobSpec::PlaceBid(request) => self.run_place_bid(&request, &cancel).await,
        };
        self.complete(id, outcome).await;
    }

    async fn transition_running(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(entry) if entry.state == JobState::Pending => {
                entry.state = JobState::Running;
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    async fn update_progress(&self, id: Uuid, progress: Value) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(&id) {
            if !entry.state.is_terminal() {
                entry.progress = Some(progress);
                entry.updated_at = Utc::now();
            }
        }
    }

    async fn complete(&self, id: Uuid, outcome: Result<Value, String>) {
        let mut jobs = self.jobs.lock().await;
        let entry = match jobs.get_mut(&id) {
            Some(e) => e,
            None => return,
        };
        if entry.state == JobState::Cancelled {
            info!("Job {} finished after cancellation; result discarded", id);
            return;
        }
        let now = Utc::now();
        match outcome {
            Ok(result) => {
                entry.state = JobState::Succeeded;
                entry.result = Some(result);
                info!("Job {} succeeded", id);
            }
            Err(error) => {
                warn!("Job {} failed: {}", id, error);
                entry.state = JobState::Failed;
                entry.error = Some(error);
            }
        }
        entry.updated_at = now;
        entry.finished_at = Some(now);
    }

    async fn run_fetch_loans(
        self: &Arc<Self>,
        id: Uuid,
        filters: ListingFilters,
        limit: u32,
        max_pages: u32,
        cancel: &CancelSignal,
    ) -> Result<Value, String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DiscoveryProgress>();
        let forwarder = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    let payload = serde_json::to_value(&p).unwrap_or_default();
                    this.update_progress(id, payload).await;
                }
            })
        };

        let outcome = self
            .discovery
            .fetch_all(&filters, limit, max_pages, cancel, Some(tx))
            .await;
        let _ = forwarder.await;

        match outcome {
            Ok(o) => Ok(serde_json::to_value(&o).unwrap_or_default()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn run_place_bid(
        &self,
        request: &BidRequest,
        cancel: &CancelSignal,
    ) -> Result<Value, String> {
        let loan = match self.db.get_loan(request.loan_id).await {
            Ok(Some(l)) => l,
            Ok(None) => {
                let attempt = self
                    .engine
                    .fail_ineligible(
                        request,
                        "loan is not in the local store; run loan discovery first".to_string(),
                    )
                    .await;
                return Err(attempt
                    .failure
                    .unwrap_or_else(|| "loan is not in the local store".to_string()));
            }
            Err(e) => return Err(format!("loan lookup failed: {}", e)),
        };

        let attempt = self.engine.place_bid(&loan, request, cancel).await;
        match attempt.state {
            BidState::Failed => Err(attempt
                .failure
                .unwrap_or_else(|| "bid attempt failed".to_string())),
            _ => Ok(serde_json::to_value(&attempt).unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bidding::BiddingConfig;
    use crate::services::kameo_client::PlatformApi;
    use crate::services::platform_errors::PlatformError;
    use crate::types::{
        AccountOverview, BiddingStatus, BidPreview, BidReceipt, Loan, LoanStatus, PaymentOption,
        SequenceToken, SubscriptionStatus,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicU32;

    fn loan(id: i64) -> Loan {
        Loan {
            loan_id: id,
            title: format!("Projekt {}", id),
            amount: 1_000_000,
            interest_rate: None,
            min_bid: 500,
            max_bid: 100_000,
            current_bid: 10_000,
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

    struct ScriptedPlatform {
        pages: Vec<Vec<Loan>>,
        listing_delay: Duration,
        listing_calls: AtomicU32,
    }

    impl ScriptedPlatform {
        fn new(pages: Vec<Vec<Loan>>, listing_delay: Duration) -> Self {
            Self {
                pages,
                listing_delay,
                listing_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PlatformApi for ScriptedPlatform {
        async fn fetch_investment_options(
            &self,
            _filters: &ListingFilters,
            _limit: u32,
            page: u32,
        ) -> Result<Vec<Loan>, PlatformError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.listing_delay).await;
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
                current_bid: 10_000,
                min_bid: 500,
                max_bid: 100_000,
                total_bidders: None,
                funded_percentage: None,
                own_bid_amounts: vec![3000],
            })
        }

        async fn preview_bid(
            &self,
            _loan_id: i64,
            _amount: i64,
            _payment_option: PaymentOption,
        ) -> Result<BidPreview, PlatformError> {
            Ok(BidPreview {
                sequence_hash: "hash-1".to_string(),
                estimated_return: Some(Decimal::from(240)),
                fees: None,
            })
        }

        async fn submit_bid(
            &self,
            _loan_id: i64,
            _amount: i64,
            _payment_option: PaymentOption,
            _token: SequenceToken,
        ) -> Result<BidReceipt, PlatformError> {
            Ok(BidReceipt {
                heading: None,
                messages: vec![],
            })
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

    async fn make_stack(
        pages: Vec<Vec<Loan>>,
        listing_delay: Duration,
        config: JobsConfig,
    ) -> (Arc<ScriptedPlatform>, Arc<Database>, Arc<JobOrchestrator>) {
        let api = Arc::new(ScriptedPlatform::new(pages, listing_delay));
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let discovery = Arc::new(LoanDiscovery::new(api.clone(), db.clone()));
        let engine = Arc::new(BiddingEngine::new(
            api.clone(),
            db.clone(),
            BiddingConfig {
                verify_interval: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        let orchestrator = Arc::new(JobOrchestrator::new(discovery, engine, db.clone(), config));
        (api, db, orchestrator)
    }

    async fn wait_terminal(orchestrator: &Arc<JobOrchestrator>, id: Uuid) -> JobSnapshot {
        for _ in 0..400 {
            if let Some(s) = orchestrator.status(id).await {
                if s.state.is_terminal() {
                    return s;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not reach a terminal state", id);
    }

    #[tokio::test]
    async fn test_fetch_job_lifecycle() {
        let pages = vec![
            vec![loan(1), loan(2)],
            vec![loan(3), loan(4)],
            vec![loan(5), loan(6)],
            vec![loan(7), loan(8)],
            vec![loan(9)],
        ];
        let (_api, db, orchestrator) =
            make_stack(pages, Duration::from_millis(1), JobsConfig::default()).await;

        let id = orchestrator
            .start(JobSpec::FetchLoans {
                filters: ListingFilters::default(),
                limit: 2,
                max_pages: 10,
            })
            .await;

        assert!(orchestrator.status(id).await.is_some());

        let snapshot = wait_terminal(&orchestrator, id).await;
        assert_eq!(snapshot.state, JobState::Succeeded);
        assert_eq!(snapshot.kind, "fetch_loans");
        let result = snapshot.result.unwrap();
        assert_eq!(result["loans_discovered"], 9);
        assert_eq!(result["pages_fetched"], 5);
        assert!(snapshot.finished_at.is_some());
        assert_eq!(db.get_loans().await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (_api, _db, orchestrator) =
            make_stack(vec![], Duration::ZERO, JobsConfig::default()).await;

        let ghost = Uuid::new_v4();
        assert!(orchestrator.status(ghost).await.is_none());
        assert!(orchestrator.cancel(ghost).await.is_none());
    }

    #[tokio::test]
    async fn test_place_bid_job_carries_the_attempt() {
        let (_api, db, orchestrator) =
            make_stack(vec![], Duration::ZERO, JobsConfig::default()).await;
        db.upsert_loan(&loan(4852)).await.unwrap();

        let id = orchestrator
            .start(JobSpec::PlaceBid(BidRequest {
                loan_id: 4852,
                amount: 3000,
                payment_option: PaymentOption::InterestPayment,
                min_return: None,
                preview_only: false,
            }))
            .await;

        let snapshot = wait_terminal(&orchestrator, id).await;
        assert_eq!(snapshot.state, JobState::Succeeded);
        assert_eq!(snapshot.kind, "place_bid");
        let result = snapshot.result.unwrap();
        assert_eq!(result["state"], "Confirmed");
        assert_eq!(result["amount"], 3000);
    }

    #[tokio::test]
    async fn test_place_bid_requires_a_discovered_loan() {
        let (_api, db, orchestrator) =
            make_stack(vec![], Duration::ZERO, JobsConfig::default()).await;

        let id = orchestrator
            .start(JobSpec::PlaceBid(BidRequest {
                loan_id: 9999,
                amount: 3000,
                payment_option: PaymentOption::InterestPayment,
                min_return: None,
                preview_only: false,
            }))
            .await;

        let snapshot = wait_terminal(&orchestrator, id).await;
        assert_eq!(snapshot.state, JobState::Failed);
        assert!(snapshot.error.unwrap().contains("not in the local store"));

        // the refusal still lands in the audit log
        let attempts = db.recent_bid_attempts(5).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].failure_kind.as_deref(), Some("ineligible"));
    }

    #[tokio::test]
    async fn test_cancelled_job_stays_cancelled() {
        // every page full so only cancellation stops the walk
        let pages = (0..50).map(|p| vec![loan(p + 1), loan(p + 1000)]).collect();
        let (api, _db, orchestrator) =
            make_stack(pages, Duration::from_millis(20), JobsConfig::default()).await;

        let id = orchestrator
            .start(JobSpec::FetchLoans {
                filters: ListingFilters::default(),
                limit: 2,
                max_pages: 50,
            })
            .await;

        sleep(Duration::from_millis(30)).await;
        let cancelled = orchestrator.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        let calls_at_cancel = api.listing_calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(120)).await;

        // the in-flight page may finish; nothing more starts
        assert!(api.listing_calls.load(Ordering::SeqCst) <= calls_at_cancel + 1);
        let snapshot = orchestrator.status(id).await.unwrap();
        assert_eq!(snapshot.state, JobState::Cancelled);
        assert!(snapshot.result.is_none());
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_retention_purges_finished_jobs_only() {
        let config = JobsConfig {
            retention: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(3600),
        };
        // one loan per page so a limit of 1 keeps every page full
        let pages = (0..50).map(|p| vec![loan(p + 1)]).collect();
        let (_api, _db, orchestrator) = make_stack(pages, Duration::from_millis(20), config).await;

        let finished = orchestrator
            .start(JobSpec::FetchLoans {
                filters: ListingFilters::default(),
                limit: 5,
                max_pages: 1,
            })
            .await;
        wait_terminal(&orchestrator, finished).await;

        // long-running job that outlives the retention window
        let running = orchestrator
            .start(JobSpec::FetchLoans {
                filters: ListingFilters::default(),
                limit: 1,
                max_pages: 50,
            })
            .await;

        sleep(Duration::from_millis(80)).await;
        let purged = orchestrator.purge_expired().await;
        assert_eq!(purged, 1);
        assert!(orchestrator.status(finished).await.is_none());
        assert!(orchestrator.status(running).await.is_some());

        orchestrator.cancel(running).await;
    }
}
