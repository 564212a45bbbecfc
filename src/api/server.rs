//! Axum server setup and configuration

use crate::api::routes;
use crate::services::{
    BiddingEngine, HttpAuthTransport, JobOrchestrator, KameoClient, LoanDiscovery, PlatformApi,
    RateLimiter, SessionAuthenticator,
};
use crate::{Config, Database};
use anyhow::Result;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_path).await?);

        // One HTTP client carries the session cookies for both the login
        // flow and the platform calls
        let http = config.build_http_client()?;
        let transport = HttpAuthTransport::new(http.clone(), config.web_base_url.clone());
        let auth = Arc::new(SessionAuthenticator::new(
            Arc::new(transport),
            config.credential()?,
            Duration::from_secs(config.probe_ttl_secs),
        )?);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests as usize,
            Duration::from_secs(config.rate_limit.window_secs),
        ));
        let api: Arc<dyn PlatformApi> = Arc::new(KameoClient::new(
            http,
            auth,
            limiter,
            config.retry.clone(),
            config.web_base_url.clone(),
            config.api_base_url.clone(),
        ));

        let engine = Arc::new(BiddingEngine::new(
            api.clone(),
            db.clone(),
            config.bidding.clone(),
        ));
        let discovery = Arc::new(LoanDiscovery::new(api, db.clone()));
        let orchestrator = Arc::new(JobOrchestrator::new(
            discovery,
            engine,
            db.clone(),
            config.jobs.clone(),
        ));

        Ok(Self {
            db,
            config: Arc::new(config),
            orchestrator,
        })
    }
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // API routes
    let api_routes = Router::new()
        // Job routes
        .route("/jobs/fetch-loans", post(routes::jobs::start_fetch_loans))
        .route("/jobs/bid", post(routes::jobs::start_bid))
        .route("/jobs", get(routes::jobs::list_jobs))
        .route(
            "/jobs/:job_id",
            get(routes::jobs::get_job).delete(routes::jobs::cancel_job),
        )
        // Loan routes
        .route("/loans", get(routes::loans::list_loans));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
