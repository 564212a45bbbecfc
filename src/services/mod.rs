//! Background services for the bidding bot

pub mod bidding;
pub mod discovery;
pub mod jobs;
pub mod kameo_client;
pub mod platform_errors;
pub mod rate_limiter;
pub mod retry;
pub mod session;
pub mod totp;

pub use bidding::{BiddingConfig, BiddingEngine};
pub use discovery::{DiscoveryOutcome, DiscoveryProgress, LoanDiscovery};
pub use jobs::{CancelSignal, JobOrchestrator, JobSnapshot, JobSpec, JobState, JobsConfig};
pub use kameo_client::{KameoClient, PlatformApi};
pub use platform_errors::PlatformError;
pub use rate_limiter::RateLimiter;
pub use retry::{with_retry, RetryConfig};
pub use session::{AuthTransport, Credential, HttpAuthTransport, SessionAuthenticator};
pub use totp::TotpGenerator;
