//! Configuration management for the Kameo bot

use crate::services::bidding::BiddingConfig;
use crate::services::jobs::JobsConfig;
use crate::services::retry::RetryConfig;
use crate::services::session::Credential;
use crate::types::ListingFilters;
use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, USER_AGENT};
use reqwest::redirect::Policy;
use std::env;
use std::time::Duration;

const USER_AGENT_VALUE: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Kameo account email (required for anything authenticated)
    pub username: Option<String>,

    /// Kameo account password
    pub password: Option<String>,

    /// Base32 TOTP seed for the second factor
    pub totp_seed: Option<String>,

    /// Path to SQLite database
    pub database_path: String,

    /// Web frontend base URL (login, account endpoints)
    pub web_base_url: String,

    /// JSON API base URL (listing, bidding)
    pub api_base_url: String,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Full request timeout in seconds
    pub request_timeout_secs: u64,

    /// How long a validated session is trusted before re-probing
    pub probe_ttl_secs: u64,

    /// Requests allowed per rolling window
    pub rate_limit: RateLimitConfig,

    /// Listing pagination settings
    pub listing: ListingConfig,

    /// Retry policy for platform calls
    pub retry: RetryConfig,

    /// Bid protocol settings
    pub bidding: BiddingConfig,

    /// Job registry settings
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window (default: 60)
    pub max_requests: u32,
    /// Window length in seconds (default: 60)
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingConfig {
    /// Loans requested per page (default: 12)
    pub page_limit: u32,
    /// Safety cap on pages walked per discovery run (default: 10)
    pub max_pages: u32,
    /// Which markets to list
    pub filters: ListingFilters,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            page_limit: 12,
            max_pages: 10,
            filters: ListingFilters::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let username = env::var("KAMEO_USERNAME").ok().filter(|s| !s.is_empty());
        let password = env::var("KAMEO_PASSWORD").ok().filter(|s| !s.is_empty());
        let totp_seed = env::var("KAMEO_TOTP_SEED").ok().filter(|s| !s.is_empty());

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "kameo.db".to_string());

        let web_base_url = env::var("KAMEO_WEB_BASE_URL")
            .unwrap_or_else(|_| KameoApi::WEB_BASE.to_string());

        let api_base_url = env::var("KAMEO_API_BASE_URL")
            .unwrap_or_else(|_| KameoApi::API_BASE.to_string());

        let connect_timeout_secs = env::var("KAMEO_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let request_timeout_secs = env::var("KAMEO_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let probe_ttl_secs = env::var("KAMEO_PROBE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let rate_limit = RateLimitConfig {
            max_requests: env::var("KAMEO_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            window_secs: env::var("KAMEO_RATE_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        };

        let listing = ListingConfig {
            page_limit: env::var("KAMEO_LISTING_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12),
            max_pages: env::var("KAMEO_LISTING_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            filters: ListingFilters {
                sweden: env_flag("KAMEO_ORIGIN_SWEDEN", true),
                norway: env_flag("KAMEO_ORIGIN_NORWAY", false),
                denmark: env_flag("KAMEO_ORIGIN_DENMARK", true),
            },
        };

        // Validate configuration
        if rate_limit.max_requests == 0 {
            anyhow::bail!("KAMEO_RATE_LIMIT must be at least 1");
        }
        if listing.page_limit == 0 {
            anyhow::bail!("KAMEO_LISTING_LIMIT must be at least 1");
        }

        Ok(Self {
            username,
            password,
            totp_seed,
            database_path,
            web_base_url,
            api_base_url,
            connect_timeout_secs,
            request_timeout_secs,
            probe_ttl_secs,
            rate_limit,
            listing,
            retry: RetryConfig::default(),
            bidding: BiddingConfig::default(),
            jobs: JobsConfig::default(),
        })
    }

    /// Check whether login credentials are fully configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some() && self.totp_seed.is_some()
    }

    /// Credentials for the session authenticator
    pub fn credential(&self) -> Result<Credential> {
        let username = self
            .username
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KAMEO_USERNAME is required"))?;
        let password = self
            .password
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KAMEO_PASSWORD is required"))?;
        let totp_seed = self
            .totp_seed
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KAMEO_TOTP_SEED is required"))?;
        Ok(Credential {
            username,
            password,
            totp_seed,
        })
    }

    /// Shared HTTP client: cookie jar for the session, bounded
    /// redirects so login outcomes stay observable from the final URL
    pub fn build_http_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("sv"));
        headers.insert(ORIGIN, HeaderValue::from_str(&self.web_base_url)?);
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(Policy::limited(5))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .default_headers(headers)
            .build()?;
        Ok(client)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Kameo endpoint configuration
pub struct KameoApi;

impl KameoApi {
    pub const WEB_BASE: &'static str = "https://www.kameo.se";
    pub const API_BASE: &'static str = "https://api.kameo.se/v1";
}
