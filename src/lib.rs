//! Kameo Bidding Bot Library
//!
//! An automation layer for the Kameo peer-to-peer lending marketplace:
//!
//! 1. **Loan discovery**: walk the public listing pages and mirror every
//!    investment option into a local SQLite store.
//! 2. **Bid placement**: drive the preview/submit sequence-token protocol
//!    for a single bid, then poll the bidding status until the platform
//!    confirms the bid or the attempt is marked unverified.
//!
//! Sessions are cookie-based with TOTP as the second factor, so the bot
//! logs in like a browser and re-authenticates when the platform drops
//! the session.

pub mod api;
pub mod config;
pub mod db;
pub mod services;
pub mod types;

pub use config::Config;
pub use db::Database;
pub use services::{
    BiddingEngine, JobOrchestrator, KameoClient, LoanDiscovery, PlatformApi, PlatformError,
    SessionAuthenticator,
};
pub use types::{BidAttempt, BidRequest, BidState, Loan, LoanStatus, PaymentOption};
