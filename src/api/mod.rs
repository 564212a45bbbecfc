//! Web API module for the bidding bot
//!
//! Provides REST endpoints for loan discovery and bid jobs.

pub mod routes;
pub mod server;

pub use server::{create_app, AppState};
