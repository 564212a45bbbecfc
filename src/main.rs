//! Kameo Bidding Bot CLI
//!
//! Command-line front end for loan discovery and bid placement on the
//! Kameo lending marketplace.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use kameo_bot::services::{
    BiddingEngine, CancelSignal, HttpAuthTransport, KameoClient, LoanDiscovery, PlatformApi,
    RateLimiter, SessionAuthenticator, TotpGenerator,
};
use kameo_bot::types::{BidAttempt, BidRequest, BidState, ListingFilters, Loan, LoanStatus, PaymentOption};
use kameo_bot::{Config, Database};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kameo-bot")]
#[command(about = "Bidding bot for the Kameo lending marketplace")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover current investment options and store them locally
    Loans {
        /// Loans requested per listing page
        #[arg(short, long)]
        limit: Option<u32>,

        /// Maximum listing pages to walk
        #[arg(short, long)]
        max_pages: Option<u32>,
    },

    /// Show the live bidding status for a loan
    Status { loan_id: i64 },

    /// Place a bid on a loan from the local store
    Bid {
        loan_id: i64,

        /// Bid amount in whole SEK
        amount: i64,

        /// Payment option: "ip" (interest payment) or "dp" (down payment)
        #[arg(short, long, default_value = "ip")]
        payment_option: PaymentOption,

        /// Stop after the preview unless the projected return reaches this amount
        #[arg(short = 'r', long)]
        min_return: Option<Decimal>,

        /// Preview the bid without submitting it
        #[arg(long)]
        preview_only: bool,
    },

    /// Subscribe to update mails for a loan
    Subscribe { loan_id: i64 },

    /// Show account balances
    Balances,

    /// Print the current TOTP login code
    Code,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    match cli.command {
        Commands::Loans { limit, max_pages } => discover_loans(&config, limit, max_pages).await?,
        Commands::Status { loan_id } => show_status(&config, loan_id).await?,
        Commands::Bid {
            loan_id,
            amount,
            payment_option,
            min_return,
            preview_only,
        } => {
            let request = BidRequest {
                loan_id,
                amount,
                payment_option,
                min_return,
                preview_only,
            };
            place_bid(&config, request).await?
        }
        Commands::Subscribe { loan_id } => subscribe(&config, loan_id).await?,
        Commands::Balances => show_balances(&config).await?,
        Commands::Code => show_code(&config)?,
    }

    Ok(())
}

/// Assemble the authenticated platform client
fn build_api(config: &Config) -> Result<Arc<dyn PlatformApi>> {
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

    Ok(Arc::new(KameoClient::new(
        http,
        auth,
        limiter,
        config.retry.clone(),
        config.web_base_url.clone(),
        config.api_base_url.clone(),
    )))
}

async fn discover_loans(config: &Config, limit: Option<u32>, max_pages: Option<u32>) -> Result<()> {
    let limit = limit.unwrap_or(config.listing.page_limit);
    let max_pages = max_pages.unwrap_or(config.listing.max_pages);

    println!("\n{}", "=".repeat(70));
    println!("  LOAN DISCOVERY");
    println!(
        "  Markets: {} | Page size: {} | Page cap: {}",
        market_list(&config.listing.filters),
        limit,
        max_pages
    );
    println!("{}\n", "=".repeat(70));

    let db = Arc::new(Database::new(&config.database_path).await?);
    let api = build_api(config)?;
    let discovery = LoanDiscovery::new(api, db.clone());

    let outcome = discovery
        .fetch_all(
            &config.listing.filters,
            limit,
            max_pages,
            &CancelSignal::new(),
            None,
        )
        .await?;

    println!(
        "Walked {} page(s), {} loan(s) stored\n",
        outcome.pages_fetched, outcome.loans_discovered
    );

    let loans = db.get_loans().await?;
    print_loans(&loans);

    Ok(())
}

async fn show_status(config: &Config, loan_id: i64) -> Result<()> {
    let api = build_api(config)?;
    let status = api.fetch_bidding_status(loan_id).await?;

    println!("\n{}", "=".repeat(70));
    println!("  BIDDING STATUS - Loan #{}", loan_id);
    println!("{}\n", "=".repeat(70));

    println!(
        "Current bid: {} SEK (min {} / max {})",
        status.current_bid, status.min_bid, status.max_bid
    );
    if let Some(bidders) = status.total_bidders {
        println!("Bidders: {}", bidders);
    }
    if let Some(funded) = status.funded_percentage {
        println!("Funded: {}%", funded);
    }
    if status.own_bid_amounts.is_empty() {
        println!("Own bids: none");
    } else {
        let amounts: Vec<String> = status
            .own_bid_amounts
            .iter()
            .map(|a| format!("{} SEK", a))
            .collect();
        println!("Own bids: {}", amounts.join(", ").green());
    }

    Ok(())
}

async fn place_bid(config: &Config, request: BidRequest) -> Result<()> {
    println!("\n{}", "=".repeat(70));
    println!("  PLACE BID");
    println!(
        "  Loan #{} | {} SEK | option {}{}",
        request.loan_id,
        request.amount,
        request.payment_option,
        if request.preview_only {
            " | PREVIEW ONLY"
        } else {
            ""
        }
    );
    println!("{}\n", "=".repeat(70));

    let db = Arc::new(Database::new(&config.database_path).await?);
    let api = build_api(config)?;
    let engine = BiddingEngine::new(api, db.clone(), config.bidding.clone());

    let attempt = match db.get_loan(request.loan_id).await? {
        Some(loan) => engine.place_bid(&loan, &request, &CancelSignal::new()).await,
        None => {
            engine
                .fail_ineligible(
                    &request,
                    "loan is not in the local store; run `kameo-bot loans` first".to_string(),
                )
                .await
        }
    };

    print_attempt(&attempt);

    Ok(())
}

async fn subscribe(config: &Config, loan_id: i64) -> Result<()> {
    let api = build_api(config)?;
    let status = api.subscribe_loan(loan_id).await?;

    if status.subscribed {
        println!("{}", format!("Subscribed to loan #{}", loan_id).green());
    } else {
        println!(
            "{}",
            format!("Subscription for loan #{} was not accepted", loan_id).yellow()
        );
    }
    if let Some(message) = status.message {
        println!("{}", message);
    }

    Ok(())
}

async fn show_balances(config: &Config) -> Result<()> {
    let api = build_api(config)?;
    let overview = api.fetch_account_balances().await?;

    println!("\n{}", "=".repeat(70));
    println!("  ACCOUNT BALANCES");
    println!("{}\n", "=".repeat(70));

    if overview.accounts.is_empty() {
        println!("No accounts returned.");
        return Ok(());
    }

    for account in &overview.accounts {
        let available = account
            .available_cash
            .map(|c| c.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let reserved = account
            .reserved_cash
            .map(|c| c.to_string())
            .unwrap_or_else(|| "0".to_string());
        println!(
            "  {} [{}]  available {} | reserved {}",
            account.account_no,
            account.currency_code,
            available.bold(),
            reserved
        );
    }

    Ok(())
}

fn show_code(config: &Config) -> Result<()> {
    let seed = config
        .totp_seed
        .as_deref()
        .context("KAMEO_TOTP_SEED is not set")?;
    let totp = TotpGenerator::new(seed)?;
    let code = totp.current_code()?;

    println!("{} (rotates in {}s)", code.bold(), totp.seconds_remaining());

    Ok(())
}

fn market_list(filters: &ListingFilters) -> String {
    let mut names = Vec::new();
    if filters.sweden {
        names.push("SE");
    }
    if filters.norway {
        names.push("NO");
    }
    if filters.denmark {
        names.push("DK");
    }
    if names.is_empty() {
        return "none".to_string();
    }
    names.join("+")
}

fn print_loans(loans: &[Loan]) {
    if loans.is_empty() {
        println!("No loans stored.");
        return;
    }

    println!("STORED LOANS");
    println!("{}", "-".repeat(70));

    for (i, loan) in loans.iter().enumerate() {
        let own_bid = if loan.has_own_bid {
            " [OWN BID]".cyan()
        } else {
            "".normal()
        };
        println!(
            "\n{}. #{} \"{}\" {}{}",
            i + 1,
            loan.loan_id,
            loan.title,
            paint_loan_status(loan.status),
            own_bid
        );
        println!(
            "   {} SEK | rate {} | funded {}",
            loan.amount,
            loan.interest_rate
                .map(|r| format!("{}%", r))
                .unwrap_or_else(|| "n/a".to_string()),
            loan.funded_percentage
                .map(|p| format!("{}%", p))
                .unwrap_or_else(|| "n/a".to_string()),
        );
        println!(
            "   bids {} SEK | min {} | max {} | closes {}",
            loan.current_bid,
            loan.min_bid,
            loan.max_bid,
            loan.closes_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "n/a".to_string()),
        );
    }

    println!();
}

fn print_attempt(attempt: &BidAttempt) {
    println!("State: {}", paint_bid_state(attempt.state));
    if let Some(hash) = &attempt.sequence_hash {
        println!("Sequence hash: {}", hash);
    }
    if let Some(ret) = attempt.estimated_return {
        println!("Estimated return: {} SEK", ret);
    }
    if let Some(fees) = attempt.fees {
        println!("Fees: {} SEK", fees);
    }
    if attempt.verify_polls > 0 {
        println!("Verification polls: {}", attempt.verify_polls);
    }
    if let Some(failure) = &attempt.failure {
        println!("Failure: {}", failure.red());
    }
}

fn paint_loan_status(status: LoanStatus) -> ColoredString {
    match status {
        LoanStatus::Open => status.to_string().green(),
        LoanStatus::Funded | LoanStatus::Active => status.to_string().yellow(),
        LoanStatus::Closed | LoanStatus::Canceled => status.to_string().red(),
        LoanStatus::Completed | LoanStatus::Unknown => status.to_string().normal(),
    }
}

fn paint_bid_state(state: BidState) -> ColoredString {
    match state {
        BidState::Confirmed => state.to_string().green().bold(),
        BidState::Failed => state.to_string().red().bold(),
        BidState::Submitted => state.to_string().yellow(),
        BidState::Previewed => state.to_string().cyan(),
        BidState::Eligible => state.to_string().normal(),
    }
}
