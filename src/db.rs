//! SQLite store for discovered loans and the bid attempt audit log

use crate::types::{BidAttempt, BidState, Loan, LoanStatus, PaymentOption};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loans (
                loan_id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                amount INTEGER NOT NULL,
                interest_rate TEXT,
                min_bid INTEGER NOT NULL DEFAULT 0,
                max_bid INTEGER NOT NULL DEFAULT 0,
                current_bid INTEGER NOT NULL DEFAULT 0,
                funded_percentage TEXT,
                status TEXT NOT NULL,
                opens_at TEXT,
                closes_at TEXT,
                url TEXT,
                risk_grade TEXT,
                duration_months INTEGER,
                origin TEXT,
                has_own_bid INTEGER NOT NULL DEFAULT 0,
                first_seen_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bid_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                loan_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                payment_option TEXT NOT NULL,
                state TEXT NOT NULL,
                sequence_hash TEXT,
                estimated_return TEXT,
                fees TEXT,
                started_at TEXT NOT NULL,
                previewed_at TEXT,
                submitted_at TEXT,
                finished_at TEXT,
                verify_polls INTEGER NOT NULL DEFAULT 0,
                failure_kind TEXT,
                failure TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_loans_status ON loans(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bid_attempts_loan ON bid_attempts(loan_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bid_attempts_state ON bid_attempts(state)")
            .execute(&self.pool)
            .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== LOAN STORE ====================

    /// Insert or refresh a discovered loan. The own-bid flag and the
    /// first-seen timestamp survive refreshes.
    pub async fn upsert_loan(&self, loan: &Loan) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO loans (
                loan_id, title, amount, interest_rate, min_bid, max_bid,
                current_bid, funded_percentage, status, opens_at, closes_at,
                url, risk_grade, duration_months, origin, has_own_bid,
                first_seen_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(loan_id) DO UPDATE SET
                title = excluded.title,
                amount = excluded.amount,
                interest_rate = excluded.interest_rate,
                min_bid = excluded.min_bid,
                max_bid = excluded.max_bid,
                current_bid = excluded.current_bid,
                funded_percentage = excluded.funded_percentage,
                status = excluded.status,
                opens_at = excluded.opens_at,
                closes_at = excluded.closes_at,
                url = excluded.url,
                risk_grade = excluded.risk_grade,
                duration_months = excluded.duration_months,
                origin = excluded.origin,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(loan.loan_id)
        .bind(&loan.title)
        .bind(loan.amount)
        .bind(loan.interest_rate.map(|d| d.to_string()))
        .bind(loan.min_bid)
        .bind(loan.max_bid)
        .bind(loan.current_bid)
        .bind(loan.funded_percentage.map(|d| d.to_string()))
        .bind(loan.status.as_str())
        .bind(loan.opens_at.map(|d| d.to_rfc3339()))
        .bind(loan.closes_at.map(|d| d.to_rfc3339()))
        .bind(&loan.url)
        .bind(&loan.risk_grade)
        .bind(loan.duration_months)
        .bind(&loan.origin)
        .bind(loan.has_own_bid)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All stored loans, soonest closing first
    pub async fn get_loans(&self) -> Result<Vec<Loan>> {
        let rows = sqlx::query(
            "SELECT * FROM loans ORDER BY closes_at IS NULL, closes_at ASC, loan_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(|row| row_to_loan(row).ok()).collect())
    }

    /// Stored loans still open for bidding
    pub async fn get_open_loans(&self) -> Result<Vec<Loan>> {
        let rows = sqlx::query(
            "SELECT * FROM loans WHERE status = 'open' ORDER BY closes_at IS NULL, closes_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(|row| row_to_loan(row).ok()).collect())
    }

    pub async fn get_loan(&self, loan_id: i64) -> Result<Option<Loan>> {
        let row = sqlx::query("SELECT * FROM loans WHERE loan_id = ?")
            .bind(loan_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_loan(&r)?)),
            None => Ok(None),
        }
    }

    /// Flag a loan as carrying one of our bids
    pub async fn mark_own_bid(&self, loan_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE loans SET has_own_bid = 1, updated_at = ? WHERE loan_id = ?")
            .bind(now)
            .bind(loan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== BID AUDIT LOG ====================

    /// Append one bid attempt, failed ones included
    pub async fn record_bid_attempt(&self, attempt: &BidAttempt) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO bid_attempts (
                loan_id, amount, payment_option, state, sequence_hash,
                estimated_return, fees, started_at, previewed_at,
                submitted_at, finished_at, verify_polls, failure_kind, failure
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.loan_id)
        .bind(attempt.amount)
        .bind(attempt.payment_option.as_str())
        .bind(attempt.state.to_string())
        .bind(&attempt.sequence_hash)
        .bind(attempt.estimated_return.map(|d| d.to_string()))
        .bind(attempt.fees.map(|d| d.to_string()))
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.previewed_at.map(|d| d.to_rfc3339()))
        .bind(attempt.submitted_at.map(|d| d.to_rfc3339()))
        .bind(attempt.finished_at.map(|d| d.to_rfc3339()))
        .bind(attempt.verify_polls as i64)
        .bind(&attempt.failure_kind)
        .bind(&attempt.failure)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Latest attempts, newest first
    pub async fn recent_bid_attempts(&self, limit: i64) -> Result<Vec<BidAttempt>> {
        let rows = sqlx::query("SELECT * FROM bid_attempts ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row_to_attempt(row).ok())
            .collect())
    }

    /// Attempts recorded for one loan, newest first
    pub async fn bid_attempts_for_loan(&self, loan_id: i64) -> Result<Vec<BidAttempt>> {
        let rows = sqlx::query("SELECT * FROM bid_attempts WHERE loan_id = ? ORDER BY id DESC")
            .bind(loan_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row_to_attempt(row).ok())
            .collect())
    }
}

fn row_to_loan(row: &SqliteRow) -> Result<Loan> {
    let interest_rate: Option<String> = row.get("interest_rate");
    let funded_percentage: Option<String> = row.get("funded_percentage");
    let status_str: String = row.get("status");
    let opens_at: Option<String> = row.get("opens_at");
    let closes_at: Option<String> = row.get("closes_at");

    Ok(Loan {
        loan_id: row.get("loan_id"),
        title: row.get("title"),
        amount: row.get("amount"),
        interest_rate: interest_rate.and_then(|s| Decimal::from_str(&s).ok()),
        min_bid: row.get("min_bid"),
        max_bid: row.get("max_bid"),
        current_bid: row.get("current_bid"),
        funded_percentage: funded_percentage.and_then(|s| Decimal::from_str(&s).ok()),
        status: status_str.parse().unwrap_or(LoanStatus::Unknown),
        opens_at: opens_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        closes_at: closes_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        url: row.get("url"),
        risk_grade: row.get("risk_grade"),
        duration_months: row.get("duration_months"),
        origin: row.get("origin"),
        has_own_bid: row.get("has_own_bid"),
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<BidAttempt> {
    let state_str: String = row.get("state");
    let state = match state_str.as_str() {
        "ELIGIBLE" => BidState::Eligible,
        "PREVIEWED" => BidState::Previewed,
        "SUBMITTED" => BidState::Submitted,
        "CONFIRMED" => BidState::Confirmed,
        _ => BidState::Failed,
    };

    let payment_str: String = row.get("payment_option");
    let estimated_return: Option<String> = row.get("estimated_return");
    let fees: Option<String> = row.get("fees");
    let started_at_str: String = row.get("started_at");
    let previewed_at: Option<String> = row.get("previewed_at");
    let submitted_at: Option<String> = row.get("submitted_at");
    let finished_at: Option<String> = row.get("finished_at");
    let verify_polls: i64 = row.get("verify_polls");

    Ok(BidAttempt {
        loan_id: row.get("loan_id"),
        amount: row.get("amount"),
        payment_option: payment_str
            .parse()
            .unwrap_or(PaymentOption::InterestPayment),
        state,
        sequence_hash: row.get("sequence_hash"),
        estimated_return: estimated_return.and_then(|s| Decimal::from_str(&s).ok()),
        fees: fees.and_then(|s| Decimal::from_str(&s).ok()),
        started_at: DateTime::parse_from_rfc3339(&started_at_str)?.with_timezone(&Utc),
        previewed_at: previewed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        submitted_at: submitted_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        finished_at: finished_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        verify_polls: verify_polls as u32,
        failure_kind: row.get("failure_kind"),
        failure: row.get("failure"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_loan() -> Loan {
        Loan {
            loan_id: 4852,
            title: "Fastighetsprojekt Solna".to_string(),
            amount: 1_500_000,
            interest_rate: Some(dec!(9.25)),
            min_bid: 500,
            max_bid: 100_000,
            current_bid: 750_000,
            funded_percentage: Some(Decimal::from(50)),
            status: LoanStatus::Open,
            opens_at: None,
            closes_at: Some(Utc::now()),
            url: Some("https://www.kameo.se/lan/4852".to_string()),
            risk_grade: Some("B".to_string()),
            duration_months: Some(18),
            origin: Some("sweden".to_string()),
            has_own_bid: false,
        }
    }

    #[tokio::test]
    async fn test_refresh_preserves_own_bid_flag() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let loan = sample_loan();

        db.upsert_loan(&loan).await.unwrap();
        db.mark_own_bid(loan.loan_id).await.unwrap();

        // a rediscovery refresh must not clear the flag
        db.upsert_loan(&loan).await.unwrap();

        let stored = db.get_loan(loan.loan_id).await.unwrap().unwrap();
        assert!(stored.has_own_bid);
        assert_eq!(stored.interest_rate, loan.interest_rate);
        assert_eq!(stored.status, LoanStatus::Open);
    }

    #[tokio::test]
    async fn test_attempt_rows_survive_a_round_trip() {
        let db = Database::new("sqlite::memory:").await.unwrap();

        let mut attempt = BidAttempt::new(4852, 3000, PaymentOption::InterestPayment);
        attempt.state = BidState::Failed;
        attempt.sequence_hash = Some("hash-1".to_string());
        attempt.estimated_return = Some(dec!(241.50));
        attempt.verify_polls = 3;
        attempt.failure_kind = Some("unverified".to_string());
        attempt.failure = Some("bid not visible after 3 verification polls".to_string());
        attempt.finished_at = Some(Utc::now());

        db.record_bid_attempt(&attempt).await.unwrap();

        let rows = db.recent_bid_attempts(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, BidState::Failed);
        assert_eq!(rows[0].payment_option, PaymentOption::InterestPayment);
        assert_eq!(rows[0].failure_kind.as_deref(), Some("unverified"));
        assert_eq!(rows[0].verify_polls, 3);

        let for_loan = db.bid_attempts_for_loan(4852).await.unwrap();
        assert_eq!(for_loan.len(), 1);
        assert!(db.bid_attempts_for_loan(1).await.unwrap().is_empty());
    }
}
