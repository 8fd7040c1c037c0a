#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Daily interest accrual batch.
//!
//! [`run_daily_accrual`] scans every account joined to a product with a
//! nonzero interest rate and posts a balanced journal entry per account
//! through [`ledger_core::Ledger`]. The scan uses `sqlx`'s row stream
//! rather than `fetch_all` so the full result set is never materialized
//! over large account scans. A posting failure for one account is
//! logged and the scan continues past it — it is not fatal to the
//! batch; only the up-front failure to acquire the expense account is.

use futures::TryStreamExt;
use ledger_core::AccountId;
use ledger_core::AccountType;
use ledger_core::Direction;
use ledger_core::Ledger;
use ledger_core::LedgerError;
use ledger_core::NewEntry;
use ledger_core::TransactionEventPublisher;
use ledger_store::Store;
use sqlx::Row;
use thiserror::Error;

pub type AccrualResult<T> = Result<T, AccrualError>;

#[derive(Debug, Error)]
pub enum AccrualError {
    #[error("could not acquire the interest expense system account: {0}")]
    SystemAccount(LedgerError),
    #[error("store unavailable: {0}")]
    Transient(#[from] sqlx::Error),
}

/// Outcome of a single accrual sweep, returned to the caller (typically
/// the batch engine) for recording on the `BatchRecord` row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccrualRunSummary {
    pub accounts_scanned: u64,
    pub postings_made: u64,
    pub errors: u64,
}

const BANK_INTEREST_EXPENSE: &str = "Bank Interest Expense";

/// Daily-simple-interest truncating division:
/// `(|balance| * rateBPS) / (10000 * 365)`. Widened to `i128` so the
/// intermediate product cannot overflow for realistic balances/rates,
/// then saturated back to `i64` minor units.
fn daily_interest(balance: i64, rate_bps: i32) -> i64 {
    let magnitude = i128::from(balance).abs();
    let product = magnitude * i128::from(rate_bps.max(0));
    let daily = product / (10_000 * 365);
    daily.min(i128::from(i64::MAX)) as i64
}

/// Scans every account with a product carrying a positive interest rate
/// and a nonzero balance, posting one balanced transaction per eligible
/// account. Returns a summary rather than failing on a per-account
/// posting error — only the inability to acquire the expense account
/// up front is fatal (there is nowhere to post interest without it).
pub async fn run_daily_accrual<P: TransactionEventPublisher>(
    store: &Store,
    ledger: &Ledger<P>,
) -> AccrualResult<AccrualRunSummary> {
    let expense_account = ledger
        .get_or_create_system_account(BANK_INTEREST_EXPENSE, AccountType::Expense)
        .await
        .map_err(AccrualError::SystemAccount)?;

    let mut rows = sqlx::query(
        r#"
        SELECT a.id AS account_id, a.balance, p.interest_rate_bps
        FROM accounts a
        JOIN products p ON a.product_id = p.id
        WHERE p.interest_rate_bps > 0 AND a.balance <> 0
        "#,
    )
    .fetch(store.pool());

    let mut summary = AccrualRunSummary::default();
    while let Some(row) = rows.try_next().await? {
        summary.accounts_scanned += 1;

        let account_id: AccountId = row.try_get("account_id")?;
        let balance: i64 = row.try_get("balance")?;
        let rate_bps: i32 = row.try_get("interest_rate_bps")?;

        let amount = daily_interest(balance, rate_bps);
        if amount <= 0 {
            continue;
        }

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_micros() * 1_000);
        let reference = format!("INT-{account_id}-{nanos}");

        let posted = ledger
            .post_transaction(
                &reference,
                "Daily Interest Accrual",
                &[
                    NewEntry {
                        account_id: expense_account,
                        direction: Direction::Debit,
                        amount,
                    },
                    NewEntry {
                        account_id,
                        direction: Direction::Credit,
                        amount,
                    },
                ],
            )
            .await;

        match posted {
            Ok(_) => summary.postings_made += 1,
            Err(err) => {
                summary.errors += 1;
                tracing::warn!(%account_id, error = %err, "accrual posting failed for account, continuing scan");
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_interest_truncates_the_same_way_for_debit_and_credit_balances() {
        // balance 10000, rate 500 bps -> 1.
        assert_eq!(daily_interest(10_000, 500), 1);
        assert_eq!(daily_interest(-10_000, 500), 1);
    }

    #[test]
    fn daily_interest_is_zero_below_the_rounding_threshold() {
        assert_eq!(daily_interest(1, 1), 0);
        assert_eq!(daily_interest(0, 500), 0);
    }

    #[test]
    fn daily_interest_does_not_overflow_on_large_balances() {
        assert!(daily_interest(i64::MAX, 10_000) > 0);
    }
}
