#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Deposit/Withdraw/Transfer orchestration over [`ledger_core::Ledger`],
//! composing ledger postings with an external settlement gateway.
//!
//! No concrete gateway ships here — [`PaymentGateway`] is an interface
//! only, so the ordering contract ("gateway first, then post" for
//! Deposit; "post first, then gateway" for Withdraw) is expressed in
//! real code rather than left as prose. A gateway failure on Withdraw
//! after a successful post triggers `ledger.reverse`, swapping the
//! entries while leaving the original transaction immutable.

use async_trait::async_trait;
use ledger_core::AccountId;
use ledger_core::AccountType;
use ledger_core::Direction;
use ledger_core::Ledger;
use ledger_core::LedgerError;
use ledger_core::NewEntry;
use ledger_core::Transaction;
use ledger_core::TransactionEventPublisher;
use thiserror::Error;
use uuid::Uuid;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("amount must be positive")]
    InvalidInput,
    #[error("cannot transfer an account to itself")]
    SelfTransfer,
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(msg) => PaymentError::GatewayRejected(msg),
            GatewayError::Unavailable(msg) => PaymentError::GatewayUnavailable(msg),
        }
    }
}

/// The external settlement leg of a Deposit or Withdraw. A concrete
/// implementation (card processor, ACH rail, wire network) lives outside
/// this repo's scope — only the call shape the orchestrators depend on
/// is specified here.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn settle(&self, amount: i64, currency: &str) -> GatewayResult<()>;
}

const SETTLEMENT_ACCOUNT: &str = "Payment Gateway Settlement";

/// Outcome of a Withdraw. Distinguishes the common success path from
/// the case where the ledger post succeeded but the external gateway
/// then failed — resolved by posting a reversal rather than leaving
/// the withdrawal silently stuck half-settled.
#[derive(Debug, Clone)]
pub enum WithdrawOutcome {
    Completed(Transaction),
    CompensatedGatewayFailure {
        original: Transaction,
        reversal: Option<Transaction>,
        gateway_error: String,
    },
}

/// Deposit: simulate receiving money from an external source and credit
/// the account. Gateway call happens first — if it fails, nothing has
/// been posted, so there is nothing to compensate.
pub async fn deposit<P: TransactionEventPublisher>(
    ledger: &Ledger<P>,
    gateway: &dyn PaymentGateway,
    account_id: AccountId,
    amount: i64,
    currency: &str,
) -> PaymentResult<Transaction> {
    if amount <= 0 {
        return Err(PaymentError::InvalidInput);
    }

    gateway.settle(amount, currency).await?;

    let settlement = ledger
        .get_or_create_system_account(SETTLEMENT_ACCOUNT, AccountType::Asset)
        .await?;

    let reference = format!("DEP-{}", Uuid::new_v4());
    let transaction = ledger
        .post_transaction(
            &reference,
            "External Deposit",
            &[
                NewEntry {
                    account_id: settlement,
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
        .await?;
    Ok(transaction)
}

/// Withdraw: post first, then call the external gateway. If the
/// gateway then fails, issue a compensating reversal so the account
/// is left whole rather than silently overdrawn against a payout that
/// never happened.
pub async fn withdraw<P: TransactionEventPublisher>(
    ledger: &Ledger<P>,
    gateway: &dyn PaymentGateway,
    account_id: AccountId,
    amount: i64,
    currency: &str,
) -> PaymentResult<WithdrawOutcome> {
    if amount <= 0 {
        return Err(PaymentError::InvalidInput);
    }

    let settlement = ledger
        .get_or_create_system_account(SETTLEMENT_ACCOUNT, AccountType::Asset)
        .await?;

    let reference = format!("WD-{}", Uuid::new_v4());
    let original = ledger
        .post_transaction(
            &reference,
            "External Withdrawal",
            &[
                NewEntry {
                    account_id,
                    direction: Direction::Debit,
                    amount,
                },
                NewEntry {
                    account_id: settlement,
                    direction: Direction::Credit,
                    amount,
                },
            ],
        )
        .await?;

    match gateway.settle(amount, currency).await {
        Ok(()) => Ok(WithdrawOutcome::Completed(original)),
        Err(err) => {
            tracing::warn!(
                transaction_id = %original.id,
                error = %err,
                "withdrawal gateway call failed after posting, reversing"
            );
            let reversal = match ledger.reverse(original.id).await {
                Ok(reversal) => Some(reversal),
                Err(reverse_err) => {
                    tracing::error!(
                        transaction_id = %original.id,
                        error = %reverse_err,
                        "failed to reverse withdrawal after gateway failure"
                    );
                    None
                }
            };
            Ok(WithdrawOutcome::CompensatedGatewayFailure {
                original,
                reversal,
                gateway_error: err.to_string(),
            })
        }
    }
}

/// Transfer: ledger-only, no external call.
pub async fn transfer<P: TransactionEventPublisher>(
    ledger: &Ledger<P>,
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: i64,
) -> PaymentResult<Transaction> {
    if amount <= 0 {
        return Err(PaymentError::InvalidInput);
    }
    if from_account_id == to_account_id {
        return Err(PaymentError::SelfTransfer);
    }

    let reference = format!("TRF-{}", Uuid::new_v4());
    let description = format!("Transfer from {from_account_id} to {to_account_id}");
    let transaction = ledger
        .post_transaction(
            &reference,
            &description,
            &[
                NewEntry {
                    account_id: from_account_id,
                    direction: Direction::Debit,
                    amount,
                },
                NewEntry {
                    account_id: to_account_id,
                    direction: Direction::Credit,
                    amount,
                },
            ],
        )
        .await?;
    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_maps_to_the_matching_payment_error_variant() {
        let rejected: PaymentError = GatewayError::Rejected("card declined".into()).into();
        assert!(matches!(rejected, PaymentError::GatewayRejected(_)));

        let unavailable: PaymentError = GatewayError::Unavailable("timeout".into()).into();
        assert!(matches!(unavailable, PaymentError::GatewayUnavailable(_)));
    }
}
