#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Account lifecycle and the double-entry posting engine.
//!
//! This is the hard part of the service: [`Ledger::post_transaction`]
//! must enforce the balance invariant atomically against Postgres while
//! never leaving a partial write visible. The style — a concrete service
//! struct holding a pool, one `sqlx` transaction per call, runtime-bound
//! queries rather than the `query!` macro — follows the settlement
//! engine's `DoubleEntryEngine`, generalized from a two-party transfer to
//! an arbitrary N-entry transaction.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use ledger_store::Store;
use serde::Deserialize;
use serde::Serialize;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

pub type AccountId = Uuid;
pub type TransactionId = Uuid;
pub type EntryId = Uuid;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("entry amount must be positive")]
    InvalidEntry,
    #[error("transaction is not balanced: debits={total_debit}, credits={total_credit}")]
    Unbalanced { total_debit: i64, total_credit: i64 },
    #[error("account balance overflow on account {0}")]
    Overflow(AccountId),
    #[error("account {0} not found")]
    NotFound(AccountId),
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),
    #[error("store unavailable: {0}")]
    Transient(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    fn as_str(self) -> &'static str {
        match self {
            AccountType::Asset => "ASSET",
            AccountType::Liability => "LIABILITY",
            AccountType::Equity => "EQUITY",
            AccountType::Income => "INCOME",
            AccountType::Expense => "EXPENSE",
        }
    }

    fn parse(raw: &str) -> LedgerResult<Self> {
        match raw {
            "ASSET" => Ok(AccountType::Asset),
            "LIABILITY" => Ok(AccountType::Liability),
            "EQUITY" => Ok(AccountType::Equity),
            "INCOME" => Ok(AccountType::Income),
            "EXPENSE" => Ok(AccountType::Expense),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown account type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }

    fn parse(raw: &str) -> LedgerResult<Self> {
        match raw {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown entry direction {other}"
            ))),
        }
    }

    /// Signed multiplier under the DEBIT-positive convention: balance
    /// change is `+amount` for DEBIT and `-amount` for CREDIT, uniformly
    /// across account types.
    fn signed(self, amount: i64) -> i64 {
        match self {
            Direction::Debit => amount,
            Direction::Credit => -amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub account_type: AccountType,
    pub currency: String,
    pub balance: i64,
    pub category: Option<String>,
    pub ownership: Option<String>,
    pub product_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub reference: String,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

/// A not-yet-persisted entry line supplied by the caller of
/// `post_transaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPosted {
    pub transaction_id: TransactionId,
    pub reference: String,
    pub posted_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

/// Best-effort sink for post-commit events. A publish failure must never
/// turn a committed transaction into an error response — callers of
/// `post_transaction` only ever see the publisher invoked and logged,
/// never its result.
#[async_trait::async_trait]
pub trait TransactionEventPublisher: Send + Sync {
    async fn publish(&self, event: TransactionPosted) -> anyhow::Result<()>;
}

/// A publisher that does nothing — used when no broker is configured,
/// so publishing is disabled rather than failing account creation.
#[derive(Clone, Default)]
pub struct NoopEventPublisher;

#[async_trait::async_trait]
impl TransactionEventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: TransactionPosted) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Ledger<P: TransactionEventPublisher = NoopEventPublisher> {
    store: Store,
    publisher: P,
}

impl Ledger<NoopEventPublisher> {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            publisher: NoopEventPublisher,
        }
    }
}

impl<P: TransactionEventPublisher> Ledger<P> {
    #[must_use]
    pub fn with_publisher(store: Store, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub async fn create_account(
        &self,
        name: &str,
        account_type: AccountType,
        currency: &str,
        category: Option<&str>,
        ownership: Option<&str>,
        client_id: Option<Uuid>,
    ) -> LedgerResult<Account> {
        if name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "account name is required".into(),
            ));
        }
        if currency.len() != 3 {
            return Err(LedgerError::InvalidInput(
                "currency must be a 3-character ISO code".into(),
            ));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO accounts (name, type, currency, account_category, ownership_type, client_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, type, currency, balance, account_category, ownership_type, product_id, client_id, created_at
            "#,
        )
        .bind(name)
        .bind(account_type.as_str())
        .bind(currency)
        .bind(category)
        .bind(ownership)
        .bind(client_id)
        .fetch_one(self.store.pool())
        .await?;

        let account = row_to_account(&row)?;
        tracing::info!(account_id = %account.id, "created account");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> LedgerResult<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, type, currency, balance, account_category, ownership_type, product_id, client_id, created_at
            FROM accounts WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, type, currency, balance, account_category, ownership_type, product_id, client_id, created_at
            FROM accounts ORDER BY created_at DESC
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    /// Attaches (or replaces) the product reference on an existing
    /// account — the write path behind `POST /accounts/product` and
    /// behind `ledger-config::product::usage`'s count of accounts
    /// opened against a product.
    pub async fn assign_product(
        &self,
        account_id: AccountId,
        product_id: Uuid,
    ) -> LedgerResult<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts SET product_id = $2
            WHERE id = $1
            RETURNING id, name, type, currency, balance, account_category, ownership_type, product_id, client_id, created_at
            "#,
        )
        .bind(account_id)
        .bind(product_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or(LedgerError::NotFound(account_id))?;

        let account = row_to_account(&row)?;
        tracing::info!(account_id = %account.id, product_id = %product_id, "assigned product to account");
        Ok(account)
    }

    /// Idempotent lookup-by-name for system accounts (clearing, expense).
    /// Uses `INSERT ... ON CONFLICT DO NOTHING` against the partial
    /// unique index on SYSTEM-category names so that under a race exactly
    /// one row is created.
    pub async fn get_or_create_system_account(
        &self,
        name: &str,
        account_type: AccountType,
    ) -> LedgerResult<AccountId> {
        sqlx::query(
            r#"
            INSERT INTO accounts (name, type, currency, account_category, ownership_type)
            VALUES ($1, $2, 'USD', 'SYSTEM', 'SYSTEM')
            ON CONFLICT (name) WHERE account_category = 'SYSTEM' DO NOTHING
            "#,
        )
        .bind(name)
        .bind(account_type.as_str())
        .execute(self.store.pool())
        .await?;

        let row = sqlx::query("SELECT id FROM accounts WHERE name = $1 AND account_category = 'SYSTEM'")
            .bind(name)
            .fetch_one(self.store.pool())
            .await?;
        Ok(row.try_get::<Uuid, _>("id")?)
    }

    /// The hot path. Validates, opens a transaction, inserts the
    /// transaction + entry rows, applies a conditional balance update per
    /// entry, and commits — no partial writes become visible on any
    /// failure after the transaction begins.
    pub async fn post_transaction(
        &self,
        reference: &str,
        description: &str,
        entries: &[NewEntry],
    ) -> LedgerResult<Transaction> {
        if entries.len() < 2 {
            return Err(LedgerError::Unbalanced {
                total_debit: 0,
                total_credit: 0,
            });
        }

        let mut total_debit: i64 = 0;
        let mut total_credit: i64 = 0;
        let mut has_debit = false;
        let mut has_credit = false;
        for entry in entries {
            if entry.amount <= 0 {
                return Err(LedgerError::InvalidEntry);
            }
            match entry.direction {
                Direction::Debit => {
                    has_debit = true;
                    total_debit = total_debit
                        .checked_add(entry.amount)
                        .ok_or(LedgerError::Overflow(entry.account_id))?;
                }
                Direction::Credit => {
                    has_credit = true;
                    total_credit = total_credit
                        .checked_add(entry.amount)
                        .ok_or(LedgerError::Overflow(entry.account_id))?;
                }
            }
        }
        if !has_debit || !has_credit || total_debit != total_credit {
            return Err(LedgerError::Unbalanced {
                total_debit,
                total_credit,
            });
        }

        let mut tx = self.store.begin().await.map_err(|err| match err {
            ledger_store::StoreError::Transient(e) => LedgerError::Transient(e),
            ledger_store::StoreError::Migration(e) => {
                LedgerError::InvalidInput(format!("migration error: {e}"))
            }
        })?;

        let header = sqlx::query(
            "INSERT INTO transactions (reference, description) VALUES ($1, $2) RETURNING id, posted_at",
        )
        .bind(reference)
        .bind(description)
        .fetch_one(&mut *tx)
        .await?;
        let transaction_id: TransactionId = header.try_get("id")?;
        let posted_at: DateTime<Utc> = header.try_get("posted_at")?;

        let mut persisted = Vec::with_capacity(entries.len());
        for entry in entries {
            let delta = entry.direction.signed(entry.amount);

            // The WHERE clause fails the conditional update (and therefore
            // the whole unit of work, via the rollback-on-drop below) if
            // applying delta would overflow a signed 64-bit balance,
            // catching the case before Postgres's own BIGINT arithmetic
            // would raise a generic numeric-overflow error.
            let updated = sqlx::query(
                r#"
                UPDATE accounts
                SET balance = balance + $2
                WHERE id = $1
                  AND ($2 >= 0 AND balance <= 9223372036854775807 - $2
                       OR $2 < 0 AND balance >= -9223372036854775808 - $2)
                RETURNING balance
                "#,
            )
            .bind(entry.account_id)
            .bind(delta)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(updated) = updated else {
                let exists = sqlx::query("SELECT 1 FROM accounts WHERE id = $1")
                    .bind(entry.account_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(if exists.is_some() {
                    LedgerError::Overflow(entry.account_id)
                } else {
                    LedgerError::NotFound(entry.account_id)
                });
            };
            let _new_balance: i64 = updated.try_get("balance")?;

            let row = sqlx::query(
                r#"
                INSERT INTO entries (transaction_id, account_id, direction, amount)
                VALUES ($1, $2, $3, $4)
                RETURNING id, transaction_id, account_id, direction, amount, created_at
                "#,
            )
            .bind(transaction_id)
            .bind(entry.account_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount)
            .fetch_one(&mut *tx)
            .await?;
            persisted.push(row_to_entry(&row)?);
        }

        tx.commit().await?;

        let transaction = Transaction {
            id: transaction_id,
            reference: reference.to_string(),
            description: description.to_string(),
            posted_at,
            entries: persisted,
        };

        let event = TransactionPosted {
            transaction_id: transaction.id,
            reference: transaction.reference.clone(),
            posted_at: transaction.posted_at,
            entries: transaction.entries.clone(),
        };
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(transaction_id = %transaction.id, error = %err, "failed to publish transaction event");
        }

        Ok(transaction)
    }

    /// Returns transactions the account participated in, most recent
    /// first, each hydrated with its full entry set via a single
    /// `transaction_id = ANY($1)` fetch.
    pub async fn get_transactions(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Transaction>> {
        let headers = sqlx::query(
            r#"
            SELECT DISTINCT t.id, t.reference, t.description, t.posted_at
            FROM transactions t
            JOIN entries e ON e.transaction_id = t.id
            WHERE e.account_id = $1
            ORDER BY t.posted_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.store.pool())
        .await?;

        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<TransactionId> = headers
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<_, _>>()?;

        let entry_rows = sqlx::query(
            r#"
            SELECT id, transaction_id, account_id, direction, amount, created_at
            FROM entries WHERE transaction_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(self.store.pool())
        .await?;

        let mut entries_by_tx: HashMap<TransactionId, Vec<Entry>> = HashMap::new();
        for row in &entry_rows {
            let entry = row_to_entry(row)?;
            entries_by_tx.entry(entry.transaction_id).or_default().push(entry);
        }

        headers
            .iter()
            .map(|row| {
                let id: TransactionId = row.try_get("id")?;
                Ok(Transaction {
                    id,
                    reference: row.try_get("reference")?,
                    description: row.try_get("description")?,
                    posted_at: row.try_get("posted_at")?,
                    entries: entries_by_tx.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Posts a compensating transaction that swaps the direction of every
    /// entry in `transaction_id`, leaving the original transaction row
    /// untouched and immutable while reinstating the pre-posting
    /// balances. Used by Payments to unwind a withdrawal whose gateway
    /// call fails after the ledger post already committed, without a
    /// full saga/outbox.
    pub async fn reverse(&self, transaction_id: TransactionId) -> LedgerResult<Transaction> {
        let original = self
            .get_transactions_by_id(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;

        let reversed_entries: Vec<NewEntry> = original
            .entries
            .iter()
            .map(|entry| NewEntry {
                account_id: entry.account_id,
                direction: match entry.direction {
                    Direction::Debit => Direction::Credit,
                    Direction::Credit => Direction::Debit,
                },
                amount: entry.amount,
            })
            .collect();

        self.post_transaction(
            &format!("REV-{transaction_id}"),
            &format!("Reversal of {transaction_id}"),
            &reversed_entries,
        )
        .await
    }

    async fn get_transactions_by_id(
        &self,
        transaction_id: TransactionId,
    ) -> LedgerResult<Option<Transaction>> {
        let header = sqlx::query(
            "SELECT id, reference, description, posted_at FROM transactions WHERE id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(self.store.pool())
        .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let entry_rows = sqlx::query(
            "SELECT id, transaction_id, account_id, direction, amount, created_at
             FROM entries WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_all(self.store.pool())
        .await?;
        let entries = entry_rows.iter().map(row_to_entry).collect::<LedgerResult<_>>()?;

        Ok(Some(Transaction {
            id: header.try_get("id")?,
            reference: header.try_get("reference")?,
            description: header.try_get("description")?,
            posted_at: header.try_get("posted_at")?,
            entries,
        }))
    }
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> LedgerResult<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        account_type: AccountType::parse(row.try_get::<String, _>("type")?.as_str())?,
        currency: row.try_get("currency")?,
        balance: row.try_get("balance")?,
        category: row.try_get("account_category")?,
        ownership: row.try_get("ownership_type")?,
        product_id: row.try_get("product_id")?,
        client_id: row.try_get("client_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> LedgerResult<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        account_id: row.try_get("account_id")?,
        direction: Direction::parse(row.try_get::<String, _>("direction")?.as_str())?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn direction_signed_is_debit_positive_uniformly() {
        assert_eq!(Direction::Debit.signed(100), 100);
        assert_eq!(Direction::Credit.signed(100), -100);
    }

    #[test]
    fn account_type_round_trips_through_strings() {
        for variant in [
            AccountType::Asset,
            AccountType::Liability,
            AccountType::Equity,
            AccountType::Income,
            AccountType::Expense,
        ] {
            let parsed = AccountType::parse(variant.as_str()).expect("known variant parses");
            assert_eq!(parsed, variant);
        }
    }

    #[test]
    fn unknown_account_type_is_invalid_input() {
        let err = AccountType::parse("CRYPTO").expect_err("unknown type rejected");
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }
}
