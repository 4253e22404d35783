use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MirageError;
use crate::jobs::store::PendingJobStore;

/// Fractional-currency scale: four decimal digits, round half to even.
pub const BALANCE_SCALE: u32 = 4;

/// Round to the ledger scale using banker's rounding. Applied to every
/// amount and balance before it is stored or returned, so repeated
/// operations cannot drift.
pub fn round_credits(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(BALANCE_SCALE, RoundingStrategy::MidpointNearestEven)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchase,
    Deduction,
    Refund,
}

/// One append-only ledger entry. The transaction log is the source of truth;
/// the cached balance always equals the sum of entry amounts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub description: String,
    pub related_job_id: Option<Uuid>,
    pub payment_method: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payment context recorded with a purchase.
#[derive(Clone, Debug, Default)]
pub struct PurchaseSource {
    pub description: String,
    pub payment_method: Option<String>,
    pub payment_transaction_id: Option<String>,
}

impl PurchaseSource {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Account {
    balance: Decimal,
    transactions: Vec<Transaction>,
    /// Jobs already settled — the deduction idempotency keys.
    settled_jobs: HashSet<Uuid>,
    /// Jobs already refunded.
    refunded_jobs: HashSet<Uuid>,
}

/// Race-safe per-user balance accounting. Check-and-apply runs under one
/// lock per ledger, so concurrent deductions for the same user can never
/// both succeed past the balance. The guard is never held across an await.
#[derive(Debug, Default)]
pub struct CreditLedger {
    inner: Mutex<HashMap<String, Account>>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Account>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current balance; a zero-balance account is created on first access.
    pub fn balance(&self, user_id: &str) -> Decimal {
        let mut map = self.lock();
        round_credits(map.entry(user_id.to_string()).or_default().balance)
    }

    /// Atomically increment the balance and append a purchase transaction.
    pub fn add_credits(
        &self,
        user_id: &str,
        amount: Decimal,
        source: PurchaseSource,
    ) -> Result<Decimal, MirageError> {
        let amount = round_credits(amount);
        if amount <= Decimal::ZERO {
            return Err(MirageError::InvalidAmount(amount));
        }
        let mut map = self.lock();
        let account = map.entry(user_id.to_string()).or_default();
        account.balance = round_credits(account.balance + amount);
        account.transactions.push(Transaction {
            amount,
            kind: TransactionKind::Purchase,
            description: source.description,
            related_job_id: None,
            payment_method: source.payment_method,
            payment_transaction_id: source.payment_transaction_id,
            created_at: Utc::now(),
        });
        tracing::info!(user_id = user_id, amount = %amount, "credits added");
        Ok(account.balance)
    }

    /// Atomically deduct `amount`, appending a deduction transaction that
    /// references the job. Idempotent per `job_ref`: a second call for the
    /// same job is a no-op returning the current balance. Fails with
    /// `InsufficientCredits` without mutating anything when the balance
    /// cannot cover the amount.
    pub fn deduct_credits(
        &self,
        user_id: &str,
        amount: Decimal,
        job_ref: Uuid,
    ) -> Result<Decimal, MirageError> {
        let amount = round_credits(amount);
        if amount <= Decimal::ZERO {
            return Err(MirageError::InvalidAmount(amount));
        }
        let mut map = self.lock();
        let account = map.entry(user_id.to_string()).or_default();

        if account.settled_jobs.contains(&job_ref) {
            tracing::debug!(user_id = user_id, job_id = %job_ref, "deduction replayed, no-op");
            return Ok(round_credits(account.balance));
        }
        if account.balance < amount {
            return Err(MirageError::InsufficientCredits {
                balance: round_credits(account.balance),
                requested: amount,
            });
        }

        account.balance = round_credits(account.balance - amount);
        account.settled_jobs.insert(job_ref);
        account.transactions.push(Transaction {
            amount: -amount,
            kind: TransactionKind::Deduction,
            description: "generation settled".to_string(),
            related_job_id: Some(job_ref),
            payment_method: None,
            payment_transaction_id: None,
            created_at: Utc::now(),
        });
        tracing::info!(user_id = user_id, amount = %amount, job_id = %job_ref, "credits deducted");
        Ok(account.balance)
    }

    /// Release a previously settled amount back to the user. Idempotent per
    /// `job_ref`; refunding a job that was never settled is rejected.
    pub fn refund_credits(
        &self,
        user_id: &str,
        amount: Decimal,
        job_ref: Uuid,
        reason: &str,
    ) -> Result<Decimal, MirageError> {
        let amount = round_credits(amount);
        if amount <= Decimal::ZERO {
            return Err(MirageError::InvalidAmount(amount));
        }
        let mut map = self.lock();
        let account = map.entry(user_id.to_string()).or_default();

        if account.refunded_jobs.contains(&job_ref) {
            return Ok(round_credits(account.balance));
        }
        if !account.settled_jobs.contains(&job_ref) {
            return Err(MirageError::Other(format!(
                "refund for unsettled job {job_ref}"
            )));
        }

        account.balance = round_credits(account.balance + amount);
        account.refunded_jobs.insert(job_ref);
        account.transactions.push(Transaction {
            amount,
            kind: TransactionKind::Refund,
            description: reason.to_string(),
            related_job_id: Some(job_ref),
            payment_method: None,
            payment_transaction_id: None,
            created_at: Utc::now(),
        });
        tracing::info!(user_id = user_id, amount = %amount, job_id = %job_ref, "credits refunded");
        Ok(account.balance)
    }

    /// Transaction history, oldest first.
    pub fn transactions(&self, user_id: &str) -> Vec<Transaction> {
        let map = self.lock();
        map.get(user_id)
            .map(|a| a.transactions.clone())
            .unwrap_or_default()
    }

    /// Funds "at risk" across the user's non-terminal jobs. A read-only
    /// projection over the job store; never mutates the ledger.
    pub fn pending_liability(&self, user_id: &str, store: &PendingJobStore) -> Decimal {
        round_credits(store.pending_cost_for_user(user_id))
    }
}
