//! Error types for ledger operations.

use chrono::NaiveDate;
use thiserror::Error;

use crate::Amount;
use crate::ledger::store::LockKey;
use crate::ledger::transition::Action;
use crate::model::{BrandId, TransactionStatus, TransactionType, TxId, UserId, UserStatus};

/// Top-level error returned by every [`Ledger`](super::Ledger) operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("cap exceeded: {0}")]
    CapExceeded(#[from] CapExceededError),

    #[error("insufficient balance for user {user}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user: UserId,
        balance: Amount,
        requested: Amount,
    },

    #[error("cannot {action}: transaction {tx} is {current}")]
    InvalidStateTransition {
        tx: TxId,
        action: Action,
        current: TransactionStatus,
    },

    #[error("welcome bonus already issued to user {0}")]
    DuplicateWelcomeBonus(UserId),

    #[error("user {0} is not active ({1})")]
    UserNotActive(UserId, UserStatus),

    #[error("timed out waiting for lock on {0}")]
    ConcurrencyConflict(LockKey),

    #[error("{0}")]
    NotFound(#[from] NotFound),
}

impl LedgerError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }
}

/// Malformed or out-of-range input, detected before any write.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("amount must not be zero")]
    ZeroAmount,

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("bill date {bill_date} is in the future (today is {today})")]
    BillDateInFuture { bill_date: NaiveDate, today: NaiveDate },

    #[error("bill date {bill_date} is older than {max_age_days} days")]
    BillTooOld { bill_date: NaiveDate, max_age_days: u32 },

    #[error("bill amount {bill} is below the minimum of {minimum}")]
    BillBelowMinimum { bill: Amount, minimum: Amount },

    #[error("bill of {bill} at brand {brand} on {bill_date} was already submitted as transaction {existing}")]
    DuplicateBill {
        brand: BrandId,
        bill: Amount,
        bill_date: NaiveDate,
        existing: TxId,
    },

    #[error("bill of {0} earns no coins")]
    NothingEarned(Amount),

    #[error("brand {0} is not active")]
    BrandInactive(BrandId),

    #[error("brand {brand} is misconfigured: {reason}")]
    InvalidBrand { brand: BrandId, reason: String },

    #[error("a rejection reason is required")]
    EmptyRejectionReason,

    #[error("an external payment reference is required")]
    EmptyPaymentReference,

    #[error("adjustment notes are required")]
    EmptyAdjustmentNotes,

    #[error("cannot {action} a {kind} transaction")]
    UnsupportedAction { action: Action, kind: TransactionType },

    #[error("inconsistent record: {0}")]
    InconsistentRecord(String),
}

/// A brand earning/redemption limit would be violated.
#[derive(Debug, Error)]
pub enum CapExceededError {
    #[error("redeeming {requested} exceeds the per-transaction maximum of {max} at brand {brand}")]
    PerTransaction {
        brand: BrandId,
        requested: Amount,
        max: Amount,
    },

    #[error("bill amount {bill} is below the minimum redemption amount {minimum} at brand {brand}")]
    BelowMinimumRedemption {
        brand: BrandId,
        bill: Amount,
        minimum: Amount,
    },

    #[error("redeeming {requested} at brand {brand} exceeds its overall cap of {cap} ({used} already reserved)")]
    Overall {
        brand: BrandId,
        used: Amount,
        requested: Amount,
        cap: Amount,
    },
}

/// An entity referenced by a request does not exist.
#[derive(Debug, Error)]
pub enum NotFound {
    #[error("user {0} not found")]
    User(UserId),
    #[error("brand {0} not found")]
    Brand(BrandId),
    #[error("transaction {0} not found")]
    Transaction(TxId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_conflicts_are_retryable() {
        assert!(LedgerError::ConcurrencyConflict(LockKey::User(1)).is_retryable());
        assert!(!LedgerError::DuplicateWelcomeBonus(1).is_retryable());
        assert!(!LedgerError::NotFound(NotFound::Transaction(3)).is_retryable());
    }

    #[test]
    fn state_transition_message_names_the_conflict() {
        let err = LedgerError::InvalidStateTransition {
            tx: 7,
            action: Action::Reject,
            current: TransactionStatus::Paid,
        };
        assert_eq!(err.to_string(), "cannot reject: transaction 7 is PAID");
    }
}
