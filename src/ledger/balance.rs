use chrono::{DateTime, Utc};
use tracing::debug;

use crate::Amount;
use crate::ledger::store::{LockKey, UnitOfWork};
use crate::ledger::{LedgerError, ValidationError};
use crate::model::{CoinBalance, TransactionType, UserId};

fn overflow(user: UserId) -> LedgerError {
    ValidationError::InconsistentRecord(format!("coin totals overflow for user {user}")).into()
}

/// Balance arithmetic. `delta` is signed: credits positive, debits negative.
impl CoinBalance {
    /// Apply `delta`, moving `total_earned` for credits and `total_redeemed` for debits.
    pub fn apply(&mut self, delta: Amount, at: DateTime<Utc>) -> Result<Amount, LedgerError> {
        if delta.is_negative() {
            let debit = delta.checked_abs().ok_or_else(|| overflow(self.user_id))?;
            self.ensure_covers(debit)?;
            let redeemed = self
                .total_redeemed
                .checked_add(debit)
                .ok_or_else(|| overflow(self.user_id))?;
            self.balance -= debit;
            self.total_redeemed = redeemed;
        } else {
            let balance = self.balance.checked_add(delta);
            let earned = self.total_earned.checked_add(delta);
            let (Some(balance), Some(earned)) = (balance, earned) else {
                return Err(overflow(self.user_id));
            };
            self.balance = balance;
            self.total_earned = earned;
        }
        self.last_updated = Some(at);
        Ok(self.balance)
    }

    /// Undo a previously applied `delta` with an opposite entry.
    ///
    /// Both counters only grow: undoing a credit counts as redeemed, undoing a
    /// debit counts as earned, so `balance == total_earned - total_redeemed`
    /// still holds.
    pub fn reverse(&mut self, delta: Amount, at: DateTime<Utc>) -> Result<Amount, LedgerError> {
        if delta.is_negative() {
            let credit = delta.checked_abs().ok_or_else(|| overflow(self.user_id))?;
            let balance = self.balance.checked_add(credit);
            let earned = self.total_earned.checked_add(credit);
            let (Some(balance), Some(earned)) = (balance, earned) else {
                return Err(overflow(self.user_id));
            };
            self.balance = balance;
            self.total_earned = earned;
        } else {
            // a credit that was already spent cannot be taken back
            self.ensure_covers(delta)?;
            let redeemed = self
                .total_redeemed
                .checked_add(delta)
                .ok_or_else(|| overflow(self.user_id))?;
            self.balance -= delta;
            self.total_redeemed = redeemed;
        }
        self.last_updated = Some(at);
        Ok(self.balance)
    }

    fn ensure_covers(&self, debit: Amount) -> Result<(), LedgerError> {
        if self.balance < debit {
            return Err(LedgerError::InsufficientBalance {
                user: self.user_id,
                balance: self.balance,
                requested: debit,
            });
        }
        Ok(())
    }
}

fn check_sign(kind: TransactionType, delta: Amount) -> Result<(), LedgerError> {
    if delta.is_zero() {
        return Err(ValidationError::ZeroAmount.into());
    }
    let ok = match kind {
        TransactionType::Earn | TransactionType::WelcomeBonus => delta.is_positive(),
        TransactionType::Redeem => delta.is_negative(),
        TransactionType::Adjustment => true,
    };
    if !ok {
        return Err(
            ValidationError::InconsistentRecord(format!("{kind} delta of {delta}")).into(),
        );
    }
    Ok(())
}

/// Apply a `kind` delta to `user`'s balance inside `uow`, creating the row on first use.
///
/// The unit of work must hold the user's lock.
pub fn apply_delta(
    uow: &mut UnitOfWork<'_>,
    user: UserId,
    delta: Amount,
    kind: TransactionType,
    at: DateTime<Utc>,
) -> Result<Amount, LedgerError> {
    check_sign(kind, delta)?;
    debug_assert!(uow.holds(LockKey::User(user)));

    let mut balance = uow.balance(user);
    let new_balance = balance.apply(delta, at)?;
    uow.put_balance(balance);

    debug!(user, delta = %delta, kind = %kind, balance = %new_balance, "delta staged");
    Ok(new_balance)
}

/// Reverse a `kind` delta previously applied to `user`'s balance inside `uow`.
pub fn reverse_delta(
    uow: &mut UnitOfWork<'_>,
    user: UserId,
    delta: Amount,
    kind: TransactionType,
    at: DateTime<Utc>,
) -> Result<Amount, LedgerError> {
    check_sign(kind, delta)?;
    debug_assert!(uow.holds(LockKey::User(user)));

    let mut balance = uow.balance(user);
    let new_balance = balance.reverse(delta, at)?;
    uow.put_balance(balance);

    debug!(user, delta = %delta, kind = %kind, balance = %new_balance, "reversal staged");
    Ok(new_balance)
}
