//! One-time welcome bonus.

use tracing::info;

use crate::Amount;
use crate::ledger::{Ledger, LedgerError, LockKey, balance};
use crate::model::{CoinTransaction, TransactionStatus, TransactionType, TxId, UserId};

/// Result of issuing the welcome bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WelcomeBonus {
    pub transaction_id: TxId,
    pub coins_awarded: Amount,
    pub new_balance: Amount,
}

impl Ledger {
    /// Credit the configured welcome bonus to an active user, at most once.
    ///
    /// The issued flag is checked and set under the same user lock as the
    /// credit, so concurrent duplicate calls credit exactly once.
    pub async fn issue_welcome_bonus(&self, user: UserId) -> Result<WelcomeBonus, LedgerError> {
        let result = self.apply_welcome_bonus(user).await;
        Self::log_refusal("welcome bonus", &result);
        result
    }

    async fn apply_welcome_bonus(&self, user: UserId) -> Result<WelcomeBonus, LedgerError> {
        let config = self.config();
        let now = self.clock.now();

        self.active_user(user)?;
        if self.store.welcome_issued(user) {
            return Err(LedgerError::DuplicateWelcomeBonus(user));
        }

        let mut uow = self
            .store
            .begin([LockKey::User(user)], config.lock_timeout())
            .await?;
        // authoritative check, now that no one else can issue for this user
        if uow.welcome_issued(user) {
            return Err(LedgerError::DuplicateWelcomeBonus(user));
        }

        let coins = config.welcome_bonus_coins;
        let mut record = CoinTransaction::pending(user, TransactionType::WelcomeBonus, coins, now);
        // no review needed
        record.status = TransactionStatus::Approved;
        record.processed_at = Some(now);
        let record = uow.create(record)?;
        let new_balance =
            balance::apply_delta(&mut uow, user, coins, TransactionType::WelcomeBonus, now)?;
        uow.mark_welcome_issued(user);
        uow.commit();

        info!(
            user,
            tx = record.id,
            coins = %coins,
            balance = %new_balance,
            config = config.version,
            "welcome bonus issued"
        );
        Ok(WelcomeBonus {
            transaction_id: record.id,
            coins_awarded: coins,
            new_balance,
        })
    }
}
