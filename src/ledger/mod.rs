//! Coin ledger.
//!
//! The [`Ledger`] turns user claims (earn, redeem) and admin decisions
//! (approve, reject, mark processed, process payment) into exactly-once
//! changes to a user's coin balance. Each operation is one unit of work: it
//! takes the row locks it needs, validates, stages its writes, and commits them
//! together or not at all.
//!
//! Claims move the balance at submission time. An earn credits the user
//! immediately and a redeem reserves (debits) the coins immediately; a later
//! rejection reverses exactly that delta.

use std::sync::{Arc, RwLock};

use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Amount;
use crate::config::LedgerConfig;
use crate::model::{
    AdminId, Bill, BrandId, CoinBalance, CoinTransaction, Command, TransactionStatus,
    TransactionType, TxId, User, UserId,
};

pub mod balance;
pub mod caps;
pub mod transition;

mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

mod directory;
pub use directory::{Directory, InMemoryDirectory};

mod error;
pub use error::{CapExceededError, LedgerError, NotFound, ValidationError};

mod store;
pub use store::{LockKey, Store, TransitionMeta, UnitOfWork};

mod welcome;
pub use welcome::WelcomeBonus;

use transition::{Action, Effect};

/// Result of a submission or adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub transaction_id: TxId,
    pub status: TransactionStatus,
    pub new_balance: Amount,
}

/// Result of an admin decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub transaction_id: TxId,
    pub status: TransactionStatus,
    /// Set when the decision moved the balance (rejections).
    pub new_balance: Option<Amount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub balance: Amount,
    pub total_earned: Amount,
    pub total_redeemed: Amount,
}

impl From<CoinBalance> for BalanceSnapshot {
    fn from(b: CoinBalance) -> Self {
        Self {
            balance: b.balance,
            total_earned: b.total_earned,
            total_redeemed: b.total_redeemed,
        }
    }
}

/// Stored balance compared with the balance implied by the user's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub user: UserId,
    pub stored: BalanceSnapshot,
    pub from_history: Amount,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored.balance == self.from_history
            && self.stored.balance == self.stored.total_earned - self.stored.total_redeemed
    }
}

/// Counts of a batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
}

/// The coin ledger.
pub struct Ledger {
    store: Store,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    config: RwLock<Arc<LedgerConfig>>,
}

/// Public API
impl Ledger {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            store: Store::new(),
            directory,
            clock: Arc::new(SystemClock),
            config: RwLock::new(Arc::new(LedgerConfig::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(self, config: LedgerConfig) -> Self {
        self.set_config(config);
        self
    }

    /// Replace the config; operations already running keep their snapshot.
    pub fn set_config(&self, config: LedgerConfig) {
        info!(version = config.version, "ledger config replaced");
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    pub fn config(&self) -> Arc<LedgerConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Submit a bill to earn coins. The coins are credited right away and the
    /// transaction waits in `Pending` for review.
    pub async fn submit_earn(
        &self,
        user: UserId,
        brand: BrandId,
        bill: Bill,
    ) -> Result<Submission, LedgerError> {
        let result = self.apply_earn(user, brand, bill).await;
        Self::log_refusal("earn", &result);
        result
    }

    /// Submit a bill to redeem `coins` against. The coins are reserved right
    /// away and the transaction waits in `Pending` for review.
    pub async fn submit_redeem(
        &self,
        user: UserId,
        brand: BrandId,
        bill: Bill,
        coins: Amount,
    ) -> Result<Submission, LedgerError> {
        let result = self.apply_redeem(user, brand, bill, coins).await;
        Self::log_refusal("redeem", &result);
        result
    }

    pub async fn approve(
        &self,
        tx: TxId,
        admin: AdminId,
        notes: Option<String>,
    ) -> Result<Decision, LedgerError> {
        let result = self.decide(tx, Action::Approve, admin, clean(notes), None).await;
        Self::log_refusal("approve", &result);
        result
    }

    /// Reject a pending claim and reverse its balance effect. `reason` is required.
    pub async fn reject(
        &self,
        tx: TxId,
        admin: AdminId,
        reason: &str,
        notes: Option<String>,
    ) -> Result<Decision, LedgerError> {
        let result = match reason.trim() {
            "" => Err(ValidationError::EmptyRejectionReason.into()),
            reason => {
                let notes = match clean(notes) {
                    Some(notes) => format!("{reason}: {notes}"),
                    None => reason.to_string(),
                };
                self.decide(tx, Action::Reject, admin, Some(notes), None)
                    .await
            }
        };
        Self::log_refusal("reject", &result);
        result
    }

    /// Mark an approved claim as processed ahead of payment.
    pub async fn mark_processed(
        &self,
        tx: TxId,
        admin: AdminId,
        notes: Option<String>,
    ) -> Result<Decision, LedgerError> {
        let result = self
            .decide(tx, Action::MarkProcessed, admin, clean(notes), None)
            .await;
        Self::log_refusal("mark processed", &result);
        result
    }

    /// Record the payout of an approved redemption under `reference`.
    pub async fn process_payment(
        &self,
        tx: TxId,
        admin: AdminId,
        reference: &str,
        notes: Option<String>,
    ) -> Result<Decision, LedgerError> {
        let result = match reference.trim() {
            "" => Err(ValidationError::EmptyPaymentReference.into()),
            reference => {
                self.decide(
                    tx,
                    Action::ProcessPayment,
                    admin,
                    clean(notes),
                    Some(reference.to_string()),
                )
                .await
            }
        };
        Self::log_refusal("process payment", &result);
        result
    }

    /// Manually correct `user`'s balance by a signed `amount`.
    pub async fn adjust(
        &self,
        user: UserId,
        admin: AdminId,
        amount: Amount,
        notes: &str,
    ) -> Result<Submission, LedgerError> {
        let result = self.apply_adjustment(user, admin, amount, notes).await;
        Self::log_refusal("adjust", &result);
        result
    }

    pub fn balance(&self, user: UserId) -> BalanceSnapshot {
        self.store
            .balance(user)
            .unwrap_or_else(|| CoinBalance::new(user))
            .into()
    }

    /// Every balance row, ordered by user.
    pub fn balances(&self) -> Vec<CoinBalance> {
        self.store.balances()
    }

    pub fn transaction(&self, tx: TxId) -> Result<CoinTransaction, LedgerError> {
        Ok(self.store.transaction(tx).ok_or(NotFound::Transaction(tx))?)
    }

    /// Full history of `user`, ordered by id.
    pub fn transactions_for_user(&self, user: UserId) -> Vec<CoinTransaction> {
        self.store.transactions_for_user(user)
    }

    pub fn has_welcome_bonus(&self, user: UserId) -> bool {
        self.store.welcome_issued(user)
    }

    /// Recompute `user`'s balance from history and compare it with the stored row.
    pub fn reconcile(&self, user: UserId) -> Reconciliation {
        let from_history = self
            .store
            .transactions_for_user(user)
            .iter()
            .filter(|t| t.status != TransactionStatus::Rejected)
            .map(|t| t.amount)
            .sum();
        Reconciliation {
            user,
            stored: self.balance(user),
            from_history,
        }
    }

    /// Apply a batch of commands in order. Failures are logged and skipped.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some(command) = stream.next().await {
            // a refused command must not stop the batch
            match self.apply(command).await {
                Ok(()) => summary.applied += 1,
                Err(_) => summary.skipped += 1,
            }
        }
        info!(
            applied = summary.applied,
            skipped = summary.skipped,
            "batch finished"
        );
        summary
    }

    /// Apply a single command.
    pub async fn apply(&self, command: Command) -> Result<(), LedgerError> {
        match command {
            Command::Earn { user, brand, bill } => {
                self.submit_earn(user, brand, bill).await?;
            }
            Command::Redeem {
                user,
                brand,
                bill,
                coins,
            } => {
                self.submit_redeem(user, brand, bill, coins).await?;
            }
            Command::Approve { tx, admin, notes } => {
                self.approve(tx, admin, notes).await?;
            }
            Command::Reject {
                tx,
                admin,
                reason,
                notes,
            } => {
                self.reject(tx, admin, &reason, notes).await?;
            }
            Command::MarkProcessed { tx, admin, notes } => {
                self.mark_processed(tx, admin, notes).await?;
            }
            Command::Pay {
                tx,
                admin,
                reference,
                notes,
            } => {
                self.process_payment(tx, admin, &reference, notes).await?;
            }
            Command::WelcomeBonus { user } => {
                self.issue_welcome_bonus(user).await?;
            }
            Command::Adjust {
                user,
                admin,
                amount,
                notes,
            } => {
                self.adjust(user, admin, amount, &notes).await?;
            }
        }
        Ok(())
    }
}

/// Private API
impl Ledger {
    fn log_refusal<T>(op: &str, result: &Result<T, LedgerError>) {
        if let Err(e) = result {
            info!(op, reason = %e, retryable = e.is_retryable(), "{op} refused");
        }
    }

    fn active_user(&self, id: UserId) -> Result<User, LedgerError> {
        let user = self.directory.user(id).ok_or(NotFound::User(id))?;
        if !user.is_active() {
            return Err(LedgerError::UserNotActive(id, user.status));
        }
        Ok(user)
    }

    /// Fraud window: the same bill may only be claimed once unless it was rejected.
    fn ensure_new_bill(
        uow: &UnitOfWork<'_>,
        user: UserId,
        brand: BrandId,
        bill: &Bill,
        config: &LedgerConfig,
    ) -> Result<(), ValidationError> {
        if !config.reject_duplicate_bills {
            return Ok(());
        }
        let existing = uow.find_transactions(|t| {
            t.user_id == user
                && t.brand_id == Some(brand)
                && t.bill_amount == Some(bill.amount)
                && t.bill_date == Some(bill.date)
                && t.status != TransactionStatus::Rejected
        });
        match existing.first() {
            Some(t) => Err(ValidationError::DuplicateBill {
                brand,
                bill: bill.amount,
                bill_date: bill.date,
                existing: t.id,
            }),
            None => Ok(()),
        }
    }

    /// Submit EARN:
    /// - Validate user, brand, and bill
    /// - Compute coins earned from the brand's earning percentage
    /// - Insert a pending record and credit the user, in one unit of work
    async fn apply_earn(
        &self,
        user: UserId,
        brand_id: BrandId,
        bill: Bill,
    ) -> Result<Submission, LedgerError> {
        let config = self.config();
        let now = self.clock.now();

        self.active_user(user)?;
        let brand = self
            .directory
            .brand(brand_id)
            .ok_or(NotFound::Brand(brand_id))?;
        caps::validate_bill(&bill, now.date_naive(), &config)?;
        let coins = caps::check_earn_admissible(&brand, bill.amount)?;

        let mut uow = self
            .store
            .begin([LockKey::User(user)], config.lock_timeout())
            .await?;
        Self::ensure_new_bill(&uow, user, brand_id, &bill, &config)?;

        let mut record = CoinTransaction::pending(user, TransactionType::Earn, coins, now);
        record.brand_id = Some(brand_id);
        record.bill_amount = Some(bill.amount);
        record.bill_date = Some(bill.date);
        record.receipt_url = bill.receipt_url;
        record.coins_earned = Some(coins);
        let record = uow.create(record)?;
        let new_balance =
            balance::apply_delta(&mut uow, user, coins, TransactionType::Earn, now)?;
        uow.commit();

        info!(
            user,
            brand = brand_id,
            tx = record.id,
            coins = %coins,
            balance = %new_balance,
            config = config.version,
            "earn submitted"
        );
        Ok(Submission {
            transaction_id: record.id,
            status: record.status,
            new_balance,
        })
    }

    /// Submit REDEEM:
    /// - Validate user, brand, and bill
    /// - Under the brand and user locks, check per-transaction limits, the
    ///   user's balance, and the brand's overall cap
    /// - Debit the user and insert a pending record, in one unit of work
    async fn apply_redeem(
        &self,
        user: UserId,
        brand_id: BrandId,
        bill: Bill,
        coins: Amount,
    ) -> Result<Submission, LedgerError> {
        let config = self.config();
        let now = self.clock.now();

        self.active_user(user)?;
        let brand = self
            .directory
            .brand(brand_id)
            .ok_or(NotFound::Brand(brand_id))?;
        caps::validate_bill(&bill, now.date_naive(), &config)?;
        if !coins.is_positive() {
            return Err(ValidationError::NonPositiveAmount(coins).into());
        }

        let mut uow = self
            .store
            .begin(
                [LockKey::Brand(brand_id), LockKey::User(user)],
                config.lock_timeout(),
            )
            .await?;
        Self::ensure_new_bill(&uow, user, brand_id, &bill, &config)?;
        caps::check_redeem_admissible(&brand, bill.amount, coins, &uow.balance(user))?;

        if brand.overall_max_cap.is_some() {
            // pending redemptions are already debited, so they count as reserved
            let reserved = uow
                .find_transactions(|t| {
                    t.brand_id == Some(brand_id)
                        && t.kind == TransactionType::Redeem
                        && t.status != TransactionStatus::Rejected
                })
                .iter()
                .filter_map(|t| t.coins_redeemed)
                .sum();
            caps::check_overall_cap(&brand, reserved, coins)?;
        }

        let new_balance =
            balance::apply_delta(&mut uow, user, -coins, TransactionType::Redeem, now)?;
        let mut record = CoinTransaction::pending(user, TransactionType::Redeem, -coins, now);
        record.brand_id = Some(brand_id);
        record.bill_amount = Some(bill.amount);
        record.bill_date = Some(bill.date);
        record.receipt_url = bill.receipt_url;
        record.coins_redeemed = Some(coins);
        let record = uow.create(record)?;
        uow.commit();

        info!(
            user,
            brand = brand_id,
            tx = record.id,
            coins = %coins,
            balance = %new_balance,
            config = config.version,
            "redeem submitted"
        );
        Ok(Submission {
            transaction_id: record.id,
            status: record.status,
            new_balance,
        })
    }

    /// Admin decision:
    /// - Lock the owner's balance row and the transaction row
    /// - Plan the transition from the current status
    /// - Move the status and, for rejections, reverse the submission delta
    async fn decide(
        &self,
        tx: TxId,
        action: Action,
        admin: AdminId,
        notes: Option<String>,
        payment_reference: Option<String>,
    ) -> Result<Decision, LedgerError> {
        let config = self.config();
        let now = self.clock.now();

        // the owner never changes, so an unlocked read is enough to pick the locks
        let owner = self
            .store
            .transaction(tx)
            .ok_or(NotFound::Transaction(tx))?
            .user_id;
        let mut uow = self
            .store
            .begin(
                [LockKey::User(owner), LockKey::Transaction(tx)],
                config.lock_timeout(),
            )
            .await?;

        let record = uow.transaction(tx).ok_or(NotFound::Transaction(tx))?;
        let planned = transition::plan(&record, action)?;
        let meta = TransitionMeta {
            action,
            admin,
            notes,
            at: now,
            payment_reference,
        };
        let updated = uow.transition(tx, planned.from, planned.to, meta)?;

        let new_balance = match planned.effect {
            Effect::Keep => None,
            Effect::Reverse => {
                let reversed =
                    balance::reverse_delta(&mut uow, record.user_id, record.amount, record.kind, now);
                if let Err(e @ LedgerError::InsufficientBalance { .. }) = &reversed {
                    warn!(tx, user = record.user_id, reason = %e, "reversal refused");
                }
                Some(reversed?)
            }
        };
        uow.commit();

        info!(
            tx,
            admin,
            user = record.user_id,
            from = %planned.from,
            to = %planned.to,
            config = config.version,
            "{action} applied"
        );
        Ok(Decision {
            transaction_id: tx,
            status: updated.status,
            new_balance,
        })
    }

    /// Adjustment:
    /// - Validate the amount and the audit note
    /// - Insert an approved ADJUSTMENT record and apply the signed delta
    async fn apply_adjustment(
        &self,
        user: UserId,
        admin: AdminId,
        amount: Amount,
        notes: &str,
    ) -> Result<Submission, LedgerError> {
        let config = self.config();
        let now = self.clock.now();

        if amount.is_zero() {
            return Err(ValidationError::ZeroAmount.into());
        }
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(ValidationError::EmptyAdjustmentNotes.into());
        }
        self.directory.user(user).ok_or(NotFound::User(user))?;

        let mut uow = self
            .store
            .begin([LockKey::User(user)], config.lock_timeout())
            .await?;
        let new_balance =
            balance::apply_delta(&mut uow, user, amount, TransactionType::Adjustment, now)?;
        let mut record = CoinTransaction::pending(user, TransactionType::Adjustment, amount, now);
        record.status = TransactionStatus::Approved;
        record.admin_notes = Some(notes.to_string());
        record.processed_by = Some(admin);
        record.processed_at = Some(now);
        let record = uow.create(record)?;
        uow.commit();

        info!(
            user,
            admin,
            tx = record.id,
            amount = %amount,
            balance = %new_balance,
            config = config.version,
            "balance adjusted"
        );
        Ok(Submission {
            transaction_id: record.id,
            status: record.status,
            new_balance,
        })
    }
}

fn clean(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}
