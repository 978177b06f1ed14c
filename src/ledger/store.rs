//! Transaction record store, balance rows and the unit-of-work that guards them.
//!
//! Writes never go straight to the tables. A [`UnitOfWork`] holds the per-key
//! locks for the rows it touches, stages every write, and publishes them all in
//! [`UnitOfWork::commit`]. Dropping it uncommitted discards the staged writes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ledger::transition::{self, Action};
use crate::ledger::{LedgerError, NotFound, ValidationError};
use crate::model::{
    AdminId, BrandId, CoinBalance, CoinTransaction, TransactionStatus, TxId, UserId,
};

/// A lockable row.
///
/// Locks are always taken in this enum's order (brands, then users, then
/// transactions), so two units of work can never wait on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Brand(BrandId),
    User(UserId),
    Transaction(TxId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Brand(id) => write!(f, "brand {id}"),
            LockKey::User(id) => write!(f, "user {id}"),
            LockKey::Transaction(id) => write!(f, "transaction {id}"),
        }
    }
}

/// Audit data stamped on a record by a status change.
#[derive(Debug, Clone)]
pub struct TransitionMeta {
    pub action: Action,
    pub admin: AdminId,
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
    /// External payment reference, only for payments.
    pub payment_reference: Option<String>,
}

#[derive(Default)]
struct Tables {
    balances: HashMap<UserId, CoinBalance>,
    transactions: BTreeMap<TxId, CoinTransaction>,
    welcome_issued: HashSet<UserId>,
}

/// Per-key lock handles, kept only while someone holds or waits on them.
#[derive(Default)]
struct LockTable {
    handles: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn handle(&self, key: LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(handles.entry(key).or_default())
    }

    /// Evict the handles of `keys` that only the table still references.
    ///
    /// Guards and waiters each hold a clone, so a handle with a strong count
    /// of one is idle. The count is read under the table mutex, the same one
    /// `handle` clones under, so no new waiter can slip in between.
    fn release(&self, keys: impl IntoIterator<Item = LockKey>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if handles
                .get(&key)
                .is_some_and(|handle| Arc::strong_count(handle) == 1)
            {
                handles.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// In-memory store of balances, transactions and welcome-bonus flags.
pub struct Store {
    tables: Mutex<Tables>,
    locks: LockTable,
    next_id: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            locks: LockTable::default(),
            next_id: AtomicU64::new(1),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a unit of work holding exclusive locks on `keys`.
    ///
    /// Fails with [`LedgerError::ConcurrencyConflict`] if all locks cannot be
    /// taken within `timeout`; locks already taken are released.
    pub async fn begin(
        &self,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<UnitOfWork<'_>, LedgerError> {
        let keys: BTreeSet<LockKey> = keys.into_iter().collect();
        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(keys.len());

        for key in keys {
            let handle = self.locks.handle(key);
            let acquired = tokio::time::timeout_at(deadline, handle.lock_owned()).await;
            match acquired {
                Ok(guard) => guards.push((key, guard)),
                Err(_) => {
                    warn!(lock = %key, timeout_ms = timeout.as_millis(), "lock wait timed out");
                    let taken: Vec<LockKey> = guards.into_iter().map(|(k, _)| k).collect();
                    self.locks.release(taken.into_iter().chain([key]));
                    return Err(LedgerError::ConcurrencyConflict(key));
                }
            }
        }
        debug!(locks = guards.len(), "unit of work started");

        Ok(UnitOfWork {
            store: self,
            guards,
            balances: HashMap::new(),
            transactions: BTreeMap::new(),
            welcome_issued: HashSet::new(),
        })
    }

    /// Committed balance row of `user`, if one exists.
    pub fn balance(&self, user: UserId) -> Option<CoinBalance> {
        self.tables().balances.get(&user).cloned()
    }

    /// All committed balance rows, ordered by user.
    pub fn balances(&self) -> Vec<CoinBalance> {
        let mut rows: Vec<_> = self.tables().balances.values().cloned().collect();
        rows.sort_by_key(|b| b.user_id);
        rows
    }

    pub fn transaction(&self, id: TxId) -> Option<CoinTransaction> {
        self.tables().transactions.get(&id).cloned()
    }

    /// Committed history of `user`, ordered by id.
    pub fn transactions_for_user(&self, user: UserId) -> Vec<CoinTransaction> {
        self.tables()
            .transactions
            .values()
            .filter(|t| t.user_id == user)
            .cloned()
            .collect()
    }

    pub fn welcome_issued(&self, user: UserId) -> bool {
        self.tables().welcome_issued.contains(&user)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// One atomic, locked batch of reads and staged writes.
pub struct UnitOfWork<'a> {
    store: &'a Store,
    guards: Vec<(LockKey, OwnedMutexGuard<()>)>,
    balances: HashMap<UserId, CoinBalance>,
    transactions: BTreeMap<TxId, CoinTransaction>,
    welcome_issued: HashSet<UserId>,
}

impl UnitOfWork<'_> {
    pub fn holds(&self, key: LockKey) -> bool {
        self.guards.iter().any(|(k, _)| *k == key)
    }

    /// Current balance row of `user`, or a zeroed one if none exists yet.
    pub fn balance(&self, user: UserId) -> CoinBalance {
        self.balances
            .get(&user)
            .cloned()
            .or_else(|| self.store.balance(user))
            .unwrap_or_else(|| CoinBalance::new(user))
    }

    /// Only the balance ledger writes balance rows.
    pub(crate) fn put_balance(&mut self, balance: CoinBalance) {
        self.balances.insert(balance.user_id, balance);
    }

    pub fn transaction(&self, id: TxId) -> Option<CoinTransaction> {
        self.transactions
            .get(&id)
            .cloned()
            .or_else(|| self.store.transaction(id))
    }

    /// Every transaction matching `filter`, staged rows shadowing committed ones.
    pub fn find_transactions(
        &self,
        filter: impl Fn(&CoinTransaction) -> bool,
    ) -> Vec<CoinTransaction> {
        let mut found: BTreeMap<TxId, CoinTransaction> = self
            .store
            .tables()
            .transactions
            .values()
            .filter(|t| !self.transactions.contains_key(&t.id) && filter(t))
            .map(|t| (t.id, t.clone()))
            .collect();
        found.extend(
            self.transactions
                .values()
                .filter(|t| filter(t))
                .map(|t| (t.id, t.clone())),
        );
        found.into_values().collect()
    }

    /// Insert a new record, assigning its id.
    ///
    /// Records enter either awaiting review (`Pending`) or, for admin/system
    /// credits, already `Approved`.
    pub fn create(&mut self, mut record: CoinTransaction) -> Result<CoinTransaction, LedgerError> {
        if !matches!(
            record.status,
            TransactionStatus::Pending | TransactionStatus::Approved
        ) {
            return Err(ValidationError::InconsistentRecord(format!(
                "new transactions cannot start as {}",
                record.status
            ))
            .into());
        }
        record.validate()?;
        debug_assert!(self.holds(LockKey::User(record.user_id)));

        record.id = self.store.next_id.fetch_add(1, Ordering::Relaxed);
        self.transactions.insert(record.id, record.clone());
        Ok(record)
    }

    /// Move record `id` from `expected` to `to`, stamping `meta`.
    ///
    /// Fails with [`LedgerError::InvalidStateTransition`] if the record is no
    /// longer in `expected`, e.g. because another admin decided first.
    pub fn transition(
        &mut self,
        id: TxId,
        expected: TransactionStatus,
        to: TransactionStatus,
        meta: TransitionMeta,
    ) -> Result<CoinTransaction, LedgerError> {
        debug_assert!(self.holds(LockKey::Transaction(id)));
        let mut record = self
            .transaction(id)
            .ok_or(NotFound::Transaction(id))?;

        if record.status != expected || !transition::is_legal(expected, to) {
            return Err(LedgerError::InvalidStateTransition {
                tx: id,
                action: meta.action,
                current: record.status,
            });
        }

        record.status = to;
        record.admin_notes = meta.notes;
        record.processed_by = Some(meta.admin);
        record.processed_at = Some(meta.at);
        if to == TransactionStatus::Paid {
            record.transaction_id = meta.payment_reference;
            record.payment_processed_at = Some(meta.at);
        }

        self.transactions.insert(id, record.clone());
        Ok(record)
    }

    pub fn welcome_issued(&self, user: UserId) -> bool {
        self.welcome_issued.contains(&user) || self.store.welcome_issued(user)
    }

    pub fn mark_welcome_issued(&mut self, user: UserId) {
        debug_assert!(self.holds(LockKey::User(user)));
        self.welcome_issued.insert(user);
    }

    /// Publish every staged write at once, then release the locks.
    pub fn commit(mut self) {
        let mut tables = self.store.tables();
        let (balances, transactions) = (self.balances.len(), self.transactions.len());
        tables.balances.extend(std::mem::take(&mut self.balances));
        tables.transactions.extend(std::mem::take(&mut self.transactions));
        tables.welcome_issued.extend(std::mem::take(&mut self.welcome_issued));
        drop(tables);
        debug!(balances, transactions, "unit of work committed");
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        // drop every guard before looking at the handle counts
        let keys: Vec<LockKey> = self.guards.drain(..).map(|(key, _)| key).collect();
        self.store.locks.release(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::model::TransactionType;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn welcome(user: UserId) -> CoinTransaction {
        CoinTransaction::pending(
            user,
            TransactionType::WelcomeBonus,
            Amount::whole(100),
            DateTime::<Utc>::UNIX_EPOCH,
        )
    }

    fn meta(action: Action) -> TransitionMeta {
        TransitionMeta {
            action,
            admin: 42,
            notes: Some("checked".to_string()),
            at: DateTime::<Utc>::UNIX_EPOCH,
            payment_reference: None,
        }
    }

    #[test]
    fn lock_order_is_brand_user_transaction() {
        let mut keys = vec![
            LockKey::Transaction(1),
            LockKey::User(5),
            LockKey::Brand(9),
            LockKey::User(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                LockKey::Brand(9),
                LockKey::User(2),
                LockKey::User(5),
                LockKey::Transaction(1),
            ]
        );
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids() {
        let store = Store::new();
        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        let a = uow.create(welcome(1)).unwrap();
        let b = uow.create(welcome(1)).unwrap();
        uow.commit();

        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.transactions_for_user(1).len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_terminal_start() {
        let store = Store::new();
        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        let mut record = welcome(1);
        record.status = TransactionStatus::Paid;
        assert!(matches!(
            uow.create(record),
            Err(LedgerError::Validation(ValidationError::InconsistentRecord(_)))
        ));
    }

    #[tokio::test]
    async fn dropped_unit_of_work_rolls_back() {
        let store = Store::new();
        {
            let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
            let mut balance = uow.balance(1);
            balance.balance = Amount::whole(10);
            uow.put_balance(balance);
            uow.create(welcome(1)).unwrap();
            uow.mark_welcome_issued(1);
            assert!(uow.welcome_issued(1));
        }
        assert!(store.balance(1).is_none());
        assert!(store.transactions_for_user(1).is_empty());
        assert!(!store.welcome_issued(1));
    }

    #[tokio::test]
    async fn transition_checks_expected_status() {
        let store = Store::new();
        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        let id = uow.create(welcome(1)).unwrap().id;
        uow.commit();

        let mut uow = store
            .begin([LockKey::User(1), LockKey::Transaction(id)], TIMEOUT)
            .await
            .unwrap();
        let record = uow
            .transition(
                id,
                TransactionStatus::Pending,
                TransactionStatus::Approved,
                meta(Action::Approve),
            )
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Approved);
        assert_eq!(record.processed_by, Some(42));
        assert_eq!(record.admin_notes.as_deref(), Some("checked"));

        // staged status is visible to the same unit of work
        let err = uow
            .transition(
                id,
                TransactionStatus::Pending,
                TransactionStatus::Rejected,
                meta(Action::Reject),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidStateTransition {
                current: TransactionStatus::Approved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn paid_transition_stamps_reference() {
        let store = Store::new();
        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        let mut record = welcome(1);
        record.status = TransactionStatus::Approved;
        let id = uow.create(record).unwrap().id;
        uow.commit();

        let mut m = meta(Action::ProcessPayment);
        m.payment_reference = Some("REF-1".to_string());
        let mut uow = store
            .begin([LockKey::Transaction(id)], TIMEOUT)
            .await
            .unwrap();
        let paid = uow
            .transition(id, TransactionStatus::Approved, TransactionStatus::Paid, m)
            .unwrap();
        assert_eq!(paid.transaction_id.as_deref(), Some("REF-1"));
        assert!(paid.payment_processed_at.is_some());
    }

    #[tokio::test]
    async fn find_sees_staged_rows() {
        let store = Store::new();
        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        uow.create(welcome(1)).unwrap();
        uow.commit();

        let mut uow = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        uow.create(welcome(1)).unwrap();
        assert_eq!(uow.find_transactions(|t| t.user_id == 1).len(), 2);
        assert_eq!(store.transactions_for_user(1).len(), 1);
    }

    #[tokio::test]
    async fn lock_timeout_is_a_concurrency_conflict() {
        let store = Store::new();
        let _held = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();

        let err = store
            .begin([LockKey::User(1)], Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(LockKey::User(1))));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn finished_units_of_work_leave_no_lock_handles() {
        let store = Store::new();
        for id in 1..=100 {
            let uow = store
                .begin([LockKey::User(1), LockKey::Transaction(id)], TIMEOUT)
                .await
                .unwrap();
            if id % 2 == 0 {
                uow.commit();
            }
        }
        assert_eq!(store.locks.len(), 0);

        // a timed out wait releases what it took and what it waited on
        let held = store.begin([LockKey::User(2)], TIMEOUT).await.unwrap();
        let err = store
            .begin(
                [LockKey::Brand(1), LockKey::User(2)],
                Duration::from_millis(20),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(LockKey::User(2))));
        assert_eq!(store.locks.len(), 1);
        drop(held);
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn held_handles_survive_release() {
        let store = Store::new();
        let held = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        store.locks.release([LockKey::User(1)]);
        assert_eq!(store.locks.len(), 1);

        drop(held);
        assert_eq!(store.locks.len(), 0);
        assert!(store.begin([LockKey::User(1)], TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn other_users_do_not_block() {
        let store = Store::new();
        let _held = store.begin([LockKey::User(1)], TIMEOUT).await.unwrap();
        assert!(store.begin([LockKey::User(2)], TIMEOUT).await.is_ok());
    }
}
