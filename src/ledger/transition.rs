//! Transaction lifecycle rules.
//!
//! ```text
//! PENDING --approve--> APPROVED --mark processed--> PROCESSED
//!    |                    |                            |
//!  reject           process payment             process payment
//!    v                    v                            v
//! REJECTED              PAID <-------------------------+
//! ```
//!
//! Only a rejection touches the balance: it reverses the delta applied at
//! submission. Everything else confirms a delta that is already in place.

use std::fmt;

use crate::ledger::{LedgerError, ValidationError};
use crate::model::{CoinTransaction, TransactionStatus, TransactionType};

/// An admin decision on a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    MarkProcessed,
    ProcessPayment,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::MarkProcessed => "mark processed",
            Action::ProcessPayment => "process payment",
        })
    }
}

/// What the balance ledger must do alongside a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The submission-time delta stands.
    Keep,
    /// Undo the submission-time delta.
    Reverse,
}

/// A legal status change and its ledger effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub effect: Effect,
}

/// Whether `from -> to` appears in the lifecycle table.
pub fn is_legal(from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;
    matches!(
        (from, to),
        (Pending, Approved)
            | (Pending, Rejected)
            | (Approved, Processed)
            | (Approved, Paid)
            | (Processed, Paid)
    )
}

/// Decide the transition `action` causes on `record`, without touching anything.
pub fn plan(record: &CoinTransaction, action: Action) -> Result<Transition, LedgerError> {
    use TransactionStatus::*;

    let supported = match action {
        Action::Approve | Action::Reject | Action::MarkProcessed => {
            matches!(record.kind, TransactionType::Earn | TransactionType::Redeem)
        }
        Action::ProcessPayment => record.kind == TransactionType::Redeem,
    };
    if !supported {
        return Err(ValidationError::UnsupportedAction {
            action,
            kind: record.kind,
        }
        .into());
    }

    let (to, effect) = match action {
        Action::Approve => (Approved, Effect::Keep),
        Action::Reject => (Rejected, Effect::Reverse),
        Action::MarkProcessed => (Processed, Effect::Keep),
        Action::ProcessPayment => (Paid, Effect::Keep),
    };

    if !is_legal(record.status, to) {
        return Err(LedgerError::InvalidStateTransition {
            tx: record.id,
            action,
            current: record.status,
        });
    }

    Ok(Transition {
        from: record.status,
        to,
        effect,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::Amount;

    fn record(kind: TransactionType, status: TransactionStatus) -> CoinTransaction {
        let amount = match kind {
            TransactionType::Redeem => Amount::whole(-100),
            _ => Amount::whole(100),
        };
        let mut record = CoinTransaction::pending(1, kind, amount, DateTime::<Utc>::MIN_UTC);
        record.id = 9;
        record.brand_id = Some(1);
        record.status = status;
        record
    }

    #[test]
    fn legal_table() {
        use TransactionStatus::*;
        let all = [Pending, Approved, Rejected, Processed, Paid];
        let legal: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_legal(*from, *to))
            .collect();
        assert_eq!(
            legal,
            vec![
                (Pending, Approved),
                (Pending, Rejected),
                (Approved, Processed),
                (Approved, Paid),
                (Processed, Paid),
            ]
        );
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use TransactionStatus::*;
        for to in [Pending, Approved, Rejected, Processed, Paid] {
            assert!(!is_legal(Rejected, to));
            assert!(!is_legal(Paid, to));
            assert!(!is_legal(to, Pending));
        }
    }

    #[test]
    fn approve_pending_keeps_delta() {
        let t = plan(
            &record(TransactionType::Earn, TransactionStatus::Pending),
            Action::Approve,
        )
        .unwrap();
        assert_eq!(t.to, TransactionStatus::Approved);
        assert_eq!(t.effect, Effect::Keep);
    }

    #[test]
    fn reject_pending_reverses_delta() {
        let t = plan(
            &record(TransactionType::Redeem, TransactionStatus::Pending),
            Action::Reject,
        )
        .unwrap();
        assert_eq!(t.to, TransactionStatus::Rejected);
        assert_eq!(t.effect, Effect::Reverse);
    }

    #[test]
    fn approve_twice_is_invalid() {
        let err = plan(
            &record(TransactionType::Earn, TransactionStatus::Approved),
            Action::Approve,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidStateTransition {
                tx: 9,
                action: Action::Approve,
                current: TransactionStatus::Approved,
            }
        ));
    }

    #[test]
    fn approved_cannot_be_rejected() {
        let err = plan(
            &record(TransactionType::Redeem, TransactionStatus::Approved),
            Action::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidStateTransition { .. }));
    }

    #[test]
    fn payment_requires_approval_first() {
        let pending = record(TransactionType::Redeem, TransactionStatus::Pending);
        assert!(matches!(
            plan(&pending, Action::ProcessPayment),
            Err(LedgerError::InvalidStateTransition { .. })
        ));

        let processed = record(TransactionType::Redeem, TransactionStatus::Processed);
        assert_eq!(
            plan(&processed, Action::ProcessPayment).unwrap().to,
            TransactionStatus::Paid
        );
    }

    #[test]
    fn payment_only_for_redemptions() {
        let earn = record(TransactionType::Earn, TransactionStatus::Approved);
        assert!(matches!(
            plan(&earn, Action::ProcessPayment),
            Err(LedgerError::Validation(ValidationError::UnsupportedAction { .. }))
        ));
    }

    #[test]
    fn bonus_and_adjustments_are_not_reviewable() {
        for kind in [TransactionType::WelcomeBonus, TransactionType::Adjustment] {
            let r = record(kind, TransactionStatus::Approved);
            assert!(matches!(
                plan(&r, Action::Reject),
                Err(LedgerError::Validation(ValidationError::UnsupportedAction { .. }))
            ));
        }
    }
}
