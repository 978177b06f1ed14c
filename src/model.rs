//! Core domain types for the coin ledger.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::Amount;
use crate::amount::Percentage;
use crate::ledger::ValidationError;

/// User identifier.
pub type UserId = u64;

/// Brand identifier.
pub type BrandId = u32;

/// Coin transaction identifier.
pub type TxId = u64;

/// Administrator identifier.
pub type AdminId = u64;

/// Kind of claim recorded against a user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Earn,
    Redeem,
    WelcomeBonus,
    Adjustment,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionType::Earn => "EARN",
            TransactionType::Redeem => "REDEEM",
            TransactionType::WelcomeBonus => "WELCOME_BONUS",
            TransactionType::Adjustment => "ADJUSTMENT",
        })
    }
}

/// Lifecycle status of a coin transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Awaiting an admin decision.
    Pending,
    Approved,
    /// Terminal; the provisional delta has been reversed.
    Rejected,
    /// Marked for payment, not yet paid.
    Processed,
    /// Terminal; payment completed.
    Paid,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Rejected | TransactionStatus::Paid)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Approved => "APPROVED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Processed => "PROCESSED",
            TransactionStatus::Paid => "PAID",
        })
    }
}

/// One claim against a user's balance.
///
/// `amount` is the signed ledger effect: positive for credits, negative for
/// debits. Status only changes through
/// [`UnitOfWork::transition`](crate::ledger::UnitOfWork::transition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinTransaction {
    pub id: TxId,
    pub user_id: UserId,
    pub brand_id: Option<BrandId>,
    pub kind: TransactionType,
    pub amount: Amount,
    pub bill_amount: Option<Amount>,
    pub coins_earned: Option<Amount>,
    pub coins_redeemed: Option<Amount>,
    pub status: TransactionStatus,
    pub receipt_url: Option<String>,
    pub bill_date: Option<NaiveDate>,
    pub admin_notes: Option<String>,
    pub processed_by: Option<AdminId>,
    pub processed_at: Option<DateTime<Utc>>,
    /// External payment reference, set when a redemption is paid.
    pub transaction_id: Option<String>,
    pub payment_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CoinTransaction {
    /// A `Pending` record with every optional field empty. The store assigns `id` on insert.
    pub fn pending(
        user_id: UserId,
        kind: TransactionType,
        amount: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            brand_id: None,
            kind,
            amount,
            bill_amount: None,
            coins_earned: None,
            coins_redeemed: None,
            status: TransactionStatus::Pending,
            receipt_url: None,
            bill_date: None,
            admin_notes: None,
            processed_by: None,
            processed_at: None,
            transaction_id: None,
            payment_processed_at: None,
            created_at,
        }
    }

    /// Structural checks on a record about to be written.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }

        let sign_ok = match self.kind {
            TransactionType::Earn | TransactionType::WelcomeBonus => self.amount.is_positive(),
            TransactionType::Redeem => self.amount.is_negative(),
            TransactionType::Adjustment => true,
        };
        if !sign_ok {
            return Err(ValidationError::InconsistentRecord(format!(
                "{} transaction with amount {}",
                self.kind, self.amount
            )));
        }

        let fields_ok = match self.kind {
            TransactionType::Earn => {
                self.coins_redeemed.is_none() && self.coins_earned == Some(self.amount)
            }
            TransactionType::Redeem => {
                self.coins_earned.is_none() && self.coins_redeemed == Some(-self.amount)
            }
            TransactionType::WelcomeBonus | TransactionType::Adjustment => {
                self.coins_earned.is_none() && self.coins_redeemed.is_none()
            }
        };
        if !fields_ok {
            return Err(ValidationError::InconsistentRecord(format!(
                "{} transaction has mismatched coin fields",
                self.kind
            )));
        }

        let needs_brand = matches!(self.kind, TransactionType::Earn | TransactionType::Redeem);
        if needs_brand != self.brand_id.is_some() {
            return Err(ValidationError::InconsistentRecord(format!(
                "{} transaction brand presence is wrong",
                self.kind
            )));
        }

        Ok(())
    }
}

/// Running coin totals for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinBalance {
    pub user_id: UserId,
    pub balance: Amount,
    pub total_earned: Amount,
    pub total_redeemed: Amount,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CoinBalance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Amount::ZERO,
            total_earned: Amount::ZERO,
            total_redeemed: Amount::ZERO,
            last_updated: None,
        }
    }
}

/// Brand earning/redemption configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Brand {
    pub id: BrandId,
    pub name: String,
    pub earning_percentage: Percentage,
    pub redemption_percentage: Percentage,
    pub min_redemption_amount: Option<Amount>,
    /// Per-transaction redemption ceiling.
    pub brandwise_max_cap: Option<Amount>,
    /// Cumulative redemption ceiling across every user of the brand.
    pub overall_max_cap: Option<Amount>,
    pub active: bool,
}

impl Brand {
    /// Same value as the brandwise cap; the two are never configured separately.
    pub fn max_redemption_amount(&self) -> Option<Amount> {
        self.brandwise_max_cap
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(min), Some(max)) = (self.min_redemption_amount, self.max_redemption_amount())
            && max < min
        {
            return Err(ValidationError::InvalidBrand {
                brand: self.id,
                reason: format!("max redemption {max} is below min redemption {min}"),
            });
        }
        let negative = [
            self.min_redemption_amount,
            self.brandwise_max_cap,
            self.overall_max_cap,
        ]
        .into_iter()
        .flatten()
        .any(Amount::is_negative);
        if negative {
            return Err(ValidationError::InvalidBrand {
                brand: self.id,
                reason: "caps must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Account status of a user as reported by the user directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Blocked,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Blocked => "blocked",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: UserId,
    pub status: UserStatus,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// A bill submitted with an earn or redeem claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bill {
    pub amount: Amount,
    pub date: NaiveDate,
    pub receipt_url: Option<String>,
}

/// A ledger operation, as replayed from a batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Earn {
        user: UserId,
        brand: BrandId,
        bill: Bill,
    },
    Redeem {
        user: UserId,
        brand: BrandId,
        bill: Bill,
        coins: Amount,
    },
    Approve {
        tx: TxId,
        admin: AdminId,
        notes: Option<String>,
    },
    Reject {
        tx: TxId,
        admin: AdminId,
        reason: String,
        notes: Option<String>,
    },
    MarkProcessed {
        tx: TxId,
        admin: AdminId,
        notes: Option<String>,
    },
    Pay {
        tx: TxId,
        admin: AdminId,
        reference: String,
        notes: Option<String>,
    },
    WelcomeBonus {
        user: UserId,
    },
    Adjust {
        user: UserId,
        admin: AdminId,
        amount: Amount,
        notes: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Earn { .. } => "earn",
            Command::Redeem { .. } => "redeem",
            Command::Approve { .. } => "approve",
            Command::Reject { .. } => "reject",
            Command::MarkProcessed { .. } => "process",
            Command::Pay { .. } => "pay",
            Command::WelcomeBonus { .. } => "welcome",
            Command::Adjust { .. } => "adjust",
        }
    }
}
