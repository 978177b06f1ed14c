//! Brand cap enforcement and bill checks.
//!
//! Everything here is a pure function of its inputs. The one check that needs
//! history, the brand's overall cap, takes the already-reserved total as an
//! argument; the caller reads it under the brand lock.

use chrono::NaiveDate;

use crate::Amount;
use crate::config::LedgerConfig;
use crate::ledger::{CapExceededError, LedgerError, ValidationError};
use crate::model::{Bill, Brand, CoinBalance};

/// Check a bill's amount and date against the configured limits.
pub fn validate_bill(
    bill: &Bill,
    today: NaiveDate,
    config: &LedgerConfig,
) -> Result<(), ValidationError> {
    if !bill.amount.is_positive() {
        return Err(ValidationError::NonPositiveAmount(bill.amount));
    }
    if bill.amount < config.min_bill_amount {
        return Err(ValidationError::BillBelowMinimum {
            bill: bill.amount,
            minimum: config.min_bill_amount,
        });
    }
    if bill.date > today {
        return Err(ValidationError::BillDateInFuture {
            bill_date: bill.date,
            today,
        });
    }
    if (today - bill.date).num_days() > i64::from(config.max_bill_age_days) {
        return Err(ValidationError::BillTooOld {
            bill_date: bill.date,
            max_age_days: config.max_bill_age_days,
        });
    }
    Ok(())
}

fn ensure_usable(brand: &Brand) -> Result<(), ValidationError> {
    if !brand.active {
        return Err(ValidationError::BrandInactive(brand.id));
    }
    brand.validate()
}

/// Coins a bill earns at `brand`.
pub fn check_earn_admissible(brand: &Brand, bill_amount: Amount) -> Result<Amount, LedgerError> {
    ensure_usable(brand)?;
    if !bill_amount.is_positive() {
        return Err(ValidationError::NonPositiveAmount(bill_amount).into());
    }

    let coins = bill_amount.percent(brand.earning_percentage);
    if !coins.is_positive() {
        return Err(ValidationError::NothingEarned(bill_amount).into());
    }
    Ok(coins)
}

/// Most coins a single redemption against `bill_amount` may use at `brand`.
pub fn max_redeemable(brand: &Brand, bill_amount: Amount) -> Amount {
    let by_percentage = bill_amount.percent(brand.redemption_percentage);
    match brand.brandwise_max_cap {
        Some(cap) => by_percentage.min(cap),
        None => by_percentage,
    }
}

/// Check a redemption against the brand's per-transaction limits and the user's balance.
pub fn check_redeem_admissible(
    brand: &Brand,
    bill_amount: Amount,
    coins: Amount,
    balance: &CoinBalance,
) -> Result<(), LedgerError> {
    ensure_usable(brand)?;
    if !bill_amount.is_positive() {
        return Err(ValidationError::NonPositiveAmount(bill_amount).into());
    }
    if !coins.is_positive() {
        return Err(ValidationError::NonPositiveAmount(coins).into());
    }

    if let Some(minimum) = brand.min_redemption_amount
        && bill_amount < minimum
    {
        return Err(CapExceededError::BelowMinimumRedemption {
            brand: brand.id,
            bill: bill_amount,
            minimum,
        }
        .into());
    }

    let max = max_redeemable(brand, bill_amount);
    if coins > max {
        return Err(CapExceededError::PerTransaction {
            brand: brand.id,
            requested: coins,
            max,
        }
        .into());
    }

    if coins > balance.balance {
        return Err(LedgerError::InsufficientBalance {
            user: balance.user_id,
            balance: balance.balance,
            requested: coins,
        });
    }
    Ok(())
}

/// Check a redemption against the brand's cumulative cap, given what is already reserved.
pub fn check_overall_cap(brand: &Brand, reserved: Amount, coins: Amount) -> Result<(), LedgerError> {
    let Some(cap) = brand.overall_max_cap else {
        return Ok(());
    };
    let after = reserved.checked_add(coins);
    if after.is_none_or(|total| total > cap) {
        return Err(CapExceededError::Overall {
            brand: brand.id,
            used: reserved,
            requested: coins,
            cap,
        }
        .into());
    }
    Ok(())
}
