use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing an [`Amount`] or a [`Percentage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("'{0}' is not a decimal number")]
    Malformed(String),
    #[error("'{0}' has more than 2 decimal places")]
    TooPrecise(String),
    #[error("'{0}' is out of range")]
    OutOfRange(String),
}

/// Parse a decimal string into an integer scaled by 100, without going through floats.
fn parse_hundredths(input: &str) -> Result<i64, AmountError> {
    let s = input.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Malformed(input.to_string()));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Malformed(input.to_string()));
    }
    if frac.len() > 2 {
        return Err(AmountError::TooPrecise(input.to_string()));
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| AmountError::OutOfRange(input.to_string()))?
    };
    let frac: i64 = format!("{frac:0<2}")
        .parse()
        .map_err(|_| AmountError::Malformed(input.to_string()))?;

    let value = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(|| AmountError::OutOfRange(input.to_string()))?;
    Ok(if negative { -value } else { value })
}

/// Fixed-point decimal with 2 decimal places, stored as a count of minor units.
///
/// Used for both currency (bill amounts) and coins, so the two never drift
/// apart through float conversions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 100;

    pub const ZERO: Amount = Amount(0);

    pub fn from_minor(value: i64) -> Self {
        Amount(value)
    }

    /// `value` whole units, saturating at the representable range.
    pub fn whole(value: i64) -> Self {
        Amount(value.saturating_mul(Self::SCALE))
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `None` for the one value whose magnitude does not fit.
    pub fn checked_abs(self) -> Option<Self> {
        self.0.checked_abs().map(Amount)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// `self * pct / 100`, rounded half away from zero to the nearest minor unit.
    ///
    /// This is the only place coins are derived from currency.
    pub fn percent(self, pct: Percentage) -> Self {
        let product = i128::from(self.0) * i128::from(pct.bps());
        let denom = i128::from(Percentage::FULL);
        let quotient = product / denom;
        let remainder = product % denom;
        let rounded = if remainder.abs() * 2 >= denom {
            quotient + product.signum()
        } else {
            quotient
        };
        // |pct| <= 100% so the result never exceeds |self|
        Amount(rounded as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE.unsigned_abs();
        let whole = abs / scale;
        let frac = abs % scale;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hundredths(s).map(Amount)
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.to_string()
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

/// A percentage in `[0, 100]`, stored in basis points (1% = 100 bps).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Percentage(u32);

impl Percentage {
    const FULL: u32 = 10_000;

    pub const ZERO: Percentage = Percentage(0);
    pub const HUNDRED: Percentage = Percentage(Self::FULL);

    pub fn from_bps(bps: u32) -> Result<Self, AmountError> {
        if bps > Self::FULL {
            return Err(AmountError::OutOfRange(format!("{bps} bps")));
        }
        Ok(Percentage(bps))
    }

    pub fn from_whole(pct: u32) -> Result<Self, AmountError> {
        Self::from_bps(pct.saturating_mul(100))
    }

    pub fn bps(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 100;
        match self.0 % 100 {
            0 => write!(f, "{whole}"),
            frac => write!(f, "{whole}.{frac:02}"),
        }
    }
}

impl FromStr for Percentage {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hundredths = parse_hundredths(s)?;
        u32::try_from(hundredths)
            .map_err(|_| AmountError::OutOfRange(s.to_string()))
            .and_then(Percentage::from_bps)
    }
}

impl TryFrom<String> for Percentage {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Percentage> for String {
    fn from(value: Percentage) -> Self {
        value.to_string()
    }
}
