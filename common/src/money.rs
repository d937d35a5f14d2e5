use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MoneyError;

/// Micros per display unit (1 unit = 10^-6 of the display currency).
pub const MICROS_PER_UNIT: i64 = 1_000_000;

// Display strings carry 4 fractional digits, so the last step is 100 micros.
const MICROS_PER_DISPLAY_STEP: i64 = 100;
const MAX_DISPLAY_SCALE: usize = 4;

/// A monetary amount in fixed-point micros.
///
/// All ledger and settlement arithmetic happens on this type; the only place
/// a decimal string exists is the API boundary. Stored in an i64, which
/// covers +/- 9.2 quadrillion display units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: i64) -> Self {
        Money(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    pub fn max(self, other: Money) -> Money {
        Money(self.0.max(other.0))
    }

    /// Parse a decimal string with at most 4 fractional digits.
    ///
    /// Exponents, NaN/Inf, signs and empty parts are rejected; more than 4
    /// fractional digits is a scale error (its own reason code upstream).
    pub fn parse_decimal(input: &str) -> Result<Money, MoneyError> {
        let (whole, frac) = match input.split_once('.') {
            Some((w, f)) => (w, f),
            None => (input, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(MoneyError::InvalidLiteral(input.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(MoneyError::InvalidLiteral(input.to_string()));
        }
        if frac.len() > MAX_DISPLAY_SCALE {
            return Err(MoneyError::ScaleExceeded(input.to_string()));
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| MoneyError::Overflow)?
        };

        let mut frac_micros: i64 = 0;
        if !frac.is_empty() {
            let parsed: i64 = frac.parse().map_err(|_| MoneyError::Overflow)?;
            // Scale the fraction up to micros: "12" means 0.0012 units.
            let scale = 10_i64.pow((6 - frac.len()) as u32);
            frac_micros = parsed * scale;
        }

        whole_units
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|m| m.checked_add(frac_micros))
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Render as a 4-decimal display string, rounding half-up on the last
    /// two micro digits. Lossless for any amount with <= 4 decimals.
    pub fn to_display(self) -> String {
        let negative = self.0 < 0;
        let abs = self.0.unsigned_abs();

        let steps = (abs + (MICROS_PER_DISPLAY_STEP as u64 / 2)) / MICROS_PER_DISPLAY_STEP as u64;
        let whole = steps / 10_000;
        let frac = steps % 10_000;
        if negative {
            format!("-{}.{:04}", whole, frac)
        } else {
            format!("{}.{:04}", whole, frac)
        }
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display())
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse_decimal(s)
    }
}

/// Minimum-fee schedule: a percentage of the reservation, floored to a
/// micro-integer and clamped to [floor, ceiling].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MinimumFeeSchedule {
    /// Rate in basis points (200 = 2%).
    pub rate_bps: u32,
    pub floor: Money,
    pub ceiling: Money,
}

impl MinimumFeeSchedule {
    pub fn fee_for(&self, reserved: Money) -> Money {
        let raw = (reserved.micros() as i128 * self.rate_bps as i128) / 10_000;
        let fee = Money::from_micros(raw as i64);
        fee.max(self.floor).min(self.ceiling)
    }
}
