use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;
use paste::paste;

/// `Decimal` represents a 128 bit fixed-scale decimal number.
///
/// The finite set of values are of the form `m / 10^8`, where `m` is an
/// integer such that `i128::MIN <= m <= i128::MAX`.
///
/// Every operation is checked: anything that would leave the representable
/// range returns `None` instead of wrapping or rounding, so results are
/// bit-exact on every platform.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Decimal(pub i128);

impl Default for Decimal {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Decimal {
    /// The min value of `Decimal`.
    pub const MIN: Self = Self(i128::MIN);

    /// The max value of `Decimal`.
    pub const MAX: Self = Self(i128::MAX);

    /// The fixed scale used by `Decimal`.
    pub const SCALE: u32 = 8;

    /// The mantissa of `1`.
    pub const ONE_UNITS: i128 = 100_000_000;

    pub const ZERO: Self = Self(0);

    pub const ONE: Self = Self(Self::ONE_UNITS);

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn one() -> Self {
        Self::ONE
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Whether this decimal has no fractional part.
    pub fn is_integer(&self) -> bool {
        self.0 % Self::ONE_UNITS == 0
    }

    /// Raw mantissa, i.e. the value multiplied by `10^SCALE`.
    pub fn mantissa(&self) -> i128 {
        self.0
    }

    pub fn from_mantissa(mantissa: i128) -> Self {
        Self(mantissa)
    }

    pub fn checked_abs(&self) -> Option<Self> {
        self.0.checked_abs().map(Self)
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul(&self, other: Self) -> Option<Self> {
        self.0
            .checked_mul(other.0)
            .and_then(|m| m.checked_div(Self::ONE_UNITS))
            .map(Self)
    }

    /// Exact division. Returns `None` on a zero divisor or overflow.
    pub fn checked_div(&self, other: Self) -> Option<Self> {
        if other.0 == 0 {
            return None;
        }
        self.0
            .checked_mul(Self::ONE_UNITS)
            .and_then(|m| m.checked_div(other.0))
            .map(Self)
    }

    /// Floor division: the largest integer not greater than the true
    /// quotient, as an integer-valued decimal.
    pub fn checked_floor_div(&self, other: Self) -> Option<Self> {
        if other.0 == 0 {
            return None;
        }
        let q = self.0.checked_div(other.0)?;
        let q = if (self.0 % other.0 != 0) && ((self.0 < 0) != (other.0 < 0)) {
            q.checked_sub(1)?
        } else {
            q
        };
        q.checked_mul(Self::ONE_UNITS).map(Self)
    }

    /// Floored remainder; the result takes the sign of the divisor.
    pub fn checked_rem(&self, other: Self) -> Option<Self> {
        if other.0 == 0 {
            return None;
        }
        let r = self.0.checked_rem(other.0)?;
        let r = if r != 0 && ((r < 0) != (other.0 < 0)) {
            r.checked_add(other.0)?
        } else {
            r
        };
        Some(Self(r))
    }

    pub fn checked_neg(&self) -> Option<Self> {
        self.0.checked_neg().map(Self)
    }

    /// Power with a non-negative integer exponent, by squaring.
    pub fn checked_powi(&self, exp: u32) -> Option<Self> {
        let mut result = Self::ONE;
        let mut base = *self;
        let mut exp = exp;
        while exp > 0 {
            if exp & 1 == 1 {
                result = result.checked_mul(base)?;
            }
            exp >>= 1;
            if exp > 0 {
                base = base.checked_mul(base)?;
            }
        }
        Some(result)
    }

    /// The largest integer-valued decimal not greater than this one.
    pub fn checked_floor(&self) -> Option<Self> {
        let q = self.0.div_euclid(Self::ONE_UNITS);
        q.checked_mul(Self::ONE_UNITS).map(Self)
    }

    pub fn from_i64(i: i64) -> Self {
        // i64 * 10^8 always fits in i128
        Self(i as i128 * Self::ONE_UNITS)
    }

    /// Lossless conversion back to an integer, when representable.
    pub fn to_i64(&self) -> Option<i64> {
        if self.0 % Self::ONE_UNITS != 0 {
            return None;
        }
        i64::try_from(self.0 / Self::ONE_UNITS).ok()
    }

    /// Comparison against an `i64` without loss of precision.
    pub fn cmp_i64(&self, i: i64) -> Ordering {
        self.0.cmp(&(i as i128 * Self::ONE_UNITS))
    }
}

macro_rules! from_int {
    ($type:ident) => {
        paste! {
            impl From<$type> for Decimal {
                fn from(val: $type) -> Self {
                    Self(val as i128 * Self::ONE_UNITS)
                }
            }
        }
    };
}
from_int!(u8);
from_int!(u16);
from_int!(u32);
from_int!(i8);
from_int!(i16);
from_int!(i32);
from_int!(i64);

/// Represents an error when parsing a `Decimal` from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDecimalError {
    Empty,
    InvalidDigit,
    MoreThanEightDecimalPlaces,
    Overflow,
}

impl fmt::Display for ParseDecimalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            return Err(ParseDecimalError::Empty);
        }
        let (negative, rest) = match bytes[0] {
            b'-' => (true, &bytes[1..]),
            b'+' => (false, &bytes[1..]),
            _ => (false, bytes),
        };
        if rest.is_empty() {
            return Err(ParseDecimalError::Empty);
        }
        let mut parts = rest.splitn(2, |b| *b == b'.');
        let int_part = parts.next().unwrap();
        let frac_part = parts.next();
        if int_part.is_empty() {
            return Err(ParseDecimalError::InvalidDigit);
        }

        let mut mantissa: i128 = 0;
        for b in int_part {
            if !b.is_ascii_digit() {
                return Err(ParseDecimalError::InvalidDigit);
            }
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add((b - b'0') as i128))
                .ok_or(ParseDecimalError::Overflow)?;
        }
        mantissa = mantissa
            .checked_mul(Self::ONE_UNITS)
            .ok_or(ParseDecimalError::Overflow)?;

        if let Some(frac) = frac_part {
            if frac.is_empty() || frac.len() > Self::SCALE as usize {
                return Err(ParseDecimalError::MoreThanEightDecimalPlaces);
            }
            let mut frac_units: i128 = 0;
            for b in frac {
                if !b.is_ascii_digit() {
                    return Err(ParseDecimalError::InvalidDigit);
                }
                frac_units = frac_units * 10 + (b - b'0') as i128;
            }
            frac_units *= 10i128.pow(Self::SCALE - frac.len() as u32);
            mantissa = mantissa
                .checked_add(frac_units)
                .ok_or(ParseDecimalError::Overflow)?;
        }

        if negative {
            mantissa = mantissa.checked_neg().ok_or(ParseDecimalError::Overflow)?;
        }
        Ok(Self(mantissa))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Canonical form: no exponent, no trailing fractional zeros.
        let int = self.0 / Self::ONE_UNITS;
        let frac = (self.0 % Self::ONE_UNITS).unsigned_abs();
        if frac == 0 {
            return write!(f, "{}", int);
        }
        let sign = if self.0 < 0 && int == 0 { "-" } else { "" };
        let mut frac_str = format!("{:08}", frac);
        while frac_str.ends_with('0') {
            frac_str.pop();
        }
        write!(f, "{}{}.{}", sign, int, frac_str)
    }
}

impl fmt::Debug for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
