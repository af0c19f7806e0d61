//! 17.14 fixed-point arithmetic.
//!
//! The kernel has no floating point, so the multi-level feedback queue
//! scheduler keeps `recent_cpu` and `load_avg` as signed fixed-point numbers
//! with 14 fractional bits.

use core::ops::{Add, Div, Mul, Sub};

const F: i64 = 1 << 14;

/// A signed 17.14 fixed-point number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FixedPoint(i32);

impl FixedPoint {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Converts an integer.
    pub const fn from_int(n: i32) -> Self {
        Self((n as i64 * F) as i32)
    }

    /// Reinterprets a raw representation.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw representation.
    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Converts to an integer, rounding toward zero.
    pub const fn trunc(self) -> i32 {
        (self.0 as i64 / F) as i32
    }

    /// Converts to an integer, rounding to nearest.
    pub const fn round(self) -> i32 {
        let x = self.0 as i64;
        if x >= 0 {
            ((x + F / 2) / F) as i32
        } else {
            ((x - F / 2) / F) as i32
        }
    }

    /// Multiplies by `n` and rounds to nearest, without leaving 64 bits.
    pub const fn round_scaled(self, n: i32) -> i32 {
        let x = self.0 as i64 * n as i64;
        let rounded = if x >= 0 { (x + F / 2) / F } else { (x - F / 2) / F };
        saturate(rounded)
    }
}

const fn saturate(x: i64) -> i32 {
    if x > i32::MAX as i64 {
        i32::MAX
    } else if x < i32::MIN as i64 {
        i32::MIN
    } else {
        x as i32
    }
}

impl Add for FixedPoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for FixedPoint {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul for FixedPoint {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self((self.0 as i64 * rhs.0 as i64 / F) as i32)
    }
}

impl Div for FixedPoint {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self((self.0 as i64 * F / rhs.0 as i64) as i32)
    }
}

impl Add<i32> for FixedPoint {
    type Output = Self;
    fn add(self, rhs: i32) -> Self {
        self + Self::from_int(rhs)
    }
}

impl Sub<i32> for FixedPoint {
    type Output = Self;
    fn sub(self, rhs: i32) -> Self {
        self - Self::from_int(rhs)
    }
}

impl Mul<i32> for FixedPoint {
    type Output = Self;
    fn mul(self, rhs: i32) -> Self {
        Self(saturate(self.0 as i64 * rhs as i64))
    }
}

impl Div<i32> for FixedPoint {
    type Output = Self;
    fn div(self, rhs: i32) -> Self {
        Self(self.0 / rhs)
    }
}
