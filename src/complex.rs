//! Complex fixed-point values
//!
//! A [`ComplexSfix`] is a pair of [`Sfix`] parts sharing one format. It
//! converts to a VHDL record with `real` and `imag` fields.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use crate::fixed::{FixedFormat, InvertedBounds, Overflow, Round, Sfix};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexSfix {
    real: Sfix,
    imag: Sfix,
}

impl ComplexSfix {
    pub fn new(real: Sfix, imag: Sfix) -> Self {
        Self { real, imag }
    }

    /// Both parts quantized to `[left:right]`.
    ///
    /// # Panics
    ///
    /// When `left < right`.
    pub fn with_policy(re: f64, im: f64, left: i32, right: i32, overflow: Overflow, round: Round) -> Self {
        Self {
            real: Sfix::with_policy(re, left, right, overflow, round),
            imag: Sfix::with_policy(im, left, right, overflow, round),
        }
    }

    pub fn checked(
        re: f64,
        im: f64,
        left: i32,
        right: i32,
        overflow: Overflow,
        round: Round,
    ) -> Result<Self, InvertedBounds> {
        FixedFormat::checked(left, right)?;
        Ok(Self::with_policy(re, im, left, right, overflow, round))
    }

    pub fn lazy(re: f64, im: f64) -> Self {
        Self::new(Sfix::lazy(re), Sfix::lazy(im))
    }

    pub fn real(&self) -> Sfix {
        self.real
    }

    pub fn imag(&self) -> Sfix {
        self.imag
    }

    /// `real` or `imag` by field name
    pub fn part(&self, name: &str) -> Option<Sfix> {
        match name {
            "real" => Some(self.real),
            "imag" => Some(self.imag),
            _ => None,
        }
    }

    /// Format shared by both parts; `None` while either is lazy or the
    /// bounds disagree.
    pub fn format(&self) -> Option<FixedFormat> {
        let format = self.real.format()?;
        self.real.same_format(&self.imag).then_some(format)
    }

    pub fn same_format(&self, other: &ComplexSfix) -> bool {
        self.real.same_format(&other.real) && self.imag.same_format(&other.imag)
    }

    pub fn expect_wrap(self) -> Self {
        Self::new(self.real.expect_wrap(), self.imag.expect_wrap())
    }

    pub fn resize(&self, left: i32, right: i32, overflow: Overflow, round: Round) -> ComplexSfix {
        Self::new(
            self.real.resize(left, right, overflow, round),
            self.imag.resize(left, right, overflow, round),
        )
    }

    pub fn resize_to(&self, format: &FixedFormat) -> ComplexSfix {
        self.resize(format.left, format.right, format.overflow, format.round)
    }

    pub fn scalb(&self, i: i32) -> ComplexSfix {
        Self::new(self.real.scalb(i), self.imag.scalb(i))
    }

    pub fn conjugate(&self) -> ComplexSfix {
        Self::new(self.real, -self.imag)
    }

    /// Both integer representations packed into one word, real part in
    /// the upper half. `None` when the packed width exceeds 64 bits.
    pub fn fixed_value(&self) -> Option<i64> {
        let format = self.format()?;
        let width = format.width();
        if width == 0 || 2 * width > 64 {
            return None;
        }
        let mask = if width == 64 { -1 } else { (1i64 << width) - 1 };
        let high = self.real.fixed_value().checked_shl(width)?;
        Some(high | (self.imag.fixed_value() & mask))
    }
}

impl Default for ComplexSfix {
    fn default() -> Self {
        Self::lazy(0.0, 0.0)
    }
}

impl fmt::Display for ComplexSfix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.imag.value() < 0.0 { '-' } else { '+' };
        write!(f, "{}{}{}j", self.real.value(), sign, self.imag.value().abs())?;
        match (self.real.left(), self.real.right()) {
            (Some(left), Some(right)) => write!(f, " [{}:{}]", left, right),
            _ => Ok(()),
        }
    }
}

impl Add for ComplexSfix {
    type Output = ComplexSfix;

    fn add(self, rhs: ComplexSfix) -> ComplexSfix {
        Self::new(self.real + rhs.real, self.imag + rhs.imag)
    }
}

impl Sub for ComplexSfix {
    type Output = ComplexSfix;

    fn sub(self, rhs: ComplexSfix) -> ComplexSfix {
        Self::new(self.real - rhs.real, self.imag - rhs.imag)
    }
}

impl Mul for ComplexSfix {
    type Output = ComplexSfix;

    fn mul(self, rhs: ComplexSfix) -> ComplexSfix {
        Self::new(
            self.real * rhs.real - self.imag * rhs.imag,
            self.real * rhs.imag + self.imag * rhs.real,
        )
    }
}

/// Scaling by a real value
impl Mul<Sfix> for ComplexSfix {
    type Output = ComplexSfix;

    fn mul(self, rhs: Sfix) -> ComplexSfix {
        Self::new(self.real * rhs, self.imag * rhs)
    }
}

impl Neg for ComplexSfix {
    type Output = ComplexSfix;

    fn neg(self) -> ComplexSfix {
        Self::new(-self.real, -self.imag)
    }
}
