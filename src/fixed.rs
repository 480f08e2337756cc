//! Signed fixed-point value model
//!
//! An [`Sfix`] with bounds `[left:right]` represents values in
//! `[-2^left, 2^left - 2^right]` with resolution `2^right`. Arithmetic is
//! full precision: results grow their bounds instead of losing bits, and the
//! only lossy operations are construction and [`Sfix::resize`].
//!
//! ```rust
//! use fixed_rtl::fixed::Sfix;
//!
//! let a = Sfix::new(0.5, 0, -17);
//! let sum = a + a;
//! assert_eq!((sum.left(), sum.right()), (Some(1), Some(-17)));
//! assert_eq!(sum.resize_default(0, -17).value(), -1.0); // wrapped
//! ```

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagnostics::{report_overflow, OverflowKind};

/// What to do with values outside the representable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    #[default]
    Wrap,
    Saturate,
}

/// How to drop fractional bits below the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Round {
    #[default]
    Truncate,
    Round,
}

impl Overflow {
    pub fn keyword(&self) -> &'static str {
        match self {
            Overflow::Wrap => "wrap",
            Overflow::Saturate => "saturate",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "wrap" => Some(Overflow::Wrap),
            "saturate" => Some(Overflow::Saturate),
            _ => None,
        }
    }
}

impl Round {
    pub fn keyword(&self) -> &'static str {
        match self {
            Round::Truncate => "truncate",
            Round::Round => "round",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "truncate" => Some(Round::Truncate),
            "round" => Some(Round::Round),
            _ => None,
        }
    }
}

/// Bounds plus policies; the declared type of a fixed-point register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedFormat {
    pub left: i32,
    pub right: i32,
    pub overflow: Overflow,
    pub round: Round,
}

impl FixedFormat {
    pub fn new(left: i32, right: i32) -> Self {
        Self {
            left,
            right,
            overflow: Overflow::default(),
            round: Round::default(),
        }
    }

    pub fn with_policy(left: i32, right: i32, overflow: Overflow, round: Round) -> Self {
        Self {
            left,
            right,
            overflow,
            round,
        }
    }

    /// Bounds with `left >= right`, the only ones describing a value range.
    pub fn checked(left: i32, right: i32) -> Result<Self, InvertedBounds> {
        if left < right {
            return Err(InvertedBounds { left, right });
        }
        Ok(Self::new(left, right))
    }

    /// Total bit count including the sign bit.
    pub fn width(&self) -> u32 {
        (self.left - self.right + 1).max(0) as u32
    }
}

impl fmt::Display for FixedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.left, self.right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("left bound {left} is below right bound {right}")]
pub struct InvertedBounds {
    pub left: i32,
    pub right: i32,
}

thread_local! {
    static FLOAT_MODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Scoped suspension of quantization and overflow handling.
///
/// Nested scopes are reference counted; the mode ends when the outermost
/// guard is dropped.
pub struct FloatMode;

impl FloatMode {
    pub fn enter() -> FloatModeGuard {
        FLOAT_MODE_DEPTH.with(|d| d.set(d.get() + 1));
        FloatModeGuard { _private: () }
    }

    pub fn enabled() -> bool {
        FLOAT_MODE_DEPTH.with(|d| d.get() > 0)
    }
}

#[must_use]
pub struct FloatModeGuard {
    _private: (),
}

impl Drop for FloatModeGuard {
    fn drop(&mut self) {
        FLOAT_MODE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Signed fixed-point number.
#[derive(Debug, Clone, Copy)]
pub struct Sfix {
    value: f64,
    left: Option<i32>,
    right: Option<i32>,
    overflow: Overflow,
    round: Round,
    wrap_ok: bool,
}

impl Sfix {
    /// Quantized value with Wrap + Truncate policies.
    ///
    /// # Panics
    ///
    /// When `left < right`. Use [`Sfix::checked`] for bounds that come from
    /// user input.
    pub fn new(value: f64, left: i32, right: i32) -> Self {
        Self::with_policy(value, left, right, Overflow::Wrap, Round::Truncate)
    }

    /// # Panics
    ///
    /// When `left < right`.
    pub fn with_policy(value: f64, left: i32, right: i32, overflow: Overflow, round: Round) -> Self {
        Self::build(value, Some(left), Some(right), overflow, round, false)
    }

    pub fn checked(
        value: f64,
        left: i32,
        right: i32,
        overflow: Overflow,
        round: Round,
    ) -> Result<Self, InvertedBounds> {
        FixedFormat::checked(left, right)?;
        Ok(Self::with_policy(value, left, right, overflow, round))
    }

    pub fn from_format(value: f64, format: &FixedFormat) -> Self {
        Self::with_policy(value, format.left, format.right, format.overflow, format.round)
    }

    /// Constant whose bounds are inferred at its first arithmetic use.
    pub fn lazy(value: f64) -> Self {
        Self::build(value, None, None, Overflow::Wrap, Round::Truncate, false)
    }

    /// Result of an arithmetic operation: bounds are set, value is exact.
    fn grown(value: f64, left: Option<i32>, right: Option<i32>) -> Self {
        Self {
            value,
            left,
            right,
            overflow: Overflow::Wrap,
            round: Round::Truncate,
            wrap_ok: false,
        }
    }

    fn build(
        value: f64,
        left: Option<i32>,
        right: Option<i32>,
        overflow: Overflow,
        round: Round,
        wrap_ok: bool,
    ) -> Self {
        let mut fix = Self {
            value,
            left,
            right,
            overflow,
            round,
            wrap_ok,
        };

        if let (Some(left), Some(right)) = (left, right) {
            assert!(left >= right, "{}", InvertedBounds { left, right });
            if !FloatMode::enabled() {
                fix.fit(left, right);
            }
        }
        fix
    }

    fn fit(&mut self, left: i32, right: i32) {
        match self.overflow {
            Overflow::Saturate => {
                if self.overflows(left, right) {
                    self.saturate(left, right);
                } else {
                    self.quantize(right);
                }
            }
            Overflow::Wrap => {
                self.quantize(right);
                if self.overflows(left, right) {
                    self.wrap(left);
                }
            }
        }
    }

    fn quantize(&mut self, right: i32) {
        let step = pow2(right);
        let scaled = self.value / step;
        let scaled = match self.round {
            Round::Truncate => scaled.floor(),
            Round::Round => scaled.round(),
        };
        self.value = scaled * step;
    }

    fn overflows(&self, left: i32, right: i32) -> bool {
        self.value < -pow2(left) || self.value > pow2(left) - pow2(right)
    }

    fn saturate(&mut self, left: i32, right: i32) {
        let old = self.value;
        let max = pow2(left) - pow2(right);
        let min = -pow2(left);
        self.value = if old > max { max } else { min };
        report_overflow(OverflowKind::Saturate, old, self.value, false);
    }

    fn wrap(&mut self, left: i32) {
        let old = self.value;
        let min = -pow2(left);
        let span = pow2(left + 1);
        self.value = (old - min).rem_euclid(span) + min;
        report_overflow(OverflowKind::Wrap, old, self.value, self.wrap_ok);
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn left(&self) -> Option<i32> {
        self.left
    }

    pub fn right(&self) -> Option<i32> {
        self.right
    }

    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn is_lazy(&self) -> bool {
        self.left.is_none() || self.right.is_none()
    }

    /// Declared format, when both bounds are known.
    pub fn format(&self) -> Option<FixedFormat> {
        match (self.left, self.right) {
            (Some(left), Some(right)) => Some(FixedFormat::with_policy(
                left,
                right,
                self.overflow,
                self.round,
            )),
            _ => None,
        }
    }

    /// Identical bounds; policies and value are ignored.
    pub fn same_format(&self, other: &Sfix) -> bool {
        self.left == other.left && self.right == other.right
    }

    /// Mark wraps caused by this value's shifts and resizes as expected.
    pub fn expect_wrap(mut self) -> Self {
        self.wrap_ok = true;
        self
    }

    pub fn wrap_ok(&self) -> bool {
        self.wrap_ok
    }

    pub fn min_representable(&self) -> Option<f64> {
        self.left.map(|l| -pow2(l))
    }

    pub fn max_representable(&self) -> Option<f64> {
        match (self.left, self.right) {
            (Some(l), Some(r)) => Some(pow2(l) - pow2(r)),
            _ => None,
        }
    }

    /// Integer representation, `value / 2^right`.
    pub fn fixed_value(&self) -> i64 {
        match self.right {
            Some(right) => (self.value / pow2(right)).round() as i64,
            None => self.value.floor() as i64,
        }
    }

    /// Force into another format. The only lossy operation besides construction.
    pub fn resize(&self, left: i32, right: i32, overflow: Overflow, round: Round) -> Sfix {
        Self::build(self.value, Some(left), Some(right), overflow, round, self.wrap_ok)
    }

    /// Resize with Wrap + Truncate.
    pub fn resize_default(&self, left: i32, right: i32) -> Sfix {
        self.resize(left, right, Overflow::Wrap, Round::Truncate)
    }

    pub fn resize_to(&self, format: &FixedFormat) -> Sfix {
        self.resize(format.left, format.right, format.overflow, format.round)
    }

    /// Multiply by `2^i` by moving the format; no precision is lost.
    pub fn scalb(&self, i: i32) -> Sfix {
        let value = self.value * pow2(i);
        match (self.left, self.right) {
            (Some(l), Some(r)) => {
                Self::with_policy(value, l + i, r + i, Overflow::Saturate, Round::Round)
            }
            _ => Self::lazy(value),
        }
    }

    /// Arithmetic shift left at fixed format. May wrap.
    pub fn shl(&self, n: u32) -> Sfix {
        self.shift(n as i32)
    }

    /// Arithmetic shift right at fixed format.
    pub fn shr(&self, n: u32) -> Sfix {
        self.shift(-(n as i32))
    }

    fn shift(&self, n: i32) -> Sfix {
        let value = match self.right {
            Some(right) if !FloatMode::enabled() => {
                let step = pow2(right);
                let repr = (self.value / step).trunc() as i64;
                let shifted = if n >= 0 {
                    repr as f64 * pow2(n)
                } else {
                    (repr >> (-n).min(63)) as f64
                };
                shifted * step
            }
            _ => self.value * pow2(n),
        };
        Self::build(
            value,
            self.left,
            self.right,
            Overflow::Wrap,
            Round::Truncate,
            self.wrap_ok,
        )
    }

    pub fn abs(&self) -> Sfix {
        Self::grown(self.value.abs(), self.left.map(|l| l + 1), self.right)
    }

    /// A plain numeric literal at this value's bounds.
    fn literal(&self, value: f64) -> Sfix {
        match (self.left, self.right) {
            (Some(l), Some(r)) => Self::with_policy(value, l, r, Overflow::Saturate, Round::Round),
            _ => Self::lazy(value),
        }
    }

    fn add_bounds(&self, other: &Sfix) -> (Option<i32>, Option<i32>) {
        let left = match (self.left, other.left) {
            (Some(a), Some(b)) => Some(a.max(b) + 1),
            (Some(a), None) | (None, Some(a)) => Some(a + 1),
            (None, None) => None,
        };
        let right = match (self.right, other.right) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        (left, right)
    }

    fn mul_bounds(&self, other: &Sfix) -> (Option<i32>, Option<i32>) {
        let left = match (self.left, other.left) {
            (Some(a), Some(b)) => Some(a + b + 1),
            (Some(a), None) | (None, Some(a)) => Some(a + 1),
            (None, None) => None,
        };
        let right = match (self.right, other.right) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        (left, right)
    }
}

/// Free-function form of [`Sfix::resize`].
pub fn resize(fix: &Sfix, left: i32, right: i32, overflow: Overflow, round: Round) -> Sfix {
    fix.resize(left, right, overflow, round)
}

fn pow2(exp: i32) -> f64 {
    2f64.powi(exp)
}

impl Default for Sfix {
    /// `[0:-17]`, saturating and rounding.
    fn default() -> Self {
        Sfix::with_policy(0.0, 0, -17, Overflow::Saturate, Round::Round)
    }
}

impl PartialEq for Sfix {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialOrd for Sfix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl fmt::Display for Sfix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<i32>| b.map_or_else(|| "?".to_string(), |b| b.to_string());
        write!(f, "{} [{}:{}]", self.value, bound(self.left), bound(self.right))
    }
}

impl Add for Sfix {
    type Output = Sfix;

    fn add(self, rhs: Sfix) -> Sfix {
        let (left, right) = self.add_bounds(&rhs);
        Sfix::grown(self.value + rhs.value, left, right)
    }
}

impl Sub for Sfix {
    type Output = Sfix;

    fn sub(self, rhs: Sfix) -> Sfix {
        let (left, right) = self.add_bounds(&rhs);
        Sfix::grown(self.value - rhs.value, left, right)
    }
}

impl Mul for Sfix {
    type Output = Sfix;

    fn mul(self, rhs: Sfix) -> Sfix {
        let (left, right) = self.mul_bounds(&rhs);
        Sfix::grown(self.value * rhs.value, left, right)
    }
}

impl Neg for Sfix {
    type Output = Sfix;

    fn neg(self) -> Sfix {
        Sfix::grown(-self.value, self.left.map(|l| l + 1), self.right)
    }
}

impl Add<f64> for Sfix {
    type Output = Sfix;

    fn add(self, rhs: f64) -> Sfix {
        let rhs = self.literal(rhs);
        self + rhs
    }
}

impl Sub<f64> for Sfix {
    type Output = Sfix;

    fn sub(self, rhs: f64) -> Sfix {
        let rhs = self.literal(rhs);
        self - rhs
    }
}

impl Mul<f64> for Sfix {
    type Output = Sfix;

    fn mul(self, rhs: f64) -> Sfix {
        let rhs = self.literal(rhs);
        self * rhs
    }
}

impl Add<Sfix> for f64 {
    type Output = Sfix;

    fn add(self, rhs: Sfix) -> Sfix {
        rhs.literal(self) + rhs
    }
}

impl Sub<Sfix> for f64 {
    type Output = Sfix;

    fn sub(self, rhs: Sfix) -> Sfix {
        rhs.literal(self) - rhs
    }
}

impl Mul<Sfix> for f64 {
    type Output = Sfix;

    fn mul(self, rhs: Sfix) -> Sfix {
        rhs.literal(self) * rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::take_diagnostics;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_quantize_truncate_and_round() {
        assert_eq!(Sfix::new(0.123, 0, -7).value(), 15.0 / 128.0);
        let rounded = Sfix::with_policy(0.123, 0, -7, Overflow::Wrap, Round::Round);
        assert_eq!(rounded.value(), 16.0 / 128.0);
        // floor, not truncation toward zero
        assert_eq!(Sfix::new(-0.123, 0, -7).value(), -16.0 / 128.0);
    }

    #[test]
    fn test_wrap_on_construction() {
        take_diagnostics();
        let a = Sfix::new(1.25, 0, -17);
        assert_eq!(a.value(), -0.75);
        let found = take_diagnostics();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_unexpected_wrap());
    }

    #[test]
    fn test_saturate_on_construction() {
        let a = Sfix::with_policy(1.25, 0, -17, Overflow::Saturate, Round::Truncate);
        assert_eq!(a.value(), 1.0 - 2f64.powi(-17));
        let b = Sfix::with_policy(-3.0, 0, -17, Overflow::Saturate, Round::Truncate);
        assert_eq!(b.value(), -1.0);
    }

    #[test]
    fn test_bit_growth() {
        let a = Sfix::new(0.123, 0, -17);
        let sum = a + a;
        assert_eq!((sum.left(), sum.right()), (Some(1), Some(-17)));
        assert_eq!(sum.value(), a.value() * 2.0);

        let triple = a + a + a;
        assert_eq!((triple.left(), triple.right()), (Some(2), Some(-17)));

        let product = a * a;
        assert_eq!((product.left(), product.right()), (Some(1), Some(-34)));
        assert_eq!(product.value(), a.value() * a.value());

        let neg = -a;
        assert_eq!((neg.left(), neg.right()), (Some(1), Some(-17)));
    }

    #[test]
    fn test_mixed_bounds_add() {
        let a = Sfix::new(0.5, 2, -4);
        let b = Sfix::new(0.25, 0, -10);
        let sum = a - b;
        assert_eq!((sum.left(), sum.right()), (Some(3), Some(-10)));
        assert_eq!(sum.value(), 0.25);
    }

    #[test]
    fn test_literal_operand_takes_other_bounds() {
        let a = Sfix::new(0.5, 0, -3);
        // 0.3 becomes 0.25 at [0:-3] after rounding
        let sum = a + 0.3;
        assert_eq!(sum.value(), 0.75);
        assert_eq!(sum.left(), Some(1));
        let flipped = 0.3 + a;
        assert_eq!(flipped.value(), 0.75);
    }

    #[test]
    fn test_lazy_bounds() {
        let c = Sfix::lazy(0.1);
        assert!(c.is_lazy());
        assert_eq!(c.value(), 0.1);

        let a = Sfix::new(0.5, 0, -8);
        let sum = a + c;
        assert_eq!((sum.left(), sum.right()), (Some(1), Some(-8)));
        let product = c * a;
        assert_eq!((product.left(), product.right()), (Some(1), Some(-8)));
    }

    #[test]
    fn test_resize() {
        let a = Sfix::new(0.89, 0, -17);
        assert_eq!(a.resize_default(0, -6).value(), 0.875);
        let rounded = a.resize(0, -6, Overflow::Wrap, Round::Round);
        assert_eq!(rounded.value(), 0.890625);
        assert_eq!(resize(&a, 0, -6, Overflow::Wrap, Round::Round), rounded);
    }

    #[test]
    fn test_scalb() {
        let a = Sfix::new(0.5, 0, -17);
        let up = a.scalb(8);
        assert_eq!(up.value(), 128.0);
        assert_eq!((up.left(), up.right()), (Some(8), Some(-9)));
        let down = a.scalb(-8);
        assert_eq!(down.value(), 0.001953125);
        assert_eq!((down.left(), down.right()), (Some(-8), Some(-25)));
    }

    #[test]
    fn test_shifts() {
        let a = Sfix::new(0.25, 0, -4);
        assert_eq!(a.shl(1).value(), 0.5);
        assert_eq!(a.shr(2).value(), 0.0625);
        assert_eq!(Sfix::new(-0.25, 0, -4).shr(4).value(), -0.0625);

        take_diagnostics();
        let wrapped = Sfix::new(0.5, 0, -4).expect_wrap().shl(1);
        assert_eq!(wrapped.value(), -1.0);
        let found = take_diagnostics();
        assert_eq!(found.len(), 1);
        assert!(found[0].expected);
    }

    #[test]
    fn test_comparison_ignores_format() {
        let a = Sfix::new(0.5, 0, -4);
        let b = Sfix::new(0.5, 3, -20);
        assert_eq!(a, b);
        assert!(!a.same_format(&b));
        assert!(Sfix::new(0.25, 0, -4) < b);
    }

    #[test]
    fn test_float_mode_is_scoped() {
        {
            let _outer = FloatMode::enter();
            {
                let _inner = FloatMode::enter();
                assert_eq!(Sfix::new(0.123123, 0, -7).value(), 0.123123);
            }
            assert!(FloatMode::enabled());
            assert_eq!(Sfix::new(5.0, 0, -7).value(), 5.0);
        }
        assert!(!FloatMode::enabled());
        assert_eq!(Sfix::new(0.123123, 0, -7).value(), 15.0 / 128.0);
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        assert_eq!(
            Sfix::checked(0.5, -5, 0, Overflow::Wrap, Round::Truncate),
            Err(InvertedBounds { left: -5, right: 0 })
        );
        assert_eq!(
            FixedFormat::checked(-5, 0).unwrap_err().to_string(),
            "left bound -5 is below right bound 0"
        );
        let single = Sfix::checked(1.0, 0, 0, Overflow::Saturate, Round::Truncate).unwrap();
        assert_eq!(single.value(), 0.0);
    }

    #[test]
    #[should_panic(expected = "left bound -5 is below right bound 0")]
    fn test_inverted_bounds_panic_in_release_too() {
        let _ = Sfix::new(0.5, -5, 0);
    }

    #[test]
    fn test_fixed_value_and_range() {
        let a = Sfix::new(-0.5, 1, -7);
        assert_eq!(a.fixed_value(), -64);
        assert_eq!(a.min_representable(), Some(-2.0));
        assert_eq!(a.max_representable(), Some(2.0 - 1.0 / 128.0));
    }

    fn format_strategy() -> impl Strategy<Value = (i32, i32)> {
        (0i32..6, -16i32..-1)
    }

    proptest! {
        #[test]
        fn prop_double_equals_scalb(v in -40.0f64..40.0, (l, r) in format_strategy()) {
            let a = Sfix::with_policy(v, l, r, Overflow::Saturate, Round::Truncate);
            let via_add = (a + a).resize_default(l, r);
            let via_scalb = a.scalb(1).resize_default(l, r);
            prop_assert!((via_add.value() - via_scalb.value()).abs() <= 2f64.powi(r));
        }

        #[test]
        fn prop_construction_is_deterministic(v in -100.0f64..100.0, (l, r) in format_strategy()) {
            let a = Sfix::with_policy(v, l, r, Overflow::Wrap, Round::Round);
            let b = Sfix::with_policy(v, l, r, Overflow::Wrap, Round::Round);
            prop_assert_eq!(a, b);
            prop_assert!(a.same_format(&b));
        }

        #[test]
        fn prop_wrap_stays_in_range(v in -1000.0f64..1000.0, (l, r) in format_strategy()) {
            let x = Sfix::lazy(v).resize(l, r, Overflow::Wrap, Round::Truncate);
            let min = -2f64.powi(l);
            let max = 2f64.powi(l) - 2f64.powi(r);
            prop_assert!(x.value() >= min && x.value() <= max);
        }

        #[test]
        fn prop_saturate_hits_boundary(v in 64.0f64..1000.0, negative in any::<bool>(), (l, r) in format_strategy()) {
            let v = if negative { -v } else { v };
            let x = Sfix::lazy(v).resize(l, r, Overflow::Saturate, Round::Round);
            let min = -2f64.powi(l);
            let max = 2f64.powi(l) - 2f64.powi(r);
            prop_assert!(x.value() == min || x.value() == max);
        }
    }
}
