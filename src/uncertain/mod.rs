/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// uncertain module
//
// a value with uncertainty is a mean plus first order coefficients against
// independent unit variance primary sources ("roots")
//
//      x = mean + sum_r c_r * z_r       z_r ~ N(0, 1), independent
//
// variance(x) = sum_r c_r^2 and covariance(x, y) = sum_r c_r(x) * c_r(y)
// so values that share roots keep their correlation through any chain of
// arithmetic, and a - a cancels exactly
//
////////////////////////////////////////////////////////////////////////////////////

mod numeric;

pub use numeric::Numeric;

use nalgebra::DMatrix;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::error::{Error, Result};

static NEXT_ROOT: AtomicU64 = AtomicU64::new(0);

// Identifier of an independent primary source of uncertainty
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootId(u64);

impl RootId {
    fn fresh() -> RootId {
        RootId(NEXT_ROOT.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// A scalar with first order (linearized) error propagation.
///
/// Values are immutable; every operation returns a new value. Coefficients are
/// kept sorted by root so that combining two values is a linear merge and sums
/// are always accumulated in the same order.
///
/// Division by a value whose distribution has real mass near zero is outside
/// what a first order expansion can describe. Nothing checks for it: a zero
/// mean denominator yields IEEE inf/NaN and the caller decides what to do.
#[derive(Debug, Clone, PartialEq)]
pub struct UncertainValue {
    mean: f64,
    coefficients: Vec<(RootId, f64)>,
}

impl UncertainValue {
    // A new value independent of every other existing value
    pub fn new(mean: f64, sdev: f64) -> UncertainValue {
        let sdev = sdev.abs();
        let coefficients = if sdev == 0.0 {
            Vec::new()
        } else {
            vec![(RootId::fresh(), sdev)]
        };
        UncertainValue { mean, coefficients }
    }

    pub fn constant(mean: f64) -> UncertainValue {
        UncertainValue {
            mean,
            coefficients: Vec::new(),
        }
    }

    /// Jointly normal values with the given means and covariance.
    ///
    /// The covariance is factored as L L^T and each value is expressed on a
    /// fresh set of roots through the rows of L.
    pub fn correlated(means: &[f64], covariance: &DMatrix<f64>) -> Result<Vec<UncertainValue>> {
        let n = means.len();
        if covariance.nrows() != n {
            return Err(Error::shape("covariance rows", n, covariance.nrows()));
        }
        if covariance.ncols() != n {
            return Err(Error::shape("covariance columns", n, covariance.ncols()));
        }
        let cholesky = covariance.clone().cholesky().ok_or_else(|| {
            Error::NotPositiveDefinite(format!("{}x{} parameter covariance", n, n))
        })?;
        let l = cholesky.l();
        let roots: Vec<RootId> = (0..n).map(|_| RootId::fresh()).collect();

        Ok(means
            .iter()
            .enumerate()
            .map(|(i, &mean)| UncertainValue {
                mean,
                coefficients: (0..=i)
                    .map(|j| (roots[j], l[(i, j)]))
                    .filter(|&(_, c)| c != 0.0)
                    .collect(),
            })
            .collect())
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.coefficients.iter().map(|&(_, c)| c * c).sum()
    }

    pub fn sdev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn is_constant(&self) -> bool {
        self.coefficients.is_empty()
    }

    // Roots this value depends on, in ascending order
    pub fn roots(&self) -> impl Iterator<Item = RootId> + '_ {
        self.coefficients.iter().map(|&(r, _)| r)
    }

    // First order coefficient against one root (zero when independent of it)
    pub fn coefficient(&self, root: RootId) -> f64 {
        match self.coefficients.binary_search_by(|&(r, _)| r.cmp(&root)) {
            Ok(index) => self.coefficients[index].1,
            Err(_) => 0.0,
        }
    }

    /// Exact first order derivative d(self)/d(primary).
    ///
    /// `primary` must be a value created by `new` (a single root); anything else
    /// has no well defined partial derivative and gives `None`.
    pub fn derivative(&self, primary: &UncertainValue) -> Option<f64> {
        match primary.coefficients.as_slice() {
            [(root, c)] => Some(self.coefficient(*root) / c),
            _ => None,
        }
    }

    pub fn exp(&self) -> UncertainValue {
        let value = self.mean.exp();
        self.chain(value, value)
    }

    pub fn ln(&self) -> UncertainValue {
        self.chain(self.mean.ln(), 1.0 / self.mean)
    }

    pub fn sqrt(&self) -> UncertainValue {
        let value = self.mean.sqrt();
        self.chain(value, 0.5 / value)
    }

    pub fn powf(&self, exponent: f64) -> UncertainValue {
        self.chain(
            self.mean.powf(exponent),
            exponent * self.mean.powf(exponent - 1.0),
        )
    }

    pub fn powi(&self, exponent: i32) -> UncertainValue {
        self.chain(
            self.mean.powi(exponent),
            exponent as f64 * self.mean.powi(exponent - 1),
        )
    }

    // self^exponent with both base and exponent uncertain
    pub fn pow(&self, exponent: &UncertainValue) -> UncertainValue {
        let value = self.mean.powf(exponent.mean);
        let d_base = exponent.mean * self.mean.powf(exponent.mean - 1.0);
        let d_exponent = value * self.mean.ln();
        UncertainValue {
            mean: value,
            coefficients: combine(
                &self.coefficients,
                d_base,
                &exponent.coefficients,
                d_exponent,
            ),
        }
    }

    pub fn logistic(&self) -> UncertainValue {
        let s = 1.0 / (1.0 + (-self.mean).exp());
        self.chain(s, s * (1.0 - s))
    }

    // Piecewise linear clamp: identity inside [lo, hi], constant outside
    pub fn clamp(&self, lo: f64, hi: f64) -> UncertainValue {
        if self.mean < lo {
            UncertainValue::constant(lo)
        } else if self.mean > hi {
            UncertainValue::constant(hi)
        } else {
            self.clone()
        }
    }

    // f(x) with f(mean) = value and f'(mean) = derivative
    fn chain(&self, value: f64, derivative: f64) -> UncertainValue {
        UncertainValue {
            mean: value,
            coefficients: scale(&self.coefficients, derivative),
        }
    }
}

pub fn covariance(a: &UncertainValue, b: &UncertainValue) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    while i < a.coefficients.len() && j < b.coefficients.len() {
        let (ra, ca) = a.coefficients[i];
        let (rb, cb) = b.coefficients[j];
        match ra.cmp(&rb) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                total += ca * cb;
                i += 1;
                j += 1;
            }
        }
    }
    total
}

// Pearson correlation; NaN when either side is a constant
pub fn correlation(a: &UncertainValue, b: &UncertainValue) -> f64 {
    covariance(a, b) / (a.sdev() * b.sdev())
}

pub fn covariance_matrix(values: &[UncertainValue]) -> DMatrix<f64> {
    let n = values.len();
    let mut matrix = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..=i {
            let c = covariance(&values[i], &values[j]);
            matrix[(i, j)] = c;
            matrix[(j, i)] = c;
        }
    }
    matrix
}

fn scale(coefficients: &[(RootId, f64)], factor: f64) -> Vec<(RootId, f64)> {
    if factor == 0.0 {
        return Vec::new();
    }
    coefficients
        .iter()
        .map(|&(r, c)| (r, c * factor))
        .collect()
}

// wa * a + wb * b over the union of roots; shared roots collapse into one term
fn combine(
    a: &[(RootId, f64)],
    wa: f64,
    b: &[(RootId, f64)],
    wb: f64,
) -> Vec<(RootId, f64)> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut push = |root: RootId, c: f64| {
        if c != 0.0 {
            out.push((root, c));
        }
    };
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (ra, ca) = a[i];
        let (rb, cb) = b[j];
        match ra.cmp(&rb) {
            Ordering::Less => {
                push(ra, wa * ca);
                i += 1;
            }
            Ordering::Greater => {
                push(rb, wb * cb);
                j += 1;
            }
            Ordering::Equal => {
                push(ra, wa * ca + wb * cb);
                i += 1;
                j += 1;
            }
        }
    }
    for &(r, c) in &a[i..] {
        push(r, wa * c);
    }
    for &(r, c) in &b[j..] {
        push(r, wb * c);
    }
    out
}

fn add_values(a: &UncertainValue, b: &UncertainValue) -> UncertainValue {
    UncertainValue {
        mean: a.mean + b.mean,
        coefficients: combine(&a.coefficients, 1.0, &b.coefficients, 1.0),
    }
}

fn sub_values(a: &UncertainValue, b: &UncertainValue) -> UncertainValue {
    UncertainValue {
        mean: a.mean - b.mean,
        coefficients: combine(&a.coefficients, 1.0, &b.coefficients, -1.0),
    }
}

fn mul_values(a: &UncertainValue, b: &UncertainValue) -> UncertainValue {
    UncertainValue {
        mean: a.mean * b.mean,
        coefficients: combine(&a.coefficients, b.mean, &b.coefficients, a.mean),
    }
}

fn div_values(a: &UncertainValue, b: &UncertainValue) -> UncertainValue {
    let inverse = 1.0 / b.mean;
    UncertainValue {
        mean: a.mean * inverse,
        coefficients: combine(
            &a.coefficients,
            inverse,
            &b.coefficients,
            -a.mean * inverse * inverse,
        ),
    }
}

// scalars are promoted to constants, so every operator shares one code path
macro_rules! impl_binary_op {
    ($Trait:ident, $method:ident, $func:ident) => {
        impl $Trait for UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: UncertainValue) -> UncertainValue {
                $func(&self, &rhs)
            }
        }

        impl<'a, 'b> $Trait<&'b UncertainValue> for &'a UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: &'b UncertainValue) -> UncertainValue {
                $func(self, rhs)
            }
        }

        impl<'b> $Trait<&'b UncertainValue> for UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: &'b UncertainValue) -> UncertainValue {
                $func(&self, rhs)
            }
        }

        impl<'a> $Trait<UncertainValue> for &'a UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: UncertainValue) -> UncertainValue {
                $func(self, &rhs)
            }
        }

        impl $Trait<f64> for UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: f64) -> UncertainValue {
                $func(&self, &UncertainValue::constant(rhs))
            }
        }

        impl<'a> $Trait<f64> for &'a UncertainValue {
            type Output = UncertainValue;
            fn $method(self, rhs: f64) -> UncertainValue {
                $func(self, &UncertainValue::constant(rhs))
            }
        }

        impl $Trait<UncertainValue> for f64 {
            type Output = UncertainValue;
            fn $method(self, rhs: UncertainValue) -> UncertainValue {
                $func(&UncertainValue::constant(self), &rhs)
            }
        }

        impl<'a> $Trait<&'a UncertainValue> for f64 {
            type Output = UncertainValue;
            fn $method(self, rhs: &'a UncertainValue) -> UncertainValue {
                $func(&UncertainValue::constant(self), rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, add_values);
impl_binary_op!(Sub, sub, sub_values);
impl_binary_op!(Mul, mul, mul_values);
impl_binary_op!(Div, div, div_values);

impl Neg for UncertainValue {
    type Output = UncertainValue;
    fn neg(self) -> UncertainValue {
        self.chain(-self.mean, -1.0)
    }
}

impl<'a> Neg for &'a UncertainValue {
    type Output = UncertainValue;
    fn neg(self) -> UncertainValue {
        self.chain(-self.mean, -1.0)
    }
}

impl From<f64> for UncertainValue {
    fn from(value: f64) -> UncertainValue {
        UncertainValue::constant(value)
    }
}

impl fmt::Display for UncertainValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match f.precision() {
            Some(p) => write!(f, "{:.*} ± {:.*}", p, self.mean, p, self.sdev()),
            None => write!(f, "{} ± {}", self.mean, self.sdev()),
        }
    }
}

// roots are process local; only the marginal summary leaves the process
impl Serialize for UncertainValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UncertainValue", 2)?;
        state.serialize_field("mean", &self.mean)?;
        state.serialize_field("sdev", &self.sdev())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn test_self_difference_cancels() {
        let a = UncertainValue::new(5.0, 1.0);
        let d = &a - &a;
        assert_eq!(d.mean(), 0.0);
        assert_eq!(d.variance(), 0.0);
        assert!(d.is_constant());
    }

    #[test]
    fn test_independent_difference_adds_variance() {
        let a = UncertainValue::new(5.0, 1.0);
        let b = UncertainValue::new(5.0, 1.0);
        let d = &a - &b;
        assert_eq!(d.mean(), 0.0);
        assert!(close(d.variance(), 2.0));
    }

    #[test]
    fn test_product_of_independent_values() {
        let a = UncertainValue::new(2.0, 0.1);
        let b = UncertainValue::new(3.0, 0.2);
        let p = &a * &b;
        assert!(close(p.mean(), 6.0));
        // mean(a)^2 var(b) + mean(b)^2 var(a)
        assert!(close(p.variance(), 4.0 * 0.04 + 9.0 * 0.01));
    }

    #[test]
    fn test_ratio_of_shared_ancestry_is_exact() {
        let a = UncertainValue::new(4.0, 0.5);
        let r = &a / &a;
        assert!(close(r.mean(), 1.0));
        assert!(close(r.variance(), 0.0));
    }

    #[test]
    fn test_scalar_promotion() {
        let a = UncertainValue::new(3.0, 0.5);
        let shifted = 2.0 + a.clone() - 1.0;
        assert!(close(shifted.mean(), 4.0));
        assert!(close(shifted.sdev(), 0.5));
        let scaled = 4.0 * &a;
        assert!(close(scaled.sdev(), 2.0));
        let inverted = 1.0 / &a;
        assert!(close(inverted.sdev(), 0.5 / 9.0));
    }

    #[test]
    fn test_elementary_functions() {
        let x = UncertainValue::new(1.0, 0.1);
        assert!(close(x.exp().sdev(), 1f64.exp() * 0.1));
        assert!(close(x.ln().sdev(), 0.1));
        assert!(close(x.sqrt().sdev(), 0.05));
        assert!(close(x.powi(3).sdev(), 0.3));
        assert!(close(x.powf(2.5).sdev(), 0.25));
        let zero = UncertainValue::new(0.0, 0.2);
        assert!(close(zero.logistic().mean(), 0.5));
        assert!(close(zero.logistic().sdev(), 0.05));
    }

    #[test]
    fn test_uncertain_exponent() {
        let base = UncertainValue::new(2.0, 0.0);
        let exponent = UncertainValue::new(3.0, 0.1);
        let p = base.pow(&exponent);
        assert!(close(p.mean(), 8.0));
        assert!(close(p.sdev(), 8.0 * 2f64.ln() * 0.1));
    }

    #[test]
    fn test_clamp_outside_band_is_constant() {
        let x = UncertainValue::new(2.5, 0.3);
        assert!(x.clamp(0.0, 1.0).is_constant());
        assert_eq!(x.clamp(0.0, 1.0).mean(), 1.0);
        assert!(close(x.clamp(0.0, 3.0).sdev(), 0.3));
    }

    #[test]
    fn test_derivative_tracking() {
        let x = UncertainValue::new(2.0, 0.3);
        let y = UncertainValue::new(5.0, 1.0);
        let f = &x * &x * &y + y.exp();
        // df/dx = 2xy, df/dy = x^2 + e^y
        assert!(close(f.derivative(&x).unwrap(), 20.0));
        assert!(close(f.derivative(&y).unwrap(), 4.0 + 5f64.exp()));
        assert!(f.derivative(&f).is_none());
    }

    #[test]
    fn test_correlated_construction() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.2, 1.2, 1.0]);
        let values = UncertainValue::correlated(&[1.0, 2.0], &cov).unwrap();
        let back = covariance_matrix(&values);
        for i in 0..2 {
            for j in 0..2 {
                assert!(close(back[(i, j)], cov[(i, j)]));
            }
        }
        assert!(close(correlation(&values[0], &values[1]), 0.6));
        // difference of positively correlated values shrinks
        let d = &values[0] - &values[1];
        assert!(close(d.variance(), 4.0 + 1.0 - 2.0 * 1.2));
    }

    #[test]
    fn test_correlated_rejects_indefinite_matrix() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            UncertainValue::correlated(&[0.0, 0.0], &cov),
            Err(Error::NotPositiveDefinite(_))
        ));
        let wrong = DMatrix::<f64>::identity(3, 3);
        assert!(matches!(
            UncertainValue::correlated(&[0.0, 0.0], &wrong),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_denominator_is_not_masked() {
        let a = UncertainValue::new(1.0, 0.1);
        let z = UncertainValue::new(0.0, 0.1);
        let q = &a / &z;
        assert!(q.mean().is_infinite());
        assert!(q.variance().is_nan() || q.variance().is_infinite());
    }

    #[test]
    fn test_display_with_precision() {
        let a = UncertainValue::new(5.0, 1.0);
        assert_eq!(format!("{:.2}", a), "5.00 ± 1.00");
    }

    #[test]
    fn test_serialize_summary() {
        let a = UncertainValue::new(5.0, 2.0);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"mean":5.0,"sdev":2.0}"#);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_variance_is_never_negative(
            m1 in -100.0f64..100.0, s1 in 0.0f64..10.0,
            m2 in 0.5f64..100.0, s2 in 0.0f64..10.0,
        ) {
            let a = UncertainValue::new(m1, s1);
            let b = UncertainValue::new(m2, s2);
            for v in [&a + &b, &a - &b, &a * &b, &a / &b, (&a * &b) - &a] {
                prop_assert!(v.variance() >= 0.0);
            }
        }

        #[test]
        fn prop_linear_combination_matches_closed_form(
            m in -10.0f64..10.0, s in 0.01f64..5.0,
            u in -5.0f64..5.0, v in -5.0f64..5.0,
        ) {
            let a = UncertainValue::new(m, s);
            let combo = u * &a + v * &a;
            let expected = (u + v).abs() * s;
            prop_assert!((combo.sdev() - expected).abs() <= 1e-9 * (1.0 + expected));
        }

        #[test]
        fn prop_covariance_is_symmetric(
            m1 in 0.5f64..10.0, s1 in 0.01f64..1.0,
            m2 in 0.5f64..10.0, s2 in 0.01f64..1.0,
        ) {
            let a = UncertainValue::new(m1, s1);
            let b = UncertainValue::new(m2, s2);
            let x = &a * &b;
            let y = &a / &b;
            prop_assert_eq!(covariance(&x, &y), covariance(&y, &x));
        }
    }
}
