// The numeric kind a simulation runs over.
//
// The compartment model and post-processing are written once against this
// trait and instantiated over plain f64 (scalar runs, Monte Carlo draws) or
// UncertainValue (single pass linearized propagation).

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use super::UncertainValue;
use crate::error::{Error, Result};
use crate::parameters::{ParameterName, ParameterValue};

pub trait Numeric:
    Clone
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    // Human readable kind, used in kind mismatch errors
    const KIND: &'static str;

    fn constant(value: f64) -> Self;
    fn mean(&self) -> f64;
    fn sdev(&self) -> f64;
    fn exp(&self) -> Self;
    fn ln(&self) -> Self;
    fn sqrt(&self) -> Self;
    fn powf(&self, exponent: f64) -> Self;
    fn logistic(&self) -> Self;
    fn clamp(&self, lo: f64, hi: f64) -> Self;

    // Converts a configured parameter value, rejecting kinds this run cannot hold
    fn from_parameter(name: ParameterName, value: &ParameterValue) -> Result<Self>;

    fn zero() -> Self {
        Self::constant(0.0)
    }
}

impl Numeric for f64 {
    const KIND: &'static str = "scalar";

    fn constant(value: f64) -> f64 {
        value
    }
    fn mean(&self) -> f64 {
        *self
    }
    fn sdev(&self) -> f64 {
        0.0
    }
    fn exp(&self) -> f64 {
        f64::exp(*self)
    }
    fn ln(&self) -> f64 {
        f64::ln(*self)
    }
    fn sqrt(&self) -> f64 {
        f64::sqrt(*self)
    }
    fn powf(&self, exponent: f64) -> f64 {
        f64::powf(*self, exponent)
    }
    fn logistic(&self) -> f64 {
        1.0 / (1.0 + f64::exp(-*self))
    }
    fn clamp(&self, lo: f64, hi: f64) -> f64 {
        f64::clamp(*self, lo, hi)
    }

    fn from_parameter(name: ParameterName, value: &ParameterValue) -> Result<f64> {
        match value {
            ParameterValue::Fixed(x) => Ok(*x),
            ParameterValue::Uncertain(_) => Err(Error::KindMismatch {
                name,
                expected: Self::KIND,
                found: UncertainValue::KIND,
            }),
        }
    }
}

impl Numeric for UncertainValue {
    const KIND: &'static str = "uncertain";

    fn constant(value: f64) -> UncertainValue {
        UncertainValue::constant(value)
    }
    fn mean(&self) -> f64 {
        UncertainValue::mean(self)
    }
    fn sdev(&self) -> f64 {
        UncertainValue::sdev(self)
    }
    fn exp(&self) -> UncertainValue {
        UncertainValue::exp(self)
    }
    fn ln(&self) -> UncertainValue {
        UncertainValue::ln(self)
    }
    fn sqrt(&self) -> UncertainValue {
        UncertainValue::sqrt(self)
    }
    fn powf(&self, exponent: f64) -> UncertainValue {
        UncertainValue::powf(self, exponent)
    }
    fn logistic(&self) -> UncertainValue {
        UncertainValue::logistic(self)
    }
    fn clamp(&self, lo: f64, hi: f64) -> UncertainValue {
        UncertainValue::clamp(self, lo, hi)
    }

    // scalars promote to zero variance values
    fn from_parameter(_name: ParameterName, value: &ParameterValue) -> Result<UncertainValue> {
        Ok(match value {
            ParameterValue::Fixed(x) => UncertainValue::constant(*x),
            ParameterValue::Uncertain(u) => u.clone(),
        })
    }
}
