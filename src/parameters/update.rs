// Time-step update strategies.
//
// Before every step the model hands the strategy the date, the day index since
// the initial condition, the current state and the run's parameters. The
// strategy returns the parameters to use for that step only.

use chrono::NaiveDate;
use std::borrow::Cow;

use super::{ParameterName, ParameterSet};
use crate::error::Result;
use crate::model::CompartmentState;
use crate::uncertain::Numeric;

pub trait TimeStepUpdate {
    // Parameters the strategy reads, validated with the model's own
    fn required_parameters(&self) -> &'static [ParameterName] {
        &[]
    }

    fn update<'a, T: Numeric>(
        &self,
        date: NaiveDate,
        day: usize,
        state: &CompartmentState<T>,
        params: &'a ParameterSet<T>,
    ) -> Result<Cow<'a, ParameterSet<T>>>;
}

// Parameters are constant over the run
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpdate;

impl TimeStepUpdate for NoUpdate {
    fn update<'a, T: Numeric>(
        &self,
        _date: NaiveDate,
        _day: usize,
        _state: &CompartmentState<T>,
        params: &'a ParameterSet<T>,
    ) -> Result<Cow<'a, ParameterSet<T>>> {
        Ok(Cow::Borrowed(params))
    }
}

/// Social distancing that ramps up along a logistic curve.
///
/// ```text
/// beta(t) = beta * (1 - L / (1 + exp(-k (t - x0))))
/// ```
///
/// with t in days since the initial condition and x0 the changepoint day.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogisticSocialPolicy;

impl LogisticSocialPolicy {
    const REQUIRED: [ParameterName; 4] = [
        ParameterName::Beta,
        ParameterName::LogisticL,
        ParameterName::LogisticK,
        ParameterName::LogisticX0,
    ];

    // Multiplier applied to beta on a given day
    pub fn reduction<T: Numeric>(day: usize, params: &ParameterSet<T>) -> Result<T> {
        let l = params.get(ParameterName::LogisticL)?.clone();
        let k = params.get(ParameterName::LogisticK)?.clone();
        let x0 = params.get(ParameterName::LogisticX0)?.clone();
        let ramp = (k * (-x0 + day as f64)).logistic();
        Ok(-(l * ramp) + 1.0)
    }
}

impl TimeStepUpdate for LogisticSocialPolicy {
    fn required_parameters(&self) -> &'static [ParameterName] {
        &Self::REQUIRED
    }

    fn update<'a, T: Numeric>(
        &self,
        _date: NaiveDate,
        day: usize,
        _state: &CompartmentState<T>,
        params: &'a ParameterSet<T>,
    ) -> Result<Cow<'a, ParameterSet<T>>> {
        let beta = params.get(ParameterName::Beta)?.clone();
        let reduced = beta * Self::reduction(day, params)?;
        Ok(Cow::Owned(params.with(ParameterName::Beta, reduced)))
    }
}
