/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// post_process module
//
// turns a compartment history into clinical metrics
//
//      admits(t) = infected_new(t) * probability * market_share
//      census(t) = sum over a <= t of admits(a) * survival(t - a, length_of_stay)
//
// each admitted cohort leaves after its length of stay (M/M/inf style queue)
//
////////////////////////////////////////////////////////////////////////////////////

use chrono::NaiveDate;
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::SimulationRecord;
use crate::parameters::{ParameterName, ParameterSet};
use crate::uncertain::Numeric;

pub const REQUIRED_PARAMETERS: [ParameterName; 7] = [
    ParameterName::MarketShare,
    ParameterName::HospitalProbability,
    ParameterName::HospitalLengthOfStay,
    ParameterName::IcuProbability,
    ParameterName::IcuLengthOfStay,
    ParameterName::VentProbability,
    ParameterName::VentLengthOfStay,
];

// Metrics -------------------------------------------------------------------------------------------
#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum Metric {
    Susceptible,
    Exposed,
    Infected,
    Recovered,
    InfectedNew,
    CumulativeInfected,
    HospitalAdmits,
    HospitalCensus,
    IcuAdmits,
    IcuCensus,
    VentAdmits,
    VentCensus,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::Susceptible,
        Metric::Exposed,
        Metric::Infected,
        Metric::Recovered,
        Metric::InfectedNew,
        Metric::CumulativeInfected,
        Metric::HospitalAdmits,
        Metric::HospitalCensus,
        Metric::IcuAdmits,
        Metric::IcuCensus,
        Metric::VentAdmits,
        Metric::VentCensus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Susceptible => "susceptible",
            Metric::Exposed => "exposed",
            Metric::Infected => "infected",
            Metric::Recovered => "recovered",
            Metric::InfectedNew => "infected_new",
            Metric::CumulativeInfected => "cumulative_infected",
            Metric::HospitalAdmits => "hospital_admits",
            Metric::HospitalCensus => "hospital_census",
            Metric::IcuAdmits => "icu_admits",
            Metric::IcuCensus => "icu_census",
            Metric::VentAdmits => "vent_admits",
            Metric::VentCensus => "vent_census",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Metric> {
        let s = s.trim();
        Metric::ALL
            .iter()
            .find(|m| m.name() == s)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown metric {}", s)))
    }
}

// Length of stay ------------------------------------------------------------------------------------
// Fraction of an admitted cohort still present `d` days after admission
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum LengthOfStay {
    // Everyone stays exactly `los` days; a fractional `los` leaves a partial
    // cohort on the last day, which keeps the census differentiable in `los`
    #[default]
    FixedDuration,
    // Departures at constant rate 1 / los
    Exponential,
}

impl LengthOfStay {
    pub fn survival<T: Numeric>(&self, days: usize, length_of_stay: &T) -> T {
        match self {
            LengthOfStay::FixedDuration => (length_of_stay.clone() - days as f64).clamp(0.0, 1.0),
            LengthOfStay::Exponential => {
                (-(T::constant(days as f64) / length_of_stay.clone())).exp()
            }
        }
    }
}

impl FromStr for LengthOfStay {
    type Err = Error;

    fn from_str(s: &str) -> Result<LengthOfStay> {
        match s.trim() {
            "fixed" | "fixed_duration" => Ok(LengthOfStay::FixedDuration),
            "exponential" => Ok(LengthOfStay::Exponential),
            other => Err(Error::Config(format!("unknown length of stay kernel {}", other))),
        }
    }
}

pub fn admits<T: Numeric>(infected_new: &[T], probability: &T, market_share: &T) -> Vec<T> {
    let share = probability.clone() * market_share.clone();
    infected_new
        .iter()
        .map(|n| n.clone() * share.clone())
        .collect()
}

pub fn census<T: Numeric>(admits: &[T], length_of_stay: &T, kernel: LengthOfStay) -> Vec<T> {
    let n = admits.len();
    // nobody stays: survival is zero from the day of admission
    if length_of_stay.mean() <= 0.0 {
        return vec![T::zero(); n];
    }
    let mut weights: Vec<T> = Vec::with_capacity(n);
    for d in 0..n {
        // fixed stays end: nothing further contributes
        if kernel == LengthOfStay::FixedDuration && length_of_stay.mean() <= d as f64 {
            break;
        }
        weights.push(kernel.survival(d, length_of_stay));
    }

    (0..n)
        .map(|t| {
            let first = t.saturating_sub(weights.len().saturating_sub(1));
            (first..=t).fold(T::zero(), |acc, a| {
                acc + admits[a].clone() * weights[t - a].clone()
            })
        })
        .collect()
}

// Series --------------------------------------------------------------------------------------------
// Date indexed table of metrics, one column per metric
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSeries<T> {
    dates: Vec<NaiveDate>,
    columns: IndexMap<Metric, Vec<T>>,
}

impl<T: Clone> DerivedSeries<T> {
    pub fn new(dates: Vec<NaiveDate>) -> DerivedSeries<T> {
        DerivedSeries {
            dates,
            columns: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, metric: Metric, values: Vec<T>) -> Result<()> {
        if values.len() != self.dates.len() {
            return Err(Error::shape(
                format!("{} column", metric),
                self.dates.len(),
                values.len(),
            ));
        }
        self.columns.insert(metric, values);
        Ok(())
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        self.columns.keys().copied()
    }

    pub fn column(&self, metric: Metric) -> Option<&[T]> {
        self.columns.get(&metric).map(|c| c.as_slice())
    }

    pub fn value(&self, metric: Metric, date: NaiveDate) -> Option<&T> {
        let index = self.dates.binary_search(&date).ok()?;
        self.columns.get(&metric).map(|c| &c[index])
    }

    // Rows for the given dates, every one of which must be present
    pub fn select(&self, dates: &[NaiveDate]) -> Result<DerivedSeries<T>> {
        let indices = dates
            .iter()
            .map(|d| {
                self.dates.binary_search(d).map_err(|_| {
                    Error::InvalidDates(format!("{} is outside the simulated range", d))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        let columns: IndexMap<Metric, Vec<T>> = self
            .columns
            .iter()
            .map(|(&m, c)| (m, indices.iter().map(|&i| c[i].clone()).collect()))
            .collect();
        Ok(DerivedSeries {
            dates: dates.to_vec(),
            columns,
        })
    }
}

impl<T: Numeric> DerivedSeries<T> {
    pub fn means(&self, metric: Metric) -> Option<Vec<f64>> {
        self.column(metric)
            .map(|c| c.iter().map(|v| v.mean()).collect())
    }

    pub fn sdevs(&self, metric: Metric) -> Option<Vec<f64>> {
        self.column(metric)
            .map(|c| c.iter().map(|v| v.sdev()).collect())
    }
}

// All metrics for every day of a simulated history
pub fn derive<T: Numeric>(
    history: &[SimulationRecord<T>],
    params: &ParameterSet<T>,
    kernel: LengthOfStay,
) -> Result<DerivedSeries<T>> {
    params.validate(&REQUIRED_PARAMETERS)?;
    let market_share = params.get(ParameterName::MarketShare)?;

    let mut series = DerivedSeries::new(history.iter().map(|r| r.state.date).collect());
    let pick = |f: fn(&SimulationRecord<T>) -> &T| -> Vec<T> {
        history.iter().map(|r| f(r).clone()).collect()
    };
    series.insert(Metric::Susceptible, pick(|r| &r.state.susceptible))?;
    series.insert(Metric::Exposed, pick(|r| &r.state.exposed))?;
    series.insert(Metric::Infected, pick(|r| &r.state.infected))?;
    series.insert(Metric::Recovered, pick(|r| &r.state.recovered))?;

    let infected_new = pick(|r| &r.flows.infected_new);
    let mut running = T::zero();
    let cumulative = infected_new
        .iter()
        .map(|n| {
            running = running.clone() + n.clone();
            running.clone()
        })
        .collect();
    series.insert(Metric::CumulativeInfected, cumulative)?;

    let clinical = [
        (
            ParameterName::HospitalProbability,
            ParameterName::HospitalLengthOfStay,
            Metric::HospitalAdmits,
            Metric::HospitalCensus,
        ),
        (
            ParameterName::IcuProbability,
            ParameterName::IcuLengthOfStay,
            Metric::IcuAdmits,
            Metric::IcuCensus,
        ),
        (
            ParameterName::VentProbability,
            ParameterName::VentLengthOfStay,
            Metric::VentAdmits,
            Metric::VentCensus,
        ),
    ];
    for (probability, length_of_stay, admits_metric, census_metric) in clinical {
        let admitted = admits(&infected_new, params.get(probability)?, market_share);
        let occupied = census(&admitted, params.get(length_of_stay)?, kernel);
        series.insert(admits_metric, admitted)?;
        series.insert(census_metric, occupied)?;
    }
    series.insert(Metric::InfectedNew, infected_new)?;

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uncertain::UncertainValue;

    #[test]
    fn test_fixed_duration_census_counts_whole_stay() {
        let mut admitted = vec![0.0; 12];
        admitted[2] = 10.0;
        let occupied = census(&admitted, &3.0, LengthOfStay::FixedDuration);
        assert_eq!(
            occupied,
            vec![0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_fractional_stay_leaves_partial_cohort() {
        let admitted = vec![10.0, 0.0, 0.0, 0.0];
        let occupied = census(&admitted, &2.5, LengthOfStay::FixedDuration);
        assert_eq!(occupied, vec![10.0, 10.0, 5.0, 0.0]);
    }

    #[test]
    fn test_non_positive_stay_leaves_census_empty() {
        let admitted = [1.0, 2.0, 3.0];
        for kernel in [LengthOfStay::FixedDuration, LengthOfStay::Exponential] {
            assert_eq!(census(&admitted, &0.0, kernel), vec![0.0; 3]);
            assert_eq!(census(&admitted, &-0.5, kernel), vec![0.0; 3]);
        }
        let occupied = census(
            &[UncertainValue::new(4.0, 1.0)],
            &UncertainValue::constant(0.0),
            LengthOfStay::FixedDuration,
        );
        assert_eq!(occupied[0].mean(), 0.0);
        assert_eq!(occupied[0].variance(), 0.0);
        assert!(census::<f64>(&[], &0.0, LengthOfStay::FixedDuration).is_empty());
    }

    #[test]
    fn test_constant_admits_reach_steady_state() {
        // Little's law: census = arrival rate x length of stay
        let admitted = vec![4.0; 30];
        let fixed = census(&admitted, &5.0, LengthOfStay::FixedDuration);
        assert_eq!(fixed[29], 20.0);
        let exponential = census(&admitted, &5.0, LengthOfStay::Exponential);
        let expected = 4.0 * (1.0 - (-30.0f64 / 5.0).exp()) / (1.0 - (-1.0f64 / 5.0).exp());
        assert!((exponential[29] - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn test_uncertain_length_of_stay_propagates() {
        let admitted = vec![UncertainValue::constant(10.0); 6];
        let los = UncertainValue::new(2.5, 0.2);
        let occupied = census(&admitted, &los, LengthOfStay::FixedDuration);
        // steady state 10 * 2.5, slope 10 per unit of stay
        assert!((occupied[5].mean() - 25.0).abs() < 1e-12);
        assert!((occupied[5].sdev() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_admits_scale_by_share() {
        let admitted = admits(&[100.0, 200.0], &0.1, &0.5);
        assert_eq!(admitted, vec![5.0, 10.0]);
    }

    #[test]
    fn test_metric_names_parse() {
        for metric in Metric::ALL {
            assert_eq!(metric.name().parse::<Metric>().unwrap(), metric);
        }
        assert!("beds".parse::<Metric>().is_err());
        assert_eq!(
            "exponential".parse::<LengthOfStay>().unwrap(),
            LengthOfStay::Exponential
        );
    }

    #[test]
    fn test_select_rejects_unknown_dates() {
        let d0 = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let d1 = NaiveDate::from_ymd_opt(2020, 3, 2).unwrap();
        let mut series = DerivedSeries::new(vec![d0]);
        series.insert(Metric::Infected, vec![1.0]).unwrap();
        assert!(series.select(&[d1]).is_err());
        assert!(matches!(
            series.insert(Metric::Exposed, vec![1.0, 2.0]),
            Err(Error::ShapeMismatch { expected: 1, actual: 2, .. })
        ));
    }
}
