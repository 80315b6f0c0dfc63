/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// model module
//
// the compartment model: susceptible -> exposed -> infected -> recovered
// one Euler step per calendar day from the initial condition date
//
// the model is written once against the Numeric trait so the same run can be
// done with plain scalars or with uncertain values
//
////////////////////////////////////////////////////////////////////////////////////

use chrono::{Duration, NaiveDate};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fit::{self, FitData};
use crate::parameters::{
    NoUpdate, ParameterName, ParameterSet, ParameterTable, TimeStepUpdate,
};
use crate::post_process::{self, DerivedSeries, LengthOfStay, Metric};
use crate::uncertain::{Numeric, UncertainValue};

// Variants ------------------------------------------------------------------------------------------
#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ModelVariant {
    Sir,
    Seir,
}

impl ModelVariant {
    // Parameters the transition equations and initial condition read
    pub fn dynamics_parameters(&self) -> &'static [ParameterName] {
        match self {
            ModelVariant::Sir => &[
                ParameterName::Population,
                ParameterName::InitialInfected,
                ParameterName::InitialRecovered,
                ParameterName::Beta,
                ParameterName::RecoveryDays,
            ],
            ModelVariant::Seir => &[
                ParameterName::Population,
                ParameterName::InitialExposed,
                ParameterName::InitialInfected,
                ParameterName::InitialRecovered,
                ParameterName::Beta,
                ParameterName::IncubationDays,
                ParameterName::RecoveryDays,
            ],
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelVariant::Sir => write!(f, "SIR"),
            ModelVariant::Seir => write!(f, "SEIR"),
        }
    }
}

impl FromStr for ModelVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<ModelVariant> {
        match s.trim().to_lowercase().as_str() {
            "sir" => Ok(ModelVariant::Sir),
            "seir" => Ok(ModelVariant::Seir),
            other => Err(Error::Config(format!("unknown model variant {}", other))),
        }
    }
}

// State ---------------------------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompartmentState<T> {
    pub date: NaiveDate,
    pub susceptible: T,
    pub exposed: T,
    pub infected: T,
    pub recovered: T,
}

impl<T: Numeric> CompartmentState<T> {
    pub fn new(date: NaiveDate, susceptible: T, exposed: T, infected: T, recovered: T) -> Self {
        CompartmentState {
            date,
            susceptible,
            exposed,
            infected,
            recovered,
        }
    }

    pub fn total(&self) -> T {
        self.susceptible.clone()
            + self.exposed.clone()
            + self.infected.clone()
            + self.recovered.clone()
    }
}

// People moving between compartments during one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flows<T> {
    pub exposed_new: T,
    pub infected_new: T,
    pub recovered_new: T,
}

impl<T: Numeric> Flows<T> {
    fn none() -> Self {
        Flows {
            exposed_new: T::zero(),
            infected_new: T::zero(),
            recovered_new: T::zero(),
        }
    }
}

// State at the end of a day with the flows that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRecord<T> {
    pub state: CompartmentState<T>,
    pub flows: Flows<T>,
}

// Model ---------------------------------------------------------------------------------------------
/// The compartment model.
///
/// The time-step update strategy is fixed at construction; a model never
/// changes between runs, so two runs with the same inputs are bit identical.
#[derive(Debug, Clone)]
pub struct SeirModel<U = NoUpdate> {
    variant: ModelVariant,
    start_date: NaiveDate,
    length_of_stay: LengthOfStay,
    update: U,
}

impl SeirModel<NoUpdate> {
    pub fn new(variant: ModelVariant, start_date: NaiveDate) -> SeirModel<NoUpdate> {
        SeirModel {
            variant,
            start_date,
            length_of_stay: LengthOfStay::default(),
            update: NoUpdate,
        }
    }
}

impl<U: TimeStepUpdate> SeirModel<U> {
    pub fn with_update<V: TimeStepUpdate>(self, update: V) -> SeirModel<V> {
        SeirModel {
            variant: self.variant,
            start_date: self.start_date,
            length_of_stay: self.length_of_stay,
            update,
        }
    }

    pub fn with_length_of_stay(self, length_of_stay: LengthOfStay) -> SeirModel<U> {
        SeirModel {
            length_of_stay,
            ..self
        }
    }

    // Same dynamics started from another initial condition date
    pub fn starting(&self, start_date: NaiveDate) -> SeirModel<U>
    where
        U: Clone,
    {
        SeirModel {
            start_date,
            ..self.clone()
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn length_of_stay(&self) -> LengthOfStay {
        self.length_of_stay
    }

    // Every name the equations, the post-processing and the update strategy read
    pub fn required_parameters(&self) -> Vec<ParameterName> {
        let mut names: Vec<ParameterName> = Vec::new();
        let sources = [
            self.variant.dynamics_parameters(),
            &post_process::REQUIRED_PARAMETERS[..],
            self.update.required_parameters(),
        ];
        for name in sources.iter().flat_map(|s| s.iter()) {
            if !names.contains(name) {
                names.push(*name);
            }
        }
        names
    }

    pub fn initial_state<T: Numeric>(&self, params: &ParameterSet<T>) -> Result<CompartmentState<T>> {
        let population = params.get(ParameterName::Population)?.clone();
        let exposed = match self.variant {
            ModelVariant::Sir => T::zero(),
            ModelVariant::Seir => params.get(ParameterName::InitialExposed)?.clone(),
        };
        let infected = params.get(ParameterName::InitialInfected)?.clone();
        let recovered = params.get(ParameterName::InitialRecovered)?.clone();
        let susceptible =
            population - exposed.clone() - infected.clone() - recovered.clone();
        Ok(CompartmentState::new(
            self.start_date,
            susceptible,
            exposed,
            infected,
            recovered,
        ))
    }

    // One day transition with the parameters in effect for that day
    pub fn step<T: Numeric>(
        &self,
        state: &CompartmentState<T>,
        params: &ParameterSet<T>,
    ) -> Result<SimulationRecord<T>> {
        let beta = params.get(ParameterName::Beta)?.clone();
        let population = params.get(ParameterName::Population)?.clone();
        let recovery_days = params.get(ParameterName::RecoveryDays)?.clone();

        let contacts = beta * state.susceptible.clone() * state.infected.clone() / population;
        let recovered_new = state.infected.clone() / recovery_days;

        // SIR: exposure and infection coincide, the exposed compartment stays empty
        let (exposed_new, infected_new) = match self.variant {
            ModelVariant::Sir => (contacts.clone(), contacts),
            ModelVariant::Seir => {
                let incubation_days = params.get(ParameterName::IncubationDays)?.clone();
                (contacts, state.exposed.clone() / incubation_days)
            }
        };

        let next = CompartmentState {
            date: state.date + Duration::days(1),
            susceptible: state.susceptible.clone() - exposed_new.clone(),
            exposed: state.exposed.clone() + exposed_new.clone() - infected_new.clone(),
            infected: state.infected.clone() + infected_new.clone() - recovered_new.clone(),
            recovered: state.recovered.clone() + recovered_new.clone(),
        };
        Ok(SimulationRecord {
            state: next,
            flows: Flows {
                exposed_new,
                infected_new,
                recovered_new,
            },
        })
    }

    /// Daily history from the initial condition through `end_date` inclusive.
    ///
    /// Either every day is produced or the call fails; there is no partial history.
    pub fn simulate<T: Numeric>(
        &self,
        end_date: NaiveDate,
        params: &ParameterSet<T>,
    ) -> Result<Vec<SimulationRecord<T>>> {
        if end_date < self.start_date {
            return Err(Error::InvalidDates(format!(
                "cannot run backward from {} to {}",
                self.start_date, end_date
            )));
        }
        params.validate(&self.required_parameters())?;

        let days = (end_date - self.start_date).num_days() as usize;
        debug!(variant = %self.variant, days, kind = T::KIND, "simulating");

        let mut history = Vec::with_capacity(days + 1);
        history.push(SimulationRecord {
            state: self.initial_state(params)?,
            flows: Flows::none(),
        });
        for day in 0..days {
            let current = &history[day].state;
            let step_params = self.update.update(current.date, day, current, params)?;
            let record = self.step(current, &step_params)?;
            history.push(record);
        }
        Ok(history)
    }

    /// Derived metrics on the requested dates.
    ///
    /// Dates must be strictly increasing and not earlier than the initial
    /// condition; they need not start there or be contiguous.
    pub fn propagate<T: Numeric>(
        &self,
        dates: &[NaiveDate],
        params: &ParameterSet<T>,
    ) -> Result<DerivedSeries<T>> {
        self.check_dates(dates)?;
        params.validate(&self.required_parameters())?;
        let last = dates[dates.len() - 1];
        let history = self.simulate(last, params)?;
        let series = post_process::derive(&history, params, self.length_of_stay)?;
        series.select(dates)
    }

    // Resolves an untyped table for a run of kind T, then propagates
    pub fn propagate_table<T: Numeric>(
        &self,
        dates: &[NaiveDate],
        table: &ParameterTable,
    ) -> Result<DerivedSeries<T>> {
        let params = table.resolve::<T>(&self.required_parameters())?;
        self.propagate(dates, &params)
    }

    pub fn propagate_uncertainties(
        &self,
        dates: &[NaiveDate],
        fixed: &IndexMap<ParameterName, f64>,
        variable: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<DerivedSeries<UncertainValue>> {
        let table = ParameterTable::from_bags(fixed, variable)?;
        info!(
            variant = %self.variant,
            dates = dates.len(),
            uncertain = variable.len(),
            "propagating uncertainties"
        );
        self.propagate_table(dates, &table)
    }

    // model side of the fit residual: predictions concatenated metric by metric
    pub fn fit_fcn<T: Numeric>(
        &self,
        dates: &[NaiveDate],
        metrics: &[Metric],
        params: &ParameterSet<T>,
    ) -> Result<Vec<T>> {
        let series = self.propagate(dates, params)?;
        let mut out = Vec::with_capacity(dates.len() * metrics.len());
        for &metric in metrics {
            let column = series
                .column(metric)
                .ok_or_else(|| Error::Config(format!("model does not produce {}", metric)))?;
            out.extend(column.iter().cloned());
        }
        Ok(out)
    }

    // Pre-flight check of a fit call, see `fit::check_call`
    pub fn validate_call(
        &self,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<()> {
        fit::check_call(&self.required_parameters(), data, fixed, priors)
    }

    fn check_dates(&self, dates: &[NaiveDate]) -> Result<()> {
        let first = dates
            .first()
            .ok_or_else(|| Error::InvalidDates("no dates requested".to_string()))?;
        if *first < self.start_date {
            return Err(Error::InvalidDates(format!(
                "{} precedes the initial condition {}",
                first, self.start_date
            )));
        }
        if let Some(pair) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(Error::InvalidDates(format!(
                "dates not strictly increasing at {} -> {}",
                pair[0], pair[1]
            )));
        }
        Ok(())
    }
}

// `count` consecutive days starting at `first`
pub fn date_range(first: NaiveDate, count: usize) -> Vec<NaiveDate> {
    (0..count as i64).map(|d| first + Duration::days(d)).collect()
}
