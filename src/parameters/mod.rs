/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// parameters module
//
// parameters are keyed by a closed set of names. A run is configured with an
// untyped table (fixed scalars and uncertain values side by side) which is
// resolved once, up front, into a typed ParameterSet of the run's numeric kind
//
////////////////////////////////////////////////////////////////////////////////////

mod update;

pub use update::{LogisticSocialPolicy, NoUpdate, TimeStepUpdate};

use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::uncertain::{Numeric, UncertainValue};

// Names ---------------------------------------------------------------------------------------------
#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum ParameterName {
    Population,
    InitialExposed,
    InitialInfected,
    InitialRecovered,
    Beta,
    IncubationDays,
    RecoveryDays,
    LogisticL,
    LogisticK,
    LogisticX0,
    MarketShare,
    HospitalProbability,
    HospitalLengthOfStay,
    IcuProbability,
    IcuLengthOfStay,
    VentProbability,
    VentLengthOfStay,
}

// Structural parameters set up the run (populations); epidemiological ones
// drive the equations and are the ones worth calibrating
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParameterKind {
    Structural,
    Epidemiological,
}

impl ParameterName {
    pub const ALL: [ParameterName; 17] = [
        ParameterName::Population,
        ParameterName::InitialExposed,
        ParameterName::InitialInfected,
        ParameterName::InitialRecovered,
        ParameterName::Beta,
        ParameterName::IncubationDays,
        ParameterName::RecoveryDays,
        ParameterName::LogisticL,
        ParameterName::LogisticK,
        ParameterName::LogisticX0,
        ParameterName::MarketShare,
        ParameterName::HospitalProbability,
        ParameterName::HospitalLengthOfStay,
        ParameterName::IcuProbability,
        ParameterName::IcuLengthOfStay,
        ParameterName::VentProbability,
        ParameterName::VentLengthOfStay,
    ];

    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterName::Population
            | ParameterName::InitialExposed
            | ParameterName::InitialInfected
            | ParameterName::InitialRecovered => ParameterKind::Structural,
            _ => ParameterKind::Epidemiological,
        }
    }

    // Internal name used in configuration files, fits and sample tables
    pub fn fit_name(&self) -> &'static str {
        match self {
            ParameterName::Population => "population",
            ParameterName::InitialExposed => "initial_exposed",
            ParameterName::InitialInfected => "initial_infected",
            ParameterName::InitialRecovered => "initial_recovered",
            ParameterName::Beta => "beta",
            ParameterName::IncubationDays => "incubation_days",
            ParameterName::RecoveryDays => "recovery_days",
            ParameterName::LogisticL => "logistic_l",
            ParameterName::LogisticK => "logistic_k",
            ParameterName::LogisticX0 => "logistic_x0",
            ParameterName::MarketShare => "market_share",
            ParameterName::HospitalProbability => "hospital_probability",
            ParameterName::HospitalLengthOfStay => "hospital_length_of_stay",
            ParameterName::IcuProbability => "icu_probability",
            ParameterName::IcuLengthOfStay => "icu_length_of_stay",
            ParameterName::VentProbability => "vent_probability",
            ParameterName::VentLengthOfStay => "vent_length_of_stay",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ParameterName::Population => "Total population",
            ParameterName::InitialExposed => "Initial exposed",
            ParameterName::InitialInfected => "Initial infected",
            ParameterName::InitialRecovered => "Initial recovered",
            ParameterName::Beta => "Transmission rate",
            ParameterName::IncubationDays => "Incubation period (days)",
            ParameterName::RecoveryDays => "Infectious period (days)",
            ParameterName::LogisticL => "Social distancing reduction",
            ParameterName::LogisticK => "Social distancing rate",
            ParameterName::LogisticX0 => "Social distancing midpoint (day)",
            ParameterName::MarketShare => "Hospital market share",
            ParameterName::HospitalProbability => "Hospitalization probability",
            ParameterName::HospitalLengthOfStay => "Hospital length of stay (days)",
            ParameterName::IcuProbability => "ICU probability",
            ParameterName::IcuLengthOfStay => "ICU length of stay (days)",
            ParameterName::VentProbability => "Ventilator probability",
            ParameterName::VentLengthOfStay => "Ventilator length of stay (days)",
        }
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.fit_name())
    }
}

// accepts either the internal or the display name
impl FromStr for ParameterName {
    type Err = Error;

    fn from_str(s: &str) -> Result<ParameterName> {
        let s = s.trim();
        ParameterName::ALL
            .iter()
            .find(|n| n.fit_name() == s || n.display_name() == s)
            .copied()
            .ok_or_else(|| Error::UnknownParameter(s.to_string()))
    }
}

// Values --------------------------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Fixed(f64),
    Uncertain(UncertainValue),
}

impl ParameterValue {
    pub fn mean(&self) -> f64 {
        match self {
            ParameterValue::Fixed(x) => *x,
            ParameterValue::Uncertain(u) => u.mean(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Fixed,
    Calibrated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: ParameterName,
    pub value: ParameterValue,
    pub role: Role,
}

// Table ---------------------------------------------------------------------------------------------
/// The untyped parameter bag a run is configured with.
///
/// Fixed entries hold scalars; variable entries hold uncertain values and are
/// the calibration targets when fitting.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    entries: IndexMap<ParameterName, Parameter>,
}

impl ParameterTable {
    pub fn new() -> ParameterTable {
        ParameterTable::default()
    }

    // Builds the table from the fixed and variable bags; a name in both is an error
    pub fn from_bags(
        fixed: &IndexMap<ParameterName, f64>,
        variable: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<ParameterTable> {
        let mut table = ParameterTable::new();
        for (&name, &value) in fixed {
            table.insert(Parameter {
                name,
                value: ParameterValue::Fixed(value),
                role: Role::Fixed,
            })?;
        }
        for (&name, value) in variable {
            table.insert(Parameter {
                name,
                value: ParameterValue::Uncertain(value.clone()),
                role: Role::Calibrated,
            })?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, parameter: Parameter) -> Result<()> {
        if self.entries.contains_key(&parameter.name) {
            return Err(Error::DuplicateParameter(parameter.name));
        }
        self.entries.insert(parameter.name, parameter);
        Ok(())
    }

    pub fn get(&self, name: ParameterName) -> Option<&Parameter> {
        self.entries.get(&name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.values()
    }

    // Names marked for calibration, in insertion order
    pub fn calibrated(&self) -> Vec<ParameterName> {
        self.entries
            .values()
            .filter(|p| p.role == Role::Calibrated)
            .map(|p| p.name)
            .collect()
    }

    // Fails with the first required name that is absent
    pub fn validate(&self, required: &[ParameterName]) -> Result<()> {
        match required.iter().find(|n| !self.entries.contains_key(*n)) {
            Some(&missing) => Err(Error::MissingParameter(missing)),
            None => Ok(()),
        }
    }

    // Typed parameter set for a run of kind T
    pub fn resolve<T: Numeric>(&self, required: &[ParameterName]) -> Result<ParameterSet<T>> {
        self.validate(required)?;
        let mut values = IndexMap::with_capacity(self.entries.len());
        for p in self.entries.values() {
            values.insert(p.name, T::from_parameter(p.name, &p.value)?);
        }
        Ok(ParameterSet { values })
    }
}

// Typed set -----------------------------------------------------------------------------------------
/// Parameters of one numeric kind, in a stable order.
///
/// Never mutated in place: time-step updates and fits produce new sets with `with`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet<T> {
    values: IndexMap<ParameterName, T>,
}

impl<T> Default for ParameterSet<T> {
    fn default() -> Self {
        ParameterSet {
            values: IndexMap::new(),
        }
    }
}

impl<T: Clone> ParameterSet<T> {
    pub fn get(&self, name: ParameterName) -> Result<&T> {
        self.values
            .get(&name)
            .ok_or(Error::MissingParameter(name))
    }

    pub fn contains(&self, name: ParameterName) -> bool {
        self.values.contains_key(&name)
    }

    // Copy of this set with one value replaced or added
    pub fn with(&self, name: ParameterName, value: T) -> ParameterSet<T> {
        let mut values = self.values.clone();
        values.insert(name, value);
        ParameterSet { values }
    }

    pub fn names(&self) -> impl Iterator<Item = ParameterName> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterName, &T)> {
        self.values.iter().map(|(&n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn validate(&self, required: &[ParameterName]) -> Result<()> {
        match required.iter().find(|n| !self.values.contains_key(*n)) {
            Some(&missing) => Err(Error::MissingParameter(missing)),
            None => Ok(()),
        }
    }
}

impl<T: Numeric> ParameterSet<T> {
    pub fn means(&self) -> ParameterSet<f64> {
        self.values.iter().map(|(&n, v)| (n, v.mean())).collect()
    }
}

impl<T> FromIterator<(ParameterName, T)> for ParameterSet<T> {
    fn from_iter<I: IntoIterator<Item = (ParameterName, T)>>(iter: I) -> Self {
        ParameterSet {
            values: iter.into_iter().collect(),
        }
    }
}
