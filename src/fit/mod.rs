/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// fit module
//
// calibrates uncertain priors against observed census data
//
//      chi2(p) = | L^-1 ([f(p); p] - [y; mu]) |^2
//
// with y the observations, mu the prior means and L the Cholesky factor of the
// joint covariance of data and priors. The model side f(p) and its Jacobian
// come from a single uncertain run in which every calibrated parameter is a
// unit variance probe, so derivatives are exact to first order.
//
////////////////////////////////////////////////////////////////////////////////////

pub mod optimizer;

use chrono::{Duration, NaiveDate};
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::SeirModel;
use crate::parameters::{ParameterName, ParameterSet, ParameterTable, TimeStepUpdate};
use crate::post_process::{DerivedSeries, Metric};
use crate::uncertain::{covariance_matrix, UncertainValue};
use optimizer::LmSettings;

// Data ----------------------------------------------------------------------------------------------
// Observations to fit against: one column of uncertain values per metric
#[derive(Debug, Clone, Default)]
pub struct FitData {
    dates: Vec<NaiveDate>,
    columns: IndexMap<Metric, Vec<UncertainValue>>,
}

impl FitData {
    pub fn new(dates: Vec<NaiveDate>) -> FitData {
        FitData {
            dates,
            columns: IndexMap::new(),
        }
    }

    // Adds a column; lengths are checked by `check_call`, not here
    pub fn with_column(mut self, metric: Metric, values: Vec<UncertainValue>) -> FitData {
        self.columns.insert(metric, values);
        self
    }

    pub fn insert(&mut self, metric: Metric, values: Vec<UncertainValue>) {
        self.columns.insert(metric, values);
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.columns.keys().copied().collect()
    }

    pub fn column(&self, metric: Metric) -> Option<&[UncertainValue]> {
        self.columns.get(&metric).map(|c| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    // All observations, column after column, in the order `fit_fcn` returns them
    pub fn observations(&self) -> Vec<UncertainValue> {
        self.columns.values().flatten().cloned().collect()
    }

    // `days` extra dates before the first one, observed as zero with the given sdev
    pub fn zero_padded(&self, days: usize, sdev: f64) -> FitData {
        let first = match self.dates.first() {
            Some(&first) if days > 0 => first,
            _ => return self.clone(),
        };
        let mut dates: Vec<NaiveDate> = (1..=days as i64)
            .rev()
            .map(|d| first - Duration::days(d))
            .collect();
        dates.extend_from_slice(&self.dates);

        let columns = self
            .columns
            .iter()
            .map(|(&metric, values)| {
                let mut padded: Vec<UncertainValue> =
                    (0..days).map(|_| UncertainValue::new(0.0, sdev)).collect();
                padded.extend(values.iter().cloned());
                (metric, padded)
            })
            .collect();
        FitData { dates, columns }
    }
}

// Pre-flight ----------------------------------------------------------------------------------------
/// Checks a fit call before any optimizer work.
///
/// Dates must be non-empty and strictly increasing, every column as long as the
/// dates, every required parameter in exactly one of `fixed` and `priors`, and
/// every prior and observation must carry some uncertainty.
pub fn check_call(
    required: &[ParameterName],
    data: &FitData,
    fixed: &IndexMap<ParameterName, f64>,
    priors: &IndexMap<ParameterName, UncertainValue>,
) -> Result<()> {
    if data.dates.is_empty() {
        return Err(Error::InvalidDates("no observation dates".to_string()));
    }
    if let Some(pair) = data.dates.windows(2).find(|w| w[1] <= w[0]) {
        return Err(Error::InvalidDates(format!(
            "observation dates not strictly increasing at {} -> {}",
            pair[0], pair[1]
        )));
    }
    if data.columns.is_empty() {
        return Err(Error::Config("no observed metrics to fit".to_string()));
    }
    for (metric, values) in &data.columns {
        if values.len() != data.dates.len() {
            return Err(Error::shape(
                format!("{} observations", metric),
                data.dates.len(),
                values.len(),
            ));
        }
    }

    if priors.is_empty() {
        return Err(Error::Config("no priors to calibrate".to_string()));
    }
    if let Some(&name) = priors.keys().find(|n| fixed.contains_key(*n)) {
        return Err(Error::DuplicateParameter(name));
    }
    if let Some(&name) = required
        .iter()
        .find(|n| !fixed.contains_key(*n) && !priors.contains_key(*n))
    {
        return Err(Error::MissingParameter(name));
    }

    if let Some((name, _)) = priors.iter().find(|(_, p)| p.variance() <= 0.0) {
        return Err(Error::ZeroVariance(format!("prior {}", name)));
    }
    for (metric, values) in &data.columns {
        if let Some(i) = values.iter().position(|v| v.variance() <= 0.0) {
            return Err(Error::ZeroVariance(format!(
                "{} observation on {}",
                metric, data.dates[i]
            )));
        }
    }
    Ok(())
}

// A starting point must have one entry per prior
pub fn check_parameter_vector(
    priors: &IndexMap<ParameterName, UncertainValue>,
    values: &[f64],
) -> Result<()> {
    if values.len() != priors.len() {
        return Err(Error::shape("parameter vector", priors.len(), values.len()));
    }
    Ok(())
}

// Result --------------------------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct FitResult {
    // Best fit values, correlated with the priors and data they came from
    pub posterior: ParameterSet<UncertainValue>,
    pub fixed: IndexMap<ParameterName, f64>,
    // Posterior covariance (J^T J)^-1, in prior order
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub dof: usize,
    pub iterations: usize,
    pub converged: bool,
    // Whitened residuals at the optimum: observations first, then priors
    pub residuals: Vec<f64>,
    pub offset: usize,
    // Initial condition date of the fitted run
    pub start_date: NaiveDate,
}

impl FitResult {
    pub fn chi2_per_dof(&self) -> f64 {
        self.chi2 / self.dof.max(1) as f64
    }

    // Posterior values under their display names
    pub fn display_table(&self) -> Vec<(&'static str, UncertainValue)> {
        self.posterior
            .iter()
            .map(|(name, value)| (name.display_name(), value.clone()))
            .collect()
    }

    // Fixed parameters and posteriors, ready to propagate
    pub fn parameters(&self) -> Result<ParameterTable> {
        let posterior: IndexMap<ParameterName, UncertainValue> = self
            .posterior
            .iter()
            .map(|(name, value)| (name, value.clone()))
            .collect();
        ParameterTable::from_bags(&self.fixed, &posterior)
    }

    // Calendar date of the social distancing changepoint, when it is a parameter of the run
    pub fn changepoint_date(&self) -> Option<NaiveDate> {
        let day = match self.posterior.get(ParameterName::LogisticX0) {
            Ok(x0) => x0.mean(),
            Err(_) => *self.fixed.get(&ParameterName::LogisticX0)?,
        };
        Some(self.start_date + Duration::days(day.round() as i64))
    }

    // Propagates the posterior from the fitted initial condition date
    pub fn forecast<U: TimeStepUpdate + Clone>(
        &self,
        model: &SeirModel<U>,
        dates: &[NaiveDate],
    ) -> Result<DerivedSeries<UncertainValue>> {
        model
            .starting(self.start_date)
            .propagate_table(dates, &self.parameters()?)
    }
}

// Engine --------------------------------------------------------------------------------------------
#[derive(Debug)]
pub struct FitEngine<'m, U> {
    model: &'m SeirModel<U>,
    offset: usize,
    zero_padding: Option<f64>,
    settings: LmSettings,
}

impl<'m, U: TimeStepUpdate + Clone> FitEngine<'m, U> {
    pub fn new(model: &'m SeirModel<U>) -> FitEngine<'m, U> {
        FitEngine {
            model,
            offset: 0,
            zero_padding: None,
            settings: LmSettings::default(),
        }
    }

    // Days between the initial condition and the first observation
    pub fn offset(mut self, days: usize) -> Self {
        self.offset = days;
        self
    }

    // Observe zero, with this sdev, on every day between the initial condition and the data
    pub fn zero_padding(mut self, sdev: f64) -> Self {
        self.zero_padding = Some(sdev);
        self
    }

    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.settings.max_iterations = iterations;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.settings.tolerance = tolerance;
        self
    }

    pub fn check_call(
        &self,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<()> {
        self.model.validate_call(data, fixed, priors)
    }

    pub fn fit(
        &self,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<FitResult> {
        self.fit_at(self.offset, data, fixed, priors, None)
    }

    // Fits starting from `initial`, one value per prior in prior order
    pub fn fit_from(
        &self,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
        initial: &[f64],
    ) -> Result<FitResult> {
        self.fit_at(self.offset, data, fixed, priors, Some(initial))
    }

    // Fits every candidate offset and keeps the one with the lowest chi2
    pub fn scan_offsets<I>(
        &self,
        offsets: I,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
    ) -> Result<FitResult>
    where
        I: IntoIterator<Item = usize>,
    {
        self.check_call(data, fixed, priors)?;
        let mut best: Option<FitResult> = None;
        for offset in offsets {
            let result = self.fit_at(offset, data, fixed, priors, None)?;
            info!(offset, chi2 = result.chi2, "offset candidate");
            if best.as_ref().map_or(true, |b| result.chi2 < b.chi2) {
                best = Some(result);
            }
        }
        best.ok_or_else(|| Error::Config("no offsets to scan".to_string()))
    }

    fn fit_at(
        &self,
        offset: usize,
        data: &FitData,
        fixed: &IndexMap<ParameterName, f64>,
        priors: &IndexMap<ParameterName, UncertainValue>,
        initial: Option<&[f64]>,
    ) -> Result<FitResult> {
        self.check_call(data, fixed, priors)?;
        let x0: Vec<f64> = match initial {
            Some(values) => {
                check_parameter_vector(priors, values)?;
                values.to_vec()
            }
            None => priors.values().map(|p| p.mean()).collect(),
        };

        let start_date = data.dates[0] - Duration::days(offset as i64);
        let data = match self.zero_padding {
            Some(sdev) => data.zero_padded(offset, sdev),
            None => data.clone(),
        };
        let model = self.model.starting(start_date);
        let metrics = data.metrics();
        let names: Vec<ParameterName> = priors.keys().copied().collect();

        let mut targets = data.observations();
        let observed = targets.len();
        targets.extend(priors.values().cloned());
        let target_means = DVector::from_iterator(targets.len(), targets.iter().map(|z| z.mean()));
        let whitening = whitening_matrix(&targets)?;

        info!(
            start = %start_date,
            offset,
            observations = observed,
            priors = names.len(),
            "fitting"
        );

        let report = optimizer::minimize(
            DVector::from_vec(x0),
            |p| {
                let (g, jacobian) =
                    model_response(&model, data.dates(), &metrics, fixed, &names, p.as_slice())?;
                Ok((&whitening * (g - &target_means), &whitening * jacobian))
            },
            &self.settings,
        )?;

        if !report.converged {
            warn!(
                iterations = report.iterations,
                chi2 = report.chi2,
                "fit did not converge"
            );
        }

        let jt = report.jacobian.transpose();
        let covariance = (&jt * &report.jacobian)
            .cholesky()
            .ok_or_else(|| Error::NotPositiveDefinite("fit normal equations".to_string()))?
            .inverse();
        // d(p_hat)/d(z): how each observation and prior moves the optimum
        let sensitivity = &covariance * &jt * &whitening;

        let posterior: ParameterSet<UncertainValue> = names
            .iter()
            .enumerate()
            .map(|(k, &name)| {
                let value = targets.iter().enumerate().fold(
                    UncertainValue::constant(report.x[k]),
                    |acc, (j, z)| match sensitivity[(k, j)] {
                        m if m == 0.0 => acc,
                        m => acc + (z - z.mean()) * m,
                    },
                );
                (name, value)
            })
            .collect();

        for (name, value) in posterior.iter() {
            debug!(parameter = %name, posterior = %value, "fitted");
        }
        info!(
            chi2 = report.chi2,
            iterations = report.iterations,
            converged = report.converged,
            "fit finished"
        );

        Ok(FitResult {
            posterior,
            fixed: fixed.clone(),
            covariance,
            chi2: report.chi2,
            dof: observed,
            iterations: report.iterations,
            converged: report.converged,
            residuals: report.residuals.iter().copied().collect(),
            offset,
            start_date,
        })
    }
}

// L^-1 for the joint covariance L L^T of the fit targets
fn whitening_matrix(targets: &[UncertainValue]) -> Result<DMatrix<f64>> {
    let n = targets.len();
    let cholesky = covariance_matrix(targets).cholesky().ok_or_else(|| {
        Error::NotPositiveDefinite(format!("{}x{} data and prior covariance", n, n))
    })?;
    cholesky
        .l()
        .solve_lower_triangular(&DMatrix::identity(n, n))
        .ok_or_else(|| Error::NotPositiveDefinite("singular Cholesky factor".to_string()))
}

// Model predictions followed by the parameters themselves, with the Jacobian
// of both against the calibrated parameters
fn model_response<U: TimeStepUpdate>(
    model: &SeirModel<U>,
    dates: &[NaiveDate],
    metrics: &[Metric],
    fixed: &IndexMap<ParameterName, f64>,
    names: &[ParameterName],
    p: &[f64],
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let probes: Vec<UncertainValue> = p.iter().map(|&v| UncertainValue::new(v, 1.0)).collect();
    let params: ParameterSet<UncertainValue> = fixed
        .iter()
        .map(|(&name, &value)| (name, UncertainValue::constant(value)))
        .chain(names.iter().copied().zip(probes.iter().cloned()))
        .collect();
    let predictions = model.fit_fcn(dates, metrics, &params)?;

    let rows = predictions.len() + names.len();
    let mut g = DVector::zeros(rows);
    let mut jacobian = DMatrix::zeros(rows, names.len());
    for (i, prediction) in predictions.iter().enumerate() {
        g[i] = prediction.mean();
        for (k, probe) in probes.iter().enumerate() {
            jacobian[(i, k)] = prediction.derivative(probe).unwrap_or(0.0);
        }
    }
    for k in 0..names.len() {
        g[predictions.len() + k] = p[k];
        jacobian[(predictions.len() + k, k)] = 1.0;
    }
    Ok((g, jacobian))
}
