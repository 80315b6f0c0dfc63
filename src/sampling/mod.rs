/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// sampling module
//
// the sampled counterpart of the uncertain run: the scalar model is run once per
// parameter draw and the outputs are summarized per metric and date
//
// draws come either from the uncertain parameters themselves (Monte Carlo) or
// from an external posterior sample file, one JSON object per line
//
// both pipelines are kept apart from the first order one so that differences
// between them can be reported rather than averaged away
//
////////////////////////////////////////////////////////////////////////////////////

use chrono::NaiveDate;
use indexmap::IndexMap;
use rand::prelude::*;
use rand_distr::{Distribution, StandardNormal};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::SeirModel;
use crate::parameters::{ParameterName, ParameterSet, ParameterTable, ParameterValue, TimeStepUpdate};
use crate::post_process::{DerivedSeries, Metric};
use crate::uncertain::{RootId, UncertainValue};

// Sample table --------------------------------------------------------------------------------------
/// Raw posterior samples, one row per draw.
///
/// Only numeric fields are kept; anything else on a line is ignored.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    rows: Vec<IndexMap<String, f64>>,
}

impl SampleTable {
    pub fn from_jsonl<R: BufRead>(reader: R) -> Result<SampleTable> {
        let mut rows = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let object = match serde_json::from_str::<Value>(&line)? {
                Value::Object(object) => object,
                _ => {
                    return Err(Error::Config(format!(
                        "sample line {} is not a JSON object",
                        number + 1
                    )))
                }
            };
            let row = object
                .iter()
                .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
                .collect();
            rows.push(row);
        }
        Ok(SampleTable { rows })
    }

    pub fn from_path(path: &Path) -> Result<SampleTable> {
        let file = File::open(path)?;
        SampleTable::from_jsonl(BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.get(name).copied()).collect()
    }

    // Sample mean and sample standard deviation of a parameter column
    pub fn summary(&self, name: ParameterName) -> Result<UncertainValue> {
        let values = self.parameter_column(name)?;
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Ok(UncertainValue::new(mean, variance.sqrt()))
    }

    // Median and half width of the central 68% interval
    pub fn median_spread(&self, name: ParameterName) -> Result<(f64, f64)> {
        let mut values = self.parameter_column(name)?;
        values.sort_by(|a, b| a.total_cmp(b));
        let median = quantile(&values, 0.5);
        let spread = (quantile(&values, 0.841_344_746) - quantile(&values, 0.158_655_254)) / 2.0;
        Ok((median, spread))
    }

    /// Summaries of every column that names a parameter.
    ///
    /// The summaries are independent of each other: correlations between
    /// columns are not carried over.
    pub fn summaries(&self) -> Result<IndexMap<ParameterName, UncertainValue>> {
        let mut out = IndexMap::new();
        for name in ParameterName::ALL {
            if self.rows.iter().any(|r| r.contains_key(name.fit_name())) {
                out.insert(name, self.summary(name)?);
            }
        }
        Ok(out)
    }

    fn parameter_column(&self, name: ParameterName) -> Result<Vec<f64>> {
        let values = self.column(name.fit_name());
        if values.is_empty() {
            return Err(Error::MissingParameter(name));
        }
        if values.len() < 2 {
            return Err(Error::Config(format!(
                "{} has a single sample, no spread can be estimated",
                name
            )));
        }
        Ok(values)
    }
}

// linear interpolation between order statistics
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

// Sampled series ------------------------------------------------------------------------------------
// Per metric, per date sample mean and standard deviation
#[derive(Debug, Clone)]
pub struct SampledSeries {
    dates: Vec<NaiveDate>,
    draws: usize,
    means: IndexMap<Metric, Vec<f64>>,
    sdevs: IndexMap<Metric, Vec<f64>>,
}

impl SampledSeries {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn draws(&self) -> usize {
        self.draws
    }

    pub fn means(&self, metric: Metric) -> Option<&[f64]> {
        self.means.get(&metric).map(|c| c.as_slice())
    }

    pub fn sdevs(&self, metric: Metric) -> Option<&[f64]> {
        self.sdevs.get(&metric).map(|c| c.as_slice())
    }

    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        self.means.keys().copied()
    }
}

// Welford running moments, one accumulator per metric and date
struct Moments {
    dates: Vec<NaiveDate>,
    count: usize,
    mean: IndexMap<Metric, Vec<f64>>,
    m2: IndexMap<Metric, Vec<f64>>,
    degenerate: usize,
}

impl Moments {
    fn new(dates: &[NaiveDate]) -> Moments {
        Moments {
            dates: dates.to_vec(),
            count: 0,
            mean: IndexMap::new(),
            m2: IndexMap::new(),
            degenerate: 0,
        }
    }

    fn push(&mut self, series: &DerivedSeries<f64>) {
        self.count += 1;
        let n = self.count as f64;
        let mut finite = true;
        for metric in series.metrics() {
            let column = match series.column(metric) {
                Some(column) => column,
                None => continue,
            };
            let len = column.len();
            let mean = self.mean.entry(metric).or_insert_with(|| vec![0.0; len]);
            let m2 = self.m2.entry(metric).or_insert_with(|| vec![0.0; len]);
            for (i, &x) in column.iter().enumerate() {
                finite &= x.is_finite();
                let delta = x - mean[i];
                mean[i] += delta / n;
                m2[i] += delta * (x - mean[i]);
            }
        }
        if !finite {
            self.degenerate += 1;
        }
    }

    fn finish(self) -> SampledSeries {
        if self.degenerate > 0 {
            warn!(
                draws = self.degenerate,
                "draws produced non-finite metrics"
            );
        }
        let denominator = (self.count.max(2) - 1) as f64;
        let sdevs = self
            .m2
            .iter()
            .map(|(&metric, m2)| (metric, m2.iter().map(|v| (v / denominator).sqrt()).collect()))
            .collect();
        SampledSeries {
            dates: self.dates,
            draws: self.count,
            means: self.mean,
            sdevs,
        }
    }
}

// Monte Carlo ---------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonteCarlo {
    pub draws: usize,
    pub seed: u64,
}

impl Default for MonteCarlo {
    fn default() -> Self {
        MonteCarlo {
            draws: 1000,
            seed: 1,
        }
    }
}

// A table parameter in sampling form: its mean plus (root index, coefficient) pairs
struct LinearForm {
    name: ParameterName,
    mean: f64,
    terms: Vec<(usize, f64)>,
}

impl MonteCarlo {
    pub fn new(draws: usize, seed: u64) -> MonteCarlo {
        MonteCarlo { draws, seed }
    }

    // Runs the scalar model over jointly normal draws of the table's uncertain
    // parameters, honoring their correlations
    pub fn propagate<U: TimeStepUpdate>(
        &self,
        model: &SeirModel<U>,
        dates: &[NaiveDate],
        table: &ParameterTable,
    ) -> Result<SampledSeries> {
        if self.draws < 2 {
            return Err(Error::Config(format!(
                "Monte Carlo needs at least 2 draws, got {}",
                self.draws
            )));
        }
        table.validate(&model.required_parameters())?;
        let (roots, forms) = linear_forms(table);
        info!(
            draws = self.draws,
            seed = self.seed,
            sources = roots.len(),
            "Monte Carlo propagation"
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut moments = Moments::new(dates);
        let mut z = vec![0.0; roots.len()];
        for _ in 0..self.draws {
            for zi in z.iter_mut() {
                *zi = StandardNormal.sample(&mut rng);
            }
            let params: ParameterSet<f64> = forms
                .iter()
                .map(|f| (f.name, f.mean + f.terms.iter().map(|&(i, c)| c * z[i]).sum::<f64>()))
                .collect();
            moments.push(&model.propagate(dates, &params)?);
        }
        Ok(moments.finish())
    }

    // Runs the scalar model once per row of an external sample table
    pub fn propagate_samples<U: TimeStepUpdate>(
        model: &SeirModel<U>,
        dates: &[NaiveDate],
        fixed: &IndexMap<ParameterName, f64>,
        samples: &SampleTable,
    ) -> Result<SampledSeries> {
        if samples.len() < 2 {
            return Err(Error::Config(format!(
                "sample table has {} rows, need at least 2",
                samples.len()
            )));
        }
        info!(rows = samples.len(), "propagating posterior samples");

        let mut moments = Moments::new(dates);
        for row in &samples.rows {
            let mut params: ParameterSet<f64> = fixed.iter().map(|(&n, &v)| (n, v)).collect();
            for (key, &value) in row {
                if let Ok(name) = key.parse::<ParameterName>() {
                    if fixed.contains_key(&name) {
                        return Err(Error::DuplicateParameter(name));
                    }
                    params = params.with(name, value);
                }
            }
            moments.push(&model.propagate(dates, &params)?);
        }
        Ok(moments.finish())
    }
}

fn linear_forms(table: &ParameterTable) -> (Vec<RootId>, Vec<LinearForm>) {
    let mut roots: Vec<RootId> = table
        .iter()
        .filter_map(|p| match &p.value {
            ParameterValue::Uncertain(v) => Some(v.roots()),
            ParameterValue::Fixed(_) => None,
        })
        .flatten()
        .collect();
    roots.sort();
    roots.dedup();

    let forms = table
        .iter()
        .map(|p| match &p.value {
            ParameterValue::Fixed(v) => LinearForm {
                name: p.name,
                mean: *v,
                terms: Vec::new(),
            },
            ParameterValue::Uncertain(v) => LinearForm {
                name: p.name,
                mean: v.mean(),
                terms: v
                    .roots()
                    .filter_map(|r| roots.binary_search(&r).ok().map(|i| (i, v.coefficient(r))))
                    .collect(),
            },
        })
        .collect();
    (roots, forms)
}

// Comparison ----------------------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    pub date: NaiveDate,
    pub metric: String,
    pub analytic_mean: f64,
    pub analytic_sdev: f64,
    pub sampled_mean: f64,
    pub sampled_sdev: f64,
    pub mean_difference: f64,
    pub sdev_ratio: f64,
}

// Side by side first order and sampled summaries for every metric both carry
pub fn compare(
    analytic: &DerivedSeries<UncertainValue>,
    sampled: &SampledSeries,
) -> Result<Vec<ComparisonRow>> {
    if analytic.dates() != sampled.dates() {
        return Err(Error::shape(
            "comparison dates",
            analytic.len(),
            sampled.dates().len(),
        ));
    }
    let mut rows = Vec::new();
    for metric in analytic.metrics() {
        let (column, means, sdevs) = match (
            analytic.column(metric),
            sampled.means(metric),
            sampled.sdevs(metric),
        ) {
            (Some(c), Some(m), Some(s)) => (c, m, s),
            _ => continue,
        };
        for (i, value) in column.iter().enumerate() {
            rows.push(ComparisonRow {
                date: analytic.dates()[i],
                metric: metric.name().to_string(),
                analytic_mean: value.mean(),
                analytic_sdev: value.sdev(),
                sampled_mean: means[i],
                sampled_sdev: sdevs[i],
                mean_difference: value.mean() - means[i],
                sdev_ratio: value.sdev() / sdevs[i],
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{date_range, ModelVariant};
    use crate::parameters::{Parameter, Role};

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()
    }

    fn fixed() -> IndexMap<ParameterName, f64> {
        use ParameterName::*;
        [
            (Population, 1_000_000.0),
            (InitialExposed, 100.0),
            (InitialInfected, 0.0),
            (InitialRecovered, 0.0),
            (IncubationDays, 5.0),
            (RecoveryDays, 14.0),
            (MarketShare, 0.15),
            (HospitalProbability, 0.025),
            (HospitalLengthOfStay, 7.0),
            (IcuProbability, 0.0075),
            (IcuLengthOfStay, 9.0),
            (VentProbability, 0.005),
            (VentLengthOfStay, 10.0),
        ]
        .into_iter()
        .collect()
    }

    fn table(beta: UncertainValue) -> ParameterTable {
        let variable = [(ParameterName::Beta, beta)].into_iter().collect();
        ParameterTable::from_bags(&fixed(), &variable).unwrap()
    }

    const SAMPLES: &str = r#"{"beta": 0.29, "recovery_days": 13.0, "chain": "a"}
{"beta": 0.31, "recovery_days": 15.0, "chain": "a"}

{"beta": 0.30, "recovery_days": 14.0, "chain": "b"}
{"beta": 0.32, "recovery_days": 16.0, "lp": -3.5}
"#;

    #[test]
    fn test_sample_table_parses_numeric_fields() {
        let samples = SampleTable::from_jsonl(SAMPLES.as_bytes()).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.column("beta").len(), 4);
        assert_eq!(samples.column("chain").len(), 0);
        assert_eq!(samples.column("lp"), vec![-3.5]);

        let beta = samples.summary(ParameterName::Beta).unwrap();
        assert!((beta.mean() - 0.305).abs() < 1e-12);
        // sample sdev of 0.29, 0.31, 0.30, 0.32
        assert!((beta.sdev() - 0.012_909_944).abs() < 1e-8);

        let summaries = samples.summaries().unwrap();
        let names: Vec<_> = summaries.keys().copied().collect();
        assert_eq!(names, vec![ParameterName::Beta, ParameterName::RecoveryDays]);
    }

    #[test]
    fn test_sample_table_rejects_non_objects() {
        let err = SampleTable::from_jsonl("[1, 2]\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = SampleTable::from_jsonl("{not json\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_median_spread() {
        let lines: String = (1..=101)
            .map(|i| format!("{{\"beta\": {}}}\n", i))
            .collect();
        let samples = SampleTable::from_jsonl(lines.as_bytes()).unwrap();
        let (median, spread) = samples.median_spread(ParameterName::Beta).unwrap();
        assert_eq!(median, 51.0);
        // (q84 - q16) / 2 over 1..=101
        assert!((spread - 34.134_474_6).abs() < 1e-6);
        assert!(matches!(
            samples.median_spread(ParameterName::RecoveryDays),
            Err(Error::MissingParameter(ParameterName::RecoveryDays))
        ));
    }

    #[test]
    fn test_monte_carlo_is_seeded() {
        let model = SeirModel::new(ModelVariant::Seir, start());
        let dates = date_range(start(), 30);
        let table = table(UncertainValue::new(0.3, 0.02));
        let mc = MonteCarlo::new(50, 7);
        let a = mc.propagate(&model, &dates, &table).unwrap();
        let b = mc.propagate(&model, &dates, &table).unwrap();
        assert_eq!(a.draws(), 50);
        assert_eq!(
            a.means(Metric::HospitalCensus),
            b.means(Metric::HospitalCensus)
        );
        assert_eq!(
            a.sdevs(Metric::HospitalCensus),
            b.sdevs(Metric::HospitalCensus)
        );
    }

    #[test]
    fn test_monte_carlo_agrees_with_first_order_for_small_spread() {
        let model = SeirModel::new(ModelVariant::Seir, start());
        let dates = date_range(start(), 30);
        let table = table(UncertainValue::new(0.3, 0.002));
        let analytic = model.propagate_table::<UncertainValue>(&dates, &table).unwrap();
        let sampled = MonteCarlo::new(2000, 11)
            .propagate(&model, &dates, &table)
            .unwrap();

        let rows = compare(&analytic, &sampled).unwrap();
        let last = rows
            .iter()
            .filter(|r| r.metric == "cumulative_infected")
            .last()
            .unwrap();
        assert!(last.mean_difference.abs() < 0.02 * last.analytic_mean);
        assert!((last.sdev_ratio - 1.0).abs() < 0.1, "ratio {}", last.sdev_ratio);
    }

    #[test]
    fn test_correlated_parameters_are_drawn_jointly() {
        let covariance = nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 0.8, 0.8, 1.0]);
        let values = UncertainValue::correlated(&[0.0, 0.0], &covariance).unwrap();
        let mut table = ParameterTable::new();
        for (name, value) in [ParameterName::LogisticL, ParameterName::LogisticK]
            .into_iter()
            .zip(values)
        {
            table
                .insert(Parameter {
                    name,
                    value: ParameterValue::Uncertain(value),
                    role: Role::Calibrated,
                })
                .unwrap();
        }
        let (roots, forms) = linear_forms(&table);
        assert_eq!(roots.len(), 2);

        let mut rng = StdRng::seed_from_u64(3);
        let n = 20_000;
        let mut sum_xy = 0.0;
        for _ in 0..n {
            let z: Vec<f64> = (0..roots.len()).map(|_| StandardNormal.sample(&mut rng)).collect();
            let draw: Vec<f64> = forms
                .iter()
                .map(|f| f.mean + f.terms.iter().map(|&(i, c)| c * z[i]).sum::<f64>())
                .collect();
            sum_xy += draw[0] * draw[1];
        }
        assert!((sum_xy / n as f64 - 0.8).abs() < 0.05);
    }

    #[test]
    fn test_propagate_samples_requires_every_parameter() {
        let model = SeirModel::new(ModelVariant::Seir, start());
        let dates = date_range(start(), 10);
        let samples = SampleTable::from_jsonl(SAMPLES.as_bytes()).unwrap();

        let mut without_recovery = fixed();
        without_recovery.shift_remove(&ParameterName::RecoveryDays);
        let sampled =
            MonteCarlo::propagate_samples(&model, &dates, &without_recovery, &samples).unwrap();
        assert_eq!(sampled.draws(), 4);

        let mut without_incubation = without_recovery.clone();
        without_incubation.shift_remove(&ParameterName::IncubationDays);
        let err = MonteCarlo::propagate_samples(&model, &dates, &without_incubation, &samples)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingParameter(ParameterName::IncubationDays)
        ));

        let err = MonteCarlo::propagate_samples(&model, &dates, &fixed(), &samples).unwrap_err();
        assert!(matches!(err, Error::DuplicateParameter(_)));
    }

    #[test]
    fn test_compare_requires_matching_dates() {
        let model = SeirModel::new(ModelVariant::Seir, start());
        let table = table(UncertainValue::new(0.3, 0.02));
        let analytic = model
            .propagate_table::<UncertainValue>(&date_range(start(), 10), &table)
            .unwrap();
        let sampled = MonteCarlo::new(10, 1)
            .propagate(&model, &date_range(start(), 5), &table)
            .unwrap();
        assert!(matches!(
            compare(&analytic, &sampled),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
