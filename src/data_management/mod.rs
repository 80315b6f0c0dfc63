/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// data_management module
//
// functions to read and write from file system
//
// a model lives in its own root directory:
//      <root>/parms.yaml         run configuration
//      <root>/<data file>        observed census, one row per date
//      <root>/<samples file>     external posterior samples, one JSON object per line
//      <root>/Scenarios/         outputs, recreated on every run
//
////////////////////////////////////////////////////////////////////////////////////

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use yaml_rust::{Yaml, YamlLoader};

use crate::error::{Error, Result};
use crate::fit::{FitData, FitResult};
use crate::model::ModelVariant;
use crate::parameters::ParameterName;
use crate::post_process::{DerivedSeries, LengthOfStay, Metric};
use crate::sampling::ComparisonRow;
use crate::uncertain::{Numeric, UncertainValue};

const DATE_FORMAT: &str = "%Y-%m-%d";

// -------------------------------- File paths -------------------------------------------------------------
pub struct ModelDataStore {
    model_root: PathBuf,
    parameter_file: PathBuf,
    scenario_dir: PathBuf,
}

impl ModelDataStore {
    // file paths start at model_root
    // the scenario folder is deleted and created again
    pub fn new(model_root: &Path) -> Result<ModelDataStore> {
        info!(root = %model_root.display(), "model root");
        let parameter_file = model_root.join("parms.yaml");
        let scenario_dir = model_root.join("Scenarios");
        if !parameter_file.exists() {
            return Err(Error::Config(format!(
                "no parameter file {}",
                parameter_file.display()
            )));
        }

        if scenario_dir.exists() {
            fs::remove_dir_all(&scenario_dir)?;
        }
        fs::create_dir(&scenario_dir)?;

        Ok(ModelDataStore {
            model_root: model_root.to_path_buf(),
            parameter_file,
            scenario_dir,
        })
    }

    pub fn get_model_parms(&self) -> Result<RunConfig> {
        let text = fs::read_to_string(&self.parameter_file)?;
        RunConfig::from_yaml(&text)
    }

    // Input file named relative to the model root
    pub fn input_path(&self, file: &Path) -> PathBuf {
        self.model_root.join(file)
    }

    pub fn create_output(&self, name: &str) -> Result<File> {
        let path = self.scenario_dir.join(name);
        info!(file = %path.display(), "writing");
        Ok(File::create(path)?)
    }
}

// ----------------------------- Run configuration ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub model_name: String,
    pub model_description: String,
    pub variant: ModelVariant,
    pub start_date: NaiveDate,
    pub horizon_days: usize,
    pub social_policy: bool,
    pub length_of_stay: LengthOfStay,
    pub fixed: IndexMap<ParameterName, f64>,
    pub priors: IndexMap<ParameterName, UncertainValue>,
    pub fit: Option<FitConfig>,
    pub sampling: Option<SamplingConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitConfig {
    pub data_file: PathBuf,
    pub observation_error: ObservationError,
    // Candidate lags between the initial condition and the first observation
    pub offsets: Vec<usize>,
    pub zero_padding: Option<f64>,
    pub max_iterations: Option<usize>,
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub samples_file: Option<PathBuf>,
    pub draws: usize,
    pub seed: u64,
}

// Measurement error assumed for an observed count: relative * |count| + absolute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationError {
    pub relative: f64,
    pub absolute: f64,
}

impl Default for ObservationError {
    fn default() -> Self {
        ObservationError {
            relative: 0.1,
            absolute: 1.0,
        }
    }
}

impl ObservationError {
    pub fn observe(&self, count: f64) -> UncertainValue {
        UncertainValue::new(count, self.relative * count.abs() + self.absolute)
    }
}

// Distribution family of a prior; each is carried forward as its mean and sdev
#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PriorFamily {
    Normal,
    Uniform,
    Gamma,
}

impl fmt::Display for PriorFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for PriorFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<PriorFamily> {
        match s {
            "normal" => Ok(PriorFamily::Normal),
            "uniform" => Ok(PriorFamily::Uniform),
            "gamma" => Ok(PriorFamily::Gamma),
            _ => Err(Error::Config(format!("unknown prior distribution {}", s))),
        }
    }
}

impl PriorFamily {
    fn moments(&self, name: ParameterName, spec: &Yaml) -> Result<(f64, f64)> {
        let key = |k: &str| {
            number(&spec[k]).ok_or_else(|| {
                Error::Config(format!("YAML - Expected '{}' for {} prior", k, name))
            })
        };
        match self {
            PriorFamily::Normal => Ok((key("mean")?, key("sdev")?)),
            PriorFamily::Uniform => {
                let (low, high) = (key("low")?, key("high")?);
                Ok(((low + high) / 2.0, (high - low) / 12f64.sqrt()))
            }
            PriorFamily::Gamma => {
                let (shape, scale) = (key("shape")?, key("scale")?);
                Ok((shape * scale, shape.sqrt() * scale))
            }
        }
    }
}

// yaml-rust keeps integers and reals apart
fn number(yaml: &Yaml) -> Option<f64> {
    yaml.as_f64().or_else(|| yaml.as_i64().map(|i| i as f64))
}

fn required_str<'a>(doc: &'a Yaml, section: &str, key: &str) -> Result<&'a str> {
    doc[section][key]
        .as_str()
        .ok_or_else(|| Error::Config(format!("YAML - Expected '{}' in '{}'", key, section)))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| Error::InvalidDates(format!("{}: {}", s, e)))
}

impl RunConfig {
    pub fn from_yaml(text: &str) -> Result<RunConfig> {
        // the loader creates an array of yaml documents, only the first one interests us
        let docs = YamlLoader::load_from_str(text)?;
        let doc = docs
            .first()
            .ok_or_else(|| Error::Config("empty parameter file".to_string()))?;

        let model_name = doc["model_name"].as_str().unwrap_or("unnamed").to_string();
        let model_description = doc["model_description"].as_str().unwrap_or("").to_string();

        // parse - model parms ---------------------------------------------------
        let mp_key = "model_parms";
        let variant: ModelVariant = required_str(doc, mp_key, "variant")?.parse()?;
        let start_date = parse_date(required_str(doc, mp_key, "start_date")?)?;
        let horizon_days = doc[mp_key]["horizon_days"]
            .as_i64()
            .filter(|&d| d > 0)
            .ok_or_else(|| {
                Error::Config("YAML - Expected positive 'horizon_days' in 'model_parms'".to_string())
            })? as usize;
        let social_policy = doc[mp_key]["social_policy"].as_bool().unwrap_or(false);
        let length_of_stay = match doc[mp_key]["length_of_stay"].as_str() {
            Some(kernel) => kernel.parse()?,
            None => LengthOfStay::default(),
        };

        // parse - fixed parms ---------------------------------------------------
        let mut fixed = IndexMap::new();
        if let Some(hash) = doc["fixed_parms"].as_hash() {
            for (key, value) in hash {
                let name = parameter_key(key)?;
                let value = number(value).ok_or_else(|| {
                    Error::Config(format!("YAML - Expected a number for fixed {}", name))
                })?;
                fixed.insert(name, value);
            }
        }

        // parse - priors --------------------------------------------------------
        let mut priors = IndexMap::new();
        if let Some(hash) = doc["priors"].as_hash() {
            for (key, spec) in hash {
                let name = parameter_key(key)?;
                let family: PriorFamily = spec["dist"].as_str().unwrap_or("normal").parse()?;
                let (mean, sdev) = family.moments(name, spec)?;
                if priors
                    .insert(name, UncertainValue::new(mean, sdev))
                    .is_some()
                {
                    return Err(Error::DuplicateParameter(name));
                }
            }
        }
        if let Some(name) = priors.keys().find(|n| fixed.contains_key(*n)) {
            return Err(Error::DuplicateParameter(*name));
        }

        // parse - fit parms -----------------------------------------------------
        let fp_key = "fit_parms";
        let fit = if doc[fp_key].is_badvalue() {
            None
        } else {
            let data_file = PathBuf::from(required_str(doc, fp_key, "data_file")?);
            let defaults = ObservationError::default();
            let observation_error = ObservationError {
                relative: number(&doc[fp_key]["relative_error"]).unwrap_or(defaults.relative),
                absolute: number(&doc[fp_key]["absolute_error"]).unwrap_or(defaults.absolute),
            };
            let offsets = match doc[fp_key]["offsets"].as_vec() {
                Some(values) => values
                    .iter()
                    .map(|v| {
                        v.as_i64().filter(|&d| d >= 0).map(|d| d as usize).ok_or_else(|| {
                            Error::Config("YAML - 'offsets' must be whole days".to_string())
                        })
                    })
                    .collect::<Result<Vec<usize>>>()?,
                None => vec![doc[fp_key]["offset"].as_i64().unwrap_or(0).max(0) as usize],
            };
            Some(FitConfig {
                data_file,
                observation_error,
                offsets,
                zero_padding: number(&doc[fp_key]["zero_padding_sdev"]),
                max_iterations: doc[fp_key]["max_iterations"].as_i64().map(|i| i.max(1) as usize),
                tolerance: number(&doc[fp_key]["tolerance"]),
            })
        };

        // parse - sampling parms ------------------------------------------------
        let sp_key = "sampling_parms";
        let sampling = if doc[sp_key].is_badvalue() {
            None
        } else {
            Some(SamplingConfig {
                samples_file: doc[sp_key]["samples_file"].as_str().map(PathBuf::from),
                draws: doc[sp_key]["draws"].as_i64().unwrap_or(1000).max(2) as usize,
                seed: doc[sp_key]["seed"].as_i64().unwrap_or(1) as u64,
            })
        };

        Ok(RunConfig {
            model_name,
            model_description,
            variant,
            start_date,
            horizon_days,
            social_policy,
            length_of_stay,
            fixed,
            priors,
            fit,
            sampling,
        })
    }
}

fn parameter_key(key: &Yaml) -> Result<ParameterName> {
    key.as_str()
        .ok_or_else(|| Error::Config("YAML - parameter names must be strings".to_string()))?
        .parse()
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Model name {}", self.model_name)?;
        writeln!(f, "Model description {}", self.model_description)?;
        writeln!(
            f,
            "{} model from {} over {} days{}",
            self.variant,
            self.start_date,
            self.horizon_days,
            if self.social_policy {
                " with social distancing"
            } else {
                ""
            }
        )?;
        for (name, value) in &self.priors {
            writeln!(f, "  {:<34} {}", name.display_name(), value)?;
        }
        Ok(())
    }
}

// ----------------------------- Observed data -------------------------------------------------------------
// Census table: a `date` column then one column per observed metric
pub fn read_census<R: io::Read>(reader: R, error: ObservationError) -> Result<FitData> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let date_column = headers
        .iter()
        .position(|h| h.trim() == "date")
        .ok_or_else(|| Error::Config("census file has no 'date' column".to_string()))?;
    let metrics: Vec<(usize, Metric)> = headers
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != date_column)
        .map(|(i, h)| -> Result<(usize, Metric)> { Ok((i, h.parse()?)) })
        .collect::<Result<_>>()?;

    let mut dates = Vec::new();
    let mut columns: Vec<Vec<UncertainValue>> = vec![Vec::new(); metrics.len()];
    for record in rdr.records() {
        let record = record?;
        dates.push(parse_date(&record[date_column])?);
        for (column, &(i, metric)) in columns.iter_mut().zip(&metrics) {
            let count: f64 = record[i].trim().parse().map_err(|_| {
                Error::Config(format!(
                    "bad {} count '{}' on {}",
                    metric,
                    &record[i],
                    &record[date_column]
                ))
            })?;
            column.push(error.observe(count));
        }
    }

    let mut data = FitData::new(dates);
    for ((_, metric), column) in metrics.into_iter().zip(columns) {
        data.insert(metric, column);
    }
    Ok(data)
}

// ----------------------------- Output model results ------------------------------------------------------
// One row per date, `<metric>_mean` and `<metric>_sdev` per metric
pub fn write_series<T: Numeric, W: io::Write>(writer: W, series: &DerivedSeries<T>) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    let metrics: Vec<Metric> = series.metrics().collect();

    let mut header = vec!["date".to_string()];
    for metric in &metrics {
        header.push(format!("{}_mean", metric));
        header.push(format!("{}_sdev", metric));
    }
    wtr.write_record(&header)?;

    for (i, date) in series.dates().iter().enumerate() {
        let mut record = vec![date.format(DATE_FORMAT).to_string()];
        for &metric in &metrics {
            if let Some(column) = series.column(metric) {
                record.push(format!("{:.6}", column[i].mean()));
                record.push(format!("{:.6}", column[i].sdev()));
            }
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_comparison<W: io::Write>(writer: W, rows: &[ComparisonRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct PosteriorRow<'a> {
    parameter: &'a str,
    display_name: &'a str,
    mean: f64,
    sdev: f64,
}

// Posterior parameters, then the fit statistics as pseudo parameters
pub fn write_posterior<W: io::Write>(writer: W, result: &FitResult) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for (name, value) in result.posterior.iter() {
        wtr.serialize(PosteriorRow {
            parameter: name.fit_name(),
            display_name: name.display_name(),
            mean: value.mean(),
            sdev: value.sdev(),
        })?;
    }
    let statistics = [
        ("chi2", "Chi square", result.chi2),
        ("chi2_per_dof", "Chi square per degree of freedom", result.chi2_per_dof()),
        ("offset", "Days before first observation", result.offset as f64),
    ];
    for (parameter, display_name, mean) in statistics {
        wtr.serialize(PosteriorRow {
            parameter,
            display_name,
            mean,
            sdev: 0.0,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::date_range;

    const PARMS: &str = r#"
model_name: "Test region"
model_description: "two week check"
model_parms:
  variant: seir
  start_date: 2020-03-01
  horizon_days: 14
  social_policy: true
  length_of_stay: exponential
fixed_parms:
  population: 1000000
  initial_exposed: 100
  market_share: 0.15
priors:
  beta:
    mean: 0.3
    sdev: 0.02
  recovery_days:
    dist: uniform
    low: 10
    high: 16
  incubation_days:
    dist: gamma
    shape: 25
    scale: 0.2
fit_parms:
  data_file: census.csv
  offsets: [0, 5, 10]
  zero_padding_sdev: 1.0
  relative_error: 0.2
sampling_parms:
  draws: 200
  seed: 9
"#;

    #[test]
    fn test_parse_run_config() {
        let config = RunConfig::from_yaml(PARMS).unwrap();
        assert_eq!(config.model_name, "Test region");
        assert_eq!(config.variant, ModelVariant::Seir);
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2020, 3, 1).unwrap());
        assert_eq!(config.horizon_days, 14);
        assert!(config.social_policy);
        assert_eq!(config.length_of_stay, LengthOfStay::Exponential);
        assert_eq!(config.fixed[&ParameterName::Population], 1_000_000.0);

        let recovery = &config.priors[&ParameterName::RecoveryDays];
        assert!((recovery.mean() - 13.0).abs() < 1e-12);
        assert!((recovery.sdev() - 6.0 / 12f64.sqrt()).abs() < 1e-12);
        let incubation = &config.priors[&ParameterName::IncubationDays];
        assert!((incubation.mean() - 5.0).abs() < 1e-12);
        assert!((incubation.sdev() - 1.0).abs() < 1e-12);

        let fit = config.fit.unwrap();
        assert_eq!(fit.offsets, vec![0, 5, 10]);
        assert_eq!(fit.zero_padding, Some(1.0));
        assert_eq!(fit.observation_error.relative, 0.2);
        assert_eq!(fit.observation_error.absolute, 1.0);
        assert_eq!(fit.max_iterations, None);

        let sampling = config.sampling.unwrap();
        assert_eq!((sampling.draws, sampling.seed), (200, 9));
        assert!(sampling.samples_file.is_none());
    }

    #[test]
    fn test_config_errors_name_the_problem() {
        let err = RunConfig::from_yaml("model_parms:\n  variant: seir\n").unwrap_err();
        assert!(err.to_string().contains("start_date"));

        let unknown = PARMS.replace("market_share", "market_size");
        let err = RunConfig::from_yaml(&unknown).unwrap_err();
        assert!(matches!(err, Error::UnknownParameter(ref s) if s == "market_size"));

        let twice = PARMS.replace("market_share: 0.15", "beta: 0.3");
        let err = RunConfig::from_yaml(&twice).unwrap_err();
        assert!(matches!(err, Error::DuplicateParameter(ParameterName::Beta)));

        let bad_family = PARMS.replace("dist: gamma", "dist: cauchy");
        assert!(RunConfig::from_yaml(&bad_family).is_err());
    }

    #[test]
    fn test_read_census() {
        let csv = "date,hospital_census,vent_census\n\
                   2020-03-10,4,1\n\
                   2020-03-11,6,1\n\
                   2020-03-12,9,2\n";
        let error = ObservationError {
            relative: 0.1,
            absolute: 1.0,
        };
        let data = read_census(csv.as_bytes(), error).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.metrics(), vec![Metric::HospitalCensus, Metric::VentCensus]);
        let census = data.column(Metric::HospitalCensus).unwrap();
        assert_eq!(census[2].mean(), 9.0);
        assert!((census[2].sdev() - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_read_census_rejects_bad_rows() {
        let csv = "date,hospital_census\n2020-03-10,four\n";
        assert!(matches!(
            read_census(csv.as_bytes(), ObservationError::default()),
            Err(Error::Config(_))
        ));
        let csv = "when,hospital_census\n2020-03-10,4\n";
        assert!(read_census(csv.as_bytes(), ObservationError::default()).is_err());
        let csv = "date,hospital_census\n03/10/2020,4\n";
        assert!(matches!(
            read_census(csv.as_bytes(), ObservationError::default()),
            Err(Error::InvalidDates(_))
        ));
    }

    #[test]
    fn test_write_series() {
        let dates = date_range(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(), 2);
        let mut series = DerivedSeries::new(dates);
        series
            .insert(
                Metric::HospitalCensus,
                vec![UncertainValue::new(1.0, 0.5), UncertainValue::new(2.0, 0.25)],
            )
            .unwrap();
        let mut out = Vec::new();
        write_series(&mut out, &series).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "date,hospital_census_mean,hospital_census_sdev");
        assert_eq!(lines[1], "2020-03-01,1.000000,0.500000");
        assert_eq!(lines[2], "2020-03-02,2.000000,0.250000");
    }
}
