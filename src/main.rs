use std::env;
use std::fs::File;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use seir_propagate::data_management::{self, ModelDataStore, RunConfig};
use seir_propagate::{
    compare, date_range, FitEngine, LogisticSocialPolicy, MonteCarlo, ParameterTable, Result,
    SampleTable, SeirModel, TimeStepUpdate, UncertainValue,
};

fn main() {
    // log to stderr, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // process command line arguments (for now just the model root directory location)
    let args: Vec<_> = env::args().collect();
    let model_root = match args.get(1) {
        Some(root) => root,
        None => {
            error!("no model location specified");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(Path::new(model_root)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(model_root: &Path) -> Result<()> {
    // the model data store handles all model inputs and outputs
    let store = ModelDataStore::new(model_root)?;
    let config = store.get_model_parms()?;
    println!("\n--------------------SEIR propagation model-----------------------");
    print!("{}", config);

    let model = SeirModel::new(config.variant, config.start_date)
        .with_length_of_stay(config.length_of_stay);
    if config.social_policy {
        run_model(&model.with_update(LogisticSocialPolicy), &config, &store)
    } else {
        run_model(&model, &config, &store)
    }
}

fn run_model<U: TimeStepUpdate + Clone>(
    model: &SeirModel<U>,
    config: &RunConfig,
    store: &ModelDataStore,
) -> Result<()> {
    // calibrate the priors when census data is configured
    let (model, table) = match &config.fit {
        Some(fit_config) => {
            let file = File::open(store.input_path(&fit_config.data_file))?;
            let data = data_management::read_census(file, fit_config.observation_error)?;

            let mut engine = FitEngine::new(model);
            if let Some(sdev) = fit_config.zero_padding {
                engine = engine.zero_padding(sdev);
            }
            if let Some(iterations) = fit_config.max_iterations {
                engine = engine.max_iterations(iterations);
            }
            if let Some(tolerance) = fit_config.tolerance {
                engine = engine.tolerance(tolerance);
            }
            let result = match fit_config.offsets.as_slice() {
                [offset] => engine.offset(*offset).fit(&data, &config.fixed, &config.priors)?,
                offsets => engine.scan_offsets(
                    offsets.iter().copied(),
                    &data,
                    &config.fixed,
                    &config.priors,
                )?,
            };

            println!(
                "\nFit from {} (offset {} days): chi2/dof {:.3}, {} iterations{}",
                result.start_date,
                result.offset,
                result.chi2_per_dof(),
                result.iterations,
                if result.converged { "" } else { ", NOT converged" }
            );
            for (name, value) in result.display_table() {
                println!("  {:<34} {}", name, value);
            }
            if let Some(date) = result.changepoint_date() {
                println!("  {:<34} {}", "Social distancing midpoint (date)", date);
            }
            data_management::write_posterior(store.create_output("posterior.csv")?, &result)?;
            (model.starting(result.start_date), result.parameters()?)
        }
        None => (
            model.clone(),
            ParameterTable::from_bags(&config.fixed, &config.priors)?,
        ),
    };

    let dates = date_range(model.start_date(), config.horizon_days);
    let forecast = model.propagate_table::<UncertainValue>(&dates, &table)?;
    data_management::write_series(store.create_output("forecast.csv")?, &forecast)?;

    if let Some(sampling) = &config.sampling {
        let sampled = match &sampling.samples_file {
            Some(file) => {
                let samples = SampleTable::from_path(&store.input_path(file))?;
                MonteCarlo::propagate_samples(&model, &dates, &config.fixed, &samples)?
            }
            None => MonteCarlo::new(sampling.draws, sampling.seed).propagate(&model, &dates, &table)?,
        };
        let rows = compare(&forecast, &sampled)?;
        data_management::write_comparison(store.create_output("comparison.csv")?, &rows)?;
    }

    info!(days = config.horizon_days, "done");
    Ok(())
}
