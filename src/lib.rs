/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// compartment epidemic model whose parameters carry first order uncertainty,
// with hospital census post-processing, prior calibration against observed
// census and a sampled counterpart for comparison
//
////////////////////////////////////////////////////////////////////////////////////

pub mod data_management;
pub mod error;
pub mod fit;
pub mod model;
pub mod parameters;
pub mod post_process;
pub mod sampling;
pub mod uncertain;

pub use error::{Error, Result};
pub use fit::{check_call, FitData, FitEngine, FitResult};
pub use model::{date_range, CompartmentState, ModelVariant, SeirModel};
pub use parameters::{
    LogisticSocialPolicy, NoUpdate, ParameterName, ParameterSet, ParameterTable, TimeStepUpdate,
};
pub use post_process::{DerivedSeries, LengthOfStay, Metric};
pub use sampling::{compare, MonteCarlo, SampleTable, SampledSeries};
pub use uncertain::{Numeric, UncertainValue};
