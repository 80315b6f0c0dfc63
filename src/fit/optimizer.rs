// Levenberg-Marquardt minimization of |r(x)|^2.
//
// The solver is the MINPACK port from the levenberg-marquardt crate. The
// caller supplies residuals together with their Jacobian; nothing here
// differentiates numerically.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmSettings {
    pub max_iterations: usize,
    // Relative chi2 decrease (or relative step size) below which the fit has converged
    pub tolerance: f64,
    pub step_bound: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        LmSettings {
            max_iterations: 200,
            tolerance: 1e-10,
            step_bound: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub x: DVector<f64>,
    pub residuals: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    pub chi2: f64,
    pub iterations: usize,
    pub converged: bool,
}

// Residual problem ----------------------------------------------------------------------------------
struct ResidualProblem<F> {
    x: DVector<f64>,
    residual_fn: F,
    current: Option<(DVector<f64>, DMatrix<f64>)>,
    best: (DVector<f64>, DVector<f64>, DMatrix<f64>),
    error: Option<Error>,
    evaluations: usize,
}

impl<F> ResidualProblem<F>
where
    F: FnMut(&DVector<f64>) -> Result<(DVector<f64>, DMatrix<f64>)>,
{
    fn new(x0: DVector<f64>, mut residual_fn: F) -> Result<Self> {
        let (r, j) = residual_fn(&x0)?;
        Ok(ResidualProblem {
            best: (x0.clone(), r.clone(), j.clone()),
            x: x0,
            residual_fn,
            current: Some((r, j)),
            error: None,
            evaluations: 1,
        })
    }
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for ResidualProblem<F>
where
    F: FnMut(&DVector<f64>) -> Result<(DVector<f64>, DMatrix<f64>)>,
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.x.copy_from(x);
        self.evaluations += 1;
        self.current = match (self.residual_fn)(x) {
            Ok((r, j)) => {
                let chi2 = r.norm_squared();
                debug!(evaluation = self.evaluations, chi2, "levenberg-marquardt");
                if chi2 < self.best.1.norm_squared() {
                    self.best = (x.clone(), r.clone(), j.clone());
                }
                Some((r, j))
            }
            Err(e) => {
                // keep the first failure, the solver only sees missing residuals
                self.error.get_or_insert(e);
                None
            }
        };
    }

    fn params(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.current.as_ref().map(|(r, _)| r.clone())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.current.as_ref().map(|(_, j)| j.clone())
    }
}

pub fn minimize<F>(x0: DVector<f64>, residual_fn: F, settings: &LmSettings) -> Result<LmReport>
where
    F: FnMut(&DVector<f64>) -> Result<(DVector<f64>, DMatrix<f64>)>,
{
    let tolerance = settings.tolerance.max(0.0);
    let solver = LevenbergMarquardt::new()
        .with_ftol(tolerance)
        .with_xtol(tolerance)
        .with_stepbound(settings.step_bound)
        .with_patience(settings.max_iterations.max(1));

    let problem = ResidualProblem::new(x0, residual_fn)?;
    let (problem, report) = solver.minimize(problem);
    if let Some(e) = problem.error {
        return Err(e);
    }

    let converged = report.termination.was_successful();
    debug!(
        termination = ?report.termination,
        evaluations = report.number_of_evaluations,
        "levenberg-marquardt finished"
    );

    // accepted steps only ever lower chi2, so the best evaluation is the solution
    let (x, residuals, jacobian) = problem.best;
    Ok(LmReport {
        chi2: residuals.norm_squared(),
        x,
        residuals,
        jacobian,
        iterations: report.number_of_evaluations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rosenbrock(p: &DVector<f64>) -> Result<(DVector<f64>, DMatrix<f64>)> {
        // r = (10 (y - x^2), 1 - x), minimum at (1, 1)
        let r = DVector::from_vec(vec![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]);
        let j = DMatrix::from_row_slice(2, 2, &[-20.0 * p[0], 10.0, -1.0, 0.0]);
        Ok((r, j))
    }

    #[test]
    fn test_linear_least_squares() {
        // fit y = a + b t to three exact points
        let t = [0.0, 1.0, 2.0];
        let y = [1.0, 3.0, 5.0];
        let report = minimize(
            DVector::from_vec(vec![0.0, 0.0]),
            |p| {
                let r = DVector::from_iterator(3, (0..3).map(|i| p[0] + p[1] * t[i] - y[i]));
                let j = DMatrix::from_fn(3, 2, |i, k| if k == 0 { 1.0 } else { t[i] });
                Ok((r, j))
            },
            &LmSettings::default(),
        )
        .unwrap();
        assert!(report.converged);
        assert!((report.x[0] - 1.0).abs() < 1e-6);
        assert!((report.x[1] - 2.0).abs() < 1e-6);
        assert!(report.chi2 < 1e-10);
        assert_eq!(report.jacobian.shape(), (3, 2));
    }

    #[test]
    fn test_rosenbrock_valley() {
        let report =
            minimize(DVector::from_vec(vec![-1.2, 1.0]), rosenbrock, &LmSettings::default())
                .unwrap();
        assert!(report.converged);
        assert!((report.x[0] - 1.0).abs() < 1e-5);
        assert!((report.x[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_iteration_budget_reports_non_convergence() {
        let settings = LmSettings {
            max_iterations: 1,
            ..LmSettings::default()
        };
        let report = minimize(DVector::from_vec(vec![-1.2, 1.0]), rosenbrock, &settings).unwrap();
        assert!(!report.converged);
        assert!(report.chi2.is_finite());
    }

    #[test]
    fn test_residual_error_is_propagated() {
        let err = minimize(
            DVector::from_vec(vec![1.0]),
            |p| {
                if p[0] > 1.5 {
                    return Err(Error::Config("out of range".to_string()));
                }
                let r = DVector::from_vec(vec![p[0] - 3.0]);
                Ok((r, DMatrix::from_element(1, 1, 1.0)))
            },
            &LmSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
