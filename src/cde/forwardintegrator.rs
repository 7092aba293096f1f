use nalgebra::{DMatrix, DVector};

use crate::cde::cdedynamics::CdeDynamics;
use crate::cde::sensitivity::Trajectory;
use crate::cde::vectorfield::VectorField;
use crate::cdeerror::{CdeError, CdeResult};
use crate::math::interpolation::interpolant::DifferentiablePath;
use crate::solver::odesolver::OdeSolver;
use crate::solver::solveroptions::SolverOptions;

/// Output times must be strictly increasing and lie on the path.
pub fn check_output_times<P: DifferentiablePath + ?Sized>(path: &P, times: &[f64]) -> CdeResult<()> {
    if times.len() < 2 {
        return Err(CdeError::ConfigurationError(format!(
            "output times need at least 2 entries, got {}",
            times.len()
        )));
    }
    if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(CdeError::ConfigurationError(
            "output times must be finite and strictly increasing".to_owned(),
        ));
    }
    let (start, end) = path.interval();
    if times[0] < start || times[times.len() - 1] > end {
        return Err(CdeError::DomainError(format!(
            "output times [{}, {}] exceed the path interval [{}, {}]",
            times[0],
            times[times.len() - 1],
            start,
            end
        )));
    }
    Ok(())
}

/// Solves the flat system from `y0` over `times` with the dynamics' own rhs.
pub(crate) fn solve_flat<P, F>(
    solver: &dyn OdeSolver,
    dynamics: &CdeDynamics<'_, P, F>,
    y0: &DVector<f64>,
    times: &[f64],
    options: &SolverOptions,
) -> CdeResult<Vec<DVector<f64>>>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    let rhs = |t: f64, z: &DVector<f64>| dynamics.rhs(t, z);
    solver.solve(&rhs, y0, times, options)
}

/// Integrates dz = f(t, z) dX(t) from `z0` at `times[0]` and returns the
/// state at every output time.
pub fn integrate<P, F>(
    solver: &dyn OdeSolver,
    dynamics: &CdeDynamics<'_, P, F>,
    z0: &DMatrix<f64>,
    times: &[f64],
    options: &SolverOptions,
) -> CdeResult<Trajectory>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    check_output_times(dynamics.path(), times)?;
    let y0 = dynamics.flatten_state(z0)?;
    solve_flat(solver, dynamics, &y0, times, options)?
        .iter()
        .map(|y| dynamics.unflatten_state(y))
        .collect()
}
