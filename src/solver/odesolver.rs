use nalgebra::DVector;

use crate::cdeerror::{CdeError, CdeResult};
use crate::solver::solveroptions::SolverOptions;

/// Right-hand side `dy/dt = f(t, y)` of a first-order system.
pub type OdeRhs<'a> = dyn Fn(f64, &DVector<f64>) -> CdeResult<DVector<f64>> + 'a;

/// The step integrator consumed by the CDE layer.
///
/// Returns the state at every entry of `times`, the first being `y0` itself.
/// `times` may run forwards or backwards but must be strictly monotone.
pub trait OdeSolver {
    fn solve(
        &self,
        rhs: &OdeRhs<'_>,
        y0: &DVector<f64>,
        times: &[f64],
        options: &SolverOptions,
    ) -> CdeResult<Vec<DVector<f64>>>;
}

/// Checks the grid and returns the direction of integration (+1 or -1).
pub fn check_time_grid(times: &[f64]) -> CdeResult<f64> {
    if times.len() < 2 {
        return Err(CdeError::ConfigurationError(format!(
            "time grid needs at least 2 entries, got {}",
            times.len()
        )));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(CdeError::ConfigurationError(
            "time grid entries must be finite".to_owned(),
        ));
    }
    let direction = if times[1] > times[0] { 1.0 } else { -1.0 };
    if times
        .windows(2)
        .any(|w| (w[1] - w[0]) * direction <= 0.0)
    {
        return Err(CdeError::ConfigurationError(
            "time grid must be strictly monotone".to_owned(),
        ));
    }
    Ok(direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_the_grid() {
        assert_eq!(check_time_grid(&[0.0, 0.5, 2.0]).unwrap(), 1.0);
        assert_eq!(check_time_grid(&[2.0, 1.0]).unwrap(), -1.0);
    }

    #[test]
    fn rejects_short_or_non_monotone_grids() {
        for times in [vec![0.0], vec![0.0, 1.0, 1.0], vec![0.0, 2.0, 1.0], vec![1.0, 1.0]] {
            assert!(matches!(
                check_time_grid(&times),
                Err(CdeError::ConfigurationError(_))
            ));
        }
    }
}
