use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::cde::cdedynamics::CdeDynamics;
use crate::cde::forwardintegrator::{check_output_times, solve_flat};
use crate::cde::sensitivity::{CdeGradients, SensitivityMethod, Trajectory, check_grad_outputs};
use crate::cde::vectorfield::{VectorField, flatten_rows};
use crate::cdeerror::CdeResult;
use crate::math::interpolation::interpolant::DifferentiablePath;
use crate::solver::odesolver::OdeSolver;
use crate::solver::solveroptions::SolverOptions;

/// Continuous adjoint: the forward pass keeps only the output states, the
/// backward pass re-solves z alongside the adjoint system interval by interval.
pub struct AdjointMethod<'s> {
    solver: &'s dyn OdeSolver,
    options: SolverOptions,
    adjoint_options: SolverOptions,
    control_gradient: bool,
}

#[derive(Debug, Clone)]
pub struct AdjointContext {
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
}

impl<'s> AdjointMethod<'s> {
    pub fn new(
        solver: &'s dyn OdeSolver,
        options: SolverOptions,
        adjoint_options: SolverOptions,
        control_gradient: bool,
    ) -> AdjointMethod<'s> {
        AdjointMethod {
            solver,
            options,
            adjoint_options,
            control_gradient,
        }
    }
}

/// Offsets of the blocks `[z, a_z, a_θ, a_c]` in the augmented state.
struct Layout {
    state: usize,
    parameters: usize,
    control: usize,
}

impl Layout {
    fn len(&self) -> usize {
        2 * self.state + self.parameters + self.control
    }

    fn adjoint(&self) -> usize {
        self.state
    }

    fn parameters_offset(&self) -> usize {
        2 * self.state
    }

    fn control_offset(&self) -> usize {
        2 * self.state + self.parameters
    }
}

impl SensitivityMethod for AdjointMethod<'_> {
    type Context = AdjointContext;

    fn run<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        z0: &DMatrix<f64>,
        times: &[f64],
    ) -> CdeResult<(Trajectory, AdjointContext)>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized,
    {
        check_output_times(dynamics.path(), times)?;
        let y0 = dynamics.flatten_state(z0)?;
        let states = solve_flat(self.solver, dynamics, &y0, times, &self.options)?;
        let trajectory = states
            .iter()
            .map(|y| dynamics.unflatten_state(y))
            .collect::<CdeResult<Trajectory>>()?;
        Ok((
            trajectory,
            AdjointContext {
                times: times.to_vec(),
                states,
            },
        ))
    }

    fn backward<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        context: AdjointContext,
        grad_outputs: &[DMatrix<f64>],
    ) -> CdeResult<CdeGradients>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized,
    {
        let AdjointContext { times, states } = context;
        let n = times.len();
        check_grad_outputs(dynamics, grad_outputs, n)?;

        let control = self.control_gradient;
        let layout = Layout {
            state: dynamics.state_len(),
            parameters: dynamics.parameter_count(),
            control: if control {
                dynamics.batch_size() * dynamics.coefficient_count()
            } else {
                0
            },
        };

        let augmented_rhs = |t: f64, y: &DVector<f64>| -> CdeResult<DVector<f64>> {
            let z = y.rows(0, layout.state).into_owned();
            let a = y.rows(layout.adjoint(), layout.state).into_owned();
            let vjp = dynamics.vjp(t, &z, &a, control)?;
            let mut dy = DVector::zeros(layout.len());
            dy.rows_mut(0, layout.state).copy_from(&dynamics.rhs(t, &z)?);
            dy.rows_mut(layout.adjoint(), layout.state).copy_from(&(-vjp.state));
            dy.rows_mut(layout.parameters_offset(), layout.parameters)
                .copy_from(&(-vjp.parameters));
            if let Some(grad_c) = vjp.control {
                dy.rows_mut(layout.control_offset(), layout.control)
                    .copy_from(&(-flatten_rows(&grad_c)));
            }
            Ok(dy)
        };

        let mut y = DVector::zeros(layout.len());
        y.rows_mut(layout.adjoint(), layout.state)
            .copy_from(&flatten_rows(&grad_outputs[n - 1]));

        for i in (0..n - 1).rev() {
            y.rows_mut(0, layout.state).copy_from(&states[i + 1]);
            let solved = self.solver.solve(
                &augmented_rhs,
                &y,
                &[times[i + 1], times[i]],
                &self.adjoint_options,
            )?;
            y = solved[solved.len() - 1].clone();

            let drift = (&states[i] - y.rows(0, layout.state)).amax();
            debug!(interval = i, t = times[i], drift, "adjoint state reconstruction");

            let grad = flatten_rows(&grad_outputs[i]);
            let mut a_z = y.rows_mut(layout.adjoint(), layout.state);
            a_z += grad;
        }

        let a_z = y.rows(layout.adjoint(), layout.state).into_owned();
        let control = if control {
            Some(DMatrix::from_row_slice(
                dynamics.batch_size(),
                dynamics.coefficient_count(),
                &y.as_slice()[layout.control_offset()..layout.len()],
            ))
        } else {
            None
        };
        Ok(CdeGradients {
            z0: dynamics.unflatten_state(&a_z)?,
            parameters: y.rows(layout.parameters_offset(), layout.parameters).into_owned(),
            control,
        })
    }
}
