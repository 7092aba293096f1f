use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cde::adjoint::{AdjointContext, AdjointMethod};
use crate::cde::cdedynamics::CdeDynamics;
use crate::cde::directsensitivity::{DirectContext, DirectMethod};
use crate::cde::sensitivity::{CdeGradients, SensitivityMethod, Trajectory};
use crate::cde::vectorfield::VectorField;
use crate::cdeerror::CdeResult;
use crate::math::interpolation::interpolant::DifferentiablePath;
use crate::solver::odesolver::OdeSolver;
use crate::solver::rungekutta::RungeKuttaSolver;
use crate::solver::solveroptions::SolverOptions;

static RUNGE_KUTTA: RungeKuttaSolver = RungeKuttaSolver;

/// Options for a `cdeint` call.
///
/// `adjoint_solver` configures the backward solve of the adjoint method and
/// falls back to `solver`. `control_gradient` asks for gradients with respect
/// to the path coefficients as well.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CdeintOptions {
    pub solver: SolverOptions,
    pub adjoint_solver: Option<SolverOptions>,
    pub control_gradient: bool,
}

impl CdeintOptions {
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_adjoint_solver(mut self, solver: SolverOptions) -> Self {
        self.adjoint_solver = Some(solver);
        self
    }

    pub fn with_control_gradient(mut self, control_gradient: bool) -> Self {
        self.control_gradient = control_gradient;
        self
    }

    pub fn adjoint_options(&self) -> &SolverOptions {
        self.adjoint_solver.as_ref().unwrap_or(&self.solver)
    }

    pub fn validate(&self) -> CdeResult<()> {
        self.solver.validate()?;
        if let Some(adjoint) = &self.adjoint_solver {
            adjoint.validate()?;
        }
        Ok(())
    }
}

enum Engine<'a> {
    Adjoint(AdjointMethod<'a>, AdjointContext),
    Direct(DirectMethod<'a>, DirectContext),
}

/// The trajectory of a solve together with what its sensitivity method
/// needs for the backward pass.
pub struct CdeSolution<'a, P: ?Sized, F: ?Sized> {
    trajectory: Trajectory,
    dynamics: CdeDynamics<'a, P, F>,
    engine: Engine<'a>,
}

impl<P: ?Sized, F: ?Sized> std::fmt::Debug for CdeSolution<'_, P, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdeSolution").finish_non_exhaustive()
    }
}

impl<P, F> CdeSolution<'_, P, F>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    /// One `B × H` state per output time.
    pub fn trajectory(&self) -> &[DMatrix<f64>] {
        &self.trajectory
    }

    pub fn final_state(&self) -> &DMatrix<f64> {
        &self.trajectory[self.trajectory.len() - 1]
    }

    pub fn is_adjoint(&self) -> bool {
        matches!(self.engine, Engine::Adjoint(..))
    }

    /// Gradients of a loss given `∂L/∂z(t_i)` for every output time.
    pub fn backward(self, grad_outputs: &[DMatrix<f64>]) -> CdeResult<CdeGradients> {
        let gradients = match self.engine {
            Engine::Adjoint(method, context) => {
                method.backward(&self.dynamics, context, grad_outputs)?
            }
            Engine::Direct(method, context) => {
                method.backward(&self.dynamics, context, grad_outputs)?
            }
        };
        debug!(
            z0_norm = gradients.z0.norm(),
            parameters_norm = gradients.parameters.norm(),
            "backward pass done"
        );
        Ok(gradients)
    }
}

/// Solves dz = f(t, z) dX(t) from `z0` at `times[0]` with the built-in
/// Runge-Kutta solver.
pub fn cdeint<'a, P, F>(
    path: &'a P,
    func: &'a F,
    z0: &DMatrix<f64>,
    times: &[f64],
    adjoint: bool,
    options: &CdeintOptions,
) -> CdeResult<CdeSolution<'a, P, F>>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    cdeint_with_solver(&RUNGE_KUTTA, path, func, z0, times, adjoint, options)
}

pub fn cdeint_with_solver<'a, P, F>(
    solver: &'a dyn OdeSolver,
    path: &'a P,
    func: &'a F,
    z0: &DMatrix<f64>,
    times: &[f64],
    adjoint: bool,
    options: &CdeintOptions,
) -> CdeResult<CdeSolution<'a, P, F>>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    options.validate()?;
    let dynamics = CdeDynamics::new(path, func)?;
    info!(
        batch = dynamics.batch_size(),
        hidden = dynamics.hidden_channels(),
        outputs = times.len(),
        adjoint,
        method = ?options.solver.method,
        "cdeint"
    );

    let (trajectory, engine) = if adjoint {
        let method = AdjointMethod::new(
            solver,
            options.solver.clone(),
            options.adjoint_options().clone(),
            options.control_gradient,
        );
        let (trajectory, context) = method.run(&dynamics, z0, times)?;
        (trajectory, Engine::Adjoint(method, context))
    } else {
        let method = DirectMethod::new(solver, options.solver.clone(), options.control_gradient);
        let (trajectory, context) = method.run(&dynamics, z0, times)?;
        (trajectory, Engine::Direct(method, context))
    };

    Ok(CdeSolution {
        trajectory,
        dynamics,
        engine,
    })
}
