use nalgebra::{DMatrix, DVector};

use crate::cde::cdedynamics::CdeDynamics;
use crate::cde::forwardintegrator::check_output_times;
use crate::cde::sensitivity::{CdeGradients, SensitivityMethod, Trajectory, check_grad_outputs};
use crate::cde::vectorfield::{VectorField, flatten_rows};
use crate::cdeerror::CdeResult;
use crate::math::interpolation::interpolant::DifferentiablePath;
use crate::solver::odesolver::OdeSolver;
use crate::solver::solveroptions::SolverOptions;

/// Forward sensitivities: integrates `∂z/∂z0`, `∂z/∂θ` and optionally
/// `∂z/∂c` next to z, then contracts them with the output gradients.
///
/// Per batch element the sensitivities obey
///
/// ```text
/// dS/dt = J S           S(t0) = I
/// dP/dt = J P + ∂g/∂θ   P(t0) = 0
/// dQ/dt = J Q + f ∂X'/∂c  Q(t0) = 0
/// ```
///
/// with `J = ∂g/∂z`. Every output time keeps a copy of them.
pub struct DirectMethod<'s> {
    solver: &'s dyn OdeSolver,
    options: SolverOptions,
    control_gradient: bool,
}

#[derive(Debug, Clone)]
pub struct DirectContext {
    states: Vec<DVector<f64>>,
}

impl<'s> DirectMethod<'s> {
    pub fn new(
        solver: &'s dyn OdeSolver,
        options: SolverOptions,
        control_gradient: bool,
    ) -> DirectMethod<'s> {
        DirectMethod {
            solver,
            options,
            control_gradient,
        }
    }
}

/// `[z | S_0 P_0 Q_0 | S_1 P_1 Q_1 | …]`, each block row-major.
struct Layout {
    batch: usize,
    hidden: usize,
    parameters: usize,
    control: usize,
}

impl Layout {
    fn state_len(&self) -> usize {
        self.batch * self.hidden
    }

    fn block_len(&self) -> usize {
        self.hidden * (self.hidden + self.parameters + self.control)
    }

    fn len(&self) -> usize {
        self.state_len() + self.batch * self.block_len()
    }

    /// Offsets of S_b, P_b and Q_b.
    fn offsets(&self, b: usize) -> (usize, usize, usize) {
        let s = self.state_len() + b * self.block_len();
        let p = s + self.hidden * self.hidden;
        (s, p, p + self.hidden * self.parameters)
    }

    fn matrix(&self, y: &DVector<f64>, offset: usize, cols: usize) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            self.hidden,
            cols,
            &y.as_slice()[offset..offset + self.hidden * cols],
        )
    }
}

fn write_block(y: &mut DVector<f64>, offset: usize, m: &DMatrix<f64>) {
    y.rows_mut(offset, m.len()).copy_from(&flatten_rows(m));
}

impl SensitivityMethod for DirectMethod<'_> {
    type Context = DirectContext;

    fn run<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        z0: &DMatrix<f64>,
        times: &[f64],
    ) -> CdeResult<(Trajectory, DirectContext)>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized,
    {
        check_output_times(dynamics.path(), times)?;
        let control = self.control_gradient;
        let layout = layout_for(dynamics, control);

        let mut y0 = DVector::zeros(layout.len());
        y0.rows_mut(0, layout.state_len())
            .copy_from(&dynamics.flatten_state(z0)?);
        let identity = DMatrix::identity(layout.hidden, layout.hidden);
        for b in 0..layout.batch {
            write_block(&mut y0, layout.offsets(b).0, &identity);
        }

        let rhs = |t: f64, y: &DVector<f64>| -> CdeResult<DVector<f64>> {
            let z = y.rows(0, layout.state_len()).into_owned();
            let jacobians = dynamics.jacobians(t, &z)?;
            let control_jacobians = if control {
                dynamics.control_jacobians(t)?
            } else {
                Vec::new()
            };

            let mut dy = DVector::zeros(layout.len());
            dy.rows_mut(0, layout.state_len())
                .copy_from(&dynamics.rhs(t, &z)?);
            for (b, jac) in jacobians.iter().enumerate() {
                let (s, p, q) = layout.offsets(b);
                let ds = &jac.state * layout.matrix(y, s, layout.hidden);
                let dp = &jac.state * layout.matrix(y, p, layout.parameters) + &jac.parameters;
                write_block(&mut dy, s, &ds);
                write_block(&mut dy, p, &dp);
                if let Some(jc) = control_jacobians.get(b) {
                    let dq = &jac.state * layout.matrix(y, q, layout.control) + &jac.field * jc;
                    write_block(&mut dy, q, &dq);
                }
            }
            Ok(dy)
        };

        let states = self.solver.solve(&rhs, &y0, times, &self.options)?;
        let trajectory = states
            .iter()
            .map(|y| dynamics.unflatten_state(&y.rows(0, layout.state_len()).into_owned()))
            .collect::<CdeResult<Trajectory>>()?;
        Ok((trajectory, DirectContext { states }))
    }

    fn backward<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        context: DirectContext,
        grad_outputs: &[DMatrix<f64>],
    ) -> CdeResult<CdeGradients>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized,
    {
        check_grad_outputs(dynamics, grad_outputs, context.states.len())?;
        let layout = layout_for(dynamics, self.control_gradient);

        let mut z0 = DMatrix::zeros(layout.batch, layout.hidden);
        let mut parameters = DVector::zeros(layout.parameters);
        let mut control = DMatrix::zeros(layout.batch, layout.control);
        for (y, grad) in context.states.iter().zip(grad_outputs) {
            for b in 0..layout.batch {
                let g = grad.row(b).transpose();
                let (s, p, q) = layout.offsets(b);
                let mut z0_row = z0.row_mut(b);
                z0_row += layout.matrix(y, s, layout.hidden).tr_mul(&g).transpose();
                parameters += layout.matrix(y, p, layout.parameters).tr_mul(&g);
                if self.control_gradient {
                    let mut control_row = control.row_mut(b);
                    control_row += layout.matrix(y, q, layout.control).tr_mul(&g).transpose();
                }
            }
        }

        Ok(CdeGradients {
            z0,
            parameters,
            control: self.control_gradient.then_some(control),
        })
    }
}

fn layout_for<P, F>(dynamics: &CdeDynamics<'_, P, F>, control: bool) -> Layout
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    Layout {
        batch: dynamics.batch_size(),
        hidden: dynamics.hidden_channels(),
        parameters: dynamics.parameter_count(),
        control: if control {
            dynamics.coefficient_count()
        } else {
            0
        },
    }
}
