use nalgebra::{DMatrix, DVector};

use crate::cde::cdedynamics::CdeDynamics;
use crate::cde::vectorfield::VectorField;
use crate::cdeerror::{CdeError, CdeResult};
use crate::math::interpolation::interpolant::DifferentiablePath;

/// Hidden states at the requested output times, each `B × H`.
pub type Trajectory = Vec<DMatrix<f64>>;

/// Gradients of a scalar loss with respect to the inputs of a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct CdeGradients {
    /// `∂L/∂z0`, `B × H`.
    pub z0: DMatrix<f64>,
    /// `∂L/∂θ` for the flat vector field parameters.
    pub parameters: DVector<f64>,
    /// `∂L/∂c`, `B × N` over the path coefficients, when requested.
    pub control: Option<DMatrix<f64>>,
}

/// Two-phase protocol: `run` solves forwards and keeps whatever the method
/// needs; `backward` consumes that context together with the loss gradient at
/// each output time.
pub trait SensitivityMethod {
    type Context;

    fn run<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        z0: &DMatrix<f64>,
        times: &[f64],
    ) -> CdeResult<(Trajectory, Self::Context)>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized;

    fn backward<P, F>(
        &self,
        dynamics: &CdeDynamics<'_, P, F>,
        context: Self::Context,
        grad_outputs: &[DMatrix<f64>],
    ) -> CdeResult<CdeGradients>
    where
        P: DifferentiablePath + ?Sized,
        F: VectorField + ?Sized;
}

pub(crate) fn check_grad_outputs<P, F>(
    dynamics: &CdeDynamics<'_, P, F>,
    grad_outputs: &[DMatrix<f64>],
    output_count: usize,
) -> CdeResult<()>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    if grad_outputs.len() != output_count {
        return Err(CdeError::shape_mismatch(
            "output gradients",
            output_count,
            grad_outputs.len(),
        ));
    }
    grad_outputs.iter().try_for_each(|g| dynamics.check_state(g))
}
