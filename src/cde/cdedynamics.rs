use nalgebra::{DMatrix, DVector};

use crate::cde::vectorfield::{VectorField, flatten_rows};
use crate::cdeerror::{CdeError, CdeResult};
use crate::math::interpolation::interpolant::DifferentiablePath;

/// Vector-Jacobian product of g(t, z) = f(t, z) · X'(t) for a cotangent `a`.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicsVjp {
    /// `a · ∂g/∂z`, flat `B·H`.
    pub state: DVector<f64>,
    /// `a · ∂g/∂θ`, summed over the batch.
    pub parameters: DVector<f64>,
    /// `a · ∂g/∂c`, `B × N`, when requested.
    pub control: Option<DMatrix<f64>>,
}

/// Full Jacobians of g for one batch element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementJacobians {
    /// `∂g_b/∂z_b`, `H × H`.
    pub state: DMatrix<f64>,
    /// `∂g_b/∂θ`, `H × P`.
    pub parameters: DMatrix<f64>,
    /// f(t, z_b), `H × I`, which is `∂g_b/∂X'_b`.
    pub field: DMatrix<f64>,
}

/// The CDE reduced to an ODE over the flat, row-major `B × H` hidden state.
pub struct CdeDynamics<'a, P: ?Sized, F: ?Sized> {
    path: &'a P,
    field: &'a F,
}

impl<'a, P, F> CdeDynamics<'a, P, F>
where
    P: DifferentiablePath + ?Sized,
    F: VectorField + ?Sized,
{
    pub fn new(path: &'a P, field: &'a F) -> CdeResult<Self> {
        if path.channels() != field.input_channels() {
            return Err(CdeError::shape_mismatch(
                "vector field input channels",
                path.channels(),
                field.input_channels(),
            ));
        }
        Ok(CdeDynamics { path, field })
    }

    pub fn path(&self) -> &'a P {
        self.path
    }

    pub fn batch_size(&self) -> usize {
        self.path.batch_size()
    }

    pub fn hidden_channels(&self) -> usize {
        self.field.hidden_channels()
    }

    pub fn parameter_count(&self) -> usize {
        self.field.parameter_count()
    }

    pub fn coefficient_count(&self) -> usize {
        self.path.coefficient_count()
    }

    pub fn state_len(&self) -> usize {
        self.batch_size() * self.hidden_channels()
    }

    pub fn check_state(&self, z: &DMatrix<f64>) -> CdeResult<()> {
        let expected = (self.batch_size(), self.hidden_channels());
        if z.shape() != expected {
            return Err(CdeError::shape_mismatch(
                "hidden state",
                format!("{}x{}", expected.0, expected.1),
                format!("{}x{}", z.nrows(), z.ncols()),
            ));
        }
        Ok(())
    }

    pub fn flatten_state(&self, z: &DMatrix<f64>) -> CdeResult<DVector<f64>> {
        self.check_state(z)?;
        Ok(flatten_rows(z))
    }

    pub fn unflatten_state(&self, z: &DVector<f64>) -> CdeResult<DMatrix<f64>> {
        self.check_flat(z)?;
        Ok(DMatrix::from_row_slice(
            self.batch_size(),
            self.hidden_channels(),
            z.as_slice(),
        ))
    }

    fn check_flat(&self, z: &DVector<f64>) -> CdeResult<()> {
        if z.len() != self.state_len() {
            return Err(CdeError::shape_mismatch("flat hidden state", self.state_len(), z.len()));
        }
        Ok(())
    }

    fn element(&self, z: &DVector<f64>, b: usize) -> DVector<f64> {
        let hidden = self.hidden_channels();
        z.rows(b * hidden, hidden).into_owned()
    }

    fn field_at(&self, t: f64, z_b: &DVector<f64>) -> CdeResult<DMatrix<f64>> {
        let f = self.field.evaluate(t, z_b)?;
        let expected = (self.hidden_channels(), self.field.input_channels());
        if f.shape() != expected {
            return Err(CdeError::shape_mismatch(
                "vector field output",
                format!("{}x{}", expected.0, expected.1),
                format!("{}x{}", f.nrows(), f.ncols()),
            ));
        }
        Ok(f)
    }

    /// g(t, z): for every batch element, f(t, z_b) · X'_b(t).
    pub fn rhs(&self, t: f64, z: &DVector<f64>) -> CdeResult<DVector<f64>> {
        self.check_flat(z)?;
        let hidden = self.hidden_channels();
        let dx = self.path.derivative(t)?;
        let mut out = DVector::zeros(z.len());
        for b in 0..self.batch_size() {
            let f = self.field_at(t, &self.element(z, b))?;
            let dx_b = dx.row(b).transpose();
            out.rows_mut(b * hidden, hidden).copy_from(&(f * dx_b));
        }
        Ok(out)
    }

    pub fn vjp(
        &self,
        t: f64,
        z: &DVector<f64>,
        a: &DVector<f64>,
        with_control: bool,
    ) -> CdeResult<DynamicsVjp> {
        self.check_flat(z)?;
        self.check_flat(a)?;
        let hidden = self.hidden_channels();
        let dx = self.path.derivative(t)?;
        let mut state = DVector::zeros(z.len());
        let mut parameters = DVector::zeros(self.parameter_count());
        let mut grad_dx = DMatrix::zeros(self.batch_size(), self.path.channels());

        for b in 0..self.batch_size() {
            let z_b = self.element(z, b);
            let a_b = a.rows(b * hidden, hidden).into_owned();
            let dx_b = dx.row(b).transpose();
            let cotangent = &a_b * dx_b.transpose();
            let (grad_z, grad_theta) = self.field.vjp(t, &z_b, &cotangent)?;
            state.rows_mut(b * hidden, hidden).copy_from(&grad_z);
            parameters += grad_theta;
            if with_control {
                let f = self.field_at(t, &z_b)?;
                grad_dx.row_mut(b).copy_from(&f.tr_mul(&a_b).transpose());
            }
        }

        let control = if with_control {
            Some(self.path.derivative_vjp(t, &grad_dx)?)
        } else {
            None
        };
        Ok(DynamicsVjp {
            state,
            parameters,
            control,
        })
    }

    /// Per-element Jacobians, assembled row by row from unit cotangents.
    pub fn jacobians(&self, t: f64, z: &DVector<f64>) -> CdeResult<Vec<ElementJacobians>> {
        self.check_flat(z)?;
        let hidden = self.hidden_channels();
        let dx = self.path.derivative(t)?;
        (0..self.batch_size())
            .map(|b| {
                let z_b = self.element(z, b);
                let dx_b = dx.row(b).transpose();
                let mut state = DMatrix::zeros(hidden, hidden);
                let mut parameters = DMatrix::zeros(hidden, self.parameter_count());
                for h in 0..hidden {
                    let mut unit = DVector::zeros(hidden);
                    unit[h] = 1.0;
                    let (grad_z, grad_theta) =
                        self.field.vjp(t, &z_b, &(unit * dx_b.transpose()))?;
                    state.row_mut(h).copy_from(&grad_z.transpose());
                    parameters.row_mut(h).copy_from(&grad_theta.transpose());
                }
                Ok(ElementJacobians {
                    state,
                    parameters,
                    field: self.field_at(t, &z_b)?,
                })
            })
            .collect()
    }

    /// `∂X'_b(t)/∂c_b` for every batch element, each `I × N`.
    pub fn control_jacobians(&self, t: f64) -> CdeResult<Vec<DMatrix<f64>>> {
        let (batch, channels) = (self.batch_size(), self.path.channels());
        let mut out = vec![DMatrix::zeros(channels, self.coefficient_count()); batch];
        for i in 0..channels {
            let cotangent = DMatrix::from_fn(batch, channels, |_, c| if c == i { 1.0 } else { 0.0 });
            let grad = self.path.derivative_vjp(t, &cotangent)?;
            for (b, jac) in out.iter_mut().enumerate() {
                jac.row_mut(i).copy_from(&grad.row(b));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cde::vectorfield::MlpVectorField;
    use crate::math::interpolation::naturalcubicspline::{
        NaturalCubicSpline, build_natural_cubic_spline_coefficients,
    };
    use crate::math::interpolation::observations::Observations;
    use approx::assert_abs_diff_eq;

    fn spline() -> NaturalCubicSpline {
        let times = [0.0, 1.0, 2.0, 3.0, 4.0];
        let values = (0..2)
            .map(|b| {
                DMatrix::from_fn(5, 2, |l, c| {
                    ((l as f64) * (1.0 + c as f64) + b as f64).sin()
                })
            })
            .collect();
        let obs = Observations::from_dense(values).unwrap();
        NaturalCubicSpline::new(build_natural_cubic_spline_coefficients(&times, &obs).unwrap())
    }

    fn field() -> MlpVectorField {
        let count = 5 * 3 + 5 + 6 * 5 + 6;
        let params = DVector::from_fn(count, |k, _| ((k * 29 % 13) as f64 - 6.0) / 15.0);
        MlpVectorField::from_parameters(2, 3, 5, &params).unwrap()
    }

    #[test]
    fn rejects_channel_mismatch() {
        let path = spline();
        let wrong = MlpVectorField::from_parameters(3, 3, 1, &DVector::zeros(3 + 1 + 9 + 9)).unwrap();
        assert!(CdeDynamics::new(&path, &wrong).is_err());
    }

    #[test]
    fn vjp_agrees_with_jacobians() {
        let (path, field) = (spline(), field());
        let dynamics = CdeDynamics::new(&path, &field).unwrap();
        let z = DVector::from_fn(6, |k, _| 0.2 * k as f64 - 0.5);
        let a = DVector::from_fn(6, |k, _| 1.0 - 0.3 * k as f64);
        let t = 1.7;

        let vjp = dynamics.vjp(t, &z, &a, true).unwrap();
        let jacobians = dynamics.jacobians(t, &z).unwrap();
        let control = dynamics.control_jacobians(t).unwrap();

        let mut parameters = DVector::zeros(dynamics.parameter_count());
        for (b, jac) in jacobians.iter().enumerate() {
            let a_b = a.rows(3 * b, 3).into_owned();
            let state = jac.state.tr_mul(&a_b);
            for h in 0..3 {
                assert_abs_diff_eq!(vjp.state[3 * b + h], state[h], epsilon = 1e-12);
            }
            parameters += jac.parameters.tr_mul(&a_b);
            let grad_c = (&jac.field * &control[b]).tr_mul(&a_b);
            let from_vjp = vjp.control.as_ref().unwrap().row(b).transpose();
            assert_abs_diff_eq!(grad_c, from_vjp, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(parameters, vjp.parameters, epsilon = 1e-12);
    }

    #[test]
    fn state_jacobian_matches_finite_differences() {
        let (path, field) = (spline(), field());
        let dynamics = CdeDynamics::new(&path, &field).unwrap();
        let z = DVector::from_fn(6, |k, _| 0.1 * k as f64);
        let t = 2.4;
        let jacobians = dynamics.jacobians(t, &z).unwrap();
        let eps = 1e-6;
        for k in 0..3 {
            let mut zp = z.clone();
            zp[3 + k] += eps;
            let mut zm = z.clone();
            zm[3 + k] -= eps;
            let column = (dynamics.rhs(t, &zp).unwrap() - dynamics.rhs(t, &zm).unwrap()) / (2.0 * eps);
            for h in 0..3 {
                assert_abs_diff_eq!(jacobians[1].state[(h, k)], column[3 + h], epsilon = 1e-7);
                assert_abs_diff_eq!(column[h], 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn flat_state_is_row_major() {
        let (path, field) = (spline(), field());
        let dynamics = CdeDynamics::new(&path, &field).unwrap();
        let z = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let flat = dynamics.flatten_state(&z).unwrap();
        assert_eq!(flat.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(dynamics.unflatten_state(&flat).unwrap(), z);
        assert!(dynamics.flatten_state(&DMatrix::zeros(3, 2)).is_err());
    }
}
