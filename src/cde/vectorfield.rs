use nalgebra::{DMatrix, DVector};

use crate::cdeerror::{CdeError, CdeResult};

/// The vector field f(t, z) of a CDE, mapping a hidden state of size H to an
/// `H × I` matrix that acts on the control's increments.
///
/// `vjp` returns the gradients of `⟨cotangent, f(t, z)⟩` (Frobenius product)
/// with respect to z and to the flat parameter vector.
pub trait VectorField {
    fn input_channels(&self) -> usize;

    fn hidden_channels(&self) -> usize;

    fn parameter_count(&self) -> usize;

    fn evaluate(&self, t: f64, z: &DVector<f64>) -> CdeResult<DMatrix<f64>>;

    fn vjp(
        &self,
        t: f64,
        z: &DVector<f64>,
        cotangent: &DMatrix<f64>,
    ) -> CdeResult<(DVector<f64>, DVector<f64>)>;
}

pub(crate) fn flatten_rows(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(m.len(), m.transpose().iter().copied())
}

fn check_parameters(parameters: &DVector<f64>, expected: usize) -> CdeResult<()> {
    if parameters.len() != expected {
        return Err(CdeError::shape_mismatch(
            "vector field parameters",
            expected,
            parameters.len(),
        ));
    }
    Ok(())
}

fn check_state(z: &DVector<f64>, hidden: usize) -> CdeResult<()> {
    if z.len() != hidden {
        return Err(CdeError::shape_mismatch("vector field state", hidden, z.len()));
    }
    Ok(())
}

// ─────────────────────────────────────────────
// AffineVectorField
// ─────────────────────────────────────────────

/// f(z) = reshape(W·z) + B, a linear CDE.
///
/// `weight` is `(H·I) × H`, its rows in row-major order of the `H × I`
/// output; `bias` is `H × I`. Parameters: W row-major, then B row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineVectorField {
    weight: DMatrix<f64>,
    bias: DMatrix<f64>,
}

impl AffineVectorField {
    pub fn new(weight: DMatrix<f64>, bias: DMatrix<f64>) -> CdeResult<AffineVectorField> {
        let (hidden, input) = bias.shape();
        if weight.shape() != (hidden * input, hidden) {
            return Err(CdeError::shape_mismatch(
                "affine weight",
                format!("{}x{}", hidden * input, hidden),
                format!("{}x{}", weight.nrows(), weight.ncols()),
            ));
        }
        Ok(AffineVectorField { weight, bias })
    }

    /// A state-independent field f(z) = B.
    pub fn constant(bias: DMatrix<f64>) -> AffineVectorField {
        let (hidden, input) = bias.shape();
        AffineVectorField {
            weight: DMatrix::zeros(hidden * input, hidden),
            bias,
        }
    }

    pub fn parameters(&self) -> DVector<f64> {
        let mut flat = flatten_rows(&self.weight).as_slice().to_vec();
        flat.extend(flatten_rows(&self.bias).iter());
        DVector::from_vec(flat)
    }

    pub fn set_parameters(&mut self, parameters: &DVector<f64>) -> CdeResult<()> {
        check_parameters(parameters, self.parameter_count())?;
        let (rows, cols) = self.weight.shape();
        let split = rows * cols;
        self.weight = DMatrix::from_row_slice(rows, cols, &parameters.as_slice()[..split]);
        self.bias = DMatrix::from_row_slice(
            self.bias.nrows(),
            self.bias.ncols(),
            &parameters.as_slice()[split..],
        );
        Ok(())
    }
}

impl VectorField for AffineVectorField {
    fn input_channels(&self) -> usize {
        self.bias.ncols()
    }

    fn hidden_channels(&self) -> usize {
        self.bias.nrows()
    }

    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    fn evaluate(&self, _t: f64, z: &DVector<f64>) -> CdeResult<DMatrix<f64>> {
        check_state(z, self.hidden_channels())?;
        let wz = &self.weight * z;
        let input = self.input_channels();
        Ok(DMatrix::from_fn(self.hidden_channels(), input, |h, i| {
            wz[h * input + i] + self.bias[(h, i)]
        }))
    }

    fn vjp(
        &self,
        _t: f64,
        z: &DVector<f64>,
        cotangent: &DMatrix<f64>,
    ) -> CdeResult<(DVector<f64>, DVector<f64>)> {
        check_state(z, self.hidden_channels())?;
        let m = flatten_rows(cotangent);
        let grad_z = self.weight.tr_mul(&m);
        let grad_weight = &m * z.transpose();
        let mut grad = flatten_rows(&grad_weight).as_slice().to_vec();
        grad.extend(m.iter());
        Ok((grad_z, DVector::from_vec(grad)))
    }
}

// ─────────────────────────────────────────────
// MlpVectorField
// ─────────────────────────────────────────────

/// One hidden tanh layer: f(z) = reshape(W2·tanh(W1·z + b1) + b2) as `H × I`.
///
/// Parameters: W1 (`width × H`) row-major, b1, W2 (`(H·I) × width`)
/// row-major, b2.
#[derive(Debug, Clone, PartialEq)]
pub struct MlpVectorField {
    input_channels: usize,
    hidden_channels: usize,
    w1: DMatrix<f64>,
    b1: DVector<f64>,
    w2: DMatrix<f64>,
    b2: DVector<f64>,
}

impl MlpVectorField {
    pub fn from_parameters(
        input_channels: usize,
        hidden_channels: usize,
        width: usize,
        parameters: &DVector<f64>,
    ) -> CdeResult<MlpVectorField> {
        let out = input_channels * hidden_channels;
        let mut field = MlpVectorField {
            input_channels,
            hidden_channels,
            w1: DMatrix::zeros(width, hidden_channels),
            b1: DVector::zeros(width),
            w2: DMatrix::zeros(out, width),
            b2: DVector::zeros(out),
        };
        field.set_parameters(parameters)?;
        Ok(field)
    }

    pub fn width(&self) -> usize {
        self.b1.len()
    }

    pub fn parameters(&self) -> DVector<f64> {
        let mut flat = flatten_rows(&self.w1).as_slice().to_vec();
        flat.extend(self.b1.iter());
        flat.extend(flatten_rows(&self.w2).iter());
        flat.extend(self.b2.iter());
        DVector::from_vec(flat)
    }

    pub fn set_parameters(&mut self, parameters: &DVector<f64>) -> CdeResult<()> {
        check_parameters(parameters, self.parameter_count())?;
        let (width, hidden, out) = (self.width(), self.hidden_channels, self.b2.len());
        let (w1, rest) = parameters.as_slice().split_at(width * hidden);
        let (b1, rest) = rest.split_at(width);
        let (w2, b2) = rest.split_at(out * width);
        self.w1 = DMatrix::from_row_slice(width, hidden, w1);
        self.b1 = DVector::from_column_slice(b1);
        self.w2 = DMatrix::from_row_slice(out, width, w2);
        self.b2 = DVector::from_column_slice(b2);
        Ok(())
    }

    fn hidden_activation(&self, z: &DVector<f64>) -> DVector<f64> {
        (&self.w1 * z + &self.b1).map(f64::tanh)
    }
}

impl VectorField for MlpVectorField {
    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }

    fn parameter_count(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }

    fn evaluate(&self, _t: f64, z: &DVector<f64>) -> CdeResult<DMatrix<f64>> {
        check_state(z, self.hidden_channels)?;
        let v = &self.w2 * self.hidden_activation(z) + &self.b2;
        Ok(DMatrix::from_row_slice(
            self.hidden_channels,
            self.input_channels,
            v.as_slice(),
        ))
    }

    fn vjp(
        &self,
        _t: f64,
        z: &DVector<f64>,
        cotangent: &DMatrix<f64>,
    ) -> CdeResult<(DVector<f64>, DVector<f64>)> {
        check_state(z, self.hidden_channels)?;
        let s = self.hidden_activation(z);
        let m = flatten_rows(cotangent);

        let grad_w2 = &m * s.transpose();
        let grad_s = self.w2.tr_mul(&m);
        let grad_u = grad_s.component_mul(&s.map(|v| 1.0 - v * v));
        let grad_w1 = &grad_u * z.transpose();
        let grad_z = self.w1.tr_mul(&grad_u);

        let mut grad = flatten_rows(&grad_w1).as_slice().to_vec();
        grad.extend(grad_u.iter());
        grad.extend(flatten_rows(&grad_w2).iter());
        grad.extend(m.iter());
        Ok((grad_z, DVector::from_vec(grad)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn mlp() -> MlpVectorField {
        let (input, hidden, width) = (2, 3, 4);
        let count = width * hidden + width + input * hidden * width + input * hidden;
        let params = DVector::from_fn(count, |k, _| ((k * 37 % 17) as f64 - 8.0) / 20.0);
        MlpVectorField::from_parameters(input, hidden, width, &params).unwrap()
    }

    fn check_vjp<F: VectorField>(field: &F, params: DVector<f64>, rebuild: impl Fn(&DVector<f64>) -> F) {
        let z = DVector::from_vec(vec![0.3, -0.7, 1.1][..field.hidden_channels()].to_vec());
        let cot = DMatrix::from_fn(field.hidden_channels(), field.input_channels(), |h, i| {
            1.0 + h as f64 - 0.5 * i as f64
        });
        let pairing = |f: &F, z: &DVector<f64>| f.evaluate(0.0, z).unwrap().dot(&cot);
        let (grad_z, grad_p) = field.vjp(0.0, &z, &cot).unwrap();
        let eps = 1e-6;

        for k in 0..z.len() {
            let mut zp = z.clone();
            zp[k] += eps;
            let mut zm = z.clone();
            zm[k] -= eps;
            let fd = (pairing(field, &zp) - pairing(field, &zm)) / (2.0 * eps);
            assert_abs_diff_eq!(grad_z[k], fd, epsilon = 1e-7);
        }
        for k in 0..params.len() {
            let mut pp = params.clone();
            pp[k] += eps;
            let mut pm = params.clone();
            pm[k] -= eps;
            let fd = (pairing(&rebuild(&pp), &z) - pairing(&rebuild(&pm), &z)) / (2.0 * eps);
            assert_abs_diff_eq!(grad_p[k], fd, epsilon = 1e-7);
        }
    }

    #[test]
    fn mlp_vjp_matches_finite_differences() {
        let field = mlp();
        let params = field.parameters();
        check_vjp(&field, params, |p| MlpVectorField::from_parameters(2, 3, 4, p).unwrap());
    }

    #[test]
    fn affine_vjp_matches_finite_differences() {
        let weight = DMatrix::from_fn(6, 3, |r, c| (r as f64 - 2.0 * c as f64) / 7.0);
        let bias = DMatrix::from_fn(3, 2, |h, i| h as f64 + 0.25 * i as f64);
        let field = AffineVectorField::new(weight, bias).unwrap();
        let params = field.parameters();
        let template = field.clone();
        check_vjp(&field, params, |p| {
            let mut f = template.clone();
            f.set_parameters(p).unwrap();
            f
        });
    }

    #[test]
    fn parameters_round_trip() {
        let field = mlp();
        let params = field.parameters();
        assert_eq!(params.len(), field.parameter_count());
        let rebuilt = MlpVectorField::from_parameters(2, 3, 4, &params).unwrap();
        assert_eq!(rebuilt, field);
    }

    #[test]
    fn constant_field_ignores_state() {
        let field = AffineVectorField::constant(DMatrix::identity(2, 2));
        let out = field.evaluate(0.0, &DVector::from_vec(vec![5.0, -3.0])).unwrap();
        assert_eq!(out, DMatrix::identity(2, 2));
        assert!(field.evaluate(0.0, &DVector::zeros(3)).is_err());
    }

    #[test]
    fn output_is_hidden_by_input() {
        let field = mlp();
        let out = field.evaluate(0.0, &DVector::zeros(3)).unwrap();
        assert_eq!(out.shape(), (3, 2));
    }
}
