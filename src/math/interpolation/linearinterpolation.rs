use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::cdeerror::{CdeError, CdeResult};
use crate::math::interpolation::interpolant::{
    DifferentiablePath, Interpolant, check_cotangent, find_segment, locate_in_interval,
};
use crate::math::interpolation::observations::{Observations, impute, impute_vjp};

// ─────────────────────────────────────────────
// Coefficients
// ─────────────────────────────────────────────

/// Knot times plus the (imputed) knot values, one `length × channels` matrix
/// per batch element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LinearCoefficientsJsonProp")]
pub struct LinearCoefficients {
    times: Vec<f64>,
    knots: Vec<DMatrix<f64>>,
}

#[derive(Deserialize)]
struct LinearCoefficientsJsonProp {
    times: Vec<f64>,
    knots: Vec<DMatrix<f64>>,
}

impl TryFrom<LinearCoefficientsJsonProp> for LinearCoefficients {
    type Error = CdeError;

    fn try_from(json_prop: LinearCoefficientsJsonProp) -> CdeResult<LinearCoefficients> {
        LinearCoefficients::new(json_prop.times, json_prop.knots)
    }
}

impl LinearCoefficients {
    pub fn new(times: Vec<f64>, knots: Vec<DMatrix<f64>>) -> CdeResult<LinearCoefficients> {
        check_linear_times(&times)?;
        let channels = knots
            .first()
            .map(|k| k.ncols())
            .ok_or_else(|| CdeError::DataError("empty coefficient batch".to_owned()))?;
        for k in &knots {
            if k.nrows() != times.len() || k.ncols() != channels {
                return Err(CdeError::shape_mismatch(
                    "linear knots",
                    format!("{}x{}", times.len(), channels),
                    format!("{}x{}", k.nrows(), k.ncols()),
                ));
            }
        }
        Ok(LinearCoefficients { times, knots })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn knots(&self) -> &[DMatrix<f64>] {
        &self.knots
    }

    pub fn batch_size(&self) -> usize {
        self.knots.len()
    }

    pub fn channels(&self) -> usize {
        self.knots[0].ncols()
    }
}

fn check_linear_times(times: &[f64]) -> CdeResult<()> {
    if times.len() < 2 {
        return Err(CdeError::too_few_times(2, times.len()));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(CdeError::DomainError("observation times must be finite".to_owned()));
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(CdeError::DomainError(
            "observation times must be non-decreasing".to_owned(),
        ));
    }
    Ok(())
}

/// Imputes missing samples and packages the knots of a linear path.
pub fn build_linear_coefficients(
    times: &[f64],
    observations: &Observations,
) -> CdeResult<LinearCoefficients> {
    check_linear_times(times)?;
    let knots = impute(times, observations)?;
    LinearCoefficients::new(times.to_vec(), knots)
}

/// Pulls a `batch × (length·channels)` gradient on the knots back onto the
/// raw observations.
pub fn linear_coefficients_vjp(
    times: &[f64],
    observations: &Observations,
    grad_coefficients: &DMatrix<f64>,
) -> CdeResult<Vec<DMatrix<f64>>> {
    let length = observations.length();
    let channels = observations.channels();
    if grad_coefficients.nrows() != observations.batch_size()
        || grad_coefficients.ncols() != length * channels
    {
        return Err(CdeError::shape_mismatch(
            "linear coefficient gradient",
            format!("{}x{}", observations.batch_size(), length * channels),
            format!("{}x{}", grad_coefficients.nrows(), grad_coefficients.ncols()),
        ));
    }
    let grad_knots: Vec<DMatrix<f64>> = (0..observations.batch_size())
        .map(|b| DMatrix::from_fn(length, channels, |i, c| grad_coefficients[(b, i * channels + c)]))
        .collect();
    impute_vjp(times, observations, &grad_knots)
}

// ─────────────────────────────────────────────
// Interpolation
// ─────────────────────────────────────────────

/// Time warp applied inside each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reparameterisation {
    /// Plain linear interpolation, piecewise constant derivative.
    #[default]
    None,
    /// The segment fraction s runs through 3s² − 2s³: same knots and same
    /// polyline, but the derivative vanishes at every knot and is continuous.
    Smoothstep,
}

pub struct LinearInterpolation {
    coefficients: LinearCoefficients,
    reparameterisation: Reparameterisation,
}

impl LinearInterpolation {
    pub fn new(coefficients: LinearCoefficients) -> LinearInterpolation {
        Self::with_reparameterisation(coefficients, Reparameterisation::None)
    }

    pub fn with_reparameterisation(
        coefficients: LinearCoefficients,
        reparameterisation: Reparameterisation,
    ) -> LinearInterpolation {
        LinearInterpolation {
            coefficients,
            reparameterisation,
        }
    }

    pub fn coefficients(&self) -> &LinearCoefficients {
        &self.coefficients
    }

    pub fn reparameterisation(&self) -> Reparameterisation {
        self.reparameterisation
    }

    /// Segment index, value weight of the right knot and derivative factor.
    fn weights(&self, t: f64) -> CdeResult<(usize, f64, f64)> {
        let times = self.coefficients.times();
        let t = locate_in_interval(times, t)?;
        let i = find_segment(times, t);
        let h = times[i + 1] - times[i];
        if h <= 0.0 {
            // zero-length segment takes the value of its closing knot
            return Ok((i, 1.0, 0.0));
        }
        let s = ((t - times[i]) / h).clamp(0.0, 1.0);
        Ok(match self.reparameterisation {
            Reparameterisation::None => (i, s, 1.0 / h),
            Reparameterisation::Smoothstep => {
                (i, s * s * (3.0 - 2.0 * s), 6.0 * s * (1.0 - s) / h)
            }
        })
    }
}

impl Interpolant for LinearInterpolation {
    fn evaluate(&self, t: f64) -> CdeResult<DMatrix<f64>> {
        let (i, w, _) = self.weights(t)?;
        let knots = self.coefficients.knots();
        Ok(DMatrix::from_fn(knots.len(), self.coefficients.channels(), |b, c| {
            let lhs = knots[b][(i, c)];
            lhs + w * (knots[b][(i + 1, c)] - lhs)
        }))
    }

    fn derivative(&self, t: f64) -> CdeResult<DMatrix<f64>> {
        let (i, _, rate) = self.weights(t)?;
        let knots = self.coefficients.knots();
        Ok(DMatrix::from_fn(knots.len(), self.coefficients.channels(), |b, c| {
            rate * (knots[b][(i + 1, c)] - knots[b][(i, c)])
        }))
    }
}

impl DifferentiablePath for LinearInterpolation {
    fn batch_size(&self) -> usize {
        self.coefficients.batch_size()
    }

    fn channels(&self) -> usize {
        self.coefficients.channels()
    }

    fn interval(&self) -> (f64, f64) {
        let times = self.coefficients.times();
        (times[0], times[times.len() - 1])
    }

    fn coefficient_count(&self) -> usize {
        self.coefficients.times().len() * self.channels()
    }

    fn evaluate_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>> {
        check_cotangent(cotangent, self.batch_size(), self.channels())?;
        let (i, w, _) = self.weights(t)?;
        let channels = self.channels();
        let mut grad = DMatrix::zeros(self.batch_size(), self.coefficient_count());
        for b in 0..self.batch_size() {
            for c in 0..channels {
                grad[(b, i * channels + c)] += (1.0 - w) * cotangent[(b, c)];
                grad[(b, (i + 1) * channels + c)] += w * cotangent[(b, c)];
            }
        }
        Ok(grad)
    }

    fn derivative_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>> {
        check_cotangent(cotangent, self.batch_size(), self.channels())?;
        let (i, _, rate) = self.weights(t)?;
        let channels = self.channels();
        let mut grad = DMatrix::zeros(self.batch_size(), self.coefficient_count());
        for b in 0..self.batch_size() {
            for c in 0..channels {
                grad[(b, i * channels + c)] -= rate * cotangent[(b, c)];
                grad[(b, (i + 1) * channels + c)] += rate * cotangent[(b, c)];
            }
        }
        Ok(grad)
    }
}
