use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cdeerror::{CdeError, CdeResult};
use crate::math::interpolation::interpolant::{
    DifferentiablePath, Interpolant, check_cotangent, find_segment, locate_in_interval,
};
use crate::math::interpolation::observations::{Observations, impute, impute_vjp};
use crate::math::tridiagonal::solve_tridiagonal;

const MIN_SPLINE_TIMES: usize = 4;

// ─────────────────────────────────────────────
// Coefficients
// ─────────────────────────────────────────────

/// Per-segment cubic coefficients of a batch of natural cubic splines.
///
/// On segment i, with τ = t − times[i]:
///   S_i(τ) = a + b·τ + c·τ² + d·τ³
/// Each array holds one `(length − 1) × channels` matrix per batch element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NaturalCubicCoefficientsJsonProp")]
pub struct NaturalCubicCoefficients {
    times: Vec<f64>,
    a: Vec<DMatrix<f64>>,
    b: Vec<DMatrix<f64>>,
    c: Vec<DMatrix<f64>>,
    d: Vec<DMatrix<f64>>,
}

#[derive(Deserialize)]
struct NaturalCubicCoefficientsJsonProp {
    times: Vec<f64>,
    a: Vec<DMatrix<f64>>,
    b: Vec<DMatrix<f64>>,
    c: Vec<DMatrix<f64>>,
    d: Vec<DMatrix<f64>>,
}

impl TryFrom<NaturalCubicCoefficientsJsonProp> for NaturalCubicCoefficients {
    type Error = CdeError;

    fn try_from(json_prop: NaturalCubicCoefficientsJsonProp) -> CdeResult<NaturalCubicCoefficients> {
        NaturalCubicCoefficients::new(
            json_prop.times,
            json_prop.a,
            json_prop.b,
            json_prop.c,
            json_prop.d,
        )
    }
}

impl NaturalCubicCoefficients {
    pub fn new(
        times: Vec<f64>,
        a: Vec<DMatrix<f64>>,
        b: Vec<DMatrix<f64>>,
        c: Vec<DMatrix<f64>>,
        d: Vec<DMatrix<f64>>,
    ) -> CdeResult<NaturalCubicCoefficients> {
        check_spline_times(&times)?;
        let segments = times.len() - 1;
        let channels = a
            .first()
            .map(|m| m.ncols())
            .ok_or_else(|| CdeError::DataError("empty coefficient batch".to_owned()))?;
        let batch = a.len();
        for array in [&a, &b, &c, &d] {
            if array.len() != batch {
                return Err(CdeError::shape_mismatch("spline coefficient batch", batch, array.len()));
            }
            for m in array {
                if m.shape() != (segments, channels) {
                    return Err(CdeError::shape_mismatch(
                        "spline coefficients",
                        format!("{}x{}", segments, channels),
                        format!("{}x{}", m.nrows(), m.ncols()),
                    ));
                }
            }
        }
        Ok(NaturalCubicCoefficients { times, a, b, c, d })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn a(&self) -> &[DMatrix<f64>] {
        &self.a
    }

    pub fn b(&self) -> &[DMatrix<f64>] {
        &self.b
    }

    pub fn c(&self) -> &[DMatrix<f64>] {
        &self.c
    }

    pub fn d(&self) -> &[DMatrix<f64>] {
        &self.d
    }

    pub fn batch_size(&self) -> usize {
        self.a.len()
    }

    pub fn channels(&self) -> usize {
        self.a[0].ncols()
    }

    pub fn segments(&self) -> usize {
        self.times.len() - 1
    }
}

fn check_spline_times(times: &[f64]) -> CdeResult<()> {
    if times.len() < MIN_SPLINE_TIMES {
        return Err(CdeError::too_few_times(MIN_SPLINE_TIMES, times.len()));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(CdeError::DomainError("observation times must be finite".to_owned()));
    }
    if times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(CdeError::DomainError(
            "spline times must be strictly increasing".to_owned(),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────
// Moment equations
// ─────────────────────────────────────────────
//
// Second derivatives M[0..=n] at the knots satisfy, for interior i,
//   h[i-1]*M[i-1] + 2*(h[i-1]+h[i])*M[i] + h[i]*M[i+1]
//     = 6*( (y[i+1]-y[i])/h[i] - (y[i]-y[i-1])/h[i-1] )
// and the natural rows M[0] = 0, M[n] = 0.

fn natural_moments(h: &[f64], y: &[f64]) -> CdeResult<Vec<f64>> {
    let n = h.len();
    let mut lower = vec![0.0; n];
    let mut diag = vec![1.0; n + 1];
    let mut upper = vec![0.0; n];
    let mut rhs = vec![0.0; n + 1];

    for i in 1..n {
        lower[i - 1] = h[i - 1];
        diag[i] = 2.0 * (h[i - 1] + h[i]);
        upper[i] = h[i];
        rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
    }

    solve_tridiagonal(&lower, &diag, &upper, &rhs)
}

/// Segment coefficients `[a, b, c, d]` from the knot moments.
fn cubic_coefs_from_moments(h: &[f64], y: &[f64], m: &[f64]) -> Vec<[f64; 4]> {
    (0..h.len())
        .map(|i| {
            let a = y[i];
            let b = (y[i + 1] - y[i]) / h[i] - h[i] * (2.0 * m[i] + m[i + 1]) / 6.0;
            let c = m[i] / 2.0;
            let d = (m[i + 1] - m[i]) / (6.0 * h[i]);
            [a, b, c, d]
        })
        .collect()
}

fn spacing(times: &[f64]) -> Vec<f64> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

fn series_coefficients(h: &[f64], y: &[f64]) -> CdeResult<Vec<[f64; 4]>> {
    let m = natural_moments(h, y)?;
    Ok(cubic_coefs_from_moments(h, y, &m))
}

/// Builds natural cubic spline coefficients from raw samples, imputing any
/// missing values first.
pub fn build_natural_cubic_spline_coefficients(
    times: &[f64],
    observations: &Observations,
) -> CdeResult<NaturalCubicCoefficients> {
    check_spline_times(times)?;
    let filled = impute(times, observations)?;
    let h = spacing(times);
    let segments = h.len();
    let channels = observations.channels();

    let mut a = Vec::with_capacity(filled.len());
    let mut b = Vec::with_capacity(filled.len());
    let mut c = Vec::with_capacity(filled.len());
    let mut d = Vec::with_capacity(filled.len());

    for values in &filled {
        let mut arrays = [
            DMatrix::zeros(segments, channels),
            DMatrix::zeros(segments, channels),
            DMatrix::zeros(segments, channels),
            DMatrix::zeros(segments, channels),
        ];
        for channel in 0..channels {
            let y: Vec<f64> = values.column(channel).iter().copied().collect();
            for (i, coefs) in series_coefficients(&h, &y)?.iter().enumerate() {
                for (array, coef) in arrays.iter_mut().zip(coefs.iter()) {
                    array[(i, channel)] = *coef;
                }
            }
        }
        let [ai, bi, ci, di] = arrays;
        a.push(ai);
        b.push(bi);
        c.push(ci);
        d.push(di);
    }

    debug!(
        batch = filled.len(),
        length = times.len(),
        channels,
        "built natural cubic spline coefficients"
    );
    NaturalCubicCoefficients::new(times.to_vec(), a, b, c, d)
}

/// Pulls a `batch × (4·segments·channels)` gradient on the flat coefficients
/// (laid out as in [`NaturalCubicSpline`]) back onto the raw observations.
///
/// The coefficients are linear in the imputed samples, so the pullback is
/// assembled from the spline of each unit impulse.
pub fn natural_cubic_spline_coefficients_vjp(
    times: &[f64],
    observations: &Observations,
    grad_coefficients: &DMatrix<f64>,
) -> CdeResult<Vec<DMatrix<f64>>> {
    check_spline_times(times)?;
    let length = times.len();
    let segments = length - 1;
    let channels = observations.channels();
    let expected = 4 * segments * channels;
    if grad_coefficients.nrows() != observations.batch_size()
        || grad_coefficients.ncols() != expected
    {
        return Err(CdeError::shape_mismatch(
            "spline coefficient gradient",
            format!("{}x{}", observations.batch_size(), expected),
            format!("{}x{}", grad_coefficients.nrows(), grad_coefficients.ncols()),
        ));
    }

    let h = spacing(times);
    let impulses = (0..length)
        .map(|j| {
            let mut y = vec![0.0; length];
            y[j] = 1.0;
            series_coefficients(&h, &y)
        })
        .collect::<CdeResult<Vec<_>>>()?;

    let grad_filled: Vec<DMatrix<f64>> = (0..observations.batch_size())
        .map(|batch| {
            DMatrix::from_fn(length, channels, |j, channel| {
                let mut acc = 0.0;
                for (i, coefs) in impulses[j].iter().enumerate() {
                    for (k, coef) in coefs.iter().enumerate() {
                        acc += grad_coefficients[(batch, (k * segments + i) * channels + channel)]
                            * coef;
                    }
                }
                acc
            })
        })
        .collect();

    impute_vjp(times, observations, &grad_filled)
}

// ─────────────────────────────────────────────
// NaturalCubicSpline
// ─────────────────────────────────────────────

/// A batch of natural cubic spline paths.
///
/// Flat coefficient layout per batch element: index
/// `(k * segments + i) * channels + channel`, where k = 0..4 selects a, b, c, d.
pub struct NaturalCubicSpline {
    coefficients: NaturalCubicCoefficients,
}

impl NaturalCubicSpline {
    pub fn new(coefficients: NaturalCubicCoefficients) -> NaturalCubicSpline {
        NaturalCubicSpline { coefficients }
    }

    pub fn coefficients(&self) -> &NaturalCubicCoefficients {
        &self.coefficients
    }

    fn locate(&self, t: f64) -> CdeResult<(usize, f64)> {
        let times = self.coefficients.times();
        let t = locate_in_interval(times, t)?;
        let i = find_segment(times, t);
        Ok((i, t - times[i]))
    }

    pub fn second_derivative(&self, t: f64) -> CdeResult<DMatrix<f64>> {
        let (i, tau) = self.locate(t)?;
        let coefs = &self.coefficients;
        Ok(DMatrix::from_fn(coefs.batch_size(), coefs.channels(), |b, ch| {
            2.0 * coefs.c[b][(i, ch)] + 6.0 * coefs.d[b][(i, ch)] * tau
        }))
    }

    fn flat_index(&self, k: usize, segment: usize, channel: usize) -> usize {
        (k * self.coefficients.segments() + segment) * self.coefficients.channels() + channel
    }

    fn pullback(&self, cotangent: &DMatrix<f64>, i: usize, weights: [f64; 4]) -> DMatrix<f64> {
        let mut grad = DMatrix::zeros(self.batch_size(), self.coefficient_count());
        for b in 0..self.batch_size() {
            for ch in 0..self.channels() {
                for (k, w) in weights.iter().enumerate() {
                    grad[(b, self.flat_index(k, i, ch))] += w * cotangent[(b, ch)];
                }
            }
        }
        grad
    }
}

impl Interpolant for NaturalCubicSpline {
    fn evaluate(&self, t: f64) -> CdeResult<DMatrix<f64>> {
        let (i, tau) = self.locate(t)?;
        let coefs = &self.coefficients;
        Ok(DMatrix::from_fn(coefs.batch_size(), coefs.channels(), |b, ch| {
            let mut result = coefs.d[b][(i, ch)];
            for beta in [coefs.c[b][(i, ch)], coefs.b[b][(i, ch)], coefs.a[b][(i, ch)]] {
                result = f64::mul_add(result, tau, beta);
            }
            result
        }))
    }

    fn derivative(&self, t: f64) -> CdeResult<DMatrix<f64>> {
        let (i, tau) = self.locate(t)?;
        let coefs = &self.coefficients;
        Ok(DMatrix::from_fn(coefs.batch_size(), coefs.channels(), |b, ch| {
            let inner = 2.0 * coefs.c[b][(i, ch)] + 3.0 * coefs.d[b][(i, ch)] * tau;
            coefs.b[b][(i, ch)] + inner * tau
        }))
    }
}

impl DifferentiablePath for NaturalCubicSpline {
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
        4 * self.coefficients.segments() * self.coefficients.channels()
    }

    fn evaluate_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>> {
        check_cotangent(cotangent, self.batch_size(), self.channels())?;
        let (i, tau) = self.locate(t)?;
        Ok(self.pullback(cotangent, i, [1.0, tau, tau * tau, tau * tau * tau]))
    }

    fn derivative_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>> {
        check_cotangent(cotangent, self.batch_size(), self.channels())?;
        let (i, tau) = self.locate(t)?;
        Ok(self.pullback(cotangent, i, [0.0, 1.0, 2.0 * tau, 3.0 * tau * tau]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::interpolation::interpolant::{derivative_many, evaluate_many};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn spline(times: &[f64], columns: &[&[f64]]) -> NaturalCubicSpline {
        let values = columns
            .iter()
            .map(|col| DMatrix::from_column_slice(col.len(), 1, col))
            .collect();
        let obs = Observations::from_nan(values).unwrap();
        NaturalCubicSpline::new(build_natural_cubic_spline_coefficients(times, &obs).unwrap())
    }

    #[test]
    fn zigzag_scenario() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let values = [0.0, 1.0, 0.0, 1.0];
        let s = spline(&times, &[&values]);

        for (t, v) in times.iter().zip(values.iter()) {
            assert_abs_diff_eq!(s.evaluate(*t).unwrap()[(0, 0)], *v, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(s.second_derivative(0.0).unwrap()[(0, 0)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.second_derivative(3.0).unwrap()[(0, 0)], 0.0, epsilon = 1e-12);

        let at_1 = s.evaluate(1.0).unwrap()[(0, 0)];
        let at_2 = s.evaluate(2.0).unwrap()[(0, 0)];
        let mid = s.evaluate(1.5).unwrap()[(0, 0)];
        assert!(mid > at_2.min(at_1) && mid < at_2.max(at_1));
        assert_abs_diff_eq!(mid, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn missing_knot_is_imputed_before_the_solve() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let s = spline(&times, &[&[0.0, f64::NAN, 0.0, 1.0]]);
        assert_abs_diff_eq!(s.evaluate(1.0).unwrap()[(0, 0)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.evaluate(3.0).unwrap()[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn continuous_value_and_slope_at_interior_knots() {
        let times = [0.0, 0.4, 1.5, 2.0, 3.7, 4.0];
        let values = [1.0, -0.5, 2.0, 0.3, 0.9, -1.2];
        let s = spline(&times, &[&values, &[0.0, 1.0, 4.0, 9.0, 16.0, 25.0]]);
        let coefs = s.coefficients();
        for ch in 0..2 {
            for i in 1..times.len() - 1 {
                let h = times[i] - times[i - 1];
                let (a, b, c, d) = (
                    coefs.a()[0][(i - 1, ch)],
                    coefs.b()[0][(i - 1, ch)],
                    coefs.c()[0][(i - 1, ch)],
                    coefs.d()[0][(i - 1, ch)],
                );
                let left_value = a + b * h + c * h * h + d * h * h * h;
                let left_slope = b + 2.0 * c * h + 3.0 * d * h * h;
                assert_abs_diff_eq!(left_value, coefs.a()[0][(i, ch)], epsilon = 1e-10);
                assert_abs_diff_eq!(left_slope, coefs.b()[0][(i, ch)], epsilon = 1e-10);
            }
            let n = times.len() - 1;
            assert_abs_diff_eq!(s.second_derivative(times[n]).unwrap()[(0, ch)], 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(s.second_derivative(times[0]).unwrap()[(0, ch)], 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn converges_to_a_smooth_generator() {
        let max_error = |knots: usize| {
            let times: Vec<f64> = (0..knots)
                .map(|i| i as f64 * std::f64::consts::TAU / (knots - 1) as f64)
                .collect();
            let values: Vec<f64> = times.iter().map(|t| t.sin()).collect();
            let s = spline(&times, &[&values]);
            (0..200)
                .map(|k| k as f64 * std::f64::consts::TAU / 199.0)
                .map(|t| (s.evaluate(t).unwrap()[(0, 0)] - t.sin()).abs())
                .fold(0.0, f64::max)
        };
        let coarse = max_error(8);
        let medium = max_error(16);
        let fine = max_error(32);
        assert!(medium < coarse);
        assert!(fine < medium);
        assert!(fine < 1e-4);
    }

    #[test]
    fn rejects_short_or_unsorted_times() {
        let obs = Observations::from_dense(vec![DMatrix::from_element(3, 1, 1.0)]).unwrap();
        let err = build_natural_cubic_spline_coefficients(&[0.0, 1.0, 2.0], &obs).unwrap_err();
        assert!(matches!(err, CdeError::DomainError(_)));

        let obs = Observations::from_dense(vec![DMatrix::from_element(4, 1, 1.0)]).unwrap();
        let err =
            build_natural_cubic_spline_coefficients(&[0.0, 1.0, 1.0, 2.0], &obs).unwrap_err();
        assert!(matches!(err, CdeError::DomainError(_)));
    }

    #[test]
    fn all_missing_channel_is_a_data_error() {
        let obs = Observations::from_nan(vec![DMatrix::from_element(4, 1, f64::NAN)]).unwrap();
        let err =
            build_natural_cubic_spline_coefficients(&[0.0, 1.0, 2.0, 3.0], &obs).unwrap_err();
        assert!(matches!(err, CdeError::DataError(_)));
    }

    #[test]
    fn out_of_range_query_fails() {
        let s = spline(&[0.0, 1.0, 2.0, 3.0], &[&[0.0, 1.0, 0.0, 1.0]]);
        assert!(s.evaluate(3.5).is_err());
        assert!(s.derivative(-1.0).is_err());
    }

    #[test]
    fn coefficient_vjp_matches_finite_differences() {
        let times = [0.0, 0.5, 1.7, 2.0, 3.0];
        let raw = [0.3, f64::NAN, -1.0, 2.0, 0.5];
        let obs = Observations::from_nan(vec![DMatrix::from_column_slice(5, 1, &raw)]).unwrap();
        let coefs = build_natural_cubic_spline_coefficients(&times, &obs).unwrap();
        let s = NaturalCubicSpline::new(coefs);
        let n = s.coefficient_count();
        let weights = DMatrix::from_fn(1, n, |_, k| ((k * 7 % 11) as f64 - 5.0) / 3.0);

        let loss = |values: &[f64]| {
            let obs = Observations::from_nan(vec![DMatrix::from_column_slice(5, 1, values)]).unwrap();
            let s = NaturalCubicSpline::new(build_natural_cubic_spline_coefficients(&times, &obs).unwrap());
            let mut flat = DMatrix::zeros(1, n);
            for k in 0..4 {
                let array = [s.coefficients().a(), s.coefficients().b(), s.coefficients().c(), s.coefficients().d()][k];
                for i in 0..4 {
                    flat[(0, s.flat_index(k, i, 0))] = array[0][(i, 0)];
                }
            }
            flat.dot(&weights)
        };

        let grad = natural_cubic_spline_coefficients_vjp(&times, &obs, &weights).unwrap();
        assert_eq!(grad[0][(1, 0)], 0.0);
        for j in [0usize, 2, 3, 4] {
            let mut bumped = raw;
            bumped[j] += 1e-6;
            let fd = (loss(&bumped[..]) - loss(&raw[..])) / 1e-6;
            assert_relative_eq!(grad[0][(j, 0)], fd, epsilon = 1e-4, max_relative = 1e-5);
        }
    }

    #[test]
    fn path_vjps_match_coefficient_perturbations() {
        let s = spline(&[0.0, 1.0, 2.0, 3.0], &[&[0.0, 1.0, 0.0, 1.0]]);
        let cot = DMatrix::from_element(1, 1, 1.0);
        let t = 1.25;
        let g_value = s.evaluate_vjp(t, &cot).unwrap();
        let g_slope = s.derivative_vjp(t, &cot).unwrap();
        let tau = 0.25;
        assert_relative_eq!(g_value[(0, s.flat_index(0, 1, 0))], 1.0);
        assert_relative_eq!(g_value[(0, s.flat_index(3, 1, 0))], tau * tau * tau);
        assert_relative_eq!(g_slope[(0, s.flat_index(2, 1, 0))], 2.0 * tau);
        assert_eq!(g_slope[(0, s.flat_index(1, 0, 0))], 0.0);
        assert_relative_eq!(g_value.sum(), 1.0 + tau + tau * tau + tau * tau * tau);
    }

    #[test]
    fn coefficients_round_trip_through_json() {
        let s = spline(&[0.0, 1.0, 2.0, 3.0], &[&[0.0, 1.0, 0.0, 1.0], &[2.0, 2.5, 1.0, 0.0]]);
        let json = serde_json::to_string(s.coefficients()).unwrap();
        let back: NaturalCubicCoefficients = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size(), 2);
        let reloaded = NaturalCubicSpline::new(back);
        assert_abs_diff_eq!(
            reloaded.evaluate(2.2).unwrap(),
            s.evaluate(2.2).unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn malformed_bundles_fail_to_load() {
        let empty = r#"{"times":[0,1,2,3],"a":[],"b":[],"c":[],"d":[]}"#;
        assert!(serde_json::from_str::<NaturalCubicCoefficients>(empty).is_err());

        let s = spline(&[0.0, 1.0, 2.0, 3.0], &[&[0.0, 1.0, 0.0, 1.0]]);
        let valid = serde_json::to_value(s.coefficients()).unwrap();

        let mut unsorted = valid.clone();
        unsorted["times"] = serde_json::json!([0.0, 2.0, 1.0, 3.0]);
        assert!(serde_json::from_value::<NaturalCubicCoefficients>(unsorted).is_err());

        let mut extra_time = valid.clone();
        extra_time["times"] = serde_json::json!([0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(serde_json::from_value::<NaturalCubicCoefficients>(extra_time).is_err());

        let mut short_batch = valid;
        short_batch["d"] = serde_json::json!([]);
        assert!(serde_json::from_value::<NaturalCubicCoefficients>(short_batch).is_err());
    }

    #[test]
    fn batched_queries_agree_with_single_queries() {
        let s = spline(
            &[0.0, 1.0, 2.0, 3.0],
            &[&[0.0, 1.0, 0.0, 1.0], &[2.0, -1.0, 0.5, 3.0]],
        );
        let times = [0.0, 0.5, 1.0, 1.5, 3.0];
        let values = evaluate_many(&s, &times).unwrap();
        let slopes = derivative_many(&s, &times).unwrap();
        assert_eq!(values.len(), times.len());
        assert_eq!(slopes.len(), times.len());
        for (k, &t) in times.iter().enumerate() {
            assert_eq!(values[k], s.evaluate(t).unwrap());
            assert_eq!(slopes[k], s.derivative(t).unwrap());
            assert_eq!(values[k].shape(), (2, 1));
        }

        let path: &dyn DifferentiablePath = &s;
        assert_eq!(evaluate_many(path, &times).unwrap(), values);
        assert!(evaluate_many(path, &[]).unwrap().is_empty());

        assert!(matches!(
            evaluate_many(&s, &[0.5, 4.0]),
            Err(CdeError::DomainError(_))
        ));
        assert!(matches!(
            derivative_many(&s, &[f64::NAN]),
            Err(CdeError::DomainError(_))
        ));
    }
}
