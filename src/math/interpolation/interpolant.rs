use nalgebra::DMatrix;

use crate::cdeerror::{CdeError, CdeResult};

/// A continuous control path X(t).
///
/// Both operations return one row per batch element and one column per
/// channel. Queries outside the path interval fail with a domain error.
pub trait Interpolant {
    fn evaluate(&self, t: f64) -> CdeResult<DMatrix<f64>>;

    fn derivative(&self, t: f64) -> CdeResult<DMatrix<f64>>;
}

/// A path whose value and derivative are linear in a flat coefficient vector,
/// so cotangents can be pulled back onto those coefficients.
///
/// Gradients are `batch_size × coefficient_count` matrices: row `b` holds the
/// gradient with respect to the coefficients of batch element `b`.
pub trait DifferentiablePath: Interpolant {
    fn batch_size(&self) -> usize;

    fn channels(&self) -> usize;

    fn interval(&self) -> (f64, f64);

    /// Number of coefficients per batch element.
    fn coefficient_count(&self) -> usize;

    fn evaluate_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>>;

    fn derivative_vjp(&self, t: f64, cotangent: &DMatrix<f64>) -> CdeResult<DMatrix<f64>>;
}

pub fn evaluate_many<P: Interpolant + ?Sized>(
    path: &P,
    times: &[f64],
) -> CdeResult<Vec<DMatrix<f64>>> {
    times.iter().map(|&t| path.evaluate(t)).collect()
}

pub fn derivative_many<P: Interpolant + ?Sized>(
    path: &P,
    times: &[f64],
) -> CdeResult<Vec<DMatrix<f64>>> {
    times.iter().map(|&t| path.derivative(t)).collect()
}

/// Clamps `t` into `[times[0], times[last]]`, tolerating a few ulps of
/// overshoot from solver stage arithmetic; anything further is a domain error.
pub(crate) fn locate_in_interval(times: &[f64], t: f64) -> CdeResult<f64> {
    let min = times[0];
    let max = times[times.len() - 1];
    let slack = 64.0 * f64::EPSILON * min.abs().max(max.abs()).max(1.0);
    if !t.is_finite() || t < min - slack || t > max + slack {
        return Err(CdeError::out_of_domain(t, min, max));
    }
    Ok(t.clamp(min, max))
}

/// Index of the segment `[times[i], times[i + 1]]` used for `t`.
///
/// An interior knot belongs to the segment it closes; the first knot belongs
/// to segment 0 and the final knot to the last segment, even when that
/// segment has zero length.
pub(crate) fn find_segment(times: &[f64], t: f64) -> usize {
    if t >= times[times.len() - 1] {
        return times.len() - 2;
    }
    let first_not_below = times.partition_point(|&knot| knot < t);
    first_not_below.max(1).min(times.len() - 1) - 1
}

pub(crate) fn check_cotangent(
    cotangent: &DMatrix<f64>,
    batch_size: usize,
    channels: usize,
) -> CdeResult<()> {
    if cotangent.nrows() != batch_size || cotangent.ncols() != channels {
        return Err(CdeError::shape_mismatch(
            "path cotangent",
            format!("{}x{}", batch_size, channels),
            format!("{}x{}", cotangent.nrows(), cotangent.ncols()),
        ));
    }
    Ok(())
}
