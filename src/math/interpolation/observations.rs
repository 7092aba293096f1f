use nalgebra::DMatrix;
use tracing::debug;

use crate::cdeerror::{CdeError, CdeResult};

/// Raw samples of a batch of time series.
///
/// One `length × channels` matrix per batch element; `None` marks a missing
/// sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    values: Vec<DMatrix<Option<f64>>>,
    length: usize,
    channels: usize,
}

impl Observations {
    pub fn new(values: Vec<DMatrix<Option<f64>>>) -> CdeResult<Observations> {
        let first = values
            .first()
            .ok_or_else(|| CdeError::DataError("empty observation batch".to_owned()))?;
        let (length, channels) = first.shape();
        for matrix in &values {
            if matrix.shape() != (length, channels) {
                return Err(CdeError::shape_mismatch(
                    "observations",
                    format!("{}x{}", length, channels),
                    format!("{}x{}", matrix.nrows(), matrix.ncols()),
                ));
            }
            if matrix.iter().flatten().any(|v| !v.is_finite()) {
                return Err(CdeError::DataError(
                    "observed samples must be finite".to_owned(),
                ));
            }
        }
        Ok(Observations {
            values,
            length,
            channels,
        })
    }

    /// Fully observed samples.
    pub fn from_dense(values: Vec<DMatrix<f64>>) -> CdeResult<Observations> {
        Self::new(values.into_iter().map(|m| m.map(Some)).collect())
    }

    /// Samples where NaN marks a missing value.
    pub fn from_nan(values: Vec<DMatrix<f64>>) -> CdeResult<Observations> {
        Self::new(
            values
                .into_iter()
                .map(|m| m.map(|v| if v.is_nan() { None } else { Some(v) }))
                .collect(),
        )
    }

    pub fn batch_size(&self) -> usize {
        self.values.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn values(&self) -> &[DMatrix<Option<f64>>] {
        &self.values
    }

    pub fn missing_count(&self) -> usize {
        self.values
            .iter()
            .map(|m| m.iter().filter(|v| v.is_none()).count())
            .sum()
    }

    fn mask(&self, batch: usize, channel: usize) -> Vec<bool> {
        self.values[batch]
            .column(channel)
            .iter()
            .map(|v| v.is_some())
            .collect()
    }
}

/// Where an imputed sample takes its value from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fill {
    Observed,
    Copy(usize),
    Blend { lo: usize, hi: usize, weight_hi: f64 },
}

fn fill_plan(times: &[f64], observed: &[bool]) -> Option<Vec<Fill>> {
    let indices: Vec<usize> = (0..observed.len()).filter(|&i| observed[i]).collect();
    let first = *indices.first()?;
    let last = *indices.last()?;

    let mut plan = Vec::with_capacity(observed.len());
    let mut next = 0;
    for i in 0..observed.len() {
        if observed[i] {
            plan.push(Fill::Observed);
            next += 1;
        } else if i < first {
            plan.push(Fill::Copy(first));
        } else if i > last {
            plan.push(Fill::Copy(last));
        } else {
            let lo = indices[next - 1];
            let hi = indices[next];
            let span = times[hi] - times[lo];
            let weight_hi = if span > 0.0 {
                (times[i] - times[lo]) / span
            } else {
                0.0
            };
            plan.push(Fill::Blend { lo, hi, weight_hi });
        }
    }
    Some(plan)
}

fn plans(times: &[f64], observations: &Observations) -> CdeResult<Vec<Vec<Vec<Fill>>>> {
    if times.len() != observations.length() {
        return Err(CdeError::shape_mismatch(
            "observation times",
            observations.length(),
            times.len(),
        ));
    }
    (0..observations.batch_size())
        .map(|b| {
            (0..observations.channels())
                .map(|c| {
                    fill_plan(times, &observations.mask(b, c)).ok_or_else(|| {
                        CdeError::DataError(format!(
                            "channel {} of batch element {} has no observed values",
                            c, b
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

/// Fills missing samples channel by channel.
///
/// Interior gaps are linearly interpolated in time between the nearest
/// observed neighbours; leading gaps take the first observation and trailing
/// gaps the last one.
pub fn impute(times: &[f64], observations: &Observations) -> CdeResult<Vec<DMatrix<f64>>> {
    let plans = plans(times, observations)?;
    let missing = observations.missing_count();
    if missing > 0 {
        debug!(missing, "imputing missing observations");
    }

    let filled = observations
        .values()
        .iter()
        .zip(plans.iter())
        .map(|(raw, channel_plans)| {
            DMatrix::from_fn(observations.length(), observations.channels(), |i, c| {
                let observed = |j: usize| raw[(j, c)].unwrap_or(0.0);
                match channel_plans[c][i] {
                    Fill::Observed => observed(i),
                    Fill::Copy(source) => observed(source),
                    Fill::Blend { lo, hi, weight_hi } => {
                        (1.0 - weight_hi) * observed(lo) + weight_hi * observed(hi)
                    }
                }
            })
        })
        .collect();
    Ok(filled)
}

/// Pulls a gradient on the imputed samples back onto the observed ones.
/// Missing entries receive zero.
pub fn impute_vjp(
    times: &[f64],
    observations: &Observations,
    grad_filled: &[DMatrix<f64>],
) -> CdeResult<Vec<DMatrix<f64>>> {
    let plans = plans(times, observations)?;
    if grad_filled.len() != observations.batch_size() {
        return Err(CdeError::shape_mismatch(
            "imputation gradient batch",
            observations.batch_size(),
            grad_filled.len(),
        ));
    }

    let mut grads = Vec::with_capacity(grad_filled.len());
    for (grad, channel_plans) in grad_filled.iter().zip(plans.iter()) {
        if grad.shape() != (observations.length(), observations.channels()) {
            return Err(CdeError::shape_mismatch(
                "imputation gradient",
                format!("{}x{}", observations.length(), observations.channels()),
                format!("{}x{}", grad.nrows(), grad.ncols()),
            ));
        }
        let mut out = DMatrix::zeros(observations.length(), observations.channels());
        for (c, plan) in channel_plans.iter().enumerate() {
            for (i, fill) in plan.iter().enumerate() {
                let g = grad[(i, c)];
                match *fill {
                    Fill::Observed => out[(i, c)] += g,
                    Fill::Copy(source) => out[(source, c)] += g,
                    Fill::Blend { lo, hi, weight_hi } => {
                        out[(lo, c)] += (1.0 - weight_hi) * g;
                        out[(hi, c)] += weight_hi * g;
                    }
                }
            }
        }
        grads.push(out);
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn single(column: &[f64]) -> Observations {
        Observations::from_nan(vec![DMatrix::from_column_slice(column.len(), 1, column)]).unwrap()
    }

    #[test]
    fn interior_gap_is_linearly_interpolated() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let obs = single(&[0.0, f64::NAN, 2.0, 1.0]);
        let filled = impute(&times, &obs).unwrap();
        assert_abs_diff_eq!(filled[0][(1, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn interpolation_respects_irregular_times() {
        let times = [0.0, 1.0, 4.0];
        let obs = single(&[0.0, f64::NAN, 8.0]);
        let filled = impute(&times, &obs).unwrap();
        assert_abs_diff_eq!(filled[0][(1, 0)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn edges_are_filled_from_nearest_observation() {
        let times = [0.0, 1.0, 2.0, 3.0, 4.0];
        let obs = single(&[f64::NAN, f64::NAN, 5.0, 7.0, f64::NAN]);
        let filled = impute(&times, &obs).unwrap();
        let column: Vec<f64> = filled[0].column(0).iter().copied().collect();
        assert_eq!(column, vec![5.0, 5.0, 5.0, 7.0, 7.0]);
    }

    #[test]
    fn all_missing_channel_is_a_data_error() {
        let times = [0.0, 1.0];
        let obs = Observations::from_nan(vec![DMatrix::from_row_slice(
            2,
            2,
            &[1.0, f64::NAN, 2.0, f64::NAN],
        )])
        .unwrap();
        assert!(matches!(impute(&times, &obs), Err(CdeError::DataError(_))));
    }

    #[test]
    fn dense_rejects_non_finite_values() {
        let result = Observations::from_dense(vec![DMatrix::from_element(2, 1, f64::INFINITY)]);
        assert!(matches!(result, Err(CdeError::DataError(_))));
    }

    #[test]
    fn vjp_routes_gradient_to_fill_sources() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let obs = single(&[f64::NAN, 2.0, f64::NAN, 4.0]);
        let grad = vec![DMatrix::from_column_slice(4, 1, &[1.0, 10.0, 100.0, 1000.0])];
        let back = impute_vjp(&times, &obs, &grad).unwrap();
        let column: Vec<f64> = back[0].column(0).iter().copied().collect();
        assert_eq!(column, vec![0.0, 1.0 + 10.0 + 50.0, 0.0, 1000.0 + 50.0]);
    }
}
