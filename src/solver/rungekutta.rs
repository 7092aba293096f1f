use nalgebra::DVector;
use tracing::{debug, trace};

use crate::cdeerror::{CdeError, CdeResult};
use crate::solver::odesolver::{OdeRhs, OdeSolver, check_time_grid};
use crate::solver::solveroptions::{SolverMethod, SolverOptions};

/// Explicit Runge-Kutta family: fixed-step Euler, midpoint and RK4, and the
/// adaptive Dormand-Prince 5(4) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct RungeKuttaSolver;

impl OdeSolver for RungeKuttaSolver {
    fn solve(
        &self,
        rhs: &OdeRhs<'_>,
        y0: &DVector<f64>,
        times: &[f64],
        options: &SolverOptions,
    ) -> CdeResult<Vec<DVector<f64>>> {
        options.validate()?;
        let direction = check_time_grid(times)?;
        if y0.iter().any(|v| !v.is_finite()) {
            return Err(CdeError::SolverError("initial state is not finite".to_owned()));
        }
        match options.method {
            SolverMethod::Dopri5 => dopri5(rhs, y0, times, direction, options),
            method => fixed_grid(method, rhs, y0, times, options),
        }
    }
}

fn ensure_finite(y: &DVector<f64>, t: f64) -> CdeResult<()> {
    if y.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CdeError::SolverError(format!("state became non-finite at t={:.6e}", t)))
    }
}

// ─────────────────────────────────────────────
// Fixed step
// ─────────────────────────────────────────────

fn fixed_step(
    method: SolverMethod,
    rhs: &OdeRhs<'_>,
    t: f64,
    y: &DVector<f64>,
    h: f64,
) -> CdeResult<DVector<f64>> {
    match method {
        SolverMethod::Euler => Ok(y + rhs(t, y)? * h),
        SolverMethod::Midpoint => {
            let k1 = rhs(t, y)?;
            let k2 = rhs(t + 0.5 * h, &(y + &k1 * (0.5 * h)))?;
            Ok(y + k2 * h)
        }
        _ => {
            let k1 = rhs(t, y)?;
            let k2 = rhs(t + 0.5 * h, &(y + &k1 * (0.5 * h)))?;
            let k3 = rhs(t + 0.5 * h, &(y + &k2 * (0.5 * h)))?;
            let k4 = rhs(t + h, &(y + &k3 * h))?;
            Ok(y + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0))
        }
    }
}

fn fixed_grid(
    method: SolverMethod,
    rhs: &OdeRhs<'_>,
    y0: &DVector<f64>,
    times: &[f64],
    options: &SolverOptions,
) -> CdeResult<Vec<DVector<f64>>> {
    let mut solution = Vec::with_capacity(times.len());
    solution.push(y0.clone());
    let mut y = y0.clone();
    let mut steps = 0usize;

    for window in times.windows(2) {
        let (t_start, t_end) = (window[0], window[1]);
        let span = t_end - t_start;
        let substeps = options
            .step_size
            .map(|step| ((span.abs() / step).ceil() as usize).max(1))
            .unwrap_or(1);
        steps += substeps;
        if steps > options.max_num_steps {
            return Err(CdeError::SolverError(format!(
                "{:?} exceeded max_num_steps={} before t={:.6e}",
                method, options.max_num_steps, t_end
            )));
        }
        let h = span / substeps as f64;
        for k in 0..substeps {
            let t = t_start + k as f64 * h;
            y = fixed_step(method, rhs, t, &y, h)?;
            ensure_finite(&y, t + h)?;
        }
        solution.push(y.clone());
    }

    debug!(?method, steps, "fixed-step solve finished");
    Ok(solution)
}

// ─────────────────────────────────────────────
// Dormand-Prince 5(4)
// ─────────────────────────────────────────────

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights, also the last stage row (FSAL)
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 5th-order minus embedded 4th-order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

fn error_norm(error: &DVector<f64>, y: &DVector<f64>, y_new: &DVector<f64>, options: &SolverOptions) -> f64 {
    if error.is_empty() {
        return 0.0;
    }
    let sum: f64 = error
        .iter()
        .zip(y.iter().zip(y_new.iter()))
        .map(|(e, (a, b))| {
            let scale = options.atol + options.rtol * a.abs().max(b.abs());
            let r = e / scale;
            r * r
        })
        .sum();
    (sum / error.len() as f64).sqrt()
}

/// Hairer-Wanner starting step, capped by `limit`.
fn initial_step(
    rhs: &OdeRhs<'_>,
    t0: f64,
    y0: &DVector<f64>,
    f0: &DVector<f64>,
    direction: f64,
    limit: f64,
    options: &SolverOptions,
) -> CdeResult<f64> {
    if let Some(first) = options.first_step {
        return Ok(first.min(limit));
    }
    let scale = y0.map(|v| options.atol + options.rtol * v.abs());
    let rms = |v: &DVector<f64>| {
        if v.is_empty() {
            0.0
        } else {
            (v.component_div(&scale).norm_squared() / v.len() as f64).sqrt()
        }
    };
    let d0 = rms(y0);
    let d1 = rms(f0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
    let h0 = h0.min(limit);

    let y1 = y0 + f0 * (direction * h0);
    let f1 = rhs(t0 + direction * h0, &y1)?;
    let d2 = rms(&(f1 - f0)) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / 5.0)
    };
    Ok((100.0 * h0).min(h1).min(limit))
}

fn dopri5(
    rhs: &OdeRhs<'_>,
    y0: &DVector<f64>,
    times: &[f64],
    direction: f64,
    options: &SolverOptions,
) -> CdeResult<Vec<DVector<f64>>> {
    let mut solution = Vec::with_capacity(times.len());
    solution.push(y0.clone());

    let mut t = times[0];
    let mut y = y0.clone();
    let mut k1 = rhs(t, &y)?;
    let total_span = (times[times.len() - 1] - times[0]).abs();
    let max_step = options.max_step.unwrap_or(f64::INFINITY);
    let mut h_abs = initial_step(rhs, t, &y, &k1, direction, total_span.min(max_step), options)?;

    let mut accepted = 0usize;
    let mut rejected = 0usize;

    for &target in &times[1..] {
        while (target - t) * direction > 0.0 {
            if accepted + rejected >= options.max_num_steps {
                return Err(CdeError::SolverError(format!(
                    "dopri5 exceeded max_num_steps={} at t={:.6e} before reaching t={:.6e}",
                    options.max_num_steps, t, target
                )));
            }
            let min_step = 16.0 * f64::EPSILON * t.abs().max(1.0);
            if !h_abs.is_finite() || h_abs < min_step {
                return Err(CdeError::SolverError(format!(
                    "dopri5 step size underflow at t={:.6e}",
                    t
                )));
            }

            let remaining = (target - t).abs();
            h_abs = h_abs.min(max_step);
            let (t_new, h) = if h_abs >= remaining {
                (target, target - t)
            } else {
                (t + direction * h_abs, direction * h_abs)
            };

            let k2 = rhs(t + C2 * h, &(&y + &k1 * (h * A21)))?;
            let k3 = rhs(t + C3 * h, &(&y + (&k1 * A31 + &k2 * A32) * h))?;
            let k4 = rhs(t + C4 * h, &(&y + (&k1 * A41 + &k2 * A42 + &k3 * A43) * h))?;
            let k5 = rhs(
                t + C5 * h,
                &(&y + (&k1 * A51 + &k2 * A52 + &k3 * A53 + &k4 * A54) * h),
            )?;
            let k6 = rhs(
                t_new,
                &(&y + (&k1 * A61 + &k2 * A62 + &k3 * A63 + &k4 * A64 + &k5 * A65) * h),
            )?;
            let y_new = &y + (&k1 * B1 + &k3 * B3 + &k4 * B4 + &k5 * B5 + &k6 * B6) * h;
            let k7 = rhs(t_new, &y_new)?;

            let error = (&k1 * E1 + &k3 * E3 + &k4 * E4 + &k5 * E5 + &k6 * E6 + &k7 * E7) * h;
            let err = error_norm(&error, &y, &y_new, options);

            let step_ok = err.is_finite() && err <= 1.0 && y_new.iter().all(|v| v.is_finite());
            let factor = if !err.is_finite() {
                MIN_FACTOR
            } else if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            };

            if step_ok {
                t = t_new;
                y = y_new;
                k1 = k7;
                accepted += 1;
                h_abs = h.abs() * factor;
            } else {
                rejected += 1;
                h_abs = h.abs() * factor.min(1.0);
                trace!(t, err, "dopri5 rejected step");
            }
        }
        solution.push(y.clone());
    }

    debug!(accepted, rejected, "dopri5 solve finished");
    Ok(solution)
}
