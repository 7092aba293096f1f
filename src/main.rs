use std::env;
use std::f64::consts::PI;
use std::process::ExitCode;

use nalgebra::{DMatrix, DVector};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use controlde::cde::cdeint::cdeint;
use controlde::cde::sensitivity::CdeGradients;
use controlde::cde::vectorfield::MlpVectorField;
use controlde::cdeerror::CdeResult;
use controlde::configuration::{Configuration, PathKind, SpiralSettings};
use controlde::math::interpolation::interpolant::{DifferentiablePath, Interpolant};
use controlde::math::interpolation::linearinterpolation::{
    LinearInterpolation, Reparameterisation, build_linear_coefficients,
};
use controlde::math::interpolation::naturalcubicspline::{
    NaturalCubicSpline, build_natural_cubic_spline_coefficients,
};
use controlde::math::interpolation::observations::Observations;

const CHANNELS: usize = 3;

/// Channels `[t, x, y]` of a decaying spiral, one per batch element, with
/// alternating orientation and a per-element phase.
fn spiral_samples(settings: &SpiralSettings) -> (Vec<f64>, Vec<DMatrix<Option<f64>>>) {
    let span = 4.0 * PI;
    let times: Vec<f64> = (0..settings.length)
        .map(|l| span * l as f64 / (settings.length - 1) as f64)
        .collect();
    let values = (0..settings.batch)
        .map(|b| {
            let phase = 0.5 * b as f64;
            let orientation = if b % 2 == 0 { 1.0 } else { -1.0 };
            DMatrix::from_fn(settings.length, CHANNELS, |l, c| {
                let t = times[l];
                let radius = (-0.1 * t).exp();
                let dropped = settings.missing_every > 0
                    && c == 1
                    && l % settings.missing_every == settings.missing_every / 2;
                match c {
                    _ if dropped => None,
                    0 => Some(t / span),
                    1 => Some(radius * (t + phase).cos()),
                    _ => Some(orientation * radius * (t + phase).sin()),
                }
            })
        })
        .collect();
    (times, values)
}

fn build_path(
    settings: &SpiralSettings,
    times: &[f64],
    observations: &Observations,
) -> CdeResult<Box<dyn DifferentiablePath>> {
    Ok(match settings.path {
        PathKind::NaturalCubic => Box::new(NaturalCubicSpline::new(
            build_natural_cubic_spline_coefficients(times, observations)?,
        )),
        PathKind::Linear => Box::new(LinearInterpolation::new(build_linear_coefficients(
            times,
            observations,
        )?)),
        PathKind::SmoothstepLinear => Box::new(LinearInterpolation::with_reparameterisation(
            build_linear_coefficients(times, observations)?,
            Reparameterisation::Smoothstep,
        )),
    })
}

fn initial_field(settings: &SpiralSettings) -> CdeResult<MlpVectorField> {
    let (hidden, width) = (settings.hidden, settings.width);
    let count = width * hidden + width + CHANNELS * hidden * width + CHANNELS * hidden;
    let scale = 1.0 / (width as f64).sqrt();
    let parameters = DVector::from_fn(count, |k, _| {
        scale * (((k * 7919 + 13) % 1000) as f64 / 1000.0 - 0.5)
    });
    MlpVectorField::from_parameters(CHANNELS, hidden, width, &parameters)
}

fn run_mode(
    path: &dyn DifferentiablePath,
    field: &MlpVectorField,
    z0: &DMatrix<f64>,
    times: &[f64],
    adjoint: bool,
    configuration: &Configuration,
) -> CdeResult<CdeGradients> {
    let solution = cdeint(path, field, z0, times, adjoint, configuration.options())?;
    let final_state = solution.final_state().clone();
    let loss = 0.5 * final_state.norm_squared();

    let mut grad_outputs = vec![DMatrix::zeros(z0.nrows(), z0.ncols()); times.len()];
    grad_outputs[times.len() - 1] = final_state;
    let gradients = solution.backward(&grad_outputs)?;
    info!(
        adjoint,
        loss,
        z0_gradient = gradients.z0.norm(),
        parameter_gradient = gradients.parameters.norm(),
        control_gradient = gradients.control.as_ref().map(|c| c.norm()),
        "solve finished"
    );
    Ok(gradients)
}

fn run(configuration: &Configuration) -> CdeResult<()> {
    let settings = configuration.spiral();
    let (times, values) = spiral_samples(settings);
    let observations = Observations::new(values)?;
    info!(
        batch = settings.batch,
        length = settings.length,
        missing = observations.missing_count(),
        path = ?settings.path,
        "spiral samples"
    );

    let path = build_path(settings, &times, &observations)?;
    let field = initial_field(settings)?;
    let x0 = path.evaluate(times[0])?;
    let z0 = DMatrix::from_fn(settings.batch, settings.hidden, |b, h| x0[(b, h % CHANNELS)]);

    let adjoint = run_mode(path.as_ref(), &field, &z0, &times, true, configuration)?;
    let direct = run_mode(path.as_ref(), &field, &z0, &times, false, configuration)?;
    info!(
        z0_gap = (&adjoint.z0 - &direct.z0).amax(),
        parameter_gap = (&adjoint.parameters - &direct.parameters).amax(),
        "adjoint against direct sensitivities"
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let configuration = match env::args().nth(1) {
        Some(file_path) => Configuration::from_reader(&file_path),
        None => Ok(Configuration::default()),
    };
    match configuration.and_then(|configuration| run(&configuration)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "controlde failed");
            ExitCode::FAILURE
        }
    }
}
