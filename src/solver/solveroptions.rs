use serde::{Deserialize, Serialize};

use crate::cdeerror::{CdeError, CdeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    /// Explicit Euler, fixed step.
    Euler,
    /// Explicit midpoint, fixed step.
    Midpoint,
    /// Classic fourth-order Runge-Kutta, fixed step.
    Rk4,
    /// Dormand-Prince 5(4) with adaptive step-size control.
    #[default]
    Dopri5,
}

impl SolverMethod {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, SolverMethod::Dopri5)
    }
}

/// Options handed to every solve.
///
/// | field           | default  | used by         |
/// |-----------------|----------|-----------------|
/// | `method`        | `dopri5` | all             |
/// | `rtol`          | 1e-7     | adaptive        |
/// | `atol`          | 1e-9     | adaptive        |
/// | `step_size`     | none     | fixed step      |
/// | `first_step`    | none     | adaptive        |
/// | `max_step`      | none     | adaptive        |
/// | `max_num_steps` | 100000   | all             |
///
/// A fixed-step method without `step_size` takes one step per output
/// interval. An adaptive method without `first_step` picks its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    pub method: SolverMethod,
    pub rtol: f64,
    pub atol: f64,
    pub step_size: Option<f64>,
    pub first_step: Option<f64>,
    pub max_step: Option<f64>,
    pub max_num_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            method: SolverMethod::Dopri5,
            rtol: 1e-7,
            atol: 1e-9,
            step_size: None,
            first_step: None,
            max_step: None,
            max_num_steps: 100_000,
        }
    }
}

impl SolverOptions {
    pub fn fixed(method: SolverMethod, step_size: f64) -> SolverOptions {
        SolverOptions {
            method,
            step_size: Some(step_size),
            ..SolverOptions::default()
        }
    }

    pub fn with_method(mut self, method: SolverMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = Some(step_size);
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = Some(max_step);
        self
    }

    pub fn with_max_num_steps(mut self, max_num_steps: usize) -> Self {
        self.max_num_steps = max_num_steps;
        self
    }

    pub fn validate(&self) -> CdeResult<()> {
        if !self.rtol.is_finite() || self.rtol < 0.0 {
            return Err(CdeError::invalid_option("rtol", "must be finite and >= 0"));
        }
        if !self.atol.is_finite() || self.atol < 0.0 {
            return Err(CdeError::invalid_option("atol", "must be finite and >= 0"));
        }
        if self.method.is_adaptive() && self.rtol == 0.0 && self.atol == 0.0 {
            return Err(CdeError::invalid_option(
                "rtol",
                "rtol and atol cannot both be zero",
            ));
        }
        for (field, value) in [
            ("step_size", self.step_size),
            ("first_step", self.first_step),
            ("max_step", self.max_step),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(CdeError::invalid_option(field, "must be finite and > 0"));
                }
            }
        }
        if self.max_num_steps == 0 {
            return Err(CdeError::invalid_option("max_num_steps", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = SolverOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.method, SolverMethod::Dopri5);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            SolverOptions::default().with_tolerances(-1.0, 1e-9),
            SolverOptions::default().with_tolerances(0.0, 0.0),
            SolverOptions::default().with_tolerances(f64::NAN, 1e-9),
            SolverOptions::fixed(SolverMethod::Rk4, 0.0),
            SolverOptions::default().with_max_step(-0.1),
            SolverOptions::default().with_max_num_steps(0),
        ];
        for options in bad {
            assert!(matches!(
                options.validate(),
                Err(CdeError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn deserialises_with_defaults() {
        let options: SolverOptions =
            serde_json::from_str(r#"{ "method": "rk4", "step_size": 0.05 }"#).unwrap();
        assert_eq!(options.method, SolverMethod::Rk4);
        assert_eq!(options.step_size, Some(0.05));
        assert_eq!(options.max_num_steps, 100_000);

        let unknown: Result<SolverOptions, _> = serde_json::from_str(r#"{ "methd": "rk4" }"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn builders_match_the_json_form() {
        let built = SolverOptions::default()
            .with_method(SolverMethod::Rk4)
            .with_step_size(0.05);
        let parsed: SolverOptions =
            serde_json::from_str(r#"{ "method": "rk4", "step_size": 0.05 }"#).unwrap();
        assert_eq!(built, parsed);
        assert_eq!(built, SolverOptions::fixed(SolverMethod::Rk4, 0.05));
        assert!(built.validate().is_ok());

        let negative = SolverOptions::default().with_step_size(-0.05);
        assert!(matches!(negative.validate(), Err(CdeError::ConfigurationError(_))));
    }
}
