use thiserror::Error;

pub type CdeResult<T> = Result<T, CdeError>;

#[derive(Debug, Error)]
pub enum CdeError {
    /// Out-of-range time query, degenerate or too short time grid.
    #[error("domain error: {0}")]
    DomainError(String),

    /// Missing data that imputation cannot recover.
    #[error("data error: {0}")]
    DataError(String),

    /// Malformed solver options or solver time grid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The solver service failed to converge.
    #[error("solver error: {0}")]
    SolverError(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),
}

impl CdeError {
    pub fn out_of_domain(t: f64, min: f64, max: f64) -> CdeError {
        CdeError::DomainError(format!(
            "time {} is outside the path interval [{}, {}]",
            t, min, max
        ))
    }

    pub fn too_few_times(required: usize, actual: usize) -> CdeError {
        CdeError::DomainError(format!(
            "need at least {} observation times, got {}",
            required, actual
        ))
    }

    pub fn shape_mismatch(
        context: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> CdeError {
        CdeError::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn invalid_option(field: &'static str, message: &str) -> CdeError {
        CdeError::ConfigurationError(format!("invalid '{}': {}", field, message))
    }

    /// Domain-level precondition failures (`DomainError` and shape mismatches).
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            CdeError::DomainError(_) | CdeError::ShapeMismatch { .. }
        )
    }
}
