use crate::cdeerror::{CdeError, CdeResult};

/// Solves a tridiagonal system with the Thomas algorithm.
///
/// `lower[i]` multiplies `x[i]` in row `i + 1`, `upper[i]` multiplies `x[i + 1]`
/// in row `i`. Stable for diagonally dominant systems such as the spline
/// moment equations.
pub fn solve_tridiagonal(
    lower: &[f64],
    diag: &[f64],
    upper: &[f64],
    rhs: &[f64],
) -> CdeResult<Vec<f64>> {
    let n = diag.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    if lower.len() + 1 != n || upper.len() + 1 != n {
        return Err(CdeError::shape_mismatch(
            "tridiagonal bands",
            n - 1,
            format!("lower={}, upper={}", lower.len(), upper.len()),
        ));
    }
    if rhs.len() != n {
        return Err(CdeError::shape_mismatch("tridiagonal rhs", n, rhs.len()));
    }

    let mut c_prime = vec![0.0; n];
    let mut d_prime = vec![0.0; n];

    let mut pivot = diag[0];
    if pivot.abs() < f64::MIN_POSITIVE {
        return Err(CdeError::DomainError(
            "singular tridiagonal system".to_owned(),
        ));
    }
    if n > 1 {
        c_prime[0] = upper[0] / pivot;
    }
    d_prime[0] = rhs[0] / pivot;

    for i in 1..n {
        pivot = diag[i] - lower[i - 1] * c_prime[i - 1];
        if pivot.abs() < f64::MIN_POSITIVE {
            return Err(CdeError::DomainError(
                "singular tridiagonal system".to_owned(),
            ));
        }
        if i < n - 1 {
            c_prime[i] = upper[i] / pivot;
        }
        d_prime[i] = (rhs[i] - lower[i - 1] * d_prime[i - 1]) / pivot;
    }

    let mut x = d_prime;
    for i in (0..n - 1).rev() {
        x[i] -= c_prime[i] * x[i + 1];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matches_dense_product() {
        let lower = [1.0, 2.0, 0.5];
        let diag = [4.0, 5.0, 6.0, 3.0];
        let upper = [1.5, 1.0, 2.0];
        let expected = [1.0, -2.0, 0.5, 3.0];

        let rhs: Vec<f64> = (0..4)
            .map(|i| {
                let mut v = diag[i] * expected[i];
                if i > 0 {
                    v += lower[i - 1] * expected[i - 1];
                }
                if i < 3 {
                    v += upper[i] * expected[i + 1];
                }
                v
            })
            .collect();

        let x = solve_tridiagonal(&lower, &diag, &upper, &rhs).unwrap();
        for (got, want) in x.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn single_row() {
        let x = solve_tridiagonal(&[], &[2.0], &[], &[3.0]).unwrap();
        assert_eq!(x, vec![1.5]);
    }

    #[test]
    fn rejects_zero_pivot_and_bad_shapes() {
        assert!(solve_tridiagonal(&[], &[0.0], &[], &[1.0]).is_err());
        assert!(solve_tridiagonal(&[1.0], &[1.0, 1.0], &[], &[1.0, 1.0]).is_err());
    }
}
