// src/concentration.rs
// EQUILIBRIUM CONCENTRATIONS
// Given complex compositions A (complex x strand counts), log partition
// functions, and total strand concentrations, solve for the equilibrium
// complex concentrations x_c = exp(log_q_c + sum_s A[c][s] * lambda_s)
// subject to strand conservation A^T x = b. Damped Newton iteration on the
// dual variables lambda; the system is small (one row per strand).
// Complexes with log_q = -inf are absent and solve to zero concentration.

use crate::error::DesignError;
use anyhow::Result;

const MAX_ITERATIONS: usize = 200;
const RELATIVE_TOLERANCE: f64 = 1e-10;
/// Per-iteration clip on dual steps; keeps early iterations from
/// overflowing the exponentials.
const MAX_STEP: f64 = 10.0;
/// Exponent guard for x_c evaluation.
const MAX_EXPONENT: f64 = 300.0;

/// Solve for equilibrium complex concentrations (molar).
///
/// * `compositions` - per complex, the count of each strand it contains.
/// * `log_q` - log partition function per complex (-inf allowed, +inf and
///   NaN rejected).
/// * `strand_conc` - total concentration of each strand, all positive.
pub fn equilibrate(
    compositions: &[Vec<f64>],
    log_q: &[f64],
    strand_conc: &[f64],
) -> Result<Vec<f64>> {
    let n_complexes = compositions.len();
    let n_strands = strand_conc.len();
    if log_q.len() != n_complexes {
        return Err(DesignError::InvalidConfiguration(
            "composition and log Q lengths disagree".into(),
        )
        .into());
    }
    if log_q.iter().any(|q| q.is_nan()) {
        return Err(DesignError::NumericDomain("input log Q contains NaN".into()).into());
    }
    if log_q.iter().any(|&q| q == f64::INFINITY) {
        return Err(DesignError::NumericDomain("input log Q contains +inf".into()).into());
    }
    if strand_conc.iter().any(|&b| !(b > 0.0)) {
        return Err(
            DesignError::NumericDomain("strand concentrations must be positive".into()).into(),
        );
    }
    for row in compositions {
        if row.len() != n_strands {
            return Err(DesignError::InvalidConfiguration(
                "composition row has wrong strand count".into(),
            )
            .into());
        }
    }

    let x_of = |lambda: &[f64]| -> Vec<f64> {
        (0..n_complexes)
            .map(|c| {
                let e: f64 = log_q[c]
                    + compositions[c]
                        .iter()
                        .zip(lambda)
                        .map(|(&a, &l)| a * l)
                        .sum::<f64>();
                if e == f64::NEG_INFINITY {
                    0.0
                } else {
                    e.min(MAX_EXPONENT).exp()
                }
            })
            .collect()
    };
    let residual = |x: &[f64]| -> Vec<f64> {
        (0..n_strands)
            .map(|s| {
                strand_conc[s]
                    - (0..n_complexes)
                        .map(|c| compositions[c][s] * x[c])
                        .sum::<f64>()
            })
            .collect()
    };
    let norm = |r: &[f64]| -> f64 {
        r.iter()
            .zip(strand_conc)
            .map(|(&ri, &bi)| (ri / bi).abs())
            .fold(0.0, f64::max)
    };

    // Start from dilute duals so x is tiny and Newton climbs monotonically.
    let mut lambda: Vec<f64> = strand_conc.iter().map(|&b| b.ln() - 10.0).collect();

    for _ in 0..MAX_ITERATIONS {
        let x = x_of(&lambda);
        let r = residual(&x);
        if norm(&r) < RELATIVE_TOLERANCE {
            return Ok(x);
        }

        // J[s][t] = sum_c A[c][s] A[c][t] x_c, ridge-stabilized.
        let mut jac = vec![vec![0.0; n_strands]; n_strands];
        for c in 0..n_complexes {
            for s in 0..n_strands {
                let a_s = compositions[c][s];
                if a_s == 0.0 {
                    continue;
                }
                for t in 0..n_strands {
                    jac[s][t] += a_s * compositions[c][t] * x[c];
                }
            }
        }
        for (s, row) in jac.iter_mut().enumerate() {
            row[s] += 1e-12 * strand_conc[s].max(1e-30);
        }

        let mut step = solve_linear(jac, r.clone()).ok_or_else(|| {
            DesignError::NumericDomain("singular Jacobian in concentration solve".into())
        })?;
        for d in step.iter_mut() {
            *d = d.clamp(-MAX_STEP, MAX_STEP);
        }

        // Backtracking line search on the residual norm.
        let base = norm(&r);
        let mut alpha = 1.0;
        for _ in 0..40 {
            let trial: Vec<f64> = lambda
                .iter()
                .zip(&step)
                .map(|(&l, &d)| l + alpha * d)
                .collect();
            if norm(&residual(&x_of(&trial))) < base {
                lambda = trial;
                break;
            }
            alpha *= 0.5;
        }
        if alpha < 1e-12 {
            break;
        }
    }

    let x = x_of(&lambda);
    if norm(&residual(&x)) < 1e-6 {
        Ok(x)
    } else {
        Err(DesignError::NumericDomain(
            "concentration solve failed to converge".into(),
        )
        .into())
    }
}

/// Gaussian elimination with partial pivoting; None on a singular system.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .expect("finite matrix")
        })?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            if f == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for col in (0..n).rev() {
        let mut acc = b[col];
        for k in col + 1..n {
            acc -= a[col][k] * x[k];
        }
        x[col] = acc / a[col][col];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monomer_dimer_matches_mass_action() {
        // x1 = e^l, x2 = K e^(2l), x1 + 2 x2 = b.
        let k: f64 = 1e4;
        let b = 1e-3;
        let x = equilibrate(&[vec![1.0], vec![2.0]], &[0.0, k.ln()], &[b]).unwrap();
        // Mass action: x2 = K x1^2.
        assert!((x[1] - k * x[0] * x[0]).abs() / x[1] < 1e-6);
        assert!((x[0] + 2.0 * x[1] - b).abs() / b < 1e-6);
    }

    #[test]
    fn heterodimer_consumes_both_strands() {
        // A + B <-> AB with a strong association constant.
        let k: f64 = 1e9;
        let x = equilibrate(
            &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
            &[0.0, 0.0, k.ln()],
            &[1e-6, 1e-6],
        )
        .unwrap();
        // Nearly everything dimerizes.
        assert!(x[2] > 0.9e-6);
        assert!((x[0] + x[2] - 1e-6).abs() / 1e-6 < 1e-6);
        assert!((x[1] + x[2] - 1e-6).abs() / 1e-6 < 1e-6);
    }

    #[test]
    fn absent_complex_stays_at_zero() {
        let x = equilibrate(
            &[vec![1.0], vec![2.0]],
            &[0.0, f64::NEG_INFINITY],
            &[1e-3],
        )
        .unwrap();
        assert_eq!(x[1], 0.0);
        assert!((x[0] - 1e-3).abs() / 1e-3 < 1e-6);
    }

    #[test]
    fn domain_errors_rejected() {
        assert!(equilibrate(&[vec![1.0]], &[f64::NAN], &[1e-3]).is_err());
        assert!(equilibrate(&[vec![1.0]], &[f64::INFINITY], &[1e-3]).is_err());
        assert!(equilibrate(&[vec![1.0]], &[0.0], &[0.0]).is_err());
    }

    #[test]
    fn unbalanced_concentrations() {
        // Excess of strand A: B limits the dimer.
        let k: f64 = 1e9;
        let x = equilibrate(
            &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
            &[0.0, 0.0, k.ln()],
            &[2e-6, 1e-6],
        )
        .unwrap();
        assert!(x[2] > 0.9e-6 && x[2] <= 1.0e-6 + 1e-12);
        assert!(x[0] > 0.9e-6); // leftover A
    }
}
