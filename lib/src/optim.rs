//! Limited memory BFGS with a backtracking Armijo line search, minimizing a
//! function of an image tensor.

use std::collections::VecDeque;

use ndarray::{Array4, Zip};
use tracing::debug;

use crate::Error;

/// Something that can be minimized: returns the value and the gradient at
/// `x`.
pub trait Objective {
    fn evaluate(&mut self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error>;

    /// Called once an iteration has accepted a step
    fn iteration_done(&mut self, _iteration: usize, _value: f32) {}
}

impl<F> Objective for F
where
    F: FnMut(&Array4<f32>) -> Result<(f32, Array4<f32>), Error>,
{
    fn evaluate(&mut self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        self(x)
    }
}

/// Sufficient decrease test for the line search
#[derive(Copy, Clone, Debug)]
pub struct ArmijoParams {
    pub c1: f64,
    /// Factor the step shrinks by after every rejected trial
    pub shrink: f64,
    pub max_backtracks: u32,
}

impl Default for ArmijoParams {
    fn default() -> Self {
        Self {
            c1: 1e-4,
            shrink: 0.5,
            max_backtracks: 20,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LbfgsConfig {
    pub max_iter: usize,
    /// Objective evaluations, line search trials included, after which no
    /// new iteration or backtracking step is started
    pub max_eval: usize,
    pub history_size: usize,
    pub learning_rate: f64,
    /// Stop once the largest gradient component falls below this
    pub tolerance_grad: f64,
    /// Stop once steps, or the change in value they cause, fall below this
    pub tolerance_change: f64,
    pub armijo: ArmijoParams,
}

impl LbfgsConfig {
    pub fn with_max_iter(max_iter: usize) -> Self {
        Self {
            max_iter,
            max_eval: max_iter.saturating_mul(5) / 4,
            history_size: 100,
            learning_rate: 1.0,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            armijo: ArmijoParams::default(),
        }
    }
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self::with_max_iter(500)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// The gradient vanished
    Converged,
    /// The step, or the change in value, became negligible
    NoProgress,
    /// The search direction stopped being a descent direction
    NotDescent,
    /// No trial step along the search direction decreased the value
    LineSearchFailed,
    MaxIterations,
    MaxEvaluations,
}

pub struct OptimResult {
    pub x: Array4<f32>,
    pub value: f32,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: TerminationReason,
}

fn dot(a: &Array4<f32>, b: &Array4<f32>) -> f64 {
    Zip::from(a)
        .and(b)
        .fold(0.0f64, |acc, &x, &y| acc + f64::from(x) * f64::from(y))
}

fn max_abs(a: &Array4<f32>) -> f64 {
    a.iter().fold(0.0f64, |acc, &v| acc.max(f64::from(v.abs())))
}

fn l1(a: &Array4<f32>) -> f64 {
    a.iter().map(|&v| f64::from(v.abs())).sum()
}

struct Correction {
    s: Array4<f32>,
    y: Array4<f32>,
    rho: f64,
}

/// Two loop recursion: `-H * g` for the inverse hessian approximation held in
/// the correction history.
fn direction(g: &Array4<f32>, history: &VecDeque<Correction>, h_diag: f64) -> Array4<f32> {
    let mut q = g.mapv(|v| -v);
    let mut alphas = Vec::with_capacity(history.len());

    for c in history.iter().rev() {
        let alpha = c.rho * dot(&c.s, &q);
        q.scaled_add(-alpha as f32, &c.y);
        alphas.push(alpha);
    }

    q *= h_diag as f32;

    for (c, alpha) in history.iter().zip(alphas.iter().rev()) {
        let beta = c.rho * dot(&c.y, &q);
        q.scaled_add((alpha - beta) as f32, &c.s);
    }

    q
}

/// Minimizes `objective` starting from `x0`.
pub fn lbfgs<O: Objective + ?Sized>(
    objective: &mut O,
    x0: Array4<f32>,
    config: &LbfgsConfig,
) -> Result<OptimResult, Error> {
    let mut x = x0;
    let (mut value, mut grad) = objective.evaluate(&x)?;
    let mut evaluations = 1;
    let mut iterations = 0;

    if max_abs(&grad) <= config.tolerance_grad {
        return Ok(OptimResult {
            x,
            value,
            iterations,
            evaluations,
            termination: TerminationReason::Converged,
        });
    }

    let mut history: VecDeque<Correction> = VecDeque::with_capacity(config.history_size);
    let mut h_diag = 1.0;

    let termination = loop {
        if iterations >= config.max_iter {
            break TerminationReason::MaxIterations;
        }
        iterations += 1;

        let d = direction(&grad, &history, h_diag);
        let gtd = dot(&grad, &d);
        if gtd > -config.tolerance_change {
            break TerminationReason::NotDescent;
        }

        let mut t = if iterations == 1 {
            (1.0f64).min(1.0 / l1(&grad)) * config.learning_rate
        } else {
            config.learning_rate
        };

        // the first trial satisfying the Armijo condition wins, failing that
        // the smallest trial that didn't increase the value. The first trial
        // always runs, so every iteration moves at least once.
        let mut accepted = None;
        let mut fallback = None;
        for attempt in 0..=config.armijo.max_backtracks {
            if attempt > 0 && evaluations >= config.max_eval {
                break;
            }

            let mut trial = x.clone();
            trial.scaled_add(t as f32, &d);
            let (trial_value, trial_grad) = objective.evaluate(&trial)?;
            evaluations += 1;

            let (v, v0) = (f64::from(trial_value), f64::from(value));
            if v <= v0 + config.armijo.c1 * t * gtd {
                accepted = Some((trial, trial_value, trial_grad, t));
                break;
            }
            if v <= v0 {
                fallback = Some((trial, trial_value, trial_grad, t));
            }

            t *= config.armijo.shrink;
        }

        let (next, next_value, next_grad, step) = match accepted.or(fallback) {
            Some(found) => found,
            None if evaluations >= config.max_eval => break TerminationReason::MaxEvaluations,
            None => break TerminationReason::LineSearchFailed,
        };

        let s = &next - &x;
        let y = &next_grad - &grad;
        let ys = dot(&y, &s);
        if ys > 1e-10 {
            while history.len() >= config.history_size.max(1) {
                history.pop_front();
            }
            h_diag = ys / dot(&y, &y);
            history.push_back(Correction { s, y, rho: 1.0 / ys });
        }

        let previous = value;
        x = next;
        value = next_value;
        grad = next_grad;

        debug!(iterations, evaluations, value, step, "L-BFGS step");
        objective.iteration_done(iterations, value);

        if max_abs(&grad) <= config.tolerance_grad {
            break TerminationReason::Converged;
        }
        if evaluations >= config.max_eval {
            break TerminationReason::MaxEvaluations;
        }
        if max_abs(&d) * step <= config.tolerance_change
            || (f64::from(value) - f64::from(previous)).abs() < config.tolerance_change
        {
            break TerminationReason::NoProgress;
        }
    };

    Ok(OptimResult {
        x,
        value,
        iterations,
        evaluations,
        termination,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    // f(x) = sum_i a_i * (x_i - c_i)^2
    fn quadratic(x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        let mut value = 0.0;
        let mut grad = Array4::zeros(x.raw_dim());
        for (i, (&v, g)) in x.iter().zip(grad.iter_mut()).enumerate() {
            let a = 1.0 + i as f32 * 0.5;
            let c = (i as f32 * 0.3).sin();
            value += a * (v - c) * (v - c);
            *g = 2.0 * a * (v - c);
        }
        Ok((value, grad))
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut objective = quadratic;
        let result = lbfgs(
            &mut objective,
            Array4::zeros((1, 1, 2, 3)),
            &LbfgsConfig::with_max_iter(100),
        )
        .unwrap();

        assert!(result.value < 1e-6, "{:?}", result.value);
        for (i, &v) in result.x.iter().enumerate() {
            assert!((v - (i as f32 * 0.3).sin()).abs() < 1e-3);
        }
    }

    #[test]
    fn evaluation_budget_saturates() {
        assert_eq!(LbfgsConfig::with_max_iter(500).max_eval, 625);
        assert_eq!(LbfgsConfig::with_max_iter(usize::MAX).max_eval, usize::MAX / 4);
    }

    #[test]
    fn respects_iteration_budget() {
        let mut evaluations = 0;
        let mut objective = |x: &Array4<f32>| {
            evaluations += 1;
            quadratic(x)
        };

        let config = LbfgsConfig::with_max_iter(2);
        let result = lbfgs(&mut objective, Array4::zeros((1, 1, 4, 4)), &config).unwrap();

        assert!(result.iterations <= 2);
        assert!(result.iterations >= 1);
        assert!(result.evaluations <= config.max_eval + 1);
        assert_eq!(result.evaluations, evaluations);
    }

    #[test]
    fn first_step_decreases_value() {
        let mut objective = quadratic;
        let x0 = Array4::from_elem((1, 1, 3, 3), 2.0);
        let (initial, _) = quadratic(&x0).unwrap();

        let result = lbfgs(&mut objective, x0, &LbfgsConfig::with_max_iter(1)).unwrap();

        assert_eq!(result.iterations, 1);
        assert!(result.value < initial);
    }

    #[test]
    fn stationary_start_converges_immediately() {
        let mut objective =
            |x: &Array4<f32>| -> Result<(f32, Array4<f32>), Error> { Ok((1.0, Array4::zeros(x.raw_dim()))) };

        let result = lbfgs(&mut objective, Array4::ones((1, 3, 2, 2)), &LbfgsConfig::default()).unwrap();

        assert_eq!(result.termination, TerminationReason::Converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.evaluations, 1);
        assert_eq!(result.x, Array4::ones((1, 3, 2, 2)));
    }

    #[test]
    fn errors_are_propagated() {
        let mut objective = |_: &Array4<f32>| -> Result<(f32, Array4<f32>), Error> { Err(Error::NoLossLayers) };
        assert!(lbfgs(&mut objective, Array4::zeros((1, 1, 1, 1)), &LbfgsConfig::default()).is_err());
    }
}
