//! A limited-memory BFGS minimizer with a bounded evaluation budget.

use crate::Error;
use std::collections::VecDeque;

/// Sufficient decrease constant of the Wolfe conditions
const ARMIJO: f64 = 1e-4;
/// Curvature constant of the strong Wolfe conditions
const CURVATURE: f64 = 0.9;
/// The largest factor a single extrapolation grows the step by
const EXPAND: f64 = 4.0;
/// Brackets narrower than this are treated as a failed line search
const MIN_STEP: f64 = 1e-20;

/// A differentiable scalar function of a real vector
pub trait Objective {
    /// The length of the vectors `evaluate` accepts
    fn dimension(&self) -> usize;

    /// Returns the value at `x` and the gradient there
    fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error>;
}

/// Why a call to `Lbfgs::minimize` returned
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Termination {
    /// The largest gradient component fell below the tolerance
    GradientTolerance,
    /// The evaluation budget ran out, the usual outcome with small budgets
    EvaluationBudget,
    /// No step along the search direction decreased the value
    LineSearch,
}

#[derive(Clone, Debug)]
pub struct Minimum {
    /// The best point found
    pub x: Vec<f64>,
    /// The value at `x`
    pub value: f64,
    /// The number of objective evaluations used
    pub evaluations: usize,
    pub termination: Termination,
}

struct CurvaturePair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// A point along the search direction, `slope` is the directional derivative
#[derive(Copy, Clone)]
struct Sample {
    step: f64,
    value: f64,
    slope: f64,
}

struct Trial {
    x: Vec<f64>,
    value: f64,
    grad: Vec<f64>,
}

/// The state a line search starts from
struct Line<'a> {
    x: &'a [f64],
    direction: &'a [f64],
    value: f64,
    slope: f64,
}

/// L-BFGS configuration
#[derive(Copy, Clone, Debug)]
pub struct Lbfgs {
    /// The number of curvature pairs remembered
    pub history_size: usize,
    /// The maximum number of objective evaluations per `minimize` call
    pub max_evaluations: usize,
    /// Stop once every gradient component is at most this large
    pub gradient_tolerance: f64,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            history_size: 10,
            max_evaluations: 15_000,
            gradient_tolerance: 1e-5,
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Minimizer of the cubic through `a` and `b`, kept at least a tenth of the
/// bracket away from either end
fn interpolate(a: Sample, b: Sample) -> f64 {
    let (lo, hi) = if a.step < b.step {
        (a.step, b.step)
    } else {
        (b.step, a.step)
    };
    let margin = 0.1 * (hi - lo);

    let d1 = a.slope + b.slope - 3.0 * (a.value - b.value) / (a.step - b.step);
    let d2 = (d1 * d1 - a.slope * b.slope).sqrt() * (b.step - a.step).signum();
    let step = b.step - (b.step - a.step) * (b.slope + d2 - d1) / (b.slope - a.slope + 2.0 * d2);

    if step.is_finite() {
        step.max(lo + margin).min(hi - margin)
    } else {
        0.5 * (lo + hi)
    }
}

enum Search {
    /// The strong Wolfe conditions hold at the trial
    Converged(Trial),
    /// The search stopped early, the trial is the best one with sufficient
    /// decrease
    Partial(Trial),
    Failed,
}

impl Lbfgs {
    pub fn with_max_evaluations(max_evaluations: usize) -> Self {
        Self {
            max_evaluations,
            ..Self::default()
        }
    }

    /// Minimizes `objective` starting from `x0`.
    ///
    /// The returned point is never worse than `x0`. Errors from the objective
    /// abort the minimization.
    pub fn minimize<O>(&self, objective: &O, x0: Vec<f64>) -> Result<Minimum, Error>
    where
        O: Objective + ?Sized,
    {
        let budget = self.max_evaluations.max(1);
        let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(self.history_size);

        let (mut value, mut grad) = objective.evaluate(&x0)?;
        let mut evaluations = 1;
        let mut x = x0;
        let mut restart = true;

        let termination = loop {
            let grad_max = grad.iter().fold(0.0f64, |m, g| m.max(g.abs()));
            if grad_max <= self.gradient_tolerance {
                break Termination::GradientTolerance;
            }

            if evaluations >= budget {
                break Termination::EvaluationBudget;
            }

            let mut direction = self.direction(&grad, &history);
            let mut slope = dot(&direction, &grad);

            // Not a descent direction, the curvature memory is stale
            if !(slope < 0.0) {
                history.clear();
                restart = true;
                direction = grad.iter().map(|g| -g).collect();
                slope = dot(&direction, &grad);
            }

            // The first step of a fresh start moves at most unit length
            let step = if restart {
                (1.0 / dot(&direction, &direction).sqrt()).min(1.0)
            } else {
                1.0
            };

            let line = Line {
                x: &x,
                direction: &direction,
                value,
                slope,
            };

            let next = match self.line_search(objective, &line, step, budget, &mut evaluations)? {
                Search::Converged(trial) | Search::Partial(trial) => trial,
                Search::Failed if evaluations >= budget => break Termination::EvaluationBudget,
                // Retry from steepest descent before giving up
                Search::Failed if !history.is_empty() => {
                    history.clear();
                    restart = true;
                    continue;
                }
                Search::Failed => break Termination::LineSearch,
            };

            let s: Vec<f64> = next.x.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = next.grad.iter().zip(&grad).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);

            // Only keep pairs that preserve a positive definite Hessian estimate
            if sy > f64::EPSILON * dot(&y, &y) {
                if history.len() == self.history_size {
                    history.pop_front();
                }
                if self.history_size > 0 {
                    history.push_back(CurvaturePair { s, y, rho: 1.0 / sy });
                }
            }

            x = next.x;
            value = next.value;
            grad = next.grad;
            restart = false;
        };

        Ok(Minimum {
            x,
            value,
            evaluations,
            termination,
        })
    }

    /// Searches for a step satisfying the strong Wolfe conditions, growing
    /// the step while the slope stays steep and zooming into the bracket once
    /// one is found
    fn line_search<O>(
        &self,
        objective: &O,
        line: &Line<'_>,
        mut step: f64,
        budget: usize,
        evaluations: &mut usize,
    ) -> Result<Search, Error>
    where
        O: Objective + ?Sized,
    {
        let origin = Sample {
            step: 0.0,
            value: line.value,
            slope: line.slope,
        };

        let mut prev = origin;
        let mut best: Option<Trial> = None;

        // Bracketing
        let (mut lo, mut hi) = loop {
            if *evaluations >= budget || !step.is_finite() {
                return Ok(best.map_or(Search::Failed, Search::Partial));
            }

            let (sample, trial) = self.sample(objective, line, step, evaluations)?;

            if !(sample.value <= line.value + ARMIJO * step * line.slope)
                || (prev.step > 0.0 && sample.value >= prev.value)
            {
                break (prev, sample);
            }

            if sample.slope.abs() <= -CURVATURE * line.slope {
                return Ok(Search::Converged(trial));
            }

            best = Some(trial);

            if sample.slope >= 0.0 {
                break (sample, prev);
            }

            prev = sample;
            step *= EXPAND;
        };

        // Zoom, `lo` is always the lowest sample with sufficient decrease
        loop {
            if *evaluations >= budget || (hi.step - lo.step).abs() < MIN_STEP {
                return Ok(best.map_or(Search::Failed, Search::Partial));
            }

            let step = interpolate(lo, hi);
            let (sample, trial) = self.sample(objective, line, step, evaluations)?;

            if !(sample.value <= line.value + ARMIJO * step * line.slope)
                || sample.value >= lo.value
            {
                hi = sample;
                continue;
            }

            if sample.slope.abs() <= -CURVATURE * line.slope {
                return Ok(Search::Converged(trial));
            }

            if sample.slope * (hi.step - lo.step) >= 0.0 {
                hi = lo;
            }

            lo = sample;
            best = Some(trial);
        }
    }

    fn sample<O>(
        &self,
        objective: &O,
        line: &Line<'_>,
        step: f64,
        evaluations: &mut usize,
    ) -> Result<(Sample, Trial), Error>
    where
        O: Objective + ?Sized,
    {
        let x: Vec<f64> = line
            .x
            .iter()
            .zip(line.direction)
            .map(|(xi, di)| xi + step * di)
            .collect();

        let (value, grad) = objective.evaluate(&x)?;
        *evaluations += 1;

        tracing::trace!(evaluations = *evaluations, step, value, "line search");

        let sample = Sample {
            step,
            value,
            slope: dot(&grad, line.direction),
        };

        Ok((sample, Trial { x, value, grad }))
    }

    /// Two-loop recursion, returns `-H * grad`
    fn direction(&self, grad: &[f64], history: &VecDeque<CurvaturePair>) -> Vec<f64> {
        let mut q: Vec<f64> = grad.to_vec();
        let mut alphas = Vec::with_capacity(history.len());

        for pair in history.iter().rev() {
            let alpha = pair.rho * dot(&pair.s, &q);
            for (qi, yi) in q.iter_mut().zip(&pair.y) {
                *qi -= alpha * yi;
            }
            alphas.push(alpha);
        }

        if let Some(last) = history.back() {
            let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
            for qi in q.iter_mut() {
                *qi *= gamma;
            }
        }

        for (pair, alpha) in history.iter().zip(alphas.iter().rev()) {
            let beta = pair.rho * dot(&pair.y, &q);
            for (qi, si) in q.iter_mut().zip(&pair.s) {
                *qi += (alpha - beta) * si;
            }
        }

        for qi in q.iter_mut() {
            *qi = -*qi;
        }

        q
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    struct Quadratic {
        scales: Vec<f64>,
        calls: Cell<usize>,
    }

    impl Objective for Quadratic {
        fn dimension(&self) -> usize {
            self.scales.len()
        }

        fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
            self.calls.set(self.calls.get() + 1);
            let value = x
                .iter()
                .zip(&self.scales)
                .map(|(x, s)| s * (x - 1.0) * (x - 1.0))
                .sum();
            let grad = x
                .iter()
                .zip(&self.scales)
                .map(|(x, s)| 2.0 * s * (x - 1.0))
                .collect();
            Ok((value, grad))
        }
    }

    struct Rosenbrock;

    impl Objective for Rosenbrock {
        fn dimension(&self) -> usize {
            2
        }

        fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
            let (a, b) = (x[0], x[1]);
            let value = (1.0 - a) * (1.0 - a) + 100.0 * (b - a * a) * (b - a * a);
            let grad = vec![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ];
            Ok((value, grad))
        }
    }

    /// `sum((x² - 25)²)`, concave around the origin
    struct DoubleWell;

    impl Objective for DoubleWell {
        fn dimension(&self) -> usize {
            400
        }

        fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
            let value = x.iter().map(|x| (x * x - 25.0) * (x * x - 25.0)).sum();
            let grad = x.iter().map(|x| 4.0 * x * (x * x - 25.0)).collect();
            Ok((value, grad))
        }
    }

    #[test]
    fn solves_ill_conditioned_quadratic() {
        let objective = Quadratic {
            scales: vec![1.0, 10.0, 100.0, 1000.0],
            calls: Cell::new(0),
        };

        let min = Lbfgs::default()
            .minimize(&objective, vec![0.0; objective.dimension()])
            .unwrap();

        assert_eq!(min.termination, Termination::GradientTolerance);
        assert!(min.value < 1e-9, "{}", min.value);
        for x in &min.x {
            assert!((x - 1.0).abs() < 1e-4);
        }
        assert_eq!(min.evaluations, objective.calls.get());
    }

    #[test]
    fn solves_rosenbrock() {
        let min = Lbfgs::default()
            .minimize(&Rosenbrock, vec![-1.2, 1.0])
            .unwrap();

        assert!((min.x[0] - 1.0).abs() < 1e-3, "{:?}", min.x);
        assert!((min.x[1] - 1.0).abs() < 1e-3, "{:?}", min.x);
    }

    #[test]
    fn respects_evaluation_budget() {
        let objective = Quadratic {
            scales: vec![1.0, 50.0, 3.0],
            calls: Cell::new(0),
        };

        let start = vec![-4.0, 7.0, 2.0];
        let (start_value, _) = objective.evaluate(&start).unwrap();
        objective.calls.set(0);

        let min = Lbfgs::with_max_evaluations(5)
            .minimize(&objective, start)
            .unwrap();

        assert_eq!(objective.calls.get(), 5);
        assert_eq!(min.evaluations, 5);
        assert_eq!(min.termination, Termination::EvaluationBudget);
        assert!(min.value < start_value);
    }

    #[test]
    fn leaves_concave_region_within_budget() {
        // Small noise-like start where every curvature pair is negative
        let start: Vec<f64> = (0..DoubleWell.dimension())
            .map(|i| {
                let sign = if (i * 7) % 5 < 2 { -1.0 } else { 1.0 };
                sign * 0.1 * (1.0 + 0.1 * (i % 3) as f64)
            })
            .collect();
        let (start_value, _) = DoubleWell.evaluate(&start).unwrap();

        let min = Lbfgs::with_max_evaluations(20)
            .minimize(&DoubleWell, start)
            .unwrap();

        assert!(min.evaluations <= 20);
        let decrease = (start_value - min.value) / start_value;
        assert!(decrease > 0.5, "relative decrease {}", decrease);
    }

    #[test]
    fn never_returns_a_worse_point() {
        let mut x = vec![-1.2, 1.0];
        let mut last = Rosenbrock.evaluate(&x).unwrap().0;

        for _ in 0..10 {
            let min = Lbfgs::with_max_evaluations(3).minimize(&Rosenbrock, x).unwrap();
            assert!(min.value <= last);
            last = min.value;
            x = min.x;
        }
    }

    #[test]
    fn stationary_start() {
        let objective = Quadratic {
            scales: vec![2.0, 2.0],
            calls: Cell::new(0),
        };

        let min = Lbfgs::default().minimize(&objective, vec![1.0, 1.0]).unwrap();
        assert_eq!(min.termination, Termination::GradientTolerance);
        assert_eq!(min.evaluations, 1);
    }
}
