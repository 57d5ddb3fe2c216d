//! Nonlinear iteration control.
//!
//! One time step runs the phase sequence `AdvanceTime →
//! ComputeBoundaryConditions → AssembleSystem → Solve → EvaluateResidual`,
//! looping back to assembly until the residual drops below tolerance. A
//! minimum iteration count is always enforced first: under-relaxed schemes
//! can report a spuriously small residual on iteration 0.

use core::fmt;
use std::error::Error;

use ferrox_sparse::SolverError;
use log::debug;

use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonlinearAlgorithm {
    /// Fixed-point iteration with coefficients frozen at the previous
    /// iterate.
    Picard,
    /// Iteration with the consistent linearized tangent.
    NewtonRaphson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePhase {
    AdvanceTime,
    ComputeBoundaryConditions,
    AssembleSystem,
    Solve,
    EvaluateResidual,
    Converged,
    IterationLimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NonlinearSettings<T> {
    pub tolerance: T,
    pub max_iterations: usize,
    /// Iterations always performed before convergence may be declared.
    pub min_iterations: usize,
    /// Blend factor between successive iterates, in (0, 1].
    pub relaxation: T,
    /// Switch from Picard to Newton-Raphson once this many iterations have
    /// run, without resetting the iteration counter.
    pub newton_after: Option<usize>,
}

impl Default for NonlinearSettings<f64> {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 50,
            min_iterations: 2,
            relaxation: 1.0,
            newton_after: None,
        }
    }
}

#[derive(Debug)]
pub enum NonlinearError<T> {
    /// The bounded iteration loop was exhausted; fatal by design.
    IterationLimitExceeded { iterations: usize, residual: T },
    /// The linear backend reported a failure.
    LinearSolve(SolverError),
    /// Assembly, boundary conditions or time advancement failed.
    Problem(eyre::Report),
}

impl<T: fmt::Debug> fmt::Display for NonlinearError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonlinearError::IterationLimitExceeded { iterations, residual } => {
                write!(
                    f,
                    "no convergence within {} iterations (last residual {:?})",
                    iterations, residual
                )
            }
            NonlinearError::LinearSolve(err) => write!(f, "linear solve failed: {}", err),
            NonlinearError::Problem(err) => write!(f, "problem evaluation failed: {}", err),
        }
    }
}

impl<T: fmt::Debug> Error for NonlinearError<T> {}

impl<T> From<SolverError> for NonlinearError<T> {
    fn from(err: SolverError) -> Self {
        NonlinearError::LinearSolve(err)
    }
}

impl<T> From<eyre::Report> for NonlinearError<T> {
    fn from(err: eyre::Report) -> Self {
        NonlinearError::Problem(err)
    }
}

/// The operations the controller drives per phase.
///
/// Implemented by the DOF manager's transient adapter for real problems,
/// and by closed-form fixtures in tests.
pub trait NonlinearProblem<T: Real> {
    /// Moves the problem to the next time step and returns the new time.
    fn advance_time(&mut self, time: T) -> eyre::Result<T>;

    fn compute_boundary_conditions(&mut self, time: T) -> eyre::Result<()>;

    fn assemble(&mut self, algorithm: NonlinearAlgorithm) -> eyre::Result<()>;

    fn solve_linear(&mut self) -> Result<(), SolverError>;

    /// Blends the new iterate with the previous one.
    fn relax(&mut self, relaxation: T);

    /// The convergence metric for this iteration; must be monotone
    /// comparable across iterations of one run.
    fn residual(&mut self, iteration: usize) -> T;
}

/// Outcome of one converged time step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport<T> {
    pub time: T,
    pub iterations: usize,
    pub residual: T,
}

#[derive(Debug)]
pub struct NonlinearController<T> {
    settings: NonlinearSettings<T>,
    algorithm: NonlinearAlgorithm,
    phase: SolvePhase,
    iteration: usize,
    time: T,
}

impl<T: Real> NonlinearController<T> {
    pub fn new(settings: NonlinearSettings<T>, algorithm: NonlinearAlgorithm) -> Self {
        assert!(
            settings.relaxation > T::zero() && settings.relaxation <= T::one(),
            "relaxation factor must lie in (0, 1]"
        );
        assert!(
            settings.min_iterations <= settings.max_iterations,
            "minimum iteration count exceeds the maximum"
        );
        Self {
            settings,
            algorithm,
            phase: SolvePhase::AdvanceTime,
            iteration: 0,
            time: T::zero(),
        }
    }

    pub fn algorithm(&self) -> NonlinearAlgorithm {
        self.algorithm
    }

    /// Switches the iteration algorithm without touching the counter.
    pub fn switch_algorithm(&mut self, algorithm: NonlinearAlgorithm) {
        if self.algorithm != algorithm {
            debug!(
                "switching {:?} -> {:?} at iteration {}",
                self.algorithm, algorithm, self.iteration
            );
            self.algorithm = algorithm;
        }
    }

    pub fn phase(&self) -> SolvePhase {
        self.phase
    }

    pub fn time(&self) -> T {
        self.time
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Drives `problem` through one time step of the phase machine.
    ///
    /// On success the controller is left in `Converged` and ready for the
    /// next step; on failure the distributed numerical state is considered
    /// unrecoverable and the error must terminate the whole process group.
    pub fn solve_time_step<P>(&mut self, problem: &mut P) -> Result<StepReport<T>, NonlinearError<T>>
    where
        P: NonlinearProblem<T>,
    {
        self.phase = SolvePhase::AdvanceTime;
        let mut last_residual = T::zero();
        loop {
            match self.phase {
                SolvePhase::AdvanceTime => {
                    self.time = problem.advance_time(self.time)?;
                    self.iteration = 0;
                    debug!("advanced to time {:?}", self.time);
                    self.phase = SolvePhase::ComputeBoundaryConditions;
                }
                SolvePhase::ComputeBoundaryConditions => {
                    problem.compute_boundary_conditions(self.time)?;
                    self.phase = SolvePhase::AssembleSystem;
                }
                SolvePhase::AssembleSystem => {
                    if let Some(newton_after) = self.settings.newton_after {
                        if self.iteration >= newton_after {
                            self.switch_algorithm(NonlinearAlgorithm::NewtonRaphson);
                        }
                    }
                    problem.assemble(self.algorithm)?;
                    self.phase = SolvePhase::Solve;
                }
                SolvePhase::Solve => {
                    problem.solve_linear()?;
                    self.phase = SolvePhase::EvaluateResidual;
                }
                SolvePhase::EvaluateResidual => {
                    problem.relax(self.settings.relaxation);
                    last_residual = problem.residual(self.iteration);
                    self.iteration += 1;
                    debug!(
                        "iteration {} ({:?}): residual {:?}",
                        self.iteration, self.algorithm, last_residual
                    );
                    if last_residual <= self.settings.tolerance
                        && self.iteration >= self.settings.min_iterations
                    {
                        self.phase = SolvePhase::Converged;
                    } else if self.iteration >= self.settings.max_iterations {
                        self.phase = SolvePhase::IterationLimitExceeded;
                    } else {
                        self.phase = SolvePhase::AssembleSystem;
                    }
                }
                SolvePhase::Converged => {
                    return Ok(StepReport {
                        time: self.time,
                        iterations: self.iteration,
                        residual: last_residual,
                    });
                }
                SolvePhase::IterationLimitExceeded => {
                    return Err(NonlinearError::IterationLimitExceeded {
                        iterations: self.iteration,
                        residual: last_residual,
                    });
                }
            }
        }
    }
}
