use good_lp::solvers::minilp::minilp;
use good_lp::{
    Expression, ResolutionError, Solution, SolverModel, Variable, constraint, variable, variables,
};
use serde::Serialize;
use tracing::{debug, info};

use super::error::SolverError;
use super::model::Model;

/// Solved vector plus the row slacks `b - A·x`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LpSolution {
    pub x: Vec<f64>,
    pub objective: f64,
    pub slack: Vec<f64>,
}

impl LpSolution {
    /// Wraps a solved vector, recomputing objective and slack from the model.
    pub fn from_vector(model: &Model, x: Vec<f64>) -> Self {
        let objective = model
            .objective()
            .iter()
            .zip(&x)
            .map(|(c, v)| c * v)
            .sum();
        let slack = model.slack(&x);
        Self {
            x,
            objective,
            slack,
        }
    }

    pub fn binding_rows(&self, model: &Model, tol: f64) -> Vec<usize> {
        model.binding_rows(&self.slack, tol)
    }
}

/// Black-box backend for `minimize cᵗx subject to A·x <= b, x >= 0`.
pub trait LpSolver {
    fn name(&self) -> &'static str;

    fn solve(&self, model: &Model) -> Result<LpSolution, SolverError>;
}

/// Pure-Rust simplex via good_lp's minilp backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinilpSolver;

impl MinilpSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LpSolver for MinilpSolver {
    fn name(&self) -> &'static str {
        "minilp"
    }

    fn solve(&self, model: &Model) -> Result<LpSolution, SolverError> {
        let n = model.num_vars();
        if n == 0 {
            return Ok(LpSolution {
                x: Vec::new(),
                objective: 0.0,
                slack: model.bounds(),
            });
        }

        let mut vars = variables!();
        let columns: Vec<Variable> = (0..n).map(|_| vars.add(variable().min(0.0))).collect();

        let objective: Expression = model
            .objective()
            .iter()
            .zip(&columns)
            .filter(|(c, _)| **c != 0.0)
            .map(|(c, v)| *c * *v)
            .sum();

        let mut problem = vars.minimise(&objective).using(minilp);
        for row in model.rows() {
            let lhs: Expression = row
                .coeffs
                .iter()
                .map(|(col, coef)| *coef * columns[*col])
                .sum();
            let bound = row.bound;
            problem = problem.with(constraint!(lhs <= bound));
        }
        debug!(
            backend = self.name(),
            vars = n,
            constraints = model.num_constraints(),
            "handing model to solver"
        );

        let solution = problem.solve().map_err(|err| match err {
            ResolutionError::Infeasible => SolverError::Infeasible,
            ResolutionError::Unbounded => SolverError::Unbounded,
            other => SolverError::Failed(other.to_string()),
        })?;

        let x = columns.iter().map(|v| solution.value(*v)).collect();
        let solved = LpSolution::from_vector(model, x);
        info!(
            backend = self.name(),
            objective = solved.objective,
            "solver reported an optimum"
        );
        Ok(solved)
    }
}
