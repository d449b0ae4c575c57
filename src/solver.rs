//! Generic linear-program solver contract and the default backend.
//!
//! The compactor only needs a narrow surface: continuous variables with
//! bounds, sparse linear constraints, a min/max objective, and per-variable
//! solution values. Keeping that behind a trait lets another solver be
//! slotted in without touching the optimizer. The default backend defers all
//! model building until `solve` and hands the assembled problem to microlp's
//! primal simplex.

use microlp::{ComparisonOp, OptimizationDirection, Problem};

pub type VarHandle = usize;
pub type ConstraintHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Continuous,
    Binary,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Le,
    Eq,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Minimize,
    Maximize,
}

/// Abstract LP solver used by the compactor.
pub trait LpSolver {
    /// Add a variable with the given bounds; infinite bounds are allowed.
    fn add_variable(&mut self, lb: f64, ub: f64, kind: VarKind) -> VarHandle;
    /// Add the constraint `sum coeff_i * var_i  <relation>  rhs`.
    fn add_constraint(
        &mut self,
        terms: &[(VarHandle, f64)],
        relation: Relation,
        rhs: f64,
    ) -> ConstraintHandle;
    fn set_direction(&mut self, direction: Direction);
    fn set_objective_coeff(&mut self, var: VarHandle, coeff: f64);
    /// Mutate a constraint's right-hand side before solving.
    fn set_rhs(&mut self, constraint: ConstraintHandle, rhs: f64);
    /// Solve; returns false when no optimal solution exists.
    fn solve(&mut self) -> bool;
    /// Objective value of the last successful solve.
    fn objective(&self) -> f64;
    /// Value of a variable in the last successful solve.
    fn value(&self, var: VarHandle) -> f64;
}

#[derive(Debug, Clone)]
struct PendingConstraint {
    terms: Vec<(VarHandle, f64)>,
    relation: Relation,
    rhs: f64,
}

/// Default solver backed by microlp's primal simplex.
///
/// The model is staged locally so objective coefficients can be assigned
/// after variables exist, then rebuilt into a microlp problem on `solve`.
/// Only continuous variables are supported; the shaper LP never needs
/// integrality.
#[derive(Debug, Default)]
pub struct SimplexSolver {
    bounds: Vec<(f64, f64)>,
    objective_coeffs: Vec<f64>,
    constraints: Vec<PendingConstraint>,
    direction: Option<Direction>,
    objective_value: f64,
    values: Vec<f64>,
    solved: bool,
}

impl SimplexSolver {
    pub fn new() -> SimplexSolver {
        SimplexSolver::default()
    }
}

impl LpSolver for SimplexSolver {
    fn add_variable(&mut self, lb: f64, ub: f64, kind: VarKind) -> VarHandle {
        assert!(
            kind == VarKind::Continuous,
            "simplex backend only supports continuous variables"
        );
        self.bounds.push((lb, ub));
        self.objective_coeffs.push(0.0);
        self.bounds.len() - 1
    }

    fn add_constraint(
        &mut self,
        terms: &[(VarHandle, f64)],
        relation: Relation,
        rhs: f64,
    ) -> ConstraintHandle {
        self.constraints.push(PendingConstraint {
            terms: terms.to_vec(),
            relation,
            rhs,
        });
        self.constraints.len() - 1
    }

    fn set_direction(&mut self, direction: Direction) {
        self.direction = Some(direction);
    }

    fn set_objective_coeff(&mut self, var: VarHandle, coeff: f64) {
        self.objective_coeffs[var] = coeff;
    }

    fn set_rhs(&mut self, constraint: ConstraintHandle, rhs: f64) {
        self.constraints[constraint].rhs = rhs;
    }

    fn solve(&mut self) -> bool {
        let direction = match self.direction.unwrap_or(Direction::Minimize) {
            Direction::Minimize => OptimizationDirection::Minimize,
            Direction::Maximize => OptimizationDirection::Maximize,
        };
        let mut problem = Problem::new(direction);
        let vars: Vec<_> = self
            .bounds
            .iter()
            .zip(&self.objective_coeffs)
            .map(|(&(lb, ub), &coeff)| problem.add_var(coeff, (lb, ub)))
            .collect();
        for constraint in &self.constraints {
            let terms: Vec<_> = constraint
                .terms
                .iter()
                .map(|&(var, coeff)| (vars[var], coeff))
                .collect();
            let op = match constraint.relation {
                Relation::Le => ComparisonOp::Le,
                Relation::Eq => ComparisonOp::Eq,
                Relation::Ge => ComparisonOp::Ge,
            };
            problem.add_constraint(&terms, op, constraint.rhs);
        }
        match problem.solve() {
            Ok(solution) => {
                self.objective_value = solution.objective();
                self.values = vars.iter().map(|&v| solution[v]).collect();
                self.solved = true;
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "simplex solve failed");
                self.solved = false;
                false
            }
        }
    }

    fn objective(&self) -> f64 {
        debug_assert!(self.solved);
        self.objective_value
    }

    fn value(&self, var: VarHandle) -> f64 {
        debug_assert!(self.solved);
        self.values[var]
    }
}
