mod check;
mod error;
mod index;
mod model;
mod modelio;
mod solver;
mod tax;
mod types;

pub use check::{
    BALANCE_TOLERANCE, ConsistencyChecker, ConsistencyWarning, PlanTotals, Quantity, TOLERANCE,
    YearFigures,
};
pub use error::{ConfigError, Error, FormatError, IndexDomainError, Result, SolverError};
pub use index::{AccountTypeCounts, IndexMismatch, PlanDims, VariableIndex};
pub use model::{BuildOptions, Model, ModelBuilder, Row, RowNote, RowTag, build_model};
pub use modelio::{MAGIC, ModelSnapshot, SnapshotDiff};
pub use solver::{LpSolution, LpSolver, MinilpSolver};
pub use tax::{Bracket, FilingStatus, TaxInfo, TaxTables};
pub use types::{Account, AccountType, Maximize, Plan, PlanFlags, Retiree};
