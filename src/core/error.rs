use thiserror::Error;

/// Structural problems in a plan record or tax table. Raised before any row is emitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("plan must contain at least one account")]
    NoAccounts,

    #[error("plan must cover at least one year")]
    NoYears,

    #[error("inflation multiplier must be finite and > 0, got {0}")]
    InvalidInflation(f64),

    #[error("account {account} references retiree '{key}' which is not in the retiree list")]
    UnknownRetiree { account: usize, key: String },

    #[error("no retiree with key '{0}'")]
    NoSuchRetiree(String),

    #[error("{field} has {actual} entries but the plan covers {expected} years")]
    YearVectorLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("only one aftertax account is supported, found {0}")]
    MultipleAftertax(usize),

    #[error("{0} requires an aftertax account (no deposit block without one)")]
    RequiresAftertax(&'static str),

    #[error("{account_type} account '{key}' has a contribution of {amount} but no contribution period")]
    MissingContributionPeriod {
        account_type: &'static str,
        key: String,
        amount: f64,
    },

    #[error("invalid age period '{0}'")]
    InvalidPeriod(String),

    #[error(
        "year {year}: committed contributions {committed:.2} exceed the contribution ceiling {ceiling:.2}"
    )]
    ContributionExceedsCeiling {
        year: usize,
        committed: f64,
        ceiling: f64,
    },

    #[error("invalid {table} bracket table: {reason}")]
    InvalidBrackets { table: &'static str, reason: String },

    #[error("capital-gains cutoff {0} does not coincide with any ordinary bracket cutoff")]
    BracketAlignment(f64),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read plan file: {0}")]
    ReadFile(String),

    #[error("failed to parse plan file: {0}")]
    Parse(String),
}

/// An offset function was called outside its declared bounds. Indicates a builder bug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexDomainError {
    #[error("{block}: year {year} out of range 0..{years}")]
    YearOutOfRange {
        block: char,
        year: usize,
        years: usize,
    },

    #[error("{block}: sub-index {sub} out of range 0..{count}")]
    SubOutOfRange {
        block: char,
        sub: usize,
        count: usize,
    },

    #[error("{0}: block is absent because the plan has no aftertax account")]
    BlockAbsent(char),
}

/// Outcome reported by an external solver when it cannot produce an optimum.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("model is infeasible")]
    Infeasible,

    #[error("model is unbounded")]
    Unbounded,

    #[error("solver failed: {0}")]
    Failed(String),
}

/// ModelIO magic or size mismatch. Loads never truncate or pad.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("section {section}: bad magic {found:#010x}")]
    BadMagic { section: &'static str, found: u32 },

    #[error("section {section}: unexpected width {width}")]
    UnexpectedWidth { section: &'static str, width: u32 },

    #[error("section {section}: truncated")]
    Truncated { section: &'static str },

    #[error("file size {actual} does not match {expected} computed from section headers")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("section {section}: {len} entries do not fit a 4-byte length")]
    TooLarge { section: &'static str, len: usize },

    #[error("section x: an empty solution would read back as absent")]
    EmptySolution,

    #[error("matrix row {row} has {found} columns, expected {expected}")]
    RaggedMatrix {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("model i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
