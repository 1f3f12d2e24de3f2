pub mod config;

use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    ConsistencyChecker, ConsistencyWarning, Error, LpSolution, LpSolver, MinilpSolver, Model,
    ModelSnapshot, PlanDims, PlanTotals, Result, RowNote, RowTag, YearFigures, build_model,
};
use config::{LogFormat, PlanFile};

/// Slack below this marks a row as binding in `--binding` output.
const BINDING_TOLERANCE: f64 = 1e-3;

#[derive(Parser, Debug)]
#[command(
    name = "retireplan",
    about = "Retirement withdrawal planner: builds a linear program from a plan file, solves it and checks the result"
)]
pub struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Log filter when RUST_LOG is unset")]
    pub log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build, solve and check a plan; prints a JSON summary.
    Solve {
        plan: PathBuf,
        #[arg(long, help = "Also write the solved model snapshot to this file")]
        dump: Option<PathBuf>,
        #[arg(long, help = "List constraint rows with zero slack")]
        binding: bool,
    },
    /// Write the model snapshot of a plan without printing a summary.
    Dump {
        plan: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, help = "Solve first and include the solution vector")]
        solve: bool,
    },
    /// Describe a model snapshot, optionally comparing it against another.
    Inspect {
        file: PathBuf,
        #[arg(long)]
        against: Option<PathBuf>,
    },
    /// Serve the HTTP API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingRow {
    pub row: usize,
    pub tag: RowTag,
    pub label: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveSummary {
    pub solver: &'static str,
    pub dims: PlanDims,
    pub vars: usize,
    pub constraints: usize,
    pub objective: f64,
    pub first_year_spendable: f64,
    pub years: Vec<YearFigures>,
    pub totals: PlanTotals,
    pub warnings: Vec<ConsistencyWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<Vec<BindingRow>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub dims: PlanDims,
    pub vars: usize,
    pub constraints: usize,
    pub notes: Vec<RowNote>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub bytes: usize,
    pub rows: usize,
    pub cols: usize,
    pub has_solution: bool,
    pub dims: Option<PlanDims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identical: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_difference: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub struct Solved {
    pub model: Model,
    pub solution: LpSolution,
    pub summary: SolveSummary,
}

/// Full pipeline for one plan file: build, solve, check.
pub fn solve_plan(file: &PlanFile, solver: &dyn LpSolver, binding: bool) -> Result<Solved> {
    let (plan, tax) = file.resolve()?;
    let model = build_model(&plan, &tax)?;
    let solution = solver.solve(&model)?;

    let checker = ConsistencyChecker::new(&plan, &tax, *model.index());
    let warnings = checker.check(&solution.x)?;
    let years = (0..plan.numyr)
        .map(|year| checker.year_figures(&solution.x, year))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let totals = checker.totals(&solution.x)?;

    let binding = binding.then(|| {
        solution
            .binding_rows(&model, BINDING_TOLERANCE)
            .into_iter()
            .map(|row| {
                let tag = model.rows()[row].tag;
                BindingRow {
                    row,
                    tag,
                    label: tag.label(),
                }
            })
            .collect()
    });

    let summary = SolveSummary {
        solver: solver.name(),
        dims: model.index().dims(),
        vars: model.num_vars(),
        constraints: model.num_constraints(),
        objective: solution.objective,
        first_year_spendable: solution.x[model.index().s(0)],
        years,
        totals,
        warnings,
        binding,
    };
    Ok(Solved {
        model,
        solution,
        summary,
    })
}

pub fn describe_model(file: &PlanFile) -> Result<ModelSummary> {
    let (plan, tax) = file.resolve()?;
    let model = build_model(&plan, &tax)?;
    Ok(ModelSummary {
        dims: model.index().dims(),
        vars: model.num_vars(),
        constraints: model.num_constraints(),
        notes: model.notes(),
    })
}

pub fn inspect_snapshot(file: &Path, against: Option<&Path>) -> Result<InspectReport> {
    let raw = std::fs::read(file)?;
    let snapshot = ModelSnapshot::from_bytes(&raw)?;
    let diff = match against {
        Some(other) => Some(snapshot.diff(&ModelSnapshot::load(other)?)),
        None => None,
    };
    Ok(InspectReport {
        bytes: raw.len(),
        rows: snapshot.a.len(),
        cols: snapshot.columns(),
        has_solution: snapshot.x.is_some(),
        dims: snapshot.dims(),
        identical: diff.as_ref().map(Option::is_none),
        first_difference: diff.flatten().map(|d| d.to_string()),
    })
}

/// Runs every subcommand except `serve`, returning what should be printed.
pub fn execute(command: &Command) -> Result<String> {
    match command {
        Command::Solve {
            plan,
            dump,
            binding,
        } => {
            let file = PlanFile::load(plan)?;
            let solved = solve_plan(&file, &MinilpSolver, *binding)?;
            if let Some(path) = dump {
                solved
                    .model
                    .snapshot(Some(&solved.solution.x))?
                    .dump(path)?;
            }
            Ok(serde_json::to_string_pretty(&solved.summary)?)
        }
        Command::Dump { plan, out, solve } => {
            let file = PlanFile::load(plan)?;
            let (plan, tax) = file.resolve()?;
            let model = build_model(&plan, &tax)?;
            let x = if *solve {
                Some(MinilpSolver.solve(&model)?.x)
            } else {
                None
            };
            let snapshot = model.snapshot(x.as_deref())?;
            snapshot.dump(out)?;
            Ok(format!(
                "wrote {} ({} bytes, {} rows x {} cols)",
                out.display(),
                snapshot.encoded_len(),
                snapshot.a.len(),
                snapshot.columns()
            ))
        }
        Command::Inspect { file, against } => {
            let report = inspect_snapshot(file, against.as_deref())?;
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Serve { .. } => Ok(String::new()),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { port } => run_http_server(port).await?,
        command => {
            let output = execute(&command)?;
            println!("{output}");
        }
    }
    Ok(())
}

pub fn router() -> Router {
    Router::new()
        .route("/api/solve", post(solve_handler))
        .route("/api/model", post(model_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "planner HTTP API listening");
    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn solve_handler(Json(file): Json<PlanFile>) -> Response {
    let outcome =
        tokio::task::spawn_blocking(move || solve_plan(&file, &MinilpSolver, false)).await;
    match outcome {
        Ok(Ok(solved)) => json_response(StatusCode::OK, solved.summary),
        Ok(Err(err)) => error_response(status_for(&err), &err.to_string()),
        Err(join) => {
            error!(error = %join, "solve task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "solve task failed")
        }
    }
}

async fn model_handler(Json(file): Json<PlanFile>) -> Response {
    match describe_model(&file) {
        Ok(summary) => json_response(StatusCode::OK, summary),
        Err(err) => error_response(status_for(&err), &err.to_string()),
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Solver(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
