//! Plan files and logging setup.
//!
//! A plan file is TOML when its extension is `.toml`, JSON otherwise:
//!
//! ```toml
//! filing_status = "joint"
//!
//! [plan]
//! years = 30
//! inflation = 1.025
//! taxed = [40000.0, 40000.0]   # shorter vectors are rejected, missing ones are zeros
//!
//! [[plan.retirees]]
//! key = "will"
//! age = 58
//!
//! [[plan.accounts]]
//! type = "tdra"
//! owner = "will"
//! balance = 600000.0
//! contrib = 3000.0
//! period = "58-59"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

use crate::core::{
    Account, AccountType, ConfigError, FilingStatus, Maximize, Plan, Retiree, TaxInfo, TaxTables,
};

/// Ages past this are treated as the end of an open period like `"62-"`.
const OPEN_PERIOD_END: u32 = 120;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlanFile {
    #[serde(default)]
    pub filing_status: FilingStatus,
    /// Replaces the built-in tables for `filing_status` when present.
    #[serde(default)]
    pub tax_tables: Option<TaxTables>,
    pub plan: PlanConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlanConfig {
    pub years: usize,
    /// Inflation multiplier, e.g. 1.025.
    #[serde(default = "default_inflation")]
    pub inflation: f64,
    #[serde(default)]
    pub maximize: Maximize,
    #[serde(default)]
    pub income: Vec<f64>,
    #[serde(default)]
    pub ss: Vec<f64>,
    #[serde(default)]
    pub taxed: Vec<f64>,
    #[serde(default)]
    pub expenses: Vec<f64>,
    #[serde(default)]
    pub asset_sale: Vec<f64>,
    #[serde(default)]
    pub cg_asset_taxed: Vec<f64>,
    #[serde(default)]
    pub desired: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub retirees: Vec<RetireeConfig>,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetireeConfig {
    pub key: String,
    /// Age at the start of the plan.
    pub age: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountConfig {
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub owner: String,
    pub balance: f64,
    #[serde(default = "default_growth")]
    pub growth: f64,
    #[serde(default)]
    pub estate_discount: Option<f64>,
    #[serde(default)]
    pub basis: f64,
    /// Explicit per-year contributions; takes precedence over `contrib`.
    #[serde(default)]
    pub contributions: Vec<f64>,
    #[serde(default)]
    pub contrib: Option<f64>,
    /// Owner ages that contribute, e.g. `"56-65"` or `"62,64-"`.
    #[serde(default)]
    pub period: Option<String>,
    /// Grow `contrib` with inflation from the plan start.
    #[serde(default)]
    pub inflation: bool,
}

fn default_inflation() -> f64 {
    1.025
}

fn default_growth() -> f64 {
    1.06
}

impl PlanFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile(e.to_string()))?;
        if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn tax_info(&self) -> Result<TaxInfo, ConfigError> {
        match &self.tax_tables {
            Some(tables) => TaxInfo::new(tables.clone()),
            None => Ok(TaxInfo::for_status(self.filing_status)),
        }
    }

    /// Normalized plan record plus the tax tables it is evaluated against.
    pub fn resolve(&self) -> Result<(Plan, TaxInfo), ConfigError> {
        let tax = self.tax_info()?;
        let plan = self.plan.to_plan()?;
        plan.validate(&tax)?;
        Ok((plan, tax))
    }
}

impl PlanConfig {
    pub fn to_plan(&self) -> Result<Plan, ConfigError> {
        let years = self.years;
        let per_year = |values: &Vec<f64>| {
            if values.is_empty() {
                vec![0.0; years]
            } else {
                values.clone()
            }
        };

        let retirees: Vec<Retiree> = self
            .retirees
            .iter()
            .map(|r| Retiree {
                key: r.key.clone(),
                age_at_start: r.age,
            })
            .collect();

        let accounts = self
            .accounts
            .iter()
            .map(|a| self.account(a, &retirees))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Plan {
            numyr: years,
            i_rate: self.inflation,
            maximize: self.maximize,
            income: per_year(&self.income),
            ss: per_year(&self.ss),
            taxed: per_year(&self.taxed),
            expenses: per_year(&self.expenses),
            asset_sale: per_year(&self.asset_sale),
            cg_asset_taxed: per_year(&self.cg_asset_taxed),
            desired: self.desired.filter(|v| *v > 0.0),
            max: self.max.filter(|v| *v > 0.0),
            retirees,
            accounts,
        })
    }

    fn account(&self, config: &AccountConfig, retirees: &[Retiree]) -> Result<Account, ConfigError> {
        let contributions = match (config.contrib, &config.period) {
            _ if !config.contributions.is_empty() => config.contributions.clone(),
            (Some(amount), _) if amount == 0.0 => Vec::new(),
            (None, _) => Vec::new(),
            (Some(amount), None) => {
                return Err(ConfigError::MissingContributionPeriod {
                    account_type: config.account_type.label(),
                    key: config.owner.clone(),
                    amount,
                });
            }
            (Some(amount), Some(period)) => {
                let start_age = retirees
                    .iter()
                    .find(|r| r.key == config.owner)
                    .or_else(|| match config.account_type {
                        AccountType::Aftertax => retirees.first(),
                        _ => None,
                    })
                    .map(|r| r.age_at_start)
                    .ok_or_else(|| ConfigError::NoSuchRetiree(config.owner.clone()))?;
                let ages = parse_period(period)?;
                (0..self.years)
                    .map(|year| {
                        let age = start_age + year as u32;
                        if !ages.iter().any(|(lo, hi)| (*lo..=*hi).contains(&age)) {
                            return 0.0;
                        }
                        if config.inflation {
                            amount * self.inflation.powi(year as i32)
                        } else {
                            amount
                        }
                    })
                    .collect()
            }
        };

        Ok(Account {
            account_type: config.account_type,
            owner: config.owner.clone(),
            balance: config.balance,
            growth: config.growth,
            estate_discount: config
                .estate_discount
                .unwrap_or_else(|| config.account_type.default_estate_discount()),
            basis: config.basis,
            contributions,
        })
    }
}

/// Parses an age list such as `"56-65"`, `"62,64-"` or `"70"` into inclusive ranges.
pub fn parse_period(period: &str) -> Result<Vec<(u32, u32)>, ConfigError> {
    let invalid = || ConfigError::InvalidPeriod(period.to_string());
    let mut ranges = Vec::new();
    for part in period.split(',') {
        let part = part.trim();
        let (lo, hi) = match part.split_once('-') {
            None => {
                let age = part.parse::<u32>().map_err(|_| invalid())?;
                (age, age)
            }
            Some((lo, "")) => (lo.trim().parse::<u32>().map_err(|_| invalid())?, OPEN_PERIOD_END),
            Some((lo, hi)) => (
                lo.trim().parse::<u32>().map_err(|_| invalid())?,
                hi.trim().parse::<u32>().map_err(|_| invalid())?,
            ),
        };
        if hi < lo {
            return Err(invalid());
        }
        ranges.push((lo, hi));
    }
    Ok(ranges)
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
