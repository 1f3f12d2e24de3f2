//! Re-derives the financial figures of a solved plan from first principles
//! and compares them with what the solver put in the vector.
//!
//! A divergence means a constraint group no longer mirrors the tax or balance
//! formula it encodes. Divergences are reported and logged, never raised.

use serde::Serialize;
use tracing::warn;

use super::error::ConfigError;
use super::index::VariableIndex;
use super::model::taxable_fraction;
use super::tax::TaxInfo;
use super::types::{AccountType, Plan};

/// Tolerance for income and tax figures, in currency units.
pub const TOLERANCE: f64 = 0.1;
/// Balances compound across years, so they get a looser bound.
pub const BALANCE_TOLERANCE: f64 = 1.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quantity {
    IndexSequence,
    Dimensions,
    VectorLength,
    OrdinaryBracketPacking,
    CapitalGainsBracketPacking,
    TaxableOrdinaryIncome,
    TaxableCapitalGains,
    OrdinaryTax,
    CapitalGainsTax,
    Balance,
    Spendable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyWarning {
    pub year: usize,
    pub account: Option<usize>,
    pub bracket: Option<usize>,
    pub quantity: Quantity,
    pub expected: f64,
    pub actual: f64,
}

impl ConsistencyWarning {
    fn new(year: usize, quantity: Quantity, expected: f64, actual: f64) -> Self {
        Self {
            year,
            account: None,
            bracket: None,
            quantity,
            expected,
            actual,
        }
    }

    fn account(mut self, account: usize) -> Self {
        self.account = Some(account);
        self
    }

    fn bracket(mut self, bracket: usize) -> Self {
        self.bracket = Some(bracket);
        self
    }
}

/// One year's figures recomputed from closed-form formulas, next to the
/// solver's own bracket sums.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearFigures {
    pub year: usize,
    pub ordinary_taxable: f64,
    pub bracket_sum: f64,
    pub taxable_gains: f64,
    pub gains_fill_sum: f64,
    pub ordinary_tax: f64,
    pub bracket_tax: f64,
    pub capital_gains_tax: f64,
    pub gains_bracket_tax: f64,
    pub early_penalty: f64,
    pub withdrawals: f64,
    pub deposits: f64,
    pub spendable: f64,
    pub solved_spendable: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTotals {
    pub spendable: f64,
    pub ordinary_tax: f64,
    pub capital_gains_tax: f64,
    pub early_penalty: f64,
    pub withdrawals: f64,
    pub deposits: f64,
    pub final_balance: f64,
    /// Final balances weighted by each account's estate discount.
    pub estate: f64,
}

pub struct ConsistencyChecker<'a> {
    plan: &'a Plan,
    tax: &'a TaxInfo,
    index: VariableIndex,
}

impl<'a> ConsistencyChecker<'a> {
    /// `index` should be the one the model was built with; it is compared
    /// against the plan's own dimensions.
    pub fn new(plan: &'a Plan, tax: &'a TaxInfo, index: VariableIndex) -> Self {
        Self { plan, tax, index }
    }

    pub fn check(&self, x: &[f64]) -> Result<Vec<ConsistencyWarning>, ConfigError> {
        let mut warnings = self.check_index(x);
        if !warnings.is_empty() {
            log_warnings(&warnings);
            return Ok(warnings);
        }

        for year in 0..self.plan.numyr {
            self.check_ordinary_packing(x, year, &mut warnings);
            if self.index.has_deposits() {
                self.check_gains_packing(x, year, &mut warnings);
            }

            let figures = self.year_figures(x, year)?;
            let mut compare = |quantity, expected: f64, actual: f64| {
                if (expected - actual).abs() > TOLERANCE {
                    warnings.push(ConsistencyWarning::new(year, quantity, expected, actual));
                }
            };
            compare(
                Quantity::TaxableOrdinaryIncome,
                figures.ordinary_taxable,
                figures.bracket_sum,
            );
            compare(Quantity::OrdinaryTax, figures.ordinary_tax, figures.bracket_tax);
            if self.index.has_deposits() {
                compare(
                    Quantity::TaxableCapitalGains,
                    figures.taxable_gains,
                    figures.gains_fill_sum,
                );
                compare(
                    Quantity::CapitalGainsTax,
                    figures.capital_gains_tax,
                    figures.gains_bracket_tax,
                );
            }
            compare(Quantity::Spendable, figures.spendable, figures.solved_spendable);

            self.check_balances(x, year, &mut warnings);
        }

        log_warnings(&warnings);
        Ok(warnings)
    }

    fn check_index(&self, x: &[f64]) -> Vec<ConsistencyWarning> {
        let mut warnings: Vec<ConsistencyWarning> = self
            .index
            .verify_sequence()
            .into_iter()
            .map(|m| {
                let found = m.found.map(|v| v as f64).unwrap_or(-1.0);
                ConsistencyWarning::new(m.year, Quantity::IndexSequence, m.expected as f64, found)
                    .bracket(m.sub)
            })
            .collect();

        let built = VariableIndex::new(self.plan.dims(self.tax));
        if built.total_size() != self.index.total_size() || built.dims() != self.index.dims() {
            warnings.push(ConsistencyWarning::new(
                0,
                Quantity::Dimensions,
                built.total_size() as f64,
                self.index.total_size() as f64,
            ));
        }
        if x.len() != self.index.total_size() {
            warnings.push(ConsistencyWarning::new(
                0,
                Quantity::VectorLength,
                self.index.total_size() as f64,
                x.len() as f64,
            ));
        }
        warnings
    }

    fn check_ordinary_packing(&self, x: &[f64], year: usize, warnings: &mut Vec<ConsistencyWarning>) {
        let adj = self.plan.inflation(year);
        let mut not_full = false;
        for (k, bracket) in self.tax.ordinary().iter().enumerate() {
            let amount = x[self.index.x(year, k)];
            if not_full && amount > TOLERANCE {
                warnings.push(
                    ConsistencyWarning::new(year, Quantity::OrdinaryBracketPacking, 0.0, amount)
                        .bracket(k),
                );
            }
            let size = bracket.width.map_or(f64::INFINITY, |w| w * adj);
            if amount + 1.0 < size {
                not_full = true;
            }
        }
    }

    fn check_gains_packing(&self, x: &[f64], year: usize, warnings: &mut Vec<ConsistencyWarning>) {
        let adj = self.plan.inflation(year);
        let mut not_full = false;
        for (l, bracket) in self.tax.capital_gains().iter().enumerate() {
            let gains = x[self.index.y(year, l)];
            let occupied: f64 = gains
                + self
                    .tax
                    .linked_ordinary_brackets(l)
                    .into_iter()
                    .map(|k| x[self.index.x(year, k)])
                    .sum::<f64>();
            if not_full && gains > TOLERANCE {
                warnings.push(
                    ConsistencyWarning::new(year, Quantity::CapitalGainsBracketPacking, 0.0, gains)
                        .bracket(l),
                );
            }
            let size = bracket.width.map_or(f64::INFINITY, |w| w * adj);
            if occupied + 1.0 < size {
                not_full = true;
            }
        }
    }

    fn check_balances(&self, x: &[f64], year: usize, warnings: &mut Vec<ConsistencyWarning>) {
        let idx = &self.index;
        let aftertax = self.plan.aftertax_account();
        for (j, account) in self.plan.accounts.iter().enumerate() {
            let deposit = if idx.has_deposits() { x[idx.d(year, j)] } else { 0.0 };
            let sale = if Some(j) == aftertax {
                self.plan.asset_sale[year]
            } else {
                0.0
            };
            let expected =
                account.growth * (x[idx.b(year, j)] - x[idx.w(year, j)] + deposit + sale);
            let actual = x[idx.b(year + 1, j)];
            if (expected - actual).abs() > BALANCE_TOLERANCE {
                warnings.push(
                    ConsistencyWarning::new(year, Quantity::Balance, expected, actual).account(j),
                );
            }
        }
    }

    pub fn year_figures(&self, x: &[f64], year: usize) -> Result<YearFigures, ConfigError> {
        let plan = self.plan;
        let tax = self.tax;
        let idx = &self.index;
        let adj = plan.inflation(year);

        let mut withdrawals = 0.0;
        let mut deposits = 0.0;
        let mut tdra_net = 0.0;
        let mut early_penalty = 0.0;
        for (j, account) in plan.accounts.iter().enumerate() {
            let w = x[idx.w(year, j)];
            let d = if idx.has_deposits() { x[idx.d(year, j)] } else { 0.0 };
            withdrawals += w;
            deposits += d;
            if account.account_type == AccountType::Tdra {
                tdra_net += w - d;
            }
            if account.account_type.is_tax_advantaged()
                && plan.early_penalty_applies(tax, year, &account.owner)?
            {
                early_penalty += tax.penalty_rate() * w;
            }
        }

        let ordinary_taxable = (tdra_net
            + plan.taxed[year]
            + tax.ss_taxable_fraction() * plan.ss[year]
            - tax.standard_deduction() * adj)
            .max(0.0);
        let (bracket_sum, bracket_tax) = tax
            .ordinary()
            .iter()
            .enumerate()
            .map(|(k, b)| (x[idx.x(year, k)], x[idx.x(year, k)] * b.rate))
            .fold((0.0, 0.0), |(sum, t), (v, vt)| (sum + v, t + vt));

        let (taxable_gains, gains_fill_sum, gains_bracket_tax) = match plan.aftertax_account() {
            Some(a) if idx.has_deposits() => {
                let net = x[idx.w(year, a)] - x[idx.d(year, a)];
                let gains = taxable_fraction(plan, a, year) * net + plan.cg_asset_taxed[year];
                let (fill, fill_tax) = tax
                    .capital_gains()
                    .iter()
                    .enumerate()
                    .map(|(l, b)| (x[idx.y(year, l)], x[idx.y(year, l)] * b.rate))
                    .fold((0.0, 0.0), |(sum, t), (v, vt)| (sum + v, t + vt));
                (gains, fill, fill_tax)
            }
            _ => (0.0, 0.0, 0.0),
        };

        let ordinary_tax = tax.ordinary_tax(ordinary_taxable, adj);
        let capital_gains_tax = tax.capital_gains_tax(ordinary_taxable, taxable_gains, adj);
        let spendable = withdrawals - deposits + plan.income[year] + plan.ss[year]
            - plan.expenses[year]
            - ordinary_tax
            - capital_gains_tax
            - early_penalty;

        Ok(YearFigures {
            year,
            ordinary_taxable,
            bracket_sum,
            taxable_gains,
            gains_fill_sum,
            ordinary_tax,
            bracket_tax,
            capital_gains_tax,
            gains_bracket_tax,
            early_penalty,
            withdrawals,
            deposits,
            spendable,
            solved_spendable: x[idx.s(year)],
        })
    }

    pub fn totals(&self, x: &[f64]) -> Result<PlanTotals, ConfigError> {
        let mut totals = PlanTotals::default();
        for year in 0..self.plan.numyr {
            let f = self.year_figures(x, year)?;
            totals.spendable += f.solved_spendable;
            totals.ordinary_tax += f.ordinary_tax;
            totals.capital_gains_tax += f.capital_gains_tax;
            totals.early_penalty += f.early_penalty;
            totals.withdrawals += f.withdrawals;
            totals.deposits += f.deposits;
        }
        let last = self.plan.numyr;
        for (j, account) in self.plan.accounts.iter().enumerate() {
            let balance = x[self.index.b(last, j)];
            totals.final_balance += balance;
            totals.estate += balance * account.estate_discount;
        }
        Ok(totals)
    }
}

fn log_warnings(warnings: &[ConsistencyWarning]) {
    for w in warnings {
        warn!(
            year = w.year,
            account = ?w.account,
            bracket = ?w.bracket,
            quantity = ?w.quantity,
            expected = w.expected,
            actual = w.actual,
            "solved vector diverges from recomputed figure"
        );
    }
}
