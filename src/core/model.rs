//! Translates a plan record into `minimize cᵗx subject to A·x <= b, x >= 0`.
//!
//! Rows are collected sparse, each carrying the tag of the constraint group
//! that produced it, and only become a dense matrix at the solver or ModelIO
//! boundary.

use serde::Serialize;
use tracing::{debug, info};

use super::error::{ConfigError, FormatError};
use super::index::VariableIndex;
use super::modelio::ModelSnapshot;
use super::tax::TaxInfo;
use super::types::{AccountType, Maximize, Plan, PlanFlags};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowTag {
    CashFlow,
    SpendingGrowthUpper,
    SpendingGrowthLower,
    MinSpending,
    MaxSpending,
    HouseholdContributionCeiling,
    RetireeContributionCeiling,
    CommittedContribution,
    RmdNoDeposit,
    RmdWithdrawal,
    OrdinaryIncomeFloor,
    OrdinaryIncomeCeiling,
    OrdinaryBracketWidth,
    CapitalGainsUpper,
    CapitalGainsLower,
    CapitalGainsBracketWidth,
    BalanceUpper,
    BalanceLower,
    InitialBalanceUpper,
    InitialBalanceLower,
}

impl RowTag {
    pub fn label(self) -> &'static str {
        match self {
            RowTag::CashFlow => "cash flow: spendable <= withdrawals + income - taxes - deposits",
            RowTag::SpendingGrowthUpper => "spendable grows with inflation (upper)",
            RowTag::SpendingGrowthLower => "spendable grows with inflation (lower)",
            RowTag::MinSpending => "minimum desired first-year spendable",
            RowTag::MaxSpending => "maximum desired first-year spendable",
            RowTag::HouseholdContributionCeiling => "household contribution ceiling",
            RowTag::RetireeContributionCeiling => "per-retiree contribution ceiling",
            RowTag::CommittedContribution => "committed contributions",
            RowTag::RmdNoDeposit => "no deposits into RMD-bound accounts",
            RowTag::RmdWithdrawal => "required minimum distribution",
            RowTag::OrdinaryIncomeFloor => "bracket fill >= taxable ordinary income",
            RowTag::OrdinaryIncomeCeiling => "bracket fill <= taxable ordinary income",
            RowTag::OrdinaryBracketWidth => "ordinary bracket width",
            RowTag::CapitalGainsUpper => "capital-gains fill <= taxable gains",
            RowTag::CapitalGainsLower => "capital-gains fill >= taxable gains",
            RowTag::CapitalGainsBracketWidth => "capital-gains bracket width incl. ordinary overlap",
            RowTag::BalanceUpper => "balance recurrence (upper)",
            RowTag::BalanceLower => "balance recurrence (lower)",
            RowTag::InitialBalanceUpper => "starting balance (upper)",
            RowTag::InitialBalanceLower => "starting balance (lower)",
        }
    }
}

/// One `<=` constraint: sparse coefficients, right-hand side, and the group it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub coeffs: Vec<(usize, f64)>,
    pub bound: f64,
    pub tag: RowTag,
}

impl Row {
    pub fn dot(&self, x: &[f64]) -> f64 {
        self.coeffs.iter().map(|(col, coef)| coef * x[*col]).sum()
    }
}

/// Contiguous range of rows produced by one constraint group.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowNote {
    pub tag: RowTag,
    pub label: &'static str,
    pub start: usize,
    pub end: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BuildOptions {
    /// Objective cost per bracket step on `x[year, k]`; nudges the optimizer to
    /// fill lower brackets first when spendable income ties.
    pub bracket_tiebreak: f64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            bracket_tiebreak: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Model {
    c: Vec<f64>,
    rows: Vec<Row>,
    index: VariableIndex,
}

impl Model {
    pub fn objective(&self) -> &[f64] {
        &self.c
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn index(&self) -> &VariableIndex {
        &self.index
    }

    pub fn num_vars(&self) -> usize {
        self.c.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.rows.len()
    }

    pub fn bounds(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.bound).collect()
    }

    /// Materializes `A` row-major with `num_vars()` columns.
    pub fn dense(&self) -> Vec<Vec<f64>> {
        self.rows
            .iter()
            .map(|row| {
                let mut dense = vec![0.0; self.c.len()];
                for (col, coef) in &row.coeffs {
                    dense[*col] += coef;
                }
                dense
            })
            .collect()
    }

    pub fn notes(&self) -> Vec<RowNote> {
        let mut notes: Vec<RowNote> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            match notes.last_mut() {
                Some(note) if note.tag == row.tag => note.end = i + 1,
                _ => notes.push(RowNote {
                    tag: row.tag,
                    label: row.tag.label(),
                    start: i,
                    end: i + 1,
                }),
            }
        }
        notes
    }

    /// `b - A·x` per row.
    pub fn slack(&self, x: &[f64]) -> Vec<f64> {
        self.rows.iter().map(|r| r.bound - r.dot(x)).collect()
    }

    /// Rows whose slack is within `tol` of zero.
    pub fn binding_rows(&self, slack: &[f64], tol: f64) -> Vec<usize> {
        slack
            .iter()
            .enumerate()
            .filter(|(_, s)| s.abs() <= tol)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn snapshot(&self, x: Option<&[f64]>) -> Result<ModelSnapshot, FormatError> {
        Ok(ModelSnapshot {
            c: self.c.clone(),
            a: self.dense(),
            b: self.bounds(),
            x: x.map(<[f64]>::to_vec),
            meta: Some(self.index.dims().to_meta()?),
        })
    }
}

pub fn build_model(plan: &Plan, tax: &TaxInfo) -> Result<Model, ConfigError> {
    ModelBuilder::new(plan, tax, BuildOptions::default())?.build()
}

pub struct ModelBuilder<'a> {
    plan: &'a Plan,
    tax: &'a TaxInfo,
    index: VariableIndex,
    flags: PlanFlags,
    options: BuildOptions,
    rows: Vec<Row>,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(plan: &'a Plan, tax: &'a TaxInfo, options: BuildOptions) -> Result<Self, ConfigError> {
        plan.validate(tax)?;
        Ok(Self {
            plan,
            tax,
            index: VariableIndex::new(plan.dims(tax)),
            flags: plan.flags(),
            options,
            rows: Vec::new(),
        })
    }

    pub fn build(mut self) -> Result<Model, ConfigError> {
        let c = self.objective();
        self.cash_flow()?;
        self.spending_growth();
        self.spending_limits();
        if self.index.has_deposits() {
            self.contribution_ceilings()?;
            self.committed_contributions();
        }
        self.required_distributions()?;
        self.ordinary_income();
        if let Some(aftertax) = self.plan.aftertax_account() {
            self.capital_gains(aftertax);
        }
        self.balance_recurrence();
        self.initial_balances();

        info!(
            vars = c.len(),
            constraints = self.rows.len(),
            maximize = ?self.plan.maximize,
            "constructed plan model"
        );
        Ok(Model {
            c,
            rows: self.rows,
            index: self.index,
        })
    }

    fn push(&mut self, tag: RowTag, coeffs: Vec<(usize, f64)>, bound: f64) {
        self.rows.push(Row { coeffs, bound, tag });
    }

    fn group<F>(&mut self, tag: RowTag, emit: F)
    where
        F: FnOnce(&mut Self),
    {
        let before = self.rows.len();
        emit(self);
        debug!(group = ?tag, rows = self.rows.len() - before, "emitted constraint group");
    }

    fn objective(&self) -> Vec<f64> {
        let idx = &self.index;
        let plan = self.plan;
        let mut c = vec![0.0; idx.total_size()];
        for year in 0..plan.numyr {
            c[idx.s(year)] = -1.0;
            for k in 0..idx.tax_brackets() {
                // Every bracket costs something, so the fill never exceeds taxable
                // income even where only the floor row constrains it.
                c[idx.x(year, k)] = (k + 1) as f64 * self.options.bracket_tiebreak;
            }
        }

        let last = plan.numyr;
        match plan.maximize {
            Maximize::PlusEstate => {
                for (j, account) in plan.accounts.iter().enumerate() {
                    c[idx.b(last, j)] = -account.estate_discount;
                }
            }
            Maximize::Spending => {
                // Leftover balances only break ties; scale them by starting wealth
                // so they never compete with spendable income.
                let start = plan.starting_wealth();
                if start > 0.0 {
                    let balancer = 1.0 / start;
                    for (j, account) in plan.accounts.iter().enumerate() {
                        c[idx.b(last, j)] = -balancer * account.estate_discount;
                    }
                }
            }
        }
        c
    }

    fn cash_flow(&mut self) -> Result<(), ConfigError> {
        let plan = self.plan;
        let tax = self.tax;
        let idx = self.index;
        let credits = self.withdrawal_credits()?;
        self.group(RowTag::CashFlow, |b| {
            for (year, credit) in credits.iter().enumerate() {
                let mut row: Vec<(usize, f64)> = credit
                    .iter()
                    .enumerate()
                    .map(|(j, c)| (idx.w(year, j), -c))
                    .collect();
                for (k, bracket) in tax.ordinary().iter().enumerate() {
                    row.push((idx.x(year, k), bracket.rate));
                }
                if idx.has_deposits() {
                    for (l, bracket) in tax.capital_gains().iter().enumerate() {
                        row.push((idx.y(year, l), bracket.rate));
                    }
                    for j in 0..idx.accounts() {
                        row.push((idx.d(year, j), 1.0));
                    }
                }
                row.push((idx.s(year), 1.0));
                b.push(
                    RowTag::CashFlow,
                    row,
                    plan.income[year] + plan.ss[year] - plan.expenses[year],
                );
            }
        });
        Ok(())
    }

    /// Share of each withdrawal that reaches the household, per year and
    /// account, after the early-withdrawal penalty.
    fn withdrawal_credits(&self) -> Result<Vec<Vec<f64>>, ConfigError> {
        let plan = self.plan;
        let tax = self.tax;
        (0..plan.numyr)
            .map(|year| {
                plan.accounts
                    .iter()
                    .map(|account| -> Result<f64, ConfigError> {
                        let penalized = account.account_type.is_tax_advantaged()
                            && plan.early_penalty_applies(tax, year, &account.owner)?;
                        Ok(if penalized { 1.0 - tax.penalty_rate() } else { 1.0 })
                    })
                    .collect()
            })
            .collect()
    }

    fn spending_growth(&mut self) {
        let plan = self.plan;
        let idx = self.index;
        self.group(RowTag::SpendingGrowthUpper, |b| {
            for year in 0..plan.numyr.saturating_sub(1) {
                b.push(
                    RowTag::SpendingGrowthUpper,
                    vec![(idx.s(year + 1), 1.0), (idx.s(year), -plan.i_rate)],
                    0.0,
                );
            }
        });
        self.group(RowTag::SpendingGrowthLower, |b| {
            for year in 0..plan.numyr.saturating_sub(1) {
                b.push(
                    RowTag::SpendingGrowthLower,
                    vec![(idx.s(year), plan.i_rate), (idx.s(year + 1), -1.0)],
                    0.0,
                );
            }
        });
    }

    fn spending_limits(&mut self) {
        let s0 = self.index.s(0);
        if let Some(desired) = self.plan.desired {
            self.push(RowTag::MinSpending, vec![(s0, -1.0)], -desired);
        }
        if let Some(max) = self.plan.max {
            self.push(RowTag::MaxSpending, vec![(s0, 1.0)], max);
        }
    }

    fn contribution_ceilings(&mut self) -> Result<(), ConfigError> {
        let plan = self.plan;
        let tax = self.tax;
        let idx = self.index;
        let advantaged: Vec<usize> = plan
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.account_type.is_tax_advantaged())
            .map(|(j, _)| j)
            .collect();
        if advantaged.is_empty() {
            return Ok(());
        }

        for year in 0..plan.numyr {
            let row = advantaged.iter().map(|&j| (idx.d(year, j), 1.0)).collect();
            let ceiling = plan.contribution_ceiling(tax, year)?;
            self.push(RowTag::HouseholdContributionCeiling, row, ceiling);
        }

        // With a single retiree the household row already is the per-retiree row.
        if self.flags.retiree_count > 1 {
            for year in 0..plan.numyr {
                for retiree in &plan.retirees {
                    let row: Vec<(usize, f64)> = advantaged
                        .iter()
                        .filter(|&&j| plan.accounts[j].owner == retiree.key)
                        .map(|&j| (idx.d(year, j), 1.0))
                        .collect();
                    if row.is_empty() {
                        continue;
                    }
                    let ceiling = plan.max_contribution(tax, year, Some(&retiree.key))?;
                    self.push(RowTag::RetireeContributionCeiling, row, ceiling);
                }
            }
        }
        Ok(())
    }

    fn committed_contributions(&mut self) {
        let plan = self.plan;
        let idx = self.index;
        self.group(RowTag::CommittedContribution, |b| {
            for year in 0..plan.numyr {
                for (j, account) in plan.accounts.iter().enumerate() {
                    let committed = account.committed(year);
                    if committed > 0.0 {
                        b.push(
                            RowTag::CommittedContribution,
                            vec![(idx.d(year, j), -1.0)],
                            -committed,
                        );
                    }
                }
            }
        });
    }

    fn required_distributions(&mut self) -> Result<(), ConfigError> {
        let plan = self.plan;
        let tax = self.tax;
        let idx = self.index;
        for year in 0..plan.numyr {
            for (j, account) in plan.accounts.iter().enumerate() {
                if account.account_type != AccountType::Tdra {
                    continue;
                }
                let divisor = plan.rmd_needed(tax, year, &account.owner)?;
                if divisor <= 0.0 {
                    continue;
                }
                if idx.has_deposits() {
                    if account.committed(year) > 0.0 {
                        return Err(ConfigError::InvalidValue {
                            field: "contributions",
                            reason: format!(
                                "account {j} has a committed contribution in year {year} while distributions are required"
                            ),
                        });
                    }
                    self.push(RowTag::RmdNoDeposit, vec![(idx.d(year, j), 1.0)], 0.0);
                }
                self.push(
                    RowTag::RmdWithdrawal,
                    vec![(idx.b(year, j), 1.0 / divisor), (idx.w(year, j), -1.0)],
                    0.0,
                );
            }
        }
        Ok(())
    }

    fn ordinary_income(&mut self) {
        let plan = self.plan;
        let tax = self.tax;
        let idx = self.index;
        let tdra: Vec<usize> = plan
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.account_type == AccountType::Tdra)
            .map(|(j, _)| j)
            .collect();

        for year in 0..plan.numyr {
            let adj = plan.inflation(year);
            // Taxable ordinary income that does not depend on any decision variable.
            let fixed = plan.taxed[year] + tax.ss_taxable_fraction() * plan.ss[year]
                - tax.standard_deduction() * adj;

            let mut floor = Vec::new();
            for &j in &tdra {
                floor.push((idx.w(year, j), 1.0));
                if idx.has_deposits() {
                    floor.push((idx.d(year, j), -1.0));
                }
            }
            for k in 0..idx.tax_brackets() {
                floor.push((idx.x(year, k), -1.0));
            }
            self.push(RowTag::OrdinaryIncomeFloor, floor.clone(), -fixed);

            // A negative fixed part would make the exact sum infeasible. The floor
            // and the bracket costs in the objective pin the fill instead.
            if fixed >= 0.0 {
                let ceiling = floor.into_iter().map(|(col, coef)| (col, -coef)).collect();
                self.push(RowTag::OrdinaryIncomeCeiling, ceiling, fixed);
            }
        }

        for year in 0..plan.numyr {
            let adj = plan.inflation(year);
            for (k, bracket) in tax.ordinary().iter().enumerate() {
                if let Some(width) = bracket.width {
                    self.push(
                        RowTag::OrdinaryBracketWidth,
                        vec![(idx.x(year, k), 1.0)],
                        width * adj,
                    );
                }
            }
        }
    }

    fn capital_gains(&mut self, aftertax: usize) {
        let plan = self.plan;
        let tax = self.tax;
        let idx = self.index;
        let cg_brackets = idx.cg_brackets();

        for year in 0..plan.numyr {
            let f = taxable_fraction(plan, aftertax, year);
            let realized = plan.cg_asset_taxed[year];
            let mut upper: Vec<(usize, f64)> =
                (0..cg_brackets).map(|l| (idx.y(year, l), 1.0)).collect();
            upper.push((idx.w(year, aftertax), -f));
            upper.push((idx.d(year, aftertax), f));
            let lower = upper.iter().map(|(col, coef)| (*col, -coef)).collect();
            self.push(RowTag::CapitalGainsUpper, upper, realized);
            self.push(RowTag::CapitalGainsLower, lower, -realized);
        }

        for year in 0..plan.numyr {
            let adj = plan.inflation(year);
            for (l, bracket) in tax.capital_gains().iter().enumerate() {
                let Some(width) = bracket.width else {
                    continue;
                };
                let mut row = vec![(idx.y(year, l), 1.0)];
                row.extend(
                    tax.linked_ordinary_brackets(l)
                        .into_iter()
                        .map(|k| (idx.x(year, k), 1.0)),
                );
                self.push(RowTag::CapitalGainsBracketWidth, row, width * adj);
            }
        }
    }

    fn balance_recurrence(&mut self) {
        let plan = self.plan;
        let idx = self.index;
        let aftertax = plan.aftertax_account();
        for (tag, sign) in [(RowTag::BalanceUpper, 1.0), (RowTag::BalanceLower, -1.0)] {
            for year in 0..plan.numyr {
                for (j, account) in plan.accounts.iter().enumerate() {
                    let g = account.growth;
                    let injected = if Some(j) == aftertax {
                        plan.asset_sale[year] * g
                    } else {
                        0.0
                    };
                    let mut row = vec![
                        (idx.b(year + 1, j), sign),
                        (idx.b(year, j), -sign * g),
                        (idx.w(year, j), sign * g),
                    ];
                    if idx.has_deposits() {
                        row.push((idx.d(year, j), -sign * g));
                    }
                    self.push(tag, row, sign * injected);
                }
            }
        }
    }

    fn initial_balances(&mut self) {
        let plan = self.plan;
        let idx = self.index;
        for (tag, sign) in [
            (RowTag::InitialBalanceUpper, 1.0),
            (RowTag::InitialBalanceLower, -1.0),
        ] {
            for (j, account) in plan.accounts.iter().enumerate() {
                self.push(tag, vec![(idx.b(0, j), sign)], sign * account.balance);
            }
        }
    }
}

/// Share of an aftertax withdrawal in `year` that is a realized gain, given
/// the basis and the balance compounded at the account's growth rate.
pub fn taxable_fraction(plan: &Plan, aftertax: usize, year: usize) -> f64 {
    let account = &plan.accounts[aftertax];
    let grown = account.balance * account.growth.powi(year as i32);
    if grown <= 0.0 {
        return 0.0;
    }
    (1.0 - account.basis / grown).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tax::FilingStatus;
    use crate::core::types::fixtures::{couple_plan, single_tdra_plan};

    fn joint() -> TaxInfo {
        TaxInfo::for_status(FilingStatus::Joint)
    }

    fn coeff(row: &Row, col: usize) -> f64 {
        row.coeffs
            .iter()
            .filter(|(c, _)| *c == col)
            .map(|(_, v)| *v)
            .sum()
    }

    fn rows_tagged(model: &Model, tag: RowTag) -> Vec<&Row> {
        model.rows().iter().filter(|r| r.tag == tag).collect()
    }

    #[test]
    fn objective_rewards_spending_and_packs_brackets() {
        let plan = single_tdra_plan(3);
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();
        let c = model.objective();
        for year in 0..3 {
            assert_eq!(c[idx.s(year)], -1.0);
            assert!((c[idx.x(year, 0)] - 0.1).abs() < 1e-12);
            assert!((c[idx.x(year, 6)] - 0.7).abs() < 1e-12);
            for k in 1..7 {
                assert!(c[idx.x(year, k)] > c[idx.x(year, k - 1)]);
            }
        }
        assert_eq!(c[idx.b(3, 0)], -(1.0 / 400_000.0) * 0.85);
        assert_eq!(c[idx.b(2, 0)], 0.0);
        assert_eq!(c[idx.w(0, 0)], 0.0);
    }

    #[test]
    fn plus_estate_weights_final_balances_by_discount() {
        let mut plan = couple_plan(4);
        plan.maximize = Maximize::PlusEstate;
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let c = model.objective();
        assert_eq!(c[idx.b(4, 0)], -0.85);
        assert_eq!(c[idx.b(4, 2)], -1.0);
        assert_eq!(c[idx.b(4, 3)], -0.90);
    }

    #[test]
    fn model_without_aftertax_has_no_deposit_columns() {
        let plan = single_tdra_plan(4);
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();
        assert!(!idx.has_deposits());
        assert_eq!(model.num_vars(), 4 * 7 + 4 + 5 + 4);
        assert!(rows_tagged(&model, RowTag::CapitalGainsUpper).is_empty());
        assert!(rows_tagged(&model, RowTag::CommittedContribution).is_empty());
        assert!(rows_tagged(&model, RowTag::HouseholdContributionCeiling).is_empty());
        for row in model.rows() {
            assert!(row.coeffs.iter().all(|(col, _)| *col < model.num_vars()));
        }
        assert_eq!(model.dense().len(), model.num_constraints());
        assert!(model.dense().iter().all(|r| r.len() == model.num_vars()));
    }

    #[test]
    fn spending_growth_rows_encode_exact_inflation() {
        let plan = single_tdra_plan(3);
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let upper = rows_tagged(&model, RowTag::SpendingGrowthUpper);
        let lower = rows_tagged(&model, RowTag::SpendingGrowthLower);
        assert_eq!(upper.len(), 2);
        assert_eq!(lower.len(), 2);
        assert_eq!(coeff(upper[1], idx.s(2)), 1.0);
        assert_eq!(coeff(upper[1], idx.s(1)), -1.025);
        assert_eq!(coeff(lower[0], idx.s(0)), 1.025);
        assert_eq!(coeff(lower[0], idx.s(1)), -1.0);
        assert!(upper.iter().chain(lower.iter()).all(|r| r.bound == 0.0));
    }

    #[test]
    fn cash_flow_applies_early_withdrawal_penalty() {
        let plan = couple_plan(4);
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();
        let rows = rows_tagged(&model, RowTag::CashFlow);
        assert_eq!(rows.len(), 4);
        // will is 58 in year 0, 60 in year 2
        assert!((coeff(rows[0], idx.w(0, 0)) + 0.9).abs() < 1e-12);
        assert_eq!(coeff(rows[2], idx.w(2, 0)), -1.0);
        // aftertax never pays the penalty
        assert_eq!(coeff(rows[0], idx.w(0, 3)), -1.0);
        assert_eq!(coeff(rows[0], idx.x(0, 2)), 0.25);
        assert_eq!(coeff(rows[0], idx.y(0, 1)), 0.15);
        assert_eq!(coeff(rows[0], idx.d(0, 1)), 1.0);
        assert_eq!(coeff(rows[0], idx.s(0)), 1.0);
        assert_eq!(rows[0].bound, 40_000.0 - 5_000.0);
        assert_eq!(rows[3].bound, 40_000.0 + 25_000.0 - 5_000.0);
    }

    #[test]
    fn desired_and_max_bound_first_year_spending() {
        let mut plan = single_tdra_plan(3);
        plan.desired = Some(30_000.0);
        plan.max = Some(50_000.0);
        let model = build_model(&plan, &joint()).expect("model builds");
        let s0 = model.index().s(0);
        let min = rows_tagged(&model, RowTag::MinSpending);
        let max = rows_tagged(&model, RowTag::MaxSpending);
        assert_eq!(min.len(), 1);
        assert_eq!(coeff(min[0], s0), -1.0);
        assert_eq!(min[0].bound, -30_000.0);
        assert_eq!(max[0].bound, 50_000.0);

        let plain = build_model(&single_tdra_plan(3), &joint()).expect("model builds");
        assert!(rows_tagged(&plain, RowTag::MinSpending).is_empty());
        assert!(rows_tagged(&plain, RowTag::MaxSpending).is_empty());
    }

    #[test]
    fn contribution_rows_cover_household_retirees_and_commitments() {
        let plan = couple_plan(4);
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();

        let household = rows_tagged(&model, RowTag::HouseholdContributionCeiling);
        assert_eq!(household.len(), 4);
        assert_eq!(household[0].coeffs.len(), 3);
        assert_eq!(coeff(household[0], idx.d(0, 3)), 0.0);
        assert!((household[0].bound - 13_000.0).abs() < 1e-9);

        let per_retiree = rows_tagged(&model, RowTag::RetireeContributionCeiling);
        assert_eq!(per_retiree.len(), 4 * 2);
        assert_eq!(per_retiree[0].coeffs, vec![(idx.d(0, 0), 1.0)]);
        assert_eq!(
            per_retiree[1].coeffs,
            vec![(idx.d(0, 1), 1.0), (idx.d(0, 2), 1.0)]
        );

        let committed = rows_tagged(&model, RowTag::CommittedContribution);
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].coeffs, vec![(idx.d(0, 0), -1.0)]);
        assert_eq!(committed[0].bound, -3_000.0);
        assert_eq!(committed[1].coeffs, vec![(idx.d(1, 0), -1.0)]);
    }

    #[test]
    fn rmd_rows_start_at_seventy() {
        let mut plan = couple_plan(14);
        plan.accounts[0].contributions.clear();
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let withdrawals = rows_tagged(&model, RowTag::RmdWithdrawal);
        let no_deposit = rows_tagged(&model, RowTag::RmdNoDeposit);
        // will reaches 70 in year 12, spouse in year 14 (outside the plan)
        assert_eq!(withdrawals.len(), 2);
        assert_eq!(no_deposit.len(), 2);
        assert_eq!(coeff(withdrawals[0], idx.b(12, 0)), 1.0 / 27.4);
        assert_eq!(coeff(withdrawals[0], idx.w(12, 0)), -1.0);
        assert_eq!(coeff(withdrawals[1], idx.b(13, 0)), 1.0 / 26.5);
        assert_eq!(no_deposit[0].coeffs, vec![(idx.d(12, 0), 1.0)]);
    }

    #[test]
    fn rmd_rows_without_deposit_block_skip_lockout() {
        let mut plan = single_tdra_plan(3);
        plan.retirees[0].age_at_start = 71;
        let model = build_model(&plan, &joint()).expect("model builds");
        assert_eq!(rows_tagged(&model, RowTag::RmdWithdrawal).len(), 3);
        assert!(rows_tagged(&model, RowTag::RmdNoDeposit).is_empty());
    }

    #[test]
    fn ordinary_income_rows_sum_brackets_to_taxable_income() {
        let plan = couple_plan(4);
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();
        let floors = rows_tagged(&model, RowTag::OrdinaryIncomeFloor);
        let ceilings = rows_tagged(&model, RowTag::OrdinaryIncomeCeiling);
        assert_eq!(floors.len(), 4);
        assert_eq!(ceilings.len(), 4);

        assert_eq!(coeff(floors[0], idx.w(0, 0)), 1.0);
        assert_eq!(coeff(floors[0], idx.w(0, 1)), 1.0);
        assert_eq!(coeff(floors[0], idx.w(0, 2)), 0.0);
        assert_eq!(coeff(floors[0], idx.d(0, 0)), -1.0);
        assert_eq!(coeff(floors[0], idx.x(0, 4)), -1.0);
        assert!((floors[0].bound - (20_800.0 - 40_000.0)).abs() < 1e-9);

        let fixed_3 = 40_000.0 + 0.85 * 25_000.0 - 20_800.0 * 1.025f64.powi(3);
        assert!((ceilings[3].bound - fixed_3).abs() < 1e-9);
        assert_eq!(coeff(ceilings[3], idx.x(3, 0)), 1.0);
        assert_eq!(coeff(ceilings[3], idx.w(3, 1)), -1.0);

        let widths = rows_tagged(&model, RowTag::OrdinaryBracketWidth);
        assert_eq!(widths.len(), 4 * 6);
        assert_eq!(widths[0].bound, 18_650.0);
        assert!((widths[6].bound - 18_650.0 * 1.025).abs() < 1e-9);
    }

    #[test]
    fn ordinary_ceiling_is_dropped_when_deduction_exceeds_income() {
        let mut plan = single_tdra_plan(2);
        plan.taxed = vec![1_000.0, 1_000.0];
        let model = build_model(&plan, &joint()).expect("model builds");
        assert_eq!(rows_tagged(&model, RowTag::OrdinaryIncomeFloor).len(), 2);
        assert!(rows_tagged(&model, RowTag::OrdinaryIncomeCeiling).is_empty());
    }

    #[test]
    fn capital_gains_rows_track_compounding_fraction() {
        let mut plan = couple_plan(3);
        plan.cg_asset_taxed[1] = 12_000.0;
        let tax = joint();
        let model = build_model(&plan, &tax).expect("model builds");
        let idx = model.index();
        let upper = rows_tagged(&model, RowTag::CapitalGainsUpper);
        let lower = rows_tagged(&model, RowTag::CapitalGainsLower);
        assert_eq!(upper.len(), 3);

        assert!((coeff(upper[0], idx.w(0, 3)) + 1.0 / 3.0).abs() < 1e-12);
        let f2 = 1.0 - 200_000.0 / (300_000.0 * 1.06f64.powi(2));
        assert!((coeff(upper[2], idx.w(2, 3)) + f2).abs() < 1e-12);
        assert!((coeff(lower[2], idx.w(2, 3)) - f2).abs() < 1e-12);
        // deposits into the aftertax account offset withdrawn gains
        assert!((coeff(upper[0], idx.d(0, 3)) - 1.0 / 3.0).abs() < 1e-12);
        assert!((coeff(lower[0], idx.d(0, 3)) + 1.0 / 3.0).abs() < 1e-12);
        assert!((coeff(upper[2], idx.d(2, 3)) - f2).abs() < 1e-12);
        assert_eq!(coeff(upper[0], idx.d(0, 0)), 0.0);
        for l in 0..3 {
            assert_eq!(coeff(upper[0], idx.y(0, l)), 1.0);
            assert_eq!(coeff(lower[0], idx.y(0, l)), -1.0);
        }
        assert_eq!(upper[1].bound, 12_000.0);
        assert_eq!(lower[1].bound, -12_000.0);
    }

    #[test]
    fn capital_gains_brackets_share_room_with_ordinary_brackets() {
        let plan = couple_plan(2);
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let widths = rows_tagged(&model, RowTag::CapitalGainsBracketWidth);
        assert_eq!(widths.len(), 2 * 2);
        let first = widths[0];
        assert_eq!(
            first.coeffs,
            vec![(idx.y(0, 0), 1.0), (idx.x(0, 0), 1.0), (idx.x(0, 1), 1.0)]
        );
        assert_eq!(first.bound, 75_900.0);
        let second = widths[1];
        assert_eq!(second.coeffs.len(), 5);
        assert_eq!(coeff(second, idx.x(0, 5)), 1.0);
        assert_eq!(coeff(second, idx.x(0, 6)), 0.0);
    }

    #[test]
    fn balance_rows_grow_net_flows_and_inject_asset_sales() {
        let mut plan = couple_plan(3);
        plan.asset_sale[2] = 80_000.0;
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let upper = rows_tagged(&model, RowTag::BalanceUpper);
        let lower = rows_tagged(&model, RowTag::BalanceLower);
        assert_eq!(upper.len(), 3 * 4);
        assert_eq!(lower.len(), 3 * 4);

        let row = upper[0];
        assert_eq!(coeff(row, idx.b(1, 0)), 1.0);
        assert_eq!(coeff(row, idx.b(0, 0)), -1.06);
        assert_eq!(coeff(row, idx.w(0, 0)), 1.06);
        assert_eq!(coeff(row, idx.d(0, 0)), -1.06);
        assert_eq!(row.bound, 0.0);

        // year 2, aftertax account
        let sale_upper = upper[2 * 4 + 3];
        let sale_lower = lower[2 * 4 + 3];
        assert_eq!(coeff(sale_upper, idx.b(3, 3)), 1.0);
        assert!((sale_upper.bound - 80_000.0 * 1.06).abs() < 1e-9);
        assert!((sale_lower.bound + 80_000.0 * 1.06).abs() < 1e-9);
        assert_eq!(upper[2 * 4 + 2].bound, 0.0);
    }

    #[test]
    fn initial_balances_are_pinned_both_ways() {
        let plan = couple_plan(2);
        let model = build_model(&plan, &joint()).expect("model builds");
        let idx = model.index();
        let upper = rows_tagged(&model, RowTag::InitialBalanceUpper);
        let lower = rows_tagged(&model, RowTag::InitialBalanceLower);
        assert_eq!(upper.len(), 4);
        assert_eq!(upper[2].coeffs, vec![(idx.b(0, 2), 1.0)]);
        assert_eq!(upper[2].bound, 100_000.0);
        assert_eq!(lower[2].coeffs, vec![(idx.b(0, 2), -1.0)]);
        assert_eq!(lower[2].bound, -100_000.0);
    }

    #[test]
    fn notes_partition_rows_into_contiguous_groups() {
        let model = build_model(&couple_plan(4), &joint()).expect("model builds");
        let notes = model.notes();
        assert_eq!(notes.first().map(|n| n.start), Some(0));
        assert_eq!(notes.last().map(|n| n.end), Some(model.num_constraints()));
        for pair in notes.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert_ne!(pair[0].tag, pair[1].tag);
        }
        assert_eq!(notes[0].tag, RowTag::CashFlow);
        assert_eq!(notes[0].end, 4);
    }

    #[test]
    fn unknown_retiree_fails_before_any_row() {
        let mut plan = couple_plan(3);
        plan.accounts[2].owner = "ghost".to_string();
        let err = build_model(&plan, &joint()).expect_err("config error");
        assert!(matches!(err, ConfigError::UnknownRetiree { account: 2, .. }));
    }

    #[test]
    fn slack_and_binding_rows_follow_bounds() {
        let plan = single_tdra_plan(2);
        let model = build_model(&plan, &joint()).expect("model builds");
        let x = vec![0.0; model.num_vars()];
        let slack = model.slack(&x);
        assert_eq!(slack.len(), model.num_constraints());
        let binding = model.binding_rows(&slack, 1e-9);
        // growth rows have zero bounds and are binding at the origin
        let growth_rows: Vec<usize> = model
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                matches!(r.tag, RowTag::SpendingGrowthUpper | RowTag::SpendingGrowthLower)
            })
            .map(|(i, _)| i)
            .collect();
        for row in growth_rows {
            assert!(binding.contains(&row));
        }
    }

    #[test]
    fn tiebreak_is_tunable() {
        let plan = single_tdra_plan(2);
        let tax = joint();
        let model = ModelBuilder::new(
            &plan,
            &tax,
            BuildOptions {
                bracket_tiebreak: 0.5,
            },
        )
        .expect("valid plan")
        .build()
        .expect("model builds");
        let idx = model.index();
        assert_eq!(model.objective()[idx.x(1, 2)], 1.5);
    }
}
