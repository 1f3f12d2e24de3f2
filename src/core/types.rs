use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::index::{AccountTypeCounts, PlanDims};
use super::tax::TaxInfo;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Tax-deferred (traditional IRA and friends).
    #[serde(alias = "IRA", alias = "ira")]
    Tdra,
    #[serde(alias = "Roth")]
    Roth,
    Aftertax,
}

impl AccountType {
    pub fn label(self) -> &'static str {
        match self {
            AccountType::Tdra => "tdra",
            AccountType::Roth => "roth",
            AccountType::Aftertax => "aftertax",
        }
    }

    /// Tax-advantaged accounts carry contribution limits and early-withdrawal penalties.
    pub fn is_tax_advantaged(self) -> bool {
        !matches!(self, AccountType::Aftertax)
    }

    /// Default weighting of a leftover balance after death.
    pub fn default_estate_discount(self) -> f64 {
        match self {
            AccountType::Tdra => 0.85,
            AccountType::Roth => 1.0,
            AccountType::Aftertax => 0.90,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum Maximize {
    #[default]
    #[serde(alias = "spending")]
    Spending,
    #[serde(alias = "plus-estate", alias = "plusestate")]
    PlusEstate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Retiree {
    pub key: String,
    pub age_at_start: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub account_type: AccountType,
    /// Retiree key used for RMD and penalty lookups.
    pub owner: String,
    pub balance: f64,
    /// Annual growth multiplier, e.g. 1.06.
    pub growth: f64,
    pub estate_discount: f64,
    /// Cost basis; only meaningful for the aftertax account.
    pub basis: f64,
    /// Committed per-year contributions; empty when none are scheduled.
    pub contributions: Vec<f64>,
}

impl Account {
    pub fn committed(&self, year: usize) -> f64 {
        self.contributions.get(year).copied().unwrap_or(0.0)
    }
}

/// Normalized plan record consumed read-only by the builder and the checker.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub numyr: usize,
    /// Inflation multiplier, e.g. 1.025.
    pub i_rate: f64,
    pub maximize: Maximize,
    pub income: Vec<f64>,
    pub ss: Vec<f64>,
    pub taxed: Vec<f64>,
    pub expenses: Vec<f64>,
    /// Cash from illiquid asset sales, deposited into the aftertax account.
    pub asset_sale: Vec<f64>,
    /// Capital gain already realized by those sales.
    pub cg_asset_taxed: Vec<f64>,
    pub desired: Option<f64>,
    pub max: Option<f64>,
    pub retirees: Vec<Retiree>,
    pub accounts: Vec<Account>,
}

/// Declarative switches the builder branches on instead of keeping per-variant code paths.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PlanFlags {
    pub has_aftertax: bool,
    pub retiree_count: usize,
    pub has_asset_sales: bool,
}

impl Plan {
    pub fn flags(&self) -> PlanFlags {
        PlanFlags {
            has_aftertax: self.aftertax_account().is_some(),
            retiree_count: self.retirees.len(),
            has_asset_sales: self
                .asset_sale
                .iter()
                .chain(self.cg_asset_taxed.iter())
                .any(|v| *v != 0.0),
        }
    }

    pub fn account_type_counts(&self) -> AccountTypeCounts {
        let mut counts = AccountTypeCounts::default();
        for account in &self.accounts {
            match account.account_type {
                AccountType::Tdra => counts.tdra += 1,
                AccountType::Roth => counts.roth += 1,
                AccountType::Aftertax => counts.aftertax += 1,
            }
        }
        counts
    }

    pub fn dims(&self, tax: &TaxInfo) -> PlanDims {
        PlanDims {
            years: self.numyr,
            tax_brackets: tax.ordinary().len(),
            cg_brackets: tax.capital_gains().len(),
            accounts: self.accounts.len(),
            account_types: self.account_type_counts(),
        }
    }

    pub fn aftertax_account(&self) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.account_type == AccountType::Aftertax)
    }

    pub fn inflation(&self, year: usize) -> f64 {
        self.i_rate.powi(year as i32)
    }

    pub fn starting_wealth(&self) -> f64 {
        self.accounts.iter().map(|a| a.balance).sum()
    }

    pub fn retiree(&self, key: &str) -> Result<&Retiree, ConfigError> {
        self.retirees
            .iter()
            .find(|r| r.key == key)
            .ok_or_else(|| ConfigError::NoSuchRetiree(key.to_string()))
    }

    /// Age of the account owner in `year`. An aftertax account may be held
    /// jointly; without a matching owner it follows the first retiree.
    pub fn owner_age(&self, year: usize, account: &Account) -> Result<u32, ConfigError> {
        let retiree = match self.retiree(&account.owner) {
            Ok(r) => r,
            Err(err) => match (account.account_type, self.retirees.first()) {
                (AccountType::Aftertax, Some(first)) => first,
                _ => return Err(err),
            },
        };
        Ok(retiree.age_at_start + year as u32)
    }

    /// RMD divisor for `key` in `year`, or 0 when no distribution is required.
    pub fn rmd_needed(&self, tax: &TaxInfo, year: usize, key: &str) -> Result<f64, ConfigError> {
        let age = self.retiree(key)?.age_at_start + year as u32;
        Ok(tax.rmd_divisor(age).unwrap_or(0.0))
    }

    pub fn early_penalty_applies(
        &self,
        tax: &TaxInfo,
        year: usize,
        key: &str,
    ) -> Result<bool, ConfigError> {
        let age = self.retiree(key)?.age_at_start + year as u32;
        Ok(age < tax.penalty_free_age())
    }

    /// Inflation-adjusted contribution ceiling for one retiree, or for the
    /// whole household when `key` is `None`.
    pub fn max_contribution(
        &self,
        tax: &TaxInfo,
        year: usize,
        key: Option<&str>,
    ) -> Result<f64, ConfigError> {
        let limit = match key {
            Some(key) => tax.contribution_limit(self.retiree(key)?.age_at_start + year as u32),
            None => self
                .retirees
                .iter()
                .map(|r| tax.contribution_limit(r.age_at_start + year as u32))
                .sum(),
        };
        Ok(limit * self.inflation(year))
    }

    /// Household contribution ceiling: statutory limit capped by taxed earned income.
    pub fn contribution_ceiling(&self, tax: &TaxInfo, year: usize) -> Result<f64, ConfigError> {
        Ok(self.taxed[year].min(self.max_contribution(tax, year, None)?))
    }

    /// Structural validation; fails fast before any row is built.
    pub fn validate(&self, tax: &TaxInfo) -> Result<(), ConfigError> {
        if self.numyr == 0 {
            return Err(ConfigError::NoYears);
        }
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        if self.retirees.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "retirees",
                reason: "at least one retiree is required".to_string(),
            });
        }
        if !self.i_rate.is_finite() || self.i_rate <= 0.0 {
            return Err(ConfigError::InvalidInflation(self.i_rate));
        }

        for (field, values) in [
            ("income", &self.income),
            ("ss", &self.ss),
            ("taxed", &self.taxed),
            ("expenses", &self.expenses),
            ("asset_sale", &self.asset_sale),
            ("cg_asset_taxed", &self.cg_asset_taxed),
        ] {
            if values.len() != self.numyr {
                return Err(ConfigError::YearVectorLength {
                    field,
                    expected: self.numyr,
                    actual: values.len(),
                });
            }
        }

        for (j, account) in self.accounts.iter().enumerate() {
            if account.account_type.is_tax_advantaged() && self.retiree(&account.owner).is_err() {
                return Err(ConfigError::UnknownRetiree {
                    account: j,
                    key: account.owner.clone(),
                });
            }
            if !account.growth.is_finite() || account.growth <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "growth",
                    reason: format!("account {j} growth multiplier {} must be > 0", account.growth),
                });
            }
            if !account.balance.is_finite() || account.balance < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "balance",
                    reason: format!("account {j} balance {} must be >= 0", account.balance),
                });
            }
            if !account.contributions.is_empty() && account.contributions.len() != self.numyr {
                return Err(ConfigError::YearVectorLength {
                    field: "contributions",
                    expected: self.numyr,
                    actual: account.contributions.len(),
                });
            }
        }

        let counts = self.account_type_counts();
        if counts.aftertax > 1 {
            return Err(ConfigError::MultipleAftertax(counts.aftertax));
        }
        let flags = self.flags();
        if !flags.has_aftertax {
            let contributes = self
                .accounts
                .iter()
                .any(|a| a.contributions.iter().any(|v| *v != 0.0));
            if contributes {
                return Err(ConfigError::RequiresAftertax("contributions"));
            }
            if flags.has_asset_sales {
                return Err(ConfigError::RequiresAftertax("asset sales"));
            }
        }

        self.precheck_contributions(tax)
    }

    fn precheck_contributions(&self, tax: &TaxInfo) -> Result<(), ConfigError> {
        for year in 0..self.numyr {
            let committed: f64 = self
                .accounts
                .iter()
                .filter(|a| a.account_type.is_tax_advantaged())
                .map(|a| a.committed(year))
                .sum();
            if committed <= 0.0 {
                continue;
            }
            let ceiling = self.contribution_ceiling(tax, year)?;
            if committed > ceiling + 1e-9 {
                return Err(ConfigError::ContributionExceedsCeiling {
                    year,
                    committed,
                    ceiling,
                });
            }
            for retiree in &self.retirees {
                let own: f64 = self
                    .accounts
                    .iter()
                    .filter(|a| a.account_type.is_tax_advantaged() && a.owner == retiree.key)
                    .map(|a| a.committed(year))
                    .sum();
                let ceiling = self.max_contribution(tax, year, Some(&retiree.key))?;
                if own > ceiling + 1e-9 {
                    return Err(ConfigError::ContributionExceedsCeiling {
                        year,
                        committed: own,
                        ceiling,
                    });
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{couple_plan, single_tdra_plan};
    use super::*;
    use crate::core::tax::FilingStatus;

    fn joint() -> TaxInfo {
        TaxInfo::for_status(FilingStatus::Joint)
    }

    #[test]
    fn fixtures_validate() {
        single_tdra_plan(5).validate(&joint()).expect("single plan is valid");
        couple_plan(6).validate(&joint()).expect("couple plan is valid");
    }

    #[test]
    fn rmd_needed_starts_at_seventy() {
        let plan = couple_plan(15);
        let tax = joint();
        assert_eq!(plan.rmd_needed(&tax, 11, "will").expect("known retiree"), 0.0);
        assert_eq!(plan.rmd_needed(&tax, 12, "will").expect("known retiree"), 27.4);
        assert_eq!(plan.rmd_needed(&tax, 13, "will").expect("known retiree"), 26.5);
        assert!(plan.rmd_needed(&tax, 0, "nobody").is_err());
    }

    #[test]
    fn early_penalty_stops_at_sixty() {
        let plan = couple_plan(6);
        let tax = joint();
        assert!(plan.early_penalty_applies(&tax, 1, "will").expect("known"));
        assert!(!plan.early_penalty_applies(&tax, 2, "will").expect("known"));
        assert!(plan.early_penalty_applies(&tax, 3, "spouse").expect("known"));
        assert!(!plan.early_penalty_applies(&tax, 4, "spouse").expect("known"));
    }

    #[test]
    fn owner_age_falls_back_to_first_retiree_for_aftertax() {
        let plan = couple_plan(4);
        let aftertax = &plan.accounts[3];
        assert_eq!(plan.owner_age(2, aftertax).expect("fallback"), 60);
        assert_eq!(plan.owner_age(2, &plan.accounts[1]).expect("owned"), 58);

        let mut orphan = plan.accounts[0].clone();
        orphan.owner = "ghost".to_string();
        assert!(plan.owner_age(0, &orphan).is_err());
    }

    #[test]
    fn max_contribution_sums_household_and_inflates() {
        let plan = couple_plan(4);
        let tax = joint();
        // will is 58 (catch-up), spouse is 56 (catch-up)
        let household = plan.max_contribution(&tax, 0, None).expect("household");
        assert!((household - 13_000.0).abs() < 1e-9);
        let will = plan.max_contribution(&tax, 1, Some("will")).expect("will");
        assert!((will - 6_500.0 * 1.025).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_unknown_owner() {
        let mut plan = single_tdra_plan(3);
        plan.accounts[0].owner = "ghost".to_string();
        let err = plan.validate(&joint()).expect_err("unknown owner");
        assert_eq!(
            err,
            ConfigError::UnknownRetiree {
                account: 0,
                key: "ghost".to_string()
            }
        );
    }

    #[test]
    fn validate_rejects_short_year_vectors() {
        let mut plan = single_tdra_plan(3);
        plan.expenses.pop();
        let err = plan.validate(&joint()).expect_err("short vector");
        assert!(matches!(
            err,
            ConfigError::YearVectorLength {
                field: "expenses",
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn validate_requires_aftertax_for_deposits_and_asset_sales() {
        let mut plan = single_tdra_plan(3);
        plan.accounts[0].contributions = vec![1_000.0, 0.0, 0.0];
        assert_eq!(
            plan.validate(&joint()),
            Err(ConfigError::RequiresAftertax("contributions"))
        );

        let mut plan = single_tdra_plan(3);
        plan.asset_sale[1] = 50_000.0;
        assert_eq!(
            plan.validate(&joint()),
            Err(ConfigError::RequiresAftertax("asset sales"))
        );
    }

    #[test]
    fn validate_rejects_second_aftertax_account() {
        let mut plan = couple_plan(3);
        let extra = plan.accounts[3].clone();
        plan.accounts.push(extra);
        assert_eq!(plan.validate(&joint()), Err(ConfigError::MultipleAftertax(2)));
    }

    #[test]
    fn validate_rejects_contributions_above_ceiling() {
        let mut plan = couple_plan(3);
        plan.accounts[0].contributions = vec![9_000.0, 0.0, 0.0];
        let err = plan.validate(&joint()).expect_err("will's ceiling is 6_500");
        assert!(matches!(
            err,
            ConfigError::ContributionExceedsCeiling { year: 0, .. }
        ));
    }

    #[test]
    fn flags_reflect_plan_shape() {
        let flags = couple_plan(3).flags();
        assert!(flags.has_aftertax);
        assert_eq!(flags.retiree_count, 2);
        assert!(!flags.has_asset_sales);
        assert!(!single_tdra_plan(3).flags().has_aftertax);
    }
}
