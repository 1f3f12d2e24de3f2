use serde::{Deserialize, Serialize};

use super::error::ConfigError;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilingStatus {
    Single,
    #[serde(rename = "mseparate", alias = "married-separate")]
    MarriedSeparate,
    #[default]
    #[serde(alias = "married-joint")]
    Joint,
}

/// One progressive bracket. `width` is `None` only for the open-ended top bracket.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Bracket {
    pub cutoff: f64,
    pub width: Option<f64>,
    pub rate: f64,
}

impl Bracket {
    const fn new(cutoff: f64, width: f64, rate: f64) -> Self {
        Self {
            cutoff,
            width: Some(width),
            rate,
        }
    }

    const fn top(cutoff: f64, rate: f64) -> Self {
        Self {
            cutoff,
            width: None,
            rate,
        }
    }

    /// Amount of `[lo, hi)` (already inflated) that falls inside this bracket.
    fn overlap(&self, lo: f64, hi: f64, adj: f64) -> f64 {
        let start = self.cutoff * adj;
        let end = self.width.map_or(f64::INFINITY, |w| start + w * adj);
        (hi.min(end) - lo.max(start)).max(0.0)
    }
}

/// Raw tables as supplied by a caller; validated into a [`TaxInfo`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaxTables {
    pub ordinary: Vec<Bracket>,
    pub capital_gains: Vec<Bracket>,
    pub standard_deduction: f64,
    /// Divisors indexed by `age - rmd_start_age`.
    pub rmd_divisors: Vec<f64>,
    pub rmd_start_age: u32,
    pub penalty_rate: f64,
    pub penalty_free_age: u32,
    pub ss_taxable_fraction: f64,
    pub contribution_limit: f64,
    pub catchup_contribution: f64,
    pub catchup_age: u32,
}

/// Immutable per-filing-status tax configuration, shared by reference between
/// the model builder and the consistency checker.
#[derive(Clone, Debug, PartialEq)]
pub struct TaxInfo {
    tables: TaxTables,
}

// 2017 tables. Columns: bracket start, bracket width, marginal rate.
const JOINT_ORDINARY: [Bracket; 7] = [
    Bracket::new(0.0, 18_650.0, 0.10),
    Bracket::new(18_650.0, 57_250.0, 0.15),
    Bracket::new(75_900.0, 77_200.0, 0.25),
    Bracket::new(153_100.0, 80_250.0, 0.28),
    Bracket::new(233_350.0, 183_350.0, 0.33),
    Bracket::new(416_700.0, 54_000.0, 0.35),
    Bracket::top(470_700.0, 0.396),
];

const SEPARATE_ORDINARY: [Bracket; 7] = [
    Bracket::new(0.0, 9_325.0, 0.10),
    Bracket::new(9_325.0, 28_625.0, 0.15),
    Bracket::new(37_950.0, 38_600.0, 0.25),
    Bracket::new(76_550.0, 40_125.0, 0.28),
    Bracket::new(116_675.0, 91_675.0, 0.33),
    Bracket::new(208_350.0, 27_000.0, 0.35),
    Bracket::top(235_350.0, 0.396),
];

const SINGLE_ORDINARY: [Bracket; 7] = [
    Bracket::new(0.0, 9_325.0, 0.10),
    Bracket::new(9_325.0, 28_625.0, 0.15),
    Bracket::new(37_950.0, 53_950.0, 0.25),
    Bracket::new(91_900.0, 99_750.0, 0.28),
    Bracket::new(191_650.0, 225_050.0, 0.33),
    Bracket::new(416_700.0, 1_700.0, 0.35),
    Bracket::top(418_400.0, 0.396),
];

const JOINT_CAPITAL_GAINS: [Bracket; 3] = [
    Bracket::new(0.0, 75_900.0, 0.0),
    Bracket::new(75_900.0, 394_800.0, 0.15),
    Bracket::top(470_700.0, 0.20),
];

const SEPARATE_CAPITAL_GAINS: [Bracket; 3] = [
    Bracket::new(0.0, 76_550.0, 0.0),
    Bracket::new(76_550.0, 158_800.0, 0.15),
    Bracket::top(235_350.0, 0.20),
];

const SINGLE_CAPITAL_GAINS: [Bracket; 3] = [
    Bracket::new(0.0, 37_950.0, 0.0),
    Bracket::new(37_950.0, 380_450.0, 0.15),
    Bracket::top(418_400.0, 0.20),
];

// IRS publication 590-B, appendix B table III, ages 70 through 119.
const RMD_DIVISORS: [f64; 50] = [
    27.4, 26.5, 25.6, 24.7, 23.8, 22.9, 22.0, 21.2, 20.3, 19.5, //
    18.7, 17.9, 17.1, 16.3, 15.5, 14.8, 14.1, 13.4, 12.7, 12.0, //
    11.4, 10.8, 10.2, 9.6, 9.1, 8.6, 8.1, 7.6, 7.1, 6.7, //
    6.3, 5.9, 5.5, 5.2, 4.9, 4.5, 4.2, 3.9, 3.7, 3.4, //
    3.1, 2.9, 2.6, 2.4, 2.1, 1.9, 1.9, 1.9, 1.9, 1.9,
];

const PERSONAL_EXEMPTION: f64 = 4_050.0;

impl TaxInfo {
    pub fn for_status(status: FilingStatus) -> Self {
        let (ordinary, capital_gains, standard_deduction) = match status {
            FilingStatus::Single => (
                SINGLE_ORDINARY.to_vec(),
                SINGLE_CAPITAL_GAINS.to_vec(),
                6_350.0 + PERSONAL_EXEMPTION,
            ),
            FilingStatus::MarriedSeparate => (
                SEPARATE_ORDINARY.to_vec(),
                SEPARATE_CAPITAL_GAINS.to_vec(),
                9_350.0 + PERSONAL_EXEMPTION,
            ),
            FilingStatus::Joint => (
                JOINT_ORDINARY.to_vec(),
                JOINT_CAPITAL_GAINS.to_vec(),
                12_700.0 + 2.0 * PERSONAL_EXEMPTION,
            ),
        };
        Self {
            tables: TaxTables {
                ordinary,
                capital_gains,
                standard_deduction,
                rmd_divisors: RMD_DIVISORS.to_vec(),
                rmd_start_age: 70,
                penalty_rate: 0.10,
                penalty_free_age: 60,
                ss_taxable_fraction: 0.85,
                contribution_limit: 5_500.0,
                catchup_contribution: 1_000.0,
                catchup_age: 50,
            },
        }
    }

    pub fn new(tables: TaxTables) -> Result<Self, ConfigError> {
        validate_brackets("ordinary", &tables.ordinary)?;
        validate_brackets("capital-gains", &tables.capital_gains)?;
        for cg in tables.capital_gains.iter().skip(1) {
            let aligned = tables
                .ordinary
                .iter()
                .any(|b| (b.cutoff - cg.cutoff).abs() <= 1e-9);
            if !aligned {
                return Err(ConfigError::BracketAlignment(cg.cutoff));
            }
        }
        if tables.rmd_divisors.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "rmd_divisors",
                reason: "divisors must be finite and > 0".to_string(),
            });
        }
        for (field, value) in [
            ("penalty_rate", tables.penalty_rate),
            ("ss_taxable_fraction", tables.ss_taxable_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{value} must be between 0 and 1"),
                });
            }
        }
        if tables.standard_deduction < 0.0
            || tables.contribution_limit < 0.0
            || tables.catchup_contribution < 0.0
        {
            return Err(ConfigError::InvalidValue {
                field: "standard_deduction",
                reason: "deduction and contribution limits must be >= 0".to_string(),
            });
        }
        Ok(Self { tables })
    }

    pub fn tables(&self) -> &TaxTables {
        &self.tables
    }

    pub fn ordinary(&self) -> &[Bracket] {
        &self.tables.ordinary
    }

    pub fn capital_gains(&self) -> &[Bracket] {
        &self.tables.capital_gains
    }

    pub fn standard_deduction(&self) -> f64 {
        self.tables.standard_deduction
    }

    pub fn penalty_rate(&self) -> f64 {
        self.tables.penalty_rate
    }

    pub fn penalty_free_age(&self) -> u32 {
        self.tables.penalty_free_age
    }

    pub fn ss_taxable_fraction(&self) -> f64 {
        self.tables.ss_taxable_fraction
    }

    /// RMD divisor at `age`, or `None` before the RMD start age. Ages past the
    /// end of the table use its last entry.
    pub fn rmd_divisor(&self, age: u32) -> Option<f64> {
        if age < self.tables.rmd_start_age {
            return None;
        }
        let offset = (age - self.tables.rmd_start_age) as usize;
        let divisors = &self.tables.rmd_divisors;
        divisors
            .get(offset)
            .or_else(|| divisors.last())
            .copied()
    }

    /// Statutory per-retiree contribution limit at `age`, in plan-start dollars.
    pub fn contribution_limit(&self, age: u32) -> f64 {
        let mut limit = self.tables.contribution_limit;
        if age >= self.tables.catchup_age {
            limit += self.tables.catchup_contribution;
        }
        limit
    }

    /// Ordinary brackets whose start falls inside capital-gains bracket `l`.
    /// Capital gains stack on top of ordinary income, so these brackets
    /// consume the same dollar range. Empty for the open-ended top bracket.
    pub fn linked_ordinary_brackets(&self, l: usize) -> Vec<usize> {
        let cg = &self.tables.capital_gains;
        let Some(next) = cg.get(l + 1) else {
            return Vec::new();
        };
        let start = cg[l].cutoff;
        let ordinary = &self.tables.ordinary;
        (0..ordinary.len().saturating_sub(1))
            .filter(|&k| ordinary[k].cutoff >= start && ordinary[k].cutoff < next.cutoff)
            .collect()
    }

    /// Progressive tax on `taxable` ordinary income with brackets scaled by `adj`.
    pub fn ordinary_tax(&self, taxable: f64, adj: f64) -> f64 {
        let taxable = taxable.max(0.0);
        self.ordinary()
            .iter()
            .map(|b| b.rate * b.overlap(0.0, taxable, adj))
            .sum()
    }

    /// Tax on `gains` stacked on top of `ordinary_taxable` income.
    pub fn capital_gains_tax(&self, ordinary_taxable: f64, gains: f64, adj: f64) -> f64 {
        let lo = ordinary_taxable.max(0.0);
        let hi = lo + gains.max(0.0);
        self.capital_gains()
            .iter()
            .map(|b| b.rate * b.overlap(lo, hi, adj))
            .sum()
    }
}

fn validate_brackets(table: &'static str, brackets: &[Bracket]) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBrackets { table, reason };
    let Some(first) = brackets.first() else {
        return Err(invalid("table is empty".to_string()));
    };
    if first.cutoff != 0.0 {
        return Err(invalid(format!("first cutoff is {} not 0", first.cutoff)));
    }
    for (k, bracket) in brackets.iter().enumerate() {
        if !(0.0..1.0).contains(&bracket.rate) {
            return Err(invalid(format!("bracket {k} rate {} not in [0, 1)", bracket.rate)));
        }
        let last = k + 1 == brackets.len();
        match (bracket.width, last) {
            (None, true) => {}
            (None, false) => {
                return Err(invalid(format!("bracket {k} is unbounded but not last")));
            }
            (Some(_), true) => {
                return Err(invalid("top bracket must be unbounded".to_string()));
            }
            (Some(width), false) => {
                if !width.is_finite() || width <= 0.0 {
                    return Err(invalid(format!("bracket {k} width {width} must be > 0")));
                }
                let next = brackets[k + 1].cutoff;
                if (bracket.cutoff + width - next).abs() > 1e-9 {
                    return Err(invalid(format!(
                        "bracket {k} ends at {} but bracket {} starts at {next}",
                        bracket.cutoff + width,
                        k + 1
                    )));
                }
            }
        }
    }
    Ok(())
}
