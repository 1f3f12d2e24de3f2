//! Flat layout of every decision variable in the linear program.
//!
//! Blocks are packed back to back in a fixed order:
//!
//! ```text
//! x[year, bracket]    years * tax_brackets
//! y[year, cgbracket]  years * cg_brackets      (absent without an aftertax account)
//! w[year, account]    years * accounts
//! b[year, account]    (years + 1) * accounts   (extra year holds end-of-plan balances)
//! s[year]             years
//! D[year, account]    years * accounts         (absent without an aftertax account)
//! ```
//!
//! Every coefficient the model builder emits goes through these offsets, so a
//! drift here silently corrupts every constraint row. [`VariableIndex::verify_sequence`]
//! walks the blocks in order and reports any offset that does not match.

use serde::{Deserialize, Serialize};

use super::error::{FormatError, IndexDomainError};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct AccountTypeCounts {
    pub tdra: usize,
    pub roth: usize,
    pub aftertax: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDims {
    pub years: usize,
    pub tax_brackets: usize,
    pub cg_brackets: usize,
    pub accounts: usize,
    pub account_types: AccountTypeCounts,
}

impl PlanDims {
    /// Integer metadata vector stored alongside a dumped model.
    pub fn to_meta(&self) -> Result<Vec<i32>, FormatError> {
        [
            self.years,
            self.tax_brackets,
            self.cg_brackets,
            self.accounts,
            self.account_types.tdra,
            self.account_types.roth,
            self.account_types.aftertax,
        ]
        .iter()
        .map(|&v| {
            i32::try_from(v).map_err(|_| FormatError::TooLarge {
                section: "meta",
                len: v,
            })
        })
        .collect()
    }

    pub fn from_meta(meta: &[i32]) -> Option<Self> {
        let [years, tax, cg, accounts, tdra, roth, aftertax] = meta else {
            return None;
        };
        let count = |v: i32| usize::try_from(v).ok();
        Some(Self {
            years: count(*years)?,
            tax_brackets: count(*tax)?,
            cg_brackets: count(*cg)?,
            accounts: count(*accounts)?,
            account_types: AccountTypeCounts {
                tdra: count(*tdra)?,
                roth: count(*roth)?,
                aftertax: count(*aftertax)?,
            },
        })
    }
}

/// One offset that disagreed with its position in the canonical walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMismatch {
    pub block: char,
    pub year: usize,
    pub sub: usize,
    pub expected: usize,
    pub found: Result<usize, IndexDomainError>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VariableIndex {
    dims: PlanDims,
    y_start: usize,
    w_start: usize,
    b_start: usize,
    s_start: usize,
    d_start: usize,
    total: usize,
}

impl VariableIndex {
    pub fn new(dims: PlanDims) -> Self {
        let years = dims.years;
        let accounts = dims.accounts;
        let has_deposits = dims.account_types.aftertax > 0;

        let x_count = years * dims.tax_brackets;
        let y_count = if has_deposits {
            years * dims.cg_brackets
        } else {
            0
        };
        let w_count = years * accounts;
        let b_count = (years + 1) * accounts;
        let s_count = years;
        let d_count = if has_deposits { years * accounts } else { 0 };

        let y_start = x_count;
        let w_start = y_start + y_count;
        let b_start = w_start + w_count;
        let s_start = b_start + b_count;
        let d_start = s_start + s_count;

        Self {
            dims,
            y_start,
            w_start,
            b_start,
            s_start,
            d_start,
            total: d_start + d_count,
        }
    }

    pub fn dims(&self) -> PlanDims {
        self.dims
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn years(&self) -> usize {
        self.dims.years
    }

    pub fn accounts(&self) -> usize {
        self.dims.accounts
    }

    pub fn tax_brackets(&self) -> usize {
        self.dims.tax_brackets
    }

    pub fn cg_brackets(&self) -> usize {
        self.dims.cg_brackets
    }

    /// `y` and `D` exist only when the plan holds an aftertax account.
    pub fn has_deposits(&self) -> bool {
        self.dims.account_types.aftertax > 0
    }

    fn check(
        block: char,
        year: usize,
        years: usize,
        sub: usize,
        count: usize,
    ) -> Result<(), IndexDomainError> {
        if year >= years {
            return Err(IndexDomainError::YearOutOfRange { block, year, years });
        }
        if sub >= count {
            return Err(IndexDomainError::SubOutOfRange { block, sub, count });
        }
        Ok(())
    }

    pub fn try_x(&self, year: usize, k: usize) -> Result<usize, IndexDomainError> {
        Self::check('x', year, self.dims.years, k, self.dims.tax_brackets)?;
        Ok(year * self.dims.tax_brackets + k)
    }

    pub fn try_y(&self, year: usize, l: usize) -> Result<usize, IndexDomainError> {
        if !self.has_deposits() {
            return Err(IndexDomainError::BlockAbsent('y'));
        }
        Self::check('y', year, self.dims.years, l, self.dims.cg_brackets)?;
        Ok(self.y_start + year * self.dims.cg_brackets + l)
    }

    pub fn try_w(&self, year: usize, j: usize) -> Result<usize, IndexDomainError> {
        Self::check('w', year, self.dims.years, j, self.dims.accounts)?;
        Ok(self.w_start + year * self.dims.accounts + j)
    }

    pub fn try_b(&self, year: usize, j: usize) -> Result<usize, IndexDomainError> {
        Self::check('b', year, self.dims.years + 1, j, self.dims.accounts)?;
        Ok(self.b_start + year * self.dims.accounts + j)
    }

    pub fn try_s(&self, year: usize) -> Result<usize, IndexDomainError> {
        Self::check('s', year, self.dims.years, 0, 1)?;
        Ok(self.s_start + year)
    }

    pub fn try_d(&self, year: usize, j: usize) -> Result<usize, IndexDomainError> {
        if !self.has_deposits() {
            return Err(IndexDomainError::BlockAbsent('D'));
        }
        Self::check('D', year, self.dims.years, j, self.dims.accounts)?;
        Ok(self.d_start + year * self.dims.accounts + j)
    }

    // The infallible accessors are for code that derived its loop bounds from
    // this index; a failure there is a programming error, not bad input.

    pub fn x(&self, year: usize, k: usize) -> usize {
        contract(self.try_x(year, k))
    }

    pub fn y(&self, year: usize, l: usize) -> usize {
        contract(self.try_y(year, l))
    }

    pub fn w(&self, year: usize, j: usize) -> usize {
        contract(self.try_w(year, j))
    }

    pub fn b(&self, year: usize, j: usize) -> usize {
        contract(self.try_b(year, j))
    }

    pub fn s(&self, year: usize) -> usize {
        contract(self.try_s(year))
    }

    pub fn d(&self, year: usize, j: usize) -> usize {
        contract(self.try_d(year, j))
    }

    /// Walks all blocks in canonical order and reports every offset that is not
    /// the next integer. An empty result means the layout is a gap-free bijection
    /// onto `0..total_size()`.
    pub fn verify_sequence(&self) -> Vec<IndexMismatch> {
        let mut mismatches = Vec::new();
        let mut counter = 0usize;
        let mut visit =
            |block: char, year: usize, sub: usize, found: Result<usize, IndexDomainError>| {
                if found.as_ref() != Ok(&counter) {
                    mismatches.push(IndexMismatch {
                        block,
                        year,
                        sub,
                        expected: counter,
                        found,
                    });
                }
                counter += 1;
            };

        let years = self.dims.years;
        let accounts = self.dims.accounts;
        for year in 0..years {
            for k in 0..self.dims.tax_brackets {
                visit('x', year, k, self.try_x(year, k));
            }
        }
        if self.has_deposits() {
            for year in 0..years {
                for l in 0..self.dims.cg_brackets {
                    visit('y', year, l, self.try_y(year, l));
                }
            }
        }
        for year in 0..years {
            for j in 0..accounts {
                visit('w', year, j, self.try_w(year, j));
            }
        }
        for year in 0..=years {
            for j in 0..accounts {
                visit('b', year, j, self.try_b(year, j));
            }
        }
        for year in 0..years {
            visit('s', year, 0, self.try_s(year));
        }
        if self.has_deposits() {
            for year in 0..years {
                for j in 0..accounts {
                    visit('D', year, j, self.try_d(year, j));
                }
            }
        }

        if counter != self.total {
            mismatches.push(IndexMismatch {
                block: '#',
                year: 0,
                sub: 0,
                expected: self.total,
                found: Ok(counter),
            });
        }
        mismatches
    }
}

fn contract(offset: Result<usize, IndexDomainError>) -> usize {
    match offset {
        Ok(offset) => offset,
        Err(err) => panic!("variable index contract violated: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn dims(years: usize, accounts: usize, aftertax: usize) -> PlanDims {
        PlanDims {
            years,
            tax_brackets: 7,
            cg_brackets: 3,
            accounts,
            account_types: AccountTypeCounts {
                tdra: accounts - aftertax,
                roth: 0,
                aftertax,
            },
        }
    }

    #[test]
    fn layout_with_aftertax_counts_all_six_blocks() {
        let index = VariableIndex::new(dims(10, 3, 1));
        // x + y + w + b + s + D
        assert_eq!(index.total_size(), 70 + 30 + 30 + 33 + 10 + 30);
        assert!(index.verify_sequence().is_empty());
        assert_eq!(index.x(0, 0), 0);
        assert_eq!(index.y(0, 0), 70);
        assert_eq!(index.w(0, 0), 100);
        assert_eq!(index.b(10, 2), 130 + 32);
        assert_eq!(index.s(9), 172);
        assert_eq!(index.d(9, 2), index.total_size() - 1);
    }

    #[test]
    fn layout_without_aftertax_omits_y_and_d() {
        let index = VariableIndex::new(dims(10, 2, 0));
        assert_eq!(index.total_size(), 70 + 20 + 22 + 10);
        assert!(index.verify_sequence().is_empty());
        assert_eq!(index.try_y(0, 0), Err(IndexDomainError::BlockAbsent('y')));
        assert_eq!(index.try_d(0, 0), Err(IndexDomainError::BlockAbsent('D')));
        assert_eq!(index.s(9), index.total_size() - 1);
    }

    #[test]
    #[should_panic(expected = "variable index contract violated")]
    fn y_panics_without_aftertax() {
        let index = VariableIndex::new(dims(3, 1, 0));
        let _ = index.y(0, 0);
    }

    #[test]
    #[should_panic(expected = "variable index contract violated")]
    fn d_panics_without_aftertax() {
        let index = VariableIndex::new(dims(3, 1, 0));
        let _ = index.d(1, 0);
    }

    #[test]
    fn offsets_are_range_checked() {
        let index = VariableIndex::new(dims(4, 2, 1));
        assert_eq!(
            index.try_x(4, 0),
            Err(IndexDomainError::YearOutOfRange {
                block: 'x',
                year: 4,
                years: 4
            })
        );
        assert_eq!(
            index.try_x(0, 7),
            Err(IndexDomainError::SubOutOfRange {
                block: 'x',
                sub: 7,
                count: 7
            })
        );
        assert!(index.try_b(4, 1).is_ok());
        assert!(index.try_b(5, 0).is_err());
        assert!(index.try_w(0, 2).is_err());
        assert!(index.try_s(4).is_err());
        assert!(index.try_y(0, 3).is_err());
    }

    #[test]
    fn meta_round_trips_dims() {
        let d = dims(12, 4, 1);
        assert_eq!(PlanDims::from_meta(&d.to_meta().expect("fits i32")), Some(d));
        assert_eq!(PlanDims::from_meta(&[1, 2, 3]), None);
        assert_eq!(PlanDims::from_meta(&[1, 2, 3, 4, 5, 6, -1]), None);
    }

    #[test]
    fn oversized_dims_do_not_wrap_into_meta() {
        let mut d = dims(3, 1, 1);
        d.years = i32::MAX as usize + 1;
        assert!(matches!(
            d.to_meta(),
            Err(FormatError::TooLarge { section: "meta", len }) if len == i32::MAX as usize + 1
        ));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_blocks_form_gap_free_bijection(
            years in 1usize..40,
            tax_brackets in 1usize..9,
            cg_brackets in 1usize..5,
            tdra in 0usize..3,
            roth in 0usize..3,
            aftertax in 0usize..2,
        ) {
            let accounts = tdra + roth + aftertax;
            let dims = PlanDims {
                years,
                tax_brackets,
                cg_brackets,
                accounts,
                account_types: AccountTypeCounts { tdra, roth, aftertax },
            };
            let index = VariableIndex::new(dims);
            prop_assert!(index.verify_sequence().is_empty());

            let mut seen = vec![false; index.total_size()];
            let mut mark = |offset: usize| {
                prop_assert!(!seen[offset], "offset {} visited twice", offset);
                seen[offset] = true;
                Ok(())
            };
            for year in 0..years {
                for k in 0..tax_brackets {
                    mark(index.x(year, k))?;
                }
                for j in 0..accounts {
                    mark(index.w(year, j))?;
                }
                mark(index.s(year))?;
                if aftertax > 0 {
                    for l in 0..cg_brackets {
                        mark(index.y(year, l))?;
                    }
                    for j in 0..accounts {
                        mark(index.d(year, j))?;
                    }
                }
            }
            for year in 0..=years {
                for j in 0..accounts {
                    mark(index.b(year, j))?;
                }
            }
            prop_assert!(seen.iter().all(|v| *v));

            let expected = years * tax_brackets
                + years * accounts
                + (years + 1) * accounts
                + years
                + if aftertax > 0 { years * cg_brackets + years * accounts } else { 0 };
            prop_assert_eq!(index.total_size(), expected);
        }
    }
}
