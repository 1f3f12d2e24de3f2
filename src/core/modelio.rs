//! Lossless binary snapshots of a model tuple `(c, A, b, x?, meta?)`.
//!
//! Every section starts with a 12-byte little-endian header
//! `(length: u32, width: u32, magic: u32 = 0xDEADBEEF)`. Vector sections have
//! width 0; the matrix section's width is its column count. Payloads are `f64`,
//! except the trailing metadata section which holds `i32`. An empty `x`
//! section stands for an absent solution: it is written when only metadata is
//! present, and a present but empty solution is refused.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use super::error::FormatError;
use super::index::PlanDims;

pub const MAGIC: u32 = 0xDEAD_BEEF;
const HEADER_BYTES: u64 = 12;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSnapshot {
    pub c: Vec<f64>,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    pub x: Option<Vec<f64>>,
    pub meta: Option<Vec<i32>>,
}

/// First difference found between two snapshots, compared bit for bit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SnapshotDiff {
    Presence {
        section: &'static str,
        left: bool,
        right: bool,
    },
    Length {
        section: &'static str,
        left: usize,
        right: usize,
    },
    Value {
        section: &'static str,
        index: usize,
        column: Option<usize>,
        left: f64,
        right: f64,
    },
}

impl fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotDiff::Presence {
                section,
                left,
                right,
            } => write!(f, "{section}: present {left} vs {right}"),
            SnapshotDiff::Length {
                section,
                left,
                right,
            } => write!(f, "{section}: length {left} vs {right}"),
            SnapshotDiff::Value {
                section,
                index,
                column: Some(col),
                left,
                right,
            } => write!(f, "{section}[{index}][{col}]: {left} vs {right}"),
            SnapshotDiff::Value {
                section,
                index,
                column: None,
                left,
                right,
            } => write!(f, "{section}[{index}]: {left} vs {right}"),
        }
    }
}

impl ModelSnapshot {
    pub fn dims(&self) -> Option<PlanDims> {
        self.meta.as_deref().and_then(PlanDims::from_meta)
    }

    pub fn columns(&self) -> usize {
        self.a.first().map_or(self.c.len(), Vec::len)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        if self.x.as_ref().is_some_and(Vec::is_empty) {
            return Err(FormatError::EmptySolution);
        }
        let width = self.columns();
        for (row, values) in self.a.iter().enumerate() {
            if values.len() != width {
                return Err(FormatError::RaggedMatrix {
                    row,
                    found: values.len(),
                    expected: width,
                });
            }
        }

        let mut out = Vec::with_capacity(self.encoded_len());
        write_header(&mut out, "c", self.c.len(), 0)?;
        write_doubles(&mut out, &self.c);
        write_header(&mut out, "A", self.a.len(), width)?;
        for row in &self.a {
            write_doubles(&mut out, row);
        }
        write_header(&mut out, "b", self.b.len(), 0)?;
        write_doubles(&mut out, &self.b);

        match (&self.x, &self.meta) {
            (Some(x), _) => {
                write_header(&mut out, "x", x.len(), 0)?;
                write_doubles(&mut out, x);
            }
            (None, Some(_)) => write_header(&mut out, "x", 0, 0)?,
            (None, None) => {}
        }
        if let Some(meta) = &self.meta {
            write_header(&mut out, "meta", meta.len(), 0)?;
            for v in meta {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Ok(out)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor { raw, pos: 0 };

        let (len, _) = cursor.header("c", false)?;
        let c = cursor.doubles("c", len)?;

        let (rows, width) = cursor.header("A", true)?;
        let mut a = Vec::with_capacity(rows.min(raw.len() / 8 + 1));
        for _ in 0..rows {
            a.push(cursor.doubles("A", width)?);
        }

        let (len, _) = cursor.header("b", false)?;
        let b = cursor.doubles("b", len)?;

        let mut x = None;
        if !cursor.at_end() {
            let (len, _) = cursor.header("x", false)?;
            let values = cursor.doubles("x", len)?;
            if !values.is_empty() {
                x = Some(values);
            }
        }

        let mut meta = None;
        if !cursor.at_end() {
            let (len, _) = cursor.header("meta", false)?;
            meta = Some(cursor.ints("meta", len)?);
        }

        if !cursor.at_end() {
            return Err(FormatError::SizeMismatch {
                expected: cursor.pos as u64,
                actual: raw.len() as u64,
            });
        }

        Ok(Self { c, a, b, x, meta })
    }

    pub fn dump(&self, path: impl AsRef<Path>) -> Result<(), FormatError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        let written = fs::metadata(path)?.len();
        if written != bytes.len() as u64 {
            return Err(FormatError::SizeMismatch {
                expected: bytes.len() as u64,
                actual: written,
            });
        }
        info!(
            path = %path.display(),
            bytes = written,
            rows = self.a.len(),
            cols = self.columns(),
            "dumped model snapshot"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let path = path.as_ref();
        let raw = fs::read(path)?;
        let snapshot = Self::from_bytes(&raw)?;
        debug!(
            path = %path.display(),
            bytes = raw.len(),
            rows = snapshot.a.len(),
            "loaded model snapshot"
        );
        Ok(snapshot)
    }

    /// Byte size implied by the section headers.
    pub fn encoded_len(&self) -> usize {
        let mut sections = 3;
        let mut payload = 8 * (self.c.len() + self.a.len() * self.columns() + self.b.len());
        if let Some(x) = &self.x {
            sections += 1;
            payload += 8 * x.len();
        }
        if let Some(meta) = &self.meta {
            if self.x.is_none() {
                sections += 1;
            }
            sections += 1;
            payload += 4 * meta.len();
        }
        sections * HEADER_BYTES as usize + payload
    }

    pub fn diff(&self, other: &Self) -> Option<SnapshotDiff> {
        diff_doubles("c", &self.c, &other.c)
            .or_else(|| {
                if self.a.len() != other.a.len() {
                    return Some(SnapshotDiff::Length {
                        section: "A",
                        left: self.a.len(),
                        right: other.a.len(),
                    });
                }
                self.a
                    .iter()
                    .zip(&other.a)
                    .enumerate()
                    .find_map(|(row, (l, r))| {
                        diff_doubles("A", l, r).map(|d| match d {
                            SnapshotDiff::Value {
                                index, left, right, ..
                            } => SnapshotDiff::Value {
                                section: "A",
                                index: row,
                                column: Some(index),
                                left,
                                right,
                            },
                            SnapshotDiff::Length { left, right, .. } => SnapshotDiff::Length {
                                section: "A row",
                                left,
                                right,
                            },
                            presence => presence,
                        })
                    })
            })
            .or_else(|| diff_doubles("b", &self.b, &other.b))
            .or_else(|| match (&self.x, &other.x) {
                (Some(l), Some(r)) => diff_doubles("x", l, r),
                (None, None) => None,
                (l, r) => Some(SnapshotDiff::Presence {
                    section: "x",
                    left: l.is_some(),
                    right: r.is_some(),
                }),
            })
            .or_else(|| match (&self.meta, &other.meta) {
                (Some(l), Some(r)) => {
                    let l: Vec<f64> = l.iter().map(|v| f64::from(*v)).collect();
                    let r: Vec<f64> = r.iter().map(|v| f64::from(*v)).collect();
                    diff_doubles("meta", &l, &r)
                }
                (None, None) => None,
                (l, r) => Some(SnapshotDiff::Presence {
                    section: "meta",
                    left: l.is_some(),
                    right: r.is_some(),
                }),
            })
    }
}

fn diff_doubles(section: &'static str, left: &[f64], right: &[f64]) -> Option<SnapshotDiff> {
    if left.len() != right.len() {
        return Some(SnapshotDiff::Length {
            section,
            left: left.len(),
            right: right.len(),
        });
    }
    left.iter()
        .zip(right)
        .position(|(l, r)| l.to_bits() != r.to_bits())
        .map(|index| SnapshotDiff::Value {
            section,
            index,
            column: None,
            left: left[index],
            right: right[index],
        })
}

fn write_header(
    out: &mut Vec<u8>,
    section: &'static str,
    len: usize,
    width: usize,
) -> Result<(), FormatError> {
    let encode = |n: usize| u32::try_from(n).map_err(|_| FormatError::TooLarge { section, len: n });
    out.extend_from_slice(&encode(len)?.to_le_bytes());
    out.extend_from_slice(&encode(width)?.to_le_bytes());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    Ok(())
}

fn write_doubles(out: &mut Vec<u8>, values: &[f64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.raw.len()
    }

    fn take(&mut self, section: &'static str, n: usize) -> Result<&[u8], FormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.raw.len())
            .ok_or(FormatError::Truncated { section })?;
        let bytes = &self.raw[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self, section: &'static str) -> Result<u32, FormatError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(section, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a section header, returning `(length, width)`.
    fn header(&mut self, section: &'static str, matrix: bool) -> Result<(usize, usize), FormatError> {
        let len = self.u32(section)?;
        let width = self.u32(section)?;
        let magic = self.u32(section)?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic {
                section,
                found: magic,
            });
        }
        let bad_width = if matrix {
            width == 0 && len > 0
        } else {
            width != 0
        };
        if bad_width {
            return Err(FormatError::UnexpectedWidth { section, width });
        }
        Ok((len as usize, width as usize))
    }

    fn payload(&mut self, section: &'static str, count: usize, size: usize) -> Result<&[u8], FormatError> {
        let bytes = count
            .checked_mul(size)
            .ok_or(FormatError::Truncated { section })?;
        let remaining = (self.raw.len() - self.pos.min(self.raw.len())) as u64;
        if bytes as u64 > remaining {
            return Err(FormatError::SizeMismatch {
                expected: (self.pos as u64).saturating_add(bytes as u64),
                actual: self.raw.len() as u64,
            });
        }
        self.take(section, bytes)
    }

    fn doubles(&mut self, section: &'static str, count: usize) -> Result<Vec<f64>, FormatError> {
        let bytes = self.payload(section, count, 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect())
    }

    fn ints(&mut self, section: &'static str, count: usize) -> Result<Vec<i32>, FormatError> {
        let bytes = self.payload(section, count, 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(chunk);
                i32::from_le_bytes(buf)
            })
            .collect())
    }
}
