//! Dataset identifier grammar
//!
//! DATASUS publishes one file per unit of work and the file name is the unit's
//! identity. Two naming families are supported:
//!
//! - **MonthlyRecords**: `PA<UF><YY><MM>`, e.g. `PAMS2501` (outpatient
//!   production for Mato Grosso do Sul, January 2025)
//! - **YearlyPopulation**: `POPSBR<YY>`, e.g. `POPSBR25`
//!
//! [`DatasetIdentifier`] is the parsed, immutable form. Advancing through a
//! series goes through [`DatasetIdentifier::next`] (or [`Family::step`] on a
//! calendar cursor) and never mutates in place.

use crate::error::{EtlError, Result};
use chrono::Datelike;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static MONTHLY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PA([A-Z]{2})(\d{2})(\d{2})$").unwrap());

#[allow(clippy::unwrap_used)]
static YEARLY_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^POPSBR(\d{2})$").unwrap());

/// The archive has no monthly records before 2008.
pub const FIRST_MONTHLY_YEAR2: u8 = 8;

/// Naming family of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// `PA<UF><YY><MM>` monthly outpatient production files
    MonthlyRecords,
    /// `POPSBR<YY>` yearly population estimates
    YearlyPopulation,
}

impl Family {
    /// Fixed leading code of every identifier in the family
    pub fn code(self) -> &'static str {
        match self {
            Family::MonthlyRecords => "PA",
            Family::YearlyPopulation => "POPSBR",
        }
    }

    /// Extension of the file published on the FTP archive
    pub fn archive_extension(self) -> &'static str {
        match self {
            Family::MonthlyRecords => "dbc",
            Family::YearlyPopulation => "zip",
        }
    }

    /// Advance a calendar cursor by one unit of this family's granularity.
    ///
    /// Monthly families move one month; yearly families jump to January of
    /// the following year.
    pub fn step(self, at: YearMonth) -> YearMonth {
        match self {
            Family::MonthlyRecords if at.month < 12 => YearMonth {
                year: at.year,
                month: at.month + 1,
            },
            _ => YearMonth {
                year: at.year + 1,
                month: 1,
            },
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::MonthlyRecords => write!(f, "monthly-records"),
            Family::YearlyPopulation => write!(f, "yearly-population"),
        }
    }
}

/// Immutable identifier of one dataset unit
///
/// Field order matters: the derived ordering is family, then year, then
/// month, then region. Serialized as its text form, e.g. `"PAMS2501"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DatasetIdentifier {
    family: Family,
    year2: u8,
    month: Option<u8>,
    region: Option<String>,
}

impl DatasetIdentifier {
    /// Build a MonthlyRecords identifier, applying the family's range checks
    pub fn monthly(region: &str, year2: u8, month: u8) -> Result<Self> {
        let text = format!("PA{}{:02}{:02}", region, year2, month);

        if region.len() != 2 || !region.bytes().all(|b| b.is_ascii_uppercase()) || year2 > 99 {
            return Err(EtlError::invalid_identifier(
                text,
                "Invalid file. Use format PAUFYYMM (e.g. PAMS2501)",
            ));
        }
        if year2 < FIRST_MONTHLY_YEAR2 {
            return Err(EtlError::invalid_identifier(
                text,
                "Data before 2008 is not available for download.",
            ));
        }
        if !(1..=12).contains(&month) {
            return Err(EtlError::invalid_identifier(
                text,
                "Invalid month in PAUFYYMM. Month should be between 01 and 12.",
            ));
        }

        Ok(Self {
            family: Family::MonthlyRecords,
            year2,
            month: Some(month),
            region: Some(region.to_string()),
        })
    }

    /// Build a YearlyPopulation identifier
    pub fn yearly(year2: u8) -> Result<Self> {
        if year2 > 99 {
            return Err(EtlError::invalid_identifier(
                format!("POPSBR{}", year2),
                "Invalid file. Use format POPSBRYY (e.g. POPSBR25)",
            ));
        }

        Ok(Self {
            family: Family::YearlyPopulation,
            year2,
            month: None,
            region: None,
        })
    }

    /// Parse the canonical text form
    pub fn parse(text: &str) -> Result<Self> {
        if text.starts_with("POPSBR") {
            let caps = YEARLY_PATTERN.captures(text).ok_or_else(|| {
                EtlError::invalid_identifier(text, "Invalid file. Use format POPSBRYY (e.g. POPSBR25)")
            })?;
            return Self::yearly(two_digits(&caps[1]));
        }

        if text.starts_with("PA") {
            let caps = MONTHLY_PATTERN.captures(text).ok_or_else(|| {
                EtlError::invalid_identifier(text, "Invalid file. Use format PAUFYYMM (e.g. PAMS2501)")
            })?;
            return Self::monthly(&caps[1], two_digits(&caps[2]), two_digits(&caps[3]));
        }

        Err(EtlError::invalid_identifier(
            text,
            "Invalid pattern. Use PAUFYYMM or POPSBRYY format.",
        ))
    }

    /// The identifier that follows this one in its family's series.
    ///
    /// Years wrap modulo 100; a monthly identifier that wraps past `99` lands
    /// before the archive start and will not parse back.
    pub fn next(&self) -> Self {
        match self.family {
            Family::MonthlyRecords => {
                let month = self.month.unwrap_or(1);
                let (year2, month) = if month >= 12 {
                    ((self.year2 + 1) % 100, 1)
                } else {
                    (self.year2, month + 1)
                };
                Self {
                    year2,
                    month: Some(month),
                    ..self.clone()
                }
            }
            Family::YearlyPopulation => Self {
                year2: (self.year2 + 1) % 100,
                ..self.clone()
            },
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Region (UF) code, only populated for MonthlyRecords
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn year2(&self) -> u8 {
        self.year2
    }

    /// Month, only populated for MonthlyRecords
    pub fn month(&self) -> Option<u8> {
        self.month
    }

    /// Name of the file on the remote archive, e.g. `PAMS2501.dbc`
    pub fn archive_filename(&self) -> String {
        format!("{}.{}", self, self.family.archive_extension())
    }

    /// Name of a derived file with the given extension, e.g. `PAMS2501.dbf`
    pub fn filename_with(&self, extension: &str) -> String {
        format!("{}.{}", self, extension)
    }
}

fn two_digits(digits: &str) -> u8 {
    // The regex guarantees exactly two ASCII digits
    digits.bytes().fold(0, |acc, b| acc * 10 + (b - b'0'))
}

impl fmt::Display for DatasetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::MonthlyRecords => write!(
                f,
                "PA{}{:02}{:02}",
                self.region.as_deref().unwrap_or_default(),
                self.year2,
                self.month.unwrap_or_default()
            ),
            Family::YearlyPopulation => write!(f, "POPSBR{:02}", self.year2),
        }
    }
}

impl FromStr for DatasetIdentifier {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DatasetIdentifier {
    type Error = EtlError;

    fn try_from(text: String) -> Result<Self> {
        Self::parse(&text)
    }
}

impl From<DatasetIdentifier> for String {
    fn from(identifier: DatasetIdentifier) -> Self {
        identifier.to_string()
    }
}

/// A calendar month, written `YYYYMM` on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    year: u16,
    month: u8,
}

impl YearMonth {
    pub fn new(year: u16, month: u8) -> Result<Self> {
        if !(1..=12).contains(&month) || year > 9999 {
            return Err(EtlError::invalid_identifier(
                format!("{:04}{:02}", year, month),
                "Invalid date. Use format YYYYMM (e.g. 200801)",
            ));
        }
        Ok(Self { year, month })
    }

    /// The current local month
    pub fn current() -> Self {
        let today = chrono::Local::now().date_naive();
        Self {
            year: today.year().clamp(0, 9999) as u16,
            month: today.month() as u8,
        }
    }

    pub fn year(self) -> u16 {
        self.year
    }

    pub fn month(self) -> u8 {
        self.month
    }

    pub fn year2(self) -> u8 {
        (self.year % 100) as u8
    }
}

impl FromStr for YearMonth {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EtlError::invalid_identifier(
                s,
                "Invalid date. Use format YYYYMM (e.g. 200801)",
            ));
        }
        let year = s[..4].parse::<u16>().map_err(|e| EtlError::invalid_identifier(s, e.to_string()))?;
        let month = s[4..].parse::<u8>().map_err(|e| EtlError::invalid_identifier(s, e.to_string()))?;
        Self::new(year, month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

/// Family-specific identifier template used by period runs
///
/// Written `PA<UF>` (e.g. `PAMS`) or `POPSBR` on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierTemplate {
    Monthly { region: String },
    Yearly,
}

impl IdentifierTemplate {
    pub fn family(&self) -> Family {
        match self {
            IdentifierTemplate::Monthly { .. } => Family::MonthlyRecords,
            IdentifierTemplate::Yearly => Family::YearlyPopulation,
        }
    }

    /// Concrete identifier for the given calendar month
    pub fn at(&self, when: YearMonth) -> Result<DatasetIdentifier> {
        match self {
            // Two-digit years alias across centuries; reject 19xx up front
            IdentifierTemplate::Monthly { region } if when.year() < 2000 + FIRST_MONTHLY_YEAR2 as u16 => {
                Err(EtlError::invalid_identifier(
                    format!("PA{}{:02}{:02}", region, when.year2(), when.month()),
                    "Data before 2008 is not available for download.",
                ))
            }
            IdentifierTemplate::Monthly { region } => {
                DatasetIdentifier::monthly(region, when.year2(), when.month())
            }
            IdentifierTemplate::Yearly => DatasetIdentifier::yearly(when.year2()),
        }
    }
}

impl FromStr for IdentifierTemplate {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "POPSBR" {
            return Ok(IdentifierTemplate::Yearly);
        }
        match s.strip_prefix("PA") {
            Some(region) if region.len() == 2 && region.bytes().all(|b| b.is_ascii_uppercase()) => {
                Ok(IdentifierTemplate::Monthly {
                    region: region.to_string(),
                })
            }
            _ => Err(EtlError::invalid_identifier(
                s,
                "Invalid prefix. Use PAUF or POPSBR.",
            )),
        }
    }
}

impl fmt::Display for IdentifierTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierTemplate::Monthly { region } => write!(f, "PA{}", region),
            IdentifierTemplate::Yearly => write!(f, "POPSBR"),
        }
    }
}
