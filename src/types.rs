//! Core types for the page store.

use crate::error::{PageError, Result};
use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical on-disk and wire format of a page key.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Years that fit the four-digit key.
const YEAR_RANGE: std::ops::RangeInclusive<i32> = 0..=9999;

/// Default happiness for a page that has never been saved.
pub const DEFAULT_HAPPINESS: i64 = 5;

/// Lowest score a user can pick.
pub const MIN_HAPPINESS: i64 = 1;

/// Highest score a user can pick.
pub const MAX_HAPPINESS: i64 = 10;

/// Value stored when the happiness input was not a number.
pub const INVALID_HAPPINESS: i64 = 0;

/// Calendar date keying a page, always in canonical `YYYY-MM-DD` form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageDate(NaiveDate);

impl PageDate {
    /// Parse a `YYYY-MM-DD` string.
    ///
    /// Only real calendar dates in zero-padded form are accepted, so every
    /// date has exactly one key.
    pub fn parse(s: &str) -> Result<Self> {
        let date = NaiveDate::parse_from_str(s, DATE_FORMAT)
            .map_err(|_| PageError::InvalidDate(s.to_string()))?;
        if !YEAR_RANGE.contains(&date.year()) || date.format(DATE_FORMAT).to_string() != s {
            return Err(PageError::InvalidDate(s.to_string()));
        }
        Ok(PageDate(date))
    }

    /// Build from year, month, day.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .filter(|d| YEAR_RANGE.contains(&d.year()))
            .map(PageDate)
            .ok_or_else(|| PageError::InvalidDate(format!("{year:04}-{month:02}-{day:02}")))
    }

    /// Today's date in the local time zone.
    pub fn today() -> Self {
        PageDate(Local::now().date_naive())
    }

    pub fn succ(self) -> Option<Self> {
        self.0.succ_opt().map(PageDate)
    }

    pub fn pred(self) -> Option<Self> {
        self.0.pred_opt().map(PageDate)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Debug for PageDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageDate({})", self.0.format(DATE_FORMAT))
    }
}

impl fmt::Display for PageDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for PageDate {
    type Err = PageError;

    fn from_str(s: &str) -> Result<Self> {
        PageDate::parse(s)
    }
}

impl TryFrom<String> for PageDate {
    type Error = PageError;

    fn try_from(s: String) -> Result<Self> {
        PageDate::parse(&s)
    }
}

impl From<PageDate> for String {
    fn from(date: PageDate) -> Self {
        date.to_string()
    }
}

/// The journaling record for one calendar date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPage {
    /// Unique key.
    pub date: PageDate,
    pub schedule: String,
    pub todo: String,
    pub goals: String,
    pub motivation: String,
    /// 1 to 10 for a picked score, 0 when the input could not be read.
    pub happiness: i64,
    pub journal: String,
}

impl DailyPage {
    /// The page shown for a date that has never been saved.
    pub fn empty(date: PageDate) -> Self {
        Self {
            date,
            schedule: String::new(),
            todo: String::new(),
            goals: String::new(),
            motivation: String::new(),
            happiness: DEFAULT_HAPPINESS,
            journal: String::new(),
        }
    }

    /// Length of the journal entry as the character counter shows it.
    ///
    /// Counted in UTF-16 code units, so a character outside the Basic
    /// Multilingual Plane (most emoji) counts as 2.
    pub fn journal_len(&self) -> usize {
        self.journal.encode_utf16().count()
    }

    /// Check the record before it is written.
    pub fn validate(&self) -> Result<()> {
        if !(INVALID_HAPPINESS..=MAX_HAPPINESS).contains(&self.happiness) {
            return Err(PageError::Validation(format!(
                "happiness {} out of range {}..={}",
                self.happiness, INVALID_HAPPINESS, MAX_HAPPINESS
            )));
        }
        Ok(())
    }
}

/// Happiness as entered in the UI: either a slider value or raw text.
#[derive(Clone, Debug, PartialEq)]
pub enum HappinessInput {
    Score(i64),
    Text(String),
}

impl Default for HappinessInput {
    fn default() -> Self {
        HappinessInput::Score(DEFAULT_HAPPINESS)
    }
}

impl From<i64> for HappinessInput {
    fn from(score: i64) -> Self {
        HappinessInput::Score(score)
    }
}

impl HappinessInput {
    /// Lenient coercion: anything numeric is truncated and clamped to
    /// `0..=10`, anything else becomes 0.
    pub fn coerce(&self) -> i64 {
        match self {
            HappinessInput::Score(n) => (*n).clamp(INVALID_HAPPINESS, MAX_HAPPINESS),
            HappinessInput::Text(s) => match Self::parse_number(s) {
                Some(n) => (n.trunc() as i64).clamp(INVALID_HAPPINESS, MAX_HAPPINESS),
                None => INVALID_HAPPINESS,
            },
        }
    }

    /// Strict conversion: must be a whole number in `1..=10`.
    pub fn validate(&self) -> Result<i64> {
        let value = match self {
            HappinessInput::Score(n) => Some(*n),
            HappinessInput::Text(s) => Self::parse_number(s)
                .filter(|n| n.fract() == 0.0)
                .map(|n| n as i64),
        };
        match value {
            Some(n) if (MIN_HAPPINESS..=MAX_HAPPINESS).contains(&n) => Ok(n),
            _ => Err(PageError::Validation(format!(
                "happiness must be a whole number from {} to {}, got {}",
                MIN_HAPPINESS, MAX_HAPPINESS, self
            ))),
        }
    }

    fn parse_number(s: &str) -> Option<f64> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            // Blank input reads as zero.
            return Some(0.0);
        }
        trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
    }
}

impl fmt::Display for HappinessInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HappinessInput::Score(n) => write!(f, "{n}"),
            HappinessInput::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Distinct dates with a stored page.
    pub page_count: u64,
    /// Entries in the log, including overwritten ones.
    pub entry_count: u64,
    /// Entries shadowed by a later write for the same date.
    pub superseded_count: u64,
    pub log_size_bytes: u64,
}
