//! Core domain model for operationally-available capacity records.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "oacap-core";

/// Date format the capacity endpoint expects in its `gasDay` parameter.
pub const URL_DATE_FORMAT: &str = "%m/%d/%Y";
pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GasDayError {
    #[error("unrecognized gas day {0:?} (expected MM/DD/YYYY or YYYY-MM-DD)")]
    Unrecognized(String),
}

/// Operational day identifier published by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GasDay(NaiveDate);

impl GasDay {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `MM/DD/YYYY`, as sent in the request query.
    pub fn url_format(&self) -> String {
        self.0.format(URL_DATE_FORMAT).to_string()
    }

    pub fn iso(&self) -> String {
        self.0.format(ISO_DATE_FORMAT).to_string()
    }
}

impl From<NaiveDate> for GasDay {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl FromStr for GasDay {
    type Err = GasDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        NaiveDate::parse_from_str(trimmed, URL_DATE_FORMAT)
            .or_else(|_| NaiveDate::parse_from_str(trimmed, ISO_DATE_FORMAT))
            .map(Self)
            .map_err(|_| GasDayError::Unrecognized(s.to_string()))
    }
}

impl fmt::Display for GasDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.iso())
    }
}

/// The `(loc, gas_day, cycle)` triple identifying one logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub loc: String,
    pub gas_day: GasDay,
    pub cycle: u8,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.loc, self.gas_day, self.cycle)
    }
}

/// Parsed row handed from the parser to the sync pipeline, before the gas day
/// and cycle it was fetched for are known to it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordDraft {
    pub loc: String,
    pub loc_zone: Option<String>,
    pub loc_name: Option<String>,
    pub loc_purpose: Option<String>,
    pub measure_basis: Option<String>,
    pub oper_capacity: Option<Decimal>,
    pub design_capacity: Option<Decimal>,
    pub scheduled_qty: Option<Decimal>,
    pub operationally_available: Option<Decimal>,
    pub total_scheduled: Option<Decimal>,
}

impl RecordDraft {
    pub fn stamp(self, gas_day: GasDay, cycle: u8) -> Record {
        Record {
            loc: self.loc,
            loc_zone: self.loc_zone,
            loc_name: self.loc_name,
            loc_purpose: self.loc_purpose,
            measure_basis: self.measure_basis,
            oper_capacity: self.oper_capacity,
            design_capacity: self.design_capacity,
            scheduled_qty: self.scheduled_qty,
            operationally_available: self.operationally_available,
            total_scheduled: self.total_scheduled,
            gas_day,
            cycle,
        }
    }
}

/// Canonical persisted unit. Always carries a complete natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub loc: String,
    pub loc_zone: Option<String>,
    pub loc_name: Option<String>,
    pub loc_purpose: Option<String>,
    pub measure_basis: Option<String>,
    pub oper_capacity: Option<Decimal>,
    pub design_capacity: Option<Decimal>,
    pub scheduled_qty: Option<Decimal>,
    pub operationally_available: Option<Decimal>,
    pub total_scheduled: Option<Decimal>,
    pub gas_day: GasDay,
    pub cycle: u8,
}

impl Record {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            loc: self.loc.clone(),
            gas_day: self.gas_day,
            cycle: self.cycle,
        }
    }
}
