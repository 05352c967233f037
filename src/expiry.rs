//! Expiry date computation
//!
//! Expiry is elapsed time, not calendar arithmetic: `base + days * 86400 s` on the
//! local wall clock, truncated to a `YYYY-MM-DD` date. A leap year therefore
//! shortens the calendar span: 365 days from 2024-01-01 is 2024-12-31.
//!
//! The base is captured once per batch so every key generated in that batch
//! shares it.

use crate::error::{KeyError, KeyResult};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityBase(NaiveDateTime);

impl ValidityBase {
    /// Capture the current local wall-clock time
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    pub fn at(timestamp: NaiveDateTime) -> Self {
        Self(timestamp)
    }

    /// Midnight of `date`
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.and_time(NaiveTime::MIN))
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.0
    }

    /// `validity_days` starting at the base, on the same wall clock
    pub fn period(&self, validity_days: u32) -> KeyResult<ValidityPeriod> {
        let validity = TimeDelta::try_seconds(i64::from(validity_days) * SECONDS_PER_DAY)
            .ok_or_else(|| KeyError::validation("validity days", "period is too long"))?;
        let not_after = self
            .0
            .checked_add_signed(validity)
            .ok_or_else(|| KeyError::validation("validity days", "expiry is out of range"))?;
        Ok(ValidityPeriod {
            not_before: self.0,
            not_after,
        })
    }

    pub fn expiry_date(&self, validity_days: u32) -> KeyResult<NaiveDate> {
        Ok(self.period(validity_days)?.expiry_date())
    }
}

/// Validity window of one key; certificates and registry lines both derive from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPeriod {
    pub not_before: NaiveDateTime,
    pub not_after: NaiveDateTime,
}

impl ValidityPeriod {
    pub fn expiry_date(&self) -> NaiveDate {
        self.not_after.date()
    }
}

/// Seconds since the epoch for a local wall-clock time
///
/// A time skipped by a DST transition is read as UTC.
pub fn unix_timestamp(at: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&at)
        .earliest()
        .map(|local| local.timestamp())
        .unwrap_or_else(|| at.and_utc().timestamp())
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
}
