//! Calendar features derived from `TransactionStartTime`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::record::TransactionRecord;

pub const TIME_FEATURE_COLUMNS: [&str; 4] = [
    "TransactionHour",
    "TransactionDay",
    "TransactionMonth",
    "TransactionYear",
];

const MAX_REPORTED_MALFORMED: usize = 64;

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// What to do with a row whose timestamp does not parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampPolicy {
    Strict,
    #[default]
    NullAndReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFeatures {
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: i32,
}

impl TimeFeatures {
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            hour: dt.hour(),
            day: dt.day(),
            month: dt.month(),
            year: dt.year(),
        }
    }
}

/// A transaction with its parsed timestamp and calendar sub-fields. The
/// derived fields are `None` when the timestamp was malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedTransaction {
    pub record: TransactionRecord,
    pub started_at: Option<NaiveDateTime>,
    pub time: Option<TimeFeatures>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedTimestamp {
    pub row: usize,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFeatureReport {
    pub rows: u64,
    pub malformed_rows: u64,
    pub malformed: Vec<MalformedTimestamp>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeFeatureError {
    #[error("malformed timestamp at row {row}: '{value}'")]
    MalformedTimestamp { row: usize, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeFeatureExtractor {
    policy: TimestampPolicy,
}

impl TimeFeatureExtractor {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    pub fn transform(
        &self,
        batch: &[TransactionRecord],
    ) -> Result<(Vec<TimedTransaction>, TimeFeatureReport), TimeFeatureError> {
        let mut report = TimeFeatureReport {
            rows: batch.len() as u64,
            ..TimeFeatureReport::default()
        };
        let mut out = Vec::with_capacity(batch.len());

        for (row, record) in batch.iter().enumerate() {
            let started_at = parse_timestamp(&record.transaction_start_time);
            if started_at.is_none() {
                self.handle_malformed(row, &record.transaction_start_time, &mut report)?;
            }
            out.push(TimedTransaction {
                record: record.clone(),
                time: started_at.as_ref().map(TimeFeatures::from_datetime),
                started_at,
            });
        }

        if report.malformed_rows > 0 {
            info!(
                component = "time_features",
                event = "time_features.transform.finish",
                rows = report.rows,
                malformed_rows = report.malformed_rows
            );
        }

        Ok((out, report))
    }

    fn handle_malformed(
        &self,
        row: usize,
        raw: &str,
        report: &mut TimeFeatureReport,
    ) -> Result<(), TimeFeatureError> {
        match self.policy {
            TimestampPolicy::Strict => Err(TimeFeatureError::MalformedTimestamp {
                row,
                value: raw.to_string(),
            }),
            TimestampPolicy::NullAndReport => {
                warn!(
                    component = "time_features",
                    event = "time_features.malformed_timestamp",
                    row,
                    value = raw
                );
                report.malformed_rows = report.malformed_rows.saturating_add(1);
                if report.malformed.len() < MAX_REPORTED_MALFORMED {
                    report.malformed.push(MalformedTimestamp {
                        row,
                        value: raw.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Parses a transaction timestamp. Offset-bearing inputs keep their stated
/// wall-clock time; naive inputs are taken as written.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.naive_local());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}
