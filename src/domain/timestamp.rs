use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Naive formats tried in order after RFC 3339
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// A feed timestamp that may or may not be in a recognizable format.
/// Naive values are read as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    Structured(DateTime<Utc>),
    Raw(String),
}

impl Timestamp {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Timestamp::Structured(dt.with_timezone(&Utc));
        }
        for fmt in DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
                return Timestamp::Structured(naive.and_utc());
            }
        }
        for fmt in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Timestamp::Structured(naive.and_utc());
                }
            }
        }

        Timestamp::Raw(trimmed.to_string())
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Structured(dt) => Some(*dt),
            Timestamp::Raw(_) => None,
        }
    }
}
