//! Validation of raw range records into storable samples.
//!
//! Each record gets an explicit verdict; malformed and stale records are
//! counted and dropped, never propagated as errors.

use chrono::{DateTime, FixedOffset};
use log::debug;
use serde_json::Value;

use crate::utils::parse_zoned;

/// A validated sample, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub timestamp: DateTime<FixedOffset>,
    pub measurement_label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordVerdict {
    Keep(RawSample),
    /// At or before the watermark.
    Stale,
    Malformed(&'static str),
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub samples: Vec<RawSample>,
    pub malformed: usize,
    pub stale: usize,
    /// Kept samples later dropped by [`FilterOutcome::discard_from`].
    pub outside: usize,
}

impl FilterOutcome {
    /// Drop samples at or after `end`, returning how many went.
    ///
    /// The range endpoint should only answer inside the requested chunk;
    /// anything later belongs to a chunk that has not been fetched yet.
    pub fn discard_from(&mut self, end: DateTime<FixedOffset>) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| s.timestamp < end);
        let dropped = before - self.samples.len();
        self.outside += dropped;
        dropped
    }

    /// Latest timestamp among kept samples.
    pub fn latest(&self) -> Option<DateTime<FixedOffset>> {
        self.samples.iter().map(|s| s.timestamp).max()
    }
}

pub fn filter_records(records: &[Value], watermark: Option<DateTime<FixedOffset>>) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for record in records {
        match judge_record(record, watermark) {
            RecordVerdict::Keep(sample) => outcome.samples.push(sample),
            RecordVerdict::Stale => outcome.stale += 1,
            RecordVerdict::Malformed(reason) => {
                debug!("Filter: skipping record ({}): {}", reason, record);
                outcome.malformed += 1;
            }
        }
    }
    outcome
}

pub fn judge_record(record: &Value, watermark: Option<DateTime<FixedOffset>>) -> RecordVerdict {
    let Some(fields) = record.as_object() else {
        return RecordVerdict::Malformed("record is not an object");
    };

    let Some(timestamp) = fields.get("timestamp").and_then(Value::as_str).and_then(parse_zoned) else {
        return RecordVerdict::Malformed("missing or unparsable timestamp");
    };
    let label = match fields.get("measurementLabel").and_then(Value::as_str).map(str::trim) {
        Some(l) if !l.is_empty() => l,
        _ => return RecordVerdict::Malformed("missing measurementLabel"),
    };
    let Some(value) = fields.get("state").and_then(coerce_state) else {
        return RecordVerdict::Malformed("state is not a finite number");
    };

    if watermark.is_some_and(|w| timestamp <= w) {
        return RecordVerdict::Stale;
    }

    RecordVerdict::Keep(RawSample {
        timestamp,
        measurement_label: label.to_string(),
        value,
    })
}

fn coerce_state(state: &Value) -> Option<f64> {
    let value = match state {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    value.is_finite().then_some(value)
}
