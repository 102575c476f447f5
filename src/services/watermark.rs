//! Per-type watermarks: the latest sample timestamp known to be fully ingested.
//!
//! `Checkpoint` keeps one row per type in `sync_checkpoint`. `Derived` reads
//! `MAX(timestamp)` over stored samples whose label the catalog maps to the
//! type; `LabelPattern` does the same with `LIKE` patterns on the label and
//! needs no catalog. Neither derived form has anything to write.

use crate::config::{LabelPatterns, WatermarkSource};
use crate::db::models::Checkpoint;
use crate::models::api::MeasurementType;
use crate::schema;
use crate::utils::{format_canonical, parse_zoned};
use chrono::{DateTime, FixedOffset, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::{debug, warn};

pub fn last_timestamp(
    conn: &mut SqliteConnection,
    source: &WatermarkSource,
    kind: MeasurementType,
) -> Result<Option<DateTime<FixedOffset>>, String> {
    let raw = match source {
        WatermarkSource::Checkpoint => read_checkpoint(conn, kind)?,
        WatermarkSource::Derived => derive_from_samples(conn, kind)?,
        WatermarkSource::LabelPattern(patterns) => derive_from_patterns(conn, patterns, kind)?,
    };
    Ok(raw.and_then(|s| {
        let parsed = parse_zoned(&s);
        if parsed.is_none() {
            warn!("Watermark: ignoring unparsable stored value '{}' for {}", s, kind);
        }
        parsed
    }))
}

/// Record `ts` as the watermark for `kind`; never moves an existing value backwards.
///
/// Returns whether the stored value changed.
pub fn set_last_timestamp(
    conn: &mut SqliteConnection,
    source: &WatermarkSource,
    kind: MeasurementType,
    ts: DateTime<FixedOffset>,
    offset: FixedOffset,
) -> Result<bool, String> {
    match source {
        WatermarkSource::Checkpoint => write_checkpoint(conn, kind, ts, offset),
        WatermarkSource::Derived | WatermarkSource::LabelPattern(_) => Ok(false),
    }
}

fn read_checkpoint(conn: &mut SqliteConnection, kind: MeasurementType) -> Result<Option<String>, String> {
    use schema::sync_checkpoint::dsl as C;

    C::sync_checkpoint
        .filter(C::source.eq(kind.checkpoint_key()))
        .select(C::last_ts)
        .first::<String>(conn)
        .optional()
        .map_err(|e| format!("read checkpoint for {} failed: {}", kind, e))
}

fn write_checkpoint(
    conn: &mut SqliteConnection,
    kind: MeasurementType,
    ts: DateTime<FixedOffset>,
    offset: FixedOffset,
) -> Result<bool, String> {
    use schema::sync_checkpoint::dsl as C;

    conn.transaction::<bool, diesel::result::Error, _>(|conn| {
        let current: Option<String> = C::sync_checkpoint
            .filter(C::source.eq(kind.checkpoint_key()))
            .select(C::last_ts)
            .first(conn)
            .optional()?;
        if let Some(existing) = current.as_deref().and_then(parse_zoned)
            && existing >= ts
        {
            debug!("Watermark: {} stays at {} (offered {})", kind, existing, ts);
            return Ok(false);
        }

        let row = Checkpoint {
            source: kind.checkpoint_key(),
            last_ts: format_canonical(ts, offset),
            updated_at: Utc::now().to_rfc3339(),
        };
        diesel::insert_into(C::sync_checkpoint)
            .values(&row)
            .on_conflict(C::source)
            .do_update()
            .set((C::last_ts.eq(&row.last_ts), C::updated_at.eq(&row.updated_at)))
            .execute(conn)?;
        Ok(true)
    })
    .map_err(|e| format!("write checkpoint for {} failed: {}", kind, e))
}

fn derive_from_samples(conn: &mut SqliteConnection, kind: MeasurementType) -> Result<Option<String>, String> {
    use schema::label_catalog::dsl as L;
    use schema::raw_state::dsl as R;

    let catalog: Vec<(String, Option<String>)> = L::label_catalog
        .select((L::measurement_label, L::measurement_type))
        .load(conn)
        .map_err(|e| format!("load label catalog failed: {}", e))?;
    let labels: Vec<String> = catalog
        .into_iter()
        .filter(|(_, t)| t.as_deref().is_some_and(|t| t.trim().eq_ignore_ascii_case(kind.as_str())))
        .map(|(label, _)| label)
        .collect();
    if labels.is_empty() {
        debug!("Watermark: catalog maps no labels to {}", kind);
        return Ok(None);
    }

    R::raw_state
        .filter(R::measurement_label.eq_any(&labels))
        .select(max(R::ts))
        .first::<Option<String>>(conn)
        .map_err(|e| format!("derive watermark for {} failed: {}", kind, e))
}

fn derive_from_patterns(
    conn: &mut SqliteConnection,
    patterns: &LabelPatterns,
    kind: MeasurementType,
) -> Result<Option<String>, String> {
    use schema::raw_state::dsl as R;

    let patterns = patterns.for_type(kind);
    if patterns.is_empty() {
        debug!("Watermark: no label patterns configured for {}", kind);
        return Ok(None);
    }

    let mut query = R::raw_state.select(max(R::ts)).into_boxed();
    for pattern in patterns {
        query = query.or_filter(R::measurement_label.like(pattern.clone()));
    }
    query
        .first::<Option<String>>(conn)
        .map_err(|e| format!("derive watermark for {} from label patterns failed: {}", kind, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::LabelEntry;
    use crate::db::testing::memory_conn;
    use crate::services::filter::RawSample;
    use crate::services::ingest::upsert_samples;

    fn ict() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn checkpoint_starts_empty_and_only_moves_forward() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        assert_eq!(last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind).unwrap(), None);

        let t1 = at("2025-06-01T12:00:00+07:00");
        assert!(set_last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind, t1, ict()).unwrap());
        assert_eq!(last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind).unwrap(), Some(t1));

        let earlier = at("2025-06-01T11:00:00+07:00");
        assert!(!set_last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind, earlier, ict()).unwrap());
        assert_eq!(last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind).unwrap(), Some(t1));

        let later = at("2025-06-01T13:00:00+07:00");
        assert!(set_last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind, later, ict()).unwrap());
        assert_eq!(last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind).unwrap(), Some(later));

        // other types are untouched
        assert_eq!(
            last_timestamp(&mut conn, &WatermarkSource::Checkpoint, MeasurementType::Battery).unwrap(),
            None
        );
    }

    #[test]
    fn derived_watermark_follows_catalog_mapping() {
        use schema::label_catalog::dsl as L;

        let mut conn = memory_conn();
        let entries = vec![
            LabelEntry {
                measurement_label: "inTempMeas1".into(),
                measurement_type: Some("inTemp".into()),
                zone_name: None,
                device_friendly_name: None,
            },
            LabelEntry {
                measurement_label: "inHumidMeas1".into(),
                measurement_type: Some("inhumid".into()),
                zone_name: None,
                device_friendly_name: None,
            },
        ];
        diesel::insert_into(L::label_catalog).values(&entries).execute(&mut conn).unwrap();

        let samples = vec![
            RawSample {
                timestamp: at("2025-06-01T12:00:00+07:00"),
                measurement_label: "inTempMeas1".into(),
                value: 24.0,
            },
            RawSample {
                timestamp: at("2025-06-01T12:30:00+07:00"),
                measurement_label: "inHumidMeas1".into(),
                value: 60.0,
            },
            RawSample {
                timestamp: at("2025-06-01T13:00:00+07:00"),
                measurement_label: "unmapped".into(),
                value: 1.0,
            },
        ];
        upsert_samples(&mut conn, &samples, ict()).unwrap();

        let temp = last_timestamp(&mut conn, &WatermarkSource::Derived, MeasurementType::InTemp).unwrap();
        assert_eq!(temp, Some(at("2025-06-01T12:00:00+07:00")));
        let humid = last_timestamp(&mut conn, &WatermarkSource::Derived, MeasurementType::InHumid).unwrap();
        assert_eq!(humid, Some(at("2025-06-01T12:30:00+07:00")));
        let co2 = last_timestamp(&mut conn, &WatermarkSource::Derived, MeasurementType::InCo2).unwrap();
        assert_eq!(co2, None);

        // setting a derived watermark is a no-op
        let moved = set_last_timestamp(
            &mut conn,
            &WatermarkSource::Derived,
            MeasurementType::InTemp,
            at("2025-06-02T00:00:00+07:00"),
            ict(),
        )
        .unwrap();
        assert!(!moved);
    }

    #[test]
    fn pattern_watermark_needs_no_catalog() {
        let mut conn = memory_conn();
        let samples = vec![
            RawSample {
                timestamp: at("2025-06-01T12:00:00+07:00"),
                measurement_label: "inCO2Meas1".into(),
                value: 410.0,
            },
            RawSample {
                timestamp: at("2025-06-01T12:10:00+07:00"),
                measurement_label: "inco2meas2".into(),
                value: 420.0,
            },
            RawSample {
                timestamp: at("2025-06-01T12:20:00+07:00"),
                measurement_label: "inTempMeas1".into(),
                value: 24.0,
            },
            RawSample {
                timestamp: at("2025-06-01T12:30:00+07:00"),
                measurement_label: "pir7".into(),
                value: 1.0,
            },
        ];
        upsert_samples(&mut conn, &samples, ict()).unwrap();

        let source = WatermarkSource::LabelPattern(LabelPatterns::default());
        // LIKE is case-insensitive for ASCII in SQLite
        assert_eq!(
            last_timestamp(&mut conn, &source, MeasurementType::InCo2).unwrap(),
            Some(at("2025-06-01T12:10:00+07:00"))
        );
        assert_eq!(
            last_timestamp(&mut conn, &source, MeasurementType::InTemp).unwrap(),
            Some(at("2025-06-01T12:20:00+07:00"))
        );
        assert_eq!(last_timestamp(&mut conn, &source, MeasurementType::Motion).unwrap(), None);

        let custom = WatermarkSource::LabelPattern("motion=pir%|motion%,intemp=nothing%".parse().unwrap());
        assert_eq!(
            last_timestamp(&mut conn, &custom, MeasurementType::Motion).unwrap(),
            Some(at("2025-06-01T12:30:00+07:00"))
        );
        assert_eq!(last_timestamp(&mut conn, &custom, MeasurementType::InTemp).unwrap(), None);
        assert!(!set_last_timestamp(&mut conn, &custom, MeasurementType::Motion, at("2025-06-02T00:00:00+07:00"), ict()).unwrap());
    }
}
