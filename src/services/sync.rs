//! One synchronization run: catalogs first, then each measurement type in
//! turn, chunk by chunk.
//!
//! Ordering guarantees:
//! - `now` is captured once per run; every window ends there.
//! - A chunk's rows are committed before the type's watermark is written.
//! - The watermark only advances over the contiguous run of successful
//!   chunks, so a skipped chunk is refetched by the next run.

use crate::client::{ClientError, RangeSource};
use crate::config::{Config, FailurePolicy, StaleCatalogPolicy, WatermarkSource};
use crate::models::api::MeasurementType;
use crate::services::chunks::{self, FetchWindow};
use crate::services::filter::filter_records;
use crate::services::ingest::upsert_samples;
use crate::services::refs::{self, CatalogStatus};
use crate::services::watermark;
use crate::utils::{Pacer, floor_to_minute, format_minute};
use chrono::{DateTime, Duration, FixedOffset};
use core::fmt;
use diesel::SqliteConnection;
use log::{debug, info, warn};
use std::error::Error;
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum SyncError {
    /// A chunk could not be fetched under the fail-fast policy.
    Chunk {
        kind: MeasurementType,
        window: FetchWindow,
        source: ClientError,
        /// Rows committed earlier in the same run; they stay stored.
        committed: usize,
    },
    /// Reading or writing the store failed.
    Store(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Chunk { kind, window, source, .. } => {
                write!(f, "chunk {} of {} failed: {}", window, kind, source)
            }
            SyncError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl SyncError {
    /// Rows this run committed before failing, when known.
    pub fn committed_rows(&self) -> usize {
        match self {
            SyncError::Chunk { committed, .. } => *committed,
            SyncError::Store(_) => 0,
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Chunk { source, .. } => Some(source),
            SyncError::Store(_) => None,
        }
    }
}

impl From<String> for SyncError {
    fn from(value: String) -> Self {
        SyncError::Store(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TypeStatus {
    /// The window was empty; nothing was requested.
    UpToDate,
    /// Every chunk succeeded.
    Complete,
    /// At least one chunk failed or was abandoned.
    Partial,
    /// Skipped because the catalog is stale and the policy forbids using it.
    Blocked,
}

#[derive(Debug, Clone)]
pub struct TypeReport {
    pub kind: MeasurementType,
    pub status: TypeStatus,
    pub window: Option<FetchWindow>,
    pub chunks_ok: usize,
    pub chunks_failed: usize,
    pub chunks_abandoned: usize,
    pub rows_written: usize,
    pub malformed: usize,
    pub stale: usize,
    /// Samples the endpoint returned past the end of the requested chunk.
    pub outside: usize,
    pub watermark_before: Option<DateTime<FixedOffset>>,
    pub watermark_after: Option<DateTime<FixedOffset>>,
}

impl TypeReport {
    fn new(kind: MeasurementType, status: TypeStatus, watermark: Option<DateTime<FixedOffset>>) -> Self {
        TypeReport {
            kind,
            status,
            window: None,
            chunks_ok: 0,
            chunks_failed: 0,
            chunks_abandoned: 0,
            rows_written: 0,
            malformed: 0,
            stale: 0,
            outside: 0,
            watermark_before: watermark,
            watermark_after: watermark,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub now: DateTime<FixedOffset>,
    pub catalog: CatalogStatus,
    pub types: Vec<TypeReport>,
}

impl RunSummary {
    pub fn total_rows(&self) -> usize {
        self.types.iter().map(|t| t.rows_written).sum()
    }

    pub fn log(&self) {
        for t in &self.types {
            info!(
                "Summary: {} {:?}: {} row(s) written, {} chunk(s) ok, {} failed, {} abandoned, {} malformed, {} stale, {} outside, watermark {}",
                t.kind,
                t.status,
                t.rows_written,
                t.chunks_ok,
                t.chunks_failed,
                t.chunks_abandoned,
                t.malformed,
                t.stale,
                t.outside,
                t.watermark_after
                    .map(|w| w.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        info!(
            "Summary: {} row(s) written across {} type(s)",
            self.total_rows(),
            self.types.len()
        );
    }
}

/// Start of the fetch window for a type.
///
/// Without a watermark the lookback is exactly `backfill`; with one, the
/// window reaches back `overlap` before it to pick up late writes, floored to
/// the minute.
pub fn window_start(
    watermark: Option<DateTime<FixedOffset>>,
    now: DateTime<FixedOffset>,
    backfill: Duration,
    overlap: Duration,
) -> DateTime<FixedOffset> {
    match watermark {
        None => now - backfill,
        Some(w) => floor_to_minute(w - overlap),
    }
}

/// Execute one run against `source`, capturing `now` as the end of every window.
pub fn run_once<S: RangeSource>(
    conn: &mut SqliteConnection,
    source: &S,
    cfg: &Config,
    now: DateTime<FixedOffset>,
) -> Result<RunSummary, SyncError> {
    let now = floor_to_minute(now.with_timezone(&cfg.utc_offset));
    let mut pacer = Pacer::new(cfg.request_pacing);

    let catalog = if cfg.catalog_sync_enabled {
        refs::sync_all(conn, source, &mut pacer)
    } else {
        info!("Catalog: sync disabled via CATALOG_SYNC_ENABLED");
        CatalogStatus::Disabled
    };

    let blocked = catalog.failed()
        && cfg.watermark_source == WatermarkSource::Derived
        && cfg.stale_catalog_policy == StaleCatalogPolicy::Block;
    if blocked {
        warn!("Sync: catalog is stale and STALE_CATALOG_POLICY=block; skipping ingestion this run");
    }

    let mut types: Vec<TypeReport> = Vec::with_capacity(cfg.types.len());
    for kind in &cfg.types {
        let report = if blocked {
            TypeReport::new(*kind, TypeStatus::Blocked, None)
        } else {
            sync_type(conn, source, cfg, *kind, now, &mut pacer).map_err(|e| match e {
                SyncError::Chunk {
                    kind,
                    window,
                    source: cause,
                    committed,
                } => SyncError::Chunk {
                    kind,
                    window,
                    source: cause,
                    committed: committed + types.iter().map(|t| t.rows_written).sum::<usize>(),
                },
                other => other,
            })?
        };
        types.push(report);
    }

    Ok(RunSummary { now, catalog, types })
}

fn sync_type<S: RangeSource>(
    conn: &mut SqliteConnection,
    source: &S,
    cfg: &Config,
    kind: MeasurementType,
    now: DateTime<FixedOffset>,
    pacer: &mut Pacer,
) -> Result<TypeReport, SyncError> {
    let before = watermark::last_timestamp(conn, &cfg.watermark_source, kind)?;
    let window = FetchWindow::new(window_start(before, now, cfg.backfill, cfg.overlap), now);
    let step = cfg.chunk_for(kind);

    if window.is_empty() {
        info!("Sync: {} up to date (watermark {})", kind, format_watermark(before, cfg.utc_offset));
        return Ok(TypeReport::new(kind, TypeStatus::UpToDate, before));
    }

    let chunks = chunks::split(window, step);
    info!(
        "Sync: {} {} -> {} (chunk {}m, {} chunk(s), watermark {})",
        kind,
        format_minute(window.start, cfg.utc_offset),
        format_minute(window.end, cfg.utc_offset),
        step.num_minutes(),
        chunks.len(),
        format_watermark(before, cfg.utc_offset)
    );

    let mut report = TypeReport::new(kind, TypeStatus::Complete, before);
    report.window = Some(window);

    // latest sample seen before the first failed chunk
    let mut frontier: Option<DateTime<FixedOffset>> = None;
    let mut gap = false;

    for chunk in chunks {
        if gap && cfg.watermark_source.reads_samples() {
            report.chunks_abandoned += 1;
            continue;
        }

        pacer.wait();
        let records = match source.fetch_range(kind, &chunk) {
            Ok(records) => records,
            Err(e) => match cfg.failure_policy {
                FailurePolicy::FailFast => {
                    return Err(SyncError::Chunk {
                        kind,
                        window: chunk,
                        source: e,
                        committed: report.rows_written,
                    });
                }
                FailurePolicy::Resilient => {
                    warn!("Sync: {} chunk {} skipped: {}", kind, chunk, e);
                    report.chunks_failed += 1;
                    gap = true;
                    continue;
                }
            },
        };

        let mut filtered = filter_records(&records, before);
        let outside = filtered.discard_from(chunk.end);
        if outside > 0 {
            debug!("Sync: {} chunk {}: dropped {} sample(s) past the chunk end", kind, chunk, outside);
        }
        let written = upsert_samples(conn, &filtered.samples, cfg.utc_offset)?;
        debug!(
            "Sync: {} chunk {}: {} record(s), {} kept, {} written, {} malformed, {} stale",
            kind,
            chunk,
            records.len(),
            filtered.samples.len(),
            written,
            filtered.malformed,
            filtered.stale
        );

        report.chunks_ok += 1;
        report.rows_written += written;
        report.malformed += filtered.malformed;
        report.stale += filtered.stale;
        report.outside += filtered.outside;
        if !gap {
            frontier = frontier.max(filtered.latest());
        }
    }

    if gap {
        report.status = TypeStatus::Partial;
        warn!(
            "Sync: {} has {} failed chunk(s); watermark held before the first gap",
            kind, report.chunks_failed
        );
    }
    if report.chunks_abandoned > 0 {
        warn!(
            "Sync: {} abandoned {} chunk(s) after the gap (watermark read from samples)",
            kind, report.chunks_abandoned
        );
    }

    if let Some(candidate) = frontier
        && before.is_none_or(|w| candidate > w)
    {
        if watermark::set_last_timestamp(conn, &cfg.watermark_source, kind, candidate, cfg.utc_offset)? {
            debug!("Sync: {} watermark advanced to {}", kind, candidate);
        }
        report.watermark_after = Some(candidate);
    }

    info!(
        "Sync: {} done, {} row(s) written ({} malformed, {} stale)",
        kind, report.rows_written, report.malformed, report.stale
    );
    Ok(report)
}

fn format_watermark(ts: Option<DateTime<FixedOffset>>, offset: FixedOffset) -> String {
    ts.map(|t| t.with_timezone(&offset).to_rfc3339())
        .unwrap_or_else(|| "none".to_string())
}

/// Write the total row count for the downstream publishing job.
pub fn write_rows_signal(path: &Path, rows: usize) -> Result<(), String> {
    fs::write(path, format!("{}\n", rows)).map_err(|e| format!("writing {} failed: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{LabelEntry, RawStateRow};
    use crate::db::testing::memory_conn;
    use crate::models::api::{DeviceInfo, LabelInfo};
    use crate::schema;
    use diesel::prelude::*;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Serves a fixed set of records per type; chunks listed in `failing` error out.
    #[derive(Default)]
    struct ScriptedSource {
        records: HashMap<MeasurementType, Vec<Value>>,
        failing: Vec<(MeasurementType, DateTime<FixedOffset>)>,
        /// Answer every chunk with all records, as a misbehaving endpoint would.
        ignore_window: bool,
        catalog_down: bool,
        labels: Vec<LabelInfo>,
        requests: RefCell<Vec<(MeasurementType, FetchWindow)>>,
    }

    impl ScriptedSource {
        fn with_records(kind: MeasurementType, records: Vec<Value>) -> Self {
            let mut source = ScriptedSource::default();
            source.records.insert(kind, records);
            source
        }
    }

    impl RangeSource for ScriptedSource {
        fn fetch_range(&self, kind: MeasurementType, window: &FetchWindow) -> Result<Vec<Value>, ClientError> {
            self.requests.borrow_mut().push((kind, *window));
            if self.failing.contains(&(kind, window.start)) {
                return Err(ClientError::Transport("http 503".into()));
            }
            let records = self.records.get(&kind).cloned().unwrap_or_default();
            Ok(records
                .into_iter()
                .filter(|r| {
                    if self.ignore_window {
                        return true;
                    }
                    let ts = r["timestamp"].as_str().and_then(crate::utils::parse_zoned);
                    ts.is_some_and(|t| t >= window.start && t < window.end)
                })
                .collect())
        }

        fn fetch_labels(&self) -> Result<Vec<LabelInfo>, ClientError> {
            if self.catalog_down {
                return Err(ClientError::NotFound { path: "/mim".into() });
            }
            Ok(self.labels.clone())
        }

        fn fetch_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
            Ok(Vec::new())
        }
    }

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn record(ts: &str, label: &str, state: f64) -> Value {
        json!({"timestamp": ts, "measurementLabel": label, "state": state})
    }

    fn config(types: &[MeasurementType]) -> Config {
        let mut cfg = Config::from_lookup(|_| None).unwrap();
        cfg.types = types.to_vec();
        cfg.request_pacing = std::time::Duration::ZERO;
        cfg.backfill = Duration::hours(24);
        cfg.chunk_minutes = std::num::NonZeroU32::new(180).unwrap();
        cfg
    }

    fn row_count(conn: &mut SqliteConnection) -> i64 {
        use schema::raw_state::dsl as R;
        R::raw_state.count().get_result(conn).unwrap()
    }

    fn checkpoint(conn: &mut SqliteConnection, kind: MeasurementType) -> Option<DateTime<FixedOffset>> {
        watermark::last_timestamp(conn, &WatermarkSource::Checkpoint, kind).unwrap()
    }

    #[test]
    fn first_run_backfills_bounded_window_in_chunks() {
        let mut conn = memory_conn();
        let source = ScriptedSource::default();
        let cfg = config(&[MeasurementType::InTemp]);
        let now = at("2025-06-01T12:00:00+07:00");

        let summary = run_once(&mut conn, &source, &cfg, now).unwrap();

        let requests = source.requests.borrow();
        assert_eq!(requests.len(), 8);
        assert_eq!(requests[0].1.start, at("2025-05-31T12:00:00+07:00"));
        assert_eq!(requests[7].1.end, now);
        for pair in requests.windows(2) {
            assert_eq!(pair[0].1.end, pair[1].1.start);
        }
        assert_eq!(summary.types[0].status, TypeStatus::Complete);
        assert_eq!(summary.types[0].watermark_after, None);
        assert_eq!(checkpoint(&mut conn, MeasurementType::InTemp), None);
    }

    #[test]
    fn backfill_start_never_precedes_lookback() {
        let now = at("2025-06-01T12:34:56+07:00");
        let start = window_start(None, now, Duration::hours(36), Duration::minutes(5));
        assert!(start >= now - Duration::hours(36));
        assert_eq!(start, at("2025-05-31T00:34:56+07:00"));

        let w = at("2025-06-01T12:00:30+07:00");
        assert_eq!(
            window_start(Some(w), now, Duration::hours(36), Duration::minutes(5)),
            at("2025-06-01T11:55:00+07:00")
        );
    }

    #[test]
    fn rerun_is_idempotent_and_watermark_monotonic() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        let source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T09:00:00+07:00", "inTempMeas1", 24.0),
                record("2025-06-01T10:00:00+07:00", "inTempMeas1", 24.5),
                record("2025-06-01T11:00:00+07:00", "inTempMeas2", 25.0),
                json!({"timestamp": "2025-06-01T10:30:00+07:00", "measurementLabel": "inTempMeas1", "state": "n/a"}),
            ],
        );
        let cfg = config(&[kind]);

        let first = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert_eq!(first.total_rows(), 3);
        assert_eq!(first.types[0].malformed, 1);
        let w1 = checkpoint(&mut conn, kind).unwrap();
        assert_eq!(w1, at("2025-06-01T11:00:00+07:00"));

        let second = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:30:00+07:00")).unwrap();
        assert_eq!(second.total_rows(), 0);
        assert_eq!(row_count(&mut conn), 3);
        let w2 = checkpoint(&mut conn, kind).unwrap();
        assert!(w2 >= w1);

        // second run resumed from the watermark minus the overlap margin
        let requests = source.requests.borrow();
        let resumed = requests.iter().find(|(_, w)| w.start == at("2025-06-01T10:55:00+07:00"));
        assert!(resumed.is_some(), "expected resume at watermark - overlap, got {:?}", requests.last());
    }

    #[test]
    fn overlap_records_at_or_before_watermark_are_not_reinserted() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InCo2;
        let cfg = config(&[kind]);
        let w = at("2025-06-01T11:00:00+07:00");
        watermark::set_last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind, w, cfg.utc_offset).unwrap();

        let source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T10:59:00+07:00", "inCO2Meas1", 400.0),
                record("2025-06-01T11:01:00+07:00", "inCO2Meas1", 410.0),
            ],
        );
        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert_eq!(summary.total_rows(), 1);
        assert_eq!(summary.types[0].stale, 1);

        use schema::raw_state::dsl as R;
        let rows: Vec<RawStateRow> = R::raw_state.select(RawStateRow::as_select()).load(&mut conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, "2025-06-01T11:01:00+07:00");
        assert_eq!(checkpoint(&mut conn, kind), Some(at("2025-06-01T11:01:00+07:00")));
    }

    #[test]
    fn up_to_date_type_makes_no_request() {
        let mut conn = memory_conn();
        let kind = MeasurementType::Battery;
        let mut cfg = config(&[kind]);
        cfg.overlap = Duration::zero();
        let now = at("2025-06-01T12:00:00+07:00");
        watermark::set_last_timestamp(&mut conn, &WatermarkSource::Checkpoint, kind, now, cfg.utc_offset).unwrap();

        let source = ScriptedSource::default();
        let summary = run_once(&mut conn, &source, &cfg, now).unwrap();
        assert_eq!(summary.types[0].status, TypeStatus::UpToDate);
        assert!(source.requests.borrow().is_empty());
    }

    #[test]
    fn resilient_run_skips_failed_chunk_and_holds_watermark() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T01:00:00+07:00", "inTempMeas1", 22.0),
                record("2025-06-01T04:00:00+07:00", "inTempMeas1", 23.0),
                record("2025-06-01T07:00:00+07:00", "inTempMeas1", 24.0),
            ],
        );
        // [03:00, 06:00) fails
        source.failing.push((kind, at("2025-06-01T03:00:00+07:00")));
        let cfg = config(&[kind, MeasurementType::InHumid]);

        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        let report = &summary.types[0];
        assert_eq!(report.status, TypeStatus::Partial);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.chunks_ok, 7);
        assert_eq!(report.rows_written, 2);
        assert_eq!(checkpoint(&mut conn, kind), Some(at("2025-06-01T01:00:00+07:00")));
        // the next type still ran
        assert_eq!(summary.types[1].status, TypeStatus::Complete);
    }

    #[test]
    fn fail_fast_aborts_without_advancing_watermark() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![record("2025-06-01T01:00:00+07:00", "inTempMeas1", 22.0)],
        );
        source.failing.push((kind, at("2025-06-01T03:00:00+07:00")));
        let mut cfg = config(&[kind, MeasurementType::InHumid]);
        cfg.failure_policy = FailurePolicy::FailFast;

        let err = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap_err();
        assert!(matches!(err, SyncError::Chunk { kind: MeasurementType::InTemp, .. }));
        assert_eq!(checkpoint(&mut conn, kind), None);
        assert!(source.requests.borrow().iter().all(|(k, _)| *k == kind));
    }

    #[test]
    fn samples_past_chunk_end_do_not_carry_watermark_over_gap() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T01:00:00+07:00", "inTempMeas1", 22.0),
                record("2025-06-01T04:30:00+07:00", "inTempMeas1", 23.0),
            ],
        );
        source.ignore_window = true;
        source.failing.push((kind, at("2025-06-01T03:00:00+07:00")));
        let cfg = config(&[kind]);

        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        let report = &summary.types[0];
        assert_eq!(report.chunks_failed, 1);
        assert!(report.outside > 0);
        assert_eq!(report.watermark_after, Some(at("2025-06-01T01:00:00+07:00")));
        assert_eq!(checkpoint(&mut conn, kind), Some(at("2025-06-01T01:00:00+07:00")));

        // the failed chunk's data is still fetched and kept next time
        source.failing.clear();
        source.ignore_window = false;
        let rerun = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert_eq!(rerun.types[0].watermark_after, Some(at("2025-06-01T04:30:00+07:00")));
        assert_eq!(row_count(&mut conn), 2);
    }

    #[test]
    fn fail_fast_reports_rows_committed_before_abort() {
        let mut conn = memory_conn();
        let mut source = ScriptedSource::with_records(
            MeasurementType::InHumid,
            vec![record("2025-06-01T05:00:00+07:00", "inHumidMeas1", 60.0)],
        );
        source.records.insert(
            MeasurementType::InTemp,
            vec![record("2025-06-01T01:00:00+07:00", "inTempMeas1", 22.0)],
        );
        source.failing.push((MeasurementType::InTemp, at("2025-06-01T03:00:00+07:00")));
        let mut cfg = config(&[MeasurementType::InHumid, MeasurementType::InTemp]);
        cfg.failure_policy = FailurePolicy::FailFast;

        let err = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap_err();
        assert_eq!(err.committed_rows(), 2);
        assert_eq!(row_count(&mut conn), 2);
    }

    #[test]
    fn pattern_watermark_abandons_chunks_after_gap_without_catalog() {
        let mut conn = memory_conn();
        let kind = MeasurementType::Battery;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T01:00:00+07:00", "battery3", 88.0),
                record("2025-06-01T07:00:00+07:00", "battery3", 87.0),
            ],
        );
        source.catalog_down = true;
        source.failing.push((kind, at("2025-06-01T03:00:00+07:00")));
        let mut cfg = config(&[kind]);
        cfg.watermark_source = WatermarkSource::LabelPattern(Default::default());
        cfg.stale_catalog_policy = StaleCatalogPolicy::Block;

        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        let report = &summary.types[0];
        assert_eq!(report.status, TypeStatus::Partial);
        assert_eq!(report.chunks_abandoned, 2);
        assert_eq!(row_count(&mut conn), 1);
        let derived = watermark::last_timestamp(&mut conn, &cfg.watermark_source, kind).unwrap();
        assert_eq!(derived, Some(at("2025-06-01T01:00:00+07:00")));
    }

    #[test]
    fn derived_watermark_abandons_chunks_after_gap() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![
                record("2025-06-01T01:00:00+07:00", "inTempMeas1", 22.0),
                record("2025-06-01T07:00:00+07:00", "inTempMeas1", 24.0),
            ],
        );
        source.labels = vec![LabelInfo {
            measurement_label: Some("inTempMeas1".into()),
            measurement_type: Some("intemp".into()),
            ..LabelInfo::default()
        }];
        source.failing.push((kind, at("2025-06-01T03:00:00+07:00")));
        let mut cfg = config(&[kind]);
        cfg.watermark_source = WatermarkSource::Derived;

        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        let report = &summary.types[0];
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.chunks_abandoned, 2);
        assert_eq!(row_count(&mut conn), 1);
        let derived = watermark::last_timestamp(&mut conn, &WatermarkSource::Derived, kind).unwrap();
        assert_eq!(derived, Some(at("2025-06-01T01:00:00+07:00")));
    }

    #[test]
    fn stale_catalog_blocks_derived_ingestion_when_configured() {
        let mut conn = memory_conn();
        let kind = MeasurementType::InTemp;
        use schema::label_catalog::dsl as L;
        diesel::insert_into(L::label_catalog)
            .values(&LabelEntry {
                measurement_label: "inTempMeas1".into(),
                measurement_type: Some("intemp".into()),
                zone_name: None,
                device_friendly_name: None,
            })
            .execute(&mut conn)
            .unwrap();

        let mut source = ScriptedSource::with_records(
            kind,
            vec![record("2025-06-01T11:00:00+07:00", "inTempMeas1", 22.0)],
        );
        source.catalog_down = true;
        let mut cfg = config(&[kind]);
        cfg.watermark_source = WatermarkSource::Derived;
        cfg.stale_catalog_policy = StaleCatalogPolicy::Block;

        let blocked = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert!(blocked.catalog.failed());
        assert_eq!(blocked.types[0].status, TypeStatus::Blocked);
        assert!(source.requests.borrow().is_empty());

        cfg.stale_catalog_policy = StaleCatalogPolicy::UseStale;
        let used = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert_eq!(used.total_rows(), 1);
    }

    #[test]
    fn catalog_failure_does_not_stop_checkpoint_ingestion() {
        let mut conn = memory_conn();
        let kind = MeasurementType::OccCount;
        let mut source = ScriptedSource::with_records(
            kind,
            vec![record("2025-06-01T11:30:00+07:00", "occCount1", 3.0)],
        );
        source.catalog_down = true;
        let mut cfg = config(&[kind]);
        cfg.stale_catalog_policy = StaleCatalogPolicy::Block;
        cfg.backfill = Duration::hours(2);

        let summary = run_once(&mut conn, &source, &cfg, at("2025-06-01T12:00:00+07:00")).unwrap();
        assert!(summary.catalog.failed());
        assert_eq!(summary.total_rows(), 1);
        // occcount uses the 60 minute chunk
        assert_eq!(source.requests.borrow().len(), 2);
    }

    #[test]
    fn rows_signal_file_holds_total() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inserted_count.txt");
        write_rows_signal(&path, 42).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "42\n");
    }
}
