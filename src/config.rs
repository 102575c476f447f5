//! Runtime configuration, read once from the environment at start-up.
//! Defaults match the reference deployment (ICT, `arc01` API mount).

use crate::models::api::MeasurementType;
use crate::utils::parse_utc_offset;
use chrono::{Duration, FixedOffset};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

pub const DEFAULT_API_BASE: &str = "https://archcu-digitaltwin.mamgistics.com";
pub const DEFAULT_API_PREFIXES: &str = "/arc01/api,/api";
pub const DEFAULT_DB_PATH: &str = "arc01.db";
pub const DEFAULT_UTC_OFFSET: &str = "+07:00";
pub const DEFAULT_CHUNK_MINUTES: u32 = 180;
pub const DEFAULT_HIGH_FREQ_CHUNK_MINUTES: u32 = 60;
pub const DEFAULT_MAX_REQUEST_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_PACING_MS: u64 = 200;
pub const DEFAULT_BACKFILL_HOURS: u32 = 36;
pub const DEFAULT_OVERLAP_MINUTES: u32 = 5;

/// What happens to the run when a chunk cannot be fetched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the run; the process exits non-zero.
    FailFast,
    /// Log and skip the chunk; the watermark stops at the gap.
    Resilient,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" | "strict" => Ok(FailurePolicy::FailFast),
            "resilient" | "skip" => Ok(FailurePolicy::Resilient),
            other => Err(format!("FAILURE_POLICY must be 'fail-fast' or 'resilient', got '{}'", other)),
        }
    }
}

/// Where per-type watermarks are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkSource {
    /// Dedicated `sync_checkpoint` rows keyed by `base:<type>`.
    Checkpoint,
    /// `MAX(timestamp)` of stored samples whose label the catalog maps to the type.
    Derived,
    /// `MAX(timestamp)` of stored samples whose label matches the type's `LIKE` patterns.
    LabelPattern(LabelPatterns),
}

impl WatermarkSource {
    /// Read back from stored samples rather than written explicitly.
    pub fn reads_samples(&self) -> bool {
        !matches!(self, WatermarkSource::Checkpoint)
    }
}

impl FromStr for WatermarkSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkpoint" => Ok(WatermarkSource::Checkpoint),
            "derived" => Ok(WatermarkSource::Derived),
            "pattern" => Ok(WatermarkSource::LabelPattern(LabelPatterns::default())),
            other => Err(format!(
                "WATERMARK_SOURCE must be 'checkpoint', 'derived' or 'pattern', got '{}'",
                other
            )),
        }
    }
}

/// SQL `LIKE` patterns over `measurementLabel`, per type.
///
/// Parsed from `intemp=inTempMeas%|inTempExt%,battery=battery%`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPatterns(BTreeMap<MeasurementType, Vec<String>>);

impl LabelPatterns {
    /// Patterns for `kind`; empty when none are configured.
    pub fn for_type(&self, kind: MeasurementType) -> &[String] {
        self.0.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for LabelPatterns {
    /// Label families used by the reference deployment.
    fn default() -> Self {
        let table = [
            (MeasurementType::InTemp, "inTempMeas%"),
            (MeasurementType::InHumid, "inHumidMeas%"),
            (MeasurementType::InCo2, "inCO2Meas%"),
            (MeasurementType::InPm25, "inPM25Meas%"),
            (MeasurementType::InTvoc, "inTVOCMeas%"),
            (MeasurementType::Current, "current%"),
            (MeasurementType::OccCount, "occCount%"),
            (MeasurementType::Battery, "battery%"),
        ];
        LabelPatterns(table.into_iter().map(|(k, p)| (k, vec![p.to_string()])).collect())
    }
}

impl FromStr for LabelPatterns {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (kind, patterns) = entry
                .split_once('=')
                .ok_or_else(|| format!("LABEL_PATTERNS entry '{}' is not type=pattern", entry))?;
            let kind: MeasurementType = kind.parse().map_err(|e| format!("LABEL_PATTERNS: {}", e))?;
            let patterns: Vec<String> = patterns
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if patterns.is_empty() {
                return Err(format!("LABEL_PATTERNS entry for {} has no pattern", kind));
            }
            map.entry(kind).or_insert_with(Vec::new).extend(patterns);
        }
        Ok(LabelPatterns(map))
    }
}

/// Whether a derived watermark may be computed from a catalog whose refresh just failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StaleCatalogPolicy {
    UseStale,
    Block,
}

impl FromStr for StaleCatalogPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "use-stale" | "stale" => Ok(StaleCatalogPolicy::UseStale),
            "block" => Ok(StaleCatalogPolicy::Block),
            other => Err(format!(
                "STALE_CATALOG_POLICY must be 'use-stale' or 'block', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Scheme and host of the upstream API, without a trailing slash.
    pub api_base: String,
    /// Mount points tried in order; a 404 on one moves on to the next.
    pub api_prefixes: Vec<String>,
    pub db_path: PathBuf,
    /// Types synced this run, in order.
    pub types: Vec<MeasurementType>,
    pub chunk_minutes: NonZeroU32,
    pub high_freq_chunk_minutes: NonZeroU32,
    pub high_freq_types: Vec<MeasurementType>,
    pub max_request_retries: NonZeroU32,
    pub retry_delay: StdDuration,
    pub request_timeout: StdDuration,
    /// Minimum spacing between outbound requests.
    pub request_pacing: StdDuration,
    /// Lookback used when a type has no watermark yet.
    pub backfill: Duration,
    /// Backward overlap applied to an existing watermark.
    pub overlap: Duration,
    /// Offset used for query parameters and stored timestamps.
    pub utc_offset: FixedOffset,
    pub failure_policy: FailurePolicy,
    pub watermark_source: WatermarkSource,
    pub stale_catalog_policy: StaleCatalogPolicy,
    pub catalog_sync_enabled: bool,
    /// Optional file receiving the number of rows written, for the publishing job.
    pub rows_inserted_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_base = get("API_BASE")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let api_prefixes = parse_prefixes(&get("API_PREFIXES").unwrap_or_else(|| DEFAULT_API_PREFIXES.to_string()));

        let db_path = PathBuf::from(get("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()));

        let types = match get("SYNC_TYPES") {
            Some(list) => parse_type_list("SYNC_TYPES", &list)?,
            None => MeasurementType::ALL.to_vec(),
        };
        if types.is_empty() {
            return Err("SYNC_TYPES must name at least one measurement type".to_string());
        }
        let high_freq_types = match get("HIGH_FREQ_TYPES") {
            Some(list) => parse_type_list("HIGH_FREQ_TYPES", &list)?,
            None => vec![MeasurementType::OccCount],
        };

        let chunk_minutes = parse_non_zero(&get, "CHUNK_MINUTES", DEFAULT_CHUNK_MINUTES)?;
        let high_freq_chunk_minutes = parse_non_zero(&get, "HIGH_FREQ_CHUNK_MINUTES", DEFAULT_HIGH_FREQ_CHUNK_MINUTES)?;
        let max_request_retries = parse_non_zero(&get, "MAX_REQUEST_RETRIES", DEFAULT_MAX_REQUEST_RETRIES)?;
        let backfill_hours = parse_non_zero(&get, "BACKFILL_HOURS", DEFAULT_BACKFILL_HOURS)?;

        let retry_delay_ms: u64 = parse_number(&get, "RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?;
        let request_timeout_secs: u64 = parse_number(&get, "REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?;
        let request_pacing_ms: u64 = parse_number(&get, "REQUEST_PACING_MS", DEFAULT_REQUEST_PACING_MS)?;
        let overlap_minutes: u32 = parse_number(&get, "OVERLAP_MINUTES", DEFAULT_OVERLAP_MINUTES)?;

        let utc_offset = parse_utc_offset(&get("UTC_OFFSET").unwrap_or_else(|| DEFAULT_UTC_OFFSET.to_string()))
            .map_err(|e| format!("UTC_OFFSET: {}", e))?;

        let failure_policy = get("FAILURE_POLICY")
            .map(|s| s.parse::<FailurePolicy>())
            .transpose()?
            .unwrap_or(FailurePolicy::Resilient);
        let mut watermark_source = get("WATERMARK_SOURCE")
            .map(|s| s.parse::<WatermarkSource>())
            .transpose()?
            .unwrap_or(WatermarkSource::Checkpoint);
        if let Some(raw) = get("LABEL_PATTERNS") {
            let patterns = raw.parse::<LabelPatterns>()?;
            if let WatermarkSource::LabelPattern(current) = &mut watermark_source {
                *current = patterns;
            }
        }
        let stale_catalog_policy = get("STALE_CATALOG_POLICY")
            .map(|s| s.parse::<StaleCatalogPolicy>())
            .transpose()?
            .unwrap_or(StaleCatalogPolicy::UseStale);

        let catalog_sync_enabled = get("CATALOG_SYNC_ENABLED")
            .map(|s| parse_flag("CATALOG_SYNC_ENABLED", &s))
            .transpose()?
            .unwrap_or(true);

        let rows_inserted_file = get("ROWS_INSERTED_FILE").map(PathBuf::from);

        Ok(Config {
            api_base,
            api_prefixes,
            db_path,
            types,
            chunk_minutes,
            high_freq_chunk_minutes,
            high_freq_types,
            max_request_retries,
            retry_delay: StdDuration::from_millis(retry_delay_ms),
            request_timeout: StdDuration::from_secs(request_timeout_secs),
            request_pacing: StdDuration::from_millis(request_pacing_ms),
            backfill: Duration::hours(i64::from(backfill_hours.get())),
            overlap: Duration::minutes(i64::from(overlap_minutes)),
            utc_offset,
            failure_policy,
            watermark_source,
            stale_catalog_policy,
            catalog_sync_enabled,
            rows_inserted_file,
        })
    }

    /// Chunk length for `kind`: high-frequency types get the smaller override.
    pub fn chunk_for(&self, kind: MeasurementType) -> Duration {
        let minutes = if self.high_freq_types.contains(&kind) {
            self.high_freq_chunk_minutes
        } else {
            self.chunk_minutes
        };
        Duration::minutes(i64::from(minutes.get()))
    }
}

/// Comma-separated mount points; each is normalized to `/segment` form, `""` for the root.
fn parse_prefixes(raw: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim().trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    prefixes
}

fn parse_type_list(key: &str, raw: &str) -> Result<Vec<MeasurementType>, String> {
    let mut types = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind: MeasurementType = part.parse().map_err(|e| format!("{}: {}", key, e))?;
        if !types.contains(&kind) {
            types.push(kind);
        }
    }
    Ok(types)
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("{} must be true or false, got '{}'", key, raw)),
    }
}

fn parse_number<G, T>(get: &G, key: &str, default: T) -> Result<T, String>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(s) => s
            .parse::<T>()
            .map_err(|_| format!("{} must be a non-negative integer, got '{}'", key, s)),
        None => Ok(default),
    }
}

fn parse_non_zero<G>(get: &G, key: &str, default: u32) -> Result<NonZeroU32, String>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u32 = parse_number(get, key, default)?;
    NonZeroU32::new(value).ok_or_else(|| format!("{} must be greater than zero", key))
}
