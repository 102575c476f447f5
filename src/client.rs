//! Blocking HTTP client for the sensor range API.
//!
//! - Blocking client using `ureq` (no async); status codes are inspected here
//!   instead of being surfaced as transport errors.
//! - The API is mounted under different base paths depending on deployment, so
//!   every request walks an ordered list of prefix candidates. A 404 moves on to
//!   the next candidate; any other failure is retried after a fixed delay.
//! - Range bodies may be a JSON array, a single object or NDJSON.

use chrono::FixedOffset;
use http::StatusCode;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::Cell;
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::models::api::{DeviceInfo, LabelInfo, MeasurementType};
use crate::services::chunks::FetchWindow;
use crate::utils::format_minute;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug)]
pub enum ClientError {
    /// Connection failure, timeout or non-2xx status; retries were exhausted.
    Transport(String),
    /// Every prefix candidate answered 404 for this path.
    NotFound { path: String },
    /// The response body was not valid JSON for the expected shape.
    Decode(String),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::NotFound { path } => write!(f, "endpoint {} not found under any prefix", path),
            ClientError::Decode(s) => write!(f, "decode error: {}", s),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: NonZeroU32,
    pub delay: Duration,
}

/// Result of one HTTP exchange against one prefix.
#[derive(Debug)]
pub(crate) enum Attempt {
    Body(String),
    NotFound,
    Failed(String),
}

/// Upstream operations the sync engine depends on.
pub trait RangeSource {
    fn fetch_range(&self, kind: MeasurementType, window: &FetchWindow) -> Result<Vec<Value>, ClientError>;
    fn fetch_labels(&self) -> Result<Vec<LabelInfo>, ClientError>;
    fn fetch_devices(&self) -> Result<Vec<DeviceInfo>, ClientError>;
}

pub struct ArcClient {
    agent: ureq::Agent,
    base_url: String,
    prefixes: Vec<String>,
    retry: RetryPolicy,
    offset: FixedOffset,
    /// Index of the prefix that answered last; tried first next time.
    resolved_prefix: Cell<Option<usize>>,
}

impl ArcClient {
    pub fn new(cfg: &Config) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(cfg.request_timeout))
            .http_status_as_error(false)
            .build();

        ArcClient {
            agent: ureq::Agent::new_with_config(agent_config),
            base_url: cfg.api_base.clone(),
            prefixes: cfg.api_prefixes.clone(),
            retry: RetryPolicy {
                attempts: cfg.max_request_retries,
                delay: cfg.retry_delay,
            },
            offset: cfg.utc_offset,
            resolved_prefix: Cell::new(None),
        }
    }

    fn url(&self, prefix: &str, path: &str) -> String {
        format!("{}{}{}", self.base_url, prefix, path)
    }

    fn send(&self, prefix: &str, path: &str, query: &[(&str, String)]) -> Attempt {
        let url = self.url(prefix, path);
        let mut req = self.agent.get(&url).header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, v);
        }

        match req.call() {
            Ok(mut res) => {
                let status = res.status();
                if status == StatusCode::NOT_FOUND {
                    return Attempt::NotFound;
                }
                if !status.is_success() {
                    let body = res
                        .body_mut()
                        .read_to_string()
                        .unwrap_or_else(|_| String::from("<no body>"));
                    return Attempt::Failed(format!("http {} from {}: {}", status.as_u16(), url, truncate(&body)));
                }
                match res.body_mut().read_to_string() {
                    Ok(body) => Attempt::Body(body),
                    Err(e) => Attempt::Failed(format!("reading body from {} failed: {}", url, e)),
                }
            }
            Err(e) => Attempt::Failed(format!("{}: {}", url, e)),
        }
    }

    fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String, ClientError> {
        let preferred = self.resolved_prefix.get();
        let (idx, body) = request_with_fallback(&self.prefixes, preferred, &self.retry, path, |prefix| {
            self.send(prefix, path, query)
        })?;
        if preferred != Some(idx) {
            debug!("Client: using prefix '{}' for {}", self.prefixes[idx], self.base_url);
            self.resolved_prefix.set(Some(idx));
        }
        Ok(body)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let body = self.get_text(path, &[])?;
        let de = &mut serde_json::Deserializer::from_str(&body);
        serde_path_to_error::deserialize(de).map_err(|e| ClientError::Decode(format!("{}: {}", path, e)))
    }
}

impl RangeSource for ArcClient {
    fn fetch_range(&self, kind: MeasurementType, window: &FetchWindow) -> Result<Vec<Value>, ClientError> {
        let query = [
            ("from", format_minute(window.start, self.offset)),
            ("to", format_minute(window.end, self.offset)),
        ];
        let body = self.get_text(&format!("/range/{}", kind.as_str()), &query)?;
        parse_records(&body)
    }

    fn fetch_labels(&self) -> Result<Vec<LabelInfo>, ClientError> {
        self.get_json("/mim")
    }

    fn fetch_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        self.get_json("/aim")
    }
}

/// Walk `prefixes` (the `preferred` one first) until one answers, retrying
/// non-404 failures up to `retry.attempts` times.
///
/// Returns the index of the prefix that answered together with the body.
pub(crate) fn request_with_fallback<F>(
    prefixes: &[String],
    preferred: Option<usize>,
    retry: &RetryPolicy,
    path: &str,
    mut send: F,
) -> Result<(usize, String), ClientError>
where
    F: FnMut(&str) -> Attempt,
{
    let mut order: Vec<usize> = (0..prefixes.len()).collect();
    if let Some(p) = preferred.filter(|p| *p < prefixes.len()) {
        order.retain(|i| *i != p);
        order.insert(0, p);
    }

    let attempts = retry.attempts.get();
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let mut all_not_found = true;
        for &idx in &order {
            match send(prefixes[idx].as_str()) {
                Attempt::Body(body) => return Ok((idx, body)),
                Attempt::NotFound => {
                    debug!("Client: {}{} answered 404; trying next prefix", prefixes[idx], path);
                }
                Attempt::Failed(msg) => {
                    warn!("Client: {} attempt {}/{} failed: {}", path, attempt, attempts, msg);
                    last_error = msg;
                    all_not_found = false;
                    break;
                }
            }
        }
        if all_not_found {
            return Err(ClientError::NotFound { path: path.to_string() });
        }
        if attempt < attempts {
            thread::sleep(retry.delay);
        }
    }

    Err(ClientError::Transport(format!(
        "{} failed after {} attempt(s): {}",
        path, attempts, last_error
    )))
}

/// Normalize a range body to a flat list of records.
///
/// Accepts a JSON array, a single object, or newline-delimited values; an
/// empty body is an empty list. In newline-delimited bodies an unparsable
/// line is kept as a raw string so the record filter counts it as malformed;
/// only a body with no parsable line at all is a decode error.
pub fn parse_records(body: &str) -> Result<Vec<Value>, ClientError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    match serde_json::from_str::<Value>(body) {
        Ok(value) => push_flattened(&mut records, value),
        Err(whole) => {
            let mut parsed_any = false;
            for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => {
                        parsed_any = true;
                        push_flattened(&mut records, value);
                    }
                    Err(e) => {
                        debug!("Client: unparsable line ({}): {}", e, truncate(line));
                        records.push(Value::String(line.to_string()));
                    }
                }
            }
            if !parsed_any {
                return Err(ClientError::Decode(whole.to_string()));
            }
        }
    }
    Ok(records)
}

fn push_flattened(records: &mut Vec<Value>, value: Value) {
    match value {
        Value::Array(items) => records.extend(items),
        Value::Null => {}
        other => records.push(other),
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}…", cut)
    }
}
