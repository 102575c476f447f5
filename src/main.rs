pub mod models {
    pub mod api;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    #[cfg(test)]
    pub mod testing;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod chunks;
    pub mod filter;
    pub mod ingest;
    pub mod refs;
    pub mod sync;
    pub mod watermark;
}

use crate::client::ArcClient;
use crate::config::Config;
use crate::services::sync;
use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use std::ffi::OsString;
use std::path::PathBuf;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut SqliteConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (api={} prefixes=[{}], db={}, types={}, chunk={}m, high_freq_chunk={}m, backfill={}h, overlap={}m, offset={}, failure_policy={:?}, watermark_source={:?}, max_request_retries={})",
        cfg.api_base,
        cfg.api_prefixes.join(","),
        cfg.db_path.display(),
        cfg.types.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(","),
        cfg.chunk_minutes.get(),
        cfg.high_freq_chunk_minutes.get(),
        cfg.backfill.num_hours(),
        cfg.overlap.num_minutes(),
        cfg.utc_offset,
        cfg.failure_policy,
        cfg.watermark_source,
        cfg.max_request_retries.get()
    );

    // 2) Open the store
    let db_url = cfg
        .db_path
        .to_str()
        .ok_or_else(|| format!("DB_PATH is not valid UTF-8: {}", cfg.db_path.display()))?;
    let mut conn = SqliteConnection::establish(db_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Opened database {}", cfg.db_path.display());

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 4) One sync run, windows ending at the current minute
    let client = ArcClient::new(&cfg);
    let now = Utc::now().with_timezone(&cfg.utc_offset);
    let outcome = sync::run_once(&mut conn, &client, &cfg, now);
    let rows = match &outcome {
        Ok(summary) => {
            summary.log();
            summary.total_rows()
        }
        Err(e) => {
            warn!("Summary: run aborted after {} row(s) written", e.committed_rows());
            e.committed_rows()
        }
    };

    // 5) Hand the row count to the publishing job, also after an abort
    if let Some(path) = cfg.rows_inserted_file.as_deref() {
        sync::write_rows_signal(path, rows)?;
        info!("Wrote row count {} to {}", rows, path.display());
    }

    outcome.map(|_| ()).map_err(|e| e.to_string())
}

/// `--env-file PATH` or `--env-file=PATH`; no other arguments are accepted.
fn env_file_from_args<I>(args: I) -> Result<Option<PathBuf>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let path = match arg.as_str() {
            "--env-file" => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            s if s.starts_with("--env-file=") => PathBuf::from(&s["--env-file=".len()..]),
            other => return Err(format!("unrecognised argument: {}", other)),
        };
        if path.as_os_str().is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if env_file.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    Ok(env_file)
}

/// Seed the process environment from the given file, or from `.env` when one is found.
///
/// Variables already present in the environment keep their values.
fn load_env(explicit: Option<PathBuf>) -> Result<Option<PathBuf>, String> {
    match explicit {
        Some(path) => {
            dotenvy::from_path(&path).map_err(|e| format!("env file {}: {}", path.display(), e))?;
            Ok(Some(path))
        }
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(format!(".env: {}", e)),
        },
    }
}

fn main() {
    let loaded_env = match env_file_from_args(std::env::args_os().skip(1)).and_then(load_env) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = loaded_env.as_ref() {
        info!("Environment loaded from {}", path.display());
    }

    info!(
        "arc-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
