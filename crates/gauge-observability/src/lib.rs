//! Logging for Gauge processes.
//!
//! Both the engine and the platform log twice: a compact console layer for
//! humans and a daily-rotated JSON file for whatever log search the
//! deployment ships to. Run-level happenings additionally go through
//! [`emit_event`], which pins a fixed field schema so engine and platform
//! logs line up when grepped side by side.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Platform,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Platform => "platform",
        }
    }
}

/// Knobs for [`init_logging`]. Defaults: console on, two weeks of rotated
/// files kept.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub console: bool,
    /// Rotated files older than this many days are pruned at startup;
    /// `None` keeps everything.
    pub retention_days: Option<u64>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            console: true,
            retention_days: Some(14),
        }
    }
}

/// Keep this alive for the lifetime of the process; dropping it flushes and
/// stops the background log writer.
pub struct LoggingHandle {
    pub file_prefix: String,
    _guard: WorkerGuard,
}

/// Install the global subscriber: JSON file layer (daily rotation under
/// `logs_dir`), optional console layer, `RUST_LOG`-style env filter
/// defaulting to `info`. Safe to call more than once; later calls keep the
/// first subscriber.
pub fn init_logging(
    process: ProcessKind,
    logs_dir: &Path,
    options: &LoggingOptions,
) -> anyhow::Result<LoggingHandle> {
    fs::create_dir_all(logs_dir)?;
    let file_prefix = format!("gauge.{}", process.as_str());
    if let Some(days) = options.retention_days {
        prune_rotated_logs(logs_dir, &file_prefix, days)?;
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, &file_prefix));
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false);
    let console_layer = options
        .console
        .then(|| tracing_subscriber::fmt::layer().compact().with_target(true));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok();

    Ok(LoggingHandle {
        file_prefix,
        _guard: guard,
    })
}

/// Delete this process's rotated files older than `keep_days`, judged by
/// filesystem mtime so the appender's naming scheme stays its own business.
fn prune_rotated_logs(logs_dir: &Path, file_prefix: &str, keep_days: u64) -> anyhow::Result<()> {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(keep_days.saturating_mul(86_400)))
    else {
        return Ok(());
    };

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(file_prefix) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

/// Fixed-shape structured event; absent fields are omitted from the record
/// rather than logged as empty strings.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

/// Emit one structured event at the given level. The event is serialized
/// once into a `fields` attribute; `tracing`'s macros need a const level,
/// so the level fan-out is the only thing the match does.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let fields = serde_json::to_string(&event).unwrap_or_default();
    let process = process.as_str();
    match level {
        Level::ERROR => tracing::error!(target: "gauge::events", process, %fields, "{}", event.event),
        Level::WARN => tracing::warn!(target: "gauge::events", process, %fields, "{}", event.event),
        _ => tracing::info!(target: "gauge::events", process, %fields, "{}", event.event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn absent_event_fields_are_omitted() {
        let event = ObservabilityEvent {
            event: "run.start",
            component: "engine.evaluator",
            run_id: Some("nightly"),
            item_id: None,
            metric: None,
            status: Some("start"),
            error_code: None,
            detail: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"run_id\":\"nightly\""));
        assert!(json.contains("\"status\":\"start\""));
        assert!(!json.contains("item_id"));
        assert!(!json.contains("error_code"));
    }

    #[test]
    fn prune_is_scoped_to_process_and_age() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("gauge.platform.2026-06-01");
        let fresh = dir.path().join("gauge.platform.2026-08-01");
        let other_process = dir.path().join("gauge.engine.2026-06-01");
        for path in [&stale, &fresh, &other_process] {
            fs::write(path, "{}\n").unwrap();
        }
        let forty_days = Duration::from_secs(40 * 86_400);
        for path in [&stale, &other_process] {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(SystemTime::now() - forty_days)
                .unwrap();
        }

        prune_rotated_logs(dir.path(), "gauge.platform", 14).unwrap();

        assert!(!stale.exists(), "stale platform file should be pruned");
        assert!(fresh.exists(), "recent file must survive");
        assert!(other_process.exists(), "other process's files are untouched");
    }

    #[test]
    fn init_creates_dir_and_reports_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");
        let handle = init_logging(
            ProcessKind::Engine,
            &logs_dir,
            &LoggingOptions {
                console: false,
                retention_days: None,
            },
        )
        .unwrap();
        assert_eq!(handle.file_prefix, "gauge.engine");
        assert!(logs_dir.is_dir());
    }
}
