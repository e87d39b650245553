use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub removed_stale_files: usize,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_key: Option<&'a str>,
    pub step_id: Option<u32>,
    pub job_id: Option<&'a str>,
    pub phase: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Mask free-form goal/prompt text before it lands in logs.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "matforge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_key = event.run_key.unwrap_or(""),
            step_id = event.step_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "matforge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_key = event.run_key.unwrap_or(""),
            step_id = event.step_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "matforge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_key = event.run_key.unwrap_or(""),
            step_id = event.step_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Install the process-wide subscriber: daily-rotated JSONL files plus
/// a compact console layer, filtered by `RUST_LOG` with an `info`
/// default. Stale rotated files are pruned first. Returns the appender
/// guard; buffered events flush when it drops. A second call is a
/// no-op at the subscriber level.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = format!("matforge.{}", process.as_str());
    let removed = cleanup_old_jsonl(logs_dir, &prefix, retention_days)?;

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.as_str())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            removed_stale_files: removed,
            initialized_at: Utc::now(),
        },
    ))
}

/// Delete rotated files older than the retention window. Only names of
/// the form `<prefix>.YYYY-MM-DD.jsonl` are considered; anything else
/// in the directory is left alone. Returns how many files were removed.
fn cleanup_old_jsonl(logs_dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stamp) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.strip_prefix('.'))
            .and_then(|n| n.strip_suffix(".jsonl"))
        else {
            continue;
        };
        let Ok(date) = chrono::NaiveDate::parse_from_str(stamp, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "relax LiFePO4 with the licensed package";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("LiFePO4"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/matforge");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("/tmp/matforge").join("logs"));
    }

    #[test]
    fn retention_removes_only_stale_rotated_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("matforge.engine.2021-03-01.jsonl");
        let fresh = dir.path().join(format!(
            "matforge.engine.{}.jsonl",
            Utc::now().format("%Y-%m-%d")
        ));
        let unrelated = dir.path().join("notes.txt");
        for path in [&stale, &fresh, &unrelated] {
            fs::write(path, "x").expect("write");
        }

        let removed = cleanup_old_jsonl(dir.path(), "matforge.engine", 7).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn init_writes_jsonl_into_the_logs_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (guard, info) = init_process_logging(ProcessKind::Cli, dir.path(), 7).expect("init");
        assert_eq!(info.prefix, "matforge.cli");
        assert_eq!(info.removed_stale_files, 0);

        emit_event(
            Level::INFO,
            ProcessKind::Cli,
            ObservabilityEvent {
                event: "logging_smoke",
                component: "tests",
                run_key: None,
                step_id: None,
                job_id: None,
                phase: None,
                status: None,
                error_code: None,
                detail: None,
            },
        );
        drop(guard);

        let written: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("matforge.cli."))
            .collect();
        assert_eq!(written.len(), 1);
        let body = fs::read_to_string(written[0].path()).expect("read log");
        assert!(body.contains("observability_event"));
        assert!(body.contains("logging_smoke"));
    }
}
