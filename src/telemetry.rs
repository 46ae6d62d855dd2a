//! Console logging plus an optional JSON trace file per harness run.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{TelemetrySettings, TraceSettings};

const TRACE_SUFFIX: &str = ".trace.jsonl";
const CONSOLE_FILTER: &str = "framebench=info";
const VERBOSE_CONSOLE_FILTER: &str = "framebench=debug";
/// The trace file keeps harness debug events whatever the console shows.
const TRACE_FILE_FILTER: &str = "warn,framebench=debug";

/// Trace file of this process and the worker flushing it.
struct TraceSink {
    path: PathBuf,
    _flush: WorkerGuard,
}

static TELEMETRY: OnceCell<Option<TraceSink>> = OnceCell::new();

/// Install the global subscriber once; later calls are no-ops.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    TELEMETRY
        .get_or_try_init(|| install(service, verbose, &telemetry.traces))
        .map(|_| ())
}

/// Trace file written by the current process, if any.
pub fn current_trace_file() -> Option<&'static Path> {
    TELEMETRY
        .get()
        .and_then(Option::as_ref)
        .map(|sink| sink.path.as_path())
}

/// `RUST_LOG` wins over the `--verbose` default.
fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_CONSOLE_FILTER
        } else {
            CONSOLE_FILTER
        })
    })
}

fn install(service: &str, verbose: bool, traces: &TraceSettings) -> Result<Option<TraceSink>> {
    let console = fmt::layer()
        .with_target(false)
        .with_filter(console_filter(verbose));

    let Some(trace) = open_trace_file(service, traces)? else {
        tracing_subscriber::registry()
            .with(console)
            .try_init()
            .context("Failed to install the tracing subscriber")?;
        return Ok(None);
    };

    let (writer, flush) = tracing_appender::non_blocking(trace.file);
    let json = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(writer)
        .with_filter(EnvFilter::new(TRACE_FILE_FILTER));
    tracing_subscriber::registry()
        .with(console)
        .with(json)
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    Ok(Some(TraceSink {
        path: trace.path,
        _flush: flush,
    }))
}

struct TraceFile {
    path: PathBuf,
    file: File,
}

fn trace_directory(traces: &TraceSettings) -> Result<PathBuf> {
    match &traces.directory {
        Some(dir) => Ok(dir.clone()),
        None => ProjectDirs::from("dev", "framebench", "framebench")
            .map(|dirs| dirs.cache_dir().join("traces"))
            .context("Unable to resolve platform trace directory"),
    }
}

/// `{service}-{utc timestamp}-{run prefix}.trace.jsonl`; the run prefix keeps
/// runs started within the same second apart.
fn trace_file_name(service: &str, started: DateTime<Utc>, run: Uuid) -> String {
    let run = run.simple().to_string();
    format!(
        "{service}-{}-{}{TRACE_SUFFIX}",
        started.format("%Y%m%dT%H%M%SZ"),
        &run[..8]
    )
}

fn open_trace_file(service: &str, traces: &TraceSettings) -> Result<Option<TraceFile>> {
    if !traces.enabled {
        return Ok(None);
    }
    let dir = trace_directory(traces)?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create trace directory {}", dir.display()))?;

    let path = dir.join(trace_file_name(service, Utc::now(), Uuid::new_v4()));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("Failed to open trace file {}", path.display()))?;
    prune_traces(&dir, traces.max_files, &path)?;
    Ok(Some(TraceFile { path, file }))
}

fn is_trace_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(TRACE_SUFFIX))
}

/// Remove the oldest traces so that at most `max_files` remain, `active`
/// included. Zero disables pruning. Returns how many files were removed.
fn prune_traces(dir: &Path, max_files: usize, active: &Path) -> Result<usize> {
    if max_files == 0 {
        return Ok(0);
    }
    let mut older: Vec<(SystemTime, PathBuf)> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read trace directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path != active && is_trace_file(path))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .collect();
    older.sort_unstable_by(|a, b| b.cmp(a));

    let removed = older
        .into_iter()
        .skip(max_files - 1)
        .filter(|(_, path)| fs::remove_file(path).is_ok())
        .count();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::{thread, time::Duration};
    use tempfile::tempdir;

    fn enabled_in(dir: &Path, max_files: usize) -> TraceSettings {
        TraceSettings {
            enabled: true,
            directory: Some(dir.to_path_buf()),
            max_files,
        }
    }

    #[test]
    fn trace_names_carry_time_and_run_prefix() {
        let started = Utc.with_ymd_and_hms(2025, 3, 5, 14, 7, 9).unwrap();
        let run = Uuid::parse_str("6f1c2a9e-0000-4000-8000-000000000000").unwrap();
        assert_eq!(
            trace_file_name("framebench", started, run),
            "framebench-20250305T140709Z-6f1c2a9e.trace.jsonl"
        );
    }

    #[test]
    fn runs_in_the_same_second_get_their_own_file() {
        let dir = tempdir().unwrap();
        let settings = enabled_in(dir.path(), 0);
        let first = open_trace_file("framebench", &settings).unwrap().unwrap();
        let second = open_trace_file("framebench", &settings).unwrap().unwrap();
        assert_ne!(first.path, second.path);
        assert!(first.path.exists() && second.path.exists());
    }

    #[test]
    fn pruning_keeps_newest_traces_and_ignores_other_files() {
        let dir = tempdir().unwrap();
        for index in 0..4 {
            fs::write(dir.path().join(format!("old-{index}.trace.jsonl")), "{}").unwrap();
            thread::sleep(Duration::from_millis(15));
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let active = open_trace_file("framebench", &enabled_in(dir.path(), 3))
            .unwrap()
            .unwrap()
            .path;

        assert!(active.exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("old-3.trace.jsonl").exists());
        assert!(dir.path().join("old-2.trace.jsonl").exists());
        assert!(!dir.path().join("old-1.trace.jsonl").exists());
        assert!(!dir.path().join("old-0.trace.jsonl").exists());
        assert_eq!(prune_traces(dir.path(), 3, &active).unwrap(), 0);
    }

    #[test]
    fn zero_max_files_keeps_everything() {
        let dir = tempdir().unwrap();
        for index in 0..3 {
            fs::write(dir.path().join(format!("run-{index}.trace.jsonl")), "{}").unwrap();
        }
        let active = dir.path().join("run-0.trace.jsonl");
        assert_eq!(prune_traces(dir.path(), 0, &active).unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn disabled_traces_open_no_file() {
        let dir = tempdir().unwrap();
        let settings = TraceSettings {
            enabled: false,
            ..enabled_in(dir.path(), 5)
        };
        assert!(open_trace_file("framebench", &settings).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
