use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::targets::{Target, default_targets};

/// Overrides the load-time sampling interval in milliseconds.
pub const STATS_INTERVAL_ENV: &str = "FRAMEBENCH_STATS_INTERVAL_MS";

/// Browser audit backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AuditBackend {
    /// Headless Chromium with DevTools CPU emulation and a modelled network.
    Chrome,
    /// The `lighthouse` CLI.
    #[default]
    Lighthouse,
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchSettings {
    /// Directory holding the compose file and the implementations tree.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    /// Where SUMMARY.md and RESULTS.md are written.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    #[serde(default = "default_targets")]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub sampling: SamplingSettings,
    #[serde(default)]
    pub load: LoadSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            project_root: None,
            results_dir: None,
            report_dir: None,
            targets: default_targets(),
            readiness: ReadinessSettings::default(),
            sampling: SamplingSettings::default(),
            load: LoadSettings::default(),
            audit: AuditSettings::default(),
            runtime: RuntimeSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

impl BenchSettings {
    /// Load settings from disk, writing the defaults first when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let format = ConfigFormat::for_path(path);
        let mut settings = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            match format {
                ConfigFormat::Json => serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("Malformed config at {}", path.display()))?,
                ConfigFormat::Toml => toml::from_str::<Self>(&raw)
                    .with_context(|| format!("Malformed config at {}", path.display()))?,
            }
        } else {
            let settings = Self::default();
            settings
                .save(path)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            settings
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }
        }
        let serialised = match ConfigFormat::for_path(path) {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(interval) = parse_interval_override(env::var(STATS_INTERVAL_ENV).ok()) {
            self.sampling.load_interval_ms = interval;
        }
    }

    pub fn resolve_project_root(&self) -> Result<PathBuf> {
        match &self.project_root {
            Some(path) => Ok(path.clone()),
            None => env::current_dir().context("Unable to resolve current directory"),
        }
    }

    pub fn resolve_results_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.results_dir {
            return Ok(path.clone());
        }
        Ok(self
            .resolve_project_root()?
            .join("benchmarks")
            .join("results"))
    }

    pub fn resolve_report_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.report_dir {
            return Ok(path.clone());
        }
        self.resolve_project_root()
    }
}

fn parse_interval_override(raw: Option<String>) -> Option<u64> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|interval| *interval > 0)
}

/// Retry budget of the readiness poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "ReadinessSettings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "ReadinessSettings::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "ReadinessSettings::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl ReadinessSettings {
    const fn default_max_attempts() -> u32 {
        60
    }

    const fn default_interval_ms() -> u64 {
        2_000
    }

    const fn default_request_timeout_ms() -> u64 {
        2_000
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            interval_ms: Self::default_interval_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

/// Container resource sampling windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    #[serde(default = "SamplingSettings::default_idle_window_secs")]
    pub idle_window_secs: u64,
    #[serde(default = "SamplingSettings::default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Interval used while a load run is in flight.
    #[serde(default = "SamplingSettings::default_load_interval_ms")]
    pub load_interval_ms: u64,
}

impl SamplingSettings {
    const fn default_idle_window_secs() -> u64 {
        30
    }

    const fn default_idle_interval_ms() -> u64 {
        2_000
    }

    const fn default_load_interval_ms() -> u64 {
        250
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_window_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn load_interval(&self) -> Duration {
        Duration::from_millis(self.load_interval_ms)
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            idle_window_secs: Self::default_idle_window_secs(),
            idle_interval_ms: Self::default_idle_interval_ms(),
            load_interval_ms: Self::default_load_interval_ms(),
        }
    }
}

/// Stress pass parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSettings {
    #[serde(default = "LoadSettings::default_concurrency_levels")]
    pub concurrency_levels: Vec<u32>,
    #[serde(default = "LoadSettings::default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "LoadSettings::default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "LoadSettings::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl LoadSettings {
    fn default_concurrency_levels() -> Vec<u32> {
        vec![100, 500, 1000, 2000]
    }

    const fn default_duration_secs() -> u64 {
        30
    }

    const fn default_cooldown_ms() -> u64 {
        2_000
    }

    const fn default_request_timeout_ms() -> u64 {
        10_000
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            concurrency_levels: Self::default_concurrency_levels(),
            duration_secs: Self::default_duration_secs(),
            cooldown_ms: Self::default_cooldown_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

/// Browser audit throttling and backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default)]
    pub backend: AuditBackend,
    #[serde(default = "AuditSettings::default_rtt_ms")]
    pub rtt_ms: f64,
    #[serde(default = "AuditSettings::default_throughput_kbps")]
    pub throughput_kbps: f64,
    #[serde(default = "AuditSettings::default_cpu_slowdown")]
    pub cpu_slowdown: f64,
    #[serde(default = "AuditSettings::default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    /// Time the page is observed after the load event.
    #[serde(default = "AuditSettings::default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub chrome_binary: Option<PathBuf>,
    #[serde(default)]
    pub lighthouse_binary: Option<PathBuf>,
}

impl AuditSettings {
    const fn default_rtt_ms() -> f64 {
        150.0
    }

    const fn default_throughput_kbps() -> f64 {
        1638.4
    }

    const fn default_cpu_slowdown() -> f64 {
        4.0
    }

    const fn default_page_timeout_secs() -> u64 {
        60
    }

    const fn default_settle_ms() -> u64 {
        3_000
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: AuditBackend::default(),
            rtt_ms: Self::default_rtt_ms(),
            throughput_kbps: Self::default_throughput_kbps(),
            cpu_slowdown: Self::default_cpu_slowdown(),
            page_timeout_secs: Self::default_page_timeout_secs(),
            settle_ms: Self::default_settle_ms(),
            chrome_binary: None,
            lighthouse_binary: None,
        }
    }
}

/// How target instances are built and controlled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Compose file passed with `--file`; compose discovers one when unset.
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    #[serde(default = "RuntimeSettings::default_container_prefix")]
    pub container_prefix: String,
    #[serde(default)]
    pub docker_binary: Option<PathBuf>,
}

impl RuntimeSettings {
    fn default_container_prefix() -> String {
        "frontend-benchmark-".to_string()
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            compose_file: None,
            container_prefix: Self::default_container_prefix(),
            docker_binary: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub traces: TraceSettings,
}

/// Controls the JSON trace file written next to console logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "framebench", "framebench")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_is_written_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = BenchSettings::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings.targets.len(), 7);
        assert_eq!(settings.readiness.max_attempts, 60);
        assert_eq!(settings.load.concurrency_levels, vec![100, 500, 1000, 2000]);
        assert_eq!(settings.runtime.container_prefix, "frontend-benchmark-");
        assert_eq!(settings.audit.backend, AuditBackend::Lighthouse);

        let reloaded = BenchSettings::load_or_default(&path).unwrap();
        assert_eq!(reloaded.targets, settings.targets);
    }

    #[test]
    fn partial_toml_config_keeps_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(
            &path,
            r#"
project_root = "/srv/bench"

[load]
concurrency_levels = [10, 50]
duration_secs = 5

[[targets]]
name = "leptos"
port = 3004
kind = "rust"
"#,
        )
        .unwrap();

        let settings = BenchSettings::load_or_default(&path).unwrap();
        assert_eq!(settings.load.concurrency_levels, vec![10, 50]);
        assert_eq!(settings.load.cooldown_ms, 2_000);
        assert_eq!(settings.targets.len(), 1);
        assert_eq!(settings.targets[0].service(), "leptos");
        assert_eq!(settings.audit.rtt_ms, 150.0);
        assert_eq!(settings.audit.backend, AuditBackend::Lighthouse);
        assert_eq!(
            settings.resolve_results_dir().unwrap(),
            PathBuf::from("/srv/bench/benchmarks/results")
        );
    }

    #[test]
    fn malformed_config_is_reported_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = BenchSettings::load_or_default(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Malformed config"));
    }

    #[test]
    fn interval_override_ignores_garbage() {
        assert_eq!(parse_interval_override(Some("500".into())), Some(500));
        assert_eq!(parse_interval_override(Some(" 125 ".into())), Some(125));
        assert_eq!(parse_interval_override(Some("0".into())), None);
        assert_eq!(parse_interval_override(Some("fast".into())), None);
        assert_eq!(parse_interval_override(None), None);
    }
}
