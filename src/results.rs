use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::audit::AuditResult;
use crate::bundle::BundleSummary;
use crate::error::BenchError;
use crate::loadgen::{LoadRun, peak_run};
use crate::sampler::ResourceSummary;
use crate::targets::TargetKind;

pub const SUITE_RESULTS: &str = "benchmark-results.json";
pub const STRESS_RESULTS: &str = "stress-test-results.json";
pub const AUDIT_RESULTS: &str = "audit-results.json";
pub const BUNDLE_RESULTS: &str = "bundle-sizes.json";

/// Everything collected for a target that came up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// Milliseconds spent building and starting the instance.
    pub build_time: u64,
    /// Milliseconds from build start until the instance was stopped.
    pub total_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSummary>,
    pub bundle: BundleSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditResult>,
    #[serde(default)]
    pub load_runs: Vec<LoadRun>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetOutcome {
    Failed { error: String },
    Measured(Box<Measurements>),
}

/// One entry of the accumulated results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub framework: String,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

impl TargetResult {
    pub fn failed(framework: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
            outcome: TargetOutcome::Failed {
                error: error.into(),
            },
        }
    }

    pub fn measured(framework: impl Into<String>, measurements: Measurements) -> Self {
        Self {
            framework: framework.into(),
            outcome: TargetOutcome::Measured(Box::new(measurements)),
        }
    }

    pub fn measurements(&self) -> Option<&Measurements> {
        match &self.outcome {
            TargetOutcome::Measured(measurements) => Some(measurements),
            TargetOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            TargetOutcome::Failed { error } => Some(error),
            TargetOutcome::Measured(_) => None,
        }
    }

    pub fn performance_score(&self) -> Option<u32> {
        self.measurements()?.audit.as_ref()?.performance_score()
    }

    /// Gzipped bundle size; `None` when nothing was measured.
    pub fn gzipped_size(&self) -> Option<u64> {
        let bundle = &self.measurements()?.bundle;
        (!bundle.is_empty()).then_some(bundle.total_gzipped)
    }

    pub fn peak_run(&self) -> Option<&LoadRun> {
        peak_run(&self.measurements()?.load_runs)
    }

    pub fn peak_requests_per_second(&self) -> Option<f64> {
        self.peak_run()?
            .stats()
            .map(|stats| stats.requests_per_second_avg)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.measurements().map(|m| m.finished_at)
    }
}

/// Stress pass output of the standalone load command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressRecord {
    pub framework: String,
    pub port: u16,
    #[serde(default)]
    pub runs: Vec<LoadRun>,
    /// Set when the instance never came up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub framework: String,
    #[serde(flatten)]
    pub result: AuditResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub framework: String,
    #[serde(flatten)]
    pub bundle: BundleSummary,
}

/// JSON artifacts under the results directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Replace `name` atomically with the pretty-printed `value`.
    pub fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create results directory {}", self.dir.display())
        })?;
        let path = self.path(name);
        let serialised = serde_json::to_vec_pretty(value)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to stage {}", path.display()))?;
        staged
            .write_all(&serialised)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        staged
            .persist(&path)
            .with_context(|| format!("Failed to persist {}", path.display()))?;
        debug!(path = %path.display(), bytes = serialised.len(), "results written");
        Ok(path)
    }

    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T, BenchError> {
        let path = self.path(name);
        let unreadable = |reason: String| BenchError::ResultsUnreadable {
            path: path.clone(),
            reason,
        };
        let raw = fs::read_to_string(&path).map_err(|err| unreadable(err.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| unreadable(err.to_string()))
    }

    pub fn save_suite(&self, results: &[TargetResult]) -> Result<PathBuf> {
        self.write(SUITE_RESULTS, results)
    }

    pub fn load_suite(&self) -> Result<Vec<TargetResult>, BenchError> {
        self.read(SUITE_RESULTS)
    }
}
