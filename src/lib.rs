pub mod audit;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod loadgen;
pub mod orchestrator;
pub mod readiness;
pub mod report;
pub mod results;
pub mod runtime;
pub mod sampler;
pub mod targets;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, info_span, warn};

use crate::audit::{AuditResult, Auditor, auditor_from_settings};
use crate::bundle::inspect_bundle;
use crate::config::{AuditBackend, BenchSettings, default_config_path};
use crate::loadgen::LoadGenerator;
use crate::orchestrator::{InstanceSession, Orchestrator, SuiteOptions};
use crate::readiness::ReadinessPoller;
use crate::results::{
    AUDIT_RESULTS, AuditRecord, BUNDLE_RESULTS, BundleRecord, ResultStore, STRESS_RESULTS,
    StressRecord, TargetResult,
};
use crate::runtime::{ComposeRuntime, InstanceRuntime};
use crate::sampler::ResourceSampler;
use crate::targets::{Target, select_targets};

/// Readiness budget of the standalone load stage.
pub const LOAD_STAGE_ATTEMPTS: u32 = 40;

/// Entry point tying settings, stores and the individual stages together.
pub struct Harness {
    settings: BenchSettings,
    store: ResultStore,
}

impl Harness {
    pub fn from_settings(settings: BenchSettings) -> Result<Self> {
        let results_dir = settings.resolve_results_dir()?;
        Ok(Self {
            settings,
            store: ResultStore::new(results_dir),
        })
    }

    /// Load settings from `config_path` (or the platform default) and build a harness.
    pub fn bootstrap(
        config_path_override: Option<PathBuf>,
        results_dir_override: Option<PathBuf>,
    ) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let mut settings = BenchSettings::load_or_default(&config_path)?;
        if let Some(dir) = results_dir_override {
            settings.results_dir = Some(dir);
        }
        Self::from_settings(settings)
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn with_audit_backend(mut self, backend: AuditBackend) -> Self {
        self.settings.audit.backend = backend;
        self
    }

    /// Configured targets filtered by `names`; all of them when `names` is empty.
    pub fn targets(&self, names: &[String]) -> Result<Vec<Target>> {
        select_targets(&self.settings.targets, names)
    }

    fn load_generator(&self) -> Result<LoadGenerator> {
        LoadGenerator::new(self.settings.load.request_timeout())
    }

    /// Full pipeline: every target in turn, then the Markdown reports.
    pub fn run_suite(&self, targets: &[Target], audit: bool) -> Result<Vec<TargetResult>> {
        let runtime = ComposeRuntime::from_settings(&self.settings)?;
        let readiness = ReadinessPoller::from_settings(&self.settings.readiness)?;
        let auditor = auditor_from_settings(&self.settings.audit);
        let load = self.load_generator()?;
        let mut options = SuiteOptions::from_settings(&self.settings);
        options.audit = audit;

        let orchestrator = Orchestrator::new(
            &runtime,
            &readiness,
            auditor.as_ref(),
            &load,
            &self.store,
            options,
        );
        let results = orchestrator.run_all(targets)?;
        let (summary, detail) = self.render_report()?;
        info!(
            summary = %summary.display(),
            detail = %detail.display(),
            "reports written"
        );
        Ok(results)
    }

    /// Inspect the locally built output of each target.
    pub fn run_bundle_stage(&self, targets: &[Target]) -> Result<Vec<BundleRecord>> {
        let project_root = self.settings.resolve_project_root()?;
        let records: Vec<BundleRecord> = targets
            .iter()
            .map(|target| {
                let dist = target.resolve_dist_dir(&project_root);
                let bundle = inspect_bundle(&dist);
                info!(
                    framework = %target.name,
                    path = %dist.display(),
                    total = bundle.total_size(),
                    gzipped = bundle.total_gzipped,
                    "bundle inspected"
                );
                BundleRecord {
                    framework: target.name.clone(),
                    bundle,
                }
            })
            .collect();
        self.store.write(BUNDLE_RESULTS, &records)?;
        Ok(records)
    }

    /// Audit already running targets; targets that do not answer are recorded as failed.
    pub fn run_audit_stage(&self, targets: &[Target]) -> Result<Vec<AuditRecord>> {
        let readiness = ReadinessPoller::from_settings(&self.settings.readiness)?;
        let auditor = auditor_from_settings(&self.settings.audit);
        let records = audit_targets(targets, &readiness, auditor.as_ref());
        self.store.write(AUDIT_RESULTS, &records)?;
        Ok(records)
    }

    /// Start each target on its own, stress it and stop it again.
    pub fn run_load_stage(&self, targets: &[Target]) -> Result<Vec<StressRecord>> {
        let runtime = ComposeRuntime::from_settings(&self.settings)?;
        self.load_stage_with(&runtime, targets)
    }

    fn load_stage_with(
        &self,
        runtime: &dyn InstanceRuntime,
        targets: &[Target],
    ) -> Result<Vec<StressRecord>> {
        let readiness = ReadinessPoller::from_settings(&self.settings.readiness)?;
        let load = self.load_generator()?;
        let options = SuiteOptions::from_settings(&self.settings);
        let sampler = ResourceSampler::new(options.load_interval);
        let instances = InstanceSession::new(runtime, &readiness);

        let mut records = Vec::with_capacity(targets.len());
        for target in targets {
            let span = info_span!("stress", framework = %target.name, port = target.port);
            let _entered = span.enter();
            let url = target.url();
            let record = match instances.run(target, LOAD_STAGE_ATTEMPTS, |stats| {
                load.stress(&url, &options.plan, &sampler, stats)
            }) {
                Ok((runs, _)) => StressRecord {
                    framework: target.name.clone(),
                    port: target.port,
                    runs,
                    error: None,
                    timestamp: Utc::now(),
                },
                Err(err) => {
                    warn!(error = %err, "skipping stress run");
                    StressRecord {
                        framework: target.name.clone(),
                        port: target.port,
                        runs: Vec::new(),
                        error: Some(err.marker()),
                        timestamp: Utc::now(),
                    }
                }
            };
            records.push(record);
            self.store
                .write(STRESS_RESULTS, &records)
                .context("Failed to persist stress results")?;
        }
        Ok(records)
    }

    /// Re-render SUMMARY.md and RESULTS.md from the persisted suite results.
    pub fn render_report(&self) -> Result<(PathBuf, PathBuf)> {
        let results = self.store.load_suite()?;
        let rendered = report::render(&results);
        let dir = self.settings.resolve_report_dir()?;
        report::write_report(&dir, &rendered)
    }
}

fn audit_targets(
    targets: &[Target],
    readiness: &ReadinessPoller,
    auditor: &dyn Auditor,
) -> Vec<AuditRecord> {
    targets
        .iter()
        .map(|target| {
            let url = target.url();
            let result = if readiness.wait_until_ready(target.port, 1) {
                auditor.audit(&url)
            } else {
                warn!(framework = %target.name, %url, "server not running; skipping audit");
                AuditResult::failed(&url, "server not running")
            };
            AuditRecord {
                framework: target.name.clone(),
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditReport, PageMetrics};
    use crate::error::BenchError;
    use crate::orchestrator::tests::FakeRuntime;
    use crate::results::tests::sample_measurements;
    use crate::targets::TargetKind;
    use crate::test_support::unused_port;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::tempdir;

    fn settings_in(root: &std::path::Path) -> BenchSettings {
        let mut settings = BenchSettings {
            project_root: Some(root.to_path_buf()),
            ..BenchSettings::default()
        };
        settings.readiness.interval_ms = 10;
        settings.readiness.request_timeout_ms = 200;
        settings.load.concurrency_levels = vec![2];
        settings.load.duration_secs = 1;
        settings.load.cooldown_ms = 0;
        settings.sampling.load_interval_ms = 200;
        settings
    }

    struct Unreachable;

    impl Auditor for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        fn run(&self, url: &str) -> Result<AuditReport, BenchError> {
            panic!("audited {url} although it was down");
        }
    }

    #[test]
    fn bootstrap_writes_default_config_and_applies_results_override() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        let harness =
            Harness::bootstrap(Some(config.clone()), Some(dir.path().join("out"))).unwrap();
        assert!(config.exists());
        assert_eq!(harness.store().dir(), dir.path().join("out"));
        assert_eq!(harness.targets(&[]).unwrap().len(), 7);
        assert!(harness.targets(&["svelte".to_string()]).is_err());
    }

    #[test]
    fn bundle_stage_reads_local_dist_directories() {
        let dir = tempdir().unwrap();
        let dist = dir.path().join("implementations/leptos/dist");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("app.js"), "let a = 1;").unwrap();
        fs::write(dist.join("index.html"), "<html></html>").unwrap();

        let harness = Harness::from_settings(settings_in(dir.path())).unwrap();
        let targets = harness
            .targets(&["leptos".to_string(), "yew".to_string()])
            .unwrap();
        let records = harness.run_bundle_stage(&targets).unwrap();

        assert_eq!(records[0].framework, "leptos");
        assert_eq!(records[0].bundle.total_js, 10);
        assert!(records[1].bundle.is_empty());
        let saved: Vec<BundleRecord> = harness.store().read(BUNDLE_RESULTS).unwrap();
        assert_eq!(saved, records);
    }

    #[test]
    fn audit_of_stopped_server_is_recorded_as_failed() {
        let settings = settings_in(std::path::Path::new("."));
        let readiness = ReadinessPoller::from_settings(&settings.readiness).unwrap();
        let target = Target::new("vue", unused_port(), TargetKind::Javascript);

        let records = audit_targets(&[target], &readiness, &Unreachable);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result.error(), Some("server not running"));
    }

    #[test]
    fn audit_of_running_server_uses_auditor() {
        struct Perfect;
        impl Auditor for Perfect {
            fn name(&self) -> &'static str {
                "perfect"
            }
            fn run(&self, url: &str) -> Result<AuditReport, BenchError> {
                Ok(AuditReport {
                    url: url.to_string(),
                    timestamp: Utc::now(),
                    performance_score: 100,
                    metrics: PageMetrics::default(),
                })
            }
        }

        let server = crate::test_support::TestServer::start();
        let settings = settings_in(std::path::Path::new("."));
        let readiness = ReadinessPoller::from_settings(&settings.readiness).unwrap();
        let target = Target::new("react", server.port(), TargetKind::Javascript);

        let records = audit_targets(&[target], &readiness, &Perfect);
        assert_eq!(records[0].result.performance_score(), Some(100));
    }

    #[test]
    fn load_stage_records_failed_builds_and_stops_instances() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.results_dir = Some(dir.path().join("results"));
        let harness = Harness::from_settings(settings).unwrap();
        let runtime = FakeRuntime {
            failing_builds: HashSet::from(["angular".to_string()]),
            ..FakeRuntime::default()
        };
        let targets = vec![Target::new("angular", unused_port(), TargetKind::Javascript)];

        let records = harness.load_stage_with(&runtime, &targets).unwrap();

        assert_eq!(records[0].error.as_deref(), Some("build failed"));
        assert!(records[0].runs.is_empty());
        assert!(runtime.calls().iter().any(|call| call == "stop:angular"));
        let saved: Vec<StressRecord> = harness.store().read(STRESS_RESULTS).unwrap();
        assert_eq!(saved, records);
    }

    #[test]
    fn report_is_rendered_from_saved_suite() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.results_dir = Some(dir.path().join("results"));
        settings.report_dir = Some(dir.path().join("docs"));
        let harness = Harness::from_settings(settings).unwrap();

        assert!(harness.render_report().is_err());

        harness
            .store()
            .save_suite(&[
                TargetResult::measured("leptos", sample_measurements()),
                TargetResult::failed("yew", "server did not become ready"),
            ])
            .unwrap();
        let (summary, detail) = harness.render_report().unwrap();
        let first = fs::read_to_string(&summary).unwrap();
        harness.render_report().unwrap();

        assert_eq!(fs::read_to_string(&summary).unwrap(), first);
        assert!(first.contains("leptos"));
        assert!(fs::read_to_string(detail).unwrap().contains("### Yew"));
    }
}
