use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::audit::Auditor;
use crate::bundle::{BundleSummary, inspect_staged};
use crate::config::BenchSettings;
use crate::error::BenchError;
use crate::loadgen::{LoadGenerator, StressPlan};
use crate::readiness::ReadinessPoller;
use crate::results::{Measurements, ResultStore, TargetResult};
use crate::runtime::{InstanceRuntime, InstanceStats};
use crate::sampler::ResourceSampler;
use crate::targets::Target;

/// Decides whether a freshly started instance answers HTTP.
pub trait ReadinessCheck: Send + Sync {
    fn wait_until_ready(&self, port: u16, max_attempts: u32) -> bool;
}

impl ReadinessCheck for ReadinessPoller {
    fn wait_until_ready(&self, port: u16, max_attempts: u32) -> bool {
        ReadinessPoller::wait_until_ready(self, port, max_attempts)
    }
}

/// Per-suite knobs derived from [`BenchSettings`].
#[derive(Debug, Clone)]
pub struct SuiteOptions {
    pub max_attempts: u32,
    pub idle_window: Duration,
    pub idle_interval: Duration,
    pub load_interval: Duration,
    pub plan: StressPlan,
    pub audit: bool,
}

impl SuiteOptions {
    pub fn from_settings(settings: &BenchSettings) -> Self {
        Self {
            max_attempts: settings.readiness.max_attempts,
            idle_window: settings.sampling.idle_window(),
            idle_interval: settings.sampling.idle_interval(),
            load_interval: settings.sampling.load_interval(),
            plan: StressPlan::new(
                &settings.load.concurrency_levels,
                settings.load.duration(),
                settings.load.cooldown(),
            ),
            audit: true,
        }
    }
}

/// Stops the instance when dropped.
struct InstanceGuard<'a> {
    runtime: &'a dyn InstanceRuntime,
    target: &'a Target,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        stop_instance(self.runtime, self.target);
    }
}

fn stop_instance(runtime: &dyn InstanceRuntime, target: &Target) {
    info!(service = %target.service(), "stopping instance");
    if let Err(err) = runtime.stop(target) {
        warn!(service = %target.service(), error = %format!("{err:#}"), "failed to stop instance");
    }
}

/// Elapsed times of one instance session in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub build_ms: u64,
    pub total_ms: u64,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Brings one instance up for the duration of a closure.
#[derive(Clone, Copy)]
pub struct InstanceSession<'a> {
    runtime: &'a dyn InstanceRuntime,
    readiness: &'a dyn ReadinessCheck,
}

impl<'a> InstanceSession<'a> {
    pub fn new(runtime: &'a dyn InstanceRuntime, readiness: &'a dyn ReadinessCheck) -> Self {
        Self { runtime, readiness }
    }

    /// Build, wait for and hand a running instance to `session`, stopping it
    /// afterwards on every path.
    pub fn run<T>(
        &self,
        target: &Target,
        max_attempts: u32,
        session: impl FnOnce(&InstanceStats<'_>) -> T,
    ) -> Result<(T, SessionTimings), BenchError> {
        let started = Instant::now();
        info!("building and starting instance");
        if let Err(err) = self.runtime.build_and_start(target) {
            error!(error = %err, "instance build failed");
            // Compose may have left a partially created service behind.
            stop_instance(self.runtime, target);
            return Err(err);
        }
        let guard = InstanceGuard {
            runtime: self.runtime,
            target,
        };
        let build_ms = millis(started.elapsed());

        if !self.readiness.wait_until_ready(target.port, max_attempts) {
            let err = BenchError::ReadinessTimeout {
                port: target.port,
                attempts: max_attempts,
            };
            error!(error = %err, "instance never became ready");
            match self.runtime.logs(target) {
                Ok(logs) => warn!(logs = %logs.trim_end(), "instance logs"),
                Err(log_err) => warn!(error = %log_err, "unable to fetch instance logs"),
            }
            return Err(err);
        }

        let stats = InstanceStats::new(self.runtime, target);
        let output = session(&stats);
        drop(guard);
        Ok((
            output,
            SessionTimings {
                build_ms,
                total_ms: millis(started.elapsed()),
            },
        ))
    }
}

/// Runs every target through build, readiness, collection and teardown.
pub struct Orchestrator<'a> {
    instances: InstanceSession<'a>,
    runtime: &'a dyn InstanceRuntime,
    auditor: &'a dyn Auditor,
    load: &'a LoadGenerator,
    store: &'a ResultStore,
    options: SuiteOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        runtime: &'a dyn InstanceRuntime,
        readiness: &'a dyn ReadinessCheck,
        auditor: &'a dyn Auditor,
        load: &'a LoadGenerator,
        store: &'a ResultStore,
        options: SuiteOptions,
    ) -> Self {
        Self {
            instances: InstanceSession::new(runtime, readiness),
            runtime,
            auditor,
            load,
            store,
            options,
        }
    }

    fn collect(&self, target: &Target, stats: &InstanceStats<'_>) -> Measurements {
        let idle = ResourceSampler::new(self.options.idle_interval);
        info!(
            window_s = self.options.idle_window.as_secs(),
            "sampling idle resources"
        );
        let resources = idle.sample(stats, self.options.idle_window);

        let bundle = match inspect_staged(|dir| self.runtime.export_bundle(target, dir)) {
            Ok(bundle) => bundle,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%error, "bundle inspection failed");
                BundleSummary::failed(error)
            }
        };
        info!(
            gzipped = bundle.total_gzipped,
            files = bundle.files.len(),
            "bundle inspected"
        );

        let url = target.url();
        let audit = self.options.audit.then(|| self.auditor.audit(&url));
        let sampler = ResourceSampler::new(self.options.load_interval);
        let load_runs = self.load.stress(&url, &self.options.plan, &sampler, stats);

        Measurements {
            kind: target.kind,
            build_time: 0,
            total_time: 0,
            resources: Some(resources),
            bundle,
            audit,
            load_runs,
            finished_at: Utc::now(),
        }
    }

    pub fn run_target(&self, target: &Target) -> TargetResult {
        let span = info_span!(
            "target",
            framework = %target.name,
            port = target.port,
            service = %target.service()
        );
        let _entered = span.enter();

        match self.instances.run(target, self.options.max_attempts, |stats| {
            self.collect(target, stats)
        }) {
            Ok((mut measurements, timings)) => {
                measurements.build_time = timings.build_ms;
                measurements.total_time = timings.total_ms;
                measurements.finished_at = Utc::now();
                info!(total_ms = timings.total_ms, "target finished");
                TargetResult::measured(&target.name, measurements)
            }
            Err(err) => TargetResult::failed(&target.name, err.marker()),
        }
    }

    /// One result per target in declaration order, persisted after each.
    pub fn run_all(&self, targets: &[Target]) -> Result<Vec<TargetResult>> {
        let run = Uuid::new_v4();
        let span = info_span!("suite", run = %run, targets = targets.len());
        let _entered = span.enter();

        targets
            .iter()
            .try_fold(Vec::with_capacity(targets.len()), |mut results, target| {
                results.push(self.run_target(target));
                let path = self.store.save_suite(&results)?;
                info!(path = %path.display(), completed = results.len(), "results saved");
                Ok(results)
            })
    }
}
