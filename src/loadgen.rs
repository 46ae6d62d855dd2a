use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Runtime, sync::mpsc};
use tracing::{info, warn};
use url::Url;

use crate::error::BenchError;
use crate::runtime::StatsSource;
use crate::sampler::{ResourceSampler, ResourceSummary};

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub average: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStats {
    pub requests_per_second_avg: f64,
    pub total_requests: u64,
    pub bytes_per_second: f64,
    pub latency: LatencyPercentiles,
    pub error_count: u64,
    #[serde(rename = "non2xxCount")]
    pub non2xx_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadOutcome {
    Failed { error: String },
    Completed(LoadStats),
}

/// One load-generator execution at a fixed concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRun {
    pub concurrency: u32,
    pub duration_seconds: u64,
    #[serde(flatten)]
    pub outcome: LoadOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSummary>,
}

impl LoadRun {
    pub fn stats(&self) -> Option<&LoadStats> {
        match &self.outcome {
            LoadOutcome::Completed(stats) => Some(stats),
            LoadOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            LoadOutcome::Failed { error } => Some(error),
            LoadOutcome::Completed(_) => None,
        }
    }
}

/// Completed run with the highest average throughput; the first one wins ties.
pub fn peak_run(runs: &[LoadRun]) -> Option<&LoadRun> {
    runs.iter()
        .filter_map(|run| run.stats().map(|stats| (run, stats.requests_per_second_avg)))
        .fold(None, |best: Option<(&LoadRun, f64)>, (run, rps)| match best {
            Some((_, best_rps)) if rps <= best_rps => best,
            _ => Some((run, rps)),
        })
        .map(|(run, _)| run)
}

/// Ascending concurrency levels run back to back.
#[derive(Debug, Clone)]
pub struct StressPlan {
    levels: Vec<u32>,
    duration: Duration,
    cooldown: Duration,
}

impl StressPlan {
    pub fn new(levels: &[u32], duration: Duration, cooldown: Duration) -> Self {
        let mut levels: Vec<u32> = levels.iter().copied().filter(|level| *level > 0).collect();
        levels.sort_unstable();
        levels.dedup();
        Self {
            levels,
            duration,
            cooldown,
        }
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Latencies buffered between the workers and the recorder.
const LATENCY_CHANNEL_CAPACITY: usize = 8_192;

#[derive(Debug, Default)]
struct WorkerTally {
    responses: u64,
    bytes: u64,
    errors: u64,
    non2xx: u64,
}

/// Microsecond histogram covering latencies up to the request timeout.
fn new_histogram(request_timeout: Duration) -> Result<Histogram<u64>, BenchError> {
    let highest = u64::try_from(request_timeout.as_micros())
        .unwrap_or(u64::MAX)
        .max(2);
    Histogram::new_with_bounds(1, highest, 3)
        .map_err(|err| BenchError::LoadGenerator(format!("histogram setup failed: {err}")))
}

/// HTTP load generator over keep-alive connections.
pub struct LoadGenerator {
    runtime: Runtime,
    request_timeout: Duration,
}

impl LoadGenerator {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("framebench-load")
            .build()
            .context("failed to start load generator runtime")?;
        Ok(Self {
            runtime,
            request_timeout,
        })
    }

    /// Hammer `url` with `concurrency` workers for `duration`.
    pub fn load_test(
        &self,
        url: &str,
        concurrency: u32,
        duration: Duration,
    ) -> Result<LoadStats, BenchError> {
        if concurrency == 0 {
            return Err(BenchError::LoadGenerator(
                "concurrency must be at least 1".into(),
            ));
        }
        let url = Url::parse(url)
            .map_err(|err| BenchError::LoadGenerator(format!("invalid url {url}: {err}")))?;
        self.runtime
            .block_on(drive(url, concurrency, duration, self.request_timeout))
    }

    /// Run every level of `plan`, sampling resources alongside each run.
    pub fn stress(
        &self,
        url: &str,
        plan: &StressPlan,
        sampler: &ResourceSampler,
        stats: &dyn StatsSource,
    ) -> Vec<LoadRun> {
        let mut runs = Vec::with_capacity(plan.levels.len());
        for (index, &concurrency) in plan.levels.iter().enumerate() {
            if index > 0 && !plan.cooldown.is_zero() {
                thread::sleep(plan.cooldown);
            }
            info!(concurrency, duration_s = plan.duration.as_secs(), "starting load run");

            let (result, resources) = thread::scope(|scope| {
                let sampling = scope.spawn(|| sampler.sample(stats, plan.duration));
                let result = self.load_test(url, concurrency, plan.duration);
                (result, sampling.join().ok())
            });

            let outcome = match result {
                Ok(stats) => {
                    info!(
                        concurrency,
                        rps = stats.requests_per_second_avg,
                        p99_ms = stats.latency.p99,
                        errors = stats.error_count,
                        non2xx = stats.non2xx_count,
                        "load run finished"
                    );
                    LoadOutcome::Completed(stats)
                }
                Err(err) => {
                    warn!(concurrency, error = %err, "load run failed");
                    LoadOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            runs.push(LoadRun {
                concurrency,
                duration_seconds: plan.duration.as_secs(),
                outcome,
                resources,
            });
        }
        runs
    }
}

async fn drive(
    url: Url,
    concurrency: u32,
    duration: Duration,
    request_timeout: Duration,
) -> Result<LoadStats, BenchError> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(concurrency as usize)
        .timeout(request_timeout)
        .no_proxy()
        .build()
        .map_err(|err| BenchError::LoadGenerator(format!("client setup failed: {err}")))?;

    // A single recorder owns the histogram; workers only send latencies.
    let (latencies, mut received) = mpsc::channel::<u64>(LATENCY_CHANNEL_CAPACITY);
    let mut histogram = new_histogram(request_timeout)?;
    let recorder = tokio::spawn(async move {
        while let Some(micros) = received.recv().await {
            histogram.saturating_record(micros.max(1));
        }
        histogram
    });

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + duration;
    let workers: Vec<_> = (0..concurrency)
        .map(|_| tokio::spawn(worker(client.clone(), url.clone(), deadline, latencies.clone())))
        .collect();
    drop(latencies);

    let mut totals = WorkerTally::default();
    for joined in join_all(workers).await {
        let tally = joined
            .map_err(|err| BenchError::LoadGenerator(format!("worker aborted: {err}")))?;
        totals.responses += tally.responses;
        totals.bytes += tally.bytes;
        totals.errors += tally.errors;
        totals.non2xx += tally.non2xx;
    }
    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let histogram = recorder
        .await
        .map_err(|err| BenchError::LoadGenerator(format!("latency recorder aborted: {err}")))?;

    let millis = |micros: u64| micros as f64 / 1000.0;
    let latency = if histogram.is_empty() {
        LatencyPercentiles::default()
    } else {
        LatencyPercentiles {
            average: histogram.mean() / 1000.0,
            p50: millis(histogram.value_at_quantile(0.50)),
            p90: millis(histogram.value_at_quantile(0.90)),
            p99: millis(histogram.value_at_quantile(0.99)),
            max: millis(histogram.max()),
        }
    };

    Ok(LoadStats {
        requests_per_second_avg: totals.responses as f64 / elapsed,
        total_requests: totals.responses,
        bytes_per_second: totals.bytes as f64 / elapsed,
        latency,
        error_count: totals.errors,
        non2xx_count: totals.non2xx,
    })
}

async fn worker(
    client: reqwest::Client,
    url: Url,
    deadline: tokio::time::Instant,
    latencies: mpsc::Sender<u64>,
) -> WorkerTally {
    let mut tally = WorkerTally::default();

    while tokio::time::Instant::now() < deadline {
        let sent = Instant::now();
        match client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                match response.bytes().await {
                    Ok(body) => {
                        let micros = u64::try_from(sent.elapsed().as_micros()).unwrap_or(u64::MAX);
                        // The recorder only stops once every sender is gone.
                        let _ = latencies.send(micros).await;
                        tally.responses += 1;
                        tally.bytes += body.len() as u64;
                        if !status.is_success() {
                            tally.non2xx += 1;
                        }
                    }
                    Err(_) => tally.errors += 1,
                }
            }
            Err(_) => {
                tally.errors += 1;
                tokio::task::yield_now().await;
            }
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::tests::ScriptedSource;
    use crate::test_support::{TestServer, unused_port};
    use axum::http::StatusCode;

    fn completed(concurrency: u32, rps: f64) -> LoadRun {
        LoadRun {
            concurrency,
            duration_seconds: 30,
            outcome: LoadOutcome::Completed(LoadStats {
                requests_per_second_avg: rps,
                total_requests: (rps * 30.0) as u64,
                bytes_per_second: 0.0,
                latency: LatencyPercentiles::default(),
                error_count: 0,
                non2xx_count: 0,
            }),
            resources: None,
        }
    }

    fn failed(concurrency: u32) -> LoadRun {
        LoadRun {
            concurrency,
            duration_seconds: 30,
            outcome: LoadOutcome::Failed {
                error: "connection refused".into(),
            },
            resources: Some(ResourceSummary::default()),
        }
    }

    #[test]
    fn peak_is_highest_throughput_not_highest_concurrency() {
        let runs = vec![
            completed(100, 120.0),
            completed(500, 980.0),
            failed(1000),
            completed(2000, 540.0),
        ];
        assert_eq!(peak_run(&runs).unwrap().concurrency, 500);
    }

    #[test]
    fn peak_ties_keep_first_run() {
        let runs = vec![completed(100, 700.0), completed(500, 700.0)];
        assert_eq!(peak_run(&runs).unwrap().concurrency, 100);
        assert!(peak_run(&[failed(100)]).is_none());
        assert!(peak_run(&[]).is_none());
    }

    #[test]
    fn failed_run_serialises_error_and_resources() {
        let value = serde_json::to_value(failed(2000)).unwrap();
        assert_eq!(value["concurrency"], 2000);
        assert_eq!(value["durationSeconds"], 30);
        assert_eq!(value["error"], "connection refused");
        assert!(value.get("requestsPerSecondAvg").is_none());
        assert_eq!(value["resources"]["samples"], 0);

        let back: LoadRun = serde_json::from_value(value).unwrap();
        assert_eq!(back.error(), Some("connection refused"));
    }

    #[test]
    fn plan_sorts_and_dedups_levels() {
        let plan = StressPlan::new(
            &[2000, 100, 500, 0, 100],
            Duration::from_secs(1),
            Duration::ZERO,
        );
        assert_eq!(plan.levels(), [100, 500, 2000]);
    }

    #[test]
    fn load_test_reports_throughput_against_local_server() {
        let server = TestServer::start();
        let generator = LoadGenerator::new(Duration::from_secs(2)).unwrap();

        let stats = generator
            .load_test(&server.url(), 4, Duration::from_millis(300))
            .unwrap();

        assert!(stats.total_requests > 0);
        assert!(stats.requests_per_second_avg > 0.0);
        assert!(stats.bytes_per_second > 0.0);
        assert_eq!(stats.non2xx_count, 0);
        assert!(stats.latency.p50 <= stats.latency.p99);
        assert!(stats.latency.p99 <= stats.latency.max);
    }

    #[test]
    fn error_statuses_count_as_non2xx() {
        let server = TestServer::start_with_status(StatusCode::INTERNAL_SERVER_ERROR);
        let generator = LoadGenerator::new(Duration::from_secs(2)).unwrap();

        let stats = generator
            .load_test(&server.url(), 2, Duration::from_millis(200))
            .unwrap();

        assert!(stats.total_requests > 0);
        assert_eq!(stats.non2xx_count, stats.total_requests);
    }

    #[test]
    fn refused_connections_count_as_errors() {
        let generator = LoadGenerator::new(Duration::from_millis(500)).unwrap();
        let url = format!("http://127.0.0.1:{}/", unused_port());

        let stats = generator
            .load_test(&url, 2, Duration::from_millis(100))
            .unwrap();

        assert_eq!(stats.total_requests, 0);
        assert!(stats.error_count > 0);
    }

    #[test]
    fn invalid_input_is_a_generator_error() {
        let generator = LoadGenerator::new(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            generator.load_test("not a url", 1, Duration::from_millis(10)),
            Err(BenchError::LoadGenerator(_))
        ));
        assert!(matches!(
            generator.load_test("http://127.0.0.1:1/", 0, Duration::from_millis(10)),
            Err(BenchError::LoadGenerator(_))
        ));
    }

    #[test]
    fn stress_runs_levels_in_order_with_resources() {
        let server = TestServer::start();
        let generator = LoadGenerator::new(Duration::from_secs(2)).unwrap();
        let plan = StressPlan::new(&[3, 1], Duration::from_millis(150), Duration::from_millis(10));
        let sampler = ResourceSampler::new(Duration::from_millis(50));
        let source = ScriptedSource::repeating("50%|100MiB / 1GiB|9.8%");

        let runs = generator.stress(&server.url(), &plan, &sampler, &source);

        let levels: Vec<u32> = runs.iter().map(|run| run.concurrency).collect();
        assert_eq!(levels, [1, 3]);
        for run in &runs {
            assert!(run.stats().is_some());
            let resources = run.resources.as_ref().unwrap();
            assert!((2..=3).contains(&resources.samples));
            assert_eq!(resources.cpu.max, 50.0);
        }
    }

    #[test]
    fn latency_histogram_is_bounded_by_request_timeout() {
        let histogram = new_histogram(Duration::from_secs(10)).unwrap();
        assert!(histogram.high() >= 10_000_000);
        let counts_bytes = histogram.distinct_values() * std::mem::size_of::<u64>();
        assert!(counts_bytes < 160 * 1024, "{counts_bytes} bytes");

        let mut tiny = new_histogram(Duration::ZERO).unwrap();
        tiny.saturating_record(5_000_000);
        assert_eq!(tiny.len(), 1);
    }

    #[test]
    fn high_concurrency_shares_one_recorder() {
        let server = TestServer::start();
        let generator = LoadGenerator::new(Duration::from_secs(2)).unwrap();

        let stats = generator
            .load_test(&server.url(), 64, Duration::from_millis(300))
            .unwrap();

        assert!(stats.total_requests > 0);
        assert!(stats.latency.max > 0.0);
        assert!(stats.latency.p50 <= stats.latency.max);
    }
}
