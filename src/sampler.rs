use std::{
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BenchError;
use crate::runtime::StatsSource;

/// One parsed stats reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub network: Option<NetworkSample>,
}

/// Cumulative network counters reported alongside a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub rx_mb: f64,
    pub tx_mb: f64,
}

/// Convert a size such as `67.5MiB`, `512kB` or `1.2 GB` to megabytes.
pub fn parse_size_mb(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw.find(|ch: char| ch.is_ascii_alphabetic())?;
    let value: f64 = raw[..split].trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let factor = match raw[split..].trim().to_ascii_lowercase().as_str() {
        "b" => 1.0 / (1024.0 * 1024.0),
        "k" | "kb" | "kib" => 1.0 / 1024.0,
        "m" | "mb" | "mib" => 1.0,
        "g" | "gb" | "gib" => 1024.0,
        _ => return None,
    };
    Some(value * factor)
}

fn parse_percent(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().strip_suffix('%')?.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

fn parse_pair(raw: &str) -> Option<(f64, f64)> {
    let (left, right) = raw.split_once('/')?;
    Some((parse_size_mb(left)?, parse_size_mb(right)?))
}

/// Parse `cpu%|used / limit|mem%[|rx / tx]`.
///
/// The network column is optional; a malformed one is ignored rather than
/// rejecting the sample.
pub fn parse_stats_line(line: &str) -> Result<Sample, BenchError> {
    let reject = |reason: &'static str| BenchError::SampleParse {
        line: line.to_string(),
        reason,
    };
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 3 {
        return Err(reject("expected at least three '|' separated fields"));
    }

    let cpu_percent = parse_percent(fields[0]).ok_or_else(|| reject("invalid cpu percentage"))?;
    let used = fields[1]
        .split('/')
        .next()
        .ok_or_else(|| reject("missing memory usage"))?;
    let memory_mb = parse_size_mb(used).ok_or_else(|| reject("invalid memory usage"))?;
    let memory_percent =
        parse_percent(fields[2]).ok_or_else(|| reject("invalid memory percentage"))?;
    let network = fields
        .get(3)
        .and_then(|raw| parse_pair(raw))
        .map(|(rx_mb, tx_mb)| NetworkSample { rx_mb, tx_mb });

    Ok(Sample {
        cpu_percent,
        memory_mb,
        memory_percent,
        network,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSummary {
    pub average: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    #[serde(rename = "averageMB")]
    pub average_mb: f64,
    #[serde(rename = "maxMB")]
    pub max_mb: f64,
    #[serde(rename = "averagePercent")]
    pub average_percent: f64,
    #[serde(rename = "maxPercent")]
    pub max_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    #[serde(rename = "totalRxMB")]
    pub total_rx_mb: f64,
    #[serde(rename = "totalTxMB")]
    pub total_tx_mb: f64,
}

/// Average and peak resource usage over a sampling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub samples: usize,
    pub cpu: CpuSummary,
    pub memory: MemorySummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSummary>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn peak(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, f64::max)
}

impl ResourceSummary {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let network_samples: Vec<NetworkSample> =
            samples.iter().filter_map(|sample| sample.network).collect();
        let network = (!network_samples.is_empty()).then(|| NetworkSummary {
            total_rx_mb: peak(network_samples.iter().map(|net| net.rx_mb)),
            total_tx_mb: peak(network_samples.iter().map(|net| net.tx_mb)),
        });

        Self {
            samples: samples.len(),
            cpu: CpuSummary {
                average: mean(samples.iter().map(|s| s.cpu_percent)),
                max: peak(samples.iter().map(|s| s.cpu_percent)),
            },
            memory: MemorySummary {
                average_mb: mean(samples.iter().map(|s| s.memory_mb)),
                max_mb: peak(samples.iter().map(|s| s.memory_mb)),
                average_percent: mean(samples.iter().map(|s| s.memory_percent)),
                max_percent: peak(samples.iter().map(|s| s.memory_percent)),
            },
            network,
        }
    }
}

/// Fixed-interval stats collector.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSampler {
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of readings taken for `window`, never less than one.
    pub fn ticks_for(&self, window: Duration) -> u64 {
        let window_ms = window.as_millis();
        let interval_ms = self.interval.as_millis().max(1);
        window_ms.div_ceil(interval_ms).max(1) as u64
    }

    /// Read stats once per interval until `window` has elapsed or the tick
    /// budget is spent, whichever comes first. Slow queries shorten the pass
    /// rather than stretching it past the window; the first reading is always
    /// taken.
    pub fn sample(&self, source: &dyn StatsSource, window: Duration) -> ResourceSummary {
        let ticks = self.ticks_for(window);
        let deadline = Instant::now() + window;
        let mut samples = Vec::with_capacity(ticks as usize);

        for tick in 1..=ticks {
            if tick > 1 && Instant::now() >= deadline {
                debug!(tick, ticks, "sampling window elapsed");
                break;
            }
            let started = Instant::now();
            match source.query_stats() {
                Ok(line) => match parse_stats_line(&line) {
                    Ok(sample) => samples.push(sample),
                    Err(err) => debug!(error = %err, "dropping stats sample"),
                },
                Err(err) => debug!(error = %err, "stats query failed"),
            }
            if tick % 5 == 0 {
                debug!(tick, ticks, collected = samples.len(), "sampling resources");
            }
            let pause = self
                .interval
                .saturating_sub(started.elapsed())
                .min(deadline.saturating_duration_since(Instant::now()));
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        ResourceSummary::from_samples(&samples)
    }
}
