use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::chrome::resolve_chrome_binary;
use super::{AuditReport, Auditor, PageMetrics, ThrottlingProfile};
use crate::config::AuditSettings;
use crate::error::BenchError;
use crate::runtime::{CommandSpec, combined_output};

/// Runs the `lighthouse` CLI and reads its JSON report from stdout.
pub struct LighthouseAuditor {
    binary: Option<PathBuf>,
    chrome: Option<PathBuf>,
    throttling: ThrottlingProfile,
    max_wait_ms: u64,
}

impl LighthouseAuditor {
    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self {
            binary: settings
                .lighthouse_binary
                .clone()
                .or_else(|| which::which("lighthouse").ok()),
            chrome: resolve_chrome_binary(settings.chrome_binary.as_ref()),
            throttling: ThrottlingProfile::from(settings),
            max_wait_ms: settings.page_timeout_secs.saturating_mul(1_000),
        }
    }

    pub fn command(&self, binary: PathBuf, url: &str) -> CommandSpec {
        let args = vec![
            url.to_string(),
            "--output=json".to_string(),
            "--output-path=stdout".to_string(),
            "--only-categories=performance".to_string(),
            "--form-factor=mobile".to_string(),
            "--throttling-method=simulate".to_string(),
            format!("--throttling.rttMs={}", self.throttling.rtt_ms),
            format!("--throttling.throughputKbps={}", self.throttling.throughput_kbps),
            format!(
                "--throttling.cpuSlowdownMultiplier={}",
                self.throttling.cpu_slowdown
            ),
            format!("--max-wait-for-load={}", self.max_wait_ms),
            "--chrome-flags=--headless --no-sandbox --disable-gpu".to_string(),
            "--quiet".to_string(),
        ];
        let spec = CommandSpec::new(binary, args);
        match &self.chrome {
            Some(chrome) => spec.with_env("CHROME_PATH", chrome.display().to_string()),
            None => spec,
        }
    }
}

impl Auditor for LighthouseAuditor {
    fn name(&self) -> &'static str {
        "lighthouse"
    }

    fn run(&self, url: &str) -> Result<AuditReport, BenchError> {
        let binary = self.binary.clone().ok_or_else(|| {
            BenchError::Audit(
                "lighthouse binary not found; install it or set audit.lighthouse_binary".into(),
            )
        })?;
        let spec = self.command(binary, url);
        debug!(command = %spec.describe(), "starting lighthouse");
        let output = spec
            .output()
            .map_err(|err| BenchError::Audit(format!("{err:#}")))?;
        if !output.status.success() {
            return Err(BenchError::Audit(format!(
                "lighthouse exited with {}: {}",
                output.status,
                combined_output(&output).trim()
            )));
        }
        parse_report(url, &String::from_utf8_lossy(&output.stdout))
    }
}

fn numeric(audits: &Value, id: &str) -> Result<f64, BenchError> {
    audits
        .get(id)
        .and_then(|audit| audit.get("numericValue"))
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .ok_or_else(|| BenchError::Audit(format!("report has no numeric value for {id}")))
}

/// Extract the performance score and core timings from a Lighthouse JSON report.
pub fn parse_report(url: &str, raw: &str) -> Result<AuditReport, BenchError> {
    let report: Value = serde_json::from_str(raw)
        .map_err(|err| BenchError::Audit(format!("malformed lighthouse report: {err}")))?;

    if let Some(message) = report
        .get("runtimeError")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
    {
        return Err(BenchError::Audit(message.to_string()));
    }

    let score = report
        .pointer("/categories/performance/score")
        .and_then(Value::as_f64)
        .ok_or_else(|| BenchError::Audit("report has no performance score".into()))?;
    let audits = report
        .get("audits")
        .ok_or_else(|| BenchError::Audit("report has no audits".into()))?;

    let metrics = PageMetrics {
        first_contentful_paint: numeric(audits, "first-contentful-paint")?,
        largest_contentful_paint: numeric(audits, "largest-contentful-paint")?,
        time_to_interactive: numeric(audits, "interactive")?,
        speed_index: Some(numeric(audits, "speed-index")?),
        total_blocking_time: numeric(audits, "total-blocking-time")?,
        cumulative_layout_shift: numeric(audits, "cumulative-layout-shift")?,
    };

    Ok(AuditReport {
        url: url.to_string(),
        timestamp: Utc::now(),
        performance_score: (score * 100.0).round().clamp(0.0, 100.0) as u32,
        metrics,
    })
}
