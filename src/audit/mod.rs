pub mod chrome;
pub mod lighthouse;
pub mod scoring;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AuditBackend, AuditSettings};
use crate::error::BenchError;

pub use chrome::ChromeAuditor;
pub use lighthouse::LighthouseAuditor;

/// Network and CPU throttling applied to every audit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlingProfile {
    pub rtt_ms: f64,
    pub throughput_kbps: f64,
    pub cpu_slowdown: f64,
}

impl Default for ThrottlingProfile {
    fn default() -> Self {
        Self {
            rtt_ms: 150.0,
            throughput_kbps: 1_638.4,
            cpu_slowdown: 4.0,
        }
    }
}

impl From<&AuditSettings> for ThrottlingProfile {
    fn from(settings: &AuditSettings) -> Self {
        Self {
            rtt_ms: settings.rtt_ms,
            throughput_kbps: settings.throughput_kbps,
            cpu_slowdown: settings.cpu_slowdown.max(1.0),
        }
    }
}

/// Page-load timings in milliseconds; layout shift is unitless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetrics {
    pub first_contentful_paint: f64,
    pub largest_contentful_paint: f64,
    pub time_to_interactive: f64,
    /// Only reported by backends that record visual progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_index: Option<f64>,
    pub total_blocking_time: f64,
    pub cumulative_layout_shift: f64,
}

impl PageMetrics {
    pub fn is_finite(&self) -> bool {
        [
            self.first_contentful_paint,
            self.largest_contentful_paint,
            self.time_to_interactive,
            self.total_blocking_time,
            self.cumulative_layout_shift,
        ]
        .iter()
        .all(|value| value.is_finite())
            && self.speed_index.is_none_or(f64::is_finite)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub performance_score: u32,
    pub metrics: PageMetrics,
}

/// Outcome of one audit; failures are kept so reports can show them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditResult {
    Failed {
        url: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    Completed(AuditReport),
}

impl AuditResult {
    pub fn failed(url: &str, error: impl fmt::Display) -> Self {
        AuditResult::Failed {
            url: url.to_string(),
            timestamp: Utc::now(),
            error: error.to_string(),
        }
    }

    pub fn report(&self) -> Option<&AuditReport> {
        match self {
            AuditResult::Completed(report) => Some(report),
            AuditResult::Failed { .. } => None,
        }
    }

    pub fn performance_score(&self) -> Option<u32> {
        self.report().map(|report| report.performance_score)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AuditResult::Failed { error, .. } => Some(error),
            AuditResult::Completed(_) => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            AuditResult::Failed { url, .. } => url,
            AuditResult::Completed(report) => &report.url,
        }
    }
}

/// A throttled page-load audit backend.
pub trait Auditor: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, url: &str) -> Result<AuditReport, BenchError>;

    fn audit(&self, url: &str) -> AuditResult {
        info!(auditor = self.name(), %url, "running browser audit");
        match self.run(url) {
            Ok(report) => {
                info!(
                    score = report.performance_score,
                    fcp_ms = report.metrics.first_contentful_paint,
                    lcp_ms = report.metrics.largest_contentful_paint,
                    "audit finished"
                );
                AuditResult::Completed(report)
            }
            Err(err) => {
                warn!(auditor = self.name(), %url, error = %err, "audit failed");
                AuditResult::failed(url, err)
            }
        }
    }
}

pub fn auditor_from_settings(settings: &AuditSettings) -> Box<dyn Auditor> {
    match settings.backend {
        AuditBackend::Chrome => Box::new(ChromeAuditor::from_settings(settings)),
        AuditBackend::Lighthouse => Box::new(LighthouseAuditor::from_settings(settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Auditor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _url: &str) -> Result<AuditReport, BenchError> {
            Err(BenchError::Audit("browser crashed".into()))
        }
    }

    #[test]
    fn failures_become_tagged_results() {
        let result = Failing.audit("http://localhost:3006");
        assert_eq!(result.url(), "http://localhost:3006");
        assert_eq!(result.performance_score(), None);
        assert_eq!(result.error(), Some("audit failed: browser crashed"));

        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("error").is_some());
        assert!(value.get("performanceScore").is_none());
    }

    #[test]
    fn completed_results_round_trip_as_completed() {
        let result = AuditResult::Completed(AuditReport {
            url: "http://localhost:3001".into(),
            timestamp: Utc::now(),
            performance_score: 87,
            metrics: PageMetrics {
                first_contentful_paint: 1_520.0,
                ..PageMetrics::default()
            },
        });
        let raw = serde_json::to_string(&result).unwrap();
        assert!(raw.contains("\"firstContentfulPaint\":1520.0"));
        let back: AuditResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.performance_score(), Some(87));
    }

    #[test]
    fn throttling_follows_settings() {
        let profile = ThrottlingProfile::from(&AuditSettings::default());
        assert_eq!(profile, ThrottlingProfile::default());
    }
}
