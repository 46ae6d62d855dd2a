use std::{env, path::PathBuf, time::Duration};

use chrono::Utc;
use headless_chrome::{Browser, LaunchOptions, protocol::cdp::Emulation};
use serde::Deserialize;
use tracing::debug;

use super::scoring::performance_score;
use super::{AuditReport, Auditor, PageMetrics, ThrottlingProfile};
use crate::config::AuditSettings;
use crate::error::BenchError;

/// Overrides Chromium discovery for browser audits.
pub const CHROME_BINARY_ENV: &str = "FRAMEBENCH_CHROME_BINARY";

/// Moto G Power sized viewport used by mobile audits.
const VIEWPORT: (u32, u32) = (412, 823);
const PARALLEL_CONNECTIONS: f64 = 6.0;
/// TCP handshake plus the first request.
const CONNECTION_SETUP_RTTS: f64 = 2.0;
const LONG_TASK_BUDGET_MS: f64 = 50.0;

pub fn resolve_chrome_binary(configured: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return Some(path.clone());
    }
    if let Ok(path) = env::var(CHROME_BINARY_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let candidates = [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
    ];
    candidates
        .into_iter()
        .find_map(|candidate| which::which(candidate).ok())
}

/// Audits a page in a fresh headless Chromium. The CPU slowdown is applied
/// through DevTools emulation; network cost is modelled from the resource
/// timings the page reports. Speed index is not measured by this backend.
pub struct ChromeAuditor {
    binary: Option<PathBuf>,
    throttling: ThrottlingProfile,
    page_timeout: Duration,
    settle: Duration,
}

impl ChromeAuditor {
    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self {
            binary: resolve_chrome_binary(settings.chrome_binary.as_ref()),
            throttling: ThrottlingProfile::from(settings),
            page_timeout: settings.page_timeout(),
            settle: Duration::from_millis(settings.settle_ms),
        }
    }

    fn collect_timeline(&self, url: &str) -> Result<PageTimeline, BenchError> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .path(self.binary.clone())
            .window_size(Some(VIEWPORT))
            .idle_browser_timeout(self.page_timeout + self.settle + Duration::from_secs(30))
            .build()
            .map_err(|err| BenchError::Audit(format!("invalid browser options: {err}")))?;

        // Dropping the browser tears the process down on every path.
        let browser = Browser::new(options)
            .map_err(|err| BenchError::Audit(format!("failed to launch chromium: {err}")))?;
        let tab = browser
            .new_tab()
            .map_err(|err| BenchError::Audit(format!("failed to open tab: {err}")))?;
        tab.set_default_timeout(self.page_timeout);
        tab.call_method(cpu_throttling(&self.throttling))
            .map_err(|err| BenchError::Audit(format!("failed to throttle cpu: {err}")))?;
        tab.navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(|err| BenchError::Audit(format!("navigation to {url} failed: {err}")))?;

        let script = TIMELINE_SCRIPT.replace("__SETTLE_MS__", &self.settle.as_millis().to_string());
        let evaluated = tab
            .evaluate(&script, true)
            .map_err(|err| BenchError::Audit(format!("timeline collection failed: {err}")))?;
        let raw = evaluated
            .value
            .as_ref()
            .and_then(|value| value.as_str())
            .ok_or_else(|| BenchError::Audit("page returned no timeline".into()))?;
        debug!(timeline = %raw, "collected page timeline");
        serde_json::from_str(raw)
            .map_err(|err| BenchError::Audit(format!("malformed page timeline: {err}")))
    }
}

impl Auditor for ChromeAuditor {
    fn name(&self) -> &'static str {
        "chrome"
    }

    fn run(&self, url: &str) -> Result<AuditReport, BenchError> {
        let timeline = self.collect_timeline(url)?;
        let metrics = timeline.with_network_cost(&self.throttling)?;
        Ok(AuditReport {
            url: url.to_string(),
            timestamp: Utc::now(),
            performance_score: performance_score(&metrics),
            metrics,
        })
    }
}

fn cpu_throttling(throttling: &ThrottlingProfile) -> Emulation::SetCPUThrottlingRate {
    Emulation::SetCPUThrottlingRate {
        rate: throttling.cpu_slowdown.max(1.0),
    }
}

const TIMELINE_SCRIPT: &str = r#"
new Promise((resolve) => {
  const state = { lcp: null, cls: 0, longTasks: [] };
  const observe = (type, handle) => {
    try {
      new PerformanceObserver((list) => list.getEntries().forEach(handle))
        .observe({ type, buffered: true });
    } catch (_) {}
  };
  observe('largest-contentful-paint', (entry) => { state.lcp = entry.startTime; });
  observe('layout-shift', (entry) => { if (!entry.hadRecentInput) state.cls += entry.value; });
  observe('longtask', (entry) => {
    state.longTasks.push({ start: entry.startTime, duration: entry.duration });
  });
  setTimeout(() => {
    const nav = performance.getEntriesByType('navigation')[0] || {};
    const fcp = performance.getEntriesByType('paint')
      .find((entry) => entry.name === 'first-contentful-paint');
    const size = (entry) => entry.transferSize || entry.encodedBodySize || 0;
    resolve(JSON.stringify({
      fcp: fcp ? fcp.startTime : null,
      lcp: state.lcp,
      cls: state.cls,
      longTasks: state.longTasks,
      domContentLoaded: nav.domContentLoadedEventEnd || 0,
      document: { end: nav.responseEnd || 0, bytes: size(nav) },
      resources: performance.getEntriesByType('resource')
        .map((entry) => ({ end: entry.responseEnd, bytes: size(entry) })),
    }));
  }, __SETTLE_MS__);
})
"#;

#[derive(Debug, Clone, Copy, Deserialize)]
struct LongTask {
    start: f64,
    duration: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ResourceTiming {
    end: f64,
    bytes: f64,
}

/// Timings observed in the page under CPU emulation, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageTimeline {
    fcp: Option<f64>,
    lcp: Option<f64>,
    #[serde(default)]
    cls: f64,
    #[serde(default)]
    long_tasks: Vec<LongTask>,
    #[serde(default)]
    dom_content_loaded: f64,
    document: ResourceTiming,
    #[serde(default)]
    resources: Vec<ResourceTiming>,
}

impl PageTimeline {
    /// Network cost of every request finished by `at`.
    fn network_delay(&self, at: f64, throttling: &ThrottlingProfile) -> f64 {
        let finished = std::iter::once(&self.document)
            .chain(self.resources.iter())
            .filter(|request| request.end <= at);
        let (count, bytes) = finished.fold((0usize, 0.0), |(count, bytes), request| {
            (count + 1, bytes + request.bytes.max(0.0))
        });
        if count == 0 {
            return 0.0;
        }
        let waves = ((count - 1) as f64 / PARALLEL_CONNECTIONS).ceil();
        let round_trips = (CONNECTION_SETUP_RTTS + waves) * throttling.rtt_ms;
        let transfer = if throttling.throughput_kbps > 0.0 {
            bytes * 8.0 / throttling.throughput_kbps
        } else {
            0.0
        };
        round_trips + transfer
    }

    fn throttled(&self, at: f64, throttling: &ThrottlingProfile) -> f64 {
        at + self.network_delay(at, throttling)
    }

    fn with_network_cost(&self, throttling: &ThrottlingProfile) -> Result<PageMetrics, BenchError> {
        let fcp = self
            .fcp
            .filter(|value| value.is_finite())
            .ok_or_else(|| BenchError::Audit("the page did not paint any content".into()))?;
        let lcp = self.lcp.filter(|value| value.is_finite()).unwrap_or(fcp).max(fcp);
        let interactive = self
            .long_tasks
            .iter()
            .map(|task| task.start + task.duration)
            .fold(self.dom_content_loaded.max(fcp), f64::max);

        let total_blocking_time = self
            .long_tasks
            .iter()
            .filter(|task| task.start >= fcp && task.start < interactive)
            .map(|task| (task.duration - LONG_TASK_BUDGET_MS).max(0.0))
            .sum();

        let metrics = PageMetrics {
            first_contentful_paint: self.throttled(fcp, throttling),
            largest_contentful_paint: self.throttled(lcp, throttling),
            time_to_interactive: self.throttled(interactive, throttling),
            speed_index: None,
            total_blocking_time,
            cumulative_layout_shift: self.cls.max(0.0),
        };
        if !metrics.is_finite() {
            return Err(BenchError::Audit("page timeline produced non-finite metrics".into()));
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline() -> PageTimeline {
        serde_json::from_str(
            r#"{
                "fcp": 120.0,
                "lcp": 300.0,
                "cls": 0.01,
                "longTasks": [
                    { "start": 50.0, "duration": 40.0 },
                    { "start": 200.0, "duration": 80.0 }
                ],
                "domContentLoaded": 250.0,
                "document": { "end": 20.0, "bytes": 2048 },
                "resources": [
                    { "end": 90.0, "bytes": 102400 },
                    { "end": 280.0, "bytes": 204800 }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn network_cost_is_added_to_observed_timings() {
        let throttling = ThrottlingProfile::default();
        let metrics = timeline().with_network_cost(&throttling).unwrap();

        // fcp: 2 requests finished, one wave.
        let transfer = (2048.0 + 102_400.0) * 8.0 / 1_638.4;
        let expected_fcp = 120.0 + 3.0 * 150.0 + transfer;
        assert!((metrics.first_contentful_paint - expected_fcp).abs() < 1e-6);

        assert!(metrics.largest_contentful_paint > metrics.first_contentful_paint);
        assert!(metrics.time_to_interactive >= metrics.first_contentful_paint);
        // Long tasks were measured under emulation; only the one after fcp blocks.
        assert_eq!(metrics.total_blocking_time, 30.0);
        assert_eq!(metrics.cumulative_layout_shift, 0.01);
    }

    #[test]
    fn speed_index_is_left_unmeasured() {
        let metrics = timeline()
            .with_network_cost(&ThrottlingProfile::default())
            .unwrap();
        assert_eq!(metrics.speed_index, None);
        let value = serde_json::to_value(metrics).unwrap();
        assert!(value.get("speedIndex").is_none());
    }

    #[test]
    fn cpu_slowdown_is_emulated_in_the_browser() {
        assert_eq!(cpu_throttling(&ThrottlingProfile::default()).rate, 4.0);
        let unthrottled = ThrottlingProfile {
            cpu_slowdown: 0.5,
            ..ThrottlingProfile::default()
        };
        assert_eq!(cpu_throttling(&unthrottled).rate, 1.0);

        // The slowdown is not applied a second time to the observed timeline.
        let slow = ThrottlingProfile {
            cpu_slowdown: 8.0,
            ..ThrottlingProfile::default()
        };
        assert_eq!(
            timeline().with_network_cost(&slow).unwrap(),
            timeline()
                .with_network_cost(&ThrottlingProfile::default())
                .unwrap()
        );
    }

    #[test]
    fn unthrottled_profile_keeps_observed_timings() {
        let throttling = ThrottlingProfile {
            rtt_ms: 0.0,
            throughput_kbps: 0.0,
            cpu_slowdown: 1.0,
        };
        let metrics = timeline().with_network_cost(&throttling).unwrap();
        assert_eq!(metrics.first_contentful_paint, 120.0);
        assert_eq!(metrics.largest_contentful_paint, 300.0);
        assert_eq!(metrics.total_blocking_time, 30.0);
    }

    #[test]
    fn missing_paint_fails_the_audit() {
        let mut page = timeline();
        page.fcp = None;
        let err = page
            .with_network_cost(&ThrottlingProfile::default())
            .unwrap_err();
        assert!(err.to_string().contains("did not paint"));
    }

    #[test]
    fn configured_binary_wins() {
        let configured = PathBuf::from("/opt/chromium/chrome");
        assert_eq!(
            resolve_chrome_binary(Some(&configured)),
            Some(configured.clone())
        );
    }
}
