use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::audit::AuditResult;
use crate::loadgen::LoadRun;
use crate::results::TargetResult;
use crate::sampler::ResourceSummary;

pub const SUMMARY_FILE: &str = "SUMMARY.md";
pub const DETAIL_FILE: &str = "RESULTS.md";

const NA: &str = "N/A";

/// The two rendered Markdown documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub summary_markdown: String,
    pub detail_markdown: String,
}

/// `0 Bytes`, `512 Bytes`, `1.5 KB`, `2.25 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    const UNITS: [&str; 3] = ["Bytes", "KB", "MB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

/// Rounds and groups thousands with commas.
pub fn format_number(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{}", rounded.abs() as u64);
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

fn format_ms(value: f64) -> String {
    format!("{}ms", value.round() as i64)
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn or_na<T>(value: Option<T>, render: impl FnOnce(T) -> String) -> String {
    value.map(render).unwrap_or_else(|| NA.to_string())
}

/// Stable ranking; entries without a key keep their relative order at the end.
fn rank<'a, K>(
    results: &'a [TargetResult],
    key: impl Fn(&TargetResult) -> Option<K>,
    order: impl Fn(&K, &K) -> Ordering,
) -> Vec<&'a TargetResult> {
    let mut ranked: Vec<(&TargetResult, Option<K>)> =
        results.iter().map(|result| (result, key(result))).collect();
    ranked.sort_by(|(_, a), (_, b)| match (a, b) {
        (Some(a), Some(b)) => order(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    ranked.into_iter().map(|(result, _)| result).collect()
}

fn by_bundle(results: &[TargetResult]) -> Vec<&TargetResult> {
    rank(results, TargetResult::gzipped_size, |a, b| a.cmp(b))
}

fn by_score(results: &[TargetResult]) -> Vec<&TargetResult> {
    rank(results, TargetResult::performance_score, |a, b| b.cmp(a))
}

fn by_throughput(results: &[TargetResult]) -> Vec<&TargetResult> {
    rank(results, TargetResult::peak_requests_per_second, |a, b| {
        b.partial_cmp(a).unwrap_or(Ordering::Equal)
    })
}

fn last_updated(results: &[TargetResult]) -> String {
    or_na(results.iter().filter_map(TargetResult::finished_at).max(), |at| {
        at.format("%Y-%m-%d").to_string()
    })
}

fn load_runs(result: &TargetResult) -> &[LoadRun] {
    result
        .measurements()
        .map(|m| m.load_runs.as_slice())
        .unwrap_or(&[])
}

fn total_errors(result: &TargetResult) -> u64 {
    load_runs(result)
        .iter()
        .filter_map(LoadRun::stats)
        .map(|stats| stats.error_count)
        .sum()
}

fn total_non2xx(result: &TargetResult) -> u64 {
    load_runs(result)
        .iter()
        .filter_map(LoadRun::stats)
        .map(|stats| stats.non2xx_count)
        .sum()
}

fn audit_of(result: &TargetResult) -> Option<&AuditResult> {
    result.measurements()?.audit.as_ref()
}

fn gzipped_cell(result: &TargetResult) -> String {
    or_na(result.gzipped_size(), format_bytes)
}

fn total_size_cell(result: &TargetResult) -> String {
    or_na(
        result
            .measurements()
            .filter(|m| !m.bundle.is_empty())
            .map(|m| m.bundle.total_size()),
        format_bytes,
    )
}

fn score_cell(result: &TargetResult) -> String {
    or_na(result.performance_score(), |score| format!("{score}/100"))
}

fn timing_cells(result: &TargetResult) -> [String; 3] {
    match audit_of(result).and_then(AuditResult::report) {
        Some(report) => [
            format_ms(report.metrics.first_contentful_paint),
            format_ms(report.metrics.largest_contentful_paint),
            format_ms(report.metrics.time_to_interactive),
        ],
        None => [NA.to_string(), NA.to_string(), NA.to_string()],
    }
}

fn latency_cells(run: Option<&LoadRun>) -> [String; 3] {
    match run.and_then(LoadRun::stats) {
        Some(stats) => [
            format_ms(stats.latency.p50),
            format_ms(stats.latency.p90),
            format_ms(stats.latency.p99),
        ],
        None => [NA.to_string(), NA.to_string(), NA.to_string()],
    }
}

fn peak_cell(result: &TargetResult) -> String {
    or_na(result.peak_requests_per_second(), format_number)
}

fn cpu_cell(resources: Option<&ResourceSummary>, pick: fn(&ResourceSummary) -> f64) -> String {
    or_na(resources, |r| format!("{:.2}%", pick(r)))
}

fn mem_cell(resources: Option<&ResourceSummary>, pick: fn(&ResourceSummary) -> f64) -> String {
    or_na(resources, |r| format!("{:.2}MB", pick(r)))
}

fn top_three(
    ranked: &[&TargetResult],
    cell: impl Fn(&TargetResult) -> Option<String>,
) -> String {
    ranked
        .iter()
        .filter_map(|r| cell(*r).map(|value| format!("{} ({value})", r.framework)))
        .take(3)
        .collect::<Vec<_>>()
        .join(", ")
}

fn highlights(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec!["## Quick Highlights".to_string(), String::new()];

    let scored = by_score(results);
    if let Some((best, score)) = scored
        .first()
        .and_then(|r| r.performance_score().map(|s| (r, s)))
    {
        lines.push(format!(
            "- **Top performance score:** {} ({score}/100)",
            best.framework
        ));
    }
    let bundles = by_bundle(results);
    if let Some((best, size)) = bundles
        .first()
        .and_then(|r| r.gzipped_size().map(|s| (r, s)))
    {
        lines.push(format!(
            "- **Smallest gzipped bundle:** {} ({})",
            best.framework,
            format_bytes(size)
        ));
    }
    let throughput = by_throughput(results);
    if let Some((best, rps)) = throughput
        .first()
        .and_then(|r| r.peak_requests_per_second().map(|p| (r, p)))
    {
        lines.push(format!(
            "- **Highest measured throughput:** {} ({} req/s peak)",
            best.framework,
            format_number(rps)
        ));
    }

    let top_throughput = top_three(&throughput, |r| {
        r.peak_requests_per_second()
            .map(|rps| format!("{} req/s", format_number(rps)))
    });
    let top_scores = top_three(&scored, |r| {
        r.performance_score().map(|s| format!("{s}/100"))
    });
    let top_bundles = top_three(&bundles, |r| r.gzipped_size().map(format_bytes));

    lines.push(String::new());
    for (label, value) in [
        ("Top throughput (top 3)", top_throughput),
        ("Top performance (top 3)", top_scores),
        ("Smallest bundles (top 3)", top_bundles),
    ] {
        if !value.is_empty() {
            lines.push(format!("- {label}: {value}"));
        }
    }

    let failed: Vec<String> = results
        .iter()
        .filter_map(|r| r.error().map(|error| format!("{} ({error})", r.framework)))
        .collect();
    if !failed.is_empty() {
        lines.push(format!("- Not measured: {}", failed.join(", ")));
    }
    lines.push(String::new());
    lines
}

fn bundle_table(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec![
        "### Bundle Sizes (gzipped)".to_string(),
        String::new(),
        "| Framework | Bundle (gzipped) | Total Size |".to_string(),
        "|-----------|-----------------:|-----------:|".to_string(),
    ];
    for result in by_bundle(results) {
        lines.push(format!(
            "| {} | {} | {} |",
            result.framework,
            gzipped_cell(result),
            total_size_cell(result)
        ));
    }
    lines.push(String::new());
    lines
}

fn performance_table(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec![
        "### Browser Performance".to_string(),
        String::new(),
        "| Framework | Perf | FCP | LCP | TTI |".to_string(),
        "|-----------|-----:|----:|----:|----:|".to_string(),
    ];
    for result in by_score(results) {
        let [fcp, lcp, tti] = timing_cells(result);
        lines.push(format!(
            "| {} | {} | {fcp} | {lcp} | {tti} |",
            result.framework,
            score_cell(result)
        ));
    }
    lines.push(String::new());
    lines
}

fn throughput_table(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec![
        "### Throughput".to_string(),
        String::new(),
        "| Framework | Peak Avg Req/s | p50 | p90 | p99 | Errors |".to_string(),
        "|-----------|---------------:|----:|----:|----:|-------:|".to_string(),
    ];
    for result in by_throughput(results) {
        let [p50, p90, p99] = latency_cells(result.peak_run());
        lines.push(format!(
            "| **{}** | {} | {p50} | {p90} | {p99} | {} |",
            title_case(&result.framework),
            peak_cell(result),
            total_errors(result)
        ));
    }
    lines.push(String::new());
    lines
}

fn stress_table(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec![
        "## Stress Test Summary".to_string(),
        String::new(),
        "| Framework | Peak Avg Req/s | Peak Concurrency | p50 | p90 | p99 | Errors | Non-2xx |"
            .to_string(),
        "|-----------|---------------:|-----------------:|----:|----:|----:|-------:|--------:|"
            .to_string(),
    ];
    for result in by_throughput(results) {
        let peak = result.peak_run();
        let [p50, p90, p99] = latency_cells(peak);
        lines.push(format!(
            "| {} | {} | {} | {p50} | {p90} | {p99} | {} | {} |",
            result.framework,
            peak_cell(result),
            or_na(peak, |run| run.concurrency.to_string()),
            total_errors(result),
            total_non2xx(result)
        ));
    }
    lines.push(String::new());
    lines
}

fn methodology() -> Vec<String> {
    vec![
        "## Testing Methodology".to_string(),
        String::new(),
        "- **Instances:** each implementation is built and served from its own container, one at a time.".to_string(),
        "- **Bundle analysis:** production output copied out of the container; JS, CSS and WASM are gzipped at the default level.".to_string(),
        "- **Browser audit:** fresh headless browser, mobile form factor, 150 ms RTT, 1.6 Mbps throughput, 4x CPU slowdown.".to_string(),
        "- **Stress test:** keep-alive HTTP load at increasing concurrency with container CPU and memory sampled alongside.".to_string(),
        "- **Browser profile:** a new temporary profile for each audit, so no cache or storage carries over between targets.".to_string(),
        String::new(),
        "## Key Findings".to_string(),
        String::new(),
        "- Figures are approximate and vary by environment; compare implementations measured in the same run.".to_string(),
    ]
}

fn summary_document(results: &[TargetResult]) -> String {
    let mut lines = vec![
        "# Frontend Framework Benchmark Summary".to_string(),
        String::new(),
        format!("*Last updated: {}*", last_updated(results)),
        String::new(),
    ];
    lines.extend(highlights(results));
    lines.push("---".to_string());
    lines.push(String::new());
    lines.push("## Summary (at-a-glance)".to_string());
    lines.push(String::new());
    lines.extend(bundle_table(results));
    lines.extend(performance_table(results));
    lines.extend(throughput_table(results));
    lines.push("---".to_string());
    lines.push(String::new());
    lines.extend(stress_table(results));
    lines.push("---".to_string());
    lines.push(String::new());
    lines.extend(methodology());
    lines.join("\n") + "\n"
}

fn overview_table(results: &[TargetResult]) -> Vec<String> {
    let mut lines = vec![
        "## Summary".to_string(),
        String::new(),
        "| Framework | Type | Perf | FCP | LCP | TTI | Bundle (gzipped) | Total Size | Peak Req/s | Avg CPU | Max CPU | Avg Mem | Max Mem | Build Time (s) |".to_string(),
        "|-----------|------|-----:|----:|----:|----:|-----------------:|-----------:|-----------:|--------:|--------:|--------:|--------:|---------------:|".to_string(),
    ];
    for result in results {
        let measured = result.measurements();
        let peak_resources = result.peak_run().and_then(|run| run.resources.as_ref());
        let [fcp, lcp, tti] = timing_cells(result);
        lines.push(format!(
            "| **{}** | {} | {} | {fcp} | {lcp} | {tti} | {} | {} | {} | {} | {} | {} | {} | {} |",
            title_case(&result.framework),
            or_na(measured, |m| m.kind.to_string()),
            score_cell(result),
            gzipped_cell(result),
            total_size_cell(result),
            peak_cell(result),
            cpu_cell(peak_resources, |r| r.cpu.average),
            cpu_cell(peak_resources, |r| r.cpu.max),
            mem_cell(peak_resources, |r| r.memory.average_mb),
            mem_cell(peak_resources, |r| r.memory.max_mb),
            or_na(measured, |m| format!("{:.1}", m.build_time as f64 / 1000.0)),
        ));
    }
    lines.push(String::new());
    lines
}

fn detail_section(result: &TargetResult) -> Vec<String> {
    let mut lines = vec![format!("### {}", title_case(&result.framework)), String::new()];
    let Some(measured) = result.measurements() else {
        lines.push(format!(
            "- **Build/Run Error:** {}",
            result.error().unwrap_or(NA)
        ));
        lines.push(String::new());
        return lines;
    };

    let bundle = &measured.bundle;
    lines.push(format!("- **Type:** {}", measured.kind));
    lines.push(format!(
        "- **Build time:** {:.1} s",
        measured.build_time as f64 / 1000.0
    ));
    if let Some(error) = &bundle.error {
        lines.push(format!("- **Total size:** {NA} (bundle export failed: {error})"));
    } else {
        lines.push(format!("- **Total size:** {}", total_size_cell(result)));
        lines.push(format!("  - **JS:** {}", format_bytes(bundle.total_js)));
        lines.push(format!("  - **CSS:** {}", format_bytes(bundle.total_css)));
        if bundle.total_wasm > 0 {
            lines.push(format!("  - **WASM:** {}", format_bytes(bundle.total_wasm)));
        }
        lines.push(format!("  - **HTML:** {}", format_bytes(bundle.total_html)));
        lines.push(format!("  - **Gzipped:** {}", gzipped_cell(result)));
    }

    match &measured.audit {
        Some(AuditResult::Completed(report)) => lines.push(format!(
            "- **Performance:** {}/100 | FCP: {} | LCP: {} | TTI: {} | TBT: {} | CLS: {:.3}",
            report.performance_score,
            format_ms(report.metrics.first_contentful_paint),
            format_ms(report.metrics.largest_contentful_paint),
            format_ms(report.metrics.time_to_interactive),
            format_ms(report.metrics.total_blocking_time),
            report.metrics.cumulative_layout_shift
        )),
        Some(AuditResult::Failed { error, .. }) => {
            lines.push(format!("- **Performance:** {NA} (audit failed: {error})"))
        }
        None => lines.push(format!("- **Performance:** {NA}")),
    }

    if let Some(idle) = &measured.resources {
        lines.push(format!(
            "- **Runtime (avg/max cpu):** {:.2}% / {:.2}%",
            idle.cpu.average, idle.cpu.max
        ));
        lines.push(format!(
            "- **Memory (avg/max):** {:.2} MB / {:.2} MB",
            idle.memory.average_mb, idle.memory.max_mb
        ));
    }

    if !measured.load_runs.is_empty() {
        if let Some(peak) = result.peak_run() {
            let [p50, p90, p99] = latency_cells(Some(peak));
            lines.push(format!(
                "- **Stress (peak):** {} req/s @ {}c | p50 {p50} | p90 {p90} | p99 {p99}",
                peak_cell(result),
                peak.concurrency
            ));
            if let Some(resources) = &peak.resources {
                lines.push(format!(
                    "  - Avg CPU: {:.2}% | Max CPU: {:.2}%",
                    resources.cpu.average, resources.cpu.max
                ));
                lines.push(format!(
                    "  - Avg Mem: {:.2}MB | Max Mem: {:.2}MB",
                    resources.memory.average_mb, resources.memory.max_mb
                ));
            }
        } else {
            lines.push(format!("- **Stress (peak):** {NA}"));
        }
        for run in measured.load_runs.iter().filter(|run| run.error().is_some()) {
            lines.push(format!(
                "- **Load run @ {}c failed:** {}",
                run.concurrency,
                run.error().unwrap_or(NA)
            ));
        }
        lines.push(format!(
            "- **Stress errors:** {} | **Non-2xx:** {}",
            total_errors(result),
            total_non2xx(result)
        ));
    }
    lines.push(String::new());
    lines
}

fn detail_document(results: &[TargetResult]) -> String {
    let mut lines = vec![
        "# Frontend Framework Benchmark Results".to_string(),
        String::new(),
        format!("*Last updated: {}*", last_updated(results)),
        String::new(),
        "## Implementations Tested".to_string(),
        String::new(),
    ];
    for result in results {
        let kind = or_na(result.measurements(), |m| m.kind.to_string());
        let status = if result.error().is_some() {
            "failed"
        } else {
            "measured"
        };
        lines.push(format!(
            "- {} ({kind}): {status}",
            title_case(&result.framework)
        ));
    }
    lines.push(String::new());
    lines.extend(overview_table(results));
    lines.push("---".to_string());
    lines.push(String::new());
    lines.push("## Detailed Analysis".to_string());
    lines.push(String::new());
    for result in results {
        lines.extend(detail_section(result));
    }
    lines.extend(stress_table(results));
    lines.extend(methodology());
    lines.join("\n") + "\n"
}

/// Project results into the summary and detail documents.
pub fn render(results: &[TargetResult]) -> RenderedReport {
    RenderedReport {
        summary_markdown: summary_document(results),
        detail_markdown: detail_document(results),
    }
}

/// Overwrite SUMMARY.md and RESULTS.md under `dir`.
pub fn write_report(dir: &Path, report: &RenderedReport) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    let summary = dir.join(SUMMARY_FILE);
    let detail = dir.join(DETAIL_FILE);
    fs::write(&summary, &report.summary_markdown)
        .with_context(|| format!("Failed to write {}", summary.display()))?;
    fs::write(&detail, &report.detail_markdown)
        .with_context(|| format!("Failed to write {}", detail.display()))?;
    Ok((summary, detail))
}
