//! Lighthouse v10 mobile scoring curves.

use super::PageMetrics;

const INVERSE_ERFC_ONE_FIFTH: f64 = 0.906_193_802_436_823_2;

/// Log-normal curve anchored at the 10th percentile and the median.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreCurve {
    pub p10: f64,
    pub median: f64,
}

pub const FIRST_CONTENTFUL_PAINT: ScoreCurve = ScoreCurve {
    p10: 1_800.0,
    median: 3_000.0,
};
pub const SPEED_INDEX: ScoreCurve = ScoreCurve {
    p10: 3_387.0,
    median: 5_800.0,
};
pub const LARGEST_CONTENTFUL_PAINT: ScoreCurve = ScoreCurve {
    p10: 2_500.0,
    median: 4_000.0,
};
pub const TOTAL_BLOCKING_TIME: ScoreCurve = ScoreCurve {
    p10: 200.0,
    median: 600.0,
};
pub const CUMULATIVE_LAYOUT_SHIFT: ScoreCurve = ScoreCurve {
    p10: 0.1,
    median: 0.25,
};

const WEIGHTS: [(ScoreCurve, f64); 5] = [
    (FIRST_CONTENTFUL_PAINT, 0.10),
    (SPEED_INDEX, 0.10),
    (LARGEST_CONTENTFUL_PAINT, 0.25),
    (TOTAL_BLOCKING_TIME, 0.30),
    (CUMULATIVE_LAYOUT_SHIFT, 0.25),
];

// Abramowitz and Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    let sign = x.signum();
    let x = x.abs();
    let (a1, a2, a3, a4, a5) = (
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    );
    let p = 0.327_591_1;
    let t = 1.0 / (1.0 + p * x);
    let y = t * (a1 + t * (a2 + t * (a3 + t * (a4 + t * a5))));
    sign * (1.0 - y * (-x * x).exp())
}

/// Score in `[0, 1]`, rounded to two decimals.
pub fn log_normal_score(curve: ScoreCurve, value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    if value <= 0.0 {
        return 1.0;
    }
    let x_log_ratio = (value / curve.median).max(f64::MIN_POSITIVE).ln();
    let p10_log_ratio = -(curve.p10 / curve.median).max(f64::MIN_POSITIVE).ln();
    let standardized = x_log_ratio * INVERSE_ERFC_ONE_FIFTH / p10_log_ratio;
    let complementary = (1.0 - erf(standardized)) / 2.0;

    let score = if value <= curve.p10 {
        complementary.clamp(0.9, 1.0)
    } else if value <= curve.median {
        complementary.clamp(0.5, 0.899_999_999_999_999_9)
    } else {
        complementary.clamp(0.0, 0.499_999_999_999_999_9)
    };
    (score * 100.0).round() / 100.0
}

/// Weighted performance score on the 0-100 scale. Metrics a backend did
/// not report are left out and the remaining weights rescaled.
pub fn performance_score(metrics: &PageMetrics) -> u32 {
    let values = [
        Some(metrics.first_contentful_paint),
        metrics.speed_index,
        Some(metrics.largest_contentful_paint),
        Some(metrics.total_blocking_time),
        Some(metrics.cumulative_layout_shift),
    ];
    let (weighted, total_weight) = WEIGHTS
        .iter()
        .zip(values)
        .filter_map(|((curve, weight), value)| {
            value.map(|value| (log_normal_score(*curve, value) * weight, *weight))
        })
        .fold((0.0, 0.0), |(sum, total), (score, weight)| {
            (sum + score, total + weight)
        });
    if total_weight <= 0.0 {
        return 0;
    }
    (weighted / total_weight * 100.0).round().clamp(0.0, 100.0) as u32
}
