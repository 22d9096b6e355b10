//! Validation filter
//!
//! Applies the descriptor's declared sanity bounds. Out-of-range points are
//! dropped and counted, never clamped - a fabricated value is worse than a
//! gap in the series. Non-finite values are always dropped.

use tracing::warn;

use crate::config::EndpointDescriptor;
use crate::model::MeasurementPoint;

#[derive(Debug, Default)]
pub struct FilterReport {
    pub kept: Vec<MeasurementPoint>,
    pub dropped_out_of_range: u64,
    pub dropped_non_finite: u64,
}

impl FilterReport {
    pub fn dropped(&self) -> u64 {
        self.dropped_out_of_range + self.dropped_non_finite
    }
}

pub fn filter(descriptor: &EndpointDescriptor, points: Vec<MeasurementPoint>) -> FilterReport {
    let mut report = FilterReport::default();

    for point in points {
        if !point.value.is_finite() {
            warn!(
                "dropping non-finite {} for {}: {}",
                point.measurement, point.device_id, point.value
            );
            report.dropped_non_finite += 1;
            continue;
        }

        let bounds = descriptor
            .measurements
            .iter()
            .find(|m| m.name == point.measurement)
            .map(|m| (m.min, m.max))
            .unwrap_or((None, None));

        let below = bounds.0.is_some_and(|min| point.value < min);
        let above = bounds.1.is_some_and(|max| point.value > max);
        if below || above {
            warn!(
                "dropping out-of-range {} for {}: {} not in [{:?}, {:?}]",
                point.measurement, point.device_id, point.value, bounds.0, bounds.1
            );
            report.dropped_out_of_range += 1;
            continue;
        }

        report.kept.push(point);
    }

    report
}
