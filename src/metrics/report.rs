//! Human-readable formatting of reduced metrics.

use super::criteria::{CriterionResult, CriterionStatus};
use super::Reduced;

/// Scale a value according to the unit its field name implies.
pub fn format_value(field: &str, value: f64) -> String {
    if field.ends_with("pps") {
        if value >= 1_000_000.0 {
            format!("{:.2} Mpps", value / 1_000_000.0)
        } else if value >= 1_000.0 {
            format!("{:.1} Kpps", value / 1_000.0)
        } else {
            format!("{:.0} pps", value)
        }
    } else if field.ends_with("bytes") {
        if value >= 1_073_741_824.0 {
            format!("{:.2} GiB", value / 1_073_741_824.0)
        } else if value >= 1_048_576.0 {
            format!("{:.1} MiB", value / 1_048_576.0)
        } else {
            format!("{:.0} B", value)
        }
    } else if field.ends_with("gbps") {
        format!("{:.2} Gbps", value)
    } else if field.ends_with("_us") {
        format!("{:.1} us", value)
    } else {
        format!("{}", value)
    }
}

pub fn format_reduced(field: &str, reduced: &Reduced) -> String {
    if reduced.no_samples {
        return format!("{}: no samples", field);
    }
    format!(
        "{}: {} ({} sample{})",
        field,
        format_value(field, reduced.value),
        reduced.count,
        if reduced.count == 1 { "" } else { "s" },
    )
}

pub fn format_criterion(result: &CriterionResult) -> String {
    let status = match result.status {
        CriterionStatus::Pass => "ok",
        CriterionStatus::OutOfRange => "FAIL",
        CriterionStatus::NoSamples => "n/a",
        CriterionStatus::MissingRequired => "FAIL (no samples)",
    };
    let mut line = format!("{:<32} {:>16}  {}", result.label, result.value, status);
    match (result.min, result.max) {
        (Some(min), Some(max)) => line.push_str(&format!("  [{}, {}]", min, max)),
        (Some(min), None) => line.push_str(&format!("  >= {}", min)),
        (None, Some(max)) => line.push_str(&format!("  <= {}", max)),
        (None, None) => {}
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value_units() {
        assert_eq!(format_value("tx_pps", 1_250_000.0), "1.25 Mpps");
        assert_eq!(format_value("rx_pps", 2_500.0), "2.5 Kpps");
        assert_eq!(format_value("rx_bytes", 2_147_483_648.0), "2.00 GiB");
        assert_eq!(format_value("throughput_gbps", 9.412), "9.41 Gbps");
        assert_eq!(format_value("latency_us", 12.34), "12.3 us");
        assert_eq!(format_value("custom", 3.0), "3");
    }

    #[test]
    fn test_format_reduced() {
        let r = Reduced { value: 200.0, count: 3, no_samples: false };
        assert_eq!(format_reduced("tx_pps", &r), "tx_pps: 200 pps (3 samples)");
        assert_eq!(format_reduced("tx_pps", &Reduced::empty()), "tx_pps: no samples");
    }

    #[test]
    fn test_format_criterion_bounds() {
        let r = CriterionResult {
            label: "sender.tx_pps(mean)".to_string(),
            value: 5.0,
            min: Some(10.0),
            max: None,
            status: CriterionStatus::OutOfRange,
        };
        let line = format_criterion(&r);
        assert!(line.contains("FAIL"));
        assert!(line.contains(">= 10"));
    }
}
