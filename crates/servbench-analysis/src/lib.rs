use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod catalog;
pub mod entries;
pub mod grouping;
pub mod naming;
pub mod report;
pub mod stats;

pub use catalog::ReportCatalog;
pub use entries::{load_result_entries, parse_result_lines, LoadedEntries, ResultEntry};
pub use grouping::{Exclusions, GroupedReport, ModelGroup};
pub use naming::canonical_model_name;
pub use report::{medal, render_analysis_markdown, render_summary_markdown, SummaryReport};
pub use stats::{max_deviation, mean, population_std, MetricStats};

/// Metric name to value, ordered by name so serialized output is stable.
pub type MetricMap = BTreeMap<String, f64>;

pub const LATENCY: &str = "latency";
pub const OUTPUT_THROUGHPUT: &str = "output_throughput";
pub const OVERALL_THROUGHPUT: &str = "overall_throughput";
pub const INPUT_THROUGHPUT: &str = "input_throughput";

/// Metrics shown in the analysis tables, in column order.
pub const REPORT_METRICS: [&str; 4] = [
    LATENCY,
    OUTPUT_THROUGHPUT,
    OVERALL_THROUGHPUT,
    INPUT_THROUGHPUT,
];

/// One benchmark scenario: `(batch_size, input_len, output_len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Configuration {
    pub batch_size: u64,
    pub input_len: u64,
    pub output_len: u64,
}

impl Configuration {
    pub fn new(batch_size: u64, input_len: u64, output_len: u64) -> Self {
        Self {
            batch_size,
            input_len,
            output_len,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.batch_size > 0 && self.input_len > 0 && self.output_len > 0
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch_size={}, input_len={}, output_len={}",
            self.batch_size, self.input_len, self.output_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_orders_by_batch_then_lengths() {
        let mut configs = vec![
            Configuration::new(32, 256, 32),
            Configuration::new(1, 2048, 32),
            Configuration::new(1, 128, 64),
        ];
        configs.sort();
        assert_eq!(configs[0], Configuration::new(1, 128, 64));
        assert_eq!(configs[1], Configuration::new(1, 2048, 32));
        assert_eq!(configs[2], Configuration::new(32, 256, 32));
    }

    #[test]
    fn configuration_rejects_zero_dimensions() {
        assert!(Configuration::new(1, 1, 1).is_valid());
        assert!(!Configuration::new(0, 256, 32).is_valid());
        assert!(!Configuration::new(8, 0, 32).is_valid());
    }
}
