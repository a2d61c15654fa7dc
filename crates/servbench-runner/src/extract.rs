use regex::Regex;
use servbench_analysis::MetricMap;
use std::sync::OnceLock;

/// Output preceding this marker belongs to the warm-up pass.
pub const WARMUP_END_MARKER: &str = "Warmup End";

const NUMBER: &str = r"(\d+(?:\.\d+)?)";

/// Metric name and the text that precedes / follows its value.
pub const METRIC_PATTERNS: [(&str, &str, &str); 6] = [
    ("latency", r"latency:\s*", r"\s*s\b"),
    ("ttft", r"ttft:\s*", r"\s*s\b"),
    ("output_throughput", r"output throughput:\s*", r"\s*tok/s"),
    ("overall_throughput", r"overall throughput:\s*", r"\s*tok/s"),
    ("last_gen_throughput", r"last generation throughput:\s*", r"\s*tok/s"),
    ("input_throughput", r"input throughput:\s*", r"\s*tok/s"),
];

fn compiled_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        METRIC_PATTERNS
            .iter()
            .map(|(name, before, after)| {
                let re = Regex::new(&format!("(?i){}{}{}", before, NUMBER, after))
                    .expect("metric patterns are valid regexes");
                (*name, re)
            })
            .collect()
    })
}

/// Pulls the recognized metrics out of one trial's output. Only the text from
/// the warm-up marker onward is searched when the marker is present; the
/// first match per metric wins and unmatched metrics are simply absent.
pub fn extract_metrics(output: &str) -> MetricMap {
    let section = match output.find(WARMUP_END_MARKER) {
        Some(idx) => &output[idx..],
        None => output,
    };
    let mut metrics = MetricMap::new();
    for (name, re) in compiled_patterns() {
        let value = re
            .captures(section)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        if let Some(v) = value {
            metrics.insert(name.to_string(), v);
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENCH_OUTPUT: &str = include_str!("../testdata/bench_one_batch.txt");
    const NO_WARMUP: &str = include_str!("../testdata/no_warmup.txt");
    const TRACEBACK: &str = include_str!("../testdata/traceback.txt");

    #[test]
    fn skips_warmup_numbers() {
        let m = extract_metrics(BENCH_OUTPUT);
        assert_eq!(m.len(), 6);
        assert_eq!(m["latency"], 1.347);
        assert_eq!(m["ttft"], 0.412);
        assert_eq!(m["output_throughput"], 760.16);
        assert_eq!(m["overall_throughput"], 6841.44);
        assert_eq!(m["last_gen_throughput"], 1094.12);
        assert_eq!(m["input_throughput"], 19893.56);
    }

    #[test]
    fn searches_everything_without_marker_and_ignores_case() {
        let m = extract_metrics(NO_WARMUP);
        assert_eq!(m.len(), 3);
        assert_eq!(m["latency"], 2.0);
        assert_eq!(m["output_throughput"], 512.0);
        assert_eq!(m["overall_throughput"], 2048.5);
        assert!(!m.contains_key("ttft"));
    }

    #[test]
    fn unrecognized_text_yields_empty_map() {
        assert!(extract_metrics(TRACEBACK).is_empty());
        assert!(extract_metrics("").is_empty());
        assert!(extract_metrics("latency: fast\nthroughput: high").is_empty());
    }

    #[test]
    fn first_match_wins() {
        let m = extract_metrics("output throughput: 1.5 tok/s\noutput throughput: 9 tok/s\n");
        assert_eq!(m["output_throughput"], 1.5);
    }
}
