use crate::catalog::ReportCatalog;
use crate::entries::ResultEntry;
use crate::grouping::{Exclusions, GroupedReport, ModelGroup};
use crate::stats::MetricStats;
use crate::{
    INPUT_THROUGHPUT, LATENCY, OUTPUT_THROUGHPUT, OVERALL_THROUGHPUT, REPORT_METRICS,
};

pub fn medal(rank: usize) -> String {
    match rank {
        1 => "🥇".to_string(),
        2 => "🥈".to_string(),
        3 => "🥉".to_string(),
        n => format!("{}.", n),
    }
}

fn mean_std_cell(stats: Option<MetricStats>) -> String {
    match stats {
        Some(s) if s.std > 0.0 => format!("{:.2} ± {:.2}", s.mean, s.std),
        Some(s) => format!("{:.2}", s.mean),
        None => "N/A".to_string(),
    }
}

fn mean_max_dev_cell(stats: Option<MetricStats>) -> String {
    match stats {
        Some(s) => format!("{:.2} ± {:.2}", s.mean, s.max_dev),
        None => "N/A".to_string(),
    }
}

fn metric_title(metric: &str) -> String {
    metric
        .split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn run_line(entry: &ResultEntry, metric: &str, label: &str, unit: &str) -> String {
    match entry.metric(metric) {
        Some(v) => format!("    - {}: {:.2}{}", label, v, unit),
        None => format!("    - {}: N/A", label),
    }
}

/// Markdown report over every configuration and model in `report`: summary
/// table, per-model breakdown, then the throughput leaderboard.
pub fn render_analysis_markdown(report: &GroupedReport, source: &str) -> String {
    let mut md: Vec<String> = vec!["# Performance Benchmark Results\n".to_string()];
    md.push(format!("**Generated from:** `{}`\n", source));
    md.push("---\n".to_string());

    for (config, groups) in report.configs.iter() {
        md.push(format!("\n## Configuration: {}\n", config));
        md.push(format!("**Total models tested:** {}\n", groups.len()));

        md.push("\n### Summary Table\n".to_string());
        md.push("| Model | Runs | Latency (s) | Output Throughput (tok/s) | Overall Throughput (tok/s) | Input Throughput (tok/s) |".to_string());
        md.push("|-------|------|-------------|---------------------------|----------------------------|--------------------------|".to_string());
        for group in report.ranked(config) {
            md.push(format!(
                "| `{}` | {} | {} | {} | {} | {} |",
                group.model,
                group.entries.len(),
                mean_std_cell(group.stats(LATENCY)),
                mean_std_cell(group.stats(OUTPUT_THROUGHPUT)),
                mean_std_cell(group.stats(OVERALL_THROUGHPUT)),
                mean_std_cell(group.stats(INPUT_THROUGHPUT)),
            ));
        }

        md.push("\n### Detailed Results\n".to_string());
        let mut by_name: Vec<&ModelGroup> = groups.iter().collect();
        by_name.sort_by(|a, b| a.model.cmp(&b.model));
        for group in by_name {
            md.push(format!("\n#### {}\n", group.model));
            md.push(format!("- **Total runs:** {}\n", group.entries.len()));
            md.push("- **Individual runs:**\n".to_string());
            for entry in group.entries.iter() {
                md.push(format!("  - `{}`:", entry.run_name));
                md.push(run_line(entry, LATENCY, "Latency", "s"));
                md.push(run_line(entry, OUTPUT_THROUGHPUT, "Output Throughput", " tok/s"));
                md.push(run_line(entry, OVERALL_THROUGHPUT, "Overall Throughput", " tok/s"));
                md.push(run_line(entry, INPUT_THROUGHPUT, "Input Throughput", " tok/s"));
            }
            md.push("- **Statistics:**\n".to_string());
            for metric in REPORT_METRICS {
                if let Some(s) = group.stats(metric) {
                    md.push(format!(
                        "  - {}: {:.2} ± {:.2}",
                        metric_title(metric),
                        s.mean,
                        s.std
                    ));
                }
            }
        }
    }

    md.push("\n---\n".to_string());
    md.push("\n## Performance Ranking (by Output Throughput)\n".to_string());
    for config in report.configs.keys() {
        md.push(format!("\n### Configuration: {}\n", config));
        for (idx, group) in report.ranked(config).iter().enumerate() {
            md.push(format!(
                "{} **{}**: {:.2} tok/s",
                medal(idx + 1),
                group.model,
                group.mean_output_throughput()
            ));
        }
    }

    md.join("\n")
}

#[derive(Debug, Clone)]
pub struct SummaryReport {
    pub markdown: String,
    pub processed: usize,
    pub exclusions: Exclusions,
}

/// Mean ± max-deviation tables for the catalog's models, one row per
/// catalog configuration. Entries outside the catalog are counted, not shown.
pub fn render_summary_markdown(entries: &[ResultEntry], catalog: &ReportCatalog) -> SummaryReport {
    let (report, exclusions) = GroupedReport::build_selected(entries, catalog);
    let mut lines: Vec<String> = vec![
        "# Performance Summary Report".to_string(),
        String::new(),
        "**Selected Models:**".to_string(),
    ];
    for model in catalog.models.iter() {
        lines.push(format!("- {}", model.display));
    }
    lines.push(String::new());
    lines.push("**Metrics:** Mean ± Max Deviation".to_string());
    lines.push(String::new());
    lines.push("*Max Deviation = Max(max - avg, avg - min)*".to_string());
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push(String::new());

    for model in catalog.models.iter() {
        let rows: Vec<(&str, &ModelGroup)> = catalog
            .configurations
            .iter()
            .filter_map(|c| {
                report
                    .group(&c.configuration, &model.key)
                    .map(|g| (c.name.as_str(), g))
            })
            .collect();
        if rows.is_empty() {
            continue;
        }
        lines.push(format!("## {}", model.display));
        lines.push(String::new());
        lines.push("| Configuration | Latency (s) | Output Throughput (tok/s) | Overall Throughput (tok/s) |".to_string());
        lines.push("|--------------|-------------|---------------------------|----------------------------|".to_string());
        for (name, group) in rows {
            lines.push(format!(
                "| {} | {} | {} | {} |",
                name,
                mean_max_dev_cell(group.stats(LATENCY)),
                mean_max_dev_cell(group.stats(OUTPUT_THROUGHPUT)),
                mean_max_dev_cell(group.stats(OVERALL_THROUGHPUT)),
            ));
        }
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }

    SummaryReport {
        markdown: lines.join("\n"),
        processed: report.entry_count(),
        exclusions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Configuration, MetricMap};

    fn entry(run_name: &str, config: Configuration, pairs: &[(&str, f64)]) -> ResultEntry {
        let metrics: MetricMap = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        ResultEntry::new(run_name, config, metrics)
    }

    fn sample_entries() -> Vec<ResultEntry> {
        let base = Configuration::new(32, 256, 32);
        vec![
            entry("A_run1", base, &[(OUTPUT_THROUGHPUT, 110.0), (LATENCY, 1.0)]),
            entry("B_run1", base, &[(OUTPUT_THROUGHPUT, 150.0), (LATENCY, 0.5)]),
            entry("A_run2", base, &[(OUTPUT_THROUGHPUT, 130.0), (LATENCY, 1.2)]),
        ]
    }

    #[test]
    fn leaderboard_ranks_faster_model_first() {
        let report = GroupedReport::build(&sample_entries());
        let md = render_analysis_markdown(&report, "result.jsonl");
        assert!(md.contains("🥇 **B**: 150.00 tok/s"), "{}", md);
        assert!(md.contains("🥈 **A**: 120.00 tok/s"), "{}", md);
    }

    #[test]
    fn summary_table_uses_mean_std_and_na() {
        let report = GroupedReport::build(&sample_entries());
        let md = render_analysis_markdown(&report, "result.jsonl");
        assert!(
            md.contains("| `B` | 1 | 0.50 | 150.00 | N/A | N/A |"),
            "{}",
            md
        );
        assert!(md.contains("| `A` | 2 | 1.10 ± 0.10 | 120.00 ± 10.00 | N/A | N/A |"));
        let b_row = md.find("| `B` |").expect("B row");
        let a_row = md.find("| `A` |").expect("A row");
        assert!(b_row < a_row);
        assert!(md.contains("    - Overall Throughput: N/A"));
        assert!(md.contains("  - Output Throughput: 120.00 ± 10.00"));
    }

    #[test]
    fn rendering_is_idempotent() {
        let entries = sample_entries();
        let first = render_analysis_markdown(&GroupedReport::build(&entries), "r");
        let second = render_analysis_markdown(&GroupedReport::build(&entries), "r");
        assert_eq!(first, second);
    }

    #[test]
    fn medals_then_ordinals() {
        assert_eq!(medal(1), "🥇");
        assert_eq!(medal(3), "🥉");
        assert_eq!(medal(4), "4.");
    }

    #[test]
    fn summary_uses_max_deviation_and_catalog_names() {
        let base = Configuration::new(32, 256, 32);
        let entries = vec![
            entry("original_run1", base, &[(OUTPUT_THROUGHPUT, 100.0)]),
            entry("original_run2", base, &[(OUTPUT_THROUGHPUT, 110.0)]),
            entry("original_base_run3", base, &[(OUTPUT_THROUGHPUT, 90.0)]),
            entry("unlisted_run1", base, &[(OUTPUT_THROUGHPUT, 1.0)]),
        ];
        let summary = render_summary_markdown(&entries, &ReportCatalog::default());
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.exclusions.skipped_models, 1);
        assert!(summary.markdown.contains("## BF16 Baseline"));
        assert!(summary
            .markdown
            .contains("| Base Configuration (32,256,32) | N/A | 100.00 ± 10.00 | N/A |"));
        assert!(!summary.markdown.contains("## W8A8 SQ→PTQ"));
    }

    #[test]
    fn metric_titles_are_capitalized() {
        assert_eq!(metric_title("output_throughput"), "Output Throughput");
        assert_eq!(metric_title("latency"), "Latency");
    }
}
