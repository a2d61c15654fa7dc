/// Configuration labels that benchmark run names may carry between the model
/// name and the ordinal suffix, e.g. `modelA_high_concurrency_run1`.
pub const CONFIG_LABEL_SUFFIXES: [&str; 7] = [
    "base",
    "interactive",
    "prefill_bound",
    "decode_bound",
    "medium_batch",
    "high_concurrency",
    "long_context",
];

const ORDINAL_MARKERS: [&str; 2] = ["_run", "_repeat"];

/// Derives the logical model name from a raw run identifier: strip a trailing
/// `_run<k>` / `_repeat<k>`, then at most one known configuration label.
pub fn canonical_model_name(run_name: &str) -> String {
    let base = strip_ordinal_suffix(run_name);
    strip_config_label(base).to_string()
}

pub fn strip_ordinal_suffix(run_name: &str) -> &str {
    for marker in ORDINAL_MARKERS {
        if let Some(idx) = run_name.rfind(marker) {
            let digits = &run_name[idx + marker.len()..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &run_name[..idx];
            }
        }
    }
    run_name
}

pub fn strip_config_label(name: &str) -> &str {
    for label in CONFIG_LABEL_SUFFIXES {
        if let Some(prefix) = name.strip_suffix(label) {
            if let Some(model) = prefix.strip_suffix('_') {
                if !model.is_empty() {
                    return model;
                }
            }
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_run_ordinal() {
        assert_eq!(canonical_model_name("w8a8_smooth_ptq_run2"), "w8a8_smooth_ptq");
        assert_eq!(canonical_model_name("original_run10"), "original");
    }

    #[test]
    fn strips_ordinal_then_config_label() {
        assert_eq!(canonical_model_name("modelA_high_concurrency_run1"), "modelA");
        assert_eq!(
            canonical_model_name("w8a16_smooth_awq_long_context_repeat3"),
            "w8a16_smooth_awq"
        );
    }

    #[test]
    fn every_config_label_is_stripped() {
        for label in CONFIG_LABEL_SUFFIXES {
            let raw = format!("m_{}_run1", label);
            assert_eq!(canonical_model_name(&raw), "m", "label {}", label);
        }
    }

    #[test]
    fn only_one_config_label_is_stripped() {
        assert_eq!(canonical_model_name("m_base_interactive_run1"), "m_base");
    }

    #[test]
    fn leaves_names_without_suffixes_alone() {
        assert_eq!(canonical_model_name("original"), "original");
        assert_eq!(canonical_model_name("model_run"), "model_run");
        assert_eq!(canonical_model_name("model_runx1"), "model_runx1");
        assert_eq!(canonical_model_name("base"), "base");
        assert_eq!(canonical_model_name("_base_run1"), "_base");
    }

    #[test]
    fn label_without_ordinal_is_still_stripped() {
        assert_eq!(canonical_model_name("modelB_interactive"), "modelB");
    }
}
