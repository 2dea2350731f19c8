//! Label sets stamped onto created resources.
//!
//! Every resource carries the managed-by marker so external tooling can
//! audit or sweep leftovers. CI metadata labels are copied from the
//! orchestrator's environment when present; values that fail the provider's
//! label grammar are logged and skipped, never fatal.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Label key identifying resources created by this tool.
pub const MANAGED_BY_KEY: &str = "managed-by";

/// Label value identifying resources created by this tool.
pub const MANAGED_BY_VALUE: &str = "machinist";

/// Longest label value the provider accepts.
const MAX_LABEL_VALUE_LEN: usize = 63;

/// CI metadata copied into labels when present and valid.
const LABEL_ENV_VARS: [(&str, &str); 6] = [
    ("commit-ref", "CUSTOM_ENV_CI_COMMIT_REF_NAME"),
    ("commit-sha", "CUSTOM_ENV_CI_COMMIT_SHA"),
    ("job-id", "CUSTOM_ENV_CI_JOB_ID"),
    ("pipeline-id", "CUSTOM_ENV_CI_PIPELINE_ID"),
    ("project-id", "CUSTOM_ENV_CI_PROJECT_ID"),
    ("tag", "CUSTOM_ENV_CI_COMMIT_TAG"),
];

static LABEL_VALUE_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9_.-]*[a-zA-Z0-9]))?$")
        .expect("label value grammar must compile")
});

/// Returns whether `value` passes the provider's label-value validation.
#[must_use]
pub fn is_valid_label_value(value: &str) -> bool {
    value.len() <= MAX_LABEL_VALUE_LEN && LABEL_VALUE_GRAMMAR.is_match(value)
}

/// The minimal label set: just the managed-by marker.
#[must_use]
pub fn managed_by_labels() -> HashMap<String, String> {
    HashMap::from([(MANAGED_BY_KEY.to_owned(), MANAGED_BY_VALUE.to_owned())])
}

/// Builds the full label set for a machine: the managed-by marker plus CI
/// metadata from the environment.
#[must_use]
pub fn build_labels() -> HashMap<String, String> {
    let mut labels = managed_by_labels();
    for (label, variable) in LABEL_ENV_VARS {
        let Ok(value) = std::env::var(variable) else {
            continue;
        };
        if is_valid_label_value(&value) {
            labels.insert(label.to_owned(), value);
        } else {
            warn!(label, variable, "label validation failed, skipping");
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("main", true)]
    #[case("", true)]
    #[case("release-1.2.3", true)]
    #[case("a_b.c-d", true)]
    #[case("-leading", false)]
    #[case("trailing-", false)]
    #[case("has space", false)]
    #[case("sla/sh", false)]
    fn validates_label_values(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_valid_label_value(value), expected, "value: {value:?}");
    }

    #[test]
    fn rejects_overlong_values() {
        assert!(is_valid_label_value(&"a".repeat(63)));
        assert!(!is_valid_label_value(&"a".repeat(64)));
    }

    #[test]
    fn managed_by_marker_is_always_present() {
        let labels = managed_by_labels();
        assert_eq!(
            labels.get(MANAGED_BY_KEY).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }
}
