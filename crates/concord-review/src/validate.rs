//! Deterministic checks applied to model output.
//!
//! Length rules ("functions must not exceed 30 lines") are easy for a model
//! to misjudge. For those rules the line count is recomputed here and the
//! model's claim is overridden.

use std::collections::HashMap;

use concord_core::{Chunk, Finding, Rule};

/// Line-count thresholds keyed by rule id, for rules that have one.
pub fn line_thresholds(rules: &[Rule]) -> HashMap<String, u32> {
    rules
        .iter()
        .filter_map(|r| r.line_threshold().map(|t| (r.id.clone(), t)))
        .collect()
}

/// Number of lines `finding` covers.
///
/// Uses the chunk's line map when it covers at least half of the claimed
/// range, otherwise counts arithmetically from the line numbers.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use concord_core::{Chunk, Finding, Severity};
/// use concord_review::validate::recount_lines;
///
/// let chunk = Chunk {
///     content: vec!["x"; 50].join("\n"),
///     start_line: 1,
///     end_line: 50,
///     index: 0,
///     file_path: PathBuf::from("a.rs"),
/// };
/// let f = Finding::new("len", Severity::Warning, 10, 39, "too long");
/// assert_eq!(recount_lines(&f, &chunk), 30);
/// ```
pub fn recount_lines(finding: &Finding, chunk: &Chunk) -> u32 {
    let claimed = finding.span();
    let mapped = chunk
        .line_map()
        .filter(|(n, _)| *n >= finding.line_start && *n <= finding.line_end)
        .count() as u32;
    if mapped.saturating_mul(2) >= claimed {
        mapped
    } else {
        claimed
    }
}

/// Normalize findings and drop length-rule findings that do not exceed
/// their threshold.
///
/// Findings for rule ids not in `rules` are kept.
pub fn validate_findings(findings: Vec<Finding>, chunk: &Chunk, rules: &[Rule]) -> Vec<Finding> {
    let thresholds = line_thresholds(rules);
    findings
        .into_iter()
        .map(Finding::normalized)
        .filter(|f| match thresholds.get(&f.rule_id) {
            Some(&limit) => {
                let count = recount_lines(f, chunk);
                let keep = count > limit;
                if !keep {
                    tracing::debug!(
                        rule = %f.rule_id,
                        lines = count,
                        limit,
                        "dropping finding within line threshold"
                    );
                }
                keep
            }
            None => true,
        })
        .collect()
}
