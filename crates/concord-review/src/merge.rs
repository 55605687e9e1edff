//! Cross-chunk merging of findings for one file.
//!
//! Overlapping chunks report the same issue more than once, usually with
//! slightly different line ranges. Same-rule findings whose ranges nearly
//! coincide are merged into one spanning their envelope.

use std::cmp::Ordering;
use std::collections::HashMap;

use concord_core::Finding;

/// Merge near-duplicate findings and sort the result.
///
/// Two findings with the same rule merge when their starts and their ends
/// each differ by at most one line, or when they share a start or an end
/// line. Clusters link through any of their original ranges and keep
/// merging until no pair qualifies, so the operation is idempotent.
/// Findings for rules in `thresholds` are dropped, both before and after
/// merging, unless their span exceeds the rule's line limit.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use concord_core::{Finding, Severity};
/// use concord_review::merge::merge_findings;
///
/// let merged = merge_findings(
///     vec![
///         Finding::new("R", Severity::Warning, 10, 20, "a"),
///         Finding::new("R", Severity::Warning, 11, 21, "b"),
///     ],
///     &HashMap::new(),
/// );
/// assert_eq!(merged.len(), 1);
/// assert_eq!((merged[0].line_start, merged[0].line_end), (10, 21));
/// ```
pub fn merge_findings(findings: Vec<Finding>, thresholds: &HashMap<String, u32>) -> Vec<Finding> {
    let mut sorted: Vec<Finding> = findings
        .into_iter()
        .map(Finding::normalized)
        .filter(|f| exceeds_threshold(f, thresholds))
        .collect();
    sorted.sort_by(|a, b| report_order(a, b).then_with(|| a.description.cmp(&b.description)));

    let mut clusters: Vec<Cluster> = sorted.into_iter().map(Cluster::new).collect();
    while let Some((i, j)) = linked_pair(&clusters) {
        let other = clusters.remove(j);
        clusters[i].absorb(other);
    }

    let mut merged: Vec<Finding> = clusters
        .into_iter()
        .map(|c| c.finding)
        .filter(|f| exceeds_threshold(f, thresholds))
        .collect();
    merged.sort_by(report_order);
    merged
}

/// Findings merged so far: the representative spans the envelope, and the
/// original ranges are kept for linking.
struct Cluster {
    finding: Finding,
    members: Vec<(u32, u32)>,
}

impl Cluster {
    fn new(finding: Finding) -> Self {
        let members = vec![(finding.line_start, finding.line_end)];
        Self { finding, members }
    }

    fn envelope(&self) -> (u32, u32) {
        (self.finding.line_start, self.finding.line_end)
    }

    fn linked(&self, other: &Cluster) -> bool {
        self.finding.rule_id == other.finding.rule_id
            && (touches(self.envelope(), other.envelope())
                || self
                    .members
                    .iter()
                    .any(|&a| other.members.iter().any(|&b| touches(a, b))))
    }

    /// The richer text wins; ties keep `self`, which sorts first.
    fn absorb(&mut self, other: Cluster) {
        let start = self.finding.line_start.min(other.finding.line_start);
        let end = self.finding.line_end.max(other.finding.line_end);
        if other.finding.is_richer_than(&self.finding) {
            self.finding = other.finding;
        }
        self.finding.line_start = start;
        self.finding.line_end = end;
        self.members.extend(other.members);
    }
}

fn linked_pair(clusters: &[Cluster]) -> Option<(usize, usize)> {
    for i in 0..clusters.len() {
        for j in i + 1..clusters.len() {
            if clusters[i].linked(&clusters[j]) {
                return Some((i, j));
            }
        }
    }
    None
}

fn touches((a_start, a_end): (u32, u32), (b_start, b_end): (u32, u32)) -> bool {
    let near = a_start.abs_diff(b_start) <= 1 && a_end.abs_diff(b_end) <= 1;
    near || a_start == b_start || a_end == b_end
}

fn report_order(a: &Finding, b: &Finding) -> Ordering {
    (a.line_start, a.line_end, &a.rule_id).cmp(&(b.line_start, b.line_end, &b.rule_id))
}

fn exceeds_threshold(finding: &Finding, thresholds: &HashMap<String, u32>) -> bool {
    thresholds
        .get(&finding.rule_id)
        .map_or(true, |&limit| finding.span() > limit)
}

#[cfg(test)]
mod tests {
    use concord_core::Severity;

    use super::*;

    fn f(rule: &str, start: u32, end: u32, desc: &str) -> Finding {
        Finding::new(rule, Severity::Warning, start, end, desc)
    }

    fn spans(findings: &[Finding]) -> Vec<(&str, u32, u32)> {
        findings.iter().map(|f| f.key()).collect()
    }

    #[test]
    fn boundary_pair_merges_to_envelope() {
        let out = merge_findings(vec![f("R", 11, 21, "b"), f("R", 10, 20, "a")], &HashMap::new());
        assert_eq!(spans(&out), vec![("R", 10, 21)]);
    }

    #[test]
    fn richer_duplicate_becomes_representative() {
        let long = f("R", 10, 23, "a considerably longer description");
        let out = merge_findings(
            vec![f("R", 10, 20, "a"), f("R", 11, 21, "b"), long.clone()],
            &HashMap::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].line_start, out[0].line_end), (10, 23));
        assert_eq!(out[0].description, long.description);
    }

    #[test]
    fn different_rules_never_merge() {
        let out = merge_findings(vec![f("A", 1, 5, "x"), f("B", 1, 5, "x")], &HashMap::new());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn distant_ranges_stay_apart() {
        let out = merge_findings(vec![f("R", 1, 5, "x"), f("R", 3, 9, "x")], &HashMap::new());
        assert_eq!(spans(&out), vec![("R", 1, 5), ("R", 3, 9)]);
    }

    #[test]
    fn chains_collapse_transitively() {
        let out = merge_findings(
            vec![f("R", 1, 10, "a"), f("R", 2, 11, "b"), f("R", 3, 12, "c")],
            &HashMap::new(),
        );
        assert_eq!(spans(&out), vec![("R", 1, 12)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let input = vec![
            f("R", 10, 20, "a"),
            f("R", 11, 21, "bb"),
            f("R", 10, 23, "ccc"),
            f("S", 0, 0, "x"),
            f("R", 40, 44, "d"),
            f("R", 41, 45, "e"),
            f("R", 45, 50, "tail"),
            f("T", 7, 3, "inverted"),
        ];
        let once = merge_findings(input, &HashMap::new());
        let twice = merge_findings(once.clone(), &HashMap::new());
        assert_eq!(once, twice);
    }

    #[test]
    fn output_is_sorted() {
        let out = merge_findings(
            vec![f("B", 30, 31, "x"), f("A", 5, 9, "x"), f("A", 5, 6, "x"), f("C", 5, 6, "x")],
            &HashMap::new(),
        );
        assert_eq!(spans(&out), vec![("C", 5, 6), ("A", 5, 9), ("B", 30, 31)]);
    }

    #[test]
    fn threshold_filter_runs_before_and_after() {
        let thresholds = HashMap::from([("len".to_string(), 30)]);
        // 1-20 and 50-60 are within the limit
        let out = merge_findings(
            vec![f("len", 1, 20, "a"), f("len", 1, 31, "b"), f("len", 50, 60, "c")],
            &thresholds,
        );
        assert_eq!(spans(&out), vec![("len", 1, 31)]);
    }
}
