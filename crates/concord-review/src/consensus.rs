//! Voting across repeated attempts on the same chunk.

use std::collections::{HashMap, HashSet};

use concord_core::Finding;

/// Votes a finding needs out of `attempts` to survive.
///
/// The product is rounded to one decimal before taking the ceiling, so a
/// ratio written as `0.67` behaves like two thirds. The same rounding lets
/// a product within 0.05 above a whole number settle on it, so `0.34` of 3
/// needs one vote. Always at least 1 and never more than `attempts`.
///
/// # Examples
///
/// ```
/// use concord_review::consensus::required_votes;
///
/// assert_eq!(required_votes(1.0, 3), 3);
/// assert_eq!(required_votes(0.67, 3), 2);
/// assert_eq!(required_votes(0.5, 3), 2);
/// assert_eq!(required_votes(0.01, 3), 1);
/// ```
pub fn required_votes(ratio: f64, attempts: usize) -> usize {
    let product = (ratio * attempts as f64 * 10.0).round() / 10.0;
    (product.ceil() as usize).clamp(1, attempts.max(1))
}

/// Keep the findings that enough attempts agree on.
///
/// Findings are keyed by `(rule_id, line_start, line_end)` after
/// normalization; each attempt votes at most once per key. The richest
/// duplicate represents a winning key. With a single attempt the findings
/// are returned as they came, normalized.
///
/// # Examples
///
/// ```
/// use concord_core::{Finding, Severity};
/// use concord_review::consensus::aggregate;
///
/// let f = Finding::new("R", Severity::Error, 5, 10, "long fn");
/// let attempts = vec![vec![f.clone()], vec![f.clone()], vec![]];
/// assert!(aggregate(&attempts, 1.0).is_empty());
/// assert_eq!(aggregate(&attempts, 0.67).len(), 1);
/// ```
pub fn aggregate(attempts: &[Vec<Finding>], consensus_ratio: f64) -> Vec<Finding> {
    if attempts.len() == 1 {
        return attempts[0].iter().cloned().map(Finding::normalized).collect();
    }

    let counts: Vec<usize> = attempts.iter().map(Vec::len).collect();
    if let Some(anomaly) = detect_anomaly(&counts) {
        tracing::warn!(?counts, %anomaly, "attempts disagree on issue count");
    }

    let needed = required_votes(consensus_ratio, attempts.len());
    let mut order: Vec<(String, u32, u32)> = Vec::new();
    let mut votes: HashMap<(String, u32, u32), (usize, Finding)> = HashMap::new();

    for attempt in attempts {
        let mut seen = HashSet::new();
        for finding in attempt {
            let finding = finding.clone().normalized();
            let key = (finding.rule_id.clone(), finding.line_start, finding.line_end);
            let first_in_attempt = seen.insert(key.clone());
            match votes.get_mut(&key) {
                Some((count, best)) => {
                    if first_in_attempt {
                        *count += 1;
                    }
                    if finding.is_richer_than(best) {
                        *best = finding;
                    }
                }
                None => {
                    order.push(key.clone());
                    votes.insert(key, (1, finding));
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| votes.remove(&key))
        .filter(|(count, _)| *count >= needed)
        .map(|(_, finding)| finding)
        .collect()
}

/// Disagreement between attempts worth logging. Never changes the output.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// One attempt found nothing while another found more than three.
    EmptyVersusBusy {
        /// Largest per-attempt count.
        max: usize,
    },
    /// Coefficient of variation of per-attempt counts above 0.5.
    HighVariance {
        /// The coefficient of variation.
        cv: f64,
    },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::EmptyVersusBusy { max } => {
                write!(f, "one attempt found nothing while another found {max}")
            }
            Anomaly::HighVariance { cv } => write!(f, "coefficient of variation {cv:.2}"),
        }
    }
}

/// Inspect per-attempt issue counts for suspicious disagreement.
///
/// # Examples
///
/// ```
/// use concord_review::consensus::{detect_anomaly, Anomaly};
///
/// assert_eq!(detect_anomaly(&[0, 5]), Some(Anomaly::EmptyVersusBusy { max: 5 }));
/// assert_eq!(detect_anomaly(&[3, 3, 3]), None);
/// assert_eq!(detect_anomaly(&[4]), None);
/// ```
pub fn detect_anomaly(counts: &[usize]) -> Option<Anomaly> {
    if counts.len() < 2 {
        return None;
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    if counts.contains(&0) && max > 3 {
        return Some(Anomaly::EmptyVersusBusy { max });
    }

    let n = counts.len() as f64;
    let mean = counts.iter().sum::<usize>() as f64 / n;
    if mean == 0.0 {
        return None;
    }
    let variance = counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let cv = variance.sqrt() / mean;
    (cv > 0.5).then_some(Anomaly::HighVariance { cv })
}
