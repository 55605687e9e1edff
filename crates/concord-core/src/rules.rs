use std::collections::HashSet;
use std::path::Path;

use crate::error::ConcordError;
use crate::types::{Rule, Severity};

/// Parse natural language rules from a markdown string.
///
/// Supports list items with optional severity tags and id prefixes. `##`
/// headings set the category for the rules below them, and `>` lines under
/// a rule are attached to it as examples.
///
/// Format examples:
/// - `[error] fn-length: Functions must not exceed 50 lines`
/// - `[info] Prefer iterators over index loops`
/// - `Ensure variable names are descriptive`
pub fn parse_rules_markdown(content: &str) -> Vec<Rule> {
    let mut rules: Vec<Rule> = Vec::new();
    let mut category = "general".to_string();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(heading) = line.strip_prefix("##") {
            let heading = heading.trim_start_matches('#').trim();
            if !heading.is_empty() {
                category = generate_slug(heading);
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        if let Some(example) = line.strip_prefix('>') {
            if let Some(last) = rules.last_mut() {
                last.examples.push(example.trim().to_string());
            }
            continue;
        }

        // Strip list markers
        let clean_line = if let Some(stripped) = line.strip_prefix("- ") {
            stripped
        } else if let Some(stripped) = line.strip_prefix("* ") {
            stripped
        } else {
            line
        }
        .trim();

        if clean_line.is_empty() {
            continue;
        }

        // Parse severity "[severity]"
        let (severity, rest) = if clean_line.starts_with('[') {
            if let Some(end) = clean_line.find(']') {
                let sev = parse_severity_tag(&clean_line[1..end]);
                (sev, clean_line[end + 1..].trim())
            } else {
                (Severity::Warning, clean_line)
            }
        } else {
            (Severity::Warning, clean_line)
        };

        // Parse id/description split "id: Description"
        let (id, description) = if let Some(colon_idx) = rest.find(':') {
            let possible_id = rest[..colon_idx].trim();
            if possible_id.len() < 40 && possible_id.chars().filter(|c| *c == ' ').count() < 4 {
                (possible_id.to_string(), rest[colon_idx + 1..].trim().to_string())
            } else {
                (generate_slug(rest), rest.to_string())
            }
        } else {
            (generate_slug(rest), rest.to_string())
        };

        if !description.is_empty() {
            let mut rule = Rule::new(id, description, severity);
            rule.category = category.clone();
            rules.push(rule);
        }
    }

    rules
}

/// Load and parse a markdown rule file.
///
/// # Errors
///
/// Returns [`ConcordError::FileNotFound`] if `path` does not exist and
/// [`ConcordError::Parse`] if two rules share an id.
pub fn load_rules_file(path: &Path) -> Result<Vec<Rule>, ConcordError> {
    if !path.exists() {
        return Err(ConcordError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let rules = parse_rules_markdown(&content);
    check_unique_ids(&rules)?;
    Ok(rules)
}

/// Reject rule lists where two rules share an id.
///
/// # Errors
///
/// Returns [`ConcordError::Parse`] naming the duplicated id.
pub fn check_unique_ids(rules: &[Rule]) -> Result<(), ConcordError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id.as_str()) {
            return Err(ConcordError::Parse(format!("duplicate rule id: {}", rule.id)));
        }
    }
    Ok(())
}

fn parse_severity_tag(tag: &str) -> Severity {
    match tag.trim().to_lowercase().as_str() {
        "error" | "bug" | "critical" => Severity::Error,
        "info" | "note" | "suggestion" => Severity::Info,
        _ => Severity::Warning,
    }
}

fn generate_slug(text: &str) -> String {
    text.split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect()
}
