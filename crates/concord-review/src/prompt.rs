use std::fmt::Write as _;

use concord_core::{Chunk, Finding, Rule, Severity};
use serde_json::Value;

use crate::llm::ChatMessage;

const SYSTEM_PROMPT: &str = "\
You are Concord, a meticulous code reviewer. You check source code against \
a fixed list of rules and report every violation you can point to.

Rules of engagement:
- Only report violations of the rules you are given, using their exact ids
- Line numbers refer to the numbers shown in the left margin of the code
- line_start and line_end must cover the whole offending construct
- Do not speculate about code you cannot see
- If the code violates no rule, report nothing

Respond with a JSON object:
{
  \"issues\": [
    {
      \"rule_id\": \"the-rule-id\",
      \"severity\": \"error\" | \"warning\" | \"info\",
      \"line_start\": 12,
      \"line_end\": 18,
      \"description\": \"What is wrong and why it violates the rule\",
      \"suggestion\": \"How to fix it\",
      \"code_snippet\": \"Optional offending code\"
    }
  ]
}

If you find no issues, return: { \"issues\": [] }";

/// Build the system prompt for rule checking.
///
/// # Examples
///
/// ```
/// use concord_review::prompt::build_system_prompt;
///
/// let prompt = build_system_prompt();
/// assert!(prompt.contains("Concord"));
/// assert!(prompt.contains("\"issues\""));
/// ```
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Build the user prompt listing the rules and the numbered chunk.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use concord_core::{Chunk, Rule, Severity};
/// use concord_review::prompt::build_chunk_prompt;
///
/// let chunk = Chunk {
///     content: "let x = 1;".into(),
///     start_line: 7,
///     end_line: 7,
///     index: 0,
///     file_path: PathBuf::from("src/main.rs"),
/// };
/// let rules = vec![Rule::new("no-magic", "Avoid magic numbers", Severity::Info)];
/// let prompt = build_chunk_prompt(&chunk, &rules);
/// assert!(prompt.contains("no-magic"));
/// assert!(prompt.contains("    7 | let x = 1;"));
/// ```
pub fn build_chunk_prompt(chunk: &Chunk, rules: &[Rule]) -> String {
    let mut prompt = String::from("Check the code below against these rules:\n\n");
    for rule in rules {
        let _ = writeln!(
            prompt,
            "- [{}] {} ({}): {}",
            rule.severity, rule.id, rule.category, rule.description
        );
        for example in &rule.examples {
            let _ = writeln!(prompt, "    example: {example}");
        }
    }

    let _ = write!(
        prompt,
        "\nFile: {} (lines {}-{})\n\n```\n",
        chunk.file_path.display(),
        chunk.start_line,
        chunk.end_line
    );
    for (number, line) in chunk.line_map() {
        let _ = writeln!(prompt, "{number:>5} | {line}");
    }
    prompt.push_str("```\n");
    prompt
}

/// The full conversation for one attempt on `chunk`.
pub fn build_conversation(chunk: &Chunk, rules: &[Rule]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(build_system_prompt()),
        ChatMessage::user(build_chunk_prompt(chunk, rules)),
    ]
}

/// Parse an LLM response into findings.
///
/// Accepts fenced JSON, bare JSON, or JSON embedded in prose. The payload
/// may be an array of findings or an object holding an `issues` (or
/// `findings`) array. Candidates missing a required field are dropped one
/// by one. Anything unparseable yields an empty list.
///
/// # Examples
///
/// ```
/// use concord_review::prompt::parse_response;
///
/// let raw = r#"```json
/// {"issues":[{"rule_id":"R1","severity":"ERROR","line_start":3,"line_end":5,"description":"bad"}]}
/// ```"#;
/// let findings = parse_response(raw);
/// assert_eq!(findings.len(), 1);
/// assert_eq!(findings[0].line_end, 5);
///
/// assert!(parse_response("I could not review this file.").is_empty());
/// ```
pub fn parse_response(raw: &str) -> Vec<Finding> {
    let Some(payload) = extract_json(raw) else {
        if !raw.trim().is_empty() {
            tracing::warn!(len = raw.len(), "LLM response contained no JSON payload");
        }
        return Vec::new();
    };

    let candidates: Vec<Value> = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("issues").or_else(|| map.remove("findings")) {
            Some(Value::Array(items)) => items,
            Some(_) => Vec::new(),
            None if map.contains_key("rule_id") || map.contains_key("ruleId") => {
                vec![Value::Object(map)]
            }
            None => Vec::new(),
        },
        _ => Vec::new(),
    };

    let total = candidates.len();
    let findings: Vec<Finding> = candidates.iter().filter_map(finding_from_value).collect();
    if findings.len() < total {
        tracing::debug!(
            dropped = total - findings.len(),
            kept = findings.len(),
            "dropped malformed findings"
        );
    }
    findings
}

fn extract_json(raw: &str) -> Option<Value> {
    if let Some(inner) = fenced_block(raw) {
        if let Ok(v) = serde_json::from_str(inner) {
            return Some(v);
        }
    }

    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    // JSON embedded in prose: widest span between matching brackets
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Contents of the first ``` fence, with any language tag removed.
fn fenced_block(s: &str) -> Option<&str> {
    let start = s.find("```")?;
    let after = &s[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn finding_from_value(value: &Value) -> Option<Finding> {
    let obj = value.as_object()?;
    let field = |names: &[&str]| names.iter().find_map(|n| obj.get(*n));

    let rule_id = field(&["rule_id", "ruleId", "rule"])?.as_str()?.trim();
    if rule_id.is_empty() {
        return None;
    }
    let line_start = line_number(field(&["line_start", "lineStart", "start_line"])?)?;
    let line_end = line_number(field(&["line_end", "lineEnd", "end_line"])?)?;
    let description = field(&["description", "message"])?.as_str()?.trim();
    if description.is_empty() {
        return None;
    }

    let severity = field(&["severity"])
        .and_then(Value::as_str)
        .map(Severity::from_lossy)
        .unwrap_or(Severity::Info);
    let suggestion = field(&["suggestion", "fix"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let code_snippet = field(&["code_snippet", "codeSnippet"])
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    Some(Finding {
        rule_id: rule_id.to_string(),
        severity,
        line_start,
        line_end,
        description: description.to_string(),
        suggestion,
        code_snippet,
    })
}

fn line_number(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Some(n.clamp(0, i64::from(u32::MAX)) as u32)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn chunk() -> Chunk {
        Chunk {
            content: "fn a() {\n    todo!()\n}".into(),
            start_line: 40,
            end_line: 42,
            index: 1,
            file_path: PathBuf::from("src/a.rs"),
        }
    }

    #[test]
    fn chunk_prompt_numbers_lines_and_lists_examples() {
        let mut rule = Rule::new("no-todo", "No todo!() in shipped code", Severity::Error);
        rule.examples = vec!["todo!()".into()];
        let prompt = build_chunk_prompt(&chunk(), &[rule]);
        assert!(prompt.contains("- [error] no-todo (general): No todo!() in shipped code"));
        assert!(prompt.contains("example: todo!()"));
        assert!(prompt.contains("   41 |     todo!()"));
        assert!(prompt.contains("src/a.rs (lines 40-42)"));
    }

    #[test]
    fn conversation_has_system_then_user() {
        let conv = build_conversation(&chunk(), &[]);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].role, crate::llm::Role::System);
        assert_eq!(conv[1].role, crate::llm::Role::User);
    }

    #[test]
    fn parse_bare_object() {
        let raw = r#"{"issues":[{"rule_id":"R","severity":"warning","line_start":1,"line_end":2,"description":"d","suggestion":"s"}]}"#;
        let f = parse_response(raw);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].severity, Severity::Warning);
        assert_eq!(f[0].suggestion, "s");
    }

    #[test]
    fn parse_bare_array() {
        let raw = r#"[{"rule_id":"R","line_start":"4","line_end":" 6 ","description":"d"}]"#;
        let f = parse_response(raw);
        assert_eq!((f[0].line_start, f[0].line_end), (4, 6));
        assert_eq!(f[0].severity, Severity::Info);
    }

    #[test]
    fn parse_fenced_with_prose_around() {
        let raw = "Here you go:\n```json\n{\"findings\":[{\"rule_id\":\"R\",\"line_start\":1,\"line_end\":1,\"description\":\"d\"}]}\n```\nThanks!";
        assert_eq!(parse_response(raw).len(), 1);
    }

    #[test]
    fn parse_json_embedded_in_prose() {
        let raw = "Result: {\"issues\": [{\"rule_id\":\"R\",\"line_start\":2,\"line_end\":3,\"description\":\"d\"}]} done";
        assert_eq!(parse_response(raw).len(), 1);
    }

    #[test]
    fn parse_garbage_is_empty() {
        assert!(parse_response("").is_empty());
        assert!(parse_response("no json here").is_empty());
        assert!(parse_response("{\"issues\": [").is_empty());
        assert!(parse_response("42").is_empty());
    }

    #[test]
    fn malformed_element_is_dropped_alone() {
        let raw = r#"{"issues":[
            {"rule_id":"R","line_start":1,"line_end":2,"description":"ok"},
            {"rule_id":"R","line_end":2,"description":"no start"},
            {"rule_id":"","line_start":1,"line_end":2,"description":"empty id"},
            {"rule_id":"R","line_start":1,"line_end":2,"description":"   "},
            {"rule_id":"R","line_start":"x","line_end":2,"description":"bad start"},
            "not an object",
            {"rule_id":"R2","line_start":5,"line_end":9,"description":"also ok"}
        ]}"#;
        let f = parse_response(raw);
        let ids: Vec<_> = f.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["R", "R2"]);
    }

    #[test]
    fn unknown_severity_defaults_to_info() {
        let raw = r#"[{"rule_id":"R","severity":"CRITICAL","line_start":1,"line_end":1,"description":"d"}]"#;
        assert_eq!(parse_response(raw)[0].severity, Severity::Info);
    }

    #[test]
    fn negative_lines_are_clamped_for_normalization() {
        let raw = r#"[{"rule_id":"R","line_start":-3,"line_end":2,"description":"d"}]"#;
        let f = parse_response(raw);
        assert_eq!(f[0].line_start, 0);
        assert_eq!(f[0].clone().normalized().line_start, 1);
    }

    #[test]
    fn camel_case_aliases_are_accepted() {
        let raw = r#"[{"ruleId":"R","lineStart":3,"lineEnd":4,"description":"d","codeSnippet":"x()"}]"#;
        let f = parse_response(raw);
        assert_eq!(f[0].code_snippet.as_deref(), Some("x()"));
    }

    #[test]
    fn single_finding_object() {
        let raw = r#"{"rule_id":"R","line_start":3,"line_end":4,"description":"d"}"#;
        assert_eq!(parse_response(raw).len(), 1);
    }
}
