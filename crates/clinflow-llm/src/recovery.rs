//! Structured-output recovery for unreliable model text.
//!
//! Models asked for a single JSON object routinely wrap it in chat delimiters
//! or markdown fences, restart mid-answer, or split the fields across several
//! brace blocks. [`OutputRecoveryParser::parse`] tries, in order:
//!
//! 1. delimiter stripping plus a direct parse (then again after key repair);
//! 2. restart recovery, scanning opening braces from last to first;
//! 3. balanced-block extraction with minimal repair and a shallow merge;
//!
//! and returns an empty map when nothing parses.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use clinflow_core::error::{ClinflowError, Result};

/// Chat artifacts and fences emitted around structured answers. Longest first.
pub const DEFAULT_DELIMITERS: &[&str] = &[
    "<start_of_turn>model",
    "<start_of_turn>user",
    "<start_of_turn>",
    "<end_of_turn>",
    "```json",
    "```",
];

pub struct OutputRecoveryParser {
    delimiters: Vec<String>,
}

impl OutputRecoveryParser {
    pub fn new() -> Self {
        Self::with_delimiters(DEFAULT_DELIMITERS.iter().map(|d| d.to_string()).collect())
    }

    pub fn with_delimiters(mut delimiters: Vec<String>) -> Self {
        delimiters.sort_by_key(|d| std::cmp::Reverse(d.len()));
        Self { delimiters }
    }

    /// Recover one object from `text`. Empty map means nothing was recoverable.
    pub fn parse(&self, text: &str) -> Map<String, Value> {
        // 1. Strip delimiters outside string literals, parse directly
        let stripped = self.strip_outside_strings(text);
        if let Some(obj) = parse_lenient(stripped.trim()) {
            return obj;
        }

        let mut cleaned = self.strip_everywhere(text);
        let repaired = repair_keys(&cleaned);
        if repaired != cleaned {
            if let Some(obj) = parse_lenient(repaired.trim()) {
                debug!("Recovered JSON after key repair");
                return obj;
            }
            cleaned = repaired;
        }
        let cleaned = cleaned.trim();

        // 2. Restart recovery
        if let Some(obj) = recover_restart(cleaned) {
            debug!("Recovered JSON from restart pattern");
            return obj;
        }

        // 3. Balanced-block merge
        let blocks = extract_blocks(cleaned);
        let mut merged = Map::new();
        for block in &blocks {
            let obj = parse_lenient(block).or_else(|| parse_lenient(&repair_block(block)));
            if let Some(obj) = obj {
                merged.extend(obj);
            }
        }
        if !merged.is_empty() {
            debug!(blocks = blocks.len(), "Merged JSON blocks");
            return merged;
        }

        let preview: String = cleaned.chars().take(100).collect();
        warn!(preview = %preview, "Failed to recover JSON from model output");
        Map::new()
    }

    /// Like [`parse`](Self::parse), but an empty result is an `LlmParse` error.
    pub fn parse_object(&self, text: &str) -> Result<Map<String, Value>> {
        let obj = self.parse(text);
        if obj.is_empty() {
            let preview: String = text.chars().take(80).collect();
            return Err(ClinflowError::LlmParse(format!(
                "no structured object in model output: {}",
                preview
            )));
        }
        Ok(obj)
    }

    fn strip_outside_strings(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut in_string = false;
        let mut escape = false;
        let mut rest = text;

        while let Some(ch) = rest.chars().next() {
            if !in_string {
                if let Some(d) = self.delimiters.iter().find(|d| rest.starts_with(d.as_str())) {
                    rest = &rest[d.len()..];
                    continue;
                }
            }
            if escape {
                escape = false;
            } else if ch == '\\' && in_string {
                escape = true;
            } else if ch == '"' {
                in_string = !in_string;
            }
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        out
    }

    fn strip_everywhere(&self, text: &str) -> String {
        self.delimiters
            .iter()
            .fold(text.to_string(), |acc, d| acc.replace(d.as_str(), ""))
    }
}

impl Default for OutputRecoveryParser {
    fn default() -> Self {
        Self::new()
    }
}

fn swallowed_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "40 yo male, triage_level": -> "40 yo male", "triage_level":
    RE.get_or_init(|| {
        Regex::new(r#""([^"{}\[\]:]*?),\s*([a-z_]+)":"#).expect("valid swallowed-key regex")
    })
}

fn unquoted_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // , red_flags": -> , "red_flags":
    RE.get_or_init(|| Regex::new(r#"([,{]\s*)([a-z_]+)":"#).expect("valid unquoted-key regex"))
}

fn repair_keys(text: &str) -> String {
    let fixed = swallowed_key().replace_all(text, r#""$1", "$2":"#);
    let fixed = unquoted_key().replace_all(&fixed, r#"$1"$2":"#);
    fixed.replace("\"\",", "\",")
}

/// Parse an object, retrying once with raw control characters escaped.
fn parse_lenient(text: &str) -> Option<Map<String, Value>> {
    let as_object = |v: Value| match v {
        Value::Object(map) => Some(map),
        _ => None,
    };
    match serde_json::from_str::<Value>(text) {
        Ok(v) => as_object(v),
        Err(_) => serde_json::from_str::<Value>(&escape_control_chars(text))
            .ok()
            .and_then(as_object),
    }
}

fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;
    for ch in text.chars() {
        if in_string && !escape && (ch as u32) < 0x20 {
            match ch {
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                other => out.push_str(&format!("\\u{:04x}", other as u32)),
            }
            continue;
        }
        if escape {
            escape = false;
        } else if ch == '\\' && in_string {
            escape = true;
        } else if ch == '"' {
            in_string = !in_string;
        }
        out.push(ch);
    }
    out
}

/// Try each opening brace from last to first, as-is and trimmed to the last `}`.
///
/// Candidates preceded by an already complete object are skipped: that shape
/// is several partial answers, which the block merge handles.
fn recover_restart(text: &str) -> Option<Map<String, Value>> {
    let positions: Vec<usize> = text.match_indices('{').map(|(i, _)| i).collect();
    for &pos in positions.iter().rev() {
        if pos > 0 && prefix_has_complete_object(&text[..pos]) {
            continue;
        }
        let candidate = &text[pos..];
        if let Some(obj) = parse_lenient(candidate).filter(|o| !o.is_empty()) {
            return Some(obj);
        }
        if let Some(last) = candidate.rfind('}') {
            if let Some(obj) = parse_lenient(&candidate[..=last]).filter(|o| !o.is_empty()) {
                return Some(obj);
            }
        }
    }
    None
}

fn prefix_has_complete_object(prefix: &str) -> bool {
    extract_blocks(prefix)
        .iter()
        .any(|b| b.ends_with('}') && parse_lenient(b).is_some_and(|o| !o.is_empty()))
}

/// Top-level brace blocks, honoring string literals and escapes.
///
/// A trailing block left open at end of input is included so it can be repaired.
fn extract_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        blocks.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        blocks.push(&text[s..]);
    }
    blocks
}

/// Close an odd quote and append missing closing braces.
fn repair_block(block: &str) -> String {
    let mut fixed = block.trim_end().trim_end_matches(',').to_string();
    if fixed.matches('"').count() % 2 != 0 {
        fixed.push('"');
    }
    let opens = fixed.matches('{').count();
    let closes = fixed.matches('}').count();
    if opens > closes {
        fixed.push_str(&"}".repeat(opens - closes));
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> OutputRecoveryParser {
        OutputRecoveryParser::new()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plain_object() {
        let out = parser().parse(r#"{"triage_level": "URGENT", "red_flags": []}"#);
        assert_eq!(out, obj(json!({"triage_level": "URGENT", "red_flags": []})));
    }

    #[test]
    fn test_round_trip_with_delimiters() {
        let original = json!({
            "subjective": "Patient reports ```fenced``` text and <end_of_turn> tokens",
            "nested": {"a": [1, 2, {"b": "}{"}]},
            "plan": "Line one\nLine two",
        });
        let serialized = serde_json::to_string(&original).unwrap();
        for (open, close) in [
            ("<start_of_turn>model\n", "<end_of_turn>"),
            ("```json\n", "\n```"),
            ("<start_of_turn>", "```"),
        ] {
            let wrapped = format!("{}{}{}", open, serialized, close);
            assert_eq!(parser().parse(&wrapped), obj(original.clone()), "wrap {:?}", open);
        }
    }

    #[test]
    fn test_restart_recovery() {
        let text = r#"{"triage_level": "EMERG, "red_flags": [<start_of_turn>model
{"triage_level": "EMERGENCY", "red_flags": ["chest pain"], "differential_diagnoses": ["ACS"]}"#;
        let out = parser().parse(text);
        assert_eq!(out["triage_level"], "EMERGENCY");
        assert_eq!(out["red_flags"], json!(["chest pain"]));
    }

    #[test]
    fn test_restart_with_trailing_chatter() {
        let text = "{\"risk_level\": \"HI<end_of_turn>{\"risk_level\": \"HIGH\"} Hope this helps!";
        assert_eq!(parser().parse(text)["risk_level"], "HIGH");
    }

    #[test]
    fn test_block_merge() {
        let text = r#"{"subjective": "cough for 3 days", "objective": "T 38.2"}
Then the rest:
{"assessment": "likely viral URTI", "plan": "fluids, rest"}"#;
        let out = parser().parse(text);
        assert_eq!(out.len(), 4);
        assert_eq!(out["subjective"], "cough for 3 days");
        assert_eq!(out["plan"], "fluids, rest");
    }

    #[test]
    fn test_block_merge_ignores_braces_in_strings() {
        let text = r#"{"a": "has } brace"} {"b": "has { brace"}"#;
        let out = parser().parse(text);
        assert_eq!(out["a"], "has } brace");
        assert_eq!(out["b"], "has { brace");
    }

    #[test]
    fn test_truncated_block_repaired() {
        let text = r#"Here you go: {"referral_needed": true, "referral_type": "Cardiology"#;
        let out = parser().parse(text);
        assert_eq!(out["referral_needed"], true);
        assert_eq!(out["referral_type"], "Cardiology");
    }

    #[test]
    fn test_swallowed_key_repair() {
        let text = r#"{"patient": "40 yo male, triage_level": "URGENT"}"#;
        let out = parser().parse(text);
        assert_eq!(out["patient"], "40 yo male");
        assert_eq!(out["triage_level"], "URGENT");
    }

    #[test]
    fn test_unquoted_key_repair() {
        let text = r#"{"risk_level": "LOW", risk_factors": ["smoking"]}"#;
        let out = parser().parse(text);
        assert_eq!(out["risk_factors"], json!(["smoking"]));
    }

    #[test]
    fn test_raw_newlines_in_strings() {
        let text = "{\"plan\": \"rest\nfluids\"}";
        assert_eq!(parser().parse(text)["plan"], "rest\nfluids");
    }

    #[test]
    fn test_nothing_recoverable() {
        assert!(parser().parse("I cannot answer that.").is_empty());
        assert!(parser().parse("[1, 2, 3]").is_empty());
        assert!(matches!(
            parser().parse_object("no json here"),
            Err(ClinflowError::LlmParse(_))
        ));
    }

    #[test]
    fn test_extract_blocks_depth() {
        let blocks = extract_blocks(r#"x {"a": {"b": 1}} y {"c": "}"} {"d": "#);
        assert_eq!(blocks, vec![r#"{"a": {"b": 1}}"#, r#"{"c": "}"}"#, r#"{"d": "#]);
    }
}
