use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{AppError, Result};

/// Pull the first well-formed JSON object out of a model completion.
///
/// The model occasionally wraps its JSON in prose or a code fence; this is a
/// contract of the interface, not an accident, so three strategies run in
/// order: raw parse, fence-stripped parse, then the substring from the first
/// `{` to the last `}`.
pub fn extract_json(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }

    if let Some(stripped) = strip_code_fence(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(stripped.trim()) {
            if v.is_object() {
                return Ok(v);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if v.is_object() {
                    return Ok(v);
                }
            }
        }
    }

    Err(AppError::Analyst(format!(
        "no JSON object found in completion: {}",
        &trimmed[..trimmed.len().min(200)]
    )))
}

pub fn extract_object<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let value = extract_json(raw)?;
    serde_json::from_value(value)
        .map_err(|e| AppError::Analyst(format!("completion object has the wrong shape: {e}")))
}

/// Strip a leading/trailing markdown fence (``` or ```json).
fn strip_code_fence(raw: &str) -> Option<String> {
    let rest = raw.strip_prefix("```")?;
    // drop the language tag line, if any
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    Some(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Shock {
        target_market: String,
        direction: String,
    }

    #[test]
    fn raw_object_parses() {
        let raw = r#"{"target_market":"fed-cut-dec","direction":"UP"}"#;
        let shock: Shock = extract_object(raw).unwrap();
        assert_eq!(shock.target_market, "fed-cut-dec");
    }

    #[test]
    fn fenced_object_parses() {
        let raw = "```json\n{\"target_market\":\"fed-cut-dec\",\"direction\":\"DOWN\"}\n```";
        let shock: Shock = extract_object(raw).unwrap();
        assert_eq!(shock.direction, "DOWN");
    }

    #[test]
    fn fence_without_language_tag_parses() {
        let raw = "```\n{\"target_market\":\"x\",\"direction\":\"UP\"}\n```";
        assert!(extract_json(raw).unwrap().is_object());
    }

    #[test]
    fn prose_wrapped_object_parses() {
        let raw = "Here is my analysis of the scenario.\n\n{\"target_market\": \"btc-100k\", \"direction\": \"UP\"}\n\nLet me know if you need more.";
        let shock: Shock = extract_object(raw).unwrap();
        assert_eq!(shock.target_market, "btc-100k");
    }

    #[test]
    fn bare_array_is_not_an_object() {
        assert!(extract_json(r#"[1, 2, 3]"#).is_err());
    }

    #[test]
    fn plain_prose_fails_cleanly() {
        let err = extract_json("I could not classify this pair.").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn wrong_shape_is_reported() {
        let raw = r#"{"unexpected": true}"#;
        let res: Result<Shock> = extract_object(raw);
        assert!(res.is_err());
    }
}
