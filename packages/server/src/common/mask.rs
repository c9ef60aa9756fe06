//! Sensitive-value masking for durable log rows.
//!
//! Applied to `query_text`, `message`, and `metadata` before they reach the
//! event log. `basic` mode blanks JSON values whose key looks secret-bearing
//! and redacts bearer tokens embedded in free text.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref SECRET_KEY_RE: Regex =
        Regex::new(r"(?i)(token|authorization|secret|password|key)").unwrap();
    static ref BEARER_RE: Regex = Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskMode {
    Off,
    #[default]
    Basic,
}

impl MaskMode {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "off" => MaskMode::Off,
            _ => MaskMode::Basic,
        }
    }
}

/// Redact bearer tokens inside a free-text string.
pub fn mask_text(mode: MaskMode, text: &str) -> String {
    match mode {
        MaskMode::Off => text.to_string(),
        MaskMode::Basic => BEARER_RE.replace_all(text, "Bearer ***").into_owned(),
    }
}

/// Recursively blank values of secret-looking keys and redact embedded
/// bearer tokens in string leaves.
pub fn mask_json(mode: MaskMode, value: &Value) -> Value {
    if mode == MaskMode::Off {
        return value.clone();
    }
    mask_value(value)
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if SECRET_KEY_RE.is_match(key) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), mask_value(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_value).collect()),
        Value::String(text) => Value::String(BEARER_RE.replace_all(text, "Bearer ***").into_owned()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secret_keys_are_blanked() {
        let input = json!({
            "access_token": "abc123",
            "Authorization": "Bearer xyz",
            "api_key": "k",
            "prompt": "a cat surfing"
        });
        let masked = mask_json(MaskMode::Basic, &input);
        assert_eq!(masked["access_token"], "***");
        assert_eq!(masked["Authorization"], "***");
        assert_eq!(masked["api_key"], "***");
        assert_eq!(masked["prompt"], "a cat surfing");
    }

    #[test]
    fn test_nested_and_bearer_in_string() {
        let input = json!({"outer": {"secret_key": "s"}, "note": "sent Bearer abc.def-ghi today"});
        let masked = mask_json(MaskMode::Basic, &input);
        assert_eq!(masked["outer"]["secret_key"], "***");
        assert_eq!(masked["note"], "sent Bearer *** today");
    }

    #[test]
    fn test_off_mode_is_identity() {
        let input = json!({"password": "p"});
        assert_eq!(mask_json(MaskMode::Off, &input), input);
        assert_eq!(mask_text(MaskMode::Off, "Bearer abc"), "Bearer abc");
    }
}
