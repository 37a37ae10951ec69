//! Redaction of secret-shaped values before they reach a log line or a
//! debug surface.

use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Keys whose values are always replaced wholesale, regardless of shape.
const REDACT_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "clientsecret",
    "apikey",
    "token",
    "accesstoken",
    "refreshtoken",
    "idtoken",
    "authorization",
    "bearer",
    "credential",
];

fn normalise(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_redact_key(key: &str) -> bool {
    REDACT_KEYS.contains(&normalise(key).as_str())
}

/// Mask a long opaque bearer-shaped token to its leading and trailing two
/// characters, e.g. `sk-ant-abcdef...` -> `sk...ef`.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return REDACTED.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}...{tail}")
}

fn looks_like_token(value: &str) -> bool {
    value.len() >= 20
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '/' | '='))
}

fn redact_string(value: &str) -> String {
    if let Some(rest) = value.strip_prefix("Bearer ") {
        return format!("Bearer {}", mask_token(rest));
    }
    if looks_like_token(value) {
        return mask_token(value);
    }
    value.to_string()
}

/// Recursively redact a JSON value in place. A key is sensitive if it
/// normalises to an entry in [`REDACT_KEYS`]; any surviving string is
/// checked against [`looks_like_token`].
pub fn redact_json(value: &mut Value) {
    redact_json_inner(value, None);
}

fn redact_json_inner(value: &mut Value, key: Option<&str>) {
    let sensitive = key.is_some_and(is_redact_key);
    match value {
        Value::Object(map) => {
            for (child_key, child_value) in map.iter_mut() {
                redact_json_inner(child_value, Some(child_key));
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_json_inner(item, None);
            }
        }
        Value::String(text) => {
            if sensitive {
                *text = REDACTED.to_string();
            } else {
                *text = redact_string(text);
            }
        }
        _ => {
            if sensitive {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
}

/// Redact a flat environment-overlay map before it is logged.
pub fn redact_env(env: &std::collections::HashMap<String, String>) -> std::collections::HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            if is_redact_key(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), redact_string(v))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_wholesale() {
        let mut value = json!({"password": "hunter2", "note": "fine"});
        redact_json(&mut value);
        assert_eq!(value["password"], "[REDACTED]");
        assert_eq!(value["note"], "fine");
    }

    #[test]
    fn masks_bearer_tokens_to_leading_and_trailing_two_chars() {
        let masked = mask_token("sk-ant-abcdefghijklmno");
        assert!(masked.starts_with("sk"));
        assert!(masked.ends_with("no"));
        assert!(!masked.contains("abcdefghijklm"));
    }

    #[test]
    fn redacts_nested_structures() {
        let mut value = json!({"outer": {"inner": {"api_key": "sk-abc123def456ghi789"}}});
        redact_json(&mut value);
        assert_eq!(value["outer"]["inner"]["api_key"], "[REDACTED]");
    }

    #[test]
    fn env_overlay_redaction_masks_secret_keys() {
        let mut env = std::collections::HashMap::new();
        env.insert("API_TOKEN".to_string(), "value".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        let redacted = redact_env(&env);
        assert_eq!(redacted.get("API_TOKEN"), Some(&"[REDACTED]".to_string()));
        assert_eq!(redacted.get("PATH"), Some(&"/usr/bin".to_string()));
    }
}
