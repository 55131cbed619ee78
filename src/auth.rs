//! Auth-credential distribution handling.
//!
//! Some benchmark tasks require real credentials (declared via the task's
//! `auth_keys`). The tracking backend hands out one credential distribution
//! per batch; this module formats the matching entries into instruction
//! text for the agent and resolves email identities for two-factor tool
//! wiring.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A credential distribution fetched from the tracking backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthDistribution {
    /// Distribution identifier.
    pub id: String,
    /// Credential data keyed by auth key (e.g. "google", "staysphere").
    #[serde(rename = "loginInfo")]
    pub login_info: Map<String, Value>,
}

impl AuthDistribution {
    /// Formats credential text for the given auth keys.
    ///
    /// Returns `None` when no requested key has usable credential data.
    /// The returned text is appended verbatim to the task instruction.
    pub fn format_for_agent(&self, auth_keys: &[String]) -> Option<String> {
        if auth_keys.is_empty() || self.login_info.is_empty() {
            return None;
        }

        let mut relevant = Vec::new();
        for auth_key in auth_keys {
            match self.login_info.get(auth_key) {
                Some(Value::Object(fields)) => {
                    let details: Vec<String> = fields
                        .iter()
                        .map(|(k, v)| match v {
                            Value::String(s) => format!("{}: {}", k, s),
                            other => format!("{}: {}", k, other),
                        })
                        .collect();
                    if !details.is_empty() {
                        relevant.push(format!("{} with {}", auth_key, details.join(", ")));
                    }
                }
                Some(other) => {
                    tracing::warn!(
                        auth_key = %auth_key,
                        value_type = %json_type_name(other),
                        "Auth data for key is not an object, skipping"
                    );
                }
                None => {
                    tracing::warn!(
                        auth_key = %auth_key,
                        available = ?self.login_info.keys().collect::<Vec<_>>(),
                        "Auth key not found in distribution"
                    );
                }
            }
        }

        if relevant.is_empty() {
            return None;
        }

        Some(format!(
            "\n\nThe following login credentials can be used to complete this task: {}.",
            relevant.join("; ")
        ))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
            .expect("email regex is valid")
    })
}

/// Extracts the first email address mentioned in a task instruction.
pub fn extract_email(instruction: &str) -> Option<&str> {
    email_regex().find(instruction).map(|m| m.as_str())
}

/// Returns the user id portion (before `@`) of an email address.
pub fn email_user_id(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn distribution() -> AuthDistribution {
        serde_json::from_value(json!({
            "id": "dist-1",
            "loginInfo": {
                "staysphere": {"username": "alice", "password": "hunter2"},
                "broken": "not-an-object"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_format_for_agent() {
        let dist = distribution();
        let text = dist
            .format_for_agent(&["staysphere".to_string()])
            .unwrap();

        assert!(text.starts_with("\n\nThe following login credentials"));
        assert!(text.contains("staysphere with "));
        assert!(text.contains("username: alice"));
        assert!(text.contains("password: hunter2"));
        assert!(text.ends_with('.'));
    }

    #[test]
    fn test_format_for_agent_no_match() {
        let dist = distribution();
        assert!(dist.format_for_agent(&["missing".to_string()]).is_none());
        assert!(dist.format_for_agent(&[]).is_none());
    }

    #[test]
    fn test_format_for_agent_skips_non_object_entries() {
        let dist = distribution();
        assert!(dist.format_for_agent(&["broken".to_string()]).is_none());
    }

    #[test]
    fn test_extract_email() {
        assert_eq!(
            extract_email("Log in as test.user+1@mail.example.com and check inbox"),
            Some("test.user+1@mail.example.com")
        );
        assert_eq!(extract_email("no address here"), None);
    }

    #[test]
    fn test_email_user_id() {
        assert_eq!(email_user_id("alice@example.com"), "alice");
        assert_eq!(email_user_id("not-an-email"), "not-an-email");
    }
}
