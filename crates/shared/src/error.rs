use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure payload shape used by the chat backend: `{"detail": ...}`,
/// where `detail` is a validation array, an object, or a plain string.
/// Successful join replies reuse the same envelope via `message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiFailure {
    #[serde(default)]
    pub detail: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiFailure {
    /// Tolerant parse: a non-JSON body yields the empty envelope so the
    /// caller falls through to its fallback text.
    pub fn from_body(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    /// Collapse the server's failure detail into one displayable string.
    /// Validation failures arrive as `[{"msg": ..}, ..]`; only the first
    /// message is surfaced to keep the UI single-message.
    pub fn display_message(&self, fallback: &str) -> String {
        match &self.detail {
            Value::String(text) => text.clone(),
            Value::Array(items) => items
                .first()
                .and_then(|item| item.get("msg"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.to_string()),
            Value::Object(_) => self.detail.to_string(),
            _ => fallback.to_string(),
        }
    }
}
