use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body returned by the server (`{"detail": ...}`).
///
/// `detail` is a plain string for most failures and a list of field errors
/// for request validation failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub detail: Value,
}

impl ApiError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: Value::String(detail.into()),
        }
    }

    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        }
    }

    /// Best-effort decode of an error body; unreadable bodies become their raw text.
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice::<ApiError>(body) {
            Ok(parsed) => parsed,
            Err(_) => Self::new(String::from_utf8_lossy(body).trim().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_plain_detail() {
        let err = ApiError::from_body(br#"{"detail":"Not the author"}"#);
        assert_eq!(err.message(), "Not the author");
    }

    #[test]
    fn joins_validation_messages() {
        let err = ApiError::from_body(
            br#"{"detail":[{"loc":["body","ids"],"msg":"too short"},{"msg":"bad"}]}"#,
        );
        assert_eq!(err.message(), "too short; bad");
    }

    #[test]
    fn falls_back_to_raw_text() {
        let err = ApiError::from_body(b"Internal Server Error");
        assert_eq!(err.message(), "Internal Server Error");
    }
}
