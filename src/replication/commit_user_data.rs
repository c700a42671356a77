//! Checkpoint stored alongside an index commit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resume information committed with the index. The scheduler treats it as
/// opaque and only hands it to the indexer once a batch fully succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCommitUserData {
    /// Change-stream resume token of the last applied event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Value>,
    /// Resume point of an interrupted initial sync (last scanned `_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_sync_resume: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceeded_limits_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_format_version: Option<u32>,
}

impl IndexCommitUserData {
    pub fn from_resume_token(token: Value) -> Self {
        Self {
            resume_token: Some(token),
            ..Self::default()
        }
    }

    pub fn from_initial_sync_resume(last_scanned_id: Value) -> Self {
        Self {
            initial_sync_resume: Some(last_scanned_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes stored user data. An empty string is the empty checkpoint.
    pub fn decode(encoded: &str) -> serde_json::Result<Self> {
        if encoded.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(encoded)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_skips_absent_fields() {
        let data = IndexCommitUserData::from_resume_token(json!({ "_data": "8263" }));
        assert_eq!(data.encode().unwrap(), r#"{"resumeToken":{"_data":"8263"}}"#);
    }

    #[test]
    fn test_decode_empty_and_full() {
        assert!(IndexCommitUserData::decode("").unwrap().is_empty());

        let decoded = IndexCommitUserData::decode(
            r#"{"initialSyncResume":42,"exceededLimitsReason":"too many fields","indexFormatVersion":6}"#,
        )
        .unwrap();
        assert_eq!(decoded.initial_sync_resume, Some(json!(42)));
        assert_eq!(decoded.exceeded_limits_reason.as_deref(), Some("too many fields"));
        assert_eq!(decoded.index_format_version, Some(6));
        assert!(decoded.resume_token.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(IndexCommitUserData::decode("{not json").is_err());
    }
}
