//! Broker ↔ worker wire format.
//!
//! One JSON object per connection in each direction.  Requests are validated
//! by deserializing into [`WorkerRequest`]; anything that does not fit is a
//! `VALIDATION_ERROR` at the worker.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::profile::{OutputFormat, Profile, RuntimeConfig};
use crate::turn::ConversationTurn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub instance_id: String,
    /// Seconds since the Unix epoch at the sender.
    pub timestamp: i64,
    /// Per-request overrides.  Unknown values fall back to the worker's
    /// current settings instead of being rejected.
    #[serde(default, deserialize_with = "lenient_overlay")]
    pub config: ConfigOverlay,
    #[serde(flatten)]
    pub kind: RequestKind,
}

impl WorkerRequest {
    pub fn new(instance_id: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
            config: ConfigOverlay::default(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverlay {
    #[serde(default, deserialize_with = "lenient_str", skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub show_reasoning: Option<bool>,
    #[serde(default, deserialize_with = "lenient_str", skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl ConfigOverlay {
    /// The settings in effect for one request: `base` with every valid
    /// override applied.
    pub fn effective(&self, base: RuntimeConfig) -> RuntimeConfig {
        let mut effective = base;
        effective.merge_lenient(
            self.profile.as_deref(),
            self.show_reasoning,
            self.output_format.as_deref(),
        );
        effective
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    Query {
        message: String,
        /// Idempotency token; a repeated id returns the cached response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Config(ConfigAction),
    RestoreHistory {
        #[serde(default)]
        history: Vec<ConversationTurn>,
        #[serde(default, deserialize_with = "lenient_str", skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
        show_reasoning: Option<bool>,
        #[serde(default, deserialize_with = "lenient_str", skip_serializing_if = "Option::is_none")]
        output_format: Option<String>,
    },
}

// Settings carried alongside a request never fail the schema gate: a value
// of the wrong JSON type reads as absent and the worker keeps its current one.

fn lenient_overlay<'de, D>(deserializer: D) -> Result<ConfigOverlay, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_str<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().map(str::to_string))
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_bool())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConfigAction {
    /// Values travel as strings so an invalid one reaches the worker and is
    /// answered with a typed error instead of a schema failure.
    SetProfile { profile: String },
    SetReasoning { show_reasoning: bool },
    SetOutputFormat { output_format: String },
    /// Read-only: report the current settings.
    Get,
}

impl ConfigAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetProfile { .. } => "set_profile",
            Self::SetReasoning { .. } => "set_reasoning",
            Self::SetOutputFormat { .. } => "set_output_format",
            Self::Get => "get",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InstanceMismatch,
    InvalidProfile,
    InvalidOutputFormat,
    BackendNotFound,
    BackendTimeout,
    BackendFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub instance_id: String,
    pub status: ResponseStatus,
    #[serde(flatten)]
    pub reply: WorkerReply,
}

impl WorkerResponse {
    pub fn new(instance_id: impl Into<String>, reply: WorkerReply) -> Self {
        let status = match reply {
            WorkerReply::Error { .. } => ResponseStatus::Error,
            _ => ResponseStatus::Success,
        };
        Self {
            instance_id: instance_id.into(),
            status,
            reply,
        }
    }

    pub fn error(
        instance_id: impl Into<String>,
        error_code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            instance_id,
            WorkerReply::Error {
                message: message.into(),
                error_code,
            },
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn message(&self) -> &str {
        match &self.reply {
            WorkerReply::Response { message, .. }
            | WorkerReply::ConfigResponse { message, .. }
            | WorkerReply::RestoreResponse { message, .. }
            | WorkerReply::Error { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    Response {
        message: String,
        metadata: QueryMetadata,
    },
    ConfigResponse {
        action: String,
        message: String,
        config: RuntimeConfig,
    },
    RestoreResponse {
        message: String,
        restored: usize,
        config: RuntimeConfig,
    },
    Error {
        message: String,
        error_code: ErrorCode,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub turn_count: usize,
    pub active_profile: Profile,
    pub show_reasoning: bool,
    pub output_format: OutputFormat,
    /// Set when the answer came from the idempotency cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_request_wire_shape() {
        let req = WorkerRequest::new(
            "abc123",
            RequestKind::Query {
                message: "2+2?".into(),
                request_id: None,
            },
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "query");
        assert_eq!(value["instance_id"], "abc123");
        assert_eq!(value["message"], "2+2?");
        assert!(value["timestamp"].is_i64());
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn config_request_parses_nested_action() {
        let req: WorkerRequest = serde_json::from_value(json!({
            "instance_id": "i",
            "type": "config",
            "timestamp": 1,
            "action": "set_profile",
            "profile": "high"
        }))
        .unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Config(ConfigAction::SetProfile {
                profile: "high".into()
            })
        );
        assert_eq!(req.config, ConfigOverlay::default());
    }

    #[test]
    fn missing_required_keys_fail_to_parse() {
        for value in [
            json!({"type": "query", "timestamp": 1, "message": "x"}),
            json!({"instance_id": "i", "timestamp": 1, "message": "x"}),
            json!({"instance_id": "i", "type": "query", "message": "x"}),
            json!({"instance_id": "i", "type": "reboot", "timestamp": 1}),
        ] {
            assert!(serde_json::from_value::<WorkerRequest>(value).is_err());
        }
    }

    #[test]
    fn overlay_falls_back_on_bad_profile() {
        let req: WorkerRequest = serde_json::from_value(json!({
            "instance_id": "i",
            "type": "query",
            "timestamp": 1,
            "message": "x",
            "config": {"profile": "balanced", "show_reasoning": true}
        }))
        .unwrap();
        let base = RuntimeConfig {
            profile: Profile::Low,
            ..RuntimeConfig::default()
        };
        let effective = req.config.effective(base);
        assert_eq!(effective.profile, Profile::Low);
        assert!(effective.show_reasoning);
    }

    #[test]
    fn mistyped_overlay_values_read_as_absent() {
        let req: WorkerRequest = serde_json::from_value(json!({
            "instance_id": "i",
            "type": "query",
            "timestamp": 1,
            "message": "x",
            "config": {"profile": 5, "show_reasoning": "yes", "output_format": ["loud"]}
        }))
        .unwrap();
        assert_eq!(req.config, ConfigOverlay::default());

        let not_an_object: WorkerRequest = serde_json::from_value(json!({
            "instance_id": "i",
            "type": "query",
            "timestamp": 1,
            "message": "x",
            "config": "high"
        }))
        .unwrap();
        assert_eq!(not_an_object.config, ConfigOverlay::default());

        let restore: WorkerRequest = serde_json::from_value(json!({
            "instance_id": "i",
            "type": "restore_history",
            "timestamp": 1,
            "history": [],
            "profile": 7,
            "show_reasoning": 1
        }))
        .unwrap();
        match restore.kind {
            RequestKind::RestoreHistory { profile, show_reasoning, .. } => {
                assert!(profile.is_none());
                assert!(show_reasoning.is_none());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn response_status_follows_reply() {
        let ok = WorkerResponse::new(
            "i",
            WorkerReply::ConfigResponse {
                action: "set_profile".into(),
                message: "profile set to high".into(),
                config: RuntimeConfig::default(),
            },
        );
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["type"], "config_response");

        let err = WorkerResponse::error("i", ErrorCode::InstanceMismatch, "wrong worker");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error_code"], "INSTANCE_MISMATCH");

        let back: WorkerResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}
