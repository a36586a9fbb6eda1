use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::profile::{InvalidValue, OutputFormat, Profile};

/// Raw client → daemon request as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ClientRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn for_client(command: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("unknown command '{0}'; try /help")]
    UnknownCommand(String),
    #[error("command '{0}' requires a client_id")]
    MissingClientId(&'static str),
    #[error("ask requires a non-empty question")]
    EmptyQuestion,
    #[error("{command} expects state 'on' or 'off', got '{value}'")]
    InvalidToggle { command: &'static str, value: String },
    #[error(transparent)]
    InvalidValue(#[from] InvalidValue),
}

/// A validated daemon command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Help,
    Health,
    /// `None` summarizes every tracked client.
    Status { client_id: Option<String> },
    Ask {
        client_id: String,
        question: String,
        request_id: Option<String>,
    },
    ConfigGet { client_id: String },
    ConfigSet { client_id: String, profile: Profile },
    Reasoning { client_id: String, show: bool },
    OutputFormat { client_id: String, format: OutputFormat },
    Stop { client_id: String },
    Shutdown,
}

impl TryFrom<ClientRequest> for ClientCommand {
    type Error = RequestError;

    fn try_from(req: ClientRequest) -> Result<Self, Self::Error> {
        let name = req.command.trim().trim_start_matches('/').to_ascii_lowercase();
        // Older clients spell every command with a `codex-` prefix.
        let name = name.strip_prefix("codex-").unwrap_or(&name);
        let client_id = req.client_id.filter(|id| !id.trim().is_empty());

        match name {
            "help" => Ok(Self::Help),
            "health" => Ok(Self::Health),
            "status" => Ok(Self::Status { client_id }),
            "shutdown" => Ok(Self::Shutdown),
            "ask" | "query" => {
                let client_id = require(&client_id, "ask")?;
                let question = req
                    .question
                    .filter(|q| !q.trim().is_empty())
                    .ok_or(RequestError::EmptyQuestion)?;
                Ok(Self::Ask {
                    client_id,
                    question,
                    request_id: req.request_id,
                })
            }
            "config" => {
                let client_id = require(&client_id, "config")?;
                match req.profile.filter(|p| !p.trim().is_empty()) {
                    Some(raw) => Ok(Self::ConfigSet {
                        client_id,
                        profile: raw.parse()?,
                    }),
                    None => Ok(Self::ConfigGet { client_id }),
                }
            }
            "reasoning" => {
                let client_id = require(&client_id, "reasoning")?;
                let show = parse_toggle("reasoning", req.state.as_deref())?;
                Ok(Self::Reasoning { client_id, show })
            }
            "output-format" | "output_format" | "final-only" | "final_only" => {
                let client_id = require(&client_id, "output-format")?;
                let format = if parse_toggle("output-format", req.state.as_deref())? {
                    OutputFormat::FinalOnly
                } else {
                    OutputFormat::FinalWithDetails
                };
                Ok(Self::OutputFormat { client_id, format })
            }
            "stop" => Ok(Self::Stop {
                client_id: require(&client_id, "stop")?,
            }),
            _ => Err(RequestError::UnknownCommand(req.command)),
        }
    }
}

fn require(client_id: &Option<String>, command: &'static str) -> Result<String, RequestError> {
    client_id
        .clone()
        .ok_or(RequestError::MissingClientId(command))
}

fn parse_toggle(command: &'static str, state: Option<&str>) -> Result<bool, RequestError> {
    match state.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        other => Err(RequestError::InvalidToggle {
            command,
            value: other.unwrap_or_default().to_string(),
        }),
    }
}

/// Daemon → client reply: `{"success": true, "response": ...}` or
/// `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaemonReply {
    Success { success: bool, response: Value },
    Failure { error: String },
}

impl DaemonReply {
    pub fn ok(response: impl Into<Value>) -> Self {
        Self::Success {
            success: true,
            response: response.into(),
        }
    }

    pub fn err(error: impl ToString) -> Self {
        Self::Failure {
            error: error.to_string(),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Self::Success { response, .. } => Ok(response),
            Self::Failure { error } => Err(error),
        }
    }
}
