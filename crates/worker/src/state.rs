use std::collections::VecDeque;

use askd_core::{
    ConfigAction, ConversationTurn, ErrorCode, QueryMetadata, RequestKind, RuntimeConfig,
    TurnWindow, WorkerReply, WorkerRequest, WorkerResponse,
};
use askd_exec::Backend;
use askd_store::PersistedState;
use tracing::{info, warn};

use crate::prompt::{build_prompt, render_answer};

/// Responses remembered for idempotent `query` retries.
const REPLAY_CAPACITY: usize = 16;

/// Result of handling one request.
#[derive(Debug)]
pub struct Handled {
    pub response: WorkerResponse,
    /// The conversation or settings changed and should be checkpointed.
    pub dirty: bool,
}

impl Handled {
    fn clean(response: WorkerResponse) -> Self {
        Self {
            response,
            dirty: false,
        }
    }

    fn dirty(response: WorkerResponse) -> Self {
        Self {
            response,
            dirty: true,
        }
    }
}

/// The authoritative conversation and settings of one worker.
#[derive(Debug)]
pub struct WorkerState {
    instance_id: String,
    window: TurnWindow,
    config: RuntimeConfig,
    history_in_prompt: usize,
    replay: VecDeque<(String, WorkerResponse)>,
}

impl WorkerState {
    pub fn new(instance_id: impl Into<String>, max_turns: usize, history_in_prompt: usize) -> Self {
        Self {
            instance_id: instance_id.into(),
            window: TurnWindow::new(max_turns),
            config: RuntimeConfig::default(),
            history_in_prompt,
            replay: VecDeque::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub fn turn_count(&self) -> usize {
        self.window.len()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.window.to_vec()
    }

    /// Adopt a validated persisted document.
    pub fn seed(&mut self, persisted: PersistedState) {
        self.window.replace(persisted.conversation_history);
        self.config = persisted.config;
    }

    /// Parse, validate, and handle one raw request line.
    pub async fn handle_line(&mut self, line: &str, backend: &dyn Backend) -> Handled {
        match serde_json::from_str::<WorkerRequest>(line) {
            Ok(request) => self.handle(request, backend).await,
            Err(err) => Handled::clean(self.error(
                ErrorCode::ValidationError,
                format!("invalid request: {err}"),
            )),
        }
    }

    pub async fn handle(&mut self, request: WorkerRequest, backend: &dyn Backend) -> Handled {
        if request.instance_id != self.instance_id {
            warn!(
                expected = %self.instance_id,
                got = %request.instance_id,
                "request addressed to another instance"
            );
            return Handled::clean(self.error(
                ErrorCode::InstanceMismatch,
                format!(
                    "instance mismatch: request for {}, this worker serves {}",
                    request.instance_id, self.instance_id
                ),
            ));
        }

        let effective = request.config.effective(self.config);
        match request.kind {
            RequestKind::Query {
                message,
                request_id,
            } => self.query(message, request_id, effective, backend).await,
            RequestKind::Config(action) => self.configure(action),
            RequestKind::RestoreHistory {
                history,
                profile,
                show_reasoning,
                output_format,
            } => {
                self.window.replace(history);
                self.config.merge_lenient(
                    profile.as_deref(),
                    show_reasoning,
                    output_format.as_deref(),
                );
                info!(
                    instance_id = %self.instance_id,
                    turns = self.window.len(),
                    profile = %self.config.profile,
                    "history restored"
                );
                Handled::dirty(self.respond(WorkerReply::RestoreResponse {
                    message: format!(
                        "restored {} turns; profile {}",
                        self.window.len(),
                        self.config.profile
                    ),
                    restored: self.window.len(),
                    config: self.config,
                }))
            }
        }
    }

    async fn query(
        &mut self,
        message: String,
        request_id: Option<String>,
        effective: RuntimeConfig,
        backend: &dyn Backend,
    ) -> Handled {
        if let Some(id) = request_id.as_deref() {
            if let Some(mut cached) = self.replayed(id) {
                if let WorkerReply::Response { metadata, .. } = &mut cached.reply {
                    metadata.replayed = true;
                }
                info!(instance_id = %self.instance_id, request_id = id, "replaying cached response");
                return Handled::clean(cached);
            }
        }

        let prompt = build_prompt(
            &effective,
            self.window.recent(self.history_in_prompt),
            &message,
        );

        let output = match backend.invoke(&prompt).await {
            Ok(output) => output,
            Err(err) => {
                warn!(instance_id = %self.instance_id, %err, "backend call failed");
                return Handled::clean(self.error(err.code(), err.to_string()));
            }
        };

        // Both turns land together so a failed call leaves no dangling turn.
        self.window
            .push(ConversationTurn::user(message, effective.profile));
        self.window.push(ConversationTurn::assistant(
            output.answer.trim(),
            effective.profile,
        ));

        let turn_count = self.window.len();
        let response = self.respond(WorkerReply::Response {
            message: render_answer(&output, &effective, turn_count),
            metadata: QueryMetadata {
                turn_count,
                active_profile: effective.profile,
                show_reasoning: effective.show_reasoning,
                output_format: effective.output_format,
                replayed: false,
            },
        });

        if let Some(id) = request_id {
            if self.replay.len() == REPLAY_CAPACITY {
                self.replay.pop_front();
            }
            self.replay.push_back((id, response.clone()));
        }

        Handled::dirty(response)
    }

    fn configure(&mut self, action: ConfigAction) -> Handled {
        let name = action.name().to_string();
        let changed = match action {
            ConfigAction::Get => {
                return Handled::clean(self.respond(WorkerReply::ConfigResponse {
                    action: name,
                    message: format!(
                        "profile {}, show_reasoning {}, output_format {}",
                        self.config.profile, self.config.show_reasoning, self.config.output_format
                    ),
                    config: self.config,
                }));
            }
            ConfigAction::SetProfile { profile } => match self.config.set_profile(&profile) {
                Ok(old) => {
                    log_change("profile", old, self.config.profile);
                    format!("profile set to {}", self.config.profile)
                }
                Err(err) => return Handled::clean(self.error(ErrorCode::InvalidProfile, err.to_string())),
            },
            ConfigAction::SetReasoning { show_reasoning } => {
                let old = self.config.set_show_reasoning(show_reasoning);
                log_change("show_reasoning", old, show_reasoning);
                format!("show_reasoning set to {show_reasoning}")
            }
            ConfigAction::SetOutputFormat { output_format } => {
                match self.config.set_output_format(&output_format) {
                    Ok(old) => {
                        log_change("output_format", old, self.config.output_format);
                        format!("output_format set to {}", self.config.output_format)
                    }
                    Err(err) => {
                        return Handled::clean(
                            self.error(ErrorCode::InvalidOutputFormat, err.to_string()),
                        );
                    }
                }
            }
        };

        Handled::dirty(self.respond(WorkerReply::ConfigResponse {
            action: name,
            message: changed,
            config: self.config,
        }))
    }

    fn replayed(&self, request_id: &str) -> Option<WorkerResponse> {
        self.replay
            .iter()
            .find(|(id, _)| id == request_id)
            .map(|(_, response)| response.clone())
    }

    fn respond(&self, reply: WorkerReply) -> WorkerResponse {
        WorkerResponse::new(self.instance_id.clone(), reply)
    }

    fn error(&self, code: ErrorCode, message: String) -> WorkerResponse {
        WorkerResponse::error(self.instance_id.clone(), code, message)
    }
}

fn log_change(field: &str, old: impl std::fmt::Display, new: impl std::fmt::Display) {
    info!(field, old = %old, new = %new, "config changed");
}
