use serde_json::Value;

use crate::{BackendError, BackendOutput};

/// Parse the backend's JSON-lines stdout.
///
/// `item.completed` events carrying an `agent_message` supply the answer (the
/// last one wins) and `reasoning` items are concatenated into the trace.
/// Lines that are not JSON objects are kept as a plain-text fallback answer.
pub fn parse_events(stdout: &str) -> Result<BackendOutput, BackendError> {
    let mut answer: Option<String> = None;
    let mut reasoning: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut plain: Vec<&str> = Vec::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => value,
            _ => {
                plain.push(line);
                continue;
            }
        };

        match event["type"].as_str() {
            Some("item.completed") => {
                let item = &event["item"];
                let text = item["text"].as_str().unwrap_or_default();
                match item["type"].as_str() {
                    Some("agent_message") => answer = Some(text.to_string()),
                    Some("reasoning") if !text.is_empty() => reasoning.push(text.to_string()),
                    _ => {}
                }
            }
            Some("error") => {
                if let Some(message) = event["message"].as_str() {
                    errors.push(message.to_string());
                }
            }
            Some("turn.failed") => {
                if let Some(message) = event["error"]["message"].as_str() {
                    errors.push(message.to_string());
                }
            }
            _ => {}
        }
    }

    let answer = answer
        .filter(|a| !a.trim().is_empty())
        .or_else(|| {
            let text = plain.join("\n");
            (!text.trim().is_empty()).then(|| text.trim().to_string())
        });

    match answer {
        Some(answer) => Ok(BackendOutput {
            answer,
            reasoning: reasoning.join("\n"),
        }),
        None if !errors.is_empty() => Err(BackendError::Reported(errors.join("; "))),
        None => Err(BackendError::EmptyResponse),
    }
}
