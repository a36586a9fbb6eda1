use std::fmt::Write as _;

use askd_core::{ConversationTurn, OutputFormat, Role, RuntimeConfig};
use askd_exec::BackendOutput;

/// Full backend prompt: profile preset, recent history (oldest first), then
/// the new message.
pub fn build_prompt<'a>(
    config: &RuntimeConfig,
    history: impl Iterator<Item = &'a ConversationTurn>,
    message: &str,
) -> String {
    let params = config.profile.params();
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "[profile: {} | temperature: {} | max_tokens: {} | top_p: {}]",
        config.profile, params.temperature, params.max_tokens, params.top_p
    );
    let _ = writeln!(prompt, "{}", config.profile.instruction());

    let mut history = history.peekable();
    if history.peek().is_some() {
        prompt.push_str("\nConversation so far:\n");
        for turn in history {
            let speaker = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let _ = writeln!(prompt, "{speaker}: {}", turn.content);
        }
    }

    let _ = write!(prompt, "\nuser: {message}\n");
    prompt
}

/// Text returned to the client for one answer.
pub fn render_answer(output: &BackendOutput, config: &RuntimeConfig, turn_count: usize) -> String {
    let mut rendered = String::new();

    if config.show_reasoning && !output.reasoning.trim().is_empty() {
        let _ = write!(
            rendered,
            "Reasoning:\n{}\n\nAnswer:\n",
            output.reasoning.trim()
        );
    }
    rendered.push_str(output.answer.trim());

    if config.output_format == OutputFormat::FinalWithDetails {
        let params = config.profile.params();
        let _ = write!(
            rendered,
            "\n\n---\nprofile: {} | max_tokens: {} | temperature: {} | turns: {turn_count}",
            config.profile, params.max_tokens, params.temperature
        );
    }

    rendered
}
