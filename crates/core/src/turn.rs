use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::{Profile, lenient_profile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_profile")]
    pub profile: Profile,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>, profile: Profile) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            profile,
        }
    }

    pub fn assistant(content: impl Into<String>, profile: Profile) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            profile,
        }
    }
}

/// Oldest-first conversation history bounded to `cap` turns.
#[derive(Debug, Clone)]
pub struct TurnWindow {
    turns: VecDeque<ConversationTurn>,
    cap: usize,
}

impl TurnWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        self.trim();
    }

    /// Replace the whole history; only the newest `cap` turns survive.
    pub fn replace(&mut self, turns: impl IntoIterator<Item = ConversationTurn>) {
        self.turns = turns.into_iter().collect();
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// The newest `n` turns, oldest-first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter().skip(self.turns.len().saturating_sub(n))
    }

    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    fn trim(&mut self) {
        while self.turns.len() > self.cap {
            self.turns.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| ConversationTurn::user(format!("m{i}"), Profile::Default))
            .collect()
    }

    #[test]
    fn evicts_oldest_first() {
        let mut window = TurnWindow::new(3);
        for turn in numbered(5) {
            window.push(turn);
        }
        let contents: Vec<_> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn replace_keeps_newest() {
        let mut window = TurnWindow::new(200);
        window.replace(numbered(250));
        assert_eq!(window.len(), 200);
        assert_eq!(window.iter().next().unwrap().content, "m50");
    }

    #[test]
    fn recent_is_oldest_first_tail() {
        let mut window = TurnWindow::new(10);
        window.replace(numbered(6));
        let tail: Vec<_> = window.recent(2).map(|t| t.content.clone()).collect();
        assert_eq!(tail, vec!["m4", "m5"]);
        assert_eq!(window.recent(50).count(), 6);
    }

    #[test]
    fn turn_with_unknown_profile_still_loads() {
        let turn: ConversationTurn = serde_json::from_str(
            r#"{"role":"user","content":"hi","timestamp":"2024-01-01T00:00:00Z","profile":"medium"}"#,
        )
        .unwrap();
        assert_eq!(turn.profile, Profile::Default);
        assert_eq!(turn.role, Role::User);
    }
}
