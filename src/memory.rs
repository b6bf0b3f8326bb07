use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::agent::{ActionKind, ActionRequest, ActionResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Outcome of one dispatched action as the model sees it. Refers to the
/// screenshot by id only; image bytes never live in memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub request: ActionRequest,
    pub kind: ActionKind,
    pub success: bool,
    pub message: String,
    pub screenshot_id: Option<String>,
}

impl Observation {
    pub fn from_result(request: &ActionRequest, result: &ActionResult) -> Self {
        Self {
            request: request.clone(),
            kind: result.kind,
            success: result.success,
            message: result.message.clone(),
            screenshot_id: result.screenshot_after.as_ref().map(|s| s.id.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    Observation(Observation),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: TurnContent::Text { text: text.into() } }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: TurnContent::Text { text: text.into() } }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: TurnContent::Text { text: text.into() } }
    }

    pub fn observation(obs: Observation) -> Self {
        Self { role: Role::Assistant, content: TurnContent::Observation(obs) }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            TurnContent::Observation(_) => None,
        }
    }

    /// Flat rendering used when a provider only accepts plain text.
    pub fn render(&self) -> String {
        match &self.content {
            TurnContent::Text { text } => text.clone(),
            TurnContent::Observation(obs) => {
                let request = serde_json::to_string(&obs.request).unwrap_or_default();
                let status = if obs.success { "ok" } else { "failed" };
                format!("ACTION: {request}\nOBSERVATION ({status}): {}", obs.message)
            }
        }
    }
}

/// Ordered model context. The system turn, when present, is kept apart so it
/// always renders first and is never evicted.
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    system: Option<ConversationTurn>,
    turns: VecDeque<ConversationTurn>,
    ceiling: usize,
}

impl ConversationMemory {
    /// `ceiling` counts every turn, the system turn included. Values below 2
    /// are raised to 2 so at least one non-system turn survives.
    pub fn new(system_prompt: Option<String>, ceiling: usize) -> Self {
        Self {
            system: system_prompt.map(ConversationTurn::system),
            turns: VecDeque::new(),
            ceiling: ceiling.max(2),
        }
    }

    pub fn append(&mut self, turn: ConversationTurn) {
        if turn.role == Role::System && self.system.is_none() && self.turns.is_empty() {
            self.system = Some(turn);
            return;
        }
        self.turns.push_back(turn);
        while self.len() > self.ceiling {
            if self.turns.pop_front().is_none() {
                break;
            }
        }
    }

    /// Drops every turn except the leading system turn.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len() + usize::from(self.system.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.system.iter().chain(self.turns.iter())
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back().or(self.system.as_ref())
    }

    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_non_system_turn_first() {
        let mut mem = ConversationMemory::new(Some("be helpful".into()), 3);
        mem.append(ConversationTurn::user("one"));
        mem.append(ConversationTurn::assistant("two"));
        mem.append(ConversationTurn::user("three"));

        let texts: Vec<_> = mem.iter().filter_map(|t| t.text()).collect();
        assert_eq!(texts, vec!["be helpful", "two", "three"]);
        assert_eq!(mem.len(), 3);
        assert_eq!(mem.iter().next().map(|t| t.role), Some(Role::System));
    }

    #[test]
    fn reset_keeps_system_turn() {
        let mut mem = ConversationMemory::new(Some("sys".into()), 10);
        mem.append(ConversationTurn::user("open terminal"));
        mem.reset();
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.last().and_then(|t| t.text()), Some("sys"));
    }

    #[test]
    fn without_system_turn_eviction_is_plain_fifo() {
        let mut mem = ConversationMemory::new(None, 2);
        mem.append(ConversationTurn::user("a"));
        mem.append(ConversationTurn::user("b"));
        mem.append(ConversationTurn::user("c"));
        let texts: Vec<_> = mem.iter().filter_map(|t| t.text()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn last_is_the_newest_turn() {
        let mut mem = ConversationMemory::new(None, 8);
        assert!(mem.last().is_none());
        mem.append(ConversationTurn::user("first"));
        mem.append(ConversationTurn::assistant("thinking"));
        let last = mem.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), Some("thinking"));
    }
}
