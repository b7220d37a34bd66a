//! In-memory conversation state for one running build.
//!
//! Holds the ordered turn list, the per-phase task plan, and the set of
//! files written this phase. Everything except the directive preamble and a
//! rolling tail resets at phase boundaries.

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;

/// How many trailing turns survive a phase boundary.
pub const ROLLING_TAIL_TURNS: usize = 6;

/// Classification that compaction uses to decide what must survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnKind {
    Normal,
    /// A user-role turn carrying audit findings; never compacted away.
    AuditFinding,
    /// The assistant turn containing the phase sign-off marker.
    SignOff,
    /// A synthetic summary produced by compaction.
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub message: ChatMessage,
    pub kind: TurnKind,
}

impl Turn {
    pub fn normal(message: ChatMessage) -> Self {
        Self {
            message,
            kind: TurnKind::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub description: String,
    pub status: TaskStatus,
}

/// Ordered task plan for the current phase, populated from `=== PLAN ===`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    pub items: Vec<TaskItem>,
}

impl TaskPlan {
    pub fn set(&mut self, descriptions: Vec<String>) {
        self.items = descriptions
            .into_iter()
            .map(|description| TaskItem {
                description,
                status: TaskStatus::Pending,
            })
            .collect();
    }

    /// Tick item N (1-indexed, as the agent writes it). Out-of-range ticks
    /// are ignored.
    pub fn mark_done(&mut self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        match self.items.get_mut(n - 1) {
            Some(item) => {
                item.status = TaskStatus::Done;
                true
            }
            None => false,
        }
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.items.iter().map(|i| i.description.clone()).collect()
    }
}

/// The running conversation plus per-phase scratch state.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    /// The directive preamble; becomes the system prompt every turn.
    pub preamble: String,
    pub turns: Vec<Turn>,
    pub task_plan: TaskPlan,
    pub files_written: std::collections::BTreeSet<String>,
    pub accumulated_text: String,
}

impl Conversation {
    pub fn new(preamble: String) -> Self {
        Self {
            preamble,
            ..Default::default()
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::normal(ChatMessage::user(content)));
    }

    /// Messages for the next provider call.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.turns.iter().map(|t| t.message.clone()).collect()
    }

    /// Reset for a new phase: task plan, files, accumulated text go; the
    /// preamble and a rolling tail of turns stay.
    pub fn reset_for_phase(&mut self) {
        self.task_plan = TaskPlan::default();
        self.files_written.clear();
        self.accumulated_text.clear();
        if self.turns.len() > ROLLING_TAIL_TURNS {
            let keep_from = self.turns.len() - ROLLING_TAIL_TURNS;
            // Audit findings always survive the cut.
            let mut kept: Vec<Turn> = self
                .turns
                .iter()
                .take(keep_from)
                .filter(|t| t.kind == TurnKind::AuditFinding)
                .cloned()
                .collect();
            kept.extend(self.turns.split_off(keep_from));
            self.turns = kept;
        }
    }

    /// Rough token estimate over everything the next request would carry.
    pub fn estimated_tokens(&self) -> usize {
        let chars: usize = self.preamble.len()
            + self
                .turns
                .iter()
                .map(|t| t.message.content.len() + 16)
                .sum::<usize>();
        chars / 4 + 1
    }

    /// The tail ends with a user turn containing `needle`. Used by resume
    /// plumbing and tests.
    pub fn last_user_turn_contains(&self, needle: &str) -> bool {
        self.turns
            .iter()
            .rev()
            .find(|t| t.message.role == crate::llm::MsgRole::User)
            .map(|t| t.message.content.contains(needle))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_plan_set_and_tick() {
        let mut plan = TaskPlan::default();
        plan.set(vec!["write main".into(), "add tests".into()]);
        assert_eq!(plan.items.len(), 2);
        assert!(plan.mark_done(1));
        assert_eq!(plan.items[0].status, TaskStatus::Done);
        assert_eq!(plan.items[1].status, TaskStatus::Pending);
    }

    #[test]
    fn task_plan_ignores_out_of_range() {
        let mut plan = TaskPlan::default();
        plan.set(vec!["only".into()]);
        assert!(!plan.mark_done(0));
        assert!(!plan.mark_done(5));
    }

    #[test]
    fn reset_keeps_tail_and_findings() {
        let mut conv = Conversation::new("directive".into());
        for i in 0..10 {
            conv.push_user(format!("turn {}", i));
        }
        conv.push(Turn {
            message: ChatMessage::user("finding: missing docstring"),
            kind: TurnKind::AuditFinding,
        });
        for i in 10..20 {
            conv.push_user(format!("turn {}", i));
        }
        conv.task_plan.set(vec!["x".into()]);
        conv.files_written.insert("a.py".into());
        conv.accumulated_text.push_str("text");

        conv.reset_for_phase();

        assert!(conv.task_plan.items.is_empty());
        assert!(conv.files_written.is_empty());
        assert!(conv.accumulated_text.is_empty());
        assert_eq!(conv.preamble, "directive");
        // tail survived
        assert!(conv.turns.iter().any(|t| t.message.content == "turn 19"));
        // early turns dropped, finding kept
        assert!(!conv.turns.iter().any(|t| t.message.content == "turn 0"));
        assert!(
            conv.turns
                .iter()
                .any(|t| t.kind == TurnKind::AuditFinding)
        );
    }

    #[test]
    fn reset_short_conversation_keeps_everything() {
        let mut conv = Conversation::new("d".into());
        conv.push_user("one");
        conv.push_user("two");
        conv.reset_for_phase();
        assert_eq!(conv.turns.len(), 2);
    }

    #[test]
    fn estimated_tokens_scales_with_content() {
        let mut conv = Conversation::new("x".repeat(4000));
        let small = conv.estimated_tokens();
        conv.push_user("y".repeat(40_000));
        assert!(conv.estimated_tokens() > small + 9_000);
    }

    #[test]
    fn last_user_turn_lookup() {
        let mut conv = Conversation::new(String::new());
        conv.push_user("use pytest");
        conv.push(Turn::normal(ChatMessage::assistant("ok")));
        assert!(conv.last_user_turn_contains("use pytest"));
        assert!(!conv.last_user_turn_contains("use vitest"));
    }
}
