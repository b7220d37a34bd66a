//! Deterministic context compaction.
//!
//! Before each turn the orchestrator estimates the conversation's token
//! footprint against the model's context window. Past 85 %, everything but
//! the directive preamble, the audit-finding turns, the last sign-off, and
//! the final two turns is folded into a single synthetic user turn of at
//! most 2 KB. No LLM round-trip: the summary is a deterministic digest, so
//! replays reproduce byte-for-byte.

use crate::conversation::{Conversation, Turn, TurnKind};
use crate::llm::ChatMessage;

/// Trigger threshold as a fraction of the context window.
const COMPACT_THRESHOLD: f64 = 0.85;
/// Ceiling for the synthetic summary turn.
const SUMMARY_CAP_BYTES: usize = 2048;
/// Turns at the end that always survive.
const KEEP_LAST_TURNS: usize = 2;
/// Per-turn excerpt length inside the summary.
const EXCERPT_CHARS: usize = 140;

/// Context window sizes in tokens by model family.
pub fn context_limit_tokens(model: &str) -> usize {
    match model {
        m if m.starts_with("claude") => 200_000,
        m if m.starts_with("gpt-4o") => 128_000,
        m if m.starts_with("gpt-4.1") => 1_000_000,
        _ => 128_000,
    }
}

pub fn should_compact(conversation: &Conversation, model: &str) -> bool {
    let limit = context_limit_tokens(model);
    conversation.estimated_tokens() as f64 > limit as f64 * COMPACT_THRESHOLD
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionStats {
    pub dropped_turns: usize,
    pub summary_bytes: usize,
}

/// Fold the compactable middle of the conversation into one synthetic user
/// turn. Returns `None` when there is nothing worth folding.
pub fn compact(conversation: &mut Conversation) -> Option<CompactionStats> {
    let total = conversation.turns.len();
    if total <= KEEP_LAST_TURNS {
        return None;
    }
    let tail_start = total - KEEP_LAST_TURNS;

    // The last sign-off before the tail survives alongside findings.
    let last_sign_off = conversation
        .turns
        .iter()
        .enumerate()
        .take(tail_start)
        .rev()
        .find(|(_, t)| t.kind == TurnKind::SignOff)
        .map(|(i, _)| i);

    let mut kept: Vec<Turn> = Vec::with_capacity(KEEP_LAST_TURNS + 4);
    let mut dropped: Vec<&Turn> = Vec::new();
    for (i, turn) in conversation.turns.iter().enumerate().take(tail_start) {
        let keep = turn.kind == TurnKind::AuditFinding || Some(i) == last_sign_off;
        if keep {
            kept.push(turn.clone());
        } else {
            dropped.push(turn);
        }
    }
    if dropped.is_empty() {
        return None;
    }

    let summary = summarize(&dropped);
    let stats = CompactionStats {
        dropped_turns: dropped.len(),
        summary_bytes: summary.len(),
    };

    let mut turns = Vec::with_capacity(kept.len() + KEEP_LAST_TURNS + 1);
    turns.push(Turn {
        message: ChatMessage::user(summary),
        kind: TurnKind::Summary,
    });
    turns.extend(kept);
    turns.extend_from_slice(&conversation.turns[tail_start..]);
    conversation.turns = turns;

    Some(stats)
}

/// Deterministic digest of the dropped turns, capped at 2 KB.
fn summarize(dropped: &[&Turn]) -> String {
    let mut out = String::from("[Conversation summary — earlier turns compacted]\n");
    for turn in dropped {
        let role = match turn.message.role {
            crate::llm::MsgRole::User => "user",
            crate::llm::MsgRole::Assistant => "assistant",
            crate::llm::MsgRole::Tool => "tool",
        };
        let excerpt: String = turn
            .message
            .content
            .chars()
            .take(EXCERPT_CHARS)
            .collect::<String>()
            .replace('\n', " ");
        let line = format!("- {}: {}\n", role, excerpt.trim());
        if out.len() + line.len() > SUMMARY_CAP_BYTES {
            out.push_str("- [...]\n");
            break;
        }
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;

    fn big_conversation() -> Conversation {
        let mut conv = Conversation::new("directive preamble".into());
        for i in 0..20 {
            conv.push_user(format!("user turn {} {}", i, "x".repeat(50)));
            conv.push(Turn::normal(ChatMessage::assistant(format!(
                "assistant turn {}",
                i
            ))));
        }
        conv
    }

    #[test]
    fn limits_by_model_family() {
        assert_eq!(context_limit_tokens("claude-sonnet-4-5"), 200_000);
        assert_eq!(context_limit_tokens("gpt-4o"), 128_000);
        assert_eq!(context_limit_tokens("unknown"), 128_000);
    }

    #[test]
    fn should_compact_past_threshold() {
        let mut conv = Conversation::new(String::new());
        assert!(!should_compact(&conv, "gpt-4o"));
        // ~120k tokens of content against a 128k window is past 85%.
        conv.push_user("x".repeat(480_000));
        assert!(should_compact(&conv, "gpt-4o"));
        // The same content easily fits a 200k-token window below threshold.
        assert!(!should_compact(&conv, "claude-sonnet-4-5"));
    }

    #[test]
    fn compact_preserves_preamble_findings_and_tail() {
        let mut conv = big_conversation();
        conv.turns[5] = Turn {
            message: ChatMessage::user("AUDIT FINDING: missing docstring in main.py"),
            kind: TurnKind::AuditFinding,
        };
        let last_two: Vec<String> = conv.turns[conv.turns.len() - 2..]
            .iter()
            .map(|t| t.message.content.clone())
            .collect();

        let stats = compact(&mut conv).unwrap();
        assert!(stats.dropped_turns > 0);
        assert!(stats.summary_bytes <= 2048);

        assert_eq!(conv.preamble, "directive preamble");
        assert_eq!(conv.turns[0].kind, TurnKind::Summary);
        assert!(
            conv.turns
                .iter()
                .any(|t| t.kind == TurnKind::AuditFinding
                    && t.message.content.contains("missing docstring"))
        );
        let tail: Vec<String> = conv.turns[conv.turns.len() - 2..]
            .iter()
            .map(|t| t.message.content.clone())
            .collect();
        assert_eq!(tail, last_two);
    }

    #[test]
    fn compact_keeps_last_sign_off() {
        let mut conv = big_conversation();
        conv.turns[10] = Turn {
            message: ChatMessage::assistant("=== PHASE SIGN-OFF: PASS ===".to_string()),
            kind: TurnKind::SignOff,
        };
        compact(&mut conv).unwrap();
        assert!(conv.turns.iter().any(|t| t.kind == TurnKind::SignOff));
    }

    #[test]
    fn compact_shrinks_token_estimate() {
        let mut conv = Conversation::new(String::new());
        for _ in 0..50 {
            conv.push_user("y".repeat(4000));
        }
        let before = conv.estimated_tokens();
        compact(&mut conv).unwrap();
        assert!(conv.estimated_tokens() < before / 4);
    }

    #[test]
    fn compact_is_deterministic() {
        let mut a = big_conversation();
        let mut b = big_conversation();
        compact(&mut a).unwrap();
        compact(&mut b).unwrap();
        assert_eq!(a.turns[0].message.content, b.turns[0].message.content);
    }

    #[test]
    fn compact_tiny_conversation_is_noop() {
        let mut conv = Conversation::new("p".into());
        conv.push_user("only turn");
        assert!(compact(&mut conv).is_none());
    }
}
