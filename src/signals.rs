//! Structured signal parsing from the builder's streamed text.
//!
//! The agent communicates plan state and file contents inline using `===`
//! framed markers:
//! - `=== PLAN ===` followed by a numbered or bulleted task list
//! - `=== TASK DONE: N ===` ticking item N (1-indexed)
//! - `=== FILE: path ===` ... `=== END FILE ===` as a fallback write path
//! - `=== PHASE SIGN-OFF: PASS ===` marking the phase complete

use regex::Regex;
use std::sync::LazyLock;

static TASK_DONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*=== TASK DONE:\s*(\d+)\s*===\s*$").unwrap());

static PLAN_HEADER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*=== PLAN ===\s*$").unwrap());

static PLAN_ITEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(.+)$").unwrap());

static FILE_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^=== FILE:\s*(?P<path>[^\n=]+?)\s*===\s*\n(?P<body>.*?)^=== END FILE ===\s*$")
        .unwrap()
});

static SIGN_OFF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*=== PHASE SIGN-OFF:\s*PASS\s*===\s*$").unwrap());

/// One inline file block. Content is the full file, never a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

/// Everything extracted from one pass over the builder's text.
#[derive(Debug, Clone, Default)]
pub struct ParsedSignals {
    pub plan: Vec<String>,
    pub tasks_done: Vec<usize>,
    pub files: Vec<FileBlock>,
    pub sign_off: bool,
    /// Malformed blocks that were skipped, for warn-level logging.
    pub warnings: Vec<String>,
}

/// Extract all signals from the given text.
pub fn parse(text: &str) -> ParsedSignals {
    let mut out = ParsedSignals {
        plan: parse_plan(text),
        sign_off: SIGN_OFF_REGEX.is_match(text),
        ..Default::default()
    };

    for cap in TASK_DONE_REGEX.captures_iter(text) {
        if let Some(n) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
            out.tasks_done.push(n);
        }
    }

    for cap in FILE_BLOCK_REGEX.captures_iter(text) {
        let path = cap["path"].trim().to_string();
        let content = strip_fence(&cap["body"]);
        if path.is_empty() {
            out.warnings.push("file block with empty path skipped".to_string());
            continue;
        }
        if content.is_empty() {
            out.warnings
                .push(format!("empty file block for '{}' skipped", path));
            continue;
        }
        out.files.push(FileBlock { path, content });
    }

    out
}

/// Take the task list following the last `=== PLAN ===` header. Items are
/// numbered (`1.`/`1)`) or bulleted (`-`/`*`) lines; the list ends at the
/// first non-item, non-blank line.
fn parse_plan(text: &str) -> Vec<String> {
    let Some(m) = PLAN_HEADER_REGEX.find_iter(text).last() else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for line in text[m.end()..].lines() {
        if let Some(cap) = PLAN_ITEM_REGEX.captures(line) {
            items.push(cap[1].trim().to_string());
        } else if line.trim().is_empty() {
            if !items.is_empty() {
                break;
            }
        } else {
            break;
        }
    }
    items
}

/// Remove a surrounding markdown code fence, if any, keeping inner content
/// byte-exact otherwise.
fn strip_fence(body: &str) -> String {
    let trimmed = body.trim_end_matches('\n');
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() >= 2
        && lines.first().map(|l| l.trim_start().starts_with("```")).unwrap_or(false)
        && lines.last().map(|l| l.trim() == "```").unwrap_or(false)
    {
        let inner = &lines[1..lines.len() - 1];
        let mut s = inner.join("\n");
        if !s.is_empty() {
            s.push('\n');
        }
        return s;
    }
    let mut s = trimmed.to_string();
    if !s.is_empty() {
        s.push('\n');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_numbered() {
        let text = "Here is my plan.\n=== PLAN ===\n1. Create main module\n2. Add tests\n\nLet's begin.";
        let s = parse(text);
        assert_eq!(s.plan, vec!["Create main module", "Add tests"]);
    }

    #[test]
    fn parse_plan_bulleted() {
        let text = "=== PLAN ===\n- set up scaffolding\n- wire the API\n";
        let s = parse(text);
        assert_eq!(s.plan.len(), 2);
        assert_eq!(s.plan[0], "set up scaffolding");
    }

    #[test]
    fn parse_plan_absent() {
        let s = parse("no plan markers here");
        assert!(s.plan.is_empty());
    }

    #[test]
    fn later_plan_wins() {
        let text = "=== PLAN ===\n1. old\n\n=== PLAN ===\n1. new one\n2. new two\n";
        let s = parse(text);
        assert_eq!(s.plan, vec!["new one", "new two"]);
    }

    #[test]
    fn parse_task_done() {
        let text = "working...\n=== TASK DONE: 1 ===\nmore\n=== TASK DONE: 3 ===\n";
        let s = parse(text);
        assert_eq!(s.tasks_done, vec![1, 3]);
    }

    #[test]
    fn parse_file_block() {
        let text = "=== FILE: src/main.py ===\nprint('ok')\n=== END FILE ===\n";
        let s = parse(text);
        assert_eq!(s.files.len(), 1);
        assert_eq!(s.files[0].path, "src/main.py");
        assert_eq!(s.files[0].content, "print('ok')\n");
    }

    #[test]
    fn parse_file_block_strips_fence() {
        let text = "=== FILE: app.js ===\n```js\nconsole.log(1);\n```\n=== END FILE ===\n";
        let s = parse(text);
        assert_eq!(s.files[0].content, "console.log(1);\n");
    }

    #[test]
    fn parse_multiple_file_blocks() {
        let text = "=== FILE: a.txt ===\nA\n=== END FILE ===\ntext between\n=== FILE: b.txt ===\nB\n=== END FILE ===\n";
        let s = parse(text);
        assert_eq!(s.files.len(), 2);
        assert_eq!(s.files[1].path, "b.txt");
        assert_eq!(s.files[1].content, "B\n");
    }

    #[test]
    fn empty_file_block_skipped_with_warning() {
        let text = "=== FILE: empty.txt ===\n=== END FILE ===\n";
        let s = parse(text);
        assert!(s.files.is_empty());
        assert_eq!(s.warnings.len(), 1);
        assert!(s.warnings[0].contains("empty.txt"));
    }

    #[test]
    fn unterminated_file_block_ignored() {
        let text = "=== FILE: partial.txt ===\nsome content with no end marker";
        let s = parse(text);
        assert!(s.files.is_empty());
    }

    #[test]
    fn sign_off_detected() {
        assert!(parse("all done\n=== PHASE SIGN-OFF: PASS ===\n").sign_off);
        assert!(!parse("=== PHASE SIGN-OFF: FAIL ===").sign_off);
        assert!(!parse("no markers").sign_off);
    }

    #[test]
    fn mixed_signals_in_one_text() {
        let text = r#"Starting.
=== PLAN ===
1. write main
2. test it

=== FILE: main.txt ===
ok
=== END FILE ===

=== TASK DONE: 1 ===
=== TASK DONE: 2 ===

=== PHASE SIGN-OFF: PASS ===
"#;
        let s = parse(text);
        assert_eq!(s.plan.len(), 2);
        assert_eq!(s.files.len(), 1);
        assert_eq!(s.tasks_done, vec![1, 2]);
        assert!(s.sign_off);
        assert!(s.warnings.is_empty());
    }
}
