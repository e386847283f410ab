// ABOUTME: Session status inference from recent output
// ABOUTME: Waiting beats done, done beats working

use crate::types::SessionStatus;
use regex::Regex;
use std::sync::OnceLock;

fn waiting_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)(waiting for (your )?(input|response|reply|confirmation|approval)|let me know|please (confirm|advise|respond|reply)|press enter|\(y/n\)|\[y/n\])",
        )
        .expect("waiting regex must compile")
    })
}

fn done_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)\b(all done|task (is )?(complete|completed|done|finished)|i('ve| have) (finished|completed)|completed successfully|finished successfully|all tests pass(ed)?)\b",
        )
        .expect("done regex must compile")
    })
}

fn prompt_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        // Bare prompt, `user@host:path$`, or `~/path $`, with an optional `(venv)` prefix
        Regex::new(
            r"^\s*(\([\w.-]+\)\s+)?([\w.-]+@[\w.-]+(:\S*)?|[~/][\w./~-]*)?\s?([$#%❯]|>{1,3})\s*$",
        )
        .expect("prompt regex must compile")
    })
}

fn ends_at_prompt(text: &str) -> bool {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| prompt_regex().is_match(line))
}

/// Infer status from `text`; `has_open_questions` forces waiting
pub fn infer_status(text: &str, has_open_questions: bool) -> SessionStatus {
    if has_open_questions || waiting_regex().is_match(text) || ends_at_prompt(text) {
        SessionStatus::Waiting
    } else if done_regex().is_match(text) {
        SessionStatus::Done
    } else {
        SessionStatus::Working
    }
}
