// ABOUTME: Fallback detection of questions asked in plain prose
// ABOUTME: Used only when a poll carries no QUESTION markers

use crate::parser::collapse;
use regex::Regex;
use std::sync::OnceLock;

/// Upper bound on natural questions taken from one chunk of output
pub const MAX_NATURAL_QUESTIONS: usize = 3;

fn sentence_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"[^.!?\n]+\?").expect("sentence regex must compile"))
}

fn asking_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)\b(should i|should we|shall i|do you want|would you like|would you prefer|do you prefer|which (approach|option|one)|is it (ok|okay|fine)|can you (confirm|clarify)|could you (confirm|clarify)|what should)\b",
        )
        .expect("asking regex must compile")
    })
}

/// Questions phrased to the user, at most `limit` of them
pub fn natural_questions(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return Vec::new();
    }
    let mut found: Vec<String> = Vec::new();
    for sentence in sentence_regex().find_iter(text) {
        let sentence = collapse(sentence.as_str());
        if !asking_regex().is_match(&sentence) || found.contains(&sentence) {
            continue;
        }
        found.push(sentence);
        if found.len() == limit {
            break;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_picks_questions_addressed_to_user() {
        let text = "I looked at the repo. Should I use bcrypt or argon2? Why is this slow? Anyway.";
        assert_eq!(
            natural_questions(text, MAX_NATURAL_QUESTIONS),
            vec!["Should I use bcrypt or argon2?".to_string()]
        );
    }

    #[test]
    fn test_caps_at_three() {
        let text = "Should I a? Should I b? Should I c? Should I d?";
        assert_eq!(
            natural_questions(text, MAX_NATURAL_QUESTIONS).len(),
            MAX_NATURAL_QUESTIONS
        );
    }

    #[test]
    fn test_rhetorical_questions_ignored() {
        let text = "What went wrong? The build cache.";
        assert!(natural_questions(text, MAX_NATURAL_QUESTIONS).is_empty());
    }
}
