// ABOUTME: Question triage into surface, auto-answer and skip
// ABOUTME: Also pulls a filesystem search term out of locational questions

use crate::types::Classification;
use regex::Regex;
use std::sync::OnceLock;

/// Questions shorter than this carry nothing worth surfacing
const MIN_QUESTION_LEN: usize = 4;

const SEARCH_STOP_WORDS: &[&str] = &[
    "a", "an", "the", "file", "files", "directory", "dir", "folder", "path", "located", "location",
    "stored", "kept", "defined", "is", "are", "of", "for", "to", "where", "which", "what", "in",
];

fn preference_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)\b(should i|should we|shall i|do you want|do you prefer|would you prefer|would you like|which (approach|option|one) (do|would|should)|is it (ok|okay|fine) (if|to)|prefer)\b",
        )
        .expect("preference regex must compile")
    })
}

fn locational_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)\b(where (is|are|does|do|can i find)|where's|which (file|directory|folder)|what (file|directory|folder)|what is the path|what's the path|path (to|of))\b",
        )
        .expect("locational regex must compile")
    })
}

fn filename_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_][\w.-]*\.[A-Za-z0-9]{1,8}\b").expect("filename regex must compile")
    })
}

fn word_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"[A-Za-z0-9_][\w-]*").expect("word regex must compile"))
}

/// Triage a question. Preference first, then multiple options, then locational
/// lookups; empty or too-short questions are skipped; everything else surfaces.
pub fn classify(text: &str, options: &[String]) -> Classification {
    let trimmed = text.trim();
    if preference_regex().is_match(trimmed) || options.len() > 1 {
        return Classification::Surface;
    }
    if locational_regex().is_match(trimmed) {
        return Classification::AutoAnswer;
    }
    if trimmed.chars().filter(|c| c.is_alphanumeric()).count() < MIN_QUESTION_LEN {
        return Classification::Skip;
    }
    Classification::Surface
}

/// The thing a locational question is looking for.
///
/// An explicit file name wins; otherwise the first word that is not
/// question filler.
pub fn search_term(question: &str) -> Option<String> {
    if let Some(name) = filename_regex().find(question) {
        return Some(name.as_str().to_string());
    }

    let after_lead = locational_regex()
        .find(question)
        .map(|m| &question[m.end()..])
        .unwrap_or(question);

    word_regex()
        .find_iter(after_lead)
        .map(|m| m.as_str())
        .find(|word| !SEARCH_STOP_WORDS.contains(&word.to_ascii_lowercase().as_str()))
        .map(str::to_string)
}
