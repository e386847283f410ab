// ABOUTME: Marker grammar for structured agent output
// ABOUTME: Splits text at DECISION/QUESTION/OPTIONS/LEANING/ASSUMING/FOCUS markers into tagged entries

use regex::Regex;
use std::sync::OnceLock;

/// One structured entry, consuming text up to the next marker
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Decision {
        topic: String,
        choice: String,
        rationale: Option<String>,
    },
    Question {
        text: String,
        options: Vec<String>,
        suggestion: Option<String>,
    },
    Assumption {
        text: String,
    },
    Focus {
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Decision,
    Question,
    Options,
    Leaning,
    Assuming,
    Focus,
}

impl Keyword {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "DECISION" => Some(Self::Decision),
            "QUESTION" => Some(Self::Question),
            "OPTIONS" => Some(Self::Options),
            "LEANING" => Some(Self::Leaning),
            "ASSUMING" => Some(Self::Assuming),
            "FOCUS" => Some(Self::Focus),
            _ => None,
        }
    }
}

fn marker_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)\b(DECISION|QUESTION|OPTIONS|LEANING|ASSUMING|FOCUS)\s*:")
            .expect("marker regex must compile")
    })
}

fn decision_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        // topic, then ->, -->, =>, → or a spaced dash, then choice, then optional rationale
        Regex::new(
            r"(?is)^\[?\s*(?P<topic>.+?)\s*\]?\s*(?:-{1,2}>|=>|→|\s[-–—]{1,2}\s)\s*\[?\s*(?P<choice>.+?)\s*\]?(?:\s+because\s+(?P<rationale>.+))?$",
        )
        .expect("decision regex must compile")
    })
}

/// Collapse runs of whitespace, including newlines, into single spaces
pub(crate) fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_brackets(text: &str) -> String {
    collapse(text.trim().trim_start_matches('[').trim_end_matches(']'))
}

fn parse_decision(body: &str) -> Option<Marker> {
    let caps = decision_regex().captures(body.trim())?;
    let topic = strip_brackets(caps.name("topic")?.as_str());
    let choice = strip_brackets(caps.name("choice")?.as_str());
    if topic.is_empty() || choice.is_empty() {
        return None;
    }
    let rationale = caps
        .name("rationale")
        .map(|m| strip_brackets(m.as_str()))
        .filter(|r| !r.is_empty());

    Some(Marker::Decision {
        topic,
        choice,
        rationale,
    })
}

fn first_line(body: &str) -> String {
    body.trim_start().lines().next().map(collapse).unwrap_or_default()
}

fn parse_options(body: &str) -> Vec<String> {
    first_line(body)
        .split('|')
        .map(collapse)
        .filter(|option| !option.is_empty())
        .collect()
}

/// Parse every marker block in `text`, in order of appearance.
///
/// DECISION runs to the next marker; the other markers keep only their first
/// line. OPTIONS and LEANING attach to the closest preceding QUESTION and are
/// ignored without one.
pub fn parse_markers(text: &str) -> Vec<Marker> {
    let matches: Vec<(Keyword, usize, usize)> = marker_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let keyword = Keyword::parse(caps.get(1)?.as_str())?;
            Some((keyword, whole.start(), whole.end()))
        })
        .collect();

    let mut markers = Vec::new();
    let mut open_question: Option<usize> = None;

    for (i, (keyword, _, body_start)) in matches.iter().enumerate() {
        let body_end = matches
            .get(i + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(text.len());
        let body = &text[*body_start..body_end];

        match keyword {
            Keyword::Decision => {
                open_question = None;
                if let Some(decision) = parse_decision(body) {
                    markers.push(decision);
                }
            }
            Keyword::Question => {
                let question = first_line(body);
                if question.is_empty() {
                    open_question = None;
                    continue;
                }
                markers.push(Marker::Question {
                    text: question,
                    options: Vec::new(),
                    suggestion: None,
                });
                open_question = Some(markers.len() - 1);
            }
            Keyword::Options => {
                if let Some(Marker::Question { options, .. }) =
                    open_question.and_then(|idx| markers.get_mut(idx))
                {
                    *options = parse_options(body);
                }
            }
            Keyword::Leaning => {
                if let Some(Marker::Question { suggestion, .. }) =
                    open_question.and_then(|idx| markers.get_mut(idx))
                {
                    let lean = first_line(body);
                    *suggestion = (!lean.is_empty()).then_some(lean);
                }
            }
            Keyword::Assuming => {
                open_question = None;
                let assumption = first_line(body);
                if !assumption.is_empty() {
                    markers.push(Marker::Assumption { text: assumption });
                }
            }
            Keyword::Focus => {
                open_question = None;
                let focus = first_line(body);
                if !focus.is_empty() {
                    markers.push(Marker::Focus { text: focus });
                }
            }
        }
    }

    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn decision(topic: &str, choice: &str, rationale: Option<&str>) -> Marker {
        Marker::Decision {
            topic: topic.to_string(),
            choice: choice.to_string(),
            rationale: rationale.map(String::from),
        }
    }

    #[test]
    fn test_full_grammar_example() {
        let text = "DECISION: [auth] -> [jwt] because stateless\nQUESTION: use redis? OPTIONS: yes | no LEANING: yes\nFOCUS: wiring auth";

        assert_eq!(
            parse_markers(text),
            vec![
                decision("auth", "jwt", Some("stateless")),
                Marker::Question {
                    text: "use redis?".to_string(),
                    options: vec!["yes".to_string(), "no".to_string()],
                    suggestion: Some("yes".to_string()),
                },
                Marker::Focus {
                    text: "wiring auth".to_string()
                },
            ]
        );
    }

    #[rstest]
    #[case("DECISION: [db] -> [postgres]", decision("db", "postgres", None))]
    #[case("decision: db --> postgres because joins", decision("db", "postgres", Some("joins")))]
    #[case("Decision: cache => redis", decision("cache", "redis", None))]
    #[case("DECISION: queue → sqs because managed", decision("queue", "sqs", Some("managed")))]
    #[case("DECISION: [http client] - [reqwest]", decision("http client", "reqwest", None))]
    #[case(
        "DECISION: [storage] -> [sqlite] because it is\nembedded and simple",
        decision("storage", "sqlite", Some("it is embedded and simple"))
    )]
    fn test_decision_separators(#[case] input: &str, #[case] expected: Marker) {
        assert_eq!(parse_markers(input), vec![expected]);
    }

    #[test]
    fn test_hyphenated_words_are_not_separators() {
        assert_eq!(parse_markers("DECISION: use-case only"), vec![]);
    }

    #[test]
    fn test_options_without_question_are_ignored() {
        assert_eq!(parse_markers("OPTIONS: a | b\nLEANING: a"), vec![]);
    }

    #[test]
    fn test_question_ignores_trailing_prose() {
        let text = "QUESTION: which port?\nI will default to 8080 otherwise.";
        assert_eq!(
            parse_markers(text),
            vec![Marker::Question {
                text: "which port?".to_string(),
                options: vec![],
                suggestion: None,
            }]
        );
    }

    #[test]
    fn test_options_on_following_lines() {
        let text = "QUESTION: which database?\nOPTIONS: postgres | sqlite |  \nLEANING: sqlite\n";
        assert_eq!(
            parse_markers(text),
            vec![Marker::Question {
                text: "which database?".to_string(),
                options: vec!["postgres".to_string(), "sqlite".to_string()],
                suggestion: Some("sqlite".to_string()),
            }]
        );
    }

    #[test]
    fn test_only_decisions_span_lines() {
        let text = "FOCUS: writing tests\nthen refactoring\nASSUMING: node 20 is installed\nand on PATH FOCUS: docs";
        assert_eq!(
            parse_markers(text),
            vec![
                Marker::Focus {
                    text: "writing tests".to_string()
                },
                Marker::Assumption {
                    text: "node 20 is installed".to_string()
                },
                Marker::Focus {
                    text: "docs".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_plain_text_has_no_markers() {
        assert!(parse_markers("compiling crate...\nall good").is_empty());
    }
}
