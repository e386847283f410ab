// ABOUTME: Per-session derived spec built up from polled agent output
// ABOUTME: Buffers partial lines, merges deduplicated entries and applies operator actions

use crate::dedup::is_duplicate;
use crate::natural::natural_questions;
use crate::parser::{parse_markers, Marker};
use crate::status::infer_status;
use crate::types::{
    new_id, Assumption, Decision, Question, QuestionSource, QuestionStatus, SessionStatus,
};
use crate::{ExtractionError, ExtractionSettings, Result};
use chrono::Utc;
use serde::Serialize;

/// Entries pulled from one chunk of complete output, before deduplication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub decisions: Vec<ExtractedDecision>,
    pub questions: Vec<ExtractedQuestion>,
    pub assumptions: Vec<String>,
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDecision {
    pub topic: String,
    pub choice: String,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedQuestion {
    pub text: String,
    pub options: Vec<String>,
    pub suggestion: Option<String>,
    pub source: QuestionSource,
}

/// Run the marker grammar over `text`, falling back to natural-language
/// questions only when no QUESTION marker was present.
pub fn extract(text: &str, settings: &ExtractionSettings) -> Extracted {
    let mut out = Extracted::default();

    for marker in parse_markers(text) {
        match marker {
            Marker::Decision {
                topic,
                choice,
                rationale,
            } => out.decisions.push(ExtractedDecision {
                topic,
                choice,
                rationale,
            }),
            Marker::Question {
                text,
                options,
                suggestion,
            } => out.questions.push(ExtractedQuestion {
                text,
                options,
                suggestion,
                source: QuestionSource::Marker,
            }),
            Marker::Assumption { text } => out.assumptions.push(text),
            Marker::Focus { text } => out.focus = Some(text),
        }
    }

    if out.questions.is_empty() {
        out.questions = natural_questions(text, settings.max_natural_questions)
            .into_iter()
            .map(|text| ExtractedQuestion {
                text,
                options: Vec::new(),
                suggestion: None,
                source: QuestionSource::Natural,
            })
            .collect();
    }

    out
}

/// What changed in a spec after one ingest
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SpecUpdate {
    pub new_decisions: Vec<Decision>,
    pub new_questions: Vec<Question>,
    pub new_assumptions: Vec<Assumption>,
    pub focus: Option<String>,
    pub status: SessionStatus,
    pub status_changed: bool,
}

impl SpecUpdate {
    fn unchanged(status: SessionStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_decisions.is_empty()
            && self.new_questions.is_empty()
            && self.new_assumptions.is_empty()
            && self.focus.is_none()
            && !self.status_changed
    }
}

fn decision_key(topic: &str, choice: &str, rationale: Option<&str>) -> String {
    match rationale {
        Some(rationale) => format!("{} {} {}", topic, choice, rationale),
        None => format!("{} {}", topic, choice),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSpec {
    pub session_id: String,
    pub decisions: Vec<Decision>,
    pub questions: Vec<Question>,
    pub assumptions: Vec<Assumption>,
    pub current_focus: Option<String>,
    pub blocked_on: Option<String>,
    pub status: SessionStatus,
    #[serde(skip)]
    output_buffer: String,
    #[serde(skip)]
    settings: ExtractionSettings,
}

impl SessionSpec {
    pub fn new(session_id: impl Into<String>, settings: ExtractionSettings) -> Self {
        Self {
            session_id: session_id.into(),
            decisions: Vec::new(),
            questions: Vec::new(),
            assumptions: Vec::new(),
            current_focus: None,
            blocked_on: None,
            status: SessionStatus::Working,
            output_buffer: String::new(),
            settings,
        }
    }

    /// Unterminated output carried over to the next poll
    pub fn output_buffer(&self) -> &str {
        &self.output_buffer
    }

    pub fn open_questions(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter().filter(|q| q.is_open())
    }

    /// Feed newly polled output. Complete lines are parsed now; a trailing
    /// partial line waits for more text. An empty chunk flushes the buffer.
    pub fn ingest(&mut self, chunk: &str) -> SpecUpdate {
        if chunk.is_empty() {
            return self.flush();
        }

        self.output_buffer.push_str(chunk);
        let Some(cut) = self.output_buffer.rfind('\n') else {
            return SpecUpdate::unchanged(self.status);
        };
        let rest = self.output_buffer.split_off(cut + 1);
        let complete = std::mem::replace(&mut self.output_buffer, rest);
        self.apply(&complete)
    }

    /// Parse whatever is left in the buffer
    pub fn flush(&mut self) -> SpecUpdate {
        let pending = std::mem::take(&mut self.output_buffer);
        if pending.trim().is_empty() {
            return SpecUpdate::unchanged(self.status);
        }
        self.apply(&pending)
    }

    fn apply(&mut self, text: &str) -> SpecUpdate {
        let extracted = extract(text, &self.settings);
        let prefix = self.settings.dedup_prefix;
        let now = Utc::now();
        let mut update = SpecUpdate::default();

        for d in extracted.decisions {
            let key = decision_key(&d.topic, &d.choice, d.rationale.as_deref());
            let known: Vec<String> = self
                .decisions
                .iter()
                .map(|e| decision_key(&e.topic, &e.choice, e.rationale.as_deref()))
                .collect();
            if is_duplicate(&key, known.iter().map(String::as_str), prefix) {
                continue;
            }
            let decision = Decision {
                id: new_id("dec"),
                topic: d.topic,
                choice: d.choice,
                rationale: d.rationale,
                timestamp: now,
                approved: false,
            };
            self.decisions.push(decision.clone());
            update.new_decisions.push(decision);
        }

        for q in extracted.questions {
            if is_duplicate(&q.text, self.questions.iter().map(|e| e.text.as_str()), prefix) {
                continue;
            }
            let question = Question {
                id: new_id("q"),
                text: q.text,
                options: q.options,
                suggestion: q.suggestion,
                status: QuestionStatus::Open,
                answer: None,
                source: q.source,
                auto_answered: false,
                timestamp: now,
            };
            self.questions.push(question.clone());
            update.new_questions.push(question);
        }

        for text in extracted.assumptions {
            if is_duplicate(&text, self.assumptions.iter().map(|e| e.text.as_str()), prefix) {
                continue;
            }
            let assumption = Assumption {
                id: new_id("asm"),
                text,
                flagged: false,
                correction: None,
                timestamp: now,
            };
            self.assumptions.push(assumption.clone());
            update.new_assumptions.push(assumption);
        }

        if let Some(focus) = extracted.focus {
            if self.current_focus.as_deref() != Some(focus.as_str()) {
                self.current_focus = Some(focus.clone());
                update.focus = Some(focus);
            }
        }

        self.refresh_blocked_on();
        let status = infer_status(text, self.blocked_on.is_some());
        update.status_changed = status != self.status;
        update.status = status;
        self.status = status;

        update
    }

    fn refresh_blocked_on(&mut self) {
        let next = self.open_questions().next().map(|q| q.id.clone());
        self.blocked_on = next;
    }

    /// Resolving the last open question releases a waiting session
    fn after_resolution(&mut self) {
        self.refresh_blocked_on();
        if self.blocked_on.is_none() && self.status == SessionStatus::Waiting {
            self.status = SessionStatus::Working;
        }
    }

    /// The question, provided it still waits for an answer
    pub fn open_question(&self, question_id: &str) -> Result<&Question> {
        let question = self
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| ExtractionError::QuestionNotFound(question_id.to_string()))?;
        if !question.is_open() {
            return Err(ExtractionError::QuestionNotOpen(question_id.to_string()));
        }
        Ok(question)
    }

    fn open_question_mut(&mut self, question_id: &str) -> Result<&mut Question> {
        let question = self
            .questions
            .iter_mut()
            .find(|q| q.id == question_id)
            .ok_or_else(|| ExtractionError::QuestionNotFound(question_id.to_string()))?;
        if !question.is_open() {
            return Err(ExtractionError::QuestionNotOpen(question_id.to_string()));
        }
        Ok(question)
    }

    pub fn answer_question(&mut self, question_id: &str, answer: &str) -> Result<Question> {
        let question = self.open_question_mut(question_id)?;
        question.status = QuestionStatus::Answered;
        question.answer = Some(answer.to_string());
        let answered = question.clone();
        self.after_resolution();
        Ok(answered)
    }

    /// Record an answer found without asking the operator
    pub fn auto_answer_question(&mut self, question_id: &str, answer: &str) -> Result<Question> {
        let question = self.open_question_mut(question_id)?;
        question.status = QuestionStatus::Answered;
        question.answer = Some(answer.to_string());
        question.auto_answered = true;
        let answered = question.clone();
        self.after_resolution();
        Ok(answered)
    }

    pub fn skip_question(&mut self, question_id: &str) -> Result<Question> {
        let question = self.open_question_mut(question_id)?;
        question.status = QuestionStatus::Skipped;
        let skipped = question.clone();
        self.after_resolution();
        Ok(skipped)
    }

    pub fn flag_assumption(
        &mut self,
        assumption_id: &str,
        correction: Option<&str>,
    ) -> Result<Assumption> {
        let assumption = self
            .assumptions
            .iter_mut()
            .find(|a| a.id == assumption_id)
            .ok_or_else(|| ExtractionError::AssumptionNotFound(assumption_id.to_string()))?;
        assumption.flagged = true;
        assumption.correction = correction
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);
        Ok(assumption.clone())
    }

    pub fn approve_decision(&mut self, decision_id: &str) -> Result<Decision> {
        let decision = self
            .decisions
            .iter_mut()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| ExtractionError::DecisionNotFound(decision_id.to_string()))?;
        decision.approved = true;
        Ok(decision.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EXAMPLE: &str = "DECISION: [auth] -> [jwt] because stateless\nQUESTION: use redis? OPTIONS: yes | no LEANING: yes\nFOCUS: wiring auth";

    fn spec() -> SessionSpec {
        SessionSpec::new("sess-1", ExtractionSettings::default())
    }

    #[test]
    fn test_extract_round_trip_example() {
        let extracted = extract(EXAMPLE, &ExtractionSettings::default());

        assert_eq!(
            extracted.decisions,
            vec![ExtractedDecision {
                topic: "auth".to_string(),
                choice: "jwt".to_string(),
                rationale: Some("stateless".to_string()),
            }]
        );
        assert_eq!(
            extracted.questions,
            vec![ExtractedQuestion {
                text: "use redis?".to_string(),
                options: vec!["yes".to_string(), "no".to_string()],
                suggestion: Some("yes".to_string()),
                source: QuestionSource::Marker,
            }]
        );
        assert_eq!(extracted.focus.as_deref(), Some("wiring auth"));
        assert!(extracted.assumptions.is_empty());
    }

    #[test]
    fn test_ingest_holds_partial_line_until_flush() {
        let mut spec = spec();

        let first = spec.ingest(EXAMPLE);
        assert_eq!(first.new_decisions.len(), 1);
        assert_eq!(first.new_questions.len(), 1);
        assert_eq!(first.focus, None);
        assert_eq!(spec.output_buffer(), "FOCUS: wiring auth");

        let flushed = spec.ingest("");
        assert_eq!(flushed.focus.as_deref(), Some("wiring auth"));
        assert_eq!(spec.current_focus.as_deref(), Some("wiring auth"));
        assert_eq!(spec.output_buffer(), "");
    }

    #[test]
    fn test_partial_line_joins_next_chunk() {
        let mut spec = spec();
        assert!(spec.ingest("ASSUMING: the api is").is_empty());
        let update = spec.ingest(" versioned\n");
        assert_eq!(update.new_assumptions.len(), 1);
        assert_eq!(spec.assumptions[0].text, "the api is versioned");
    }

    #[test]
    fn test_same_decision_twice_is_kept_once() {
        let mut spec = spec();
        spec.ingest("DECISION: [auth] -> [jwt] because stateless\n");
        let again = spec.ingest("DECISION: [auth] -> [jwt] because stateless\n");

        assert!(again.new_decisions.is_empty());
        assert_eq!(spec.decisions.len(), 1);
    }

    #[test]
    fn test_repeated_question_and_assumption_deduplicated() {
        let mut spec = spec();
        spec.ingest("QUESTION: use redis?\nASSUMING: node 20\n");
        let update = spec.ingest("question: Use Redis?\nassuming: Node 20\n");
        assert!(update.new_questions.is_empty());
        assert!(update.new_assumptions.is_empty());
        assert_eq!(spec.questions.len(), 1);
        assert_eq!(spec.assumptions.len(), 1);
    }

    #[test]
    fn test_natural_fallback_skipped_when_markers_present() {
        let mut spec = spec();
        let update =
            spec.ingest("QUESTION: which port?\nShould I also add TLS? Should I add metrics?\n");
        assert_eq!(update.new_questions.len(), 1);
        assert_eq!(update.new_questions[0].source, QuestionSource::Marker);
    }

    #[test]
    fn test_natural_fallback_respects_cap_setting() {
        let mut spec = SessionSpec::new(
            "sess-1",
            ExtractionSettings {
                max_natural_questions: 1,
                ..ExtractionSettings::default()
            },
        );
        let update = spec.ingest("Should I add TLS? Should I add metrics?\n");
        assert_eq!(update.new_questions.len(), 1);
        assert_eq!(update.new_questions[0].source, QuestionSource::Natural);
    }

    #[test]
    fn test_open_question_blocks_and_answer_releases() {
        let mut spec = spec();
        let update = spec.ingest("QUESTION: use redis?\n");
        let question_id = update.new_questions[0].id.clone();
        assert_eq!(spec.status, SessionStatus::Waiting);
        assert_eq!(spec.blocked_on.as_deref(), Some(question_id.as_str()));

        let answered = spec.answer_question(&question_id, "yes").unwrap();
        assert_eq!(answered.status, QuestionStatus::Answered);
        assert_eq!(answered.answer.as_deref(), Some("yes"));
        assert_eq!(spec.blocked_on, None);
        assert_eq!(spec.status, SessionStatus::Working);

        assert!(matches!(
            spec.skip_question(&question_id),
            Err(ExtractionError::QuestionNotOpen(_))
        ));
        assert!(matches!(
            spec.answer_question("q_missing", "x"),
            Err(ExtractionError::QuestionNotFound(_))
        ));
    }

    #[test]
    fn test_blocked_on_moves_to_next_open_question() {
        let mut spec = spec();
        let update = spec.ingest("QUESTION: first thing?\nQUESTION: second thing?\n");
        let first = update.new_questions[0].id.clone();
        let second = update.new_questions[1].id.clone();

        spec.skip_question(&first).unwrap();
        assert_eq!(spec.blocked_on.as_deref(), Some(second.as_str()));
        assert_eq!(spec.status, SessionStatus::Waiting);
    }

    #[test]
    fn test_flag_assumption_and_approve_decision() {
        let mut spec = spec();
        spec.ingest("ASSUMING: postgres 14\nDECISION: orm -> sqlx\n");
        let assumption_id = spec.assumptions[0].id.clone();
        let decision_id = spec.decisions[0].id.clone();

        let flagged = spec.flag_assumption(&assumption_id, Some(" postgres 16 ")).unwrap();
        assert!(flagged.flagged);
        assert_eq!(flagged.correction.as_deref(), Some("postgres 16"));

        assert!(spec.approve_decision(&decision_id).unwrap().approved);
        assert!(matches!(
            spec.approve_decision("dec_missing"),
            Err(ExtractionError::DecisionNotFound(_))
        ));
        assert!(matches!(
            spec.flag_assumption("asm_missing", None),
            Err(ExtractionError::AssumptionNotFound(_))
        ));
    }

    #[test]
    fn test_completion_phrasing_marks_done() {
        let mut spec = spec();
        spec.ingest("FOCUS: computing\n");
        let update = spec.ingest("...\n4\nTask complete.\n");
        assert_eq!(update.status, SessionStatus::Done);
        assert!(update.status_changed);
        assert_eq!(spec.current_focus.as_deref(), Some("computing"));
    }

    #[test]
    fn test_focus_last_one_wins() {
        let mut spec = spec();
        let update = spec.ingest("FOCUS: one\nFOCUS: two\n");
        assert_eq!(update.focus.as_deref(), Some("two"));
    }
}
