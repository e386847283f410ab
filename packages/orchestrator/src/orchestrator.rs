// ABOUTME: Session poll loop tying live sessions, extraction and question routing together
// ABOUTME: Also the entry point for operator actions on a session's spec

use crate::autoanswer::{try_auto_answer, DEFAULT_SEARCH_DEPTH};
use crate::connector::{LiveSession, SessionConnector};
use crate::events::OrchestratorEvent;
use crate::{OrchestratorError, Result};
use fleet_conversations::AuthContext;
use fleet_extraction::{
    classify, Assumption, Classification, Decision, ExtractionSettings, Question, SessionSpec,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub extraction: ExtractionSettings,
    /// Search the sandbox for answers to locational questions
    pub auto_answer: bool,
    pub search_depth: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            extraction: ExtractionSettings::default(),
            auto_answer: true,
            search_depth: DEFAULT_SEARCH_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub discovered: usize,
    pub lost: usize,
    pub polled: usize,
    pub surfaced: usize,
    pub auto_answered: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SessionOutcome {
    surfaced: usize,
    auto_answered: usize,
    skipped: usize,
}

struct TrackedSession {
    session: LiveSession,
    spec: Arc<Mutex<SessionSpec>>,
}

pub struct Orchestrator {
    connector: Arc<dyn SessionConnector>,
    settings: OrchestratorSettings,
    sessions: RwLock<HashMap<String, TrackedSession>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    running: Arc<RwLock<bool>>,
}

impl Orchestrator {
    /// Create the orchestrator together with the receiving end of its event stream.
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                connector,
                settings,
                sessions: RwLock::new(HashMap::new()),
                events,
                running: Arc::new(RwLock::new(false)),
            },
            events_rx,
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn emit(&self, event: OrchestratorEvent) {
        if self.events.send(event).is_err() {
            debug!("No event listener, dropping orchestrator event");
        }
    }

    /// Start the poll loop. Returns `None` if it is already running.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut running = self.running.write().await;
        if *running {
            return None;
        }
        *running = true;
        drop(running);

        let orchestrator = Arc::clone(self);
        let interval = self.settings.poll_interval;

        Some(tokio::spawn(async move {
            info!(?interval, "Session orchestrator started");

            loop {
                if !*orchestrator.running.read().await {
                    info!("Session orchestrator stopped");
                    break;
                }

                match orchestrator.tick().await {
                    Ok(report) if report.discovered + report.lost + report.failed > 0 => {
                        info!(
                            discovered = report.discovered,
                            lost = report.lost,
                            polled = report.polled,
                            failed = report.failed,
                            "Orchestrator tick"
                        );
                    }
                    Ok(report) => debug!(polled = report.polled, "Orchestrator tick"),
                    Err(e) => error!("Orchestrator tick failed: {}", e),
                }

                time::sleep(interval).await;
            }
        }))
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One poll: reconcile the live session set, then pull and process output
    /// for every session concurrently.
    pub async fn tick(&self) -> Result<TickReport> {
        let live = self.connector.list_sessions().await?;
        let mut report = TickReport::default();

        let work: Vec<(LiveSession, Arc<Mutex<SessionSpec>>)> = {
            let mut sessions = self.sessions.write().await;
            let live_ids: HashSet<&str> = live.iter().map(|s| s.id.as_str()).collect();

            let lost: Vec<String> = sessions
                .keys()
                .filter(|id| !live_ids.contains(id.as_str()))
                .cloned()
                .collect();
            for session_id in lost {
                sessions.remove(&session_id);
                self.connector.forget(&session_id).await;
                info!(%session_id, "Session lost");
                self.emit(OrchestratorEvent::SessionLost { session_id });
                report.lost += 1;
            }

            for session in &live {
                match sessions.get_mut(&session.id) {
                    Some(tracked) => tracked.session = session.clone(),
                    None => {
                        let spec = SessionSpec::new(session.id.clone(), self.settings.extraction);
                        sessions.insert(
                            session.id.clone(),
                            TrackedSession {
                                session: session.clone(),
                                spec: Arc::new(Mutex::new(spec)),
                            },
                        );
                        info!(session_id = %session.id, "Session discovered");
                        self.emit(OrchestratorEvent::SessionDiscovered {
                            session_id: session.id.clone(),
                        });
                        report.discovered += 1;
                    }
                }
            }

            sessions
                .values()
                .map(|t| (t.session.clone(), t.spec.clone()))
                .collect()
        };

        let results = join_all(
            work.iter()
                .map(|(session, spec)| self.poll_session(session, spec)),
        )
        .await;

        for ((session, _), result) in work.iter().zip(results) {
            report.polled += 1;
            match result {
                Ok(outcome) => {
                    report.surfaced += outcome.surfaced;
                    report.auto_answered += outcome.auto_answered;
                    report.skipped += outcome.skipped;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(session_id = %session.id, "Session poll failed: {}", e);
                }
            }
        }

        Ok(report)
    }

    async fn poll_session(
        &self,
        session: &LiveSession,
        spec: &Mutex<SessionSpec>,
    ) -> Result<SessionOutcome> {
        let update = {
            let mut spec = spec.lock().await;
            let output = self.connector.pull_output(session).await?;
            spec.ingest(&output)
        };

        let mut outcome = SessionOutcome::default();
        if update.is_empty() {
            return Ok(outcome);
        }

        let new_questions = update.new_questions.clone();
        self.emit(OrchestratorEvent::SpecUpdated {
            session_id: session.id.clone(),
            update,
        });

        for question in new_questions {
            match self.route_question(session, spec, &question).await {
                Classification::Surface => outcome.surfaced += 1,
                Classification::AutoAnswer => outcome.auto_answered += 1,
                Classification::Skip => outcome.skipped += 1,
            }
        }
        Ok(outcome)
    }

    /// Skip, auto-answer or surface one new question. Returns what happened.
    async fn route_question(
        &self,
        session: &LiveSession,
        spec: &Mutex<SessionSpec>,
        question: &Question,
    ) -> Classification {
        match classify(&question.text, &question.options) {
            Classification::Skip => {
                if let Err(e) = spec.lock().await.skip_question(&question.id) {
                    debug!(question_id = %question.id, "Question already resolved: {}", e);
                }
                debug!(session_id = %session.id, question = %question.text, "Question skipped");
                Classification::Skip
            }
            Classification::AutoAnswer if self.settings.auto_answer => {
                match self.auto_answer(session, spec, question).await {
                    Ok(Some(answered)) => {
                        info!(session_id = %session.id, question_id = %answered.id, "Question auto-answered");
                        self.emit(OrchestratorEvent::QuestionAutoAnswered {
                            session_id: session.id.clone(),
                            question: answered,
                        });
                        Classification::AutoAnswer
                    }
                    Ok(None) => self.surface(session, question),
                    Err(e) => {
                        warn!(session_id = %session.id, question_id = %question.id, "Auto-answer failed: {}", e);
                        self.surface(session, question)
                    }
                }
            }
            Classification::AutoAnswer | Classification::Surface => {
                self.surface(session, question)
            }
        }
    }

    fn surface(&self, session: &LiveSession, question: &Question) -> Classification {
        info!(session_id = %session.id, question_id = %question.id, "Question surfaced");
        self.emit(OrchestratorEvent::QuestionSurfaced {
            session_id: session.id.clone(),
            question: question.clone(),
        });
        Classification::Surface
    }

    async fn auto_answer(
        &self,
        session: &LiveSession,
        spec: &Mutex<SessionSpec>,
        question: &Question,
    ) -> Result<Option<Question>> {
        let Some(answer) = try_auto_answer(
            self.connector.as_ref(),
            session,
            &question.text,
            self.settings.search_depth,
        )
        .await?
        else {
            return Ok(None);
        };

        // Held across the inject so an operator answer cannot interleave
        let mut spec = spec.lock().await;
        spec.open_question(&question.id)?;
        self.connector
            .inject(session, &answer, &format!("auto-answer:{}", question.id))
            .await?;
        Ok(Some(spec.auto_answer_question(&question.id, &answer)?))
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    /// Session visible to the caller; other teams' sessions read as missing
    async fn tracked(
        &self,
        auth: &AuthContext,
        session_id: &str,
    ) -> Result<(LiveSession, Arc<Mutex<SessionSpec>>)> {
        let identity = auth
            .require()
            .map_err(|_| OrchestratorError::Unauthenticated)?;
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|t| t.session.team_id == identity.team_id)
            .map(|t| (t.session.clone(), t.spec.clone()))
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    /// Record the operator's answer and send it to the agent.
    pub async fn answer_question(
        &self,
        auth: &AuthContext,
        session_id: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<Question> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(OrchestratorError::Validation("answer is empty".to_string()));
        }
        let (session, spec) = self.tracked(auth, session_id).await?;
        let mut spec = spec.lock().await;
        spec.open_question(question_id)?;

        self.connector
            .inject(&session, answer, &format!("answer:{}", question_id))
            .await?;
        let answered = spec.answer_question(question_id, answer)?;
        info!(session_id, question_id, "Question answered");
        Ok(answered)
    }

    pub async fn skip_question(
        &self,
        auth: &AuthContext,
        session_id: &str,
        question_id: &str,
    ) -> Result<Question> {
        let (_, spec) = self.tracked(auth, session_id).await?;
        let skipped = spec.lock().await.skip_question(question_id)?;
        info!(session_id, question_id, "Question skipped");
        Ok(skipped)
    }

    /// Flag an assumption as wrong; a correction is sent to the agent.
    pub async fn flag_assumption(
        &self,
        auth: &AuthContext,
        session_id: &str,
        assumption_id: &str,
        correction: Option<&str>,
    ) -> Result<Assumption> {
        let (session, spec) = self.tracked(auth, session_id).await?;
        let flagged = spec.lock().await.flag_assumption(assumption_id, correction)?;

        if let Some(correction) = flagged.correction.as_deref() {
            let text = format!(
                "Correction to your assumption \"{}\": {}",
                flagged.text, correction
            );
            self.connector
                .inject(&session, &text, &format!("correction:{}", assumption_id))
                .await?;
        }
        info!(session_id, assumption_id, "Assumption flagged");
        Ok(flagged)
    }

    pub async fn approve_decision(
        &self,
        auth: &AuthContext,
        session_id: &str,
        decision_id: &str,
    ) -> Result<Decision> {
        let (_, spec) = self.tracked(auth, session_id).await?;
        let approved = spec.lock().await.approve_decision(decision_id)?;
        info!(session_id, decision_id, "Decision approved");
        Ok(approved)
    }

    /// Snapshot of a session's spec
    pub async fn spec(&self, auth: &AuthContext, session_id: &str) -> Result<SessionSpec> {
        let (_, spec) = self.tracked(auth, session_id).await?;
        let snapshot = spec.lock().await.clone();
        Ok(snapshot)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
