// ABOUTME: Answers locational questions by searching the sandbox working tree
// ABOUTME: A bounded find for the question's search term; exactly one hit becomes the answer

use crate::connector::{LiveSession, SessionConnector};
use crate::Result;
use fleet_conversations::ExecRequest;
use fleet_extraction::search_term;
use tracing::debug;

const PRUNED_DIRS: &[&str] = &[".git", "node_modules", "target"];

pub const DEFAULT_SEARCH_DEPTH: u32 = 6;
pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 10_000;

/// argv for a case-insensitive name search under `cwd`, skipping vendored
/// and VCS directories
pub fn find_command(cwd: &str, term: &str, max_depth: u32) -> Vec<String> {
    let pattern: String = term
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '\\'))
        .collect();

    let mut argv: Vec<String> = vec![
        "find".into(),
        cwd.into(),
        "-maxdepth".into(),
        max_depth.to_string(),
        "(".into(),
    ];
    for (i, dir) in PRUNED_DIRS.iter().enumerate() {
        if i > 0 {
            argv.push("-o".into());
        }
        argv.push("-name".into());
        argv.push((*dir).into());
    }
    argv.extend([
        ")".into(),
        "-prune".into(),
        "-o".into(),
        "-iname".into(),
        format!("*{}*", pattern),
        "-print".into(),
    ]);
    argv
}

/// The answer when the listing holds exactly one path
pub fn answer_from_listing(stdout: &str) -> Option<String> {
    let mut paths = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let only = paths.next()?;
    if paths.next().is_some() {
        return None;
    }
    Some(format!("It is at {}", only))
}

/// Try to answer `question` from the session's filesystem.
///
/// `Ok(None)` means the question should go to the operator instead.
pub async fn try_auto_answer(
    connector: &dyn SessionConnector,
    session: &LiveSession,
    question: &str,
    max_depth: u32,
) -> Result<Option<String>> {
    let Some(term) = search_term(question) else {
        debug!(session_id = %session.id, question, "No search term in question");
        return Ok(None);
    };

    let request = ExecRequest {
        command: find_command(&session.cwd, &term, max_depth),
        cwd: Some(session.cwd.clone()),
        timeout_ms: DEFAULT_SEARCH_TIMEOUT_MS,
    };
    let result = connector.exec(session, &request).await?;
    if result.exit_code != 0 {
        debug!(session_id = %session.id, term, exit_code = result.exit_code, "Search failed");
        return Ok(None);
    }

    Ok(answer_from_listing(&result.stdout))
}
