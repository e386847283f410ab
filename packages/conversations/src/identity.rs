// ABOUTME: Caller identity carried into every mutating pipeline entry point
// ABOUTME: Calls without an authenticated subject are rejected before any side effect

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated subject (user or service account) id
    pub subject: String,
    pub team_id: String,
}

impl Identity {
    pub fn new(subject: impl Into<String>, team_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            team_id: team_id.into(),
        }
    }

    /// Identity used by background components acting on a team's behalf
    pub fn service(team_id: impl Into<String>) -> Self {
        Self::new("service:fleet", team_id)
    }
}

/// Identity as resolved by whatever fronts the pipeline; `None` when the caller
/// presented no valid credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    identity: Option<Identity>,
}

impl AuthContext {
    pub fn authenticated(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn require(&self) -> Result<&Identity, crate::PipelineError> {
        self.identity
            .as_ref()
            .filter(|identity| !identity.subject.is_empty())
            .ok_or(crate::PipelineError::Unauthenticated)
    }
}

impl From<Identity> for AuthContext {
    fn from(identity: Identity) -> Self {
        Self::authenticated(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require() {
        let ctx = AuthContext::from(Identity::new("user_1", "team_a"));
        assert_eq!(ctx.require().unwrap().subject, "user_1");

        assert!(matches!(
            AuthContext::anonymous().require(),
            Err(crate::PipelineError::Unauthenticated)
        ));
        assert!(AuthContext::from(Identity::new("", "team_a")).require().is_err());
    }
}
