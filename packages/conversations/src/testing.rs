// ABOUTME: Scriptable sandbox transport double for pipeline and orchestrator tests
// ABOUTME: Records every call and answers prompts/exec from configurable responses

use crate::client::{
    ClientError, ExecRequest, ExecResult, HealthStatus, InitRequest, PromptRequest,
    PromptResponse, Result, SandboxEndpoint, SandboxTransport,
};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum PromptBehavior {
    Accept,
    Reject,
    Unreachable,
}

#[derive(Default)]
pub struct MockTransport {
    inits: Mutex<Vec<(SandboxEndpoint, InitRequest)>>,
    prompts: Mutex<Vec<(SandboxEndpoint, PromptRequest)>>,
    execs: Mutex<Vec<ExecRequest>>,
    rpcs: Mutex<Vec<JsonValue>>,
    prompt_script: Mutex<VecDeque<PromptBehavior>>,
    exec_stdout: Mutex<String>,
    fail_init: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviours for the next prompts, in order; once exhausted prompts are accepted
    pub fn script_prompts(&self, behaviors: impl IntoIterator<Item = PromptBehavior>) {
        lock(&self.prompt_script).extend(behaviors);
    }

    pub fn set_exec_stdout(&self, stdout: impl Into<String>) {
        *lock(&self.exec_stdout) = stdout.into();
    }

    pub fn fail_init(&self, fail: bool) {
        *lock(&self.fail_init) = fail;
    }

    pub fn inits(&self) -> Vec<InitRequest> {
        lock(&self.inits).iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn prompts(&self) -> Vec<PromptRequest> {
        lock(&self.prompts).iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn execs(&self) -> Vec<ExecRequest> {
        lock(&self.execs).clone()
    }

    pub fn rpcs(&self) -> Vec<JsonValue> {
        lock(&self.rpcs).clone()
    }
}

#[async_trait]
impl SandboxTransport for MockTransport {
    async fn init(&self, endpoint: &SandboxEndpoint, request: &InitRequest) -> Result<()> {
        if *lock(&self.fail_init) {
            return Err(ClientError::Connection("mock init failure".to_string()));
        }
        lock(&self.inits).push((endpoint.clone(), request.clone()));
        Ok(())
    }

    async fn prompt(
        &self,
        endpoint: &SandboxEndpoint,
        request: &PromptRequest,
    ) -> Result<PromptResponse> {
        lock(&self.prompts).push((endpoint.clone(), request.clone()));
        let behavior = lock(&self.prompt_script)
            .pop_front()
            .unwrap_or(PromptBehavior::Accept);
        match behavior {
            PromptBehavior::Accept => Ok(PromptResponse { accepted: true }),
            PromptBehavior::Reject => Ok(PromptResponse { accepted: false }),
            PromptBehavior::Unreachable => {
                Err(ClientError::Connection("mock sandbox unreachable".to_string()))
            }
        }
    }

    async fn health(&self, _endpoint: &SandboxEndpoint) -> Result<HealthStatus> {
        Ok(HealthStatus {
            status: "ok".to_string(),
        })
    }

    async fn exec(&self, _endpoint: &SandboxEndpoint, request: &ExecRequest) -> Result<ExecResult> {
        lock(&self.execs).push(request.clone());
        Ok(ExecResult {
            exit_code: 0,
            stdout: lock(&self.exec_stdout).clone(),
            stderr: String::new(),
        })
    }

    async fn rpc(&self, _endpoint: &SandboxEndpoint, payload: &JsonValue) -> Result<JsonValue> {
        lock(&self.rpcs).push(payload.clone());
        Ok(json!({ "ok": true, "echo": payload }))
    }
}
