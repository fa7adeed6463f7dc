//! Test doubles for the runtime and prompt seams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::container::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::error::{Result, StratumError};
use crate::prompt::Prompt;

/// A call made against [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Ping,
    Start(ContainerSpec),
    Inspect(String),
    Logs(String),
    Remove(String),
    RunOnce(ContainerSpec),
    Signal(String, String),
    Restart(String),
}

/// Scripted result of a one-shot container.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn exit(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    statuses: VecDeque<ContainerStatus>,
    default_status: Option<ContainerStatus>,
    outputs: VecDeque<RunOutput>,
    logs: String,
    ping_error: Option<String>,
    start_error: Option<String>,
    remove_error: Option<String>,
}

/// In-memory [`ContainerRuntime`] that records every call.
///
/// Containers report healthy unless statuses are queued. One-shot runs
/// consume queued outputs in order and succeed with empty output once the
/// queue is drained.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

fn healthy() -> ContainerStatus {
    ContainerStatus {
        running: true,
        status: "running".to_string(),
        health: Some("healthy".to_string()),
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_status(&self, status: ContainerStatus) {
        self.lock().statuses.push_back(status);
    }

    /// Queue a running container with the given health state.
    pub fn push_health(&self, health: &str) {
        self.push_status(ContainerStatus {
            running: true,
            status: "running".to_string(),
            health: Some(health.to_string()),
        });
    }

    /// Health state reported once the queue is empty.
    pub fn set_default_health(&self, health: &str) {
        self.lock().default_status = Some(ContainerStatus {
            running: true,
            status: "running".to_string(),
            health: Some(health.to_string()),
        });
    }

    pub fn set_logs(&self, logs: &str) {
        self.lock().logs = logs.to_string();
    }

    pub fn push_output(&self, output: RunOutput) {
        self.lock().outputs.push_back(output);
    }

    pub fn fail_ping(&self, message: &str) {
        self.lock().ping_error = Some(message.to_string());
    }

    pub fn fail_start(&self, message: &str) {
        self.lock().start_error = Some(message.to_string());
    }

    pub fn fail_remove(&self, message: &str) {
        self.lock().remove_error = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Start(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::RunOnce(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    /// Id the mock assigns to a started container.
    pub fn id_for(name: &str) -> String {
        format!("mock-{}", name)
    }

    fn record(&self, call: RuntimeCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        self.record(RuntimeCall::Ping);
        match self.lock().ping_error.clone() {
            Some(msg) => Err(StratumError::NotRunning(msg)),
            None => Ok(()),
        }
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(RuntimeCall::Start(spec.clone()));
        if let Some(msg) = self.lock().start_error.clone() {
            return Err(StratumError::ContainerError(msg));
        }
        Ok(Self::id_for(&spec.name))
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>> {
        self.record(RuntimeCall::Inspect(id.to_string()));
        let mut state = self.lock();
        let status = state
            .statuses
            .pop_front()
            .or_else(|| state.default_status.clone())
            .unwrap_or_else(healthy);
        Ok(Some(status))
    }

    async fn logs(&self, id: &str, _lines: usize) -> Result<String> {
        self.record(RuntimeCall::Logs(id.to_string()));
        Ok(self.lock().logs.clone())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Remove(id.to_string()));
        match self.lock().remove_error.clone() {
            Some(msg) => Err(StratumError::ContainerError(msg)),
            None => Ok(()),
        }
    }

    async fn run_once(
        &self,
        spec: &ContainerSpec,
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i32> {
        self.record(RuntimeCall::RunOnce(spec.clone()));
        let output = self.lock().outputs.pop_front().unwrap_or_default();
        stdout.write_all(output.stdout.as_bytes()).await?;
        stderr.write_all(output.stderr.as_bytes()).await?;
        Ok(output.exit_code)
    }

    async fn signal(&self, id: &str, signal: &str) -> Result<()> {
        self.record(RuntimeCall::Signal(id.to_string(), signal.to_string()));
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Restart(id.to_string()));
        Ok(())
    }
}

/// [`Prompt`] that answers from a queue and records every question.
#[derive(Clone, Default)]
pub struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<bool>>>,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            asked: Arc::default(),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl Prompt for ScriptedPrompt {
    /// Falls back to `default` once the queue is empty.
    async fn confirm(&self, label: &str, default: bool) -> Result<bool> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(label.to_string());
        }
        let answer = self
            .answers
            .lock()
            .ok()
            .and_then(|mut a| a.pop_front())
            .unwrap_or(default);
        Ok(answer)
    }
}
