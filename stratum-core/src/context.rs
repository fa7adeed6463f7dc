//! Explicit per-command context.
//!
//! Configuration, the filesystem, the container runtime, the prompt and the
//! cancellation token travel together in a [`Context`]; nothing is global.

use std::future::Future;
use std::sync::Arc;

use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::config::StratumConfig;
use crate::container::{ContainerRuntime, DockerCli};
use crate::db::{self, ConnectOptions};
use crate::error::{Result, StratumError};
use crate::fs::{Filesystem, OsFs};
use crate::prompt::{Prompt, StdinPrompt};

/// Which database a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// The local development database.
    #[default]
    Local,
    /// The remote (linked) database.
    Linked,
}

impl Target {
    pub fn is_local(self) -> bool {
        self == Target::Local
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Linked => write!(f, "remote"),
        }
    }
}

#[derive(Clone)]
pub struct Context {
    pub config: StratumConfig,
    pub fs: Arc<dyn Filesystem>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub prompt: Arc<dyn Prompt>,
    pub cancel: CancellationToken,
}

impl Context {
    /// Context backed by the real filesystem, docker and stdin.
    pub fn new(config: StratumConfig) -> Self {
        Self {
            config,
            fs: Arc::new(OsFs),
            runtime: Arc::new(DockerCli::default()),
            prompt: Arc::new(StdinPrompt),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Race `fut` against cancellation.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StratumError::Cancelled);
        }
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => {
                log::debug!("Operation cancelled");
                Err(StratumError::Cancelled)
            }
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(StratumError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Ask the user; cancellation interrupts the wait.
    pub async fn confirm(&self, label: &str, default: bool) -> Result<bool> {
        self.guard(self.prompt.confirm(label, default)).await
    }

    /// Connection string for a target.
    pub fn target_url(&self, target: Target) -> Result<String> {
        match target {
            Target::Local => Ok(self.config.local_connection_string()),
            Target::Linked => self.config.remote_connection_string(),
        }
    }

    pub fn connect_options(&self, target: Target) -> ConnectOptions {
        match target {
            Target::Local => ConnectOptions::local(),
            Target::Linked => ConnectOptions::from(&self.config.database),
        }
    }

    pub async fn connect(&self, target: Target) -> Result<Client> {
        let url = self.target_url(target)?;
        log::debug!("Connecting to {} database", target);
        self.guard(db::connect(&url, &self.connect_options(target)))
            .await
    }

    pub fn history_schema(&self) -> &str {
        &self.config.schemas.history
    }
}
