//! Container runtime seam.
//!
//! The shadow database, the schema differ and `pg_dump` all run in
//! containers. Everything the reconciler needs from the runtime goes
//! through [`ContainerRuntime`], so tests can swap in a mock.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{tail, Result, StratumError};

/// Number of log lines excerpted into health errors.
pub const LOG_TAIL_LINES: usize = 20;

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Fixed container name; an existing container with it is replaced.
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
    /// `(host_port, container_port)` bindings.
    pub ports: Vec<(u16, u16)>,
    /// `volume:/path` mounts.
    pub volumes: Vec<String>,
    pub network: Option<String>,
    /// Shell command the runtime polls to decide health.
    pub health_cmd: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Runtime view of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    /// Runtime state string (`running`, `exited`, ...).
    pub status: String,
    /// Health check state, when the container defines one.
    pub health: Option<String>,
}

impl ContainerStatus {
    pub fn is_healthy(&self) -> bool {
        self.running && self.health.as_deref().map_or(true, |h| h == "healthy")
    }

    pub fn describe(&self) -> String {
        match &self.health {
            Some(h) => format!("{} ({})", self.status, h),
            None => self.status.clone(),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fail with [`StratumError::NotRunning`] if the runtime is unreachable.
    async fn ping(&self) -> Result<()>;

    /// Create and start a detached container. Returns its id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Current state, or `None` if the container does not exist.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>>;

    /// Last `lines` lines of combined output.
    async fn logs(&self, id: &str, lines: usize) -> Result<String>;

    /// Force-remove a container and its anonymous volumes. Removing a
    /// container that does not exist succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Run a container to completion, streaming its output. Returns the exit code.
    async fn run_once(
        &self,
        spec: &ContainerSpec,
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i32>;

    /// Send a signal (e.g. `SIGHUP`) to a running container.
    async fn signal(&self, id: &str, signal: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()>;

    /// Poll until the container reports healthy, once per second.
    async fn wait_healthy(&self, id: &str, timeout: Duration) -> Result<()> {
        poll_healthy(self, id, timeout, Duration::from_secs(1)).await
    }
}

/// Health polling loop behind [`ContainerRuntime::wait_healthy`].
///
/// A container that stops running or disappears fails immediately with its
/// status and a log excerpt; one that stays unhealthy fails at `timeout`.
pub async fn poll_healthy<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    id: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = runtime.inspect(id).await?;
        match status {
            Some(s) if s.is_healthy() => {
                log::debug!("Container is healthy; id={}", id);
                return Ok(());
            }
            Some(s) if s.running && Instant::now() < deadline => {
                log::debug!("Waiting for container health; id={}, status={}", id, s.describe());
            }
            other => {
                let status = match other {
                    Some(s) if s.running => format!("{}, timed out after {}s", s.describe(), timeout.as_secs()),
                    Some(s) => s.describe(),
                    None => "not found".to_string(),
                };
                let logs = runtime
                    .logs(id, LOG_TAIL_LINES)
                    .await
                    .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
                return Err(StratumError::ShadowUnhealthy { status, logs });
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// [`ContainerRuntime`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

struct Output {
    code: i32,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> StratumError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StratumError::NotRunning(format!("'{}' executable not found on PATH", self.binary))
        } else {
            StratumError::IoError(e)
        }
    }

    async fn output(&self, args: Vec<String>) -> Result<Output> {
        log::debug!(
            "Running container command; command={}",
            args.first().map(String::as_str).unwrap_or_default()
        );
        let out = self
            .command(&args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(Output {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    async fn checked(&self, args: Vec<String>) -> Result<String> {
        let what = args.first().cloned().unwrap_or_default();
        let out = self.output(args).await?;
        if out.code != 0 {
            return Err(classify_failure(&what, &out.stderr));
        }
        Ok(out.stdout)
    }
}

/// Map a failed docker invocation onto the error taxonomy.
fn classify_failure(what: &str, stderr: &str) -> StratumError {
    if stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
    {
        StratumError::NotRunning(tail(stderr, 3))
    } else {
        StratumError::ContainerError(format!("docker {} failed: {}", what, tail(stderr, 5)))
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// `docker run` arguments for a spec, excluding the leading `run` flags.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["--name".to_string(), spec.name.clone()];
    if let Some(ref network) = spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", host, container));
    }
    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(ref health) = spec.health_cmd {
        args.extend(
            [
                "--health-cmd",
                health.as_str(),
                "--health-interval",
                "1s",
                "--health-timeout",
                "2s",
                "--health-retries",
                "10",
            ]
            .map(String::from),
        );
    }
    if let Some(ref entrypoint) = spec.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

/// Parse `docker inspect` output in the `running|status|health` format.
fn parse_inspect(line: &str) -> Option<ContainerStatus> {
    let mut parts = line.trim().splitn(3, '|');
    let running = parts.next()? == "true";
    let status = parts.next()?.to_string();
    let health = parts.next().filter(|h| !h.is_empty()).map(String::from);
    Some(ContainerStatus {
        running,
        status,
        health,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        let out = self
            .output(vec![
                "info".to_string(),
                "--format".to_string(),
                "{{.ServerVersion}}".to_string(),
            ])
            .await?;
        if out.code != 0 {
            return Err(StratumError::NotRunning(tail(&out.stderr, 3)));
        }
        log::debug!("Container runtime reachable; version={}", out.stdout.trim());
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        self.remove(&spec.name).await?;
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(run_args(spec));
        let id = self.checked(args).await?.trim().to_string();
        log::info!("Started container; name={}, image={}", spec.name, spec.image);
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>> {
        let out = self
            .output(vec![
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Running}}|{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}"
                    .to_string(),
                id.to_string(),
            ])
            .await?;
        if out.code != 0 {
            if is_missing(&out.stderr) {
                return Ok(None);
            }
            return Err(classify_failure("inspect", &out.stderr));
        }
        Ok(parse_inspect(&out.stdout))
    }

    async fn logs(&self, id: &str, lines: usize) -> Result<String> {
        let out = self
            .output(vec![
                "logs".to_string(),
                "--tail".to_string(),
                lines.to_string(),
                id.to_string(),
            ])
            .await?;
        if out.code != 0 {
            return Err(classify_failure("logs", &out.stderr));
        }
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let out = self
            .output(vec![
                "rm".to_string(),
                "-f".to_string(),
                "-v".to_string(),
                id.to_string(),
            ])
            .await?;
        if out.code != 0 && !is_missing(&out.stderr) {
            return Err(classify_failure("rm", &out.stderr));
        }
        Ok(())
    }

    async fn run_once(
        &self,
        spec: &ContainerSpec,
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i32> {
        self.remove(&spec.name).await?;
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(run_args(spec));
        log::debug!("Running one-shot container; name={}, image={}", spec.name, spec.image);

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| StratumError::ContainerError("stdout not captured".to_string()))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| StratumError::ContainerError("stderr not captured".to_string()))?;

        let (out_copy, err_copy) = tokio::join!(
            tokio::io::copy(&mut child_out, &mut *stdout),
            tokio::io::copy(&mut child_err, &mut *stderr)
        );
        out_copy?;
        err_copy?;
        stdout.flush().await?;
        stderr.flush().await?;

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn signal(&self, id: &str, signal: &str) -> Result<()> {
        self.checked(vec![
            "kill".to_string(),
            "--signal".to_string(),
            signal.to_string(),
            id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.checked(vec!["restart".to_string(), id.to_string()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockRuntime;

    #[test]
    fn test_run_args_order() {
        let spec = ContainerSpec {
            network: Some("host".to_string()),
            ports: vec![(54320, 5432)],
            volumes: vec!["data:/var/lib/postgresql/data".to_string()],
            health_cmd: Some("pg_isready".to_string()),
            cmd: vec!["postgres".to_string(), "-c".to_string(), "port=54320".to_string()],
            ..ContainerSpec::new("shadow", "postgres:15").env("POSTGRES_PASSWORD", "pw")
        };
        let args = run_args(&spec);
        assert_eq!(&args[..4], &["--name", "shadow", "--network", "host"]);
        assert!(args.windows(2).any(|w| w == ["-p", "54320:5432"]));
        assert!(args.windows(2).any(|w| w == ["-e", "POSTGRES_PASSWORD=pw"]));
        assert!(args.windows(2).any(|w| w == ["--health-cmd", "pg_isready"]));
        let image_pos = args.iter().position(|a| a == "postgres:15").unwrap();
        assert_eq!(&args[image_pos + 1..], &["postgres", "-c", "port=54320"]);
    }

    #[test]
    fn test_parse_inspect() {
        assert_eq!(
            parse_inspect("true|running|healthy\n"),
            Some(ContainerStatus {
                running: true,
                status: "running".to_string(),
                health: Some("healthy".to_string()),
            })
        );
        let no_health = parse_inspect("false|exited|").unwrap();
        assert!(!no_health.running);
        assert_eq!(no_health.health, None);
        assert_eq!(parse_inspect(""), None);
    }

    #[test]
    fn test_status_health() {
        let starting = ContainerStatus {
            running: true,
            status: "running".to_string(),
            health: Some("starting".to_string()),
        };
        assert!(!starting.is_healthy());
        assert_eq!(starting.describe(), "running (starting)");
        let no_check = ContainerStatus {
            health: None,
            ..starting.clone()
        };
        assert!(no_check.is_healthy());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("run", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock."),
            StratumError::NotRunning(_)
        ));
        assert!(matches!(
            classify_failure("run", "Unable to find image"),
            StratumError::ContainerError(_)
        ));
    }

    #[test]
    fn test_env_value_last_wins() {
        let spec = ContainerSpec::new("n", "i").env("A", "1").env("A", "2");
        assert_eq!(spec.env_value("A"), Some("2"));
        assert_eq!(spec.env_value("B"), None);
    }

    #[tokio::test]
    async fn test_poll_healthy_after_starting() {
        let runtime = MockRuntime::new();
        runtime.push_health("starting");
        runtime.push_health("healthy");
        poll_healthy(&runtime, "c1", Duration::from_secs(5), Duration::from_millis(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_healthy_exited_reports_logs() {
        let runtime = MockRuntime::new();
        runtime.push_status(ContainerStatus {
            running: false,
            status: "exited".to_string(),
            health: None,
        });
        runtime.set_logs("FATAL: could not bind");
        let err = poll_healthy(&runtime, "c1", Duration::from_secs(5), Duration::from_millis(5))
            .await
            .unwrap_err();
        match err {
            StratumError::ShadowUnhealthy { status, logs } => {
                assert_eq!(status, "exited");
                assert!(logs.contains("could not bind"));
            }
            other => panic!("expected ShadowUnhealthy, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_healthy_times_out() {
        let runtime = MockRuntime::new();
        runtime.set_default_health("starting");
        let err = poll_healthy(&runtime, "c1", Duration::from_millis(30), Duration::from_millis(5))
            .await
            .unwrap_err();
        match err {
            StratumError::ShadowUnhealthy { status, .. } => assert!(status.contains("timed out")),
            other => panic!("expected ShadowUnhealthy, got {:?}", other),
        }
    }
}
