//! Replica lifecycle: port and directory allocation, launch and teardown.

use core::fmt;
use core::time::Duration;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::fs::{create_dir, create_dir_all, remove_dir_all};
use tokio::net::TcpListener;
use tokio::process::Command;
use url::Url;

use crate::config::ReplicaSpec;
use crate::error::EnvironmentError;
use crate::launcher::{LaunchContext, Launcher, ProcessExit, ReplicaProcess, Termination};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicaState {
    NotStarted,
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl ReplicaState {
    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (
                    Self::NotStarted | Self::Starting | Self::Ready,
                    Self::Stopped | Self::Failed
                )
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        })
    }
}

/// One replica under test and everything allocated to it.
pub struct ReplicaHandle {
    node_id: String,
    host: String,
    port: u16,
    data_dir: Utf8PathBuf,
    log_file: Utf8PathBuf,
    process: Option<Box<dyn ReplicaProcess>>,
    state: ReplicaState,
}

impl fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("node_id", &self.node_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("log_file", &self.log_file)
            .field("pid", &self.pid())
            .field("state", &self.state)
            .finish()
    }
}

impl ReplicaHandle {
    fn new(
        node_id: String,
        host: String,
        port: u16,
        data_dir: Utf8PathBuf,
        log_file: Utf8PathBuf,
    ) -> Self {
        Self {
            node_id,
            host,
            port,
            data_dir,
            log_file,
            process: None,
            state: ReplicaState::NotStarted,
        }
    }

    /// A handle for a replica someone else started, already past launch.
    #[cfg(test)]
    pub(crate) fn attached(node_id: &str, host: &str, port: u16) -> Self {
        let mut handle = Self::new(
            node_id.to_owned(),
            host.to_owned(),
            port,
            Utf8PathBuf::new(),
            Utf8PathBuf::new(),
        );
        handle.state = ReplicaState::Starting;
        handle
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn log_file(&self) -> &Utf8Path {
        &self.log_file
    }

    pub const fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.id())
    }

    /// The address other replicas use to reach this one.
    pub fn peer_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}/", self.peer_address()))
    }

    pub fn mark_ready(&mut self) -> Result<(), EnvironmentError> {
        self.transition(ReplicaState::Ready)
    }

    pub fn mark_failed(&mut self) -> Result<(), EnvironmentError> {
        if self.state == ReplicaState::Failed {
            return Ok(());
        }

        self.transition(ReplicaState::Failed)
    }

    fn transition(&mut self, next: ReplicaState) -> Result<(), EnvironmentError> {
        if !self.state.can_become(next) {
            return Err(EnvironmentError::InvalidTransition {
                node: self.node_id.clone(),
                from: self.state,
                to: next,
            });
        }

        tracing::debug!(node = %self.node_id, from = %self.state, to = %next, "replica state");
        self.state = next;

        Ok(())
    }

    /// Reports an exit that already happened without waiting for one.
    pub fn exited(&mut self) -> Option<ProcessExit> {
        let process = self.process.as_mut()?;

        match process.try_wait() {
            Ok(exit) => exit,
            Err(err) => {
                tracing::warn!(node = %self.node_id, %err, "failed to poll replica process");
                None
            }
        }
    }

    pub async fn launch(&mut self, launcher: &dyn Launcher) -> Result<(), EnvironmentError> {
        self.transition(ReplicaState::Starting)?;

        let ctx = LaunchContext {
            node_id: &self.node_id,
            host: &self.host,
            port: self.port,
            data_dir: &self.data_dir,
            log_file: &self.log_file,
        };

        let launched = launcher.launch(&ctx).await;

        match launched {
            Ok(process) => {
                tracing::info!(
                    node = %self.node_id,
                    port = self.port,
                    pid = ?process.id(),
                    "launched replica"
                );
                self.process = Some(process);
                Ok(())
            }
            Err(err) => {
                self.state = ReplicaState::Failed;
                Err(err)
            }
        }
    }

    /// Terminates the process if one is running. The terminal state is kept
    /// when the replica already failed.
    ///
    /// If graceful termination fails the process is killed outright, so the
    /// handle never holds a process after this returns.
    pub async fn stop(&mut self, grace: Duration) -> io::Result<Option<Termination>> {
        let termination = match self.process.as_mut() {
            Some(process) => match process.terminate(grace).await {
                Ok(termination) => Some(termination),
                Err(err) => {
                    process.kill_now();
                    self.process = None;
                    if !self.state.is_terminal() {
                        self.state = ReplicaState::Failed;
                    }

                    return Err(err);
                }
            },
            None => None,
        };

        self.process = None;

        if !self.state.is_terminal() {
            self.state = ReplicaState::Stopped;
        }

        Ok(termination)
    }
}

/// Where one environment puts its files. `data_dir` is owned by the
/// environment and removed on release; `logs_dir` is kept.
#[derive(Clone, Debug)]
pub struct EnvironmentConfig {
    pub host: String,
    pub base_port: Option<u16>,
    pub data_dir: Utf8PathBuf,
    pub logs_dir: Utf8PathBuf,
    pub shutdown_grace: Duration,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaTermination {
    pub node_id: String,
    pub termination: Termination,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub terminated: Vec<ReplicaTermination>,
    pub removed: Vec<Utf8PathBuf>,
    pub errors: Vec<String>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A set of replicas that share one teardown.
///
/// [`Environment::release`] must be awaited on every exit path. If the value
/// is dropped without it, live processes are killed and the data directory
/// is removed synchronously.
pub struct Environment {
    config: EnvironmentConfig,
    launcher: Arc<dyn Launcher>,
    handles: Vec<ReplicaHandle>,
    released: bool,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("handles", &self.handles)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Allocates a distinct port and data directory for every spec.
    pub async fn acquire(
        config: EnvironmentConfig,
        specs: &[ReplicaSpec],
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, EnvironmentError> {
        let mut seen = BTreeSet::new();
        for spec in specs {
            if !seen.insert(spec.node_id.as_str()) {
                return Err(EnvironmentError::DuplicateNode(spec.node_id.clone()));
            }
        }

        let ports = allocate_ports(&config.host, config.base_port, specs).await?;

        create_dir_all(&config.logs_dir)
            .await
            .map_err(|source| EnvironmentError::Io {
                path: config.logs_dir.clone(),
                source,
            })?;

        if let Some(parent) = config.data_dir.parent() {
            create_dir_all(parent)
                .await
                .map_err(|source| EnvironmentError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
        }

        create_owned_dir(&config.data_dir).await?;

        let mut environment = Self {
            config,
            launcher,
            handles: Vec::with_capacity(specs.len()),
            released: false,
        };

        for (spec, port) in specs.iter().zip(ports) {
            let data_dir = environment.config.data_dir.join(&spec.node_id);
            let log_file = environment
                .config
                .logs_dir
                .join(format!("{}.log", spec.node_id));

            // Dropping the partial environment removes what was created so far.
            create_owned_dir(&data_dir).await?;

            environment.handles.push(ReplicaHandle::new(
                spec.node_id.clone(),
                environment.config.host.clone(),
                port,
                data_dir,
                log_file,
            ));
        }

        tracing::info!(
            replicas = environment.handles.len(),
            data_dir = %environment.config.data_dir,
            "acquired environment"
        );

        Ok(environment)
    }

    pub fn handles(&self) -> &[ReplicaHandle] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [ReplicaHandle] {
        &mut self.handles
    }

    pub fn handle(&self, node_id: &str) -> Option<&ReplicaHandle> {
        self.handles.iter().find(|handle| handle.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.handles.iter().map(ReplicaHandle::node_id).collect()
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.config.data_dir
    }

    pub fn logs_dir(&self) -> &Utf8Path {
        &self.config.logs_dir
    }

    /// Starts every replica concurrently. Replicas that did start stay
    /// attached even when another one failed, so release still reaches them.
    pub async fn launch_all(&mut self) -> Result<(), EnvironmentError> {
        let launcher = Arc::clone(&self.launcher);

        let results = join_all(
            self.handles
                .iter_mut()
                .map(|handle| handle.launch(launcher.as_ref())),
        )
        .await;

        results.into_iter().collect()
    }

    /// Terminates all processes, then removes the data directory.
    ///
    /// Runs at most once; later calls return an empty report.
    pub async fn release(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        if self.released {
            return report;
        }
        self.released = true;

        let grace = self.config.shutdown_grace;

        let results = join_all(self.handles.iter_mut().map(|handle| async move {
            let result = handle.stop(grace).await;
            (handle.node_id.clone(), result)
        }))
        .await;

        for (node_id, result) in results {
            match result {
                Ok(Some(termination)) => {
                    tracing::debug!(node = %node_id, ?termination, "stopped replica");
                    report.terminated.push(ReplicaTermination {
                        node_id,
                        termination,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(node = %node_id, %err, "failed to stop replica");
                    report
                        .errors
                        .push(format!("failed to stop replica '{node_id}': {err}"));
                }
            }
        }

        match remove_dir_all(&self.config.data_dir).await {
            Ok(()) => report.removed.push(self.config.data_dir.clone()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.config.data_dir, %err, "failed to remove data directory");
                report.errors.push(format!(
                    "failed to remove {}: {err}",
                    self.config.data_dir
                ));
            }
        }

        tracing::info!(
            terminated = report.terminated.len(),
            errors = report.errors.len(),
            "released environment"
        );

        report
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        tracing::warn!(
            data_dir = %self.config.data_dir,
            "environment dropped without release, killing replicas"
        );

        for handle in &mut self.handles {
            if let Some(process) = handle.process.as_mut() {
                process.kill_now();
            }
        }

        if let Err(err) = std::fs::remove_dir_all(&self.config.data_dir) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.config.data_dir, %err, "failed to remove data directory");
            }
        }
    }
}

async fn create_owned_dir(path: &Utf8Path) -> Result<(), EnvironmentError> {
    match create_dir(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            Err(EnvironmentError::DataDirExists(path.to_owned()))
        }
        Err(source) => Err(EnvironmentError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Explicit port first, then `base_port + index`, then an OS-chosen one.
async fn allocate_ports(
    host: &str,
    base_port: Option<u16>,
    specs: &[ReplicaSpec],
) -> Result<Vec<u16>, EnvironmentError> {
    let mut assigned: Vec<(u16, &str)> = Vec::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        let port = match (spec.port, base_port) {
            (Some(port), _) => port,
            (None, Some(base)) => u16::try_from(index)
                .ok()
                .and_then(|offset| base.checked_add(offset))
                .ok_or(EnvironmentError::PortRange {
                    base,
                    count: specs.len(),
                })?,
            (None, None) => ephemeral_port(host).await?,
        };

        if let Some((_, first)) = assigned.iter().find(|(taken, _)| *taken == port) {
            return Err(EnvironmentError::DuplicatePort {
                port,
                first: (*first).to_owned(),
                second: spec.node_id.clone(),
            });
        }

        ensure_free(host, port).await?;

        assigned.push((port, &spec.node_id));
    }

    Ok(assigned.into_iter().map(|(port, _)| port).collect())
}

async fn ephemeral_port(host: &str) -> Result<u16, EnvironmentError> {
    let bind_err = |source| EnvironmentError::Bind {
        addr: format!("{host}:0"),
        source,
    };

    let listener = TcpListener::bind((host, 0)).await.map_err(bind_err)?;
    let port = listener.local_addr().map_err(bind_err)?.port();

    Ok(port)
}

async fn ensure_free(host: &str, port: u16) -> Result<(), EnvironmentError> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Err(EnvironmentError::PortInUse {
            port,
            occupant: port_occupant(port).await,
        }),
        Err(source) => Err(EnvironmentError::Bind {
            addr: format!("{host}:{port}"),
            source,
        }),
    }
}

/// Best effort: asks `lsof` who is listening on `port`.
async fn port_occupant(port: u16) -> Option<String> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fpc"])
        .output()
        .await
        .ok()?;

    parse_lsof(&String::from_utf8_lossy(&output.stdout))
}

fn parse_lsof(output: &str) -> Option<String> {
    let mut pid = None;
    let mut command = None;

    for line in output.lines() {
        if let Some(value) = line.strip_prefix('p') {
            pid = pid.or(Some(value));
        } else if let Some(value) = line.strip_prefix('c') {
            command = command.or(Some(value));
        }
    }

    match (pid?, command) {
        (pid, Some(command)) => Some(format!("pid {pid} ({command})")),
        (pid, None) => Some(format!("pid {pid}")),
    }
}
