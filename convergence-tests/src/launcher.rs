use core::time::Duration;
use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::config::ReplicaCommandConfig;
use crate::error::EnvironmentError;
use crate::template::{expand, expand_all, TemplateVars};

/// How a replica process ended when it was released.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Killed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// Everything a launcher needs to know about the replica it starts.
#[derive(Clone, Copy, Debug)]
pub struct LaunchContext<'a> {
    pub node_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub data_dir: &'a Utf8Path,
    pub log_file: &'a Utf8Path,
}

impl LaunchContext<'_> {
    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars::new()
            .with("nodeId", self.node_id)
            .with("host", self.host)
            .with("port", self.port.to_string())
            .with("dataDir", self.data_dir.as_str())
            .with("logFile", self.log_file.as_str())
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        ctx: &LaunchContext<'_>,
    ) -> Result<Box<dyn ReplicaProcess>, EnvironmentError>;
}

/// A running replica owned by a [`ReplicaHandle`](crate::environment::ReplicaHandle).
#[async_trait]
pub trait ReplicaProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check for an exit that already happened.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Asks the replica to stop and escalates once `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration) -> io::Result<Termination>;

    /// Last-resort synchronous kill, used when there is no runtime to await on.
    fn kill_now(&mut self);
}

/// Launches replicas as child processes from a command template.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    binary: Utf8PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    pub fn new(
        binary: Utf8PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self { binary, args, env }
    }

    pub fn from_config(config: &ReplicaCommandConfig) -> Self {
        Self::new(
            config.binary.clone(),
            config.args.clone(),
            config.env.clone(),
        )
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        ctx: &LaunchContext<'_>,
    ) -> Result<Box<dyn ReplicaProcess>, EnvironmentError> {
        let vars = ctx.template_vars();
        let args = expand_all(&self.args, &vars)?;

        let mut env = Vec::with_capacity(self.env.len());
        for (name, value) in &self.env {
            env.push((name.as_str(), expand(value, &vars)?));
        }

        let mut command_line = format!("Command: '{}", self.binary);
        for arg in &args {
            command_line.reserve(arg.len() + 1);
            command_line.push(' ');
            command_line.push_str(arg);
        }
        command_line.push('\'');

        tracing::debug!(node = ctx.node_id, %command_line, "spawning replica");

        let io_err = |source| EnvironmentError::Io {
            path: ctx.log_file.to_owned(),
            source,
        };

        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.log_file)
            .await
            .map_err(io_err)?;
        log_file
            .write_all(format!("{command_line}\n").as_bytes())
            .await
            .map_err(io_err)?;

        let stdout = log_file.into_std().await;
        let stderr = stdout.try_clone().map_err(io_err)?;

        let mut command = Command::new(&self.binary);
        let _ignored = command
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| EnvironmentError::Spawn {
            node: ctx.node_id.to_owned(),
            source,
        })?;

        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Debug)]
struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ReplicaProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProcessExit {
                code: status.code(),
            }))
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<Termination> {
        if self.child.try_wait()?.is_some() {
            return Ok(Termination::AlreadyExited);
        }

        if let Some(child_id) = self.child.id() {
            let pid = i32::try_from(child_id)
                .map_err(|_| io::Error::other(format!("pid {child_id} out of range")))?;

            match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => return Err(errno.into()),
            }
        }

        if let Ok(status) = timeout(grace, self.child.wait()).await {
            let _status = status?;
            return Ok(Termination::Graceful);
        }

        self.child.kill().await?;

        Ok(Termination::Killed)
    }

    fn kill_now(&mut self) {
        let _ignored = self.child.start_kill();
    }
}
