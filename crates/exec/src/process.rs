//! Child-process transport: `sh -c` on this machine or `ssh` to a remote host.

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use syspilot_config::RemoteConfig;

use crate::transport::{ExecutionId, PollStatus, RawOutput, RemoteTransport, Session, TransportError};

/// ssh reserves this exit status for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    Local,
    Ssh { target: String, options: Vec<String> },
}

impl Launcher {
    fn target(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Ssh { target, .. } => target,
        }
    }

    fn command(&self, command: &str) -> Command {
        match self {
            Self::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Self::Ssh { target, options } => {
                let mut cmd = Command::new("ssh");
                cmd.args(options).arg(target).arg("--").arg(command);
                cmd
            }
        }
    }
}

struct Running {
    handle: JoinHandle<std::io::Result<Option<Output>>>,
    // Dropping or firing this kills the child.
    kill: oneshot::Sender<()>,
}

pub struct ProcessTransport {
    launcher: Launcher,
    running: Mutex<HashMap<ExecutionId, Running>>,
}

impl ProcessTransport {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        let launcher = if config.is_local() {
            Launcher::Local
        } else {
            Launcher::Ssh {
                target: config.target.clone(),
                options: config.ssh_options.clone(),
            }
        };
        Self::new(launcher)
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ExecutionId, Running>>, TransportError> {
        self.running
            .lock()
            .map_err(|_| TransportError::Rejected("process table lock poisoned".to_string()))
    }

    fn finish(&self, output: Output) -> Result<PollStatus, TransportError> {
        let exit_status = output.status.code().unwrap_or(-1);
        if matches!(self.launcher, Launcher::Ssh { .. }) && exit_status == SSH_CONNECTION_FAILURE {
            return Err(TransportError::NotDelivered(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(PollStatus::Finished(RawOutput {
            exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
        }))
    }
}

#[async_trait]
impl RemoteTransport for ProcessTransport {
    async fn open(&self) -> Result<Session, TransportError> {
        Ok(Session::new(self.launcher.target()))
    }

    async fn submit(&self, _session: &Session, command: &str) -> Result<ExecutionId, TransportError> {
        let mut cmd = self.launcher.command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            TransportError::Unreachable(format!("failed to launch for {}: {e}", self.launcher.target()))
        })?;

        let (kill, kill_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            tokio::select! {
                out = child.wait_with_output() => out.map(Some),
                // The child is dropped here, and kill_on_drop reaps it.
                _ = kill_rx => Ok(None),
            }
        });

        let id = ExecutionId(Uuid::new_v4().to_string());
        debug!(execution = %id, target = self.launcher.target(), "process submitted");
        self.lock()?.insert(id.clone(), Running { handle, kill });
        Ok(id)
    }

    async fn poll(
        &self,
        _session: &Session,
        execution: &ExecutionId,
    ) -> Result<PollStatus, TransportError> {
        let running = {
            let mut table = self.lock()?;
            match table.get(execution) {
                None => return Err(TransportError::UnknownExecution(execution.clone())),
                Some(r) if !r.handle.is_finished() => return Ok(PollStatus::Pending),
                Some(_) => table.remove(execution),
            }
        };
        let Some(running) = running else {
            return Err(TransportError::UnknownExecution(execution.clone()));
        };

        match running.handle.await {
            Ok(Ok(Some(output))) => self.finish(output),
            Ok(Ok(None)) => Err(TransportError::Rejected(format!("execution {execution} was killed"))),
            Ok(Err(e)) => Err(TransportError::Unreachable(format!("waiting on {execution}: {e}"))),
            Err(e) => Err(TransportError::Rejected(format!("execution {execution} task failed: {e}"))),
        }
    }

    async fn cancel(&self, _session: &Session, execution: &ExecutionId) -> Result<(), TransportError> {
        let running = self.lock()?.remove(execution);
        if let Some(running) = running {
            let _ = running.kill.send(());
            debug!(execution = %execution, "process cancelled");
        }
        Ok(())
    }

    async fn close(&self, _session: &Session) -> Result<(), TransportError> {
        let drained: Vec<Running> = self.lock()?.drain().map(|(_, r)| r).collect();
        for running in drained {
            let _ = running.kill.send(());
        }
        Ok(())
    }
}
