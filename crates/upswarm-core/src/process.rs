// ABOUTME: Spawns, tracks, and reaps service child processes, one pool per service name.
// ABOUTME: Exit is observed by a watcher task and reported back to the event loop.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, UpswarmError};

/// Id of one spawned process record, unique for the supervisor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Command line used to start one instance of a service.
///
/// `{service}`, `{host}` and `{port}` in any argument are substituted when
/// the process is spawned. Arguments go straight to the OS as argv, never
/// through a shell, so service names need no escaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to run. Defaults to the supervisor's own executable.
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
}

fn default_worker_args() -> Vec<String> {
    vec![
        "spawn".to_string(),
        "{service}".to_string(),
        "--supervisor".to_string(),
        "{host}:{port}".to_string(),
    ]
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
        }
    }
}

impl WorkerCommand {
    /// A command running `program` with literal `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: Some(program.into()),
            args,
        }
    }

    /// Resolve the program and substitute placeholders for `service`.
    pub fn resolve(&self, service: &str, host: &str, port: u16) -> Result<(PathBuf, Vec<String>)> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let port = port.to_string();
        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{service}", service)
                    .replace("{host}", host)
                    .replace("{port}", &port)
            })
            .collect();
        Ok((program, args))
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Notification sent by a watcher task when its child exits.
#[derive(Debug)]
pub struct ProcessExit {
    pub service: String,
    pub id: ProcessId,
    pub report: ExitReport,
}

/// A tracked child process.
#[derive(Debug)]
struct ProcessRecord {
    id: ProcessId,
    pid: Option<u32>,
    /// Dropping or firing this asks the watcher to kill the child.
    terminate: Option<oneshot::Sender<()>>,
}

impl ProcessRecord {
    /// Ask the watcher to terminate the child. The record stays in its pool
    /// until the exit is reported.
    fn terminate(&mut self) -> bool {
        match self.terminate.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn is_live(&self) -> bool {
        self.terminate.is_some()
    }
}

/// Child process pools keyed by service name.
///
/// A record enters its pool as soon as the OS process object exists and
/// leaves it only when the watcher reports the exit. The pool size is the
/// actual count used by reconciliation.
pub struct ProcessSupervisor {
    command: WorkerCommand,
    host: String,
    port: u16,
    pools: HashMap<String, Vec<ProcessRecord>>,
    exits: mpsc::UnboundedSender<ProcessExit>,
    next_id: u64,
}

impl ProcessSupervisor {
    /// Create a supervisor that reports child exits on `exits`.
    ///
    /// `host` and `port` are where spawned workers reach the supervisor.
    pub fn new(
        command: WorkerCommand,
        host: impl Into<String>,
        port: u16,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Self {
        Self {
            command,
            host: host.into(),
            port,
            pools: HashMap::new(),
            exits,
            next_id: 0,
        }
    }

    /// Start one more instance of `service`.
    ///
    /// Output lines of the child are relayed to the log with the service name
    /// attached. Must be called from within a tokio runtime.
    pub fn spawn(&mut self, service: &str) -> Result<ProcessId> {
        tracing::info!(service = %service, "Spawning");

        let (program, args) = self.command.resolve(service, &self.host, self.port)?;
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| UpswarmError::Spawn {
                service: service.to_string(),
                source,
            })?;

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            relay_output(service.to_string(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(service.to_string(), stderr);
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        watch(
            service.to_string(),
            id,
            child,
            terminate_rx,
            self.exits.clone(),
        );

        self.pools
            .entry(service.to_string())
            .or_default()
            .push(ProcessRecord {
                id,
                pid,
                terminate: Some(terminate_tx),
            });

        tracing::debug!(service = %service, pid = ?pid, id = %id, "Spawned");
        Ok(id)
    }

    /// Request termination of every instance of `service`. Returns how many
    /// termination requests were sent. No-op for an empty or unknown pool.
    pub fn kill(&mut self, service: &str) -> usize {
        tracing::info!(service = %service, "Killing");
        self.pools
            .get_mut(service)
            .map(|pool| pool.iter_mut().filter_map(|p| p.terminate().then_some(())).count())
            .unwrap_or(0)
    }

    /// Request termination of one instance of `service`, chosen uniformly at
    /// random among those not already terminating.
    pub fn stop(&mut self, service: &str) -> Option<ProcessId> {
        tracing::info!(service = %service, "Stopping");
        let record = self
            .pools
            .get_mut(service)?
            .iter_mut()
            .filter(|p| p.is_live())
            .choose(&mut rand::thread_rng())?;
        record.terminate();
        tracing::debug!(service = %service, pid = ?record.pid, id = %record.id, "Stop requested");
        Some(record.id)
    }

    /// Remove the record reported by a watcher task.
    pub fn handle_exit(&mut self, exit: &ProcessExit) {
        tracing::info!(
            service = %exit.service,
            code = ?exit.report.code,
            signal = ?exit.report.signal,
            "Exited"
        );
        if let Some(pool) = self.pools.get_mut(&exit.service) {
            pool.retain(|p| p.id != exit.id);
            if pool.is_empty() {
                self.pools.remove(&exit.service);
            }
        }
    }

    /// Request termination of every tracked process.
    pub fn kill_all(&mut self) -> usize {
        self.pools
            .values_mut()
            .flat_map(|pool| pool.iter_mut())
            .filter_map(|p| p.terminate().then_some(()))
            .count()
    }

    /// Number of tracked records for `service`, including ones asked to stop
    /// whose exit has not been reported yet.
    pub fn count(&self, service: &str) -> usize {
        self.pools.get(service).map_or(0, Vec::len)
    }

    /// Record counts per service.
    pub fn counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.as_str(), pool.len()))
    }

    /// OS pids of the tracked instances of `service`.
    pub fn pids(&self, service: &str) -> Vec<u32> {
        self.pools
            .get(service)
            .map(|pool| pool.iter().filter_map(|p| p.pid).collect())
            .unwrap_or_default()
    }
}

/// Forward each line a child writes to the supervisor's log.
///
/// Reads until EOF or an I/O error. Non-UTF-8 output is relayed lossily; the
/// pipe must stay drained or the child dies on its next write.
fn relay_output<R>(service: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches(['\r', '\n']);
                    tracing::info!(target: "upswarm::child", service = %service, "{}", text);
                }
                Err(e) => {
                    tracing::debug!(service = %service, error = %e, "Output relay stopped");
                    break;
                }
            }
        }
    });
}

/// Own the child until it exits, killing it on request, then report the exit.
fn watch(
    service: String,
    id: ProcessId,
    mut child: Child,
    terminate: oneshot::Receiver<()>,
    exits: mpsc::UnboundedSender<ProcessExit>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = terminate => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(service = %service, error = %e, "Failed to signal child");
                }
                child.wait().await
            }
        };
        let report = match status {
            Ok(status) => ExitReport::from(status),
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Failed to wait for child");
                ExitReport::default()
            }
        };
        let _ = exits.send(ProcessExit {
            service,
            id,
            report,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper(exits: mpsc::UnboundedSender<ProcessExit>) -> ProcessSupervisor {
        ProcessSupervisor::new(
            WorkerCommand::new("sleep", vec!["30".to_string()]),
            "127.0.0.1",
            8300,
            exits,
        )
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessExit>) -> ProcessExit {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for exit")
            .expect("exit channel closed")
    }

    #[test]
    fn test_default_command_substitutes_placeholders() {
        let cmd = WorkerCommand {
            program: Some(PathBuf::from("/usr/bin/upswarm")),
            ..WorkerCommand::default()
        };
        let (program, args) = cmd.resolve("mail\\sender", "127.0.0.1", 8399).unwrap();
        assert_eq!(program, PathBuf::from("/usr/bin/upswarm"));
        assert_eq!(
            args,
            vec!["spawn", "mail\\sender", "--supervisor", "127.0.0.1:8399"]
        );
    }

    #[test]
    fn test_default_program_is_current_exe() {
        let (program, _) = WorkerCommand::default()
            .resolve("worker", "127.0.0.1", 8300)
            .unwrap();
        assert_eq!(program, std::env::current_exe().unwrap());
    }

    #[tokio::test]
    async fn test_spawn_counts_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);

        procs.spawn("worker").unwrap();
        procs.spawn("worker").unwrap();
        procs.spawn("mailer").unwrap();

        assert_eq!(procs.count("worker"), 2);
        assert_eq!(procs.count("mailer"), 1);
        assert_eq!(procs.pids("worker").len(), 2);
        procs.kill_all();
    }

    #[tokio::test]
    async fn test_spawn_failure_tracks_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut procs = ProcessSupervisor::new(
            WorkerCommand::new("/nonexistent/upswarm-worker", vec![]),
            "127.0.0.1",
            8300,
            tx,
        );

        let err = procs.spawn("worker").unwrap_err();
        assert!(matches!(err, UpswarmError::Spawn { ref service, .. } if service == "worker"));
        assert_eq!(procs.count("worker"), 0);
    }

    #[tokio::test]
    async fn test_kill_terminates_every_instance() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);
        procs.spawn("worker").unwrap();
        procs.spawn("worker").unwrap();
        procs.spawn("worker").unwrap();

        assert_eq!(procs.kill("worker"), 3);
        // Termination is a request; records leave on exit.
        assert_eq!(procs.count("worker"), 3);

        for _ in 0..3 {
            let exit = next_exit(&mut rx).await;
            assert_eq!(exit.service, "worker");
            procs.handle_exit(&exit);
        }
        assert_eq!(procs.count("worker"), 0);
    }

    #[tokio::test]
    async fn test_kill_and_stop_on_empty_pool_are_noops() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);
        assert_eq!(procs.kill("worker"), 0);
        assert_eq!(procs.stop("worker"), None);
    }

    #[tokio::test]
    async fn test_stop_terminates_exactly_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);
        procs.spawn("worker").unwrap();
        procs.spawn("worker").unwrap();

        let stopped = procs.stop("worker").unwrap();
        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.id, stopped);
        procs.handle_exit(&exit);
        assert_eq!(procs.count("worker"), 1);

        // Nothing else exits.
        let more = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(more.is_err());
        procs.kill_all();
    }

    #[tokio::test]
    async fn test_stop_skips_instances_already_terminating() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);
        let first = procs.spawn("worker").unwrap();
        let second = procs.spawn("worker").unwrap();

        let a = procs.stop("worker").unwrap();
        let b = procs.stop("worker").unwrap();
        let mut stopped = vec![a, b];
        stopped.sort();
        assert_eq!(stopped, vec![first, second]);
        assert_eq!(procs.stop("worker"), None);
    }

    #[tokio::test]
    async fn test_natural_exit_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut procs = ProcessSupervisor::new(
            WorkerCommand::new("sh", vec!["-c".to_string(), "exit 3".to_string()]),
            "127.0.0.1",
            8300,
            tx,
        );
        procs.spawn("flaky").unwrap();

        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.report.code, Some(3));
        assert_eq!(exit.report.signal, None);
        procs.handle_exit(&exit);
        assert_eq!(procs.count("flaky"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_binary_output_does_not_break_the_pipe() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut procs = ProcessSupervisor::new(
            WorkerCommand::new(
                "sh",
                vec![
                    "-c".to_string(),
                    "printf '\\377\\n'; sleep 0.3; echo after; sleep 30".to_string(),
                ],
            ),
            "127.0.0.1",
            8300,
            tx,
        );
        procs.spawn("binary").unwrap();

        // Still running well after the second write.
        let early = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(early.is_err(), "child exited unexpectedly: {early:?}");
        assert_eq!(procs.count("binary"), 1);

        procs.kill_all();
        let exit = next_exit(&mut rx).await;
        procs.handle_exit(&exit);
        assert_eq!(procs.count("binary"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_killed_child_reports_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut procs = sleeper(tx);
        procs.spawn("worker").unwrap();
        procs.kill("worker");

        let exit = next_exit(&mut rx).await;
        assert_eq!(exit.report.code, None);
        assert!(exit.report.signal.is_some());
    }
}
