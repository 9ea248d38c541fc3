// ABOUTME: Supervisor composition root: owns the socket, registry, process pools, and topology.
// ABOUTME: A single event loop applies every state change, so no locks guard that state.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::error::{Result, UpswarmError};
use crate::message::{Message, Payload};
use crate::process::{ProcessExit, ProcessId, ProcessSupervisor};
use crate::registry::{ConnectionId, Registry, UNIDENTIFIED};
use crate::router::Router;
use crate::topology::{Action, FileTopologySource, Reconciler, Topology, TopologyEvent};
use crate::transport::{start_connection, ConnectionEvent};

const COMMAND_BUFFER: usize = 32;

/// Requests the event loop accepts from outside.
#[derive(Debug)]
pub enum SupervisorCommand {
    Spawn(String),
    Stop(String),
    Status(oneshot::Sender<StatusInfo>),
    Shutdown,
}

/// Snapshot of supervisor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub topology: Topology,
    /// Tracked process records per service.
    pub processes: BTreeMap<String, usize>,
    /// OS pids of the tracked processes per service.
    pub pids: BTreeMap<String, Vec<u32>>,
    /// Identified connections per service.
    pub connections: BTreeMap<String, usize>,
    pub unidentified: usize,
}

/// Cloneable handle for talking to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    topology: mpsc::Sender<TopologyEvent>,
}

impl SupervisorHandle {
    async fn send(&self, command: SupervisorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| UpswarmError::SupervisorUnavailable)
    }

    /// Feed a topology source event, as the file watcher does.
    pub async fn topology_event(&self, event: TopologyEvent) -> Result<()> {
        self.topology
            .send(event)
            .await
            .map_err(|_| UpswarmError::SupervisorUnavailable)
    }

    /// Replace the desired topology and reconcile immediately.
    pub async fn update_topology(&self, topology: Topology) -> Result<()> {
        self.topology_event(TopologyEvent::Update(topology)).await
    }

    pub async fn spawn(&self, service: impl Into<String>) -> Result<()> {
        self.send(SupervisorCommand::Spawn(service.into())).await
    }

    pub async fn stop(&self, service: impl Into<String>) -> Result<()> {
        self.send(SupervisorCommand::Stop(service.into())).await
    }

    pub async fn status(&self) -> Result<StatusInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Status(reply)).await?;
        rx.await.map_err(|_| UpswarmError::SupervisorUnavailable)
    }

    /// Terminate every child and make `run` return.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SupervisorCommand::Shutdown).await
    }
}

/// The supervisor daemon.
pub struct Supervisor {
    config: SupervisorConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Registry,
    processes: ProcessSupervisor,
    reconciler: Reconciler,
    next_conn: u64,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
    command_tx: mpsc::Sender<SupervisorCommand>,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    topology_tx: mpsc::Sender<TopologyEvent>,
    topology_rx: mpsc::Receiver<TopologyEvent>,
}

impl Supervisor {
    /// Bind the listening socket. Nothing runs until [`Supervisor::run`].
    pub async fn bind(config: SupervisorConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (topology_tx, topology_rx) = mpsc::channel(COMMAND_BUFFER);

        // Workers dial the bound port, which differs from the configured one for port 0.
        let processes = ProcessSupervisor::new(
            config.worker.clone(),
            config.host.clone(),
            local_addr.port(),
            exit_tx,
        );
        let reconciler = Reconciler::new(config.spawn_stagger());

        Ok(Self {
            config,
            listener,
            local_addr,
            registry: Registry::new(),
            processes,
            reconciler,
            next_conn: 0,
            conn_tx,
            conn_rx,
            exit_rx,
            command_tx,
            command_rx,
            topology_tx,
            topology_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.command_tx.clone(),
            topology: self.topology_tx.clone(),
        }
    }

    /// Run the event loop until Ctrl-C, SIGTERM, or a shutdown request.
    ///
    /// Starts the topology file watcher when one is configured and arms the
    /// periodic reconciliation timer after the initial delay.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr, "Supervisor listening");

        if let Some(path) = self.config.topology_path_expanded() {
            let source = FileTopologySource::new(path, self.config.topology_poll());
            tokio::spawn(source.run(self.topology_tx.clone()));
        }

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.reconcile_initial_delay(),
            self.config.reconcile_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                Some(event) = self.conn_rx.recv() => self.on_connection_event(event),
                Some(exit) = self.exit_rx.recv() => self.processes.handle_exit(&exit),
                Some(event) = self.topology_rx.recv() => self.on_topology_event(event),
                Some(command) = self.command_rx.recv() => {
                    if !self.on_command(command) {
                        break;
                    }
                }
                _ = ticker.tick() => self.reconcile(),
                _ = &mut shutdown => break,
            }
        }

        let terminated = self.processes.kill_all();
        tracing::info!(terminated, "Supervisor stopped");
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let conn = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let handle = start_connection(conn, stream, self.conn_tx.clone());
        self.registry.register_unidentified(handle);
        tracing::debug!(conn = %conn, peer = %peer, "Accepted");
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Received { conn, mut message } => {
                if message.sender().is_none() {
                    if let Some(id) = self.registry.instance_id(conn) {
                        message.sender = Some(id.to_string());
                    }
                }
                self.router().dispatch(message, conn);
            }
            ConnectionEvent::Closed { conn } => {
                self.registry.remove(conn);
                tracing::debug!(conn = %conn, "Closed");
            }
        }
    }

    fn on_topology_event(&mut self, event: TopologyEvent) {
        match event {
            TopologyEvent::Info(message) => tracing::info!("{}", message),
            TopologyEvent::Error(message) => tracing::error!("{}", message),
            TopologyEvent::Update(topology) => {
                self.reconciler.replace(topology);
                self.reconcile();
            }
        }
    }

    /// Returns false when the loop should stop.
    fn on_command(&mut self, command: SupervisorCommand) -> bool {
        match command {
            SupervisorCommand::Spawn(service) => {
                let _ = self.spawn(&service);
            }
            SupervisorCommand::Stop(service) => {
                self.stop(&service);
            }
            SupervisorCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            SupervisorCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    /// Run one reconciliation pass, scheduling each correction on a timer.
    fn reconcile(&mut self) {
        let processes = &self.processes;
        let plan = self.reconciler.plan(|service| processes.count(service));
        for step in plan {
            let commands = self.command_tx.clone();
            let command = match step.action {
                Action::Spawn => SupervisorCommand::Spawn(step.service),
                Action::Stop => SupervisorCommand::Stop(step.service),
            };
            tokio::spawn(async move {
                tokio::time::sleep(step.delay).await;
                let _ = commands.send(command).await;
            });
        }
    }

    fn router(&mut self) -> Router<'_> {
        Router::new(&mut self.registry, &mut self.processes)
    }

    /// Start one instance of `service`. Failures are logged and returned.
    pub fn spawn(&mut self, service: &str) -> Result<ProcessId> {
        self.processes.spawn(service).inspect_err(|e| {
            tracing::error!(service = %service, error = %e, "Spawn failed");
        })
    }

    /// Terminate one random instance of `service`.
    pub fn stop(&mut self, service: &str) -> Option<ProcessId> {
        self.processes.stop(service)
    }

    /// Execute a `KillService` message as if `source` had sent it.
    /// Any other payload is logged and ignored.
    pub fn kill(&mut self, message: Message, source: ConnectionId) {
        if !matches!(message.payload, Payload::KillService { .. }) {
            tracing::warn!(
                conn = %source,
                kind = %message.payload.kind(),
                "Invalid KillService instruction received"
            );
            return;
        }
        self.router().evaluate(message, source);
    }

    /// Identify connection `conn` as `(service_name, service_id)`.
    pub fn identify(&mut self, conn: ConnectionId, service_name: &str, service_id: &str) -> bool {
        self.registry.identify(conn, service_name, service_id)
    }

    pub fn status(&self) -> StatusInfo {
        StatusInfo {
            topology: self.reconciler.topology().clone(),
            processes: self
                .processes
                .counts()
                .map(|(name, count)| (name.to_string(), count))
                .collect(),
            pids: self
                .processes
                .counts()
                .map(|(name, _)| (name.to_string(), self.processes.pids(name)))
                .collect(),
            connections: self
                .registry
                .service_counts()
                .map(|(name, count)| (name.to_string(), count))
                .collect(),
            unidentified: self.registry.count(UNIDENTIFIED),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM. Pends forever if no handler can be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
