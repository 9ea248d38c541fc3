// ABOUTME: Worker runtime: the Service trait, built-in services, and the run loop for one instance.
// ABOUTME: A spawned worker connects, identifies, and answers messages until the supervisor hangs up.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ServiceClient;
use crate::error::Result;
use crate::message::{make_reply, Message};

/// Business logic of one service. Opaque to the supervisor.
#[async_trait]
pub trait Service: Send + Sync {
    /// Handle a message delivered to this instance.
    ///
    /// A returned message without a receipt is sent back to the sender of
    /// `message`; it is dropped when the sender is unknown.
    async fn handle(&self, message: Message) -> Option<Message>;
}

/// Replies to every message with the same payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn handle(&self, message: Message) -> Option<Message> {
        Some(make_reply(&message, message.payload.clone()))
    }
}

/// Logs every message and never replies.
#[derive(Debug, Clone)]
pub struct LoggingService {
    name: String,
}

impl LoggingService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Service for LoggingService {
    async fn handle(&self, message: Message) -> Option<Message> {
        tracing::info!(
            service = %self.name,
            kind = %message.payload.kind(),
            sender = ?message.sender(),
            "Received"
        );
        None
    }
}

/// Services a worker binary knows how to run, by name.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `echo` service.
    pub fn builtin() -> Self {
        Self::new().with("echo", EchoService)
    }

    pub fn with(mut self, name: impl Into<String>, service: impl Service + 'static) -> Self {
        self.services.insert(name.into(), Arc::new(service));
        self
    }

    /// The service registered as `name`, or a logging service for unknown names.
    pub fn resolve(&self, name: &str) -> Arc<dyn Service> {
        match self.services.get(name) {
            Some(service) => Arc::clone(service),
            None => {
                tracing::debug!(service = %name, "No registered service, logging messages only");
                Arc::new(LoggingService::new(name))
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Options for running one service instance
pub struct WorkerOptions {
    pub service: String,
    /// Supervisor address, e.g. `127.0.0.1:8300`
    pub supervisor: String,
    pub catalog: ServiceCatalog,
}

/// Run one instance of `options.service` against the supervisor.
///
/// Returns once the supervisor closes the connection.
pub async fn run_worker(options: WorkerOptions) -> Result<()> {
    let service = options.catalog.resolve(&options.service);
    let mut client = ServiceClient::connect(&options.supervisor).await?;
    let id = client.identify(&options.service).await?;
    tracing::info!(service = %options.service, id = %id, "Connected to supervisor");

    serve(&mut client, service.as_ref()).await?;

    tracing::info!(service = %options.service, "Supervisor closed connection");
    Ok(())
}

/// Answer messages on `client` with `service` until the connection ends.
pub async fn serve(client: &mut ServiceClient, service: &dyn Service) -> Result<()> {
    while let Some(message) = client.recv().await? {
        let sender = message.sender().map(str::to_string);
        let Some(mut reply) = service.handle(message).await else {
            continue;
        };
        if reply.receipt().is_none() {
            match &sender {
                Some(sender) => reply.receipt = Some(sender.clone()),
                None => {
                    tracing::debug!("Dropping reply to unknown sender");
                    continue;
                }
            }
        }
        client.send(reply).await?;
    }
    Ok(())
}
