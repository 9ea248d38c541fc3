// ABOUTME: Message router: runs supervisor-directed instructions and forwards addressed messages.
// ABOUTME: Addressing is by instance id (all-hex receipt) or by service name (random instance).

use crate::message::{is_id_like, make_reply, Message, Payload};
use crate::process::ProcessSupervisor;
use crate::registry::{ConnectionId, Registry};

/// Outcome of a delivery attempt. Delivery is best effort and at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(ConnectionId),
    NoTarget,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }
}

/// Routes messages using the supervisor's registry and process pools.
///
/// Borrowed for the duration of one dispatch; the supervisor keeps ownership
/// of both collaborators.
pub struct Router<'a> {
    registry: &'a mut Registry,
    processes: &'a mut ProcessSupervisor,
}

impl<'a> Router<'a> {
    pub fn new(registry: &'a mut Registry, processes: &'a mut ProcessSupervisor) -> Self {
        Self {
            registry,
            processes,
        }
    }

    /// Forward `message` to its receipt, or evaluate it when it has none.
    pub fn dispatch(&mut self, message: Message, source: ConnectionId) {
        if let Some(receipt) = message.receipt().map(str::to_string) {
            self.deliver(&message, &receipt);
            return;
        }
        self.evaluate(message, source);
    }

    /// Execute a message addressed to the supervisor.
    pub fn evaluate(&mut self, message: Message, source: ConnectionId) {
        match &message.payload {
            Payload::SpawnService { service } => {
                if let Err(e) = self.processes.spawn(service) {
                    tracing::error!(service = %service, error = %e, "Spawn failed");
                }
            }
            Payload::KillService { service } => {
                self.kill(&message, service, source);
            }
            Payload::Identify {
                service_name,
                service_id,
            } => {
                if self.registry.identify(source, service_name, service_id) {
                    tracing::info!(
                        conn = %source,
                        service = %service_name,
                        id = %service_id,
                        "Identified"
                    );
                } else {
                    tracing::debug!(conn = %source, "Ignoring malformed identify");
                }
            }
            other => {
                tracing::warn!(
                    conn = %source,
                    kind = %other.kind(),
                    "Unknown instruction in message to supervisor"
                );
            }
        }
    }

    /// Terminate every instance of `service` and confirm to the requester.
    ///
    /// The confirmation is routed to the requester's sender id when it has
    /// one, and written straight back on the source connection otherwise.
    fn kill(&mut self, request: &Message, service: &str, source: ConnectionId) {
        let terminated = self.processes.kill(service);
        tracing::debug!(service = %service, terminated, "Kill requested");

        let reply = make_reply(
            request,
            Payload::Text {
                text: format!("'{service}' killed successfully."),
            },
        );
        match reply.receipt() {
            Some(receipt) => {
                self.deliver(&reply, receipt);
            }
            None => self.reply_direct(&reply, source),
        }
    }

    fn reply_direct(&self, reply: &Message, source: ConnectionId) {
        let Some(conn) = self.registry.get(source) else {
            tracing::debug!(conn = %source, "Requester gone before reply");
            return;
        };
        if let Err(e) = conn.write(reply) {
            tracing::warn!(conn = %source, error = %e, "Failed to encode reply");
        }
    }

    /// Deliver `message` to the connection `receipt` resolves to.
    ///
    /// An all-hex receipt is looked up as an instance id across every bucket,
    /// anything else as a service name with a uniformly random instance.
    /// Unresolved receipts drop the message.
    pub fn deliver(&self, message: &Message, receipt: &str) -> Delivery {
        let target = if is_id_like(receipt) {
            self.registry.resolve_by_id(receipt)
        } else {
            self.registry.resolve_by_name(receipt)
        };

        let Some(conn) = target else {
            tracing::debug!(receipt = %receipt, "No connection for receipt, dropping");
            return Delivery::NoTarget;
        };

        match conn.write(message) {
            Ok(true) => Delivery::Delivered(conn.id()),
            Ok(false) => {
                tracing::debug!(receipt = %receipt, conn = %conn.id(), "Connection closing, dropping");
                Delivery::NoTarget
            }
            Err(e) => {
                tracing::warn!(receipt = %receipt, error = %e, "Failed to encode message");
                Delivery::NoTarget
            }
        }
    }
}
