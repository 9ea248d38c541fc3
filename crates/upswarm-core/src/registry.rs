// ABOUTME: Connection registry keyed by service name, then instance id.
// ABOUTME: New connections wait in the "unidentified" bucket until they send Identify.

use std::collections::HashMap;
use std::fmt;

use rand::seq::IteratorRandom;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::Message;

/// Bucket holding connections that have not identified themselves yet.
pub const UNIDENTIFIED: &str = "unidentified";

/// Process-unique id assigned to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a live connection.
///
/// Writing only enqueues onto the connection's outbound buffer; a writer task
/// owned by the transport drains it onto the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serialize and enqueue `message`. Returns false if the connection is gone.
    pub fn write(&self, message: &Message) -> Result<bool> {
        let line = message.encode_line()?;
        Ok(self.outbound.send(line).is_ok())
    }
}

/// Where a connection currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    service: String,
    instance: String,
}

/// Live connections grouped by service name.
///
/// Every registered connection is in exactly one bucket. A reverse index
/// from connection id to its slot keeps removal independent of whether the
/// connection identified itself.
#[derive(Debug, Default)]
pub struct Registry {
    buckets: HashMap<String, HashMap<String, ConnectionHandle>>,
    slots: HashMap<ConnectionId, Slot>,
    next_ordinal: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a freshly accepted connection in the unidentified bucket.
    pub fn register_unidentified(&mut self, conn: ConnectionHandle) {
        let ordinal = self.next_ordinal.to_string();
        self.next_ordinal += 1;
        self.insert(UNIDENTIFIED.to_string(), ordinal, conn);
    }

    /// Move `conn` to `(service_name, service_id)`.
    ///
    /// Empty fields and the reserved unidentified name are ignored and the
    /// connection stays where it is. Identifying an already identified
    /// connection replaces its previous entry. Returns whether the
    /// registration happened.
    pub fn identify(&mut self, conn: ConnectionId, service_name: &str, service_id: &str) -> bool {
        if service_name.is_empty() || service_id.is_empty() || service_name == UNIDENTIFIED {
            return false;
        }
        let Some(handle) = self.take(conn) else {
            return false;
        };
        self.insert(service_name.to_string(), service_id.to_string(), handle);
        true
    }

    /// One instance of `service`, chosen uniformly at random.
    pub fn resolve_by_name(&self, service: &str) -> Option<&ConnectionHandle> {
        self.buckets
            .get(service)?
            .values()
            .choose(&mut rand::thread_rng())
    }

    /// The connection registered under instance id `id`, in any bucket.
    ///
    /// Identified buckets are searched before the unidentified ordinals, so
    /// an instance id equal to a live ordinal always wins.
    pub fn resolve_by_id(&self, id: &str) -> Option<&ConnectionHandle> {
        self.buckets
            .iter()
            .filter(|(name, _)| name.as_str() != UNIDENTIFIED)
            .find_map(|(_, bucket)| bucket.get(id))
            .or_else(|| self.buckets.get(UNIDENTIFIED)?.get(id))
    }

    /// Look up a connection by its transport id.
    pub fn get(&self, conn: ConnectionId) -> Option<&ConnectionHandle> {
        let slot = self.slots.get(&conn)?;
        self.buckets.get(&slot.service)?.get(&slot.instance)
    }

    /// Instance id `conn` identified as, if it has.
    pub fn instance_id(&self, conn: ConnectionId) -> Option<&str> {
        self.slots
            .get(&conn)
            .filter(|slot| slot.service != UNIDENTIFIED)
            .map(|slot| slot.instance.as_str())
    }

    /// Service name and instance key `conn` is registered under.
    pub fn location(&self, conn: ConnectionId) -> Option<(&str, &str)> {
        self.slots
            .get(&conn)
            .map(|slot| (slot.service.as_str(), slot.instance.as_str()))
    }

    /// Drop `conn` from whichever bucket holds it. No-op when absent.
    pub fn remove(&mut self, conn: ConnectionId) {
        let _ = self.take(conn);
    }

    /// Number of connections registered under `service`.
    pub fn count(&self, service: &str) -> usize {
        self.buckets.get(service).map_or(0, HashMap::len)
    }

    /// Connection counts per identified service.
    pub fn service_counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.buckets
            .iter()
            .filter(|(name, bucket)| name.as_str() != UNIDENTIFIED && !bucket.is_empty())
            .map(|(name, bucket)| (name.as_str(), bucket.len()))
    }

    /// Total number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&mut self, service: String, instance: String, conn: ConnectionHandle) {
        let id = conn.id();
        let evicted = self
            .buckets
            .entry(service.clone())
            .or_default()
            .insert(instance.clone(), conn)
            .filter(|previous| previous.id() != id);
        self.slots.insert(
            id,
            Slot {
                service: service.clone(),
                instance: instance.clone(),
            },
        );
        // A different connection already holding this (service, instance) goes back
        // to the unidentified bucket so it still lives in exactly one bucket.
        if let Some(previous) = evicted {
            tracing::warn!(
                service = %service,
                instance = %instance,
                evicted = %previous.id(),
                "Instance id registered twice, newest connection wins"
            );
            self.register_unidentified(previous);
        }
    }

    fn take(&mut self, conn: ConnectionId) -> Option<ConnectionHandle> {
        let slot = self.slots.remove(&conn)?;
        let bucket = self.buckets.get_mut(&slot.service)?;
        let handle = bucket.remove(&slot.instance);
        if bucket.is_empty() {
            self.buckets.remove(&slot.service);
        }
        handle
    }
}
