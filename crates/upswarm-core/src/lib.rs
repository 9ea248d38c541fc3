// ABOUTME: upswarm supervisor engine and worker runtime.
// ABOUTME: Re-exports the supervisor, message model, and worker-side client for programmatic use.

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod process;
pub mod registry;
pub mod router;
pub mod service;
pub mod supervisor;
pub mod topology;
pub mod transport;

pub use client::ServiceClient;
pub use config::{SupervisorConfig, DEFAULT_PORT};
pub use error::{Result, UpswarmError};
pub use message::{make_reply, Message, Payload};
pub use process::{ProcessSupervisor, WorkerCommand};
pub use registry::{ConnectionId, Registry};
pub use router::{Delivery, Router};
pub use service::{run_worker, EchoService, Service, ServiceCatalog, WorkerOptions};
pub use supervisor::{StatusInfo, Supervisor, SupervisorHandle};
pub use topology::{FileTopologySource, Reconciler, Topology, TopologyEvent};
