// ABOUTME: Desired topology (service name -> instance count) and the reconciliation diff.
// ABOUTME: Plans staggered spawn/stop actions that move actual counts toward the topology.

pub mod source;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpswarmError};

pub use source::{FileTopologySource, TopologyEvent};

/// Desired instance count per service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology(BTreeMap<String, usize>);

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the desired count of `service`.
    pub fn with(mut self, service: impl Into<String>, count: usize) -> Self {
        self.0.insert(service.into(), count);
        self
    }

    pub fn desired(&self, service: &str) -> Option<usize> {
        self.0.get(service).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(name, count)| (name.as_str(), *count))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a topology document. JSON when `path` ends in `.json`, TOML otherwise.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(content).map_err(|e| UpswarmError::Topology(e.to_string()))
        } else {
            toml::from_str(content).map_err(|e| UpswarmError::Topology(e.to_string()))
        }
    }
}

/// Direction of a planned correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Spawn,
    Stop,
}

/// One correction to apply after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub service: String,
    pub action: Action,
    pub delay: Duration,
}

/// Owns the desired topology and computes reconciliation passes.
///
/// Passes are level-triggered: each one recomputes the diff from the actual
/// counts handed in, so a spawn that never came up is retried next pass.
#[derive(Debug, Clone)]
pub struct Reconciler {
    topology: Topology,
    stagger: Duration,
}

impl Reconciler {
    /// `stagger` is the time unit between consecutive actions for one service.
    pub fn new(stagger: Duration) -> Self {
        Self {
            topology: Topology::new(),
            stagger,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Replace the stored topology wholesale.
    pub fn replace(&mut self, topology: Topology) {
        tracing::info!(services = topology.len(), "Topology updated");
        self.topology = topology;
    }

    /// Plan one pass. For each service, `desired - actual` spawns or
    /// `actual - desired` stops, the i-th delayed by `i` stagger units.
    pub fn plan<F>(&self, actual: F) -> Vec<ScheduledAction>
    where
        F: Fn(&str) -> usize,
    {
        let mut actions = Vec::new();
        for (service, desired) in self.topology.iter() {
            let current = actual(service);
            let (action, amount) = if desired > current {
                (Action::Spawn, desired - current)
            } else {
                (Action::Stop, current - desired)
            };
            if amount > 0 {
                tracing::debug!(
                    service = %service,
                    desired,
                    actual = current,
                    ?action,
                    amount,
                    "Reconciling"
                );
            }
            actions.extend((0..amount).map(|i| ScheduledAction {
                service: service.to_string(),
                action,
                delay: self.stagger * i as u32,
            }));
        }
        actions
    }
}
