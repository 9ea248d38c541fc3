// ABOUTME: Topology source that polls a file and emits info, error, and update events.
// ABOUTME: Emits a full Topology whenever the file content changes and parses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use super::Topology;

/// Events produced by a topology source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Something worth telling the operator.
    Info(String),
    /// A problem reading or parsing the topology.
    Error(String),
    /// The full new topology.
    Update(Topology),
}

/// Polls a topology file for changes.
#[derive(Debug, Clone)]
pub struct FileTopologySource {
    path: PathBuf,
    interval: Duration,
    last_content: Option<String>,
    last_error: Option<String>,
}

impl FileTopologySource {
    /// `interval` is raised to at least one millisecond.
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval: interval.max(Duration::from_millis(1)),
            last_content: None,
            last_error: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once. Returns an event when something changed.
    pub async fn poll(&mut self) -> Option<TopologyEvent> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                if self.last_content.as_deref() == Some(content.as_str()) {
                    return None;
                }
                let parsed = Topology::parse(&self.path, &content);
                self.last_content = Some(content);
                match parsed {
                    Ok(topology) => {
                        self.last_error = None;
                        Some(TopologyEvent::Update(topology))
                    }
                    Err(e) => self.fail(format!("{}: {}", self.path.display(), e)),
                }
            }
            Err(e) => {
                // Forget the content so the file reappearing unchanged still updates.
                self.last_content = None;
                self.fail(format!("cannot read {}: {}", self.path.display(), e))
            }
        }
    }

    /// Report each distinct failure once.
    fn fail(&mut self, message: String) -> Option<TopologyEvent> {
        if self.last_error.as_deref() == Some(message.as_str()) {
            return None;
        }
        self.last_error = Some(message.clone());
        Some(TopologyEvent::Error(message))
    }

    /// Poll forever, sending events to `events`. Returns when the receiver is gone.
    pub async fn run(mut self, events: mpsc::Sender<TopologyEvent>) {
        let info = TopologyEvent::Info(format!("Watching topology file {}", self.path.display()));
        if events.send(info).await.is_err() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(event) = self.poll().await {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
