//! Analytics event emission
//!
//! Events are best effort: the manager launches emission as detached tasks
//! and discards the result, so a slow or failing tracker never touches the
//! request path.

use async_trait::async_trait;

use crate::error::Result;

/// A named analytics event with string properties
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub name: String,
    pub properties: Vec<(String, String)>,
}

impl TrackEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// The anonymous event fired when a new session is created
    pub fn page_view(client_version: &str, server_version: &str) -> Self {
        let page = format!("server_version/{}", server_version);
        Self::new("page_view")
            .with("client_version", client_version)
            .with("server_version", server_version)
            .with("page_title", page.clone())
            .with("page_location", page)
    }

    /// The periodic liveness event carrying the live session count
    pub fn heartbeat(session_count: usize) -> Self {
        Self::new("heartbeat").with("session_count", session_count.to_string())
    }
}

/// Sink for analytics events
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn track(&self, event: TrackEvent) -> Result<()>;
}

/// Tracker that writes events to the log
pub struct LogTracker;

#[async_trait]
impl Tracker for LogTracker {
    async fn track(&self, event: TrackEvent) -> Result<()> {
        log::debug!("track {}: {:?}", event.name, event.properties);
        Ok(())
    }
}
