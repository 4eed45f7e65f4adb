//! Agent notifications about endpoint lifecycle events

use crate::endpoint::Endpoint;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    EndpointCreated,
    EndpointDeleted,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::EndpointCreated => write!(f, "Endpoint created"),
            NotificationKind::EndpointDeleted => write!(f, "Endpoint deleted"),
        }
    }
}

/// Receives agent notifications; typically forwards them to a monitor
pub trait Owner: Send + Sync {
    fn send_notification(&self, kind: NotificationKind, payload: String);
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EndpointNotification {
    pub id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl EndpointNotification {
    pub fn new(ep: &dyn Endpoint, reason: &str) -> Self {
        Self {
            id: ep.id(),
            container_id: ep.container_id(),
            pod_name: ep.pod_name(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// JSON payload for [`Owner::send_notification`]
    pub fn to_repr(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build the payload of an endpoint-created notification
pub fn endpoint_create_repr(ep: &dyn Endpoint, reason: &str) -> Result<String> {
    EndpointNotification::new(ep, reason).to_repr()
}
