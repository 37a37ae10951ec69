//! The hub's `rmcp::ClientHandler` towards each upstream: receives
//! progress/logging/resource-update notifications and list-changed
//! signals pushed by the upstream over its own connection.
//!
//! One handler is shared by the single `Connection` a node keeps open, but
//! many downstream sessions can have an in-flight call against that node at
//! once. There is no per-call correlation token on the typed call surface
//! (`CallToolRequestParam` etc. carry no progress token), so a notification
//! is broadcast to every session currently calling this node rather than
//! routed to the one that "caused" it (see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use rmcp::model::{
    ClientInfo, LoggingMessageNotificationParam, ProgressNotificationParam,
    ResourceUpdatedNotificationParam,
};
use rmcp::service::NotificationContext;
use rmcp::{ClientHandler, RoleClient};

use crate::node::UpstreamNode;
use crate::session::{SessionManager, StreamEvent};

/// Sessions currently calling a node, refcounted so a session with two
/// concurrent calls against the same node isn't dropped from the broadcast
/// set after the first one finishes.
pub type ActiveSessions = Arc<Mutex<HashMap<String, u32>>>;

#[derive(Clone)]
pub struct HubClientHandler {
    upstream_id: Arc<str>,
    sessions: Arc<SessionManager>,
    active_sessions: ActiveSessions,
    node: Weak<UpstreamNode>,
}

impl HubClientHandler {
    pub fn new(
        upstream_id: impl AsRef<str>,
        sessions: Arc<SessionManager>,
        active_sessions: ActiveSessions,
        node: Weak<UpstreamNode>,
    ) -> Self {
        Self {
            upstream_id: Arc::from(upstream_id.as_ref()),
            sessions,
            active_sessions,
            node,
        }
    }

    fn broadcast(&self, method: &str, params: serde_json::Value) {
        let active = self
            .active_sessions
            .lock()
            .expect("active sessions lock poisoned");
        for session_id in active.keys() {
            self.sessions.deliver(
                session_id,
                StreamEvent {
                    method: method.to_string(),
                    params: params.clone(),
                },
            );
        }
    }

    fn trigger_catalogue_refresh(&self, what: &'static str) {
        let Some(node) = self.node.upgrade() else { return };
        tracing::debug!(upstream = %self.upstream_id, what, "upstream list changed; refreshing catalogue");
        tokio::spawn(async move {
            if let Err(error) = node.refresh_catalogue().await {
                tracing::warn!(
                    upstream = %node.id(),
                    error = %error,
                    "failed to refresh catalogue after list-changed notification"
                );
            }
        });
    }
}

impl ClientHandler for HubClientHandler {
    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = "hatago".to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(
            upstream = %self.upstream_id,
            progress = %params.progress,
            total = ?params.total,
            "upstream progress"
        );
        let value = serde_json::to_value(&params).unwrap_or(serde_json::Value::Null);
        self.broadcast("notifications/progress", value);
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(
            upstream = %self.upstream_id,
            logger = ?params.logger,
            "upstream log: {}",
            params.data
        );
        let value = serde_json::to_value(&params).unwrap_or(serde_json::Value::Null);
        self.broadcast("notifications/message", value);
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(upstream = %self.upstream_id, uri = %params.uri, "upstream resource updated");
        let value = serde_json::to_value(&params).unwrap_or(serde_json::Value::Null);
        self.broadcast("notifications/resources/updated", value);
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.broadcast("notifications/tools/list_changed", serde_json::Value::Null);
        self.trigger_catalogue_refresh("tools");
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.broadcast("notifications/resources/list_changed", serde_json::Value::Null);
        self.trigger_catalogue_refresh("resources");
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.broadcast("notifications/prompts/list_changed", serde_json::Value::Null);
        self.trigger_catalogue_refresh("prompts");
    }
}
