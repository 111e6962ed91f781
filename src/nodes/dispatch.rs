//! The per-session dispatch node: a request/response bus every other node
//! in a session is linked to and given a handle for ([`Controller`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;

use crate::event::{CtrlMessage, Event, StatusEnvelope};
use crate::node::{Node, NodeConfig, NodeHandle, NodeId};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cross-node request/response entry point. The composer links a session's
/// dispatch node to every other node and installs this trait object on each
/// of them via [`crate::node::NodeHandle::set_controller`], so any node can
/// call any other by `(scope, name)` without holding a direct reference to it.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Route `args` to the node at `(scope, name)` as a `CTRL_CALL` and wait
    /// for its `StatusEnvelope` reply.
    async fn call(&self, scope: &str, name: &str, args: Vec<String>) -> StatusEnvelope;
}

struct DispatchShared {
    handle: RwLock<Option<NodeHandle>>,
    links: Mutex<HashMap<NodeId, usize>>,
}

#[async_trait]
impl Controller for DispatchShared {
    async fn call(&self, scope: &str, name: &str, args: Vec<String>) -> StatusEnvelope {
        let target = NodeId::new(scope, name);
        let link_id = { self.links.lock().get(&target).copied() };
        let Some(link_id) = link_id else {
            return StatusEnvelope::error(format!("not connected to {target}"));
        };
        let Some(handle) = self.handle.read().clone() else {
            return StatusEnvelope::error("dispatch node not yet entered");
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let evt = Event::ctrl_call(CtrlMessage { m: args, reply: reply_tx });
        if !handle.deliver(link_id, evt).await {
            return StatusEnvelope::error(format!("delivery to {target} failed"));
        }
        match timeout(CALL_TIMEOUT, reply_rx).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(_)) => StatusEnvelope::error(format!("{target} dropped the reply channel")),
            Err(_) => StatusEnvelope::error(format!("{target} call timed out")),
        }
    }
}

/// The node half of the dispatch node. Every session gets exactly one,
/// added last and linked to every other node in the session by the composer.
pub struct DispatchNode {
    scope: String,
    name: String,
    max_link: usize,
    shared: Arc<DispatchShared>,
}

impl DispatchNode {
    /// Build a dispatch node for `scope` with room for `max_link` outbound
    /// links (the composer sizes this to `2 * node_count`).
    pub fn new(scope: String, name: String, max_link: usize) -> Self {
        Self {
            scope,
            name,
            max_link,
            shared: Arc::new(DispatchShared {
                handle: RwLock::new(None),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The [`Controller`] handle for this dispatch node, captured before it
    /// is boxed and handed to the graph so the composer can install it on
    /// every other node.
    pub fn controller(&self) -> Arc<dyn Controller> {
        Arc::clone(&self.shared) as Arc<dyn Controller>
    }
}

#[async_trait]
impl Node for DispatchNode {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> NodeConfig {
        NodeConfig {
            max_link: self.max_link,
            ..NodeConfig::default()
        }
    }

    async fn on_enter(&mut self, handle: NodeHandle) {
        *self.shared.handle.write() = Some(handle);
    }

    async fn on_event(&mut self, _evt: Event) {
        // the dispatch node is addressed through its Controller handle, not
        // through its own data mailbox; nothing ever lands here in practice
        warn!(node = %self.name, "dispatch node received an unsolicited event");
    }

    async fn on_link_up(&mut self, link_id: i64, scope: &str, name: &str) {
        if link_id < 0 {
            warn!(%scope, %name, "dispatch failed to link to session node");
            return;
        }
        self.shared
            .links
            .lock()
            .insert(NodeId::new(scope, name), link_id as usize);
    }

    async fn on_link_down(&mut self, _link_id: i64, scope: &str, name: &str) {
        self.shared.links.lock().remove(&NodeId::new(scope, name));
    }

    async fn on_exit(&mut self) {
        self.shared.links.lock().clear();
        *self.shared.handle.write() = None;
    }
}
