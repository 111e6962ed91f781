//! The graph mailbox: a single actor task owning node registration and
//! cross-node link bookkeeping, reached only through [`GraphHandle`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::delegate::{DLink, NodeDelegate, SystemMsg};
use crate::error::{GraphError, Result};
use crate::node::{Node, NodeHandle, NodeId};

pub(crate) enum GraphCommand {
    AddNode {
        delegate: Arc<NodeDelegate>,
        reply: oneshot::Sender<Result<()>>,
    },
    LinkUp {
        from: NodeId,
        to_scope: String,
        to_name: String,
    },
    LinkDown {
        link: Arc<DLink>,
    },
    NodeExit {
        id: NodeId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
}

/// A cheap, cloneable reference to the graph's mailbox. Handed to every
/// [`NodeDelegate`] so it can request link changes without the graph ever
/// exposing its node table directly.
#[derive(Clone)]
pub(crate) struct GraphHandle {
    cmd_tx: mpsc::UnboundedSender<GraphCommand>,
}

impl GraphHandle {
    pub(crate) fn request_link_up(&self, from: NodeId, to_scope: String, to_name: String) {
        let _ = self.cmd_tx.send(GraphCommand::LinkUp { from, to_scope, to_name });
    }

    pub(crate) fn request_link_down(&self, link: Arc<DLink>) {
        let _ = self.cmd_tx.send(GraphCommand::LinkDown { link });
    }

    pub(crate) fn request_node_exit(&self, id: NodeId) {
        let _ = self.cmd_tx.send(GraphCommand::NodeExit { id });
    }
}

/// A single session's event graph: owns every node added to it and the
/// directed links between them. Cloning a [`GraphRuntime`] is cheap and all
/// clones talk to the same underlying mailbox task.
#[derive(Clone)]
pub struct GraphRuntime {
    cmd_tx: mpsc::UnboundedSender<GraphCommand>,
}

impl GraphRuntime {
    /// Spawn a fresh, empty graph.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(mailbox(cmd_rx));
        Self { cmd_tx }
    }

    pub(crate) fn handle(&self) -> GraphHandle {
        GraphHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Add a node to the graph. Fails if `(scope, name)` is already taken
    /// (I1). On success the node's event loops are started and
    /// [`crate::node::Node::on_enter`] is scheduled.
    pub async fn add_node(&self, node: Box<dyn Node>) -> Result<NodeHandle> {
        let id = NodeId::new(node.scope(), node.name());
        let config = node.config();
        let delegate = NodeDelegate::new(id, node, config, self.handle());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GraphCommand::AddNode {
                delegate: Arc::clone(&delegate),
                reply: reply_tx,
            })
            .map_err(|_| GraphError::GraphBug("graph mailbox is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| GraphError::GraphBug("graph mailbox dropped reply".into()))??;

        delegate.spawn_loops();
        Ok(NodeHandle::new(&delegate))
    }

    /// Snapshot of currently-registered node ids. Mostly useful for tests and
    /// diagnostics; not part of the hot path.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(GraphCommand::Snapshot { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

impl Default for GraphRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[instrument(skip_all)]
async fn mailbox(mut cmd_rx: mpsc::UnboundedReceiver<GraphCommand>) {
    let mut nodes: HashMap<NodeId, Arc<NodeDelegate>> = HashMap::new();
    let mut edges: Vec<Arc<DLink>> = Vec::new();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            GraphCommand::AddNode { delegate, reply } => {
                let result = if nodes.contains_key(&delegate.id) {
                    Err(GraphError::NodeAddFailed(delegate.id.to_string()))
                } else {
                    debug!(node = %delegate.id, "node added");
                    nodes.insert(delegate.id.clone(), delegate);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            GraphCommand::LinkUp { from, to_scope, to_name } => {
                let Some(from_delegate) = nodes.get(&from) else {
                    // node exited between requesting and this being processed
                    continue;
                };
                let to_id = NodeId::new(to_scope.clone(), to_name.clone());
                let duplicate = edges.iter().any(|e| e.from == from && e.to == to_id);
                let to_delegate = nodes.get(&to_id);

                if duplicate || to_delegate.is_none() {
                    warn!(%from, to = %to_id, "link-up denied: duplicate or unknown target");
                    from_delegate.notify(SystemMsg::LinkUp {
                        state: -1,
                        scope: to_scope,
                        name: to_name,
                        link: None,
                    });
                    continue;
                }

                let link = DLink::new(from.clone(), to_id, to_delegate.unwrap());
                edges.push(Arc::clone(&link));
                from_delegate.notify(SystemMsg::LinkUp {
                    state: 0,
                    scope: to_scope,
                    name: to_name,
                    link: Some(link),
                });
            }
            GraphCommand::LinkDown { link } => {
                edges.retain(|e| !Arc::ptr_eq(e, &link));
                if let Some(from_delegate) = nodes.get(&link.from) {
                    from_delegate.notify(SystemMsg::LinkDown { link });
                }
            }
            GraphCommand::NodeExit { id } => {
                let Some(delegate) = nodes.remove(&id) else {
                    continue;
                };
                debug!(node = %id, "node exiting, tearing down links");

                let (outbound, remaining): (Vec<_>, Vec<_>) =
                    edges.into_iter().partition(|e| e.from == id);
                let (inbound, mut remaining): (Vec<_>, Vec<_>) =
                    remaining.into_iter().partition(|e| e.to == id);
                edges = {
                    remaining.shrink_to_fit();
                    remaining
                };

                for link in outbound {
                    delegate.notify(SystemMsg::LinkDown { link });
                }
                for link in inbound {
                    if let Some(peer) = nodes.get(&link.from) {
                        peer.notify(SystemMsg::LinkDown { link });
                    }
                }

                delegate.notify(SystemMsg::NodeExit);
            }
            GraphCommand::Snapshot { reply } => {
                let _ = reply.send(nodes.keys().cloned().collect());
            }
        }
    }
}
