//! The pub/sub fan-out node: the one node type allowed more than one
//! outbound pipe, delivering every published event to an arbitrary mix of
//! other graph nodes and externally-registered channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GraphError, Result};
use crate::event::{CtrlMessage, Event, StatusEnvelope};
use crate::node::{Node, NodeConfig, NodeHandle, NodeId, PUBSUB_DEFAULT_DELIVERY_TIMEOUT};

/// One destination a [`PubSubNode`] fans events out to.
enum Subscriber {
    /// Another graph node, reached over the outbound link granted when it
    /// was subscribed (see [`Node::on_link_up`]).
    Node { id: NodeId, link_id: usize },
    /// An externally-owned channel, bound by name via [`PubSubChannelBinder`].
    Channel {
        name: String,
        sender: mpsc::Sender<Event>,
    },
}

/// Extension point the composer uses to bind a `pubsub` node's `channel=`
/// construction property to a registered channel, without needing ownership
/// of the concrete node. See [`crate::node::Node::as_pubsub_binder`].
pub trait PubSubChannelBinder: Send + Sync {
    /// Subscribe `sender` under `name`. Fails if `name` is already bound.
    fn bind_channel(&self, name: String, sender: mpsc::Sender<Event>) -> Result<()>;

    /// Remove the channel subscription `name`, if any.
    fn unbind_channel(&self, name: &str);
}

struct PubSubShared {
    subscribers: Mutex<Vec<Subscriber>>,
    delivery_timeout: Duration,
}

impl PubSubChannelBinder for PubSubShared {
    fn bind_channel(&self, name: String, sender: mpsc::Sender<Event>) -> Result<()> {
        let mut subs = self.subscribers.lock();
        if subs.iter().any(|s| matches!(s, Subscriber::Channel { name: n, .. } if *n == name)) {
            return Err(GraphError::UnknownChannel(format!("channel '{name}' already bound")));
        }
        subs.push(Subscriber::Channel { name, sender });
        Ok(())
    }

    fn unbind_channel(&self, name: &str) {
        self.subscribers
            .lock()
            .retain(|s| !matches!(s, Subscriber::Channel { name: n, .. } if n == name));
    }
}

/// Dynamic, many-outbound-pipe fan-out node. Publishes every `DATA_OUTPUT`
/// event it receives to all current node- and channel-subscribers, and
/// accepts `CTRL_CALL` commands to manage node subscriptions at runtime.
pub struct PubSubNode {
    scope: String,
    name: String,
    max_link: usize,
    handle: Option<NodeHandle>,
    shared: Arc<PubSubShared>,
}

impl PubSubNode {
    /// Build a pub/sub node with room for `max_link` node-subscribers.
    pub fn new(scope: impl Into<String>, name: impl Into<String>, max_link: usize) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            max_link,
            handle: None,
            shared: Arc::new(PubSubShared {
                subscribers: Mutex::new(Vec::new()),
                delivery_timeout: PUBSUB_DEFAULT_DELIVERY_TIMEOUT,
            }),
        }
    }

    async fn publish(&self, evt: Event) {
        let Some(payload) = evt.into_data() else {
            warn!(node = %self.name, "pubsub received a non-data event, dropping");
            return;
        };
        // snapshot under the lock, deliver without holding it: a slow or
        // stuck subscriber must never block another subscriber's delivery
        let targets: Vec<(Option<usize>, Option<mpsc::Sender<Event>>)> = {
            let subs = self.shared.subscribers.lock();
            subs.iter()
                .map(|s| match s {
                    Subscriber::Node { link_id, .. } => (Some(*link_id), None),
                    Subscriber::Channel { sender, .. } => (None, Some(sender.clone())),
                })
                .collect()
        };

        for (link_id, sender) in targets {
            let clone: Box<dyn crate::event::Cloneable> = payload.clone_boxed();
            let clone_evt = Event::data_boxed(clone);
            match (link_id, sender) {
                (Some(link_id), None) => {
                    if let Some(handle) = &self.handle {
                        if !handle
                            .deliver_with_timeout(link_id, clone_evt, self.shared.delivery_timeout)
                            .await
                        {
                            debug!(node = %self.name, link_id, "subscriber delivery failed");
                        }
                    }
                }
                (None, Some(sender)) => {
                    // channel delivery is nonblock-only: a full buffer silently
                    // drops the event for that subscriber, it is never retried
                    if sender.try_send(clone_evt).is_err() {
                        debug!(node = %self.name, "channel subscriber full or closed, dropping event");
                    }
                }
                _ => unreachable!("subscriber is exactly one of node or channel"),
            }
        }
    }

    /// `M[0] == "conn"` with two further strings (`scope`, `name`) subscribes
    /// that node by running this node's own `SetPipeOut`, which here means
    /// "add a node subscriber" rather than the default's single-pipe claim.
    async fn handle_call(&self, msg: CtrlMessage) {
        let CtrlMessage { m, reply } = msg;
        let envelope = match m.first().map(String::as_str) {
            Some("conn") if m.len() == 3 => match &self.handle {
                Some(handle) => match self.set_pipe_out(handle, &m[1], &m[2]) {
                    Ok(()) => StatusEnvelope::ok(),
                    Err(e) => StatusEnvelope::error(e.to_string()),
                },
                None => StatusEnvelope::error("pubsub node not yet entered"),
            },
            Some(other) => StatusEnvelope::error(format!("unknown pubsub command '{other}'")),
            None => StatusEnvelope::error("empty control message"),
        };
        let _ = reply.send(envelope);
    }
}

#[async_trait]
impl Node for PubSubNode {
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
        self.handle = Some(handle);
    }

    async fn on_event(&mut self, evt: Event) {
        match evt.cmd() {
            crate::event::DATA_OUTPUT => self.publish(evt).await,
            crate::event::CTRL_CALL => {
                if let Some(msg) = evt.into_ctrl_call() {
                    self.handle_call(msg).await;
                }
            }
            other => warn!(node = %self.name, cmd = other, "pubsub received an unknown opcode"),
        }
    }

    async fn on_link_up(&mut self, link_id: i64, scope: &str, name: &str) {
        if link_id < 0 {
            warn!(node = %self.name, %scope, %name, "node subscription denied");
            return;
        }
        self.shared.subscribers.lock().push(Subscriber::Node {
            id: NodeId::new(scope, name),
            link_id: link_id as usize,
        });
    }

    async fn on_link_down(&mut self, link_id: i64, scope: &str, name: &str) {
        // self-healing: a peer exiting tears its subscription down the same
        // way an explicit unsubscribe would, so the list never goes stale
        let id = NodeId::new(scope, name);
        self.shared
            .subscribers
            .lock()
            .retain(|s| !matches!(s, Subscriber::Node { id: sid, link_id: lid } if *sid == id && *lid == link_id as usize));
    }

    async fn on_exit(&mut self) {
        self.shared.subscribers.lock().clear();
        self.handle = None;
    }

    fn set_pipe_out(&self, handle: &NodeHandle, session: &str, name: &str) -> Result<()> {
        // pub/sub is the one node type allowed more than one outbound pipe;
        // skip the default single-claim guard entirely
        handle.request_link_up(session, name)
    }

    fn as_pubsub_binder(&self) -> Option<&dyn PubSubChannelBinder> {
        Some(self.shared.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_channel_binding() {
        let shared = PubSubShared {
            subscribers: Mutex::new(Vec::new()),
            delivery_timeout: PUBSUB_DEFAULT_DELIVERY_TIMEOUT,
        };
        let (tx, _rx) = mpsc::channel(4);
        shared.bind_channel("out".into(), tx.clone()).unwrap();
        assert!(shared.bind_channel("out".into(), tx).is_err());
    }
}
