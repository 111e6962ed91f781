//! The node capability contract and the delegate handle nodes use to talk
//! back to the graph.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::delegate::NodeDelegate;
use crate::error::{GraphError, Result};
use crate::event::Event;

/// Default max output links per node (`maxLink`).
pub const DEFAULT_MAX_LINK: usize = 5;
/// Default bounded data-mailbox capacity.
pub const DEFAULT_DATA_CHANNEL_SIZE: usize = 100;
/// Default per-node delivery timeout.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_millis(100);
/// Default delivery timeout for pub/sub node subscribers.
pub const PUBSUB_DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_millis(20);

/// Identity of a node in the graph: `(scope, name)`, unique across the graph (I1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Session/scope this node belongs to.
    pub scope: String,
    /// Name, unique within `scope`.
    pub name: String,
}

impl NodeId {
    /// Build a new identity.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Explicit, constructor-supplied per-node tunables. Replaces reflective
/// field discovery: a node that wants non-default behavior overrides
/// [`Node::config`] rather than exposing magic field names.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Max number of output link slots.
    pub max_link: usize,
    /// Bounded data-mailbox capacity.
    pub data_channel_size: usize,
    /// Delivery timeout used by [`crate::node::NodeHandle::deliver`].
    pub delivery_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_link: DEFAULT_MAX_LINK,
            data_channel_size: DEFAULT_DATA_CHANNEL_SIZE,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

/// The node capability set. Implementors are owned exclusively by a
/// [`NodeDelegate`]; the only way back to the graph is the [`NodeHandle`]
/// handed to [`Node::on_enter`].
///
/// All `on_*` callbacks are invoked under the delegate's invocation mutex and
/// therefore never run concurrently with each other (I5).
#[async_trait]
pub trait Node: Send {
    /// Session/scope this node lives in.
    fn scope(&self) -> &str;

    /// Name, unique within scope.
    fn name(&self) -> &str;

    /// Per-node tunables. The default is [`NodeConfig::default`]; override to
    /// change max links, mailbox size or delivery timeout.
    fn config(&self) -> NodeConfig {
        NodeConfig::default()
    }

    /// Called once, after the node has been added to the graph, with a
    /// handle the node may clone and retain to call back into the graph.
    async fn on_enter(&mut self, handle: NodeHandle);

    /// Called for every event delivered to this node's data mailbox.
    async fn on_event(&mut self, evt: Event);

    /// Called when an outbound link is granted. `link_id < 0` means the
    /// request was denied (target missing, or no free slot).
    async fn on_link_up(&mut self, link_id: i64, scope: &str, name: &str);

    /// Called when an outbound link is torn down, whether by explicit
    /// request or because the peer exited the graph.
    async fn on_link_down(&mut self, link_id: i64, scope: &str, name: &str);

    /// The finalizing callback; runs exactly once, after every link has been
    /// torn down (I6), and after all other callbacks (no overlap, per I5).
    async fn on_exit(&mut self);

    /// Establish this node's single declared outbound pipe to `(session,
    /// name)`. The default allows only one outbound pipe per node; the
    /// pub/sub node overrides this to allow many (it *is* the many-pipe
    /// node type).
    fn set_pipe_out(&self, handle: &NodeHandle, session: &str, name: &str) -> Result<()> {
        handle.claim_default_pipe_out()?;
        handle.request_link_up(session, name)
    }

    /// Extension point for the pub/sub node type to expose its channel-bind
    /// API to the composer without any other node or caller having to know
    /// about it. `None` for every other node type.
    fn as_pubsub_binder(&self) -> Option<&dyn crate::nodes::pubsub::PubSubChannelBinder> {
        None
    }
}

/// A non-owning reference to a node's delegate. Nodes hold this (not an
/// `Arc<NodeDelegate>`) so the delegate remains the sole owner of the node
/// and no ownership cycle forms between delegate and node.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) inner: Weak<NodeDelegate>,
}

impl NodeHandle {
    pub(crate) fn new(delegate: &Arc<NodeDelegate>) -> Self {
        Self {
            inner: Arc::downgrade(delegate),
        }
    }

    fn upgrade(&self) -> Result<Arc<NodeDelegate>> {
        self.inner
            .upgrade()
            .ok_or_else(|| GraphError::InvalidRequest("node delegate no longer exists".into()))
    }

    /// This node's identity.
    pub fn id(&self) -> Option<NodeId> {
        self.inner.upgrade().map(|d| d.id.clone())
    }

    /// Request a new outbound link to `(scope, name)`. Returns synchronously
    /// only for malformed arguments; the actual grant/denial arrives later
    /// via [`Node::on_link_up`].
    pub fn request_link_up(&self, scope: &str, name: &str) -> Result<()> {
        if scope.is_empty() || name.is_empty() {
            return Err(GraphError::InvalidRequest("wrong link-up parameters".into()));
        }
        let delegate = self.upgrade()?;
        delegate.request_link_up(scope, name)
    }

    /// Tear down outbound link `link_id`. Validated synchronously against
    /// the caller's own slot array (range + ownership); the callback invoked
    /// on completion is [`Node::on_link_down`].
    pub fn request_link_down(&self, link_id: usize) -> Result<()> {
        let delegate = self.upgrade()?;
        delegate.request_link_down(link_id)
    }

    /// Request this node's own removal from the graph. Idempotent: only the
    /// first call schedules teardown.
    pub fn request_node_exit(&self) -> Result<()> {
        let delegate = self.upgrade()?;
        delegate.request_node_exit()
    }

    /// Deliver `evt` on `link_id` using this node's configured delivery
    /// timeout. Nonblocking first, falling back to a timed wait.
    pub async fn deliver(&self, link_id: usize, evt: Event) -> bool {
        match self.upgrade() {
            Ok(delegate) => delegate.deliver(link_id, evt).await,
            Err(_) => false,
        }
    }

    /// Deliver `evt` on `link_id`, overriding the default delivery timeout.
    pub async fn deliver_with_timeout(&self, link_id: usize, evt: Event, timeout: Duration) -> bool {
        match self.upgrade() {
            Ok(delegate) => delegate.deliver_with_timeout(link_id, evt, timeout).await,
            Err(_) => false,
        }
    }

    /// Claim the single default outbound pipe slot for this node. Returns an
    /// error if it has already been claimed (the default [`Node::set_pipe_out`]
    /// allows exactly one).
    pub fn claim_default_pipe_out(&self) -> Result<()> {
        let delegate = self.upgrade()?;
        delegate.claim_default_pipe_out()
    }

    /// Establish this node's declared outbound pipe to `(session, name)` by
    /// running the live node's own [`Node::set_pipe_out`] (so the default
    /// one-pipe-per-node guard, or pub/sub's many-pipe override, actually
    /// runs instead of being bypassed by a direct link-up request).
    pub async fn set_pipe_out(&self, session: &str, name: &str) -> Result<()> {
        let delegate = self.upgrade()?;
        delegate
            .with_node(|node| node.set_pipe_out(self, session, name))
            .await
    }

    /// Install the session controller (dispatch node) this node can use for
    /// cross-node request/response.
    pub fn set_controller(&self, controller: Arc<dyn crate::nodes::dispatch::Controller>) {
        if let Ok(delegate) = self.upgrade() {
            delegate.set_controller(controller);
        }
    }

    /// The controller installed by the composer, if any.
    pub fn controller(&self) -> Option<Arc<dyn crate::nodes::dispatch::Controller>> {
        self.upgrade().ok().and_then(|d| d.controller())
    }

    /// Run `f` against the live node under its invocation mutex (so it never
    /// overlaps an in-flight callback), returning `None` if the node has
    /// already exited. Used for extension points like
    /// [`Node::as_pubsub_binder`] that a generic caller (e.g. the composer)
    /// needs without being handed ownership of the node.
    pub async fn with_node<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&dyn Node) -> R + Send,
        R: Send,
    {
        let delegate = self.inner.upgrade()?;
        Some(delegate.with_node(f).await)
    }
}
