//! Session composition: turns a parsed [`GraphTopology`] plus a registry of
//! node factories into a live [`GraphRuntime`], wiring single-pipe links,
//! the per-session dispatch controller, and externally registered channels.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::error::{GraphError, Result};
use crate::event::Event;
use crate::graph::GraphRuntime;
use crate::node::{Node, NodeHandle};
use crate::nodes::dispatch::DispatchNode;
use crate::topology::{GraphTopology, NodeInfo};

/// Builds a [`Node`] from its parsed [`NodeInfo`]. Registered per `node_type`
/// string with [`Composer::register`].
pub trait NodeFactory: Send + Sync {
    /// Construct a node instance for `info`.
    fn make(&self, info: &NodeInfo) -> Result<Box<dyn Node>>;
}

impl<F> NodeFactory for F
where
    F: Fn(&NodeInfo) -> Result<Box<dyn Node>> + Send + Sync,
{
    fn make(&self, info: &NodeInfo) -> Result<Box<dyn Node>> {
        self(info)
    }
}

/// Composes one session's graph from a textual description. Holds the
/// node-type registry and the external channels a `pubsub` node's `channel`
/// property can bind to.
pub struct Composer {
    scope: String,
    factories: HashMap<String, Arc<dyn NodeFactory>>,
    channels: HashMap<String, mpsc::Sender<Event>>,
}

impl Composer {
    /// Start a composer for session `scope`.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            factories: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Register a node type's factory.
    pub fn register(&mut self, node_type: impl Into<String>, factory: impl NodeFactory + 'static) {
        self.factories.insert(node_type.into(), Arc::new(factory));
    }

    /// Register an externally-owned channel a `pubsub` node can subscribe
    /// to by name via its `channel` construction property.
    pub fn register_channel(&mut self, name: impl Into<String>, sender: mpsc::Sender<Event>) {
        self.channels.insert(name.into(), sender);
    }

    /// Parse `description` against this composer's registered node types.
    pub fn parse(&self, description: &str) -> Result<GraphTopology> {
        let topo = GraphTopology::parse(&self.scope, description)?;
        for info in &topo.nodes {
            if !self.factories.contains_key(&info.node_type) {
                return Err(GraphError::UnknownType(info.node_type.clone()));
            }
        }
        Ok(topo)
    }

    /// Build `topo` into a live graph: instantiate every node, link each to
    /// its declared dependencies, attach a session-wide dispatch controller,
    /// and bind any `pubsub` `channel=` properties to registered channels.
    ///
    /// On any failure every node added so far is asked to exit before the
    /// error is returned (full unwind, matching the original composer's
    /// all-or-nothing session setup).
    #[instrument(skip(self, topo), fields(scope = %self.scope))]
    pub async fn prepare(&self, topo: &GraphTopology) -> Result<GraphRuntime> {
        let graph = GraphRuntime::new();
        let mut handles: HashMap<String, NodeHandle> = HashMap::new();

        if let Err(e) = self.instantiate_all(&graph, topo, &mut handles).await {
            self.unwind(&handles).await;
            return Err(e);
        }

        if let Err(e) = self.link_dependencies(topo, &handles).await {
            self.unwind(&handles).await;
            return Err(e);
        }

        if let Err(e) = self.attach_dispatch(&graph, topo, &mut handles).await {
            self.unwind(&handles).await;
            return Err(e);
        }

        if let Err(e) = self.bind_channels(topo, &handles).await {
            self.unwind(&handles).await;
            return Err(e);
        }

        info!(nodes = handles.len(), "session graph prepared");
        Ok(graph)
    }

    async fn instantiate_all(
        &self,
        graph: &GraphRuntime,
        topo: &GraphTopology,
        handles: &mut HashMap<String, NodeHandle>,
    ) -> Result<()> {
        for info in &topo.nodes {
            let factory = self
                .factories
                .get(&info.node_type)
                .ok_or_else(|| GraphError::UnknownType(info.node_type.clone()))?;
            let node = factory.make(info)?;
            let handle = graph
                .add_node(node)
                .await
                .map_err(|_| GraphError::NodeAddFailed(info.name.clone()))?;
            handles.insert(info.name.clone(), handle);
        }
        Ok(())
    }

    async fn link_dependencies(
        &self,
        topo: &GraphTopology,
        handles: &HashMap<String, NodeHandle>,
    ) -> Result<()> {
        for info in &topo.nodes {
            for dep in &info.deps {
                let from = handles
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency(dep.clone()))?;
                from.set_pipe_out(&self.scope, &info.name)
                    .await
                    .map_err(|_| GraphError::LinkFailed {
                        from: dep.clone(),
                        to: info.name.clone(),
                    })?;
            }
        }
        Ok(())
    }

    async fn attach_dispatch(
        &self,
        graph: &GraphRuntime,
        topo: &GraphTopology,
        handles: &mut HashMap<String, NodeHandle>,
    ) -> Result<()> {
        let max_link = topo.nodes.len().saturating_mul(2).max(1);
        let dispatch_name = format!("__dispatch_{}", self.scope);
        let dispatch = DispatchNode::new(self.scope.clone(), dispatch_name.clone(), max_link);
        let controller: Arc<dyn crate::nodes::dispatch::Controller> = dispatch.controller();

        let dispatch_handle = graph
            .add_node(Box::new(dispatch))
            .await
            .map_err(|_| GraphError::NodeAddFailed(dispatch_name.clone()))?;

        for info in &topo.nodes {
            dispatch_handle
                .request_link_up(&self.scope, &info.name)
                .map_err(|_| GraphError::LinkFailed {
                    from: dispatch_name.clone(),
                    to: info.name.clone(),
                })?;
            if let Some(h) = handles.get(&info.name) {
                h.set_controller(Arc::clone(&controller));
            }
        }

        handles.insert(dispatch_name, dispatch_handle);
        Ok(())
    }

    async fn bind_channels(
        &self,
        topo: &GraphTopology,
        handles: &HashMap<String, NodeHandle>,
    ) -> Result<()> {
        for info in &topo.nodes {
            let Some(channel_prop) = info.props.get("channel") else {
                continue;
            };
            let handle = handles
                .get(&info.name)
                .ok_or_else(|| GraphError::NodeAddFailed(info.name.clone()))?;
            for channel_name in channel_prop.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let sender = self
                    .channels
                    .get(channel_name)
                    .ok_or_else(|| GraphError::UnknownChannel(channel_name.to_string()))?
                    .clone();
                let channel_name_owned = channel_name.to_string();
                let bound = handle
                    .with_node(move |node| {
                        node.as_pubsub_binder()
                            .map(|b| b.bind_channel(channel_name_owned, sender))
                    })
                    .await;
                match bound {
                    Some(Some(Ok(()))) => {}
                    _ => return Err(GraphError::UnknownChannel(channel_name.to_string())),
                }
            }
        }
        Ok(())
    }

    async fn unwind(&self, handles: &HashMap<String, NodeHandle>) {
        warn!(scope = %self.scope, "unwinding partially-prepared session graph");
        for handle in handles.values() {
            let _ = handle.request_node_exit();
        }
    }
}
