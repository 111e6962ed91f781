//! A per-session event-graph runtime for a media server.
//!
//! Each session owns a [`graph::GraphRuntime`]: a set of typed [`node::Node`]s
//! connected by bounded, backpressured links. [`composer::Composer`] turns a
//! textual [`topology::GraphTopology`] description into a live graph, wiring
//! producer/transformer pipelines, a [`nodes::pubsub::PubSubNode`] fan-out
//! stage, and a per-session [`nodes::dispatch::DispatchNode`] request/response
//! bus.

pub mod composer;
mod delegate;
pub mod error;
pub mod event;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod telemetry;
pub mod topology;

pub use composer::{Composer, NodeFactory};
pub use error::{GraphError, Result};
pub use event::{CtrlMessage, Event, StatusEnvelope};
pub use graph::GraphRuntime;
pub use node::{Node, NodeConfig, NodeHandle, NodeId};
pub use topology::{GraphTopology, NodeInfo};
