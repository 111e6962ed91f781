//! Error types for the event-graph runtime

use thiserror::Error;

/// Result type alias for event-graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Error taxonomy for the event-graph runtime.
///
/// Variants map to the kinds described in the composer/runtime error design:
/// parse-time failures, compose-time failures that trigger an unwind, and
/// recoverable/fatal runtime conditions.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A graph description line could not be parsed (bad syntax).
    #[error("bad graph description line: {0}")]
    BadLine(String),

    /// A node declared a type with no registered factory.
    #[error("unknown node type: {0}")]
    UnknownType(String),

    /// Topological sort detected a cycle.
    #[error("cyclic graph detected among nodes: {0:?}")]
    CyclicGraph(Vec<String>),

    /// A dependency name did not resolve to any declared node.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Aggregated parse failure: the description had `count` bad lines.
    #[error("there were {count} error(s) in graph description:\n{text}")]
    ParseFailed {
        /// Number of rejected lines.
        count: usize,
        /// The original description text, for diagnostics.
        text: String,
    },

    /// `MakeSessionNode` failed, or `AddNode` rejected a duplicate `(scope, name)`.
    #[error("failed to add node '{0}' to graph")]
    NodeAddFailed(String),

    /// A declared link could not be established.
    #[error("failed to link '{from}' => '{to}'")]
    LinkFailed {
        /// Source node name.
        from: String,
        /// Target node name.
        to: String,
    },

    /// A pubsub node referenced a channel name with no matching registration.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// `RequestLinkUp`/`RequestLinkDown`/`RequestNodeExit` called with invalid
    /// arguments (empty scope/name, out-of-range link id, wrong owner).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// `RequestNodeExit` called on a node already tearing down.
    #[error("node is already in exiting state")]
    AlreadyExiting,

    /// The event graph observed a condition that should be impossible given
    /// correct internal bookkeeping (wrong object type for an opcode, unknown
    /// system opcode). Treated as a programmer error in the runtime itself.
    #[error("graph bug: {0}")]
    GraphBug(String),
}
