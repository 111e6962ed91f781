//! Built-in node types shipped with the runtime.

pub mod dispatch;
pub mod pubsub;
