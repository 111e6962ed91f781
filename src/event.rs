//! Event data model: the immutable `(cmd, obj)` pair moved between nodes,
//! and the user-facing opcodes/envelopes built on top of it.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Integer opcode. System opcodes occupy the negative range, user opcodes
/// the non-negative range, so the two partitions are always disjoint.
pub type Opcode = i32;

/// A node emitted a data payload (the `obj` must implement [`Cloneable`]).
pub const DATA_OUTPUT: Opcode = 1;
/// A node issued a request/response control call (the `obj` is a [`CtrlMessage`]).
pub const CTRL_CALL: Opcode = 2;

pub(crate) const REQ_LINK_UP: Opcode = -1;
pub(crate) const RESP_LINK_UP: Opcode = -2;
pub(crate) const REQ_LINK_DOWN: Opcode = -3;
pub(crate) const RESP_LINK_DOWN: Opcode = -4;
pub(crate) const REQ_NODE_EXIT: Opcode = -5;
pub(crate) const RESP_NODE_ADD: Opcode = -6;
pub(crate) const RESP_NODE_EXIT: Opcode = -7;

/// A payload that can be cheaply duplicated for fan-out delivery.
///
/// Implemented for any `'static + Send + Clone` type via the blanket impl
/// below; pub/sub publishers only ever see this trait, never the concrete
/// type, mirroring the `interface{}` + type-switch boundary the original
/// event model uses but with a compiler-checked downcast instead.
pub trait Cloneable: Any + Send {
    /// Duplicate this payload behind a fresh box.
    fn clone_boxed(&self) -> Box<dyn Cloneable>;

    /// Access the payload as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> Cloneable for T
where
    T: Any + Send + Clone,
{
    fn clone_boxed(&self) -> Box<dyn Cloneable> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn Cloneable> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

impl fmt::Debug for Box<dyn Cloneable> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Box<dyn Cloneable>")
    }
}

/// Status envelope carried back over a [`CtrlMessage`]'s reply channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEnvelope {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Error detail when `ok` is false.
    pub err: Option<String>,
}

impl StatusEnvelope {
    /// Build a success envelope.
    pub fn ok() -> Self {
        Self { ok: true, err: None }
    }

    /// Build a failure envelope carrying `msg`.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            err: Some(msg.into()),
        }
    }
}

/// A request/response message routed by a [`crate::nodes::dispatch::Controller`]
/// or handled directly by a node's `CTRL_CALL` branch (e.g. pub/sub's `conn`
/// command). `reply` is single-shot: exactly one [`StatusEnvelope`] is ever
/// sent back.
pub struct CtrlMessage {
    /// Positional string arguments, e.g. `["conn", "scope", "name"]`.
    pub m: Vec<String>,
    /// Single-shot reply channel.
    pub reply: oneshot::Sender<StatusEnvelope>,
}

impl fmt::Debug for CtrlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrlMessage").field("m", &self.m).finish()
    }
}

/// The immutable `(cmd, obj)` event moved along links and over the control
/// channel. `obj` is type-erased; the opcode tells a receiver how to
/// downcast it, and a mismatch is a [`crate::error::GraphError::GraphBug`].
pub struct Event {
    cmd: Opcode,
    obj: Box<dyn Any + Send>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("cmd", &self.cmd).finish()
    }
}

impl Event {
    /// Build a raw event. Only used internally and by test nodes that need
    /// full control over the opcode; prefer [`Event::data`] / [`Event::ctrl_call`].
    pub fn new(cmd: Opcode, obj: Box<dyn Any + Send>) -> Self {
        Self { cmd, obj }
    }

    /// Build a `DATA_OUTPUT` event carrying a cloneable payload.
    pub fn data(payload: impl Cloneable) -> Self {
        let boxed: Box<dyn Cloneable> = Box::new(payload);
        Self {
            cmd: DATA_OUTPUT,
            obj: Box::new(boxed),
        }
    }

    /// Build a `DATA_OUTPUT` event from an already-boxed payload. Used for
    /// pub/sub fan-out, where each subscriber needs its own clone of a
    /// payload the publisher no longer owns outright.
    pub(crate) fn data_boxed(payload: Box<dyn Cloneable>) -> Self {
        Self {
            cmd: DATA_OUTPUT,
            obj: Box::new(payload),
        }
    }

    /// Build a `CTRL_CALL` event.
    pub fn ctrl_call(msg: CtrlMessage) -> Self {
        Self {
            cmd: CTRL_CALL,
            obj: Box::new(msg),
        }
    }

    /// The opcode.
    pub fn cmd(&self) -> Opcode {
        self.cmd
    }

    /// Downcast the payload of a `DATA_OUTPUT` event back to `Box<dyn Cloneable>`.
    pub fn into_data(self) -> Option<Box<dyn Cloneable>> {
        if self.cmd != DATA_OUTPUT {
            return None;
        }
        self.obj.downcast::<Box<dyn Cloneable>>().ok().map(|b| *b)
    }

    /// Downcast the payload of a `CTRL_CALL` event back to [`CtrlMessage`].
    pub fn into_ctrl_call(self) -> Option<CtrlMessage> {
        if self.cmd != CTRL_CALL {
            return None;
        }
        self.obj.downcast::<CtrlMessage>().ok().map(|b| *b)
    }

    /// Downcast an arbitrary payload by concrete type, regardless of opcode.
    /// Used by test/demo nodes that define their own user opcodes.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.obj.downcast_ref::<T>()
    }
}
