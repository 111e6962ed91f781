//! The node delegate: owns a node's mailboxes, link table and the two
//! cooperating event loops that drive it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use crate::error::{GraphError, Result};
use crate::event::{Event, CTRL_CALL, DATA_OUTPUT};
use crate::graph::GraphHandle;
use crate::node::{Node, NodeConfig, NodeHandle, NodeId};
use crate::nodes::dispatch::Controller;

/// A directed link, identified within its owning (`from`) node by slot index.
/// `to_delegate` is a weak reference so a link never keeps its target alive
/// past the graph's own bookkeeping, and delivery on a link whose target has
/// already been dropped simply fails (I4) instead of panicking.
pub struct DLink {
    pub(crate) from: NodeId,
    pub(crate) to: NodeId,
    to_delegate: Weak<NodeDelegate>,
}

impl DLink {
    pub(crate) fn new(from: NodeId, to: NodeId, to_delegate: &Arc<NodeDelegate>) -> Arc<Self> {
        Arc::new(Self {
            from,
            to,
            to_delegate: Arc::downgrade(to_delegate),
        })
    }
}

/// Internal control-channel message. The `from` delegate's own system loop
/// is the sole writer of that delegate's link slots, so every variant here
/// ends up routed back to exactly the node that should mutate its own table.
pub(crate) enum SystemMsg {
    NodeAdd,
    NodeExit,
    LinkUp {
        state: i32,
        scope: String,
        name: String,
        link: Option<Arc<DLink>>,
    },
    LinkDown {
        link: Arc<DLink>,
    },
}

/// Runtime-owned shell around a [`Node`]. Exclusively owns the node; hands
/// out only non-owning [`NodeHandle`]s.
pub struct NodeDelegate {
    pub(crate) id: NodeId,
    data_tx: mpsc::Sender<Event>,
    data_rx: AsyncMutex<Option<mpsc::Receiver<Event>>>,
    ctrl_tx: mpsc::UnboundedSender<SystemMsg>,
    ctrl_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SystemMsg>>>,
    links: Vec<ArcSwapOption<DLink>>,
    free_slots: SyncMutex<Vec<usize>>,
    exiting: AtomicBool,
    default_pipe_claimed: AtomicBool,
    delivery_timeout: Duration,
    invoke_mutex: AsyncMutex<()>,
    node: AsyncMutex<Box<dyn Node>>,
    graph: GraphHandle,
    controller: SyncMutex<Option<Arc<dyn Controller>>>,
}

impl NodeDelegate {
    pub(crate) fn new(
        id: NodeId,
        node: Box<dyn Node>,
        config: NodeConfig,
        graph: GraphHandle,
    ) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(config.data_channel_size.max(1));
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let max_link = config.max_link.max(1);
        let links = (0..max_link).map(|_| ArcSwapOption::empty()).collect();
        let free_slots = SyncMutex::new((0..max_link).rev().collect());

        Arc::new(Self {
            id,
            data_tx,
            data_rx: AsyncMutex::new(Some(data_rx)),
            ctrl_tx,
            ctrl_rx: AsyncMutex::new(Some(ctrl_rx)),
            links,
            free_slots,
            exiting: AtomicBool::new(false),
            default_pipe_claimed: AtomicBool::new(false),
            delivery_timeout: config.delivery_timeout,
            invoke_mutex: AsyncMutex::new(()),
            node: AsyncMutex::new(node),
            graph,
            controller: SyncMutex::new(None),
        })
    }

    pub(crate) fn max_link(&self) -> usize {
        self.links.len()
    }

    /// Post a message to this node's own control channel. Used both by the
    /// graph mailbox (link grants/denials, node-add/exit) and locally for
    /// the free-slot-exhaustion denial, which never touches the graph at all.
    pub(crate) fn notify(&self, msg: SystemMsg) {
        let _ = self.ctrl_tx.send(msg);
    }

    /// Start the system and user event loops. Must be called exactly once,
    /// after the delegate has been registered with the graph.
    pub(crate) fn spawn_loops(self: &Arc<Self>) {
        let (done_tx, done_rx) = mpsc::channel::<()>(2);

        let sys = Arc::clone(self);
        let done_tx_sys = done_tx.clone();
        tokio::spawn(async move {
            sys.system_event_loop(done_tx_sys).await;
        });

        let usr = Arc::clone(self);
        tokio::spawn(async move {
            usr.user_event_loop(done_rx).await;
        });

        self.notify(SystemMsg::NodeAdd);
    }

    #[instrument(skip(self), fields(node = %self.id))]
    async fn system_event_loop(self: Arc<Self>, done_tx: mpsc::Sender<()>) {
        let mut rx = self
            .ctrl_rx
            .lock()
            .await
            .take()
            .expect("system loop started twice");

        while let Some(msg) = rx.recv().await {
            let is_exit = matches!(msg, SystemMsg::NodeExit);
            self.handle_system_msg(msg).await;
            if is_exit {
                // node-exit is the last control message in the node's lifecycle
                break;
            }
        }
        let _ = done_tx.send(()).await;
    }

    /// Run one callback invocation on a dedicated task, holding the
    /// invocation mutex for its duration (I5), and request node exit if the
    /// callback panics instead of letting the panic vanish silently.
    async fn invoke<F, Fut>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let delegate = Arc::clone(self);
        let joined = tokio::spawn(async move {
            let _guard = delegate.invoke_mutex.lock().await;
            f(delegate).await;
        })
        .await;
        if joined.is_err() {
            error!(node = %self.id, "panic in node callback, requesting exit");
            let _ = self.request_node_exit();
        }
    }

    async fn handle_system_msg(self: &Arc<Self>, msg: SystemMsg) {
        match msg {
            SystemMsg::NodeAdd => {
                self.invoke(|delegate| async move {
                    let handle = NodeHandle::new(&delegate);
                    let mut node = delegate.node.lock().await;
                    node.on_enter(handle).await;
                })
                .await;
            }
            SystemMsg::NodeExit => {
                self.invoke(|delegate| async move {
                    let mut node = delegate.node.lock().await;
                    node.on_exit().await;
                })
                .await;
            }
            SystemMsg::LinkUp { state, scope, name, link } => {
                if state != 0 {
                    self.invoke(move |delegate| async move {
                        let mut node = delegate.node.lock().await;
                        node.on_link_up(-1, &scope, &name).await;
                    })
                    .await;
                    return;
                }
                let link = match link {
                    Some(l) => l,
                    None => {
                        error!("graph bug: link_up state=0 carried no link");
                        return;
                    }
                };
                let new_link_id = {
                    let mut free = self.free_slots.lock();
                    free.pop()
                };
                let Some(new_link_id) = new_link_id else {
                    // graph granted a link but we have no slot to hold it:
                    // can only happen if a node's own free-slot bookkeeping
                    // raced the request it made; treat as denial.
                    warn!("no free link slot available for granted link, denying");
                    self.invoke(move |delegate| async move {
                        let mut node = delegate.node.lock().await;
                        node.on_link_up(-1, &scope, &name).await;
                    })
                    .await;
                    return;
                };
                self.links[new_link_id].store(Some(link));
                debug!(link_id = new_link_id, %scope, %name, "link up granted");
                self.invoke(move |delegate| async move {
                    let mut node = delegate.node.lock().await;
                    node.on_link_up(new_link_id as i64, &scope, &name).await;
                })
                .await;
            }
            SystemMsg::LinkDown { link } => {
                let mut link_id = None;
                for (i, slot) in self.links.iter().enumerate() {
                    if let Some(current) = slot.load_full() {
                        if Arc::ptr_eq(&current, &link) {
                            link_id = Some(i);
                            break;
                        }
                    }
                }
                let Some(link_id) = link_id else {
                    // wrong/stale link passed to node; nothing to tear down
                    return;
                };
                self.links[link_id].store(None);
                self.free_slots.lock().push(link_id);
                let scope = link.to.scope.clone();
                let name = link.to.name.clone();
                debug!(link_id, %scope, %name, "link down");
                self.invoke(move |delegate| async move {
                    let mut node = delegate.node.lock().await;
                    node.on_link_down(link_id as i64, &scope, &name).await;
                })
                .await;
            }
        }
    }

    async fn user_event_loop(self: Arc<Self>, mut done_rx: mpsc::Receiver<()>) {
        let mut rx = self
            .data_rx
            .lock()
            .await
            .take()
            .expect("user loop started twice");

        loop {
            tokio::select! {
                maybe_evt = rx.recv() => {
                    match maybe_evt {
                        Some(evt) => {
                            let delegate = Arc::clone(&self);
                            let joined = tokio::spawn(async move { delegate.handle_user_event(evt).await })
                                .await;
                            if joined.is_err() {
                                error!(node = %self.id, "panic in user callback, requesting exit");
                                let _ = self.request_node_exit();
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = done_rx.recv() => {
                    // graph shutdown: stop reading, buffered events are lost
                    break;
                }
            }
        }
    }

    async fn handle_user_event(&self, evt: Event) {
        let _guard = self.invoke_mutex.lock().await;
        let mut node = self.node.lock().await;
        node.on_event(evt).await;
    }

    /// Nonblocking enqueue on this node's own data mailbox, used by the
    /// delivering peer; falls back to a timed wait on backpressure.
    pub(crate) async fn receive_data(&self, evt: Event, timeout_dur: Duration) -> bool {
        match self.data_tx.try_send(evt) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(evt)) => {
                matches!(timeout(timeout_dur, self.data_tx.send(evt)).await, Ok(Ok(())))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn request_link_up(&self, scope: &str, name: &str) -> Result<()> {
        let has_free_slot = !self.free_slots.lock().is_empty();
        if !has_free_slot {
            // graph never even sees this request: no slot to hold a grant
            self.notify(SystemMsg::LinkUp {
                state: -1,
                scope: scope.to_string(),
                name: name.to_string(),
                link: None,
            });
            return Ok(());
        }
        self.graph.request_link_up(self.id.clone(), scope.to_string(), name.to_string());
        Ok(())
    }

    pub(crate) fn request_link_down(&self, link_id: usize) -> Result<()> {
        if link_id >= self.links.len() {
            return Err(GraphError::InvalidRequest("linkId out of range".into()));
        }
        let link = self.links[link_id]
            .load_full()
            .ok_or_else(|| GraphError::InvalidRequest("linkId refers to an empty slot".into()))?;
        if link.from != self.id {
            return Err(GraphError::InvalidRequest(
                "linkId belongs to a different fromNode".into(),
            ));
        }
        self.graph.request_link_down(link);
        Ok(())
    }

    pub(crate) fn request_node_exit(&self) -> Result<()> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Err(GraphError::AlreadyExiting);
        }
        self.graph.request_node_exit(self.id.clone());
        Ok(())
    }

    pub(crate) async fn deliver(&self, link_id: usize, evt: Event) -> bool {
        self.deliver_with_timeout(link_id, evt, self.delivery_timeout).await
    }

    pub(crate) async fn deliver_with_timeout(
        &self,
        link_id: usize,
        evt: Event,
        timeout_dur: Duration,
    ) -> bool {
        let Some(link_id) = self.links.get(link_id) else {
            return false;
        };
        let Some(link) = link_id.load_full() else {
            return false;
        };
        if link.from != self.id {
            return false;
        }
        let Some(to_delegate) = link.to_delegate.upgrade() else {
            return false;
        };
        // opcode sanity: only user opcodes ever travel over a data link
        debug_assert!(matches!(evt.cmd(), DATA_OUTPUT | CTRL_CALL) || evt.cmd() >= 0);
        to_delegate.receive_data(evt, timeout_dur).await
    }

    pub(crate) fn claim_default_pipe_out(&self) -> Result<()> {
        if self.default_pipe_claimed.swap(true, Ordering::SeqCst) {
            return Err(GraphError::LinkFailed {
                from: self.id.name.clone(),
                to: String::new(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_controller(&self, controller: Arc<dyn Controller>) {
        *self.controller.lock() = Some(controller);
    }

    pub(crate) fn controller(&self) -> Option<Arc<dyn Controller>> {
        self.controller.lock().clone()
    }

    pub(crate) async fn with_node<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&dyn Node) -> R + Send,
        R: Send,
    {
        let _guard = self.invoke_mutex.lock().await;
        let node = self.node.lock().await;
        f(node.as_ref())
    }
}

