//! Shared test node fixtures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediagraph_runtime::event::Event;
use mediagraph_runtime::node::{Node, NodeConfig, NodeHandle};

/// Records every payload it receives (as its debug string) plus every
/// link-up/link-down/exit notification, in order, behind a shared lock the
/// test can inspect after the fact.
pub struct RecordingNode {
    scope: String,
    name: String,
    config: NodeConfig,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl RecordingNode {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                scope: scope.into(),
                name: name.into(),
                config: NodeConfig::default(),
                log: Arc::clone(&log),
            },
            log,
        )
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl Node for RecordingNode {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> NodeConfig {
        self.config
    }

    async fn on_enter(&mut self, _handle: NodeHandle) {
        self.log.lock().unwrap().push("enter".to_string());
    }

    async fn on_event(&mut self, evt: Event) {
        let line = match evt.into_data() {
            Some(payload) => match payload.as_any().downcast_ref::<String>() {
                Some(s) => format!("data:{s}"),
                None => "data:<non-string>".to_string(),
            },
            None => "data:<non-data>".to_string(),
        };
        self.log.lock().unwrap().push(line);
    }

    async fn on_link_up(&mut self, link_id: i64, scope: &str, name: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("link_up:{link_id}:{scope}:{name}"));
    }

    async fn on_link_down(&mut self, link_id: i64, scope: &str, name: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("link_down:{link_id}:{scope}:{name}"));
    }

    async fn on_exit(&mut self) {
        self.log.lock().unwrap().push("exit".to_string());
    }
}

/// Forwards every `String` payload it receives to link 0 unmodified. Used to
/// build simple multi-hop pipelines in tests.
pub struct ForwardingNode {
    scope: String,
    name: String,
    handle: Option<NodeHandle>,
}

impl ForwardingNode {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            handle: None,
        }
    }
}

#[async_trait]
impl Node for ForwardingNode {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_enter(&mut self, handle: NodeHandle) {
        self.handle = Some(handle);
    }

    async fn on_event(&mut self, evt: Event) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if let Some(payload) = evt.into_data() {
            if let Some(s) = payload.as_any().downcast_ref::<String>() {
                handle.deliver(0, Event::data(s.clone())).await;
            }
        }
    }

    async fn on_link_up(&mut self, _link_id: i64, _scope: &str, _name: &str) {}
    async fn on_link_down(&mut self, _link_id: i64, _scope: &str, _name: &str) {}
    async fn on_exit(&mut self) {}
}

/// Never drains its data mailbox, so deliveries to it exercise the
/// nonblock-then-timed-wait backpressure path deterministically.
pub struct StalledNode {
    scope: String,
    name: String,
    config: NodeConfig,
}

impl StalledNode {
    pub fn new(scope: impl Into<String>, name: impl Into<String>, data_channel_size: usize) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            config: NodeConfig {
                data_channel_size,
                delivery_timeout: Duration::from_millis(30),
                ..NodeConfig::default()
            },
        }
    }
}

#[async_trait]
impl Node for StalledNode {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> NodeConfig {
        self.config
    }

    async fn on_enter(&mut self, _handle: NodeHandle) {}
    async fn on_event(&mut self, _evt: Event) {
        // simulate a stuck consumer: never returns, so the mailbox fills
        std::future::pending::<()>().await;
    }
    async fn on_link_up(&mut self, _link_id: i64, _scope: &str, _name: &str) {}
    async fn on_link_down(&mut self, _link_id: i64, _scope: &str, _name: &str) {}
    async fn on_exit(&mut self) {}
}
