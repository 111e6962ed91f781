//! Pub/sub fan-out integration tests: node-subscribers and
//! externally-registered channel subscribers receiving the same publish.

mod support;

use std::time::Duration;

use mediagraph_runtime::event::Event;
use mediagraph_runtime::graph::GraphRuntime;
use mediagraph_runtime::nodes::pubsub::PubSubNode;
use support::{ForwardingNode, RecordingNode};
use tokio::sync::mpsc;

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn publish_fans_out_to_node_and_channel_subscribers() {
    let graph = GraphRuntime::new();

    let pubsub_handle = graph
        .add_node(Box::new(PubSubNode::new("s1", "fanout", 4)))
        .await
        .unwrap();
    let publisher_handle = graph
        .add_node(Box::new(ForwardingNode::new("s1", "publisher")))
        .await
        .unwrap();
    let (sub, sub_log) = RecordingNode::new("s1", "subscriber");
    graph.add_node(Box::new(sub)).await.unwrap();

    // publisher -> pubsub (ordinary single outbound link)
    publisher_handle.request_link_up("s1", "fanout").unwrap();
    // pubsub -> subscriber (pubsub's own many-pipe outbound link)
    pubsub_handle.request_link_up("s1", "subscriber").unwrap();
    wait_until(|| {
        sub_log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("link_up:"))
    })
    .await;

    let (chan_tx, mut chan_rx) = mpsc::channel::<Event>(8);
    let bound = pubsub_handle
        .with_node(|node| {
            node.as_pubsub_binder()
                .map(|b| b.bind_channel("out".to_string(), chan_tx))
        })
        .await;
    assert!(matches!(bound, Some(Some(Ok(())))));

    assert!(publisher_handle
        .deliver(0, Event::data("broadcast".to_string()))
        .await);

    wait_until(|| sub_log.lock().unwrap().iter().any(|l| l == "data:broadcast")).await;

    let received = chan_rx
        .recv()
        .await
        .expect("channel subscriber should receive the publish");
    assert_eq!(
        received
            .into_data()
            .unwrap()
            .as_any()
            .downcast_ref::<String>()
            .unwrap(),
        "broadcast"
    );
}

#[tokio::test]
async fn node_subscriber_is_dropped_when_it_exits() {
    let graph = GraphRuntime::new();

    let pubsub_handle = graph
        .add_node(Box::new(PubSubNode::new("s1", "fanout", 4)))
        .await
        .unwrap();
    let publisher_handle = graph
        .add_node(Box::new(ForwardingNode::new("s1", "publisher")))
        .await
        .unwrap();
    let (sub, sub_log) = RecordingNode::new("s1", "subscriber");
    let sub_handle = graph.add_node(Box::new(sub)).await.unwrap();

    publisher_handle.request_link_up("s1", "fanout").unwrap();
    pubsub_handle.request_link_up("s1", "subscriber").unwrap();
    wait_until(|| {
        sub_log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("link_up:"))
    })
    .await;

    sub_handle.request_node_exit().unwrap();
    wait_until(|| sub_log.lock().unwrap().contains(&"exit".to_string())).await;

    // the subscriber is gone; publishing must not block on its stale slot
    assert!(publisher_handle
        .deliver(0, Event::data("after-exit".to_string()))
        .await);
}
