// crates/flowcore/tests/event_bus_test.rs

use flowcore::{
    EventBus, ExecutionEvent, ExecutionInstance, ExecutionMode, LogEntry, LogLevel, NodeSpec,
    Payload, Topic, Workflow,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn sample_instance(workflow_id: &str) -> ExecutionInstance {
    let mut workflow = Workflow::new("bus test").with_id(workflow_id);
    workflow.add_node(NodeSpec::new("a", "debug.log"));
    ExecutionInstance::new(&workflow, Payload::new(), ExecutionMode::Sequential)
}

fn log_event(instance: &ExecutionInstance, node_id: &str, message: &str) -> ExecutionEvent {
    ExecutionEvent::Log {
        execution_id: instance.id,
        workflow_id: instance.workflow_id.clone(),
        entry: LogEntry::new(LogLevel::Info, message).with_node(node_id),
    }
}

#[tokio::test]
async fn test_workflow_subscriber_receives_events() {
    init_tracing();
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-1");

    let mut sub = bus.connect();
    assert!(bus.subscribe(sub.observer_id, Topic::Workflow("wf-1".to_string())));

    bus.emit(ExecutionEvent::ExecutionUpdate {
        execution: instance.clone(),
    });

    let event = sub.recv().await.expect("event");
    assert_eq!(event.kind(), "execution_update");
    assert_eq!(event.execution_id(), instance.id);
}

#[tokio::test]
async fn test_overlapping_topics_deliver_once() {
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-2");

    let mut sub = bus.connect();
    bus.subscribe(sub.observer_id, Topic::Workflow("wf-2".to_string()));
    bus.subscribe(sub.observer_id, Topic::Node("a".to_string()));
    bus.subscribe(sub.observer_id, Topic::Execution(instance.id));

    let delivered = bus.emit(log_event(&instance, "a", "hello"));
    assert_eq!(delivered, 1);

    assert!(sub.try_recv().is_some());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_unrelated_topic_gets_nothing() {
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-3");

    let mut sub = bus.connect();
    bus.subscribe(sub.observer_id, Topic::Workflow("other".to_string()));

    assert_eq!(bus.emit(log_event(&instance, "a", "hello")), 0);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_disconnect_drops_all_subscriptions() {
    let bus = EventBus::new(16);
    let sub = bus.connect();
    let wf = Topic::Workflow("wf-4".to_string());
    let node = Topic::Node("a".to_string());

    bus.subscribe(sub.observer_id, wf.clone());
    bus.subscribe(sub.observer_id, node.clone());
    assert_eq!(bus.subscriber_count(&wf), 1);

    assert_eq!(bus.disconnect(sub.observer_id), 2);
    assert_eq!(bus.subscriber_count(&wf), 0);
    assert_eq!(bus.subscriber_count(&node), 0);
    assert_eq!(bus.observer_count(), 0);

    // Unknown observers cannot subscribe
    assert!(!bus.subscribe(sub.observer_id, wf));
}

#[tokio::test]
async fn test_closed_observer_does_not_block_others() {
    init_tracing();
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-5");
    let topic = Topic::Workflow("wf-5".to_string());

    let closed = bus.connect();
    bus.subscribe(closed.observer_id, topic.clone());
    let mut open = bus.connect();
    bus.subscribe(open.observer_id, topic);
    drop(closed);

    assert_eq!(bus.emit(log_event(&instance, "a", "still delivered")), 1);
    assert!(open.recv().await.is_some());
}

#[tokio::test]
async fn test_events_keep_production_order() {
    let bus = EventBus::new(256);
    let instance = sample_instance("wf-6");

    let mut sub = bus.connect();
    bus.subscribe(sub.observer_id, Topic::Execution(instance.id));

    for i in 0..100 {
        bus.emit(log_event(&instance, "a", &format!("{}", i)));
    }

    for i in 0..100 {
        match sub.recv().await {
            Some(ExecutionEvent::Log { entry, .. }) => assert_eq!(entry.message, i.to_string()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_unsubscribe_single_topic() {
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-7");
    let mut sub = bus.connect();
    let topic = Topic::Workflow("wf-7".to_string());

    bus.subscribe(sub.observer_id, topic.clone());
    assert!(bus.unsubscribe(sub.observer_id, &topic));
    assert!(!bus.unsubscribe(sub.observer_id, &topic));

    bus.emit(log_event(&instance, "a", "missed"));
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_firehose_sees_everything() {
    let bus = EventBus::new(16);
    let instance = sample_instance("wf-8");
    let mut all = bus.subscribe_all();

    bus.emit(log_event(&instance, "a", "one"));
    let event = all.recv().await.expect("firehose event");
    assert_eq!(event.node_id(), Some("a"));
}

#[test]
fn test_event_wire_format() {
    let instance = sample_instance("wf-9");
    let json = serde_json::to_value(log_event(&instance, "a", "hi")).unwrap();
    assert_eq!(json["type"], "log");
    assert_eq!(json["entry"]["level"], "info");
    assert_eq!(json["entry"]["node_id"], "a");

    let update = serde_json::to_value(ExecutionEvent::ExecutionUpdate { execution: instance }).unwrap();
    assert_eq!(update["type"], "execution_update");
    assert_eq!(update["execution"]["status"], "pending");
    assert_eq!(update["execution"]["node_executions"]["a"]["status"], "waiting");
}
