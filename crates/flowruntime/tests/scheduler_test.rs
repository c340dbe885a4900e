use flowcore::{ExecutionMode, NodeSpec, Workflow, WorkflowError};
use flowruntime::{insert_manager_nodes, DependencyGraph, ManagerNode, PlanNode};
use std::collections::HashMap;

fn graph(nodes: Vec<PlanNode>) -> DependencyGraph {
    DependencyGraph::new(nodes).expect("valid graph")
}

fn node(id: &str, deps: &[&str]) -> PlanNode {
    PlanNode::new(id, "worker").with_dependencies(deps.iter().copied())
}

fn position(order: &[String]) -> HashMap<&str, usize> {
    order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect()
}

#[test]
fn test_topological_order_respects_every_edge() {
    let nodes = vec![
        node("report", &["join"]),
        node("join", &["left", "right"]),
        node("left", &["source"]),
        node("right", &["source"]),
        node("source", &[]),
    ];
    let g = graph(nodes.clone());
    let order = g.topological_order().unwrap();
    assert_eq!(order.len(), nodes.len());

    let pos = position(&order);
    for n in &nodes {
        for dep in &n.dependencies {
            assert!(pos[dep.as_str()] < pos[n.id.as_str()], "{} must precede {}", dep, n.id);
        }
    }
}

#[test]
fn test_topological_order_is_dependency_first_in_declaration_order() {
    let g = graph(vec![node("c", &["b"]), node("b", &["a"]), node("a", &[]), node("d", &[])]);
    assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_cycle_is_detected_not_looped() {
    let g = graph(vec![node("a", &[]), node("b", &["a", "c"]), node("c", &["b"])]);

    match g.topological_order() {
        Err(WorkflowError::CycleDetected { nodes }) => {
            assert!(nodes.contains(&"b".to_string()));
            assert!(nodes.contains(&"c".to_string()));
            assert!(!nodes.contains(&"a".to_string()));
        }
        other => panic!("expected cycle, got {:?}", other),
    }

    match g.parallel_groups() {
        Err(WorkflowError::CycleDetected { nodes }) => assert_eq!(nodes, vec!["b", "c"]),
        other => panic!("expected cycle, got {:?}", other),
    }

    assert!(g.plan(ExecutionMode::Sequential).is_err());
    assert!(g.plan(ExecutionMode::Parallel).is_err());
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let g = graph(vec![node("loop", &["loop"])]);
    assert!(matches!(
        g.topological_order(),
        Err(WorkflowError::CycleDetected { .. })
    ));
}

#[test]
fn test_parallel_groups_for_fan_in() {
    let g = graph(vec![node("d", &[]), node("e", &[]), node("f", &["d", "e"])]);
    assert_eq!(
        g.parallel_groups().unwrap(),
        vec![vec!["d".to_string(), "e".to_string()], vec!["f".to_string()]]
    );
}

#[test]
fn test_groups_place_dependencies_strictly_earlier() {
    let nodes = vec![
        node("a", &[]),
        node("b", &["a"]),
        node("c", &[]),
        node("d", &["b", "c"]),
        node("e", &["a"]),
        node("f", &["d", "e"]),
    ];
    let g = graph(nodes.clone());
    let groups = g.parallel_groups().unwrap();

    let mut level = HashMap::new();
    for (i, group) in groups.iter().enumerate() {
        for id in group {
            assert!(level.insert(id.clone(), i).is_none(), "{} appears twice", id);
        }
    }
    assert_eq!(level.len(), nodes.len());
    for n in &nodes {
        for dep in &n.dependencies {
            assert!(level[dep] < level[&n.id]);
        }
    }
}

#[test]
fn test_frontier_tie_break_priority_then_declaration() {
    let g = graph(vec![
        node("low", &[]),
        node("first", &[]).with_priority(5),
        node("second", &[]).with_priority(5),
        node("urgent", &[]).with_priority(9),
    ]);
    assert_eq!(
        g.parallel_groups().unwrap(),
        vec![vec!["urgent", "first", "second", "low"]]
    );
}

#[test]
fn test_dangling_and_duplicate_nodes_are_rejected() {
    let err = DependencyGraph::new(vec![node("a", &["ghost"])]).unwrap_err();
    assert_eq!(
        err,
        WorkflowError::DanglingDependency {
            node: "a".to_string(),
            dependency: "ghost".to_string()
        }
    );

    let err = DependencyGraph::new(vec![node("a", &[]), node("a", &[])]).unwrap_err();
    assert_eq!(err, WorkflowError::DuplicateNode("a".to_string()));
}

#[test]
fn test_plan_entries_carry_order_and_dependencies() {
    let g = graph(vec![
        node("fetch", &[]).with_estimate(1_000),
        node("parse", &["fetch"]),
    ]);

    let plan = g.plan(ExecutionMode::Sequential).unwrap();
    assert_eq!(plan.groups.len(), 2);
    let entries: Vec<_> = plan.entries().collect();
    assert_eq!(entries[0].node_id, "fetch");
    assert_eq!(entries[0].order, 0);
    assert_eq!(entries[0].estimated_ms, 1_000);
    assert_eq!(entries[1].dependencies, vec!["fetch"]);
    assert_eq!(entries[1].order, 1);
    assert!(!entries[1].is_manager);
}

#[test]
fn test_graph_from_workflow_connections() {
    let mut workflow = Workflow::new("etl");
    workflow.add_node(NodeSpec::new("load", "code"));
    workflow.add_node(NodeSpec::new("extract", "code"));
    workflow.add_node(NodeSpec::new("transform", "code"));
    workflow.connect("extract", "transform");
    workflow.connect_ports("transform", "rows", "load", "rows");
    workflow.connect_ports("transform", "count", "load", "count");

    let g = DependencyGraph::from_workflow(&workflow).unwrap();
    assert_eq!(g.dependencies("load"), vec!["transform"]);
    assert_eq!(g.dependents("extract"), vec!["transform"]);
    assert_eq!(
        g.downstream("extract"),
        ["transform", "load"].iter().map(|s| s.to_string()).collect()
    );
    assert_eq!(
        g.topological_order().unwrap(),
        vec!["extract", "transform", "load"]
    );
}

#[test]
fn test_manager_nodes_are_inserted_periodically() {
    let g = graph((0..5).map(|i| node(&format!("w{}", i), &[])).collect());
    let plan = g.plan(ExecutionMode::Sequential).unwrap();
    let managers = vec![
        ManagerNode::infer("nightly-supervisor"),
        ManagerNode::infer("ops"),
    ];

    let entries = insert_manager_nodes(plan.entries().cloned().collect(), &managers, 2);
    let ids: Vec<&str> = entries.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["w0", "w1", "nightly-supervisor", "ops", "w2", "w3", "nightly-supervisor", "ops", "w4"]
    );
    assert!(entries.iter().enumerate().all(|(i, e)| e.order == i));
    assert_eq!(entries[2].node_type, "supervisor");
    assert_eq!(entries[3].node_type, "manager");
    assert!(entries[3].is_manager);

    let unchanged = insert_manager_nodes(plan.entries().cloned().collect(), &managers, 0);
    assert_eq!(unchanged.len(), 5);
}
