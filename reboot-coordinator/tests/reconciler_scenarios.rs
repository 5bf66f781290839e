//! End-to-end scenarios driving `Reconciler::tick` against an in-memory
//! fake cluster with a controlled clock, instead of a real apiserver.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use reboot_coordinator::cluster::NodeStore;
use reboot_coordinator::protocol::Protocol;
use reboot_coordinator::reconciler::{Reconciler, ReconcilerConfig};
use reboot_coordinator::window::RebootWindow;
use reboot_coordinator::Error;

thread_local! {
    static FAKE_NOW: Cell<DateTime<Utc>> = Cell::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
}

fn fake_now() -> DateTime<Utc> {
    FAKE_NOW.with(|c| c.get())
}

fn set_fake_now(t: DateTime<Utc>) {
    FAKE_NOW.with(|c| c.set(t));
}

#[derive(Clone, Default)]
struct FakeCluster {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

impl FakeCluster {
    fn new(nodes: Vec<Node>) -> Self {
        let map = nodes
            .into_iter()
            .map(|n| (n.metadata.name.clone().expect("node needs a name"), n))
            .collect();
        FakeCluster {
            nodes: Arc::new(Mutex::new(map)),
        }
    }

    fn node(&self, name: &str) -> Node {
        self.nodes.lock().unwrap().get(name).cloned().expect("node must exist")
    }

    fn has_label(&self, name: &str, key: &str) -> bool {
        self.node(name)
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    fn annotation(&self, name: &str, key: &str) -> Option<String> {
        self.node(name).metadata.annotations.as_ref().and_then(|a| a.get(key).cloned())
    }

    fn set_annotation(&self, name: &str, key: &str, value: &str) {
        let mut guard = self.nodes.lock().unwrap();
        let node = guard.get_mut(name).expect("node must exist");
        node.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    fn clear_annotation(&self, name: &str, key: &str) {
        let mut guard = self.nodes.lock().unwrap();
        let node = guard.get_mut(name).expect("node must exist");
        if let Some(annotations) = node.metadata.annotations.as_mut() {
            annotations.remove(key);
        }
    }
}

impl NodeStore for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn update_node<F>(&self, name: &str, mutator: F) -> Result<Node, Error>
    where
        F: Fn(&mut Node) + Send + 'static,
    {
        let mut guard = self.nodes.lock().unwrap();
        let node = guard.get_mut(name).expect("node must exist in fake cluster");
        mutator(node);
        Ok(node.clone())
    }

    async fn record_event(&self, _node: &Node, _type_: EventType, _reason: &str, _note: &str) {}
}

fn node_with(name: &str, annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
    let mut n = Node::default();
    n.metadata.name = Some(name.to_string());
    n.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    n.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    n
}

fn config(proto: &Protocol, before_hooks: Vec<String>, after_hooks: Vec<String>, max: usize, window: RebootWindow) -> ReconcilerConfig {
    ReconcilerConfig {
        protocol: proto.clone(),
        before_hooks,
        after_hooks,
        max_rebooting_nodes: max,
        window,
    }
}

#[tokio::test]
async fn single_node_happy_path() {
    let proto = Protocol::default();
    let needed = proto.reboot_needed();
    let cluster = FakeCluster::new(vec![node_with("n1", &[(&needed, "true")], &[])]);
    let reconciler = Reconciler::new(
        cluster.clone(),
        config(&proto, vec![], vec![], 1, RebootWindow::Unbounded),
    )
    .with_clock(fake_now);

    reconciler.tick().await;
    assert!(cluster.has_label("n1", &proto.before_reboot_label()));
    assert_ne!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));

    reconciler.tick().await;
    assert!(!cluster.has_label("n1", &proto.before_reboot_label()));
    assert_eq!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));

    cluster.set_annotation("n1", &proto.reboot_in_progress(), "true");
    cluster.clear_annotation("n1", &proto.reboot_needed());
    cluster.clear_annotation("n1", &proto.reboot_in_progress());

    reconciler.tick().await;
    assert!(cluster.has_label("n1", &proto.after_reboot_label()));

    reconciler.tick().await;
    assert!(!cluster.has_label("n1", &proto.after_reboot_label()));
    assert_eq!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("false"));
}

#[tokio::test]
async fn two_nodes_bounded_concurrency() {
    let proto = Protocol::default();
    let needed = proto.reboot_needed();
    let cluster = FakeCluster::new(vec![
        node_with("a", &[(&needed, "true")], &[]),
        node_with("b", &[(&needed, "true")], &[]),
    ]);
    let reconciler = Reconciler::new(
        cluster.clone(),
        config(&proto, vec![], vec![], 1, RebootWindow::Unbounded),
    )
    .with_clock(fake_now);

    reconciler.tick().await;
    assert!(cluster.has_label("a", &proto.before_reboot_label()));
    assert!(!cluster.has_label("b", &proto.before_reboot_label()));

    reconciler.tick().await; // a: authorized
    assert!(!cluster.has_label("b", &proto.before_reboot_label()), "b must wait while a is in flight");

    cluster.set_annotation("a", &proto.reboot_in_progress(), "true");
    cluster.clear_annotation("a", &proto.reboot_needed());
    cluster.clear_annotation("a", &proto.reboot_in_progress());

    reconciler.tick().await; // a: post-gating opened
    assert!(!cluster.has_label("b", &proto.before_reboot_label()), "b must wait while a is still in flight");

    reconciler.tick().await; // a: returns to idle; b admitted in the same tick
    assert_eq!(cluster.annotation("a", &proto.ok_to_reboot()).as_deref(), Some("false"));
    assert!(cluster.has_label("b", &proto.before_reboot_label()), "b acquires the gate only once a is idle");
}

#[tokio::test]
async fn paused_node_is_never_admitted() {
    let proto = Protocol::default();
    let needed = proto.reboot_needed();
    let paused = proto.reboot_paused();
    let cluster = FakeCluster::new(vec![node_with("n1", &[(&needed, "true"), (&paused, "true")], &[])]);
    let reconciler = Reconciler::new(
        cluster.clone(),
        config(&proto, vec![], vec![], 1, RebootWindow::Unbounded),
    )
    .with_clock(fake_now);

    for _ in 0..3 {
        reconciler.tick().await;
    }

    assert!(!cluster.has_label("n1", &proto.before_reboot_label()));
    assert_ne!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));
}

#[tokio::test]
async fn hook_gating_blocks_authorization_until_satisfied() {
    let proto = Protocol::default();
    let needed = proto.reboot_needed();
    let hook = "example.com/ready".to_string();
    let cluster = FakeCluster::new(vec![node_with("n1", &[(&needed, "true")], &[])]);
    let reconciler = Reconciler::new(
        cluster.clone(),
        config(&proto, vec![hook.clone()], vec![], 1, RebootWindow::Unbounded),
    )
    .with_clock(fake_now);

    reconciler.tick().await; // Pre-gating entered
    assert!(cluster.has_label("n1", &proto.before_reboot_label()));

    reconciler.tick().await; // hook missing: Phase D is a no-op
    assert!(cluster.has_label("n1", &proto.before_reboot_label()));
    assert_ne!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));

    cluster.set_annotation("n1", &hook, "false");
    reconciler.tick().await; // hook explicitly false: still a no-op
    assert!(cluster.has_label("n1", &proto.before_reboot_label()));

    cluster.set_annotation("n1", &hook, "true");
    reconciler.tick().await; // hook satisfied: authorized
    assert!(!cluster.has_label("n1", &proto.before_reboot_label()));
    assert_eq!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));
}

#[tokio::test]
async fn window_guard_blocks_admission_outside_the_window() {
    let proto = Protocol::default();
    let needed = proto.reboot_needed();
    let cluster = FakeCluster::new(vec![node_with("n1", &[(&needed, "true")], &[])]);
    // Fires daily at 02:00:00 UTC for one hour.
    let window = RebootWindow::parse(Some("0 0 2 * * *"), Some(std::time::Duration::from_secs(3600))).unwrap();
    let reconciler = Reconciler::new(cluster.clone(), config(&proto, vec![], vec![], 1, window)).with_clock(fake_now);

    set_fake_now(Utc.with_ymd_and_hms(2024, 3, 1, 1, 59, 0).unwrap());
    reconciler.tick().await;
    assert!(!cluster.has_label("n1", &proto.before_reboot_label()), "window not open yet");

    set_fake_now(Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap());
    reconciler.tick().await;
    assert!(cluster.has_label("n1", &proto.before_reboot_label()), "window just opened");
}

#[tokio::test]
async fn retraction_clears_pre_gating_without_authorizing() {
    let proto = Protocol::default();
    let before_label = proto.before_reboot_label();
    let hook = "example.com/ready".to_string();
    let cluster = FakeCluster::new(vec![node_with(
        "n1",
        &[(&proto.reboot_needed(), "true"), (&hook, "true")],
        &[(&before_label, "true")],
    )]);
    let reconciler = Reconciler::new(
        cluster.clone(),
        config(&proto, vec![hook.clone()], vec![], 1, RebootWindow::Unbounded),
    )
    .with_clock(fake_now);

    cluster.clear_annotation("n1", &proto.reboot_needed());

    reconciler.tick().await;
    assert!(!cluster.has_label("n1", &before_label));
    assert!(cluster.annotation("n1", &hook).is_none(), "residual before-hook annotation must be cleared");
    assert_ne!(cluster.annotation("n1", &proto.ok_to_reboot()).as_deref(), Some("true"));
}
