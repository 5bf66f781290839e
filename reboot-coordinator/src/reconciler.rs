//! The reconciler: phases A–E of the control loop (spec §4.6). Single
//! writer, single threaded, strictly sequential within a tick. Every
//! decision is re-derived from the node list read at the top of the phase
//! that needs it — there is no in-memory state carried across ticks
//! (spec §9 "Reconvergence over rollback").

use std::future::Future;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use owo_colors::OwoColorize;

use crate::cluster::{ClusterClient, NodeStore};
use crate::protocol::Protocol;
use crate::selectors;
use crate::util::colors::{FG1, FG2};
use crate::util::Error;
use crate::window::RebootWindow;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

#[derive(Clone)]
pub struct ReconcilerConfig {
    pub protocol: Protocol,
    pub before_hooks: Vec<String>,
    pub after_hooks: Vec<String>,
    pub max_rebooting_nodes: usize,
    pub window: RebootWindow,
}

/// Outcome of one phase, kept only for logging/metrics. Nothing reads a
/// previous tick's report — see the module doc comment.
pub struct PhaseOutcome {
    pub name: &'static str,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct TickReport {
    pub phases: Vec<PhaseOutcome>,
}

impl TickReport {
    fn record(&mut self, name: &'static str, result: &Result<(), Error>) {
        self.phases.push(PhaseOutcome {
            name,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
    }
}

#[derive(Clone)]
pub struct Reconciler<C: NodeStore = ClusterClient> {
    client: C,
    config: ReconcilerConfig,
    now: fn() -> DateTime<Utc>,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl<C: NodeStore> Reconciler<C> {
    pub fn new(client: C, config: ReconcilerConfig) -> Self {
        Reconciler {
            client,
            config,
            now: Utc::now,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("reconciler"),
        }
    }

    /// Overrides the clock Phase E consults for the window guard. Production
    /// always uses the wall clock; tests use this to drive a fixed sequence
    /// of instants without sleeping.
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Runs phases A through E once. A phase error aborts only the rest of
    /// that phase; the loop always proceeds to the next phase and, on the
    /// next tick, the next full pass (spec §4.6, §7).
    pub async fn tick(&self) -> TickReport {
        #[cfg(feature = "metrics")]
        self.metrics.ticks_total.inc();

        let mut report = TickReport::default();

        let nodes = match self.client.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                eprintln!("{}", format!("tick aborted: failed to list nodes: {e}").red());
                report.record("list", &Err(e));
                return report;
            }
        };

        let a = self.run_phase("A", "A cleanup", self.phase_a_cleanup(&nodes)).await;
        report.record("A", &a);

        let b = self
            .run_phase("B", "B close-post-reboot", self.phase_b_close_post_reboot())
            .await;
        report.record("B", &b);

        let c = self
            .run_phase("C", "C open-post-reboot", self.phase_c_open_post_reboot(&nodes))
            .await;
        report.record("C", &c);

        let d = self.run_phase("D", "D authorize", self.phase_d_authorize()).await;
        report.record("D", &d);

        let e = self.run_phase("E", "E admit", self.phase_e_admit()).await;
        report.record("E", &e);

        report
    }

    /// Runs one phase, timing it and logging/counting the outcome. The
    /// label/description split keeps the Prometheus label cardinality at
    /// one series per phase while the log line stays descriptive.
    async fn run_phase<Fut>(&self, label: &'static str, description: &'static str, fut: Fut) -> Result<(), Error>
    where
        Fut: Future<Output = Result<(), Error>>,
    {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let result = fut.await;

        #[cfg(feature = "metrics")]
        {
            self.metrics.phase_duration_seconds.observe(start.elapsed().as_secs_f64());
            if result.is_err() {
                self.metrics.tick_errors_total.with_label_values(&[label]).inc();
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = label;

        log_phase(description, &result);
        result
    }

    /// Phase A — Cleanup. A node carrying `before-reboot=true` that is no
    /// longer `rebootable` gets the label and any before-hook residue
    /// stripped (invariant I2).
    async fn phase_a_cleanup(&self, nodes: &[Node]) -> Result<(), Error> {
        let label = self.config.protocol.before_reboot_label();
        for node in nodes.iter().filter(|n| selectors::has_label(n, &label)) {
            if selectors::rebootable(node, &self.config.protocol) {
                continue;
            }
            let name = node.name_any();
            let label = label.clone();
            let before_hooks = self.config.before_hooks.clone();
            let updated = self
                .client
                .update_node(&name, move |n| {
                    if let Some(labels) = n.metadata.labels.as_mut() {
                        labels.remove(&label);
                    }
                    if let Some(annotations) = n.metadata.annotations.as_mut() {
                        for hook in &before_hooks {
                            annotations.remove(hook);
                        }
                    }
                })
                .await?;
            log_node_action(&name, "cleared stale before-reboot gating");
            self.client
                .record_event(
                    &updated,
                    EventType::Normal,
                    "BeforeRebootGateCleared",
                    "node is no longer rebootable; cleared before-reboot gating",
                )
                .await;
        }
        Ok(())
    }

    /// Phase B — Close post-reboot: `checkPhase(after-reboot, afterHooks, false)`.
    async fn phase_b_close_post_reboot(&self) -> Result<(), Error> {
        let after_hooks = self.config.after_hooks.clone();
        self.check_phase(
            self.config.protocol.after_reboot_label(),
            after_hooks,
            false,
            "PostRebootGateClosed",
        )
        .await
    }

    /// Phase C — Open post-reboot: nodes that just finished rebooting but
    /// haven't yet entered post-gating get the after-hook set cleared and
    /// the label set, atomically.
    async fn phase_c_open_post_reboot(&self, nodes: &[Node]) -> Result<(), Error> {
        let after_label = self.config.protocol.after_reboot_label();
        for node in nodes.iter().filter(|n| {
            selectors::just_rebooted(n, &self.config.protocol) && selectors::lacks_label(n, &after_label)
        }) {
            let name = node.name_any();
            let after_label = after_label.clone();
            let after_hooks = self.config.after_hooks.clone();
            let updated = self
                .client
                .update_node(&name, move |n| {
                    if let Some(annotations) = n.metadata.annotations.as_mut() {
                        for hook in &after_hooks {
                            annotations.remove(hook);
                        }
                    }
                    n.metadata
                        .labels
                        .get_or_insert_with(Default::default)
                        .insert(after_label.clone(), "true".to_string());
                })
                .await?;
            log_node_action(&name, "opened post-reboot gating");
            self.client
                .record_event(
                    &updated,
                    EventType::Normal,
                    "PostRebootGateOpened",
                    "node just rebooted; opened post-reboot gating",
                )
                .await;
        }
        Ok(())
    }

    /// Phase D — Authorize reboot: `checkPhase(before-reboot, beforeHooks, true)`.
    async fn phase_d_authorize(&self) -> Result<(), Error> {
        let before_hooks = self.config.before_hooks.clone();
        self.check_phase(
            self.config.protocol.before_reboot_label(),
            before_hooks,
            true,
            "RebootAuthorized",
        )
        .await
    }

    /// Phase E — Admit new reboots under the concurrency budget (invariant I1).
    async fn phase_e_admit(&self) -> Result<(), Error> {
        let now = (self.now)();
        if !self.config.window.inside_now(now) {
            if let Some(next) = self.config.window.next_start(now) {
                println!("{}", format!("reboot window closed; next opens at {next}").color(FG2));
            }
            return Ok(());
        }

        let nodes = self.client.list_nodes().await?;
        let proto = &self.config.protocol;
        let before_label = proto.before_reboot_label();
        let after_label = proto.after_reboot_label();

        let in_flight = count_in_flight(&nodes, proto, &before_label, &after_label);

        #[cfg(feature = "metrics")]
        self.metrics.nodes_in_flight.set(in_flight as i64);

        if in_flight >= self.config.max_rebooting_nodes {
            return Ok(());
        }
        let budget = self.config.max_rebooting_nodes - in_flight;
        let admitted = select_admission_candidates(&nodes, proto, &before_label, budget);

        for name in admitted {
            let before_label = before_label.clone();
            let before_hooks = self.config.before_hooks.clone();
            let updated = self
                .client
                .update_node(&name, move |n| {
                    if let Some(annotations) = n.metadata.annotations.as_mut() {
                        for hook in &before_hooks {
                            annotations.remove(hook);
                        }
                    }
                    n.metadata
                        .labels
                        .get_or_insert_with(Default::default)
                        .insert(before_label.clone(), "true".to_string());
                })
                .await?;
            log_node_action(&name, "admitted for reboot");
            self.client
                .record_event(
                    &updated,
                    EventType::Normal,
                    "RebootAdmitted",
                    "node entered pre-reboot gating under the concurrency budget",
                )
                .await;
        }
        Ok(())
    }

    /// The hook-gated transition algorithm shared by Phase B and Phase D
    /// (spec §4.4): for every node carrying `phase_label=true` whose hook
    /// set is fully satisfied, delete the label and the hook annotations
    /// and set `ok-to-reboot` — all in the same update.
    async fn check_phase(
        &self,
        phase_label: String,
        hook_set: Vec<String>,
        next_ok_to_reboot: bool,
        event_reason: &'static str,
    ) -> Result<(), Error> {
        let nodes = self.client.list_nodes().await?;
        let ok_key = self.config.protocol.ok_to_reboot();

        for node in nodes.iter().filter(|n| selectors::has_label(n, &phase_label)) {
            if !selectors::has_all_hook_annotations(node, &hook_set) {
                continue;
            }
            let name = node.name_any();
            let phase_label = phase_label.clone();
            let hook_set = hook_set.clone();
            let ok_key = ok_key.clone();
            let updated = self
                .client
                .update_node(&name, move |n| {
                    if let Some(labels) = n.metadata.labels.as_mut() {
                        labels.remove(&phase_label);
                    }
                    let annotations = n.metadata.annotations.get_or_insert_with(Default::default);
                    for hook in &hook_set {
                        annotations.remove(hook);
                    }
                    annotations.insert(ok_key.clone(), next_ok_to_reboot.to_string());
                })
                .await?;
            log_node_action(&name, &format!("set ok-to-reboot={next_ok_to_reboot}"));
            self.client
                .record_event(
                    &updated,
                    EventType::Normal,
                    event_reason,
                    &format!("hook set satisfied; set ok-to-reboot={next_ok_to_reboot}"),
                )
                .await;
        }
        Ok(())
    }
}

fn log_phase(name: &str, result: &Result<(), Error>) {
    if let Err(e) = result {
        eprintln!("{}", format!("phase {name} failed: {e}").red());
    }
}

fn log_node_action(name: &str, action: &str) {
    println!("{}{}{}", name.color(FG2), " ACTION: ".color(FG1), action.color(FG2));
}

/// Nodes that count against `maxRebootingNodes` (invariant I1): already
/// authorized, in the post-reboot gate, or actively rebooting.
fn count_in_flight(nodes: &[Node], proto: &Protocol, before_label: &str, after_label: &str) -> usize {
    nodes
        .iter()
        .filter(|n| {
            selectors::still_rebooting(n, proto)
                || selectors::has_label(n, before_label)
                || selectors::has_label(n, after_label)
        })
        .count()
}

/// Picks up to `budget` rebootable nodes not already gated, in a
/// deterministic order (list order from the API is not guaranteed stable
/// across calls, so results are sorted by name; spec §4.6).
fn select_admission_candidates(nodes: &[Node], proto: &Protocol, before_label: &str, budget: usize) -> Vec<String> {
    let mut candidates: Vec<&Node> = nodes
        .iter()
        .filter(|n| selectors::rebootable(n, proto) && selectors::lacks_label(n, before_label))
        .collect();
    candidates.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
    candidates.into_iter().take(budget).map(|n| n.name_any()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node_named(name: &str, annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
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

    #[test]
    fn admission_respects_the_budget_and_picks_deterministically() {
        let proto = Protocol::default();
        let needed = proto.reboot_needed();
        let nodes = vec![
            node_named("c", &[(&needed, "true")], &[]),
            node_named("a", &[(&needed, "true")], &[]),
            node_named("b", &[(&needed, "true")], &[]),
        ];
        let before_label = proto.before_reboot_label();

        let admitted = select_admission_candidates(&nodes, &proto, &before_label, 2);
        assert_eq!(admitted, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn already_gated_nodes_are_not_candidates_again() {
        let proto = Protocol::default();
        let needed = proto.reboot_needed();
        let before_label = proto.before_reboot_label();
        let nodes = vec![node_named("a", &[(&needed, "true")], &[(&before_label, "true")])];

        let admitted = select_admission_candidates(&nodes, &proto, &before_label, 5);
        assert!(admitted.is_empty());
    }

    #[test]
    fn in_flight_counts_authorized_post_gate_and_rebooting_nodes() {
        let proto = Protocol::default();
        let before_label = proto.before_reboot_label();
        let after_label = proto.after_reboot_label();
        let nodes = vec![
            node_named("a", &[], &[(&before_label, "true")]),
            node_named("b", &[], &[(&after_label, "true")]),
            node_named(
                "c",
                &[(&proto.ok_to_reboot(), "true"), (&proto.reboot_needed(), "true")],
                &[],
            ),
            node_named("d", &[], &[]),
        ];

        assert_eq!(count_in_flight(&nodes, &proto, &before_label, &after_label), 3);
    }

    #[test]
    fn zero_budget_admits_nothing() {
        let proto = Protocol::default();
        let needed = proto.reboot_needed();
        let nodes = vec![node_named("a", &[(&needed, "true")], &[])];
        let before_label = proto.before_reboot_label();

        assert!(select_admission_candidates(&nodes, &proto, &before_label, 0).is_empty());
    }
}
