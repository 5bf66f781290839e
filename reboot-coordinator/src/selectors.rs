//! Pure predicates over a node's annotations and labels (spec §4.2). No
//! I/O; every derived state from spec §3 is computed here from the raw
//! maps so the reconciler never has to re-derive it inline.

use k8s_openapi::api::core::v1::Node;

use crate::protocol::{is_true, Protocol};

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a String> {
    node.metadata.annotations.as_ref().and_then(|a| a.get(key))
}

fn label<'a>(node: &'a Node, key: &str) -> Option<&'a String> {
    node.metadata.labels.as_ref().and_then(|l| l.get(key))
}

/// Wants-reboot: the agent has requested a reboot and nothing excludes
/// the node from consideration yet.
pub fn rebootable(node: &Node, proto: &Protocol) -> bool {
    is_true(annotation(node, &proto.reboot_needed()))
        && !is_true(annotation(node, &proto.ok_to_reboot()))
        && !is_true(annotation(node, &proto.reboot_in_progress()))
        && !is_true(annotation(node, &proto.reboot_paused()))
}

/// Just-rebooted: the controller granted permission, the agent is done
/// rebooting, and it no longer wants one.
pub fn just_rebooted(node: &Node, proto: &Protocol) -> bool {
    is_true(annotation(node, &proto.ok_to_reboot()))
        && !is_true(annotation(node, &proto.reboot_needed()))
        && !is_true(annotation(node, &proto.reboot_in_progress()))
}

/// Still-rebooting: the controller granted permission and the agent
/// still wants a reboot (whether or not it has flipped `reboot-in-progress`
/// yet — see spec §3's Authorized/Rebooting states).
pub fn still_rebooting(node: &Node, proto: &Protocol) -> bool {
    is_true(annotation(node, &proto.ok_to_reboot())) && is_true(annotation(node, &proto.reboot_needed()))
}

pub fn has_label(node: &Node, key: &str) -> bool {
    is_true(label(node, key))
}

pub fn lacks_label(node: &Node, key: &str) -> bool {
    !has_label(node, key)
}

/// Every name in `hook_set` is present on the node and equals "true".
/// An empty hook set is vacuously satisfied.
pub fn has_all_hook_annotations(node: &Node, hook_set: &[String]) -> bool {
    hook_set.iter().all(|name| is_true(annotation(node, name)))
}
