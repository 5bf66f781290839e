//! The annotation/label vocabulary shared with the node agent and hook
//! operators (spec §6). Every key is namespaced under a configurable
//! domain prefix so a cluster can run this coordinator alongside another
//! instance of the node agent under a different domain without collision.

/// Domain prefix used by the reference node agent.
pub const DEFAULT_PREFIX: &str = "flatcar-linux-update-operator.coreos.com";

/// Default name of the `Lease` object used for leader election.
pub const DEFAULT_LEASE_NAME: &str = "flatcar-linux-update-operator-lock";

/// All annotation/label keys this coordinator reads or writes, namespaced
/// under a single prefix.
#[derive(Clone, Debug)]
pub struct Protocol {
    prefix: String,
}

impl Protocol {
    pub fn new(prefix: impl Into<String>) -> Self {
        Protocol { prefix: prefix.into() }
    }

    /// agent-owned: the agent is requesting a reboot.
    pub fn reboot_needed(&self) -> String {
        format!("{}/reboot-needed", self.prefix)
    }

    /// agent-owned: a reboot is actively underway.
    pub fn reboot_in_progress(&self) -> String {
        format!("{}/reboot-in-progress", self.prefix)
    }

    /// operator-owned: holds the node out of consideration entirely.
    pub fn reboot_paused(&self) -> String {
        format!("{}/reboot-paused", self.prefix)
    }

    /// controller-owned: permission / completion flip the agent watches.
    pub fn ok_to_reboot(&self) -> String {
        format!("{}/ok-to-reboot", self.prefix)
    }

    /// controller-owned label: node is in the pre-reboot gating phase.
    pub fn before_reboot_label(&self) -> String {
        format!("{}/before-reboot", self.prefix)
    }

    /// controller-owned label: node is in the post-reboot gating phase.
    pub fn after_reboot_label(&self) -> String {
        format!("{}/after-reboot", self.prefix)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::new(DEFAULT_PREFIX)
    }
}

/// Compares a boolean annotation against the literal string the protocol
/// uses for "true". Any other value, including "false" or absence, counts
/// as not-true (spec §6).
pub fn is_true(value: Option<&String>) -> bool {
    value.map(|v| v == "true").unwrap_or(false)
}
