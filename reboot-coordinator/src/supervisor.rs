//! Process supervisor (spec §4.7): reads configuration, builds the client,
//! acquires leadership, and runs the reconciler on a fixed tick until a
//! stop signal. Mirrors the teacher's `clusters::reconcile::run` wiring —
//! shutdown signal, readiness file, leadership-guarded task — generalized
//! to this crate's configuration surface.

use std::time::Duration;

use kube::Client;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::election::{self, ElectionConfig};
use crate::protocol::{self, Protocol};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::util::{Error, TICK_INTERVAL};
use crate::window::RebootWindow;
use crate::{cluster::ClusterClient, legacy};

/// Configuration inputs (spec §6). CLI flag parsing itself is out of
/// scope; `clap`'s `env` attribute is only the ambient mechanism for
/// reading these from the environment the way the teacher's `clap`-based
/// argument structs do.
#[derive(clap::Parser, Debug, Clone)]
pub struct Config {
    /// Namespace for the leader-election lease. Mandatory; there is no
    /// sane default for where to contend for leadership (spec §6).
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "BEFORE_REBOOT_ANNOTATIONS", value_delimiter = ',')]
    pub before_reboot_annotations: Vec<String>,

    #[arg(long, env = "AFTER_REBOOT_ANNOTATIONS", value_delimiter = ',')]
    pub after_reboot_annotations: Vec<String>,

    /// Cron expression for the start of the reboot window. Must be set
    /// together with `reboot_window_length` or not at all (spec §4.3).
    #[arg(long, env = "REBOOT_WINDOW_START")]
    pub reboot_window_start: Option<String>,

    /// Length of the reboot window, in seconds.
    #[arg(long, env = "REBOOT_WINDOW_LENGTH")]
    pub reboot_window_length_secs: Option<u64>,

    #[arg(long, env = "MAX_REBOOTING_NODES", default_value_t = 1)]
    pub max_rebooting_nodes: usize,

    #[arg(long, env = "LEASE_LOCK_RESOURCE_NAME", default_value = protocol::DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    #[arg(long, env = "ANNOTATION_PREFIX", default_value = protocol::DEFAULT_PREFIX)]
    pub annotation_prefix: String,

    /// Runs the out-of-scope legacy Container Linux auto-labeler
    /// alongside the reconciler (spec §1, §4.7, §9).
    #[arg(long, env = "AUTO_LABEL_CONTAINER_LINUX")]
    pub auto_label_container_linux: bool,
}

fn holder_id() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("reboot-coordinator-{}", uuid::Uuid::new_v4()))
}

/// Runs the supervisor to completion. Returns only on a clean stop signal;
/// configuration errors, leadership loss, and fatal cluster errors exit
/// the process directly (spec §6 "Exit behavior").
pub async fn run(config: Config) -> Result<(), Error> {
    let namespace = config
        .namespace
        .clone()
        .ok_or_else(|| Error::Config("POD_NAMESPACE must be set".to_string()))?;

    let window = RebootWindow::parse(
        config.reboot_window_start.as_deref(),
        config.reboot_window_length_secs.map(Duration::from_secs),
    )?;

    let client = Client::try_default().await?;
    let protocol = Protocol::new(config.annotation_prefix.clone());

    let reconciler = Reconciler::new(
        ClusterClient::new(client.clone()),
        ReconcilerConfig {
            protocol,
            before_hooks: config.before_reboot_annotations.clone(),
            after_hooks: config.after_reboot_annotations.clone(),
            max_rebooting_nodes: config.max_rebooting_nodes.max(1),
            window,
        },
    );

    #[cfg(feature = "metrics")]
    crate::util::metrics::maybe_spawn_metrics_server();

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        reboot_coordinator_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    reboot_coordinator_common::signal_ready();

    println!("{}", "🌱 starting reboot-coordinator".green());

    let election_config = ElectionConfig {
        namespace,
        lease_name: config.lease_name.clone(),
        holder_id: holder_id(),
    };

    let auto_label = config.auto_label_container_linux;
    let reconciler_for_task = reconciler.clone();
    let shutdown_for_task = shutdown.clone();
    election::run_with_leadership(client, election_config, shutdown.clone(), move || {
        let reconciler = reconciler_for_task.clone();
        let shutdown = shutdown_for_task.clone();
        async move { reconcile_loop(reconciler, shutdown, auto_label).await }
    })
    .await;

    Ok(())
}

async fn reconcile_loop(reconciler: Reconciler, shutdown: CancellationToken, auto_label: bool) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        reconciler.tick().await;
        if auto_label {
            legacy::auto_label_tick().await;
        }
    }
}
