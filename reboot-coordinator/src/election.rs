//! Leader election (spec §4.5). Wraps a named `Lease` so that at most one
//! replica drives the reconciler at a time. Modeled on the teacher's
//! `clusters::reconcile::run` / `shards::reconcile::run` pattern: a
//! background acquire-or-renew tick owns the reconciler task directly and
//! aborts it the moment leadership looks uncertain. Losing leadership is
//! fatal to the process (spec §4.5, §9 "Leadership as fatal signal").

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// LeaseDuration (spec §4.5).
pub const LEASE_TTL: Duration = Duration::from_secs(90);
/// RetryPeriod (spec §4.5): how often we attempt to acquire/renew.
pub const RETRY_PERIOD: Duration = Duration::from_secs(30);
/// RenewDeadline (spec §4.5): the budget given to a single renew call.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(60);

pub struct ElectionConfig {
    pub namespace: String,
    pub lease_name: String,
    pub holder_id: String,
}

/// Runs `make_task` only while this replica holds the lease, exactly once
/// per acquisition. `make_task` is called fresh every time leadership is
/// (re-)acquired and must return a task whose `JoinHandle` we own; we abort
/// it the instant leadership looks lost. On any renewal error, or an
/// observed transition out of `Acquired`, the process exits non-zero — the
/// orchestrator restarts it and it re-contends (spec §4.5, §9). Every
/// transition is also recorded as an event against the `Lease` object
/// itself (spec §9 "Events: emitted against the lease object for
/// leader-election transitions").
pub async fn run_with_leadership<F, Fut>(
    client: Client,
    config: ElectionConfig,
    shutdown: CancellationToken,
    make_task: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let lease_ref = lease_object_ref(&config.namespace, &config.lease_name);
    let event_client = client.clone();

    let leadership = LeaseLock::new(
        client,
        &config.namespace,
        LeaseLockParams {
            holder_id: config.holder_id,
            lease_name: config.lease_name,
            lease_ttl: LEASE_TTL,
        },
    );

    let mut task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(RETRY_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(t) = task.take() {
                    t.abort();
                    t.await.ok();
                }
                return;
            }
            _ = tick.tick() => {}
        }

        let result = tokio::time::timeout(RENEW_DEADLINE, leadership.try_acquire_or_renew()).await;
        let lease = match result {
            Ok(Ok(l)) => l,
            Ok(Err(e)) => {
                eprintln!("{}", format!("leader election renew/acquire failed: {e}").red());
                if let Some(t) = task.take() {
                    t.abort();
                }
                eprintln!("{}", "leadership lost or unconfirmed; exiting".red());
                record_lease_event(
                    &event_client,
                    &lease_ref,
                    EventType::Warning,
                    "LeaderElectionFailed",
                    &format!("renew/acquire failed: {e}"),
                )
                .await;
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("{}", "leader election renew timed out; exiting".red());
                if let Some(t) = task.take() {
                    t.abort();
                }
                record_lease_event(
                    &event_client,
                    &lease_ref,
                    EventType::Warning,
                    "LeaderElectionFailed",
                    "renew/acquire timed out",
                )
                .await;
                std::process::exit(1);
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if task.is_none() {
                println!("{}", "👑 acquired leadership; starting reconciler".green());
                record_lease_event(
                    &event_client,
                    &lease_ref,
                    EventType::Normal,
                    "LeadershipAcquired",
                    "this replica is now the active reconciler",
                )
                .await;
                task = Some(tokio::spawn(make_task()));
            }
        } else if let Some(t) = task.take() {
            eprintln!("{}", "lost leadership; exiting".red());
            record_lease_event(
                &event_client,
                &lease_ref,
                EventType::Warning,
                "LeadershipLost",
                "lease acquired by another replica or otherwise lost",
            )
            .await;
            t.abort();
            std::process::exit(1);
        }
    }
}

fn lease_object_ref(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("coordination.k8s.io/v1".to_string()),
        kind: Some("Lease".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Publishes an event against the lease object. Best-effort: failures are
/// logged, never propagated.
async fn record_lease_event(client: &Client, lease_ref: &ObjectReference, type_: EventType, reason: &str, note: &str) {
    let reporter = Reporter::from("reboot-coordinator".to_string());
    let recorder = Recorder::new(client.clone(), reporter, lease_ref.clone());
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: reason.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        eprintln!("{}", format!("failed to record lease event: {e}").yellow());
    }
}
