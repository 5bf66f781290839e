//! Cluster client facade (spec §4.1). A thin contract over `kube::Api<Node>`
//! with bounded conflict-retry on every mutation, so the reconciler never
//! has to think about resource versions.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use owo_colors::OwoColorize;

use crate::util::Error;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the reconciler needs from the cluster, pulled out as a trait
/// so it can run against an in-memory fake in tests instead of a real
/// apiserver (spec §2: "abstracted so the core is testable against a
/// fake").
pub trait NodeStore: Clone + Send + Sync + 'static {
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>, Error>> + Send;

    fn update_node<F>(&self, name: &str, mutator: F) -> impl Future<Output = Result<Node, Error>> + Send
    where
        F: Fn(&mut Node) + Send + 'static;

    fn record_event(
        &self,
        node: &Node,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> impl Future<Output = ()> + Send;
}

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        ClusterClient { client }
    }

    fn api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<Node, Error> {
        self.update_node(name, move |n| {
            n.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        })
        .await
    }
}

impl NodeStore for ClusterClient {
    /// Returns the current node set. A failure here aborts the tick; the
    /// next tick retries (spec §4.1).
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let list = self.api().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// Fetches the named node, applies `mutator` in place, and submits the
    /// update. On a resource-version conflict the node is re-fetched and
    /// the mutator re-applied, bounded by `MAX_ATTEMPTS`. `mutator` must be
    /// idempotent: it may run more than once against the same starting
    /// state (spec §4.1, P6).
    async fn update_node<F>(&self, name: &str, mutator: F) -> Result<Node, Error>
    where
        F: Fn(&mut Node) + Send + 'static,
    {
        let api = self.api();
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut node = api.get(name).await?;
            mutator(&mut node);
            match api.replace(name, &PostParams::default(), &node).await {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
        // Every branch of the loop above returns; the last attempt's
        // conflict falls through to the catch-all `Err` arm.
        unreachable!("update_node retry loop must return within MAX_ATTEMPTS")
    }

    /// Publishes an event against the node. Best-effort: failures are
    /// logged, never propagated (spec §4.1).
    async fn record_event(&self, node: &Node, type_: EventType, reason: &str, note: &str) {
        let reporter = Reporter::from("reboot-coordinator".to_string());
        let recorder = Recorder::new(self.client.clone(), reporter, node.object_ref(&()));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            eprintln!(
                "{}",
                format!("failed to record event on node {}: {e}", node.name_any()).yellow()
            );
        }
    }
}
