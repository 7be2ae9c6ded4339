//! Dynamic watches
//!
//! A reconcile pass can depend on an object that does not exist yet (the
//! kubeconfig Secret) or has not been observed yet (the upstream Cluster).
//! Instead of polling, the phase installs a watch keyed to that object's
//! identity; every subsequent change produces a reconcile request for the
//! owning ClusterConnect. Watches are de-duplicated per target identity.

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use passage_common::crd::ClusterConnect;

use crate::cluster_api::cluster_api_resource;

/// Backoff after a watch stream error
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Installer of per-object dynamic watches
pub struct WatchTracker {
    client: Client,
    trigger_tx: mpsc::Sender<ObjectRef<ClusterConnect>>,
    watched: DashMap<String, ()>,
}

impl WatchTracker {
    /// Create a tracker and the trigger stream to feed into the controller's
    /// `reconcile_on`
    pub fn new(client: Client) -> (Arc<Self>, ReceiverStream<ObjectRef<ClusterConnect>>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                client,
                trigger_tx,
                watched: DashMap::new(),
            }),
            ReceiverStream::new(trigger_rx),
        )
    }

    /// Number of installed watches
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Whether no watches are installed
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Watch a Secret by identity, enqueueing `target` on every change
    pub fn watch_secret(&self, namespace: &str, name: &str, target: ObjectRef<ClusterConnect>) {
        let key = format!("secret/{namespace}/{name}");
        if !self.mark_watched(&key) {
            return;
        }
        debug!(%key, "Installing dynamic watch");

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let tx = self.trigger_tx.clone();
        tokio::spawn(run_watch(key, watcher(api, config).boxed(), tx, target));
    }

    /// Watch an upstream Cluster by identity, enqueueing `target` on every
    /// change
    pub fn watch_capi_cluster(
        &self,
        namespace: &str,
        name: &str,
        target: ObjectRef<ClusterConnect>,
    ) {
        let key = format!("cluster/{namespace}/{name}");
        if !self.mark_watched(&key) {
            return;
        }
        debug!(%key, "Installing dynamic watch");

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_api_resource());
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let tx = self.trigger_tx.clone();
        tokio::spawn(run_watch(key, watcher(api, config).boxed(), tx, target));
    }

    /// Returns true when the key was newly marked
    fn mark_watched(&self, key: &str) -> bool {
        self.watched.insert(key.to_string(), ()).is_none()
    }
}

async fn run_watch<K>(
    key: String,
    mut stream: futures::stream::BoxStream<
        'static,
        Result<watcher::Event<K>, watcher::Error>,
    >,
    tx: mpsc::Sender<ObjectRef<ClusterConnect>>,
    target: ObjectRef<ClusterConnect>,
) where
    K: Clone + Send + 'static,
{
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(_))
            | Ok(watcher::Event::InitApply(_))
            | Ok(watcher::Event::Delete(_)) => {
                if tx.send(target.clone()).await.is_err() {
                    // Controller gone; stop watching
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%key, error = %e, "Dynamic watch error, backing off");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
    debug!(%key, "Dynamic watch ended");
}
