use super::{endpoint_has_changed, NamespaceFilter, NamespacedKey, ServiceCache};
use crate::config::KubernetesConfig;
use crate::k8s::KubeServiceFetcher;
use crate::upstream::{Change, UpstreamDefinition};
use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Event source: watches Endpoints and Services cluster-wide, applies the
/// namespace filter, and translates meaningful endpoint deltas into `Change`
/// messages on the outbound channel.
///
/// Sends block when the reconcile loop is busy; that backpressure is
/// intentional.
pub struct Watcher {
    client: kube::Client,
    cache: Arc<ServiceCache>,
    filter: Arc<NamespaceFilter>,
}

impl Watcher {
    pub fn new(client: kube::Client, cfg: &KubernetesConfig) -> Self {
        let fetcher = Box::new(KubeServiceFetcher::new(client.clone()));
        Watcher {
            client,
            cache: Arc::new(ServiceCache::new(cfg, fetcher)),
            filter: Arc::new(NamespaceFilter::from_config(cfg)),
        }
    }

    /// Spawn one watch task per resource kind. Both exit on shutdown.
    pub fn spawn(&self, tx: mpsc::Sender<Change>, shutdown: Arc<Notify>) {
        tokio::spawn(watch_endpoints(
            self.client.clone(),
            self.cache.clone(),
            self.filter.clone(),
            tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(watch_services(
            self.client.clone(),
            self.cache.clone(),
            self.filter.clone(),
            tx,
            shutdown,
        ));
    }
}

async fn watch_endpoints(
    client: kube::Client,
    cache: Arc<ServiceCache>,
    filter: Arc<NamespaceFilter>,
    tx: mpsc::Sender<Change>,
    shutdown: Arc<Notify>,
) {
    let api: Api<Endpoints> = Api::all(client);
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());

    // Last seen object per endpoint, used to tell adds from updates and to
    // drop updates that keep the IP set intact.
    let mut known: HashMap<NamespacedKey, Endpoints> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.notified() => return,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(watcher::Event::Apply(endpoints)))
            | Ok(Some(watcher::Event::InitApply(endpoints))) => {
                let key = NamespacedKey::for_resource(&endpoints);
                if !filter.in_scope(&key.namespace) {
                    tracing::debug!(
                        "k8s: endpoint event outside watched namespaces, endpoint={}",
                        key
                    );
                    continue;
                }

                metrics::counter!("balanced_endpoint_events_total", "event" => "apply")
                    .increment(1);

                match known.get(&key) {
                    Some(old) if !endpoint_has_changed(old, &endpoints) => {}
                    _ => emit_changes(&cache, &tx, &endpoints).await,
                }
                known.insert(key, endpoints);
            }
            Ok(Some(watcher::Event::Delete(endpoints))) => {
                let key = NamespacedKey::for_resource(&endpoints);
                known.remove(&key);
                if filter.in_scope(&key.namespace) {
                    metrics::counter!("balanced_endpoint_events_total", "event" => "delete")
                        .increment(1);
                    // Backend removal is deferred to natural churn; the
                    // rendered file for the domain is left in place.
                    tracing::info!("k8s: endpoint deleted, endpoint={}", key);
                }
            }
            Ok(Some(watcher::Event::Init)) | Ok(Some(watcher::Event::InitDone)) => {}
            Ok(None) => return,
            Err(e) => tracing::warn!("k8s: endpoint watch error, error={}", e),
        }
    }
}

async fn watch_services(
    client: kube::Client,
    cache: Arc<ServiceCache>,
    filter: Arc<NamespaceFilter>,
    tx: mpsc::Sender<Change>,
    shutdown: Arc<Notify>,
) {
    let api: Api<Service> = Api::all(client.clone());
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());

    let mut seen: HashSet<NamespacedKey> = HashSet::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.notified() => return,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(watcher::Event::Apply(service))) => {
                let key = NamespacedKey::for_resource(&service);
                if !filter.in_scope(&key.namespace) {
                    continue;
                }
                if seen.insert(key.clone()) {
                    continue;
                }

                // An annotation may have been added or changed: drop the
                // cached record and replay the current endpoints so the new
                // mapping takes effect without waiting for endpoint churn.
                cache.invalidate(&key).await;
                let endpoints_api: Api<Endpoints> =
                    Api::namespaced(client.clone(), &key.namespace);
                match endpoints_api.get(&key.name).await {
                    Ok(endpoints) => emit_changes(&cache, &tx, &endpoints).await,
                    Err(e) => tracing::error!(
                        "k8s: unable to retrieve endpoint for service, service={}, error={}",
                        key,
                        e
                    ),
                }
            }
            Ok(Some(watcher::Event::InitApply(service))) => {
                let key = NamespacedKey::for_resource(&service);
                if filter.in_scope(&key.namespace) {
                    seen.insert(key);
                }
            }
            Ok(Some(watcher::Event::Delete(service))) => {
                let key = NamespacedKey::for_resource(&service);
                seen.remove(&key);
                if filter.in_scope(&key.namespace) {
                    cache.invalidate(&key).await;
                }
            }
            Ok(Some(watcher::Event::Init)) | Ok(Some(watcher::Event::InitDone)) => {}
            Ok(None) => return,
            Err(e) => tracing::warn!("k8s: service watch error, error={}", e),
        }
    }
}

/// Fan an endpoint object out to one change per resolved domain. Definitions
/// with no ready servers are dropped so the last-known-good config survives.
async fn emit_changes(cache: &ServiceCache, tx: &mpsc::Sender<Change>, endpoints: &Endpoints) {
    let key = NamespacedKey::for_resource(endpoints);

    let record = match cache.lookup(&key).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            tracing::error!("k8s: service lookup failed, service={}, error={}", key, e);
            return;
        }
    };

    for domain in &record.domains {
        let definition =
            UpstreamDefinition::from_endpoints(domain, &record.health_check, endpoints);
        if definition.servers.is_empty() {
            tracing::warn!(
                "k8s: endpoint changed but has 0 ready addresses, endpoint={}, domain={}",
                key,
                domain
            );
            continue;
        }

        tracing::info!(
            "k8s: endpoint changed, queuing update, endpoint={}, domain={}",
            key,
            domain
        );
        if tx.send(Change::new(definition)).await.is_err() {
            tracing::debug!("k8s: change channel closed, dropping update, endpoint={}", key);
            return;
        }
        metrics::counter!("balanced_changes_queued_total").increment(1);
    }
}
