use super::NamespacedKey;
use crate::config::KubernetesConfig;
use crate::error::ControllerError;
use crate::upstream::Set;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use std::collections::HashMap;
use tokio::sync::RwLock;

const DEFAULT_HEALTH_CHECK: &str = "/health";

const DOMAINS_SUFFIX: &str = "domains";
const LOAD_BALANCER_ID_SUFFIX: &str = "load-balancer-id";
const HEALTH_CHECK_SUFFIX: &str = "health-check-endpoint";

/// What the annotations of an opted-in service resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub domains: Vec<String>,
    pub health_check: String,
}

/// Seam over the service GET so the cache can be exercised without a cluster.
#[async_trait]
pub trait ServiceFetcher: Send + Sync {
    async fn get_service(&self, key: &NamespacedKey) -> Result<Service, ControllerError>;
}

pub struct KubeServiceFetcher {
    client: kube::Client,
}

impl KubeServiceFetcher {
    pub fn new(client: kube::Client) -> Self {
        KubeServiceFetcher { client }
    }
}

#[async_trait]
impl ServiceFetcher for KubeServiceFetcher {
    async fn get_service(&self, key: &NamespacedKey) -> Result<Service, ControllerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get(&key.name).await.map_err(ControllerError::Kube)
    }
}

/// Annotation-gated cache mapping `"<name>:<namespace>"` to the domains and
/// health-check path a service publishes under.
///
/// Positive resolutions are cached until `invalidate`; gate misses (wrong
/// load-balancer id, no domains annotation) and fetch errors are never
/// cached, so the next lookup re-resolves. The lock is only held around map
/// access, never across the service fetch, which tolerates a benign
/// duplicate fetch on concurrent miss.
pub struct ServiceCache {
    fetcher: Box<dyn ServiceFetcher>,
    domains_key: String,
    load_balancer_id_key: String,
    health_check_key: String,
    load_balancer_id: String,
    records: RwLock<HashMap<NamespacedKey, ServiceRecord>>,
}

impl ServiceCache {
    pub fn new(cfg: &KubernetesConfig, fetcher: Box<dyn ServiceFetcher>) -> Self {
        let prefix = cfg.annotation_prefix();
        ServiceCache {
            fetcher,
            domains_key: format!("{prefix}/{DOMAINS_SUFFIX}"),
            load_balancer_id_key: format!("{prefix}/{LOAD_BALANCER_ID_SUFFIX}"),
            health_check_key: format!("{prefix}/{HEALTH_CHECK_SUFFIX}"),
            load_balancer_id: cfg.service_annotation_load_balancer_id.clone(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the record for a service. `Ok(None)` means the service is not
    /// ours (ignored, logged at warn); errors mean the service could not be
    /// fetched and the caller may retry later.
    pub async fn lookup(
        &self,
        key: &NamespacedKey,
    ) -> Result<Option<ServiceRecord>, ControllerError> {
        if let Some(record) = self.records.read().await.get(key) {
            return Ok(Some(record.clone()));
        }

        let service = self.fetcher.get_service(key).await?;
        let Some(record) = self.resolve(key, &service) else {
            return Ok(None);
        };

        self.records
            .write()
            .await
            .insert(key.clone(), record.clone());
        Ok(Some(record))
    }

    /// Drop the cached record; the next lookup re-resolves from the cluster.
    pub async fn invalidate(&self, key: &NamespacedKey) {
        if self.records.write().await.remove(key).is_some() {
            tracing::debug!("k8s: service record invalidated, service={}", key);
        }
    }

    fn resolve(&self, key: &NamespacedKey, service: &Service) -> Option<ServiceRecord> {
        let empty = std::collections::BTreeMap::new();
        let annotations = service.metadata.annotations.as_ref().unwrap_or(&empty);

        match annotations.get(&self.load_balancer_id_key) {
            Some(id) if *id == self.load_balancer_id => {}
            other => {
                tracing::warn!(
                    "k8s: service ignored, service={}, load_balancer_id={:?}, expected={}",
                    key,
                    other,
                    self.load_balancer_id,
                );
                return None;
            }
        }

        let domains = annotations
            .get(&self.domains_key)
            .map(|raw| parse_domains(raw))
            .unwrap_or_default();
        if domains.is_empty() {
            tracing::warn!(
                "k8s: service ignored, service={}, reason=annotation {} absent or empty",
                key,
                self.domains_key,
            );
            return None;
        }

        let health_check = annotations
            .get(&self.health_check_key)
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_CHECK.to_string());

        Some(ServiceRecord {
            domains,
            health_check,
        })
    }

    #[cfg(test)]
    async fn is_cached(&self, key: &NamespacedKey) -> bool {
        self.records.read().await.contains_key(key)
    }
}

/// Split the comma-separated annotation value, trimming whitespace and
/// dropping duplicates while keeping first-seen order.
fn parse_domains(raw: &str) -> Vec<String> {
    let mut seen: Set<String> = Set::new();
    let mut domains = Vec::new();

    for part in raw.split(',') {
        let domain = part.trim();
        if domain.is_empty() || seen.has(domain) {
            continue;
        }
        seen.add(domain.to_string());
        domains.push(domain.to_string());
    }

    domains
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeFetcher {
        services: HashMap<NamespacedKey, Service>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceFetcher for FakeFetcher {
        async fn get_service(&self, key: &NamespacedKey) -> Result<Service, ControllerError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.services
                .get(key)
                .cloned()
                .ok_or_else(|| ControllerError::Cloud(format!("service {key} does not exist")))
        }
    }

    fn service(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("bar".to_string()),
                namespace: Some("foo".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cache_with(
        prefix: &str,
        services: Vec<(NamespacedKey, Service)>,
    ) -> (ServiceCache, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cfg = KubernetesConfig {
            service_annotation_key_prefix: prefix.to_string(),
            service_annotation_load_balancer_id: "testing".to_string(),
            ..Default::default()
        };
        let fetcher = FakeFetcher {
            services: services.into_iter().collect(),
            fetches: fetches.clone(),
        };
        (ServiceCache::new(&cfg, Box::new(fetcher)), fetches)
    }

    fn key() -> NamespacedKey {
        NamespacedKey::new("bar", "foo")
    }

    #[tokio::test]
    async fn lookup_resolves_annotated_service() {
        let svc = service(&[
            ("my.uri/load-balancer-id", "testing"),
            ("my.uri/domains", "foobar.com"),
        ]);
        let (cache, _) = cache_with("my.uri", vec![(key(), svc)]);

        let record = cache.lookup(&key()).await.unwrap().unwrap();
        assert_eq!(record.domains, vec!["foobar.com"]);
        assert_eq!(record.health_check, "/health");
    }

    #[tokio::test]
    async fn lookup_honours_health_check_annotation() {
        let svc = service(&[
            ("my.uri/load-balancer-id", "testing"),
            ("my.uri/domains", "foobar.com"),
            ("my.uri/health-check-endpoint", "/status"),
        ]);
        let (cache, _) = cache_with("my.uri", vec![(key(), svc)]);

        let record = cache.lookup(&key()).await.unwrap().unwrap();
        assert_eq!(record.health_check, "/status");
    }

    #[tokio::test]
    async fn lookup_ignores_mismatched_load_balancer_id() {
        let svc = service(&[
            ("my.uri/load-balancer-id", "other"),
            ("my.uri/domains", "foobar.com"),
        ]);
        let (cache, _) = cache_with("my.uri", vec![(key(), svc)]);

        assert!(cache.lookup(&key()).await.unwrap().is_none());
        assert!(!cache.is_cached(&key()).await);
    }

    #[tokio::test]
    async fn lookup_ignores_service_without_domains() {
        let svc = service(&[("my.uri/load-balancer-id", "testing")]);
        let (cache, _) = cache_with("my.uri", vec![(key(), svc)]);

        assert!(cache.lookup(&key()).await.unwrap().is_none());
        assert!(!cache.is_cached(&key()).await);
    }

    #[tokio::test]
    async fn lookup_surfaces_fetch_errors_without_caching() {
        let (cache, _) = cache_with("my.uri", Vec::new());

        assert!(cache.lookup(&key()).await.is_err());
        assert!(!cache.is_cached(&key()).await);
    }

    #[tokio::test]
    async fn positive_lookups_are_cached_until_invalidated() {
        let svc = service(&[
            ("my.uri/load-balancer-id", "testing"),
            ("my.uri/domains", "foobar.com"),
        ]);
        let (cache, fetches) = cache_with("my.uri", vec![(key(), svc)]);

        cache.lookup(&key()).await.unwrap().unwrap();
        cache.lookup(&key()).await.unwrap().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        cache.invalidate(&key()).await;
        cache.lookup(&key()).await.unwrap().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prefix_trailing_slash_is_tolerated() {
        let svc = service(&[
            ("my.uri/load-balancer-id", "testing"),
            ("my.uri/domains", "foobar.com"),
        ]);
        let (cache, _) = cache_with("my.uri/", vec![(key(), svc)]);

        assert!(cache.lookup(&key()).await.unwrap().is_some());
    }

    #[test]
    fn domains_are_split_trimmed_and_deduped() {
        assert_eq!(
            parse_domains(" a.com, b.com ,a.com,, c.com"),
            vec!["a.com", "b.com", "c.com"]
        );
        assert!(parse_domains(" , ").is_empty());
    }
}
