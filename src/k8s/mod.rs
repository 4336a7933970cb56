pub mod service_cache;
pub mod watcher;

pub use service_cache::{KubeServiceFetcher, ServiceCache, ServiceFetcher, ServiceRecord};
pub use watcher::Watcher;

use crate::config::KubernetesConfig;
use crate::error::ControllerError;
use crate::upstream::{sorted_endpoint_ips, Set};
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use std::fmt;

/// `"<name>:<namespace>"` identity of a namespaced resource. Used as the
/// service-cache key and in log messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    pub name: String,
    pub namespace: String,
}

impl NamespacedKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        NamespacedKey {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn for_resource<K: ResourceExt>(resource: &K) -> Self {
        NamespacedKey {
            name: resource.name_any(),
            namespace: resource.namespace().unwrap_or_default(),
        }
    }
}

impl fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.namespace)
    }
}

/// Namespace allow/deny filter. A resource is in scope iff the allow-list is
/// empty or contains its namespace, and the deny-list does not.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    watch: Set<String>,
    exclude: Set<String>,
}

impl NamespaceFilter {
    pub fn new(watch: &[String], exclude: &[String]) -> Self {
        NamespaceFilter {
            watch: watch.iter().cloned().collect(),
            exclude: exclude.iter().cloned().collect(),
        }
    }

    pub fn from_config(cfg: &KubernetesConfig) -> Self {
        Self::new(&cfg.watch_namespaces, &cfg.exclude_namespaces)
    }

    pub fn in_scope(&self, namespace: &str) -> bool {
        (self.watch.is_empty() || self.watch.has(namespace)) && !self.exclude.has(namespace)
    }
}

/// True when an endpoint update is meaningful: the resource version moved
/// AND the sorted IP set differs. Port-only or metadata-only updates that
/// preserve the IP set are dropped here. This is the primary dedupe against
/// apiserver resyncs.
pub fn endpoint_has_changed(old: &Endpoints, new: &Endpoints) -> bool {
    if old.metadata.resource_version == new.metadata.resource_version {
        return false;
    }
    sorted_endpoint_ips(old) != sorted_endpoint_ips(new)
}

/// Build a kube client from the configured kubeconfig path, falling back to
/// `$KUBECONFIG`, `~/.kube/config`, and finally in-cluster inference.
pub async fn client_from_config(cfg: &KubernetesConfig) -> Result<kube::Client, ControllerError> {
    let client_config = match cfg.kube_config_path() {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(&path).map_err(|e| {
                ControllerError::Config(format!(
                    "unable to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .map_err(|e| {
                ControllerError::Config(format!(
                    "invalid kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
        None => kube::Config::infer().await.map_err(|e| {
            ControllerError::Config(format!("unable to infer cluster configuration: {}", e))
        })?,
    };

    kube::Client::try_from(client_config).map_err(ControllerError::Kube)
}
