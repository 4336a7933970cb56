use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControllerConfig {
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubernetesConfig {
    /// Path to the kubeconfig file. Falls back to `$KUBECONFIG`, then
    /// `~/.kube/config`, then in-cluster configuration.
    #[serde(default)]
    pub kube_config: Option<PathBuf>,

    /// Annotation namespace; derived keys are `<prefix>/domains`,
    /// `<prefix>/load-balancer-id` and `<prefix>/health-check-endpoint`.
    #[serde(default = "default_annotation_prefix")]
    pub service_annotation_key_prefix: String,

    /// Only services whose `<prefix>/load-balancer-id` annotation equals this
    /// value are published by this instance.
    #[serde(default)]
    pub service_annotation_load_balancer_id: String,

    /// Namespace allow-list. Empty means all namespaces.
    #[serde(default)]
    pub watch_namespaces: Vec<String>,

    /// Namespace deny-list, applied after the allow-list.
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
}

impl KubernetesConfig {
    /// Prefix with any trailing `/` removed, so `my.uri` and `my.uri/`
    /// behave identically.
    pub fn annotation_prefix(&self) -> &str {
        self.service_annotation_key_prefix.trim_end_matches('/')
    }

    /// Effective kubeconfig path: explicit config, then `$KUBECONFIG`,
    /// then `~/.kube/config`. `None` means in-cluster.
    pub fn kube_config_path(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.kube_config {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var("KUBECONFIG") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".kube").join("config"))
            .filter(|path| path.exists())
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kube_config: None,
            service_annotation_key_prefix: default_annotation_prefix(),
            service_annotation_load_balancer_id: String::new(),
            watch_namespaces: Vec::new(),
            exclude_namespaces: Vec::new(),
        }
    }
}

fn default_annotation_prefix() -> String {
    "balanced.io".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoadBalancerConfig {
    /// Periodic full-sync tick period (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Directory receiving one rendered `<domain-with-underscores>.cfg`
    /// per published domain.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Command invoked after any config write, split by shell rules.
    #[serde(default)]
    pub reload_cmd: String,

    /// Template rendered per upstream definition. Available variables:
    /// `Domain`, `HealthCheck`, `Servers[]{Id, IPAddress, Port,
    /// Meta.Hostname, Meta.NodeName}`.
    #[serde(default = "default_template")]
    pub template: String,
}

impl LoadBalancerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            config_dir: default_config_dir(),
            reload_cmd: String::new(),
            template: default_template(),
        }
    }
}

fn default_sync_interval() -> u64 {
    20
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/haproxy/conf.d")
}

fn default_template() -> String {
    concat!(
        "backend {{Domain}}\n",
        "  option httpchk GET {{HealthCheck}}\n",
        "{{#each Servers}}",
        "  server {{Id}} {{IPAddress}}:{{Port}} check\n",
        "{{/each}}",
    )
    .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Publish the host's public IPv4 addresses instead of private ones.
    #[serde(default)]
    pub use_public_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CloudConfig {
    /// Provider variant: `aws` or `mock`.
    #[serde(default = "default_cloud_provider")]
    pub provider: String,

    #[serde(default)]
    pub aws: AwsConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: default_cloud_provider(),
            aws: AwsConfig::default(),
        }
    }
}

fn default_cloud_provider() -> String {
    "aws".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AwsConfig {
    #[serde(default)]
    pub route_53_hosted_zone_id: String,

    #[serde(default = "default_record_type")]
    pub route_53_record_type: String,

    #[serde(default = "default_record_ttl")]
    pub route_53_ttl: i64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            route_53_hosted_zone_id: String::new(),
            route_53_record_type: default_record_type(),
            route_53_ttl: default_record_ttl(),
        }
    }
}

fn default_record_type() -> String {
    "A".to_string()
}

fn default_record_ttl() -> i64 {
    300
}
