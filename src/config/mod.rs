pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ControllerConfig {
    /// Load configuration from a file. The format is chosen by extension,
    /// `.toml` or `.json`. A missing or unreadable file is a startup error;
    /// the controller never runs on guessed defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("unable to read config file {}: {}", path.display(), e)
        })?;

        let config: ControllerConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };

        config.validate()?;
        tracing::info!("config: loaded, path={}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.annotation_prefix().is_empty() {
            anyhow::bail!("kubernetes.service-annotation-key-prefix cannot be empty");
        }
        if self.kubernetes.service_annotation_load_balancer_id.is_empty() {
            anyhow::bail!("kubernetes.service-annotation-load-balancer-id is required");
        }
        if self.load_balancer.sync_interval == 0 {
            anyhow::bail!("load-balancer.sync-interval must be greater than zero");
        }
        if self.load_balancer.config_dir.as_os_str().is_empty() {
            anyhow::bail!("load-balancer.config-dir cannot be empty");
        }
        if self.load_balancer.reload_cmd.is_empty() {
            anyhow::bail!("load-balancer.reload-cmd is required");
        }
        if self.load_balancer.template.is_empty() {
            anyhow::bail!("load-balancer.template cannot be empty");
        }

        match self.cloud.provider.as_str() {
            "aws" | "mock" => {}
            other => anyhow::bail!("cloud.provider must be \"aws\" or \"mock\", got \"{other}\""),
        }

        if self.dns.enabled && self.cloud.provider == "aws" {
            if self.cloud.aws.route_53_hosted_zone_id.is_empty() {
                anyhow::bail!("cloud.aws.route-53-hosted-zone-id is required when dns is enabled");
            }
            if self.cloud.aws.route_53_record_type.is_empty() {
                anyhow::bail!("cloud.aws.route-53-record-type cannot be empty");
            }
            if self.cloud.aws.route_53_ttl <= 0 {
                anyhow::bail!("cloud.aws.route-53-ttl must be greater than zero");
            }
        }

        Ok(())
    }
}
