pub mod aws;
pub mod mock;

pub use aws::AwsProvider;
pub use mock::MockProvider;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::upstream::{Set, UpstreamDefinition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Tag marking the one security group per VPC that this controller owns.
pub const MANAGED_TAG: &str = "balanced:managed";

/// Description attached to every ingress rule the controller authorizes.
pub const RULE_DESCRIPTION: &str = "Managed by balanced";

/// Capability set of a cloud provider, selected by configuration at startup.
///
/// Both reconciliations are idempotent: calling them on every tick with no
/// underlying changes performs no writes.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The load-balancer host's own addresses, as published to DNS.
    async fn resolve_own_addresses(&self) -> Result<Vec<String>, ControllerError>;

    /// Diff-and-apply of the managed security group against the ports and
    /// nodes referenced by `definitions`. `full_sync` also revokes rules no
    /// longer required; the delta path only adds.
    async fn reconcile_security_groups(
        &self,
        definitions: &HashMap<String, UpstreamDefinition>,
        full_sync: bool,
    ) -> Result<(), ControllerError>;

    /// Merge the host's addresses into the record sets of `domains`.
    /// Duplicate domains in the batch are tolerated.
    async fn upsert_record_set(&self, domains: &[String]) -> Result<(), ControllerError>;

    /// Invoked once during shutdown, for providers that maintain external
    /// registrations.
    async fn on_exit(&self) {}
}

pub async fn provider_from_config(
    cfg: &ControllerConfig,
) -> Result<Arc<dyn CloudProvider>, ControllerError> {
    match cfg.cloud.provider.as_str() {
        "aws" => {
            let provider = AwsProvider::new(cfg).await?;
            Ok(Arc::new(provider))
        }
        "mock" => {
            tracing::warn!("cloud: using mock provider, no cloud state will be reconciled");
            Ok(Arc::new(MockProvider::new()))
        }
        other => Err(ControllerError::Config(format!(
            "unknown cloud provider: {other}"
        ))),
    }
}

/// Union of the existing record values and our addresses, or `None` when the
/// union adds nothing over what is already published. Sorted for a
/// deterministic change request.
pub(crate) fn merged_records(current: &[String], ours: &[String]) -> Option<Vec<String>> {
    let existing: Set<String> = current.iter().cloned().collect();
    let mut desired = existing.clone();
    desired.extend(ours.iter().cloned());

    if desired.diff(&existing).is_empty() {
        return None;
    }

    let mut values = desired.values();
    values.sort();
    Some(values)
}
