use super::CloudProvider;
use crate::error::ControllerError;
use crate::upstream::UpstreamDefinition;
use async_trait::async_trait;
use std::collections::HashMap;

/// No-op provider for dry runs and environments without cloud access.
#[derive(Debug, Default)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        MockProvider
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn resolve_own_addresses(&self) -> Result<Vec<String>, ControllerError> {
        Ok(Vec::new())
    }

    async fn reconcile_security_groups(
        &self,
        definitions: &HashMap<String, UpstreamDefinition>,
        full_sync: bool,
    ) -> Result<(), ControllerError> {
        tracing::debug!(
            "cloud: mock: security-group reconcile, definitions={}, full_sync={}",
            definitions.len(),
            full_sync
        );
        Ok(())
    }

    async fn upsert_record_set(&self, domains: &[String]) -> Result<(), ControllerError> {
        tracing::debug!("cloud: mock: dns upsert, domains={}", domains.len());
        Ok(())
    }
}
