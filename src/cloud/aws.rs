use super::{merged_records, CloudProvider, MANAGED_TAG, RULE_DESCRIPTION};
use crate::config::{AwsConfig, ControllerConfig, DnsConfig};
use crate::error::ControllerError;
use crate::upstream::{Set, UpstreamDefinition};
use async_trait::async_trait;
use aws_sdk_ec2::types as ec2;
use aws_sdk_route53::types as r53;
use std::collections::HashMap;

const MANAGED_GROUP_NAME: &str = "balanced-ingress";
const MANAGED_GROUP_DESCRIPTION: &str = "Ingress rules managed by balanced";

/// AWS variant of the provider capability set.
///
/// Credentials come from the SDK's default chain (env, shared config,
/// instance profile); the region and the host's identity come from the
/// instance metadata service.
pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    route53: aws_sdk_route53::Client,
    dns: DnsConfig,
    aws: AwsConfig,
    instance_id: String,
}

impl AwsProvider {
    pub async fn new(cfg: &ControllerConfig) -> Result<Self, ControllerError> {
        let imds = aws_config::imds::Client::builder().build();
        let instance_id: String = imds
            .get("/latest/meta-data/instance-id")
            .await
            .map_err(|e| {
                ControllerError::Cloud(format!("retrieving instance identity failed: {e}"))
            })?
            .into();

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        tracing::info!("cloud: aws: provider ready, instance={}", instance_id);

        Ok(AwsProvider {
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            route53: aws_sdk_route53::Client::new(&sdk_config),
            dns: cfg.dns.clone(),
            aws: cfg.cloud.aws.clone(),
            instance_id,
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<ec2::Instance, ControllerError> {
        let resp = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ControllerError::Cloud(format!("describing instances failed: {e}")))?;

        resp.reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .cloned()
            .ok_or_else(|| ControllerError::Cloud(format!("instance {instance_id} not found")))
    }

    /// Resolve node names to running instances via their private DNS names.
    async fn instances_by_private_dns(
        &self,
        nodes: &Set<String>,
    ) -> Result<Vec<ec2::Instance>, ControllerError> {
        let resp = self
            .ec2
            .describe_instances()
            .filters(
                ec2::Filter::builder()
                    .name("private-dns-name")
                    .set_values(Some(nodes.values()))
                    .build(),
            )
            .filters(
                ec2::Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ControllerError::Cloud(format!("describing instances failed: {e}")))?;

        Ok(resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .cloned()
            .collect())
    }

    /// Find the managed group in `vpc_id`, creating it if absent. More than
    /// one tagged group is a configuration error that is surfaced, not healed.
    async fn ensure_managed_group(&self, vpc_id: &str) -> Result<String, ControllerError> {
        let resp = self
            .ec2
            .describe_security_groups()
            .filters(
                ec2::Filter::builder()
                    .name("tag-key")
                    .values(MANAGED_TAG)
                    .build(),
            )
            .filters(ec2::Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(|e| {
                ControllerError::Cloud(format!("describing security groups failed: {e}"))
            })?;

        let groups = resp.security_groups();
        match groups.len() {
            0 => self.create_managed_group(vpc_id).await,
            1 => groups[0]
                .group_id()
                .map(str::to_string)
                .ok_or_else(|| ControllerError::Cloud("security group without id".to_string())),
            n => Err(ControllerError::CloudInvariant(format!(
                "found {n} security groups tagged {MANAGED_TAG} in vpc {vpc_id}, expected at most one"
            ))),
        }
    }

    async fn create_managed_group(&self, vpc_id: &str) -> Result<String, ControllerError> {
        let resp = self
            .ec2
            .create_security_group()
            .group_name(MANAGED_GROUP_NAME)
            .description(MANAGED_GROUP_DESCRIPTION)
            .vpc_id(vpc_id)
            .tag_specifications(
                ec2::TagSpecification::builder()
                    .resource_type(ec2::ResourceType::SecurityGroup)
                    .tags(ec2::Tag::builder().key(MANAGED_TAG).value("true").build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ControllerError::Cloud(format!("creating security group failed: {e}")))?;

        let group_id = resp
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::Cloud("created group without id".to_string()))?;

        tracing::info!(
            "cloud: aws: created managed security group, group={}, vpc={}",
            group_id,
            vpc_id
        );
        Ok(group_id)
    }

    /// The host's own security group, used as the source of every ingress rule.
    async fn own_security_group(&self) -> Result<String, ControllerError> {
        let instance = self.describe_instance(&self.instance_id).await?;
        instance
            .security_groups()
            .first()
            .and_then(|g| g.group_id())
            .map(str::to_string)
            .ok_or_else(|| {
                ControllerError::Cloud(format!(
                    "instance {} has no security group",
                    self.instance_id
                ))
            })
    }

    /// TCP ports currently authorized in the managed group.
    async fn authorized_ports(&self, group_id: &str) -> Result<Set<i32>, ControllerError> {
        let resp = self
            .ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(|e| {
                ControllerError::Cloud(format!("describing security groups failed: {e}"))
            })?;

        let mut ports = Set::new();
        for group in resp.security_groups() {
            for permission in group.ip_permissions() {
                if permission.ip_protocol() != Some("tcp") {
                    continue;
                }
                if let Some(port) = permission.from_port() {
                    ports.add(port);
                }
            }
        }
        Ok(ports)
    }

    /// Ensure the managed group id is present on every network interface of
    /// the workload instances; other groups are left untouched.
    async fn attach_group_to_interfaces(
        &self,
        instances: &[ec2::Instance],
        group_id: &str,
    ) -> Result<(), ControllerError> {
        for instance in instances {
            for interface in instance.network_interfaces() {
                let Some(interface_id) = interface.network_interface_id() else {
                    continue;
                };

                let mut group_ids: Vec<String> = interface
                    .groups()
                    .iter()
                    .filter_map(|g| g.group_id().map(str::to_string))
                    .collect();
                if group_ids.iter().any(|id| id == group_id) {
                    continue;
                }
                group_ids.push(group_id.to_string());

                self.ec2
                    .modify_network_interface_attribute()
                    .network_interface_id(interface_id)
                    .set_groups(Some(group_ids))
                    .send()
                    .await
                    .map_err(|e| {
                        ControllerError::Cloud(format!(
                            "attaching group to interface {interface_id} failed: {e}"
                        ))
                    })?;

                tracing::info!(
                    "cloud: aws: attached managed group to interface, interface={}, group={}",
                    interface_id,
                    group_id
                );
            }
        }
        Ok(())
    }

    /// One UPSERT for `domain`, or `None` when the record set already holds
    /// the union of its current values and our addresses.
    async fn record_change(
        &self,
        domain: &str,
        addresses: &[String],
    ) -> Result<Option<r53::Change>, ControllerError> {
        let record_type = r53::RrType::from(self.aws.route_53_record_type.as_str());

        let resp = self
            .route53
            .list_resource_record_sets()
            .hosted_zone_id(&self.aws.route_53_hosted_zone_id)
            .start_record_name(domain)
            .start_record_type(record_type.clone())
            .max_items(1)
            .send()
            .await
            .map_err(|e| {
                ControllerError::Cloud(format!(
                    "listing resource records for {domain} failed: {e}"
                ))
            })?;

        // The name is the search key: page size 1 returns the next record at
        // or after it, so a different name means no record set exists yet.
        let existing = resp.resource_record_sets().iter().find(|rrs| {
            rrs.name().trim_end_matches('.') == domain && *rrs.r#type() == record_type
        });

        let current: Vec<String> = existing
            .map(|rrs| {
                rrs.resource_records()
                    .iter()
                    .map(|record| record.value().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let Some(desired) = merged_records(&current, addresses) else {
            tracing::debug!("cloud: aws: no dns changes discovered, domain={}", domain);
            return Ok(None);
        };

        tracing::info!(
            "cloud: aws: dns record differs, domain={}, current={:?}, desired={:?}",
            domain,
            current,
            desired
        );

        let records = desired
            .into_iter()
            .map(|value| r53::ResourceRecord::builder().value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ControllerError::Cloud(format!("invalid resource record: {e}")))?;

        let record_set = r53::ResourceRecordSet::builder()
            .name(domain)
            .r#type(record_type)
            .ttl(existing.and_then(|rrs| rrs.ttl()).unwrap_or(self.aws.route_53_ttl))
            .set_resource_records(Some(records))
            .build()
            .map_err(|e| ControllerError::Cloud(format!("invalid record set: {e}")))?;

        r53::Change::builder()
            .action(r53::ChangeAction::Upsert)
            .resource_record_set(record_set)
            .build()
            .map(Some)
            .map_err(|e| ControllerError::Cloud(format!("invalid change: {e}")))
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn resolve_own_addresses(&self) -> Result<Vec<String>, ControllerError> {
        let instance = self.describe_instance(&self.instance_id).await?;

        // EC2-Classic instances carry no private address field.
        let address = if self.dns.use_public_address {
            instance.public_ip_address()
        } else {
            instance.private_ip_address()
        };

        Ok(address.map(str::to_string).into_iter().collect())
    }

    async fn reconcile_security_groups(
        &self,
        definitions: &HashMap<String, UpstreamDefinition>,
        full_sync: bool,
    ) -> Result<(), ControllerError> {
        if definitions.is_empty() {
            return Ok(());
        }

        let mut required: Set<i32> = Set::new();
        let mut nodes: Set<String> = Set::new();
        for definition in definitions.values() {
            for server in &definition.servers {
                required.add(i32::from(server.port));
                if let Some(node) = &server.meta.node_name {
                    nodes.add(node.clone());
                }
            }
        }

        if nodes.is_empty() {
            tracing::debug!("cloud: aws: no node names on any server, skipping security groups");
            return Ok(());
        }

        let instances = self.instances_by_private_dns(&nodes).await?;
        if instances.is_empty() {
            tracing::warn!(
                "cloud: aws: no running instances match {} node names",
                nodes.len()
            );
            return Ok(());
        }

        let vpc_id = instances
            .iter()
            .find_map(|instance| instance.vpc_id().map(str::to_string))
            .ok_or_else(|| {
                ControllerError::Cloud("workload instances carry no vpc id".to_string())
            })?;

        let group_id = self.ensure_managed_group(&vpc_id).await?;
        let source_group = self.own_security_group().await?;
        let existing = self.authorized_ports(&group_id).await?;

        if full_sync {
            let revoke = existing.diff(&required);
            if !revoke.is_empty() {
                self.ec2
                    .revoke_security_group_ingress()
                    .group_id(&group_id)
                    .set_ip_permissions(Some(ip_permissions(&revoke, &source_group)))
                    .send()
                    .await
                    .map_err(|e| {
                        ControllerError::Cloud(format!("revoking ingress failed: {e}"))
                    })?;
                tracing::info!(
                    "cloud: aws: revoked ingress, group={}, ports={:?}",
                    group_id,
                    sorted_ports(&revoke)
                );
            }
        }

        let authorize = required.diff(&existing);
        if !authorize.is_empty() {
            self.ec2
                .authorize_security_group_ingress()
                .group_id(&group_id)
                .set_ip_permissions(Some(ip_permissions(&authorize, &source_group)))
                .send()
                .await
                .map_err(|e| {
                    ControllerError::Cloud(format!("authorizing ingress failed: {e}"))
                })?;
            tracing::info!(
                "cloud: aws: authorized ingress, group={}, ports={:?}",
                group_id,
                sorted_ports(&authorize)
            );
        }

        self.attach_group_to_interfaces(&instances, &group_id).await
    }

    async fn upsert_record_set(&self, domains: &[String]) -> Result<(), ControllerError> {
        if domains.is_empty() {
            return Ok(());
        }

        let addresses = self.resolve_own_addresses().await?;
        if addresses.is_empty() {
            tracing::warn!("cloud: aws: no own addresses resolved, skipping dns update");
            return Ok(());
        }

        // The pending batch may carry the same domain more than once.
        let mut seen: Set<&str> = Set::new();
        let mut changes = Vec::new();
        for domain in domains {
            if seen.has(domain.as_str()) {
                continue;
            }
            seen.add(domain.as_str());

            if let Some(change) = self.record_change(domain, &addresses).await? {
                changes.push(change);
            }
        }

        if changes.is_empty() {
            tracing::debug!("cloud: aws: dns already converged, domains={}", seen.len());
            return Ok(());
        }

        let batch = r53::ChangeBatch::builder()
            .set_changes(Some(changes))
            .build()
            .map_err(|e| ControllerError::Cloud(format!("invalid change batch: {e}")))?;

        self.route53
            .change_resource_record_sets()
            .hosted_zone_id(&self.aws.route_53_hosted_zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| ControllerError::Cloud(format!("changing record sets failed: {e}")))?;

        Ok(())
    }
}

fn ip_permissions(ports: &Set<i32>, source_group_id: &str) -> Vec<ec2::IpPermission> {
    sorted_ports(ports)
        .into_iter()
        .map(|port| {
            ec2::IpPermission::builder()
                .ip_protocol("tcp")
                .from_port(port)
                .to_port(port)
                .user_id_group_pairs(
                    ec2::UserIdGroupPair::builder()
                        .group_id(source_group_id)
                        .description(RULE_DESCRIPTION)
                        .build(),
                )
                .build()
        })
        .collect()
}

fn sorted_ports(ports: &Set<i32>) -> Vec<i32> {
    let mut values = ports.values();
    values.sort_unstable();
    values
}
