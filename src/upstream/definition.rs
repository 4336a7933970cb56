use k8s_openapi::api::core::v1::Endpoints;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// How many times a failed change is re-enqueued before being dropped.
pub const MAX_RETRIES: u32 = 3;

/// Fixed delay before a failed change becomes eligible for redelivery.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// One ready upstream server.
///
/// `id` is derived from the pod reference so that the rendered config keeps a
/// stable backend identifier across updates. Serialized field names are the
/// variables exposed to the user-supplied template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Server {
    pub id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub port: u16,
    pub meta: ServerMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerMeta {
    pub hostname: Option<String>,
    pub node_name: Option<String>,
}

/// The unit of rendering: one proxy backend for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamDefinition {
    pub domain: String,
    pub health_check: String,
    pub servers: Vec<Server>,
}

impl UpstreamDefinition {
    /// Build a definition for `domain` from a raw endpoint object.
    ///
    /// For each subset the representative port is `ports[0]`; subsets without
    /// ports are skipped. Only ready addresses are taken. When the address
    /// carries no target reference the server id falls back to `ip:port`.
    ///
    /// The result may have an empty server list. Callers drop those instead
    /// of publishing an empty backend.
    pub fn from_endpoints(domain: &str, health_check: &str, endpoints: &Endpoints) -> Self {
        let mut servers = Vec::new();

        for subset in endpoints.subsets.iter().flatten() {
            let Some(port) = subset
                .ports
                .as_deref()
                .and_then(|ports| ports.first())
                .and_then(|p| u16::try_from(p.port).ok())
            else {
                continue;
            };

            for address in subset.addresses.iter().flatten() {
                let id = address
                    .target_ref
                    .as_ref()
                    .and_then(|r| r.name.clone())
                    .unwrap_or_else(|| format!("{}:{}", address.ip, port));

                servers.push(Server {
                    id,
                    ip_address: address.ip.clone(),
                    port,
                    meta: ServerMeta {
                        hostname: address.hostname.clone(),
                        node_name: address.node_name.clone(),
                    },
                });
            }
        }

        UpstreamDefinition {
            domain: domain.to_string(),
            health_check: health_check.to_string(),
            servers,
        }
    }
}

/// Envelope flowing through the change channel, carrying retry metadata.
#[derive(Debug, Clone)]
pub struct Change {
    pub definition: UpstreamDefinition,
    pub retried: u32,
    pub retry_after: Option<Instant>,
}

impl Change {
    pub fn new(definition: UpstreamDefinition) -> Self {
        Change {
            definition,
            retried: 0,
            retry_after: None,
        }
    }

    /// The change was delivered before its retry deadline and must go back on
    /// the channel without touching the counter.
    pub fn is_deferred(&self, now: Instant) -> bool {
        matches!(self.retry_after, Some(at) if now < at)
    }

    /// Consume a retry attempt. Returns the re-stamped change, or `None` once
    /// the retry budget is exhausted and the change should be dropped. A
    /// change is applied at most `1 + MAX_RETRIES` times.
    pub fn into_retry(mut self, now: Instant) -> Option<Self> {
        self.retried += 1;
        if self.retried > MAX_RETRIES {
            return None;
        }
        self.retry_after = Some(now + RETRY_DELAY);
        Some(self)
    }
}

/// All subset addresses flattened to IPs, sorted by their binary form so that
/// `10.1.1.1 < 10.1.2.1 < 10.10.1.1 < 10.10.1.10`. Textual sorting would
/// misorder octets. Unparsable addresses are skipped.
pub fn sorted_endpoint_ips(endpoints: &Endpoints) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|address| address.ip.parse().ok())
        .collect();

    ips.sort_by_key(|ip| match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    });
    ips
}
