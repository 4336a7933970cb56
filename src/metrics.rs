use anyhow::Result;
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the global Prometheus recorder with its exposition listener and
/// register metric descriptions.
///
/// Must be called once at startup, inside the runtime, before any `counter!`
/// / `gauge!` calls.
pub fn install(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address {listen}: {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("unable to install metrics recorder: {e}"))?;

    // --- Describe all metrics (adds HELP / TYPE lines) ---

    // event ingestion
    describe_counter!(
        "balanced_endpoint_events_total",
        Unit::Count,
        "Endpoint watch events observed in watched namespaces"
    );
    describe_counter!(
        "balanced_changes_queued_total",
        Unit::Count,
        "Upstream changes queued for reconciliation"
    );

    // reconcile loop
    describe_counter!(
        "balanced_changes_total",
        Unit::Count,
        "Changes processed by the reconcile loop, by result"
    );
    describe_counter!(
        "balanced_retry_requeue_dropped_total",
        Unit::Count,
        "Retries dropped because the change channel was full"
    );
    describe_counter!(
        "balanced_sync_ticks_total",
        Unit::Count,
        "Periodic full-sync ticks"
    );
    describe_gauge!(
        "balanced_domains_cached",
        Unit::Count,
        "Domains with a known upstream definition"
    );

    // side effects
    describe_counter!(
        "balanced_reloads_total",
        Unit::Count,
        "Proxy reload attempts, by result"
    );
    describe_counter!(
        "balanced_dns_upserts_total",
        Unit::Count,
        "DNS batch reconciliations, by result"
    );

    tracing::info!("metrics: prometheus listener started, addr={}", addr);
    Ok(())
}
