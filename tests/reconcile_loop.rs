use async_trait::async_trait;
use balanced::cloud::CloudProvider;
use balanced::config::ControllerConfig;
use balanced::error::ControllerError;
use balanced::loadbalancer::{Updater, CHANGE_BUFFER};
use balanced::upstream::{Change, Server, ServerMeta, UpstreamDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Cloud provider double that records every call.
#[derive(Default)]
struct RecordingProvider {
    security_group_calls: Mutex<Vec<(Vec<String>, bool)>>,
    dns_batches: Mutex<Vec<Vec<String>>>,
    fail_next_dns: AtomicBool,
    exited: AtomicBool,
}

impl RecordingProvider {
    fn full_sync_domains(&self) -> Vec<Vec<String>> {
        self.security_group_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, full_sync)| *full_sync)
            .map(|(domains, _)| domains.clone())
            .collect()
    }
}

#[async_trait]
impl CloudProvider for RecordingProvider {
    async fn resolve_own_addresses(&self) -> Result<Vec<String>, ControllerError> {
        Ok(vec!["10.0.0.1".to_string()])
    }

    async fn reconcile_security_groups(
        &self,
        definitions: &HashMap<String, UpstreamDefinition>,
        full_sync: bool,
    ) -> Result<(), ControllerError> {
        let mut domains: Vec<String> = definitions.keys().cloned().collect();
        domains.sort();
        self.security_group_calls
            .lock()
            .unwrap()
            .push((domains, full_sync));
        Ok(())
    }

    async fn upsert_record_set(&self, domains: &[String]) -> Result<(), ControllerError> {
        if self.fail_next_dns.swap(false, Ordering::SeqCst) {
            return Err(ControllerError::Cloud("route53 unavailable".to_string()));
        }
        self.dns_batches.lock().unwrap().push(domains.to_vec());
        Ok(())
    }

    async fn on_exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

fn config(config_dir: &Path) -> Arc<ControllerConfig> {
    let mut cfg = ControllerConfig::default();
    cfg.kubernetes.service_annotation_load_balancer_id = "testing".to_string();
    cfg.load_balancer.sync_interval = 1;
    cfg.load_balancer.config_dir = config_dir.to_path_buf();
    cfg.load_balancer.reload_cmd = "true".to_string();
    cfg.dns.enabled = true;
    Arc::new(cfg)
}

fn definition(domain: &str) -> UpstreamDefinition {
    UpstreamDefinition {
        domain: domain.to_string(),
        health_check: "/health".to_string(),
        servers: vec![Server {
            id: "my-pod-1".to_string(),
            ip_address: "10.1.1.1".to_string(),
            port: 8443,
            meta: ServerMeta {
                hostname: None,
                node_name: Some("ip-10-1-1-1.ec2.internal".to_string()),
            },
        }],
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn change_flows_to_disk_and_cloud() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(RecordingProvider::default());

    let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
    let shutdown = Arc::new(Notify::new());
    let updater = Updater::new(config(dir.path()), provider.clone(), tx.clone()).unwrap();
    let handle = tokio::spawn(updater.run(rx, shutdown.clone()));

    tx.send(Change::new(definition("foobar.com"))).await.unwrap();

    // The event path renders the config and runs a delta reconcile.
    let rendered = dir.path().join("foobar_com.cfg");
    wait_for(|| rendered.exists()).await;
    let contents = std::fs::read_to_string(&rendered).unwrap();
    assert!(contents.contains("backend foobar.com"));
    assert!(contents.contains("server my-pod-1 10.1.1.1:8443"));

    {
        let calls = provider.security_group_calls.lock().unwrap();
        assert!(calls
            .iter()
            .any(|(domains, full_sync)| !full_sync && domains == &["foobar.com"]));
    }

    // The tick batches the DNS upsert and a full security-group sync.
    wait_for(|| !provider.dns_batches.lock().unwrap().is_empty()).await;
    assert_eq!(
        provider.dns_batches.lock().unwrap()[0],
        vec!["foobar.com".to_string()]
    );
    wait_for(|| {
        provider
            .full_sync_domains()
            .iter()
            .any(|domains| domains == &["foobar.com"])
    })
    .await;

    shutdown.notify_waiters();
    handle.await.unwrap();
    assert!(provider.exited.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn dns_batch_is_retained_across_a_failed_tick() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(RecordingProvider::default());
    provider.fail_next_dns.store(true, Ordering::SeqCst);

    let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
    let shutdown = Arc::new(Notify::new());
    let updater = Updater::new(config(dir.path()), provider.clone(), tx.clone()).unwrap();
    let handle = tokio::spawn(updater.run(rx, shutdown.clone()));

    tx.send(Change::new(definition("foobar.com"))).await.unwrap();

    // First tick fails the batch; the retained domain lands on the next one.
    wait_for(|| !provider.dns_batches.lock().unwrap().is_empty()).await;
    assert_eq!(
        provider.dns_batches.lock().unwrap()[0],
        vec!["foobar.com".to_string()]
    );

    shutdown.notify_waiters();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn identical_change_does_not_rewrite_config() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(RecordingProvider::default());

    let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
    let shutdown = Arc::new(Notify::new());
    let updater = Updater::new(config(dir.path()), provider.clone(), tx.clone()).unwrap();
    let handle = tokio::spawn(updater.run(rx, shutdown.clone()));

    tx.send(Change::new(definition("hi.com"))).await.unwrap();
    let rendered = dir.path().join("hi_com.cfg");
    wait_for(|| rendered.exists()).await;
    let mtime = std::fs::metadata(&rendered).unwrap().modified().unwrap();

    tx.send(Change::new(definition("hi.com"))).await.unwrap();
    // Let the loop process the second change and at least one tick.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        std::fs::metadata(&rendered).unwrap().modified().unwrap(),
        mtime
    );

    shutdown.notify_waiters();
    handle.await.unwrap();
}
