use crate::cloud::CloudProvider;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::loadbalancer::{checksum, Renderer};
use crate::upstream::{Change, UpstreamDefinition, MAX_RETRIES};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Capacity of the change channel. The event source blocks on a full buffer
/// (intentional backpressure); retry re-enqueues never block and are dropped
/// with a warning instead.
pub const CHANGE_BUFFER: usize = 64;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The reconcile loop.
///
/// A single dispatcher task selects between the inbound change channel and a
/// periodic tick. Changes render and persist proxy config with a checksum
/// short-circuit; the proxy reload and all batched cloud side-effects are
/// deferred to the tick. All state is private to the dispatcher, so no locks.
pub struct Updater {
    cfg: Arc<ControllerConfig>,
    renderer: Renderer,
    provider: Arc<dyn CloudProvider>,
    retry_tx: mpsc::Sender<Change>,

    /// Last successfully processed definition per domain; drives the tick's
    /// full-sync security-group reconciliation.
    cache: HashMap<String, UpstreamDefinition>,
    reload_required: bool,
    pending_domains: Vec<String>,
}

impl Updater {
    pub fn new(
        cfg: Arc<ControllerConfig>,
        provider: Arc<dyn CloudProvider>,
        retry_tx: mpsc::Sender<Change>,
    ) -> Result<Self, ControllerError> {
        let renderer = Renderer::new(&cfg.load_balancer.template)?;
        Ok(Updater {
            cfg,
            renderer,
            provider,
            retry_tx,
            cache: HashMap::new(),
            reload_required: false,
            pending_domains: Vec::new(),
        })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Change>, shutdown: Arc<Notify>) {
        let mut tick = tokio::time::interval(self.cfg.load_balancer.sync_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(change) => self.on_change(change).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
                _ = shutdown.notified() => {
                    self.drain(&mut rx).await;
                    break;
                }
            }
        }

        self.provider.on_exit().await;
        tracing::info!("loadbalancer: updater stopped");
    }

    async fn on_change(&mut self, change: Change) {
        let domain = change.definition.domain.clone();

        // The cache always reflects the latest desired state, even when the
        // apply below fails; the tick's full sync works from it.
        self.cache.insert(domain.clone(), change.definition.clone());
        metrics::gauge!("balanced_domains_cached").set(self.cache.len() as f64);

        let now = Instant::now();
        if change.is_deferred(now) {
            self.requeue_after(change);
            return;
        }

        let result = match self.apply(&change.definition) {
            Ok(wrote) => {
                if wrote {
                    self.reload_required = true;
                }
                self.pending_domains.push(domain.clone());

                let delta: HashMap<String, UpstreamDefinition> =
                    [(domain.clone(), change.definition.clone())].into();
                self.provider.reconcile_security_groups(&delta, false).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                metrics::counter!("balanced_changes_total", "result" => "success").increment(1);
            }
            Err(e) => {
                tracing::warn!(
                    "loadbalancer: change failed, domain={}, attempt={}, error={}",
                    domain,
                    change.retried + 1,
                    e
                );
                match change.into_retry(now) {
                    Some(retry) => {
                        metrics::counter!("balanced_changes_total", "result" => "retry")
                            .increment(1);
                        self.requeue_after(retry);
                    }
                    None => {
                        metrics::counter!("balanced_changes_total", "result" => "dropped")
                            .increment(1);
                        tracing::error!(
                            "loadbalancer: change dropped after {} attempts, domain={}",
                            MAX_RETRIES,
                            domain
                        );
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        metrics::counter!("balanced_sync_ticks_total").increment(1);

        if let Err(e) = self.provider.reconcile_security_groups(&self.cache, true).await {
            // Invariant violations surface here on every tick until resolved.
            tracing::error!("cloud: full-sync security-group reconcile failed, error={}", e);
        }

        if self.reload_required {
            self.reload_required = false;
            match self.reload().await {
                Ok(()) => {
                    metrics::counter!("balanced_reloads_total", "result" => "success")
                        .increment(1);
                    tracing::info!("loadbalancer: proxy reloaded");
                }
                Err(e) => {
                    metrics::counter!("balanced_reloads_total", "result" => "error").increment(1);
                    tracing::error!("loadbalancer: proxy reload failed, error={}", e);
                }
            }
        }

        if self.cfg.dns.enabled && !self.pending_domains.is_empty() {
            match self.provider.upsert_record_set(&self.pending_domains).await {
                Ok(()) => {
                    metrics::counter!("balanced_dns_upserts_total", "result" => "success")
                        .increment(1);
                    self.pending_domains.clear();
                }
                Err(e) => {
                    metrics::counter!("balanced_dns_upserts_total", "result" => "error")
                        .increment(1);
                    tracing::error!(
                        "cloud: dns reconcile failed, retaining {} pending domains, error={}",
                        self.pending_domains.len(),
                        e
                    );
                }
            }
        }
    }

    /// Render, compare checksums, and atomically replace the destination on a
    /// real difference. Returns whether the destination was rewritten.
    fn apply(&self, definition: &UpstreamDefinition) -> Result<bool, ControllerError> {
        let filename = format!("{}.cfg", definition.domain.replace('.', "_"));
        let destination = self.cfg.load_balancer.config_dir.join(filename);

        let rendered = self.renderer.render(definition)?;
        let current = checksum::sha256_file(&destination)?;
        if current == Some(checksum::sha256(rendered.as_bytes())) {
            tracing::debug!(
                "loadbalancer: config unchanged, skipping write, file={}",
                destination.display()
            );
            return Ok(false);
        }

        // Stage in the destination directory so the rename below never
        // crosses a filesystem boundary; a partial write is never observable.
        let mut staging = tempfile::Builder::new()
            .prefix(".balanced-")
            .tempfile_in(&self.cfg.load_balancer.config_dir)?;
        staging.write_all(rendered.as_bytes())?;
        staging.as_file().sync_all()?;

        let mut permissions = staging.as_file().metadata()?.permissions();
        permissions.set_mode(0o644);
        staging.as_file().set_permissions(permissions)?;

        staging
            .persist(&destination)
            .map_err(|e| ControllerError::Io(e.error))?;

        tracing::info!("loadbalancer: config written, file={}", destination.display());
        Ok(true)
    }

    async fn reload(&self) -> Result<(), ControllerError> {
        let parts = shell_words::split(&self.cfg.load_balancer.reload_cmd)
            .map_err(|e| ControllerError::Reload(format!("unable to parse reload-cmd: {e}")))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(ControllerError::Reload("reload-cmd is empty".to_string()));
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ControllerError::Reload(format!("unable to run {program}: {e}")))?;

        tracing::debug!(
            "loadbalancer: reload output, stdout={:?}, stderr={:?}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if !output.status.success() {
            return Err(ControllerError::Reload(format!(
                "{program} exited with {}",
                output.status
            )));
        }
        Ok(())
    }

    /// Re-enqueue once the retry deadline passes. The deadline is also
    /// re-checked at dequeue time, so an early redelivery goes back on the
    /// channel without touching the retry counter.
    fn requeue_after(&self, change: Change) {
        let tx = self.retry_tx.clone();
        let deadline = change.retry_after.unwrap_or_else(Instant::now);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            send_back(&tx, change);
        });
    }

    /// Bounded-grace drain after the termination signal: stop accepting new
    /// sends, process what is already buffered, then do a final reload if one
    /// is still owed.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<Change>) {
        rx.close();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(change)) => self.on_change(change).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("loadbalancer: shutdown grace elapsed with changes pending");
                    break;
                }
            }
        }

        if self.reload_required {
            self.reload_required = false;
            if let Err(e) = self.reload().await {
                tracing::error!("loadbalancer: final reload failed, error={}", e);
            }
        }
    }

    #[cfg(test)]
    fn cached(&self, domain: &str) -> Option<&UpstreamDefinition> {
        self.cache.get(domain)
    }
}

fn send_back(tx: &mpsc::Sender<Change>, change: Change) {
    match tx.try_send(change) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(change)) => {
            // Convergence is still guaranteed: the cache holds the desired
            // state and the tick's full sync picks it up.
            metrics::counter!("balanced_retry_requeue_dropped_total").increment(1);
            tracing::warn!(
                "loadbalancer: change channel full, dropping retry, domain={}",
                change.definition.domain
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockProvider;
    use crate::config::ControllerConfig;
    use crate::upstream::{Server, ServerMeta};
    use std::path::Path;

    fn definition(domain: &str, ip: &str) -> UpstreamDefinition {
        UpstreamDefinition {
            domain: domain.to_string(),
            health_check: "/health".to_string(),
            servers: vec![Server {
                id: "one".to_string(),
                ip_address: ip.to_string(),
                port: 80,
                meta: ServerMeta::default(),
            }],
        }
    }

    fn updater_with_dir(config_dir: &Path) -> (Updater, mpsc::Receiver<Change>) {
        let mut cfg = ControllerConfig::default();
        cfg.kubernetes.service_annotation_load_balancer_id = "testing".to_string();
        cfg.load_balancer.config_dir = config_dir.to_path_buf();
        cfg.load_balancer.reload_cmd = "true".to_string();
        cfg.load_balancer.template =
            "backend {{Domain}}\n{{#each Servers}}  server {{Id}} {{IPAddress}}:{{Port}}\n{{/each}}"
                .to_string();

        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        let updater = Updater::new(Arc::new(cfg), Arc::new(MockProvider::new()), tx).unwrap();
        (updater, rx)
    }

    #[test]
    fn apply_writes_sanitized_filename() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _rx) = updater_with_dir(dir.path());

        let wrote = updater.apply(&definition("foo.bar.com", "10.1.1.1")).unwrap();
        assert!(wrote);

        let path = dir.path().join("foo_bar_com.cfg");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "backend foo.bar.com\n  server one 10.1.1.1:80\n"
        );

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn apply_short_circuits_on_equal_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _rx) = updater_with_dir(dir.path());
        let def = definition("hi.com", "10.1.1.1");

        assert!(updater.apply(&def).unwrap());
        let path = dir.path().join("hi_com.cfg");
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!updater.apply(&def).unwrap());
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn apply_rewrites_on_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _rx) = updater_with_dir(dir.path());

        assert!(updater.apply(&definition("hi.com", "10.1.1.1")).unwrap());
        assert!(updater.apply(&definition("hi.com", "10.1.1.2")).unwrap());

        let contents = std::fs::read_to_string(dir.path().join("hi_com.cfg")).unwrap();
        assert!(contents.contains("10.1.1.2"));
    }

    #[test]
    fn apply_fails_when_config_dir_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let (updater, _rx) = updater_with_dir(&missing);

        assert!(updater.apply(&definition("hi.com", "10.1.1.1")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_change_marks_reload_and_pending_dns() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, _rx) = updater_with_dir(dir.path());

        updater.on_change(Change::new(definition("hi.com", "10.1.1.1"))).await;

        assert!(updater.reload_required);
        assert_eq!(updater.pending_domains, vec!["hi.com"]);
        assert_eq!(
            updater.cached("hi.com"),
            Some(&definition("hi.com", "10.1.1.1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_change_walks_the_retry_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let (mut updater, mut rx) = updater_with_dir(&missing);
        let def = definition("hi.com", "10.1.1.1");

        let mut change = Change::new(def.clone());
        for attempt in 1..=MAX_RETRIES {
            let before = Instant::now();
            updater.on_change(change).await;

            // The retry lands back on the channel after the fixed delay.
            change = rx.recv().await.expect("re-enqueued change");
            assert_eq!(change.retried, attempt);
            let after = change.retry_after.expect("deadline stamped");
            assert!(after >= before + crate::upstream::RETRY_DELAY);
        }

        // Final attempt exhausts the budget: nothing is re-enqueued.
        updater.on_change(change).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        // The desired state survives the drop for the next full sync.
        assert_eq!(updater.cached("hi.com"), Some(&def));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_change_is_requeued_without_counting_a_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, mut rx) = updater_with_dir(dir.path());

        let mut change = Change::new(definition("hi.com", "10.1.1.1"));
        change.retried = 1;
        change.retry_after = Some(Instant::now() + Duration::from_secs(5));

        updater.on_change(change).await;

        let requeued = rx.recv().await.expect("deferred change re-sent");
        assert_eq!(requeued.retried, 1);
        // No file was written while the change was deferred.
        assert!(!updater.reload_required);
    }
}
