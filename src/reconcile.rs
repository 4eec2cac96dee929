//! Reconciliation loop
//!
//! One cycle discovers the services, resolves them, renders every artifact,
//! writes the ones whose content changed and asks HAProxy to reload when its
//! own configuration moved. Nothing in a cycle is fatal: a failed discovery or
//! render skips the cycle, a failed artifact is skipped on its own and a
//! failed reload leaves the written files in place.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::artifacts::{
    generate, has_changed, https_bundle_path, Artifact, ArtifactFs, ArtifactPaths, ArtifactSet,
    BuiltinTemplates, Category, ClusterContext, LocalFs, RenderError, TemplateRenderer,
    SANITIZE_EXTENSION,
};
use crate::config::Settings;
use crate::discovery::{DiscoveryClient, DiscoveryError};
use crate::reload::{ProxyReloader, SignalReloader};
use crate::service::{resolve, Service, ServiceRecord, ValidationError};

/// Failures that abort a whole cycle
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),
}

/// What happened to HAProxy at the end of a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Neither the services file nor a sanitize response changed
    NotNeeded,
    /// Changed, but running one-shot before HAProxy starts
    Deferred,
    Reloaded { pid: u32 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub discovered: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub rejected: usize,
    /// Categories with at least one artifact written or removed
    pub changed: BTreeSet<Category>,
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    /// Artifacts that could not be compared, written or removed
    pub failed: usize,
    pub reload: ReloadOutcome,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>, discovered: usize, resolution: &Resolution) -> Self {
        Self {
            started_at,
            discovered,
            resolved: resolution.services.len(),
            skipped: resolution.skipped.len(),
            rejected: resolution.rejected.len(),
            changed: BTreeSet::new(),
            written: Vec::new(),
            removed: Vec::new(),
            failed: 0,
            reload: ReloadOutcome::NotNeeded,
        }
    }

    /// Whether HAProxy has to pick up new configuration
    pub fn needs_reload(&self) -> bool {
        self.changed.contains(&Category::LoadBalancer) || self.changed.contains(&Category::Sanitize)
    }

    pub fn summary(&self) -> String {
        let changed = if self.changed.is_empty() {
            "none".to_string()
        } else {
            self.changed
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        format!(
            "{} discovered, {} resolved, {} skipped, {} rejected; changed: {}; {} written, {} removed, {} failed; reload: {:?}",
            self.discovered,
            self.resolved,
            self.skipped,
            self.rejected,
            changed,
            self.written.len(),
            self.removed.len(),
            self.failed,
            self.reload
        )
    }
}

/// Records sorted into usable services, unmanaged ones and invalid ones
#[derive(Debug, Default)]
pub struct Resolution {
    pub services: Vec<Service>,
    pub skipped: Vec<String>,
    pub rejected: Vec<(String, ValidationError)>,
}

// ============================================================================
// SBIO: Pure resolution (logging only)
// ============================================================================

/// Resolve every record, skipping those without `plimni.io` tags and
/// rejecting invalid ones without affecting the others
pub fn resolve_records(
    records: &[ServiceRecord],
    cluster_branch: &str,
    cluster_domain: &str,
) -> Resolution {
    let mut resolution = Resolution::default();

    for record in records {
        if !record.is_plimni() {
            debug!("Service {}: not managed by plimni, skipping", record.name);
            resolution.skipped.push(record.name.clone());
            continue;
        }

        match resolve(record, cluster_branch, cluster_domain) {
            Ok(service) => {
                debug!(
                    "Service {}: {} ({} on {}), {} backend(s)",
                    record.name,
                    service.fqdn,
                    service.mode(),
                    service.listener.port(),
                    service.backends.len()
                );
                resolution.services.push(service);
            }
            Err(e) => {
                warn!("Service {}: rejected: {}", record.name, e);
                resolution.rejected.push((record.name.clone(), e));
            }
        }
    }

    resolution
}

/// Everything a cycle needs besides its collaborators
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Cluster values; the certificate file is recomputed every cycle
    pub cluster: ClusterContext,
    pub paths: ArtifactPaths,
    pub certbot_dir: PathBuf,
    pub pid_file: PathBuf,
    pub one_shot: bool,
    pub prune_sanitize: bool,
    pub interval: Duration,
}

impl CycleConfig {
    pub fn from_settings(settings: &Settings, issuance_endpoint: &str) -> Self {
        Self {
            cluster: settings.cluster_context(issuance_endpoint),
            paths: settings.artifact_paths(),
            certbot_dir: settings.certbot_dir.clone(),
            pid_file: settings.pid_file.clone(),
            one_shot: settings.init,
            prune_sanitize: settings.prune_sanitize,
            interval: settings.sleep_time,
        }
    }
}

pub struct Reconciler {
    discovery: Box<dyn DiscoveryClient>,
    renderer: Box<dyn TemplateRenderer>,
    fs: Box<dyn ArtifactFs>,
    reloader: Box<dyn ProxyReloader>,
    config: CycleConfig,
}

impl Reconciler {
    /// Reconciler writing to the local disk and signalling HAProxy
    pub fn new(discovery: Box<dyn DiscoveryClient>, config: CycleConfig) -> Self {
        Self {
            discovery,
            renderer: Box::new(BuiltinTemplates),
            fs: Box::new(LocalFs),
            reloader: Box::new(SignalReloader::new()),
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_fs(mut self, fs: Box<dyn ArtifactFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_reloader(mut self, reloader: Box<dyn ProxyReloader>) -> Self {
        self.reloader = reloader;
        self
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Run one full cycle
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let cluster = &self.config.cluster;

        let records = self
            .discovery
            .list_services(&cluster.cluster_branch, &cluster.cluster_domain)
            .await?;

        let resolution = resolve_records(&records, &cluster.cluster_branch, &cluster.cluster_domain);
        let mut report = CycleReport::new(started_at, records.len(), &resolution);

        let ctx = self.render_context();
        let set = generate(&resolution.services, &ctx, self.renderer.as_ref())?;

        let pending = self.diff(&set, &mut report);

        if self.config.prune_sanitize {
            self.prune_sanitize(&set, &mut report);
        }

        for artifact in pending {
            if let Some(parent) = artifact.path.parent() {
                if let Err(e) = self.fs.create_dir_all(parent) {
                    warn!("Failed to create {}: {}", parent.display(), e);
                }
            }

            match self.fs.write(&artifact.path, &artifact.content) {
                Ok(()) => {
                    info!("Wrote {} configuration {}", artifact.category, artifact.path.display());
                    report.changed.insert(artifact.category);
                    report.written.push(artifact.path);
                }
                Err(e) => {
                    warn!("Failed to write {}: {}", artifact.path.display(), e);
                    report.failed += 1;
                }
            }
        }

        report.reload = self.reload(&report).await;

        Ok(report)
    }

    /// Cluster context for this cycle; HTTPS frontends only get a
    /// certificate once Certbot has produced the bundle
    fn render_context(&self) -> ClusterContext {
        let mut ctx = self.config.cluster.clone();
        let bundle = https_bundle_path(&self.config.certbot_dir, &ctx.cluster_domain);

        if self.fs.is_file(&bundle) {
            ctx.https_cert_file = bundle.display().to_string();
        } else {
            debug!("No certificate bundle at {} yet", bundle.display());
            ctx.https_cert_file.clear();
        }
        ctx
    }

    /// Artifacts whose content differs from disk
    fn diff(&self, set: &ArtifactSet, report: &mut CycleReport) -> Vec<Artifact> {
        let mut pending = Vec::new();

        for artifact in set.artifacts(&self.config.paths) {
            match has_changed(self.fs.as_ref(), &artifact.path, &artifact.content) {
                Ok(true) => {
                    debug!("{} changed", artifact.path.display());
                    pending.push(artifact);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to read {}: {}", artifact.path.display(), e);
                    report.failed += 1;
                }
            }
        }

        pending
    }

    /// Remove sanitize responses no current service produces
    fn prune_sanitize(&self, set: &ArtifactSet, report: &mut CycleReport) {
        let paths = &self.config.paths;

        let files = match self.fs.list_dir(&paths.sanitize_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list {}: {}", paths.sanitize_dir.display(), e);
                report.failed += 1;
                return;
            }
        };

        let wanted: BTreeSet<PathBuf> = set.sanitize.keys().map(|k| paths.sanitize_file(k)).collect();

        for path in files {
            let is_response = path.extension().and_then(|e| e.to_str()) == Some(SANITIZE_EXTENSION);
            if !is_response || wanted.contains(&path) {
                continue;
            }

            match self.fs.remove(&path) {
                Ok(()) => {
                    info!("Removed stale sanitize response {}", path.display());
                    report.changed.insert(Category::Sanitize);
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }
    }

    async fn reload(&self, report: &CycleReport) -> ReloadOutcome {
        if !report.needs_reload() {
            return ReloadOutcome::NotNeeded;
        }

        if self.config.one_shot {
            info!("One-shot mode, leaving the HAProxy reload to its startup");
            return ReloadOutcome::Deferred;
        }

        match self.reloader.reload(&self.config.pid_file).await {
            Ok(pid) => {
                info!("Reloaded HAProxy (pid {})", pid);
                ReloadOutcome::Reloaded { pid }
            }
            Err(e) => {
                error!("Failed to reload HAProxy: {}", e);
                ReloadOutcome::Failed(e.to_string())
            }
        }
    }

    /// Run cycles until `shutdown` turns true.
    ///
    /// In one-shot mode a single cycle runs and its failure is returned;
    /// otherwise failures are logged and the loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CycleError> {
        info!(
            "Starting reconciliation for {} (branch {}), interval={}s",
            self.config.cluster.cluster_domain,
            self.config.cluster.cluster_branch,
            self.config.interval.as_secs()
        );

        loop {
            match self.run_cycle().await {
                Ok(report) => info!("Cycle done: {}", report.summary()),
                Err(e) if self.config.one_shot => return Err(e),
                Err(e) => error!("Cycle skipped: {}", e),
            }

            if self.config.one_shot {
                return Ok(());
            }

            debug!("Sleeping {}s", self.config.interval.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciliation shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Bindings, TemplateId};
    use crate::discovery::mock::MockDiscovery;
    use crate::reload::mock::RecordingReloader;
    use crate::service::tags;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn config(root: &Path) -> CycleConfig {
        let sanitize_dir = root.join("sanitize.d");
        let certbot_dir = root.join("certs");
        CycleConfig {
            cluster: ClusterContext {
                cluster_domain: "example.com".to_string(),
                cluster_branch: "master".to_string(),
                cluster_email: String::new(),
                issuance_endpoint: "127.0.0.1:8080".to_string(),
                https_cert_file: String::new(),
                sanitize_dir: sanitize_dir.display().to_string(),
            },
            paths: ArtifactPaths::new(&root.join("conf.d/services.cfg"), &sanitize_dir, &certbot_dir),
            certbot_dir,
            pid_file: root.join("conf.d/haproxy.pid"),
            one_shot: false,
            prune_sanitize: false,
            interval: Duration::from_millis(10),
        }
    }

    fn api(codes: &str) -> ServiceRecord {
        ServiceRecord::new("api")
            .with_tag(tags::EXPOSE, "true")
            .with_tag(tags::HTTP_SANITIZE_CODES, codes)
            .with_tag(tags::HTTP_SANITIZE_RETURN, "503")
            .with_endpoint("10.0.0.1", 8080)
    }

    fn reconciler(
        discovery: MockDiscovery,
        reloader: RecordingReloader,
        config: CycleConfig,
    ) -> Reconciler {
        Reconciler::new(Box::new(discovery), config).with_reloader(Box::new(reloader))
    }

    #[test]
    fn test_resolve_records_sorts_records() {
        let records = vec![
            ServiceRecord::new("kubernetes"),
            ServiceRecord::new("blog").with_tag(tags::MODE, "http"),
            ServiceRecord::new("broken").with_tag(tags::MODE, "ftp"),
        ];

        let resolution = resolve_records(&records, "master", "example.com");
        assert_eq!(resolution.services.len(), 1);
        assert_eq!(resolution.services[0].fqdn, "blog.master.example.com");
        assert_eq!(resolution.skipped, vec!["kubernetes"]);
        assert_eq!(resolution.rejected.len(), 1);
        assert_eq!(resolution.rejected[0].0, "broken");
    }

    #[tokio::test]
    async fn test_first_cycle_writes_and_reloads() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let r = reconciler(MockDiscovery::new(vec![api("500,502")]), reloader, cfg.clone());

        let report = r.run_cycle().await.unwrap();

        assert_eq!(report.resolved, 1);
        assert_eq!(
            report.changed,
            BTreeSet::from([Category::LoadBalancer, Category::Sanitize, Category::Issuance])
        );
        assert_eq!(report.written.len(), 4);
        assert!(cfg.paths.load_balancer.is_file());
        assert!(cfg.paths.sanitize_file("api.master.example.com-500").is_file());
        assert!(cfg.paths.sanitize_file("api.master.example.com-502").is_file());
        assert!(cfg.paths.issuance.is_file());
        assert_eq!(report.reload, ReloadOutcome::Reloaded { pid: 4242 });
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_cycle_is_idle() {
        let dir = TempDir::new().unwrap();
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let r = reconciler(MockDiscovery::new(vec![api("500")]), reloader, config(dir.path()));

        r.run_cycle().await.unwrap();
        let second = r.run_cycle().await.unwrap();

        assert!(second.changed.is_empty());
        assert!(second.written.is_empty());
        assert_eq!(second.reload, ReloadOutcome::NotNeeded);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_skips_cycle() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let discovery = MockDiscovery::scripted(vec![Err("connection refused".to_string())]);
        let r = reconciler(discovery, reloader, cfg.clone());

        let result = r.run_cycle().await;

        assert!(matches!(result, Err(CycleError::Discovery(_))));
        assert!(!cfg.paths.load_balancer.exists());
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_writes() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let r = reconciler(
            MockDiscovery::new(vec![api("500")]),
            RecordingReloader::failing(),
            cfg.clone(),
        );

        let report = r.run_cycle().await.unwrap();

        assert!(matches!(report.reload, ReloadOutcome::Failed(_)));
        assert!(cfg.paths.load_balancer.is_file());
        assert_eq!(report.written.len(), 3);
    }

    #[tokio::test]
    async fn test_issuance_change_alone_does_not_reload() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let first = reconciler(MockDiscovery::new(vec![]), reloader, cfg.clone());
        first.run_cycle().await.unwrap();

        cfg.cluster.cluster_email = "ops@example.com".to_string();
        let reloader = RecordingReloader::new();
        let second_reloads = reloader.counter();
        let second = reconciler(MockDiscovery::new(vec![]), reloader, cfg);
        let report = second.run_cycle().await.unwrap();

        assert_eq!(report.changed, BTreeSet::from([Category::Issuance]));
        assert_eq!(report.reload, ReloadOutcome::NotNeeded);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(second_reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_shot_does_not_reload() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.one_shot = true;
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let discovery = MockDiscovery::new(vec![api("500")]);
        let calls = discovery.counter();
        let r = reconciler(discovery, reloader, cfg.clone());

        let (_tx, rx) = watch::channel(false);
        r.run(rx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
        assert!(cfg.paths.load_balancer.is_file());
    }

    #[tokio::test]
    async fn test_one_shot_returns_discovery_error() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.one_shot = true;
        let discovery = MockDiscovery::scripted(vec![Err("timeout".to_string())]);
        let r = reconciler(discovery, RecordingReloader::new(), cfg);

        let (_tx, rx) = watch::channel(false);
        assert!(r.run(rx).await.is_err());
    }

    #[tokio::test]
    async fn test_loop_survives_failures_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let discovery = MockDiscovery::scripted(vec![
            Err("connection refused".to_string()),
            Ok(vec![api("500")]),
        ]);
        let calls = discovery.counter();
        let r = reconciler(discovery, RecordingReloader::new(), config(dir.path()));

        let (tx, rx) = watch::channel(false);
        let stop = async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tx.send(true).unwrap();
        };

        let (result, _) = tokio::join!(r.run(rx), stop);
        assert!(result.is_ok());
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stale_sanitize_kept_by_default() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let discovery = MockDiscovery::scripted(vec![Ok(vec![api("500,502")]), Ok(vec![api("500")])]);
        let r = reconciler(discovery, RecordingReloader::new(), cfg.clone());

        r.run_cycle().await.unwrap();
        let report = r.run_cycle().await.unwrap();

        assert!(report.removed.is_empty());
        assert!(cfg.paths.sanitize_file("api.master.example.com-502").is_file());
    }

    #[tokio::test]
    async fn test_prune_removes_stale_sanitize() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.prune_sanitize = true;
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let discovery = MockDiscovery::scripted(vec![Ok(vec![api("500,502")]), Ok(vec![api("500")])]);
        let r = reconciler(discovery, reloader, cfg.clone());

        r.run_cycle().await.unwrap();
        std::fs::write(cfg.paths.sanitize_dir.join("notes.txt"), "keep me").unwrap();
        let report = r.run_cycle().await.unwrap();

        let stale = cfg.paths.sanitize_file("api.master.example.com-502");
        assert_eq!(report.removed, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(cfg.paths.sanitize_file("api.master.example.com-500").is_file());
        assert!(cfg.paths.sanitize_dir.join("notes.txt").is_file());
        assert!(report.changed.contains(&Category::Sanitize));
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_certificate_bundle_enables_https() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let r = reconciler(MockDiscovery::new(vec![api("500")]), RecordingReloader::new(), cfg.clone());

        r.run_cycle().await.unwrap();
        let without = std::fs::read_to_string(&cfg.paths.load_balancer).unwrap();
        assert!(!without.contains("ssl crt"));

        let bundle = https_bundle_path(&cfg.certbot_dir, "example.com");
        std::fs::create_dir_all(bundle.parent().unwrap()).unwrap();
        std::fs::write(&bundle, "PEM").unwrap();

        let report = r.run_cycle().await.unwrap();
        let with = std::fs::read_to_string(&cfg.paths.load_balancer).unwrap();
        assert!(with.contains("ssl crt"));
        assert!(report.changed.contains(&Category::LoadBalancer));
    }

    struct FailingRenderer;

    impl TemplateRenderer for FailingRenderer {
        fn render(&self, template: TemplateId, _bindings: &Bindings) -> Result<String, RenderError> {
            Err(RenderError::Template {
                template,
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_render_failure_aborts_cycle() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let r = reconciler(MockDiscovery::new(vec![api("500")]), RecordingReloader::new(), cfg.clone())
            .with_renderer(Box::new(FailingRenderer));

        assert!(matches!(r.run_cycle().await, Err(CycleError::Render(_))));
        assert!(!cfg.paths.load_balancer.exists());
    }

    /// Local disk, except for one path that cannot be read and one that
    /// cannot be written
    #[derive(Default)]
    struct FlakyFs {
        unreadable: Option<PathBuf>,
        unwritable: Option<PathBuf>,
    }

    impl ArtifactFs for FlakyFs {
        fn read_if_exists(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
            if self.unreadable.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            LocalFs.read_if_exists(path)
        }

        fn write(&self, path: &Path, content: &str) -> io::Result<()> {
            if self.unwritable.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            LocalFs.write(path, content)
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            LocalFs.create_dir_all(path)
        }

        fn is_file(&self, path: &Path) -> bool {
            LocalFs.is_file(path)
        }

        fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            LocalFs.list_dir(dir)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            LocalFs.remove(path)
        }
    }

    #[tokio::test]
    async fn test_write_failure_skips_only_that_artifact() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let broken = cfg.paths.sanitize_file("api.master.example.com-502");
        let fs = FlakyFs {
            unwritable: Some(broken.clone()),
            ..Default::default()
        };
        let r = reconciler(MockDiscovery::new(vec![api("500,502")]), RecordingReloader::new(), cfg.clone())
            .with_fs(Box::new(fs));

        let report = r.run_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.written.len(), 3);
        assert!(!broken.exists());
        assert!(cfg.paths.load_balancer.is_file());
        assert!(cfg.paths.sanitize_file("api.master.example.com-500").is_file());
        assert!(cfg.paths.issuance.is_file());
        assert_eq!(report.reload, ReloadOutcome::Reloaded { pid: 4242 });
    }

    #[tokio::test]
    async fn test_read_failure_skips_only_that_artifact() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let fs = FlakyFs {
            unreadable: Some(cfg.paths.issuance.clone()),
            ..Default::default()
        };
        let r = reconciler(MockDiscovery::new(vec![api("500,502")]), RecordingReloader::new(), cfg.clone())
            .with_fs(Box::new(fs));

        let report = r.run_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.written.len(), 3);
        assert!(!cfg.paths.issuance.exists());
        assert!(!report.changed.contains(&Category::Issuance));
        assert!(cfg.paths.load_balancer.is_file());
    }

    #[tokio::test]
    async fn test_failed_services_write_does_not_reload() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let reloader = RecordingReloader::new();
        let reloads = reloader.counter();
        let blog = ServiceRecord::new("blog")
            .with_tag(tags::EXPOSE, "true")
            .with_tag(tags::MODE, "http")
            .with_endpoint("10.0.0.1", 3000);
        let fs = FlakyFs {
            unwritable: Some(cfg.paths.load_balancer.clone()),
            ..Default::default()
        };
        let r = reconciler(MockDiscovery::new(vec![blog]), reloader, cfg.clone()).with_fs(Box::new(fs));

        let report = r.run_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.changed, BTreeSet::from([Category::Issuance]));
        assert_eq!(report.reload, ReloadOutcome::NotNeeded);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupt_services_file_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        std::fs::create_dir_all(cfg.paths.load_balancer.parent().unwrap()).unwrap();
        std::fs::write(&cfg.paths.load_balancer, [0xff, 0xfe, 0x00]).unwrap();
        let r = reconciler(MockDiscovery::new(vec![api("500")]), RecordingReloader::new(), cfg.clone());

        let report = r.run_cycle().await.unwrap();

        assert_eq!(report.failed, 0);
        assert!(report.written.contains(&cfg.paths.load_balancer));
        let services = std::fs::read_to_string(&cfg.paths.load_balancer).unwrap();
        assert!(services.contains("api.master.example.com"));
    }
}
