//! Application context and the job coordinator.
//!
//! The coordinator runs at most one sync and one download at a time
//! (single-flight: a second start is rejected, never queued), a periodic
//! enrichment pass, and keeps a short ring of human-readable log lines that
//! is mirrored onto the [`EventBus`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::OpenWebUiClient;
use crate::cache::SkipCache;
use crate::catalog::{CatalogApi, HumbleClient};
use crate::classify::{ClassifyRequest, Classifier};
use crate::config::AppConfig;
use crate::download::{DownloadObserver, Downloader, Locator, Target};
use crate::error::{Error, FailureReason, Result};
use crate::events::{Event, EventBus};
use crate::indexer::{Indexer, file_mirrors, product_meta, signed_links};
use crate::model::{Asset, TROVE_ORDER_ID};
use crate::stats::{FileStats, PassStats};
use crate::store::AssetStore;

/// Period of the background enrichment pass.
pub const ENRICH_INTERVAL: Duration = Duration::from_secs(120);

const LOG_CAPACITY: usize = 200;
const STATUS_LOG_LINES: usize = 20;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const LEGACY_CATEGORY: &str = "video";

static AI_WARNING: Once = Once::new();

/// The single-flight job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Sync,
    Download,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => f.write_str("sync"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Options for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    /// Overrides the configured trove flag.
    pub trove: Option<bool>,
    /// Runs a forced enrichment pass after indexing.
    pub force_meta: bool,
    /// Enumerates the account even when order ids are already known.
    pub full: bool,
}

/// Options for one download pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadRequest {
    /// Overrides the configured update flag.
    pub update: Option<bool>,
    /// Restricts the pass to trove (`true`) or purchase (`false`) assets.
    pub trove: Option<bool>,
    /// Overrides the configured worker count.
    pub workers: Option<usize>,
}

/// Snapshot of the coordinator's job state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub syncing: bool,
    pub downloading: bool,
    pub last_sync: Option<i64>,
    pub last_download: Option<i64>,
    pub download_done: usize,
    pub download_total: usize,
    pub download_skipped: usize,
    pub download_failed: usize,
    /// Most recent log lines, oldest first.
    pub logs: Vec<String>,
}

/// Result of a reclassification request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclassifyReport {
    pub updated: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct JobState {
    syncing: bool,
    downloading: bool,
    last_sync: Option<i64>,
    last_download: Option<i64>,
    done: usize,
    total: usize,
    skipped: usize,
    failed: usize,
    logs: VecDeque<String>,
}

impl JobState {
    const fn flag(&mut self, kind: JobKind) -> &mut bool {
        match kind {
            JobKind::Sync => &mut self.syncing,
            JobKind::Download => &mut self.downloading,
        }
    }
}

/// Owned dependencies shared by every job.
pub struct AppContext {
    store: Arc<AssetStore>,
    events: EventBus,
    config: RwLock<AppConfig>,
    catalog: RwLock<Option<Arc<dyn CatalogApi>>>,
    classifier: RwLock<Classifier>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Opens the store named by `config`, overlays its persisted settings and
    /// builds the remote clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(mut config: AppConfig) -> Result<Self> {
        let store = AssetStore::open(&config.paths.database_path())?;
        config.apply_settings(&store.settings()?);
        let catalog = build_catalog(&config);
        let classifier = build_classifier(&config)?;
        Ok(Self::new(config, Arc::new(store), catalog, classifier))
    }

    /// Assembles a context from already-built parts.
    #[must_use]
    pub fn new(
        config: AppConfig,
        store: Arc<AssetStore>,
        catalog: Option<Arc<dyn CatalogApi>>,
        classifier: Classifier,
    ) -> Self {
        Self {
            store,
            events: EventBus::default(),
            config: RwLock::new(config),
            catalog: RwLock::new(catalog),
            classifier: RwLock::new(classifier),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Returns a copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the catalog client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSession`] when no session is configured.
    pub fn catalog(&self) -> Result<Arc<dyn CatalogApi>> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::MissingSession)
    }

    #[must_use]
    pub fn classifier(&self) -> Classifier {
        self.classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persists settings and rebuilds whatever depends on them.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be stored.
    pub fn update_settings(&self, values: &HashMap<String, String>) -> Result<()> {
        self.store.set_settings(values)?;
        let previous = self.config();
        let mut config = previous.clone();
        config.apply_settings(values);

        if config.session != previous.session {
            *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = build_catalog(&config);
        }
        if config.ai != previous.ai {
            *self.classifier.write().unwrap_or_else(PoisonError::into_inner) =
                build_classifier(&config)?;
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Persisted settings merged over the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn settings(&self) -> Result<HashMap<String, String>> {
        let mut settings = self.config().to_settings();
        settings.extend(self.store.settings()?);
        Ok(settings)
    }
}

fn build_catalog(config: &AppConfig) -> Option<Arc<dyn CatalogApi>> {
    if config.session.is_empty() {
        return None;
    }
    match HumbleClient::new(&config.session, config.download.workers) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            log::warn!("Catalog client unavailable: {e}");
            None
        }
    }
}

fn build_classifier(config: &AppConfig) -> Result<Classifier> {
    Ok(match OpenWebUiClient::from_config(config)? {
        Some(client) => Classifier::with_suggester(Arc::new(client)),
        None => {
            AI_WARNING.call_once(|| {
                log::warn!("OpenWebUI not configured; skipping AI classification");
            });
            Classifier::new()
        }
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A spawned job and its cancellation handle.
struct JobHandle {
    kind: Option<JobKind>,
    id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    ctx: Arc<AppContext>,
    state: Mutex<JobState>,
    shutdown: CancellationToken,
    jobs: Mutex<Vec<JobHandle>>,
}

/// Clears a job's running flag when dropped.
struct FlightGuard {
    inner: Arc<Inner>,
    kind: JobKind,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        *self.inner.lock_state().flag(self.kind) = false;
    }
}

/// Runs sync, download and enrichment jobs over an [`AppContext`].
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    #[must_use]
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                state: Mutex::new(JobState::default()),
                shutdown: CancellationToken::new(),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<AppContext> {
        &self.inner.ctx
    }

    /// Token tripped once [`Coordinator::shutdown`] begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Migrates legacy categories, then starts the periodic enrichment loop.
    pub fn start_background(&self) {
        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.child_token();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            inner.migrate_legacy_categories().await;
            loop {
                inner.enrich(false, &loop_token).await;
                tokio::select! {
                    () = tokio::time::sleep(ENRICH_INTERVAL) => {}
                    () = loop_token.cancelled() => break,
                }
            }
            log::debug!("Enrichment loop stopped");
        });
        self.inner.track(None, token, handle);
    }

    /// Starts a sync pass in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a sync is in flight, or
    /// [`Error::MissingSession`] if no session is configured.
    pub fn start_sync(&self, request: SyncRequest) -> Result<Uuid> {
        let guard = self.inner.begin(JobKind::Sync)?;
        self.inner.ctx.catalog()?;
        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.child_token();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = inner.sync_job(&request, &job_token).await;
        });
        Ok(self.inner.track(Some(JobKind::Sync), token, handle))
    }

    /// Starts a download pass in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a download is in flight, or
    /// [`Error::MissingSession`] if no session is configured.
    pub fn start_download(&self, request: DownloadRequest) -> Result<Uuid> {
        let guard = self.inner.begin(JobKind::Download)?;
        self.inner.ctx.catalog()?;
        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.child_token();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = inner.download_job(&request, None, &job_token).await;
        });
        Ok(self.inner.track(Some(JobKind::Download), token, handle))
    }

    /// Runs a sync pass on the current task and returns the number of assets indexed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a sync is in flight, or the error
    /// that stopped the pass.
    pub async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<usize> {
        let _guard = self.inner.begin(JobKind::Sync)?;
        self.inner.sync_job(request, cancel).await
    }

    /// Runs a download pass on the current task.
    ///
    /// `observer` additionally receives every download callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a download is in flight, or the
    /// error that stopped the pass.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        observer: Option<&dyn DownloadObserver>,
        cancel: &CancellationToken,
    ) -> Result<PassStats> {
        let _guard = self.inner.begin(JobKind::Download)?;
        self.inner.download_job(request, observer, cancel).await
    }

    /// Runs one enrichment pass on the current task.
    pub async fn enrich(&self, force: bool, cancel: &CancellationToken) {
        self.inner.enrich(force, cancel).await;
    }

    /// Cancels the running sync and download jobs. Returns how many were signalled.
    pub fn cancel(&self) -> usize {
        let jobs = self.inner.lock_jobs();
        let mut signalled = 0;
        for job in jobs.iter().filter(|j| j.kind.is_some() && !j.handle.is_finished()) {
            log::debug!("Cancelling {:?} job {}", job.kind, job.id);
            job.token.cancel();
            signalled += 1;
        }
        drop(jobs);
        if signalled > 0 {
            self.inner.log("Cancellation requested");
        }
        signalled
    }

    /// Re-runs classification for `ids` (all assets when empty).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn reclassify(&self, ids: &[i64]) -> Result<ReclassifyReport> {
        let assets = self.inner.ctx.store.assets_for_reclassify(ids)?;
        let classifier = self.inner.ctx.classifier();
        let mut report = ReclassifyReport {
            total: assets.len(),
            ..ReclassifyReport::default()
        };
        for asset in &assets {
            let Some(id) = asset.id else { continue };
            let classification = classifier
                .classify_with_suggestions(&classify_request(asset))
                .await;
            if asset.category.as_deref() == Some(classification.primary.as_str()) {
                report.skipped += 1;
                continue;
            }
            self.inner.ctx.store.set_category(id, &classification.primary)?;
            self.inner.ctx.store.add_tags(id, &classification.all_tags())?;
            report.updated += 1;
        }
        self.inner.log(format!(
            "Reclassified {} of {} assets",
            report.updated, report.total
        ));
        Ok(report)
    }

    /// Snapshot of job flags, counters and recent log lines.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        let state = self.inner.lock_state();
        JobStatus {
            syncing: state.syncing,
            downloading: state.downloading,
            last_sync: state.last_sync,
            last_download: state.last_download,
            download_done: state.done,
            download_total: state.total,
            download_skipped: state.skipped,
            download_failed: state.failed,
            logs: state
                .logs
                .iter()
                .skip(state.logs.len().saturating_sub(STATUS_LOG_LINES))
                .cloned()
                .collect(),
        }
    }

    /// Every retained log line, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.inner.lock_state().logs.iter().cloned().collect()
    }

    /// Appends a line to the log ring and publishes it.
    pub fn log(&self, line: impl Into<String>) {
        self.inner.log(line);
    }

    /// Cancels everything, publishes the shutdown event and waits briefly for jobs.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.ctx.events.publish(Event::Shutdown);
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .lock_jobs()
            .drain(..)
            .map(|j| j.handle)
            .collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            log::warn!("Background jobs did not stop within {SHUTDOWN_GRACE:?}");
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<JobHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(self: &Arc<Self>, kind: JobKind) -> Result<FlightGuard> {
        let mut state = self.lock_state();
        let flag = state.flag(kind);
        if *flag {
            return Err(Error::AlreadyRunning(kind));
        }
        *flag = true;
        drop(state);
        Ok(FlightGuard {
            inner: Arc::clone(self),
            kind,
        })
    }

    fn track(&self, kind: Option<JobKind>, token: CancellationToken, handle: JoinHandle<()>) -> Uuid {
        let id = Uuid::new_v4();
        let mut jobs = self.lock_jobs();
        jobs.retain(|j| !j.handle.is_finished());
        jobs.push(JobHandle {
            kind,
            id,
            token,
            handle,
        });
        id
    }

    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        log::info!("{line}");
        {
            let mut state = self.lock_state();
            state.logs.push_back(line.clone());
            while state.logs.len() > LOG_CAPACITY {
                state.logs.pop_front();
            }
        }
        self.ctx.events.publish(Event::Log { line, ts: now() });
    }

    // ── Sync ──

    async fn sync_job(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<usize> {
        let config = self.ctx.config();
        let trove = request.trove.unwrap_or(config.filters.trove);
        self.log(if trove {
            "Sync started (trove)"
        } else {
            "Sync started"
        });
        self.ctx.events.publish(Event::SyncStart { trove });

        let result = self.sync_pass(request, trove, config, cancel).await;
        match &result {
            Ok(count) => {
                let ts = now();
                self.lock_state().last_sync = Some(ts);
                self.log(format!("Indexed {count} assets."));
                self.log_top_categories("Top categories after sync");
                self.ctx.events.publish(Event::SyncComplete { ts, assets: *count });
            }
            Err(e) => {
                self.log(format!("Index failed: {e}"));
                self.ctx.events.publish(Event::SyncFailed {
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn sync_pass(
        &self,
        request: &SyncRequest,
        trove: bool,
        config: AppConfig,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let catalog = self.ctx.catalog()?;
        let mut filters = config.filters;
        filters.trove = trove;
        let indexer = Indexer::new(
            catalog,
            self.ctx.classifier(),
            filters,
            config.paths.library_root,
        );

        let known = if trove || request.full {
            None
        } else {
            Some(self.ctx.store.distinct_order_ids(false)?).filter(|ids| !ids.is_empty())
        };
        let assets = indexer.collect(known, cancel).await?;

        let count = assets.len();
        let store = Arc::clone(&self.ctx.store);
        tokio::task::spawn_blocking(move || store.upsert(&assets)).await??;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if request.force_meta {
            self.enrich(true, cancel).await;
        }
        Ok(count)
    }

    // ── Download ──

    async fn download_job(
        &self,
        request: &DownloadRequest,
        extra: Option<&dyn DownloadObserver>,
        cancel: &CancellationToken,
    ) -> Result<PassStats> {
        let result = self.download_pass(request, extra, cancel).await;
        match &result {
            Ok(stats) if stats.aborted => {
                self.ctx.events.publish(Event::DownloadFailed {
                    error: "download pass aborted".into(),
                });
            }
            Ok(stats) => {
                let ts = now();
                let (done, total) = {
                    let mut state = self.lock_state();
                    state.last_download = Some(ts);
                    (state.done, state.total)
                };
                self.log(format!(
                    "Download finished: {done}/{total} items. Failures: {} Skipped: {}",
                    stats.failed, stats.skipped
                ));
                self.ctx.events.publish(Event::DownloadComplete {
                    ts,
                    done,
                    total,
                    skipped: stats.skipped,
                    failed: stats.failed,
                });
            }
            Err(e) => {
                self.log(format!("Download failed: {e}"));
                self.ctx.events.publish(Event::DownloadFailed {
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn download_pass(
        &self,
        request: &DownloadRequest,
        extra: Option<&dyn DownloadObserver>,
        cancel: &CancellationToken,
    ) -> Result<PassStats> {
        let config = self.ctx.config();
        let catalog = self.ctx.catalog()?;
        let root = config.paths.library_root.clone();

        let store = Arc::clone(&self.ctx.store);
        let trove = request.trove;
        let probe_root = root.clone();
        let (reconciled, pending) = tokio::task::spawn_blocking(move || -> Result<_> {
            let reconciled = store.reconcile(&probe_root)?;
            Ok((reconciled, store.pending_downloads(trove)?))
        })
        .await??;
        self.log(format!("Reconciled {reconciled} assets already on disk."));

        let targets = self.build_targets(&catalog, &pending, &root, cancel).await?;
        {
            let mut state = self.lock_state();
            state.done = 0;
            state.skipped = 0;
            state.failed = 0;
            state.total = targets.len();
        }
        self.log(format!(
            "Download pass: {} assets with URLs need download.",
            targets.len()
        ));
        self.ctx.events.publish(Event::DownloadStart {
            done: 0,
            total: targets.len(),
        });

        let mut download = config.download.clone();
        if let Some(update) = request.update {
            download.update = update;
        }
        if let Some(workers) = request.workers {
            download = download.with_workers(workers);
        }
        let cache = Arc::new(SkipCache::load(config.paths.cache_path()));
        let downloader = Downloader::new(catalog, download, cache);
        let observer = PassObserver {
            inner: self,
            extra,
        };
        Ok(downloader.download_all(&targets, &observer, cancel).await)
    }

    /// Builds targets for `pending`, swapping stored direct urls for the
    /// freshly signed ones each order currently serves.
    async fn build_targets(
        &self,
        catalog: &Arc<dyn CatalogApi>,
        pending: &[Asset],
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Target>> {
        let mut order_ids: Vec<&str> = Vec::new();
        for asset in pending.iter().filter(|a| !a.trove && !a.order_id.is_empty()) {
            if !order_ids.contains(&asset.order_id.as_str()) {
                order_ids.push(&asset.order_id);
            }
        }

        let mut links: HashMap<String, String> = HashMap::new();
        for order_id in order_ids {
            if cancel.is_cancelled() {
                break;
            }
            match catalog.order(order_id).await {
                Ok(order) => links.extend(signed_links(&order)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log::warn!("Could not refresh links for order {order_id}: {e}"),
            }
        }

        Ok(pending
            .iter()
            .filter_map(|asset| {
                let mut target = Target::from_asset(asset, root)?;
                if let Some(fresh) = links.get(&asset.url) {
                    target.locator = Locator::Direct(fresh.clone());
                }
                Some(target)
            })
            .collect())
    }

    // ── Enrichment ──

    /// Only the order metadata step needs a session; it returns early without one.
    async fn enrich(&self, force: bool, cancel: &CancellationToken) {
        if let Err(e) = self.classify_missing(force, cancel).await {
            log::error!("Classification pass failed: {e}");
        }
        if let Err(e) = self.backfill_category_tags() {
            log::error!("Category tag backfill failed: {e}");
        }
        if let Err(e) = self.fill_meta_from_orders(force, cancel).await {
            log::error!("Order metadata pass failed: {e}");
        }
        if let Err(e) = self.fill_descriptions_ai(force, cancel).await {
            log::error!("AI description pass failed: {e}");
        }
        self.log_top_categories("Metadata pass complete. Top categories now");
    }

    async fn classify_missing(&self, force: bool, cancel: &CancellationToken) -> Result<()> {
        let store = &self.ctx.store;
        let mut assets = store.assets_missing_category(if force { 100 } else { 25 })?;
        if force && assets.is_empty() {
            assets = store.assets_for_reclassify(&[])?;
            assets.truncate(50);
        }
        let classifier = self.ctx.classifier();
        for asset in &assets {
            if cancel.is_cancelled() {
                break;
            }
            let Some(id) = asset.id else { continue };
            let classification = classifier
                .classify_with_suggestions(&classify_request(asset))
                .await;
            let stored = store
                .set_category(id, &classification.primary)
                .and_then(|()| store.add_tags(id, &classification.all_tags()));
            match stored {
                Ok(()) => self.log(format!(
                    "Category set for {}: {}",
                    asset.file_name, classification.primary
                )),
                Err(e) => log::warn!("Failed to categorize asset {id}: {e}"),
            }
        }
        Ok(())
    }

    fn backfill_category_tags(&self) -> Result<()> {
        let assets = self.ctx.store.assets_missing_category_tag(250)?;
        if assets.is_empty() {
            return Ok(());
        }
        for asset in &assets {
            let (Some(id), Some(category)) = (asset.id, asset.category.clone()) else {
                continue;
            };
            if let Err(e) = self.ctx.store.add_tags(id, &[category]) {
                log::warn!("Failed adding category tag for {id}: {e}");
            }
        }
        self.log(format!(
            "Added missing category tags to {} assets",
            assets.len()
        ));
        Ok(())
    }

    async fn fill_meta_from_orders(&self, force: bool, cancel: &CancellationToken) -> Result<()> {
        let Ok(catalog) = self.ctx.catalog() else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let targets = if force {
            store.assets_for_orders(500)?
        } else {
            let mut targets = store.assets_missing_image(30)?;
            targets.extend(store.assets_missing_description(30)?);
            targets
        };

        let mut by_order: Vec<(String, Vec<Asset>)> = Vec::new();
        for asset in targets {
            if asset.order_id.is_empty() || asset.order_id == TROVE_ORDER_ID {
                continue;
            }
            match by_order.iter_mut().find(|(id, _)| *id == asset.order_id) {
                Some((_, group)) => {
                    if !group.iter().any(|a| a.id == asset.id) {
                        group.push(asset);
                    }
                }
                None => by_order.push((asset.order_id.clone(), vec![asset])),
            }
        }

        for (order_id, assets) in by_order {
            if cancel.is_cancelled() {
                break;
            }
            let order = match catalog.order(&order_id).await {
                Ok(order) => order,
                Err(e) => {
                    log::warn!("Could not fetch order {order_id} for metadata: {e}");
                    continue;
                }
            };
            let meta = product_meta(&order);
            let mirrors: HashMap<String, Vec<String>> = file_mirrors(&order).into_iter().collect();
            for asset in &assets {
                let Some(id) = asset.id else { continue };
                let entry = meta
                    .iter()
                    .find(|m| m.product_title == asset.product_title)
                    .or_else(|| meta.iter().find(|m| m.product_title == asset.file_name));
                if let Some(entry) = entry {
                    if let Some(image) = &entry.image_url {
                        store.set_image_url(id, image)?;
                        self.log(format!("Set image for {}", asset.product_title));
                    }
                    if let Some(description) = &entry.description {
                        store.set_description(id, description)?;
                        self.log(format!("Set description for {}", asset.product_title));
                    }
                }
                if asset.download_urls.is_empty()
                    && let Some(urls) = mirrors.get(&asset.url)
                {
                    store.set_download_urls(id, urls)?;
                }
            }
        }
        Ok(())
    }

    async fn fill_descriptions_ai(&self, force: bool, cancel: &CancellationToken) -> Result<()> {
        let classifier = self.ctx.classifier();
        let Some(suggester) = classifier.suggester() else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let mut assets = store.assets_missing_description(if force { 40 } else { 10 })?;
        if force && assets.is_empty() {
            assets = store.assets_for_reclassify(&[])?;
            assets.truncate(20);
        }
        for asset in &assets {
            if cancel.is_cancelled() {
                break;
            }
            let Some(id) = asset.id else { continue };
            let Some(description) = suggester.describe(&classify_request(asset)).await else {
                self.log("AI description generation returned nothing");
                continue;
            };
            store.set_description(id, &description)?;
            store.add_tags(id, &["ai-described".to_string()])?;
            let preview: String = description.chars().take(120).collect();
            self.log(format!(
                "AI description added for {}: {preview}",
                asset.product_title
            ));
        }
        Ok(())
    }

    /// Reclassifies assets stored under a retired category.
    async fn migrate_legacy_categories(&self) {
        let assets = match self.ctx.store.assets_by_category(LEGACY_CATEGORY) {
            Ok(assets) => assets,
            Err(e) => {
                log::error!("Legacy category lookup failed: {e}");
                return;
            }
        };
        if assets.is_empty() {
            return;
        }
        let classifier = self.ctx.classifier();
        let mut updated = 0;
        for asset in &assets {
            let Some(id) = asset.id else { continue };
            let classification = classifier
                .classify_with_suggestions(&classify_request(asset))
                .await;
            if classification.primary == LEGACY_CATEGORY {
                continue;
            }
            let stored = self
                .ctx
                .store
                .set_category(id, &classification.primary)
                .and_then(|()| self.ctx.store.add_tags(id, &classification.all_tags()));
            match stored {
                Ok(()) => updated += 1,
                Err(e) => log::warn!("Failed to migrate asset {id}: {e}"),
            }
        }
        if updated > 0 {
            log::info!("Reclassified {updated} assets from {LEGACY_CATEGORY}");
        }
    }

    fn log_top_categories(&self, prefix: &str) {
        match self.ctx.store.category_counts(10) {
            Ok(counts) => {
                let summary = counts
                    .iter()
                    .map(|c| {
                        format!(
                            "{}:{}",
                            c.category.as_deref().unwrap_or("unknown"),
                            c.count
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                self.log(format!("{prefix}: {summary}"));
            }
            Err(e) => log::warn!("Category counts unavailable: {e}"),
        }
    }
}

fn classify_request(asset: &Asset) -> ClassifyRequest<'_> {
    ClassifyRequest {
        file_name: &asset.file_name,
        platform: &asset.platform,
        bundle_title: &asset.bundle_title,
        product_title: &asset.product_title,
    }
}

/// Mirrors download outcomes into the store, the counters and the event bus.
struct PassObserver<'a> {
    inner: &'a Inner,
    extra: Option<&'a dyn DownloadObserver>,
}

impl PassObserver<'_> {
    fn progress(&self, target: &Target, update: impl FnOnce(&mut JobState)) {
        let event = {
            let mut state = self.inner.lock_state();
            update(&mut state);
            Event::DownloadProgress {
                done: state.done,
                total: state.total,
                skipped: state.skipped,
                failed: state.failed,
                file: target.name().to_string(),
            }
        };
        self.inner.ctx.events.publish(event);
    }

    fn mark_present(&self, target: &Target) {
        if let Err(e) = self.inner.ctx.store.mark_downloaded(&target.url, &target.dest) {
            log::error!("Failed to record download of {}: {e}", target.url);
        }
    }
}

impl DownloadObserver for PassObserver<'_> {
    fn on_start(&self, target: &Target, size: Option<u64>) {
        if let Some(extra) = self.extra {
            extra.on_start(target, size);
        }
    }

    fn on_progress(&self, target: &Target, bytes_delta: u64, speed: u64) {
        if let Some(extra) = self.extra {
            extra.on_progress(target, bytes_delta, speed);
        }
    }

    fn on_success(&self, target: &Target, stats: &FileStats) {
        self.mark_present(target);
        self.progress(target, |s| s.done += 1);
        if let Some(extra) = self.extra {
            extra.on_success(target, stats);
        }
    }

    fn on_skip(&self, target: &Target) {
        self.mark_present(target);
        self.progress(target, |s| s.skipped += 1);
        if let Some(extra) = self.extra {
            extra.on_skip(target);
        }
    }

    fn on_failure(&self, target: &Target, reason: &FailureReason) {
        if let Err(e) = self
            .inner
            .ctx
            .store
            .mark_download_error(&target.url, &reason.tag())
        {
            log::error!("Failed to record error for {}: {e}", target.url);
        }
        self.inner
            .log(format!("Download failed for {}: {reason}", target.name()));
        self.progress(target, |s| s.failed += 1);
        if let Some(extra) = self.extra {
            extra.on_failure(target, reason);
        }
    }

    fn on_abort(&self, error: &Error) {
        self.inner.log(format!("Download aborted: {error}"));
        if let Some(extra) = self.extra {
            extra.on_abort(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::tests::{MockCatalog, sample_order};
    use crate::model::AssetQuery;

    fn context(catalog: Option<MockCatalog>) -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.session = "test".into();
        config.paths.library_root = dir.path().join("library");
        config.paths.data_dir = dir.path().join("data");
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let catalog = catalog.map(|c| Arc::new(c) as Arc<dyn CatalogApi>);
        (
            Arc::new(AppContext::new(config, store, catalog, Classifier::new())),
            dir,
        )
    }

    fn catalog_with_sample() -> MockCatalog {
        let mut mock = MockCatalog {
            keys: vec!["K1".into()],
            ..MockCatalog::default()
        };
        mock.orders.insert("K1".into(), sample_order());
        mock
    }

    #[test]
    fn job_kind_display() {
        assert_eq!(JobKind::Sync.to_string(), "sync");
        assert_eq!(
            Error::AlreadyRunning(JobKind::Download).to_string(),
            "download already in progress"
        );
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let (ctx, _dir) = context(Some(catalog_with_sample()));
        let coordinator = Coordinator::new(ctx);
        coordinator.start_sync(SyncRequest::default()).unwrap();
        assert!(coordinator.status().syncing);
        assert!(matches!(
            coordinator.start_sync(SyncRequest::default()),
            Err(Error::AlreadyRunning(JobKind::Sync))
        ));
        coordinator.shutdown().await;
        assert!(!coordinator.status().syncing);
    }

    #[tokio::test]
    async fn start_without_session_is_rejected_and_flag_reset() {
        let (ctx, _dir) = context(None);
        let coordinator = Coordinator::new(ctx);
        assert!(matches!(
            coordinator.start_download(DownloadRequest::default()),
            Err(Error::MissingSession)
        ));
        assert!(!coordinator.status().downloading);
    }

    #[tokio::test]
    async fn sync_indexes_and_publishes() {
        let (ctx, _dir) = context(Some(catalog_with_sample()));
        let mut events = ctx.events().subscribe().into_inner();
        let coordinator = Coordinator::new(Arc::clone(&ctx));

        let count = coordinator
            .sync(&SyncRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(ctx.store().stats(None).unwrap().total, 4);
        assert!(coordinator.status().last_sync.is_some());

        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::SyncComplete { assets: 4, .. }) {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn download_pass_records_failures_on_rows() {
        let (ctx, _dir) = context(Some(catalog_with_sample()));
        let coordinator = Coordinator::new(Arc::clone(&ctx));
        coordinator
            .sync(&SyncRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        let stats = coordinator
            .download(
                &DownloadRequest::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // The mock serves every file with status 500.
        assert_eq!(stats.failed, 2);
        let status = coordinator.status();
        assert_eq!(status.download_total, 2);
        assert_eq!(status.download_failed, 2);
        let page = ctx
            .store()
            .search(&AssetQuery {
                ext: Some("pdf".into()),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!(page.items[0].download_error.as_deref(), Some("status_500"));
    }

    #[tokio::test]
    async fn enrichment_fills_category_tags_and_meta() {
        let (ctx, _dir) = context(Some(catalog_with_sample()));
        let stub = Asset {
            order_id: "K1".into(),
            bundle_title: "Book - Bundle".into(),
            product_title: "Great Book".into(),
            file_name: "great.pdf".into(),
            url: "https://dl.example/great.pdf".into(),
            ext: "pdf".into(),
            ..Asset::default()
        };
        let ids = ctx.store().upsert(&[stub]).unwrap();
        let coordinator = Coordinator::new(Arc::clone(&ctx));

        coordinator.enrich(false, &CancellationToken::new()).await;

        let asset = ctx.store().get_asset(ids[0]).unwrap().unwrap();
        assert_eq!(asset.category.as_deref(), Some("ebook"));
        assert!(asset.tags.contains(&"ebook".to_string()));
        assert_eq!(asset.image_url.as_deref(), Some("https://img/great.png"));
        assert_eq!(asset.description.as_deref(), Some("A great book"));
        assert_eq!(asset.download_urls, vec!["https://dl.example/great.pdf"]);
    }

    #[tokio::test]
    async fn background_download_clears_flag_when_done() {
        let (ctx, _dir) = context(Some(catalog_with_sample()));
        let coordinator = Coordinator::new(Arc::clone(&ctx));
        coordinator
            .sync(&SyncRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        coordinator.start_download(DownloadRequest::default()).unwrap();
        assert!(coordinator.status().downloading);
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.status().downloading {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let status = coordinator.status();
        assert_eq!(status.download_total, 2);
        assert!(status.last_download.is_some());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn trove_asset_without_machine_name_is_a_failure() {
        let (ctx, _dir) = context(Some(MockCatalog::default()));
        let asset = Asset {
            trove: true,
            bundle_title: "Humble Trove".into(),
            product_title: "Game".into(),
            file_name: "game.zip".into(),
            url: "https://dl.example/game.zip".into(),
            ..Asset::default()
        };
        let ids = ctx.store().upsert(&[asset]).unwrap();
        let coordinator = Coordinator::new(Arc::clone(&ctx));

        let stats = coordinator
            .download(&DownloadRequest::default(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(coordinator.status().download_failed, 1);
        let stored = ctx.store().get_asset(ids[0]).unwrap().unwrap();
        assert_eq!(stored.download_error.as_deref(), Some("missing_machine_name"));
        assert!(!stored.downloaded);
    }

    #[tokio::test]
    async fn enrichment_classifies_without_a_session() {
        let (ctx, _dir) = context(None);
        let stub = Asset {
            order_id: "K1".into(),
            product_title: "Great Book".into(),
            file_name: "great.pdf".into(),
            url: "https://dl.example/great.pdf".into(),
            ext: "pdf".into(),
            ..Asset::default()
        };
        let ids = ctx.store().upsert(&[stub]).unwrap();
        let coordinator = Coordinator::new(Arc::clone(&ctx));

        coordinator.enrich(false, &CancellationToken::new()).await;

        let asset = ctx.store().get_asset(ids[0]).unwrap().unwrap();
        assert_eq!(asset.category.as_deref(), Some("ebook"));
        assert!(asset.tags.contains(&"ebook".to_string()));
        assert!(asset.image_url.is_none());
    }

    #[tokio::test]
    async fn legacy_category_is_migrated_on_start() {
        let (ctx, _dir) = context(None);
        let legacy = Asset {
            order_id: "K1".into(),
            product_title: "Course".into(),
            file_name: "lesson.mp4".into(),
            url: "https://dl/lesson.mp4".into(),
            category: Some(LEGACY_CATEGORY.into()),
            ..Asset::default()
        };
        let ids = ctx.store().upsert(&[legacy]).unwrap();
        let coordinator = Coordinator::new(Arc::clone(&ctx));
        coordinator.inner.migrate_legacy_categories().await;
        let asset = ctx.store().get_asset(ids[0]).unwrap().unwrap();
        assert_ne!(asset.category.as_deref(), Some(LEGACY_CATEGORY));
    }

    #[tokio::test]
    async fn log_ring_is_bounded() {
        let (ctx, _dir) = context(None);
        let coordinator = Coordinator::new(ctx);
        for i in 0..(LOG_CAPACITY + 10) {
            coordinator.log(format!("line {i}"));
        }
        let logs = coordinator.logs();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert_eq!(logs[0], "line 10");
        assert_eq!(coordinator.status().logs.len(), STATUS_LOG_LINES);
    }

    #[tokio::test]
    async fn settings_update_rebuilds_catalog() {
        let (ctx, _dir) = context(None);
        assert!(ctx.catalog().is_err());
        ctx.update_settings(&HashMap::from([(
            "session_cookie".to_string(),
            "fresh".to_string(),
        )]))
        .unwrap();
        assert!(ctx.catalog().is_ok());
        assert_eq!(ctx.config().session, "fresh");
        assert_eq!(
            ctx.settings().unwrap().get("session_cookie").map(String::as_str),
            Some("fresh")
        );
    }
}
