//! Core download logic: skip decisions, streaming writes and the worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{BoxStream, FuturesUnordered};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, SkipCache};
use crate::catalog::CatalogApi;
use crate::config::DownloadConfig;
use crate::error::{Error, FailureReason, Result};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::model::Asset;
use crate::stats::{DownloadStatsTracker, FileStats, PassStats, PassStatsBuilder};

/// `Last-Modified` layout, also used when recording the fetch time.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Where the bytes of a target come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A url that can be fetched as is.
    Direct(String),
    /// A trove file that needs a freshly signed url.
    Trove {
        machine_name: String,
        file_name: String,
    },
}

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Canonical url identifying the asset.
    pub url: String,
    pub locator: Locator,
    pub dest: PathBuf,
    pub cache_key: String,
    /// Remote hints recorded in the cache after a successful fetch.
    pub uploaded_at: Option<String>,
    pub md5: Option<String>,
}

impl Target {
    /// Builds a target for a stored asset, or `None` if it has nothing to fetch.
    ///
    /// A trove asset without a machine name still yields a target; the
    /// downloader reports it as failed. The destination is the recorded
    /// download path when there is one, otherwise the deterministic library
    /// path.
    #[must_use]
    pub fn from_asset(asset: &Asset, library_root: &Path) -> Option<Self> {
        if !asset.has_url() {
            return None;
        }
        let locator = if asset.trove {
            Locator::Trove {
                machine_name: asset.machine_name.clone().unwrap_or_default(),
                file_name: asset.file_name.clone(),
            }
        } else {
            let url = asset
                .download_urls
                .first()
                .cloned()
                .unwrap_or_else(|| asset.url.clone());
            Locator::Direct(url)
        };
        let dest = asset
            .download_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map_or_else(|| asset.library_path(library_root), PathBuf::from);
        Some(Self {
            url: asset.url.clone(),
            locator,
            dest,
            cache_key: asset.cache_key(),
            uploaded_at: asset.uploaded_at.clone(),
            md5: asset.md5.clone(),
        })
    }

    /// File name shown in progress output.
    #[must_use]
    pub fn name(&self) -> &str {
        self.dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(self.url.as_str())
    }

    const fn is_trove(&self) -> bool {
        matches!(self.locator, Locator::Trove { .. })
    }
}

/// Final state of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Downloaded(FileStats),
    Skipped,
    Failed(FailureReason),
    /// Abandoned because the pass was cancelled; not an error.
    Cancelled,
}

/// Trait for receiving download outcomes and progress.
///
/// Every target ends in exactly one of `on_success`, `on_skip` or
/// `on_failure`, unless the pass is cancelled before it finishes. All methods
/// have default no-op implementations.
pub trait DownloadObserver: Send + Sync {
    /// Called when the body of a target starts streaming.
    fn on_start(&self, _target: &Target, _size: Option<u64>) {}

    /// Called after each chunk is written, with the bytes written since the last call.
    fn on_progress(&self, _target: &Target, _bytes_delta: u64, _speed: u64) {}

    /// Called when a target was written and renamed into place.
    fn on_success(&self, _target: &Target, _stats: &FileStats) {}

    /// Called when a target needed no fetch.
    fn on_skip(&self, _target: &Target) {}

    /// Called when a target failed.
    fn on_failure(&self, _target: &Target, _reason: &FailureReason) {}

    /// Called once when a fatal error stops the whole pass.
    fn on_abort(&self, _error: &Error) {}
}

/// A null observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl DownloadObserver for NoProgress {}

/// Why a body write stopped early.
enum Halt {
    Cancelled,
    Failed(FailureReason),
}

impl From<std::io::Error> for Halt {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(FailureReason::Filesystem(e.to_string()))
    }
}

/// Returns the `.part` file path for a destination.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Returns `dir/name_<date>.ext` for `dir/name.ext`.
fn versioned_path(dest: &Path, date: &str) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match dest.extension() {
        Some(ext) => format!("{stem}_{date}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{date}"),
    };
    dest.with_file_name(name)
}

/// Date stamp of the previously fetched version, if the cache knows it.
///
/// Direct files use the recorded `Last-Modified`; trove files their upload
/// timestamp.
fn previous_version_date(entry: &CacheEntry, trove: bool) -> Option<String> {
    let stamp: DateTime<Utc> = if trove {
        let raw = entry.uploaded_at.as_deref()?.trim();
        #[allow(clippy::cast_possible_truncation)]
        let secs = raw.parse::<f64>().ok().map(|s| s as i64);
        match secs {
            Some(secs) => Utc.timestamp_opt(secs, 0).single()?,
            None => DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc),
        }
    } else {
        let raw = entry.url_last_modified.as_deref()?.trim();
        DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc)
    };
    Some(stamp.format("%Y-%m-%d").to_string())
}

fn request_failure(e: &Error) -> FailureReason {
    match e {
        Error::Status { status, .. } => FailureReason::Status(*status),
        Error::Io(io) => FailureReason::Filesystem(io.to_string()),
        other => FailureReason::Request(other.to_string()),
    }
}

/// Downloader that fetches targets through a [`CatalogApi`].
pub struct Downloader<F: FileSystem = TokioFileSystem> {
    catalog: Arc<dyn CatalogApi>,
    config: DownloadConfig,
    cache: Arc<SkipCache>,
    fs: F,
}

impl Downloader<TokioFileSystem> {
    /// Creates a new downloader with the default file system.
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogApi>, config: DownloadConfig, cache: Arc<SkipCache>) -> Self {
        Self::with_fs(catalog, config, cache, TokioFileSystem)
    }
}

impl<F: FileSystem> Downloader<F> {
    /// Creates a new downloader with a custom file system implementation.
    #[must_use]
    pub fn with_fs(
        catalog: Arc<dyn CatalogApi>,
        config: DownloadConfig,
        cache: Arc<SkipCache>,
        fs: F,
    ) -> Self {
        Self {
            catalog,
            config,
            cache,
            fs,
        }
    }

    /// Returns a reference to the download configuration.
    #[must_use]
    pub const fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Returns the shared skip-cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<SkipCache> {
        &self.cache
    }

    /// Decides from the cache and the disk alone whether a target can be skipped.
    ///
    /// A cache entry only counts when the destination still has content. In
    /// update mode trove files are re-fetched unless their upload time or md5
    /// still matches; direct files are left to the `Last-Modified` check.
    async fn should_skip(&self, target: &Target) -> bool {
        let Some(entry) = self.cache.get(&target.cache_key) else {
            return false;
        };
        if !self.fs.has_content(&target.dest).await {
            return false;
        }
        if !self.config.update {
            return true;
        }
        target.is_trove()
            && ((target.uploaded_at.is_some() && entry.uploaded_at == target.uploaded_at)
                || (target.md5.is_some() && entry.md5 == target.md5))
    }

    async fn resolve_url(&self, target: &Target) -> Result<String> {
        match &target.locator {
            Locator::Direct(url) => Ok(url.clone()),
            Locator::Trove {
                machine_name,
                file_name,
            } => self.catalog.sign_trove_url(machine_name, file_name).await,
        }
    }

    /// Fetches one target.
    ///
    /// Only pass-level fatal errors (trove access, session) are returned as
    /// `Err`; everything else resolves to an [`Outcome`].
    ///
    /// # Errors
    ///
    /// Returns the error when it must stop the whole pass.
    pub async fn download_target(
        &self,
        target: &Target,
        observer: &dyn DownloadObserver,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if self.should_skip(target).await {
            log::debug!("Skipping cached {}", target.dest.display());
            return Ok(Outcome::Skipped);
        }
        if let Locator::Trove { machine_name, .. } = &target.locator
            && machine_name.is_empty()
        {
            return Ok(Outcome::Failed(FailureReason::MissingMachineName));
        }

        let url = tokio::select! {
            res = self.resolve_url(target) => match res {
                Ok(url) => url,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(Outcome::Failed(request_failure(&e))),
            },
            () = cancel.cancelled() => return Ok(Outcome::Cancelled),
        };

        let remote = tokio::select! {
            res = self.catalog.open_download(&url) => match res {
                Ok(remote) => remote,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(Outcome::Failed(request_failure(&e))),
            },
            () = cancel.cancelled() => return Ok(Outcome::Cancelled),
        };
        if !remote.is_success() {
            return Ok(Outcome::Failed(FailureReason::Status(remote.status)));
        }

        let cached = self.cache.get(&target.cache_key);
        let has_content = self.fs.has_content(&target.dest).await;
        if !target.is_trove()
            && has_content
            && remote.last_modified.is_some()
            && cached.as_ref().and_then(|c| c.url_last_modified.as_ref()) == remote.last_modified.as_ref()
        {
            log::debug!("Unchanged remote for {}", target.dest.display());
            return Ok(Outcome::Skipped);
        }

        if let Err(e) = self.prepare_destination(target, cached.as_ref(), has_content).await {
            return Ok(Outcome::Failed(FailureReason::Filesystem(e.to_string())));
        }

        let part = part_path(&target.dest);
        let tracker = DownloadStatsTracker::new();
        observer.on_start(target, remote.content_length);
        let written = self
            .write_body(&part, remote.body, remote.content_length, target, observer, &tracker, cancel)
            .await;
        if let Err(halt) = written {
            let _ = self.fs.remove_file(&part).await;
            return Ok(match halt {
                Halt::Cancelled => Outcome::Cancelled,
                Halt::Failed(reason) => Outcome::Failed(reason),
            });
        }

        if let Err(e) = self.fs.rename_file(&part, &target.dest).await {
            let _ = self.fs.remove_file(&part).await;
            return Ok(Outcome::Failed(FailureReason::Filesystem(e.to_string())));
        }

        let entry = CacheEntry {
            uploaded_at: target.uploaded_at.clone(),
            md5: target.md5.clone(),
            url_last_modified: Some(
                remote
                    .last_modified
                    .unwrap_or_else(|| Utc::now().format(HTTP_DATE).to_string()),
            ),
        };
        if let Err(e) = self.cache.record_async(target.cache_key.clone(), entry).await {
            log::error!("Failed to persist cache {}: {e}", self.cache.path().display());
        }

        Ok(Outcome::Downloaded(tracker.into_file_stats()))
    }

    /// Creates the parent directory and moves a previous version aside.
    async fn prepare_destination(
        &self,
        target: &Target,
        cached: Option<&CacheEntry>,
        has_content: bool,
    ) -> std::io::Result<()> {
        if let Some(parent) = target
            .dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            self.fs.create_dir_all(parent).await?;
        }
        if has_content
            && let Some(date) = cached.and_then(|c| previous_version_date(c, target.is_trove()))
        {
            let old = versioned_path(&target.dest, &date);
            log::info!("Keeping previous version as {}", old.display());
            self.fs.rename_file(&target.dest, &old).await?;
        }
        Ok(())
    }

    /// Streams `body` into `part` in chunks of at most `chunk_size` bytes.
    #[allow(clippy::too_many_arguments)]
    async fn write_body(
        &self,
        part: &Path,
        mut body: BoxStream<'static, Result<Bytes>>,
        expected: Option<u64>,
        target: &Target,
        observer: &dyn DownloadObserver,
        tracker: &DownloadStatsTracker,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        let mut file = self.fs.create_file(part).await?;
        loop {
            let next = tokio::select! {
                next = body.next() => next,
                () = cancel.cancelled() => return Err(Halt::Cancelled),
            };
            let Some(chunk) = next else { break };
            let chunk =
                chunk.map_err(|e| Halt::Failed(FailureReason::Request(e.to_string())))?;
            for piece in chunk.chunks(self.config.chunk_size.max(1)) {
                if cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                file.write_all(piece).await?;
                let delta = piece.len() as u64;
                let speed = tracker.record_bytes(delta);
                observer.on_progress(target, delta, speed);
            }
        }
        file.flush().await?;
        drop(file);

        let actual = tracker.downloaded();
        if let Some(expected) = expected {
            if actual < expected {
                return Err(Halt::Failed(FailureReason::SizeMismatch { expected, actual }));
            }
            if actual > expected {
                log::warn!(
                    "{} is larger than announced: {actual} of {expected} bytes",
                    target.name()
                );
            }
        }
        Ok(())
    }

    /// Runs one target and reports its outcome. Returns the outcome and
    /// whether the pass must stop.
    async fn run_one(
        &self,
        target: &Target,
        observer: &dyn DownloadObserver,
        cancel: &CancellationToken,
    ) -> (Outcome, bool) {
        let (outcome, fatal) = match self.download_target(target, observer, cancel).await {
            Ok(outcome) => (outcome, false),
            Err(e) => {
                log::error!("Download pass aborted: {e}");
                cancel.cancel();
                observer.on_abort(&e);
                (Outcome::Failed(FailureReason::Request(e.to_string())), true)
            }
        };
        match &outcome {
            Outcome::Downloaded(stats) => observer.on_success(target, stats),
            Outcome::Skipped => observer.on_skip(target),
            Outcome::Failed(reason) => {
                log::warn!("Download failed for {}: {reason}", target.name());
                observer.on_failure(target, reason);
            }
            Outcome::Cancelled => {}
        }
        (outcome, fatal)
    }

    /// Downloads all targets and returns pass statistics.
    ///
    /// With one worker targets run strictly in order; otherwise up to
    /// `workers` run at once in no particular order. Tripping `cancel` stops
    /// new work: targets not yet started resolve as cancelled without any
    /// network call. A fatal error cancels the rest of the pass and marks the
    /// stats as aborted.
    pub async fn download_all(
        &self,
        targets: &[Target],
        observer: &dyn DownloadObserver,
        cancel: &CancellationToken,
    ) -> PassStats {
        let mut builder = PassStatsBuilder::new();
        if targets.is_empty() {
            return builder.build();
        }
        let pass = cancel.child_token();

        if self.config.is_sequential() {
            for target in targets {
                let result = self.run_one(target, observer, &pass).await;
                record(&mut builder, result);
            }
        } else {
            let mut queue = targets.iter();
            let mut pool = FuturesUnordered::new();
            for target in queue.by_ref().take(self.config.workers.max(1)) {
                pool.push(self.run_one(target, observer, &pass));
            }
            while let Some(result) = pool.next().await {
                record(&mut builder, result);
                if let Some(target) = queue.next() {
                    pool.push(self.run_one(target, observer, &pass));
                }
            }
        }

        let stats = builder.build();
        log::info!(
            "Download pass finished: {} downloaded, {} skipped, {} failed, {} cancelled",
            stats.downloaded,
            stats.skipped,
            stats.failed,
            stats.cancelled
        );
        stats
    }
}

fn record(builder: &mut PassStatsBuilder, (outcome, fatal): (Outcome, bool)) {
    match outcome {
        Outcome::Downloaded(stats) => builder.add_download(&stats),
        Outcome::Skipped => builder.add_skip(),
        Outcome::Failed(_) => builder.add_failure(),
        Outcome::Cancelled => builder.add_cancelled(),
    }
    if fatal {
        builder.set_aborted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Order, RemoteFile, TroveProduct};
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn no_progress_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoProgress>();
    }

    #[test]
    fn part_path_appends_extension() {
        assert_eq!(
            part_path(Path::new("foo/bar.zip")),
            PathBuf::from("foo/bar.zip.part")
        );
    }

    #[test]
    fn versioned_path_keeps_extension() {
        assert_eq!(
            versioned_path(Path::new("lib/B/P/book.pdf"), "2024-01-02"),
            PathBuf::from("lib/B/P/book_2024-01-02.pdf")
        );
        assert_eq!(
            versioned_path(Path::new("lib/README"), "2024-01-02"),
            PathBuf::from("lib/README_2024-01-02")
        );
    }

    #[test]
    fn previous_version_date_sources() {
        let direct = CacheEntry {
            url_last_modified: Some("Tue, 02 Jan 2024 10:00:00 GMT".into()),
            ..CacheEntry::default()
        };
        assert_eq!(previous_version_date(&direct, false).as_deref(), Some("2024-01-02"));
        assert_eq!(previous_version_date(&direct, true), None);

        let trove = CacheEntry {
            uploaded_at: Some("1700000000".into()),
            ..CacheEntry::default()
        };
        assert_eq!(previous_version_date(&trove, true).as_deref(), Some("2023-11-14"));
        assert_eq!(previous_version_date(&CacheEntry::default(), false), None);
    }

    #[test]
    fn target_from_asset() {
        let root = Path::new("/lib");
        let mut asset = Asset {
            order_id: "K1".into(),
            bundle_title: "B".into(),
            product_title: "P".into(),
            file_name: "f.pdf".into(),
            url: "https://dl/f.pdf".into(),
            ..Asset::default()
        };
        let target = Target::from_asset(&asset, root).unwrap();
        assert_eq!(target.locator, Locator::Direct("https://dl/f.pdf".into()));
        assert_eq!(target.dest, PathBuf::from("/lib/B/P/f.pdf"));
        assert_eq!(target.cache_key, "K1:f.pdf");

        asset.trove = true;
        let unsignable = Target::from_asset(&asset, root).unwrap();
        assert_eq!(
            unsignable.locator,
            Locator::Trove {
                machine_name: String::new(),
                file_name: "f.pdf".into()
            }
        );
        asset.machine_name = Some("game_linux".into());
        let target = Target::from_asset(&asset, root).unwrap();
        assert_eq!(target.dest, PathBuf::from("/lib/Humble Trove/P/f.pdf"));
        assert_eq!(target.cache_key, "trove:f.pdf");

        asset.url = String::new();
        assert!(Target::from_asset(&asset, root).is_none());
    }

    // =========================================================================
    // Mock-backed download tests
    // =========================================================================

    #[derive(Clone)]
    struct Served {
        status: u16,
        body: Vec<u8>,
        declared: Option<u64>,
        last_modified: Option<String>,
    }

    impl Served {
        fn ok(body: &[u8]) -> Self {
            Self {
                status: 200,
                body: body.to_vec(),
                declared: Some(body.len() as u64),
                last_modified: None,
            }
        }
    }

    /// Serves fixed bodies and records every opened url.
    #[derive(Default)]
    struct FileServer {
        files: HashMap<String, Served>,
        deny_trove: bool,
        opened: Mutex<Vec<String>>,
    }

    impl FileServer {
        fn serve(mut self, url: &str, served: Served) -> Self {
            self.files.insert(url.to_string(), served);
            self
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CatalogApi for FileServer {
        async fn purchase_keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn order(&self, key: &str) -> Result<Order> {
            Err(Error::Status {
                url: key.to_string(),
                status: 404,
            })
        }

        async fn trove_page(&self, _index: usize) -> Result<Vec<TroveProduct>> {
            Ok(Vec::new())
        }

        async fn sign_trove_url(&self, machine_name: &str, file_name: &str) -> Result<String> {
            if self.deny_trove {
                return Err(Error::TroveAccessDenied);
            }
            Ok(format!("https://signed/{machine_name}/{file_name}"))
        }

        async fn open_download(&self, url: &str) -> Result<RemoteFile> {
            self.opened.lock().unwrap().push(url.to_string());
            let served = self.files.get(url).cloned().unwrap_or(Served {
                status: 404,
                body: Vec::new(),
                declared: None,
                last_modified: None,
            });
            let mid = served.body.len() / 2;
            let chunks: Vec<Result<Bytes>> = vec![
                Ok(Bytes::copy_from_slice(&served.body[..mid])),
                Ok(Bytes::copy_from_slice(&served.body[mid..])),
            ];
            Ok(RemoteFile {
                status: served.status,
                content_length: served.declared,
                last_modified: served.last_modified,
                body: stream::iter(chunks).boxed(),
            })
        }
    }

    /// Records outcomes as `kind:name` strings.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        cancel_on_success: Option<CancellationToken>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DownloadObserver for Recorder {
        fn on_success(&self, target: &Target, _stats: &FileStats) {
            self.events.lock().unwrap().push(format!("ok:{}", target.name()));
            if let Some(token) = &self.cancel_on_success {
                token.cancel();
            }
        }

        fn on_skip(&self, target: &Target) {
            self.events.lock().unwrap().push(format!("skip:{}", target.name()));
        }

        fn on_failure(&self, target: &Target, reason: &FailureReason) {
            self.events
                .lock()
                .unwrap()
                .push(format!("fail:{}:{}", target.name(), reason.tag()));
        }

        fn on_abort(&self, error: &Error) {
            self.events.lock().unwrap().push(format!("abort:{error}"));
        }
    }

    struct Fixture {
        dir: TempDir,
        server: Arc<FileServer>,
        cache: Arc<SkipCache>,
    }

    impl Fixture {
        fn new(server: FileServer) -> Self {
            let dir = TempDir::new().unwrap();
            let cache = Arc::new(SkipCache::load(dir.path().join(".cache.json")));
            Self {
                dir,
                server: Arc::new(server),
                cache,
            }
        }

        fn downloader(&self, config: DownloadConfig) -> Downloader {
            Downloader::new(
                Arc::clone(&self.server) as Arc<dyn CatalogApi>,
                config,
                Arc::clone(&self.cache),
            )
        }

        fn direct(&self, name: &str) -> Target {
            Target {
                url: format!("https://dl/{name}"),
                locator: Locator::Direct(format!("https://dl/{name}")),
                dest: self.dir.path().join("B").join("P").join(name),
                cache_key: format!("K1:{name}"),
                uploaded_at: None,
                md5: None,
            }
        }
    }

    #[tokio::test]
    async fn downloads_and_records_cache() {
        let server = FileServer::default().serve(
            "https://dl/a.pdf",
            Served {
                last_modified: Some("Tue, 02 Jan 2024 10:00:00 GMT".into()),
                ..Served::ok(b"hello world")
            },
        );
        let fx = Fixture::new(server);
        let target = fx.direct("a.pdf");
        let recorder = Recorder::default();

        let stats = fx
            .downloader(DownloadConfig::new().with_workers(4).with_chunk_size(3))
            .download_all(&[target.clone()], &recorder, &CancellationToken::new())
            .await;

        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.total_bytes, 11);
        assert_eq!(std::fs::read(&target.dest).unwrap(), b"hello world");
        assert!(!part_path(&target.dest).exists());
        assert_eq!(recorder.events(), vec!["ok:a.pdf"]);
        assert_eq!(
            fx.cache.get("K1:a.pdf").unwrap().url_last_modified.as_deref(),
            Some("Tue, 02 Jan 2024 10:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn missing_last_modified_records_fetch_time() {
        let fx = Fixture::new(FileServer::default().serve("https://dl/a.pdf", Served::ok(b"x")));
        let target = fx.direct("a.pdf");
        fx.downloader(DownloadConfig::new())
            .download_all(&[target], &NoProgress, &CancellationToken::new())
            .await;
        let recorded = fx.cache.get("K1:a.pdf").unwrap().url_last_modified.unwrap();
        assert!(DateTime::parse_from_rfc2822(&recorded).is_ok());
    }

    #[tokio::test]
    async fn skip_matrix() {
        // (cache entry present, local file has content) -> skipped?
        let cases = [(true, true, true), (true, false, false), (false, true, false), (false, false, false)];
        for (cached, on_disk, skipped) in cases {
            let fx = Fixture::new(FileServer::default().serve("https://dl/a.pdf", Served::ok(b"new")));
            let target = fx.direct("a.pdf");
            if cached {
                fx.cache.record("K1:a.pdf", CacheEntry::default()).unwrap();
            }
            std::fs::create_dir_all(target.dest.parent().unwrap()).unwrap();
            if on_disk {
                std::fs::write(&target.dest, b"old").unwrap();
            } else {
                std::fs::write(&target.dest, b"").unwrap();
            }

            let stats = fx
                .downloader(DownloadConfig::new())
                .download_all(&[target.clone()], &NoProgress, &CancellationToken::new())
                .await;

            assert_eq!(stats.skipped == 1, skipped, "cached={cached} on_disk={on_disk}");
            assert_eq!(fx.server.opened().is_empty(), skipped);
            let expected: &[u8] = if skipped { b"old" } else { b"new" };
            assert_eq!(std::fs::read(&target.dest).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn short_body_fails_and_leaves_no_file() {
        let body = vec![7u8; 800];
        let server = FileServer::default().serve(
            "https://dl/big.zip",
            Served {
                declared: Some(1000),
                ..Served::ok(&body)
            },
        );
        let fx = Fixture::new(server);
        let target = fx.direct("big.zip");
        let recorder = Recorder::default();

        let stats = fx
            .downloader(DownloadConfig::new())
            .download_all(&[target.clone()], &recorder, &CancellationToken::new())
            .await;

        assert_eq!(stats.failed, 1);
        assert_eq!(recorder.events(), vec!["fail:big.zip:size_mismatch"]);
        assert!(!target.dest.exists());
        assert!(!part_path(&target.dest).exists());
        assert!(!fx.cache.contains("K1:big.zip"));
    }

    #[tokio::test]
    async fn long_body_is_accepted() {
        let server = FileServer::default().serve(
            "https://dl/a.bin",
            Served {
                declared: Some(2),
                ..Served::ok(b"abcd")
            },
        );
        let fx = Fixture::new(server);
        let target = fx.direct("a.bin");
        let stats = fx
            .downloader(DownloadConfig::new())
            .download_all(&[target.clone()], &NoProgress, &CancellationToken::new())
            .await;
        assert_eq!(stats.downloaded, 1);
        assert_eq!(std::fs::read(&target.dest).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let fx = Fixture::new(FileServer::default());
        let recorder = Recorder::default();
        let stats = fx
            .downloader(DownloadConfig::new())
            .download_all(&[fx.direct("gone.pdf")], &recorder, &CancellationToken::new())
            .await;
        assert_eq!(stats.failed, 1);
        assert_eq!(recorder.events(), vec!["fail:gone.pdf:status_404"]);
    }

    #[tokio::test]
    async fn update_keeps_previous_version() {
        let server = FileServer::default().serve(
            "https://dl/a.pdf",
            Served {
                last_modified: Some("Wed, 03 Jan 2024 10:00:00 GMT".into()),
                ..Served::ok(b"v2")
            },
        );
        let fx = Fixture::new(server);
        let target = fx.direct("a.pdf");
        std::fs::create_dir_all(target.dest.parent().unwrap()).unwrap();
        std::fs::write(&target.dest, b"v1").unwrap();
        fx.cache
            .record(
                "K1:a.pdf",
                CacheEntry {
                    url_last_modified: Some("Tue, 02 Jan 2024 10:00:00 GMT".into()),
                    ..CacheEntry::default()
                },
            )
            .unwrap();

        let stats = fx
            .downloader(DownloadConfig::new().with_update(true))
            .download_all(&[target.clone()], &NoProgress, &CancellationToken::new())
            .await;

        assert_eq!(stats.downloaded, 1);
        assert_eq!(std::fs::read(&target.dest).unwrap(), b"v2");
        let old = target.dest.with_file_name("a_2024-01-02.pdf");
        assert_eq!(std::fs::read(old).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn update_skips_unchanged_last_modified() {
        let stamp = "Tue, 02 Jan 2024 10:00:00 GMT";
        let server = FileServer::default().serve(
            "https://dl/a.pdf",
            Served {
                last_modified: Some(stamp.into()),
                ..Served::ok(b"v2")
            },
        );
        let fx = Fixture::new(server);
        let target = fx.direct("a.pdf");
        std::fs::create_dir_all(target.dest.parent().unwrap()).unwrap();
        std::fs::write(&target.dest, b"v1").unwrap();
        fx.cache
            .record(
                "K1:a.pdf",
                CacheEntry {
                    url_last_modified: Some(stamp.into()),
                    ..CacheEntry::default()
                },
            )
            .unwrap();

        let stats = fx
            .downloader(DownloadConfig::new().with_update(true))
            .download_all(&[target.clone()], &NoProgress, &CancellationToken::new())
            .await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(fx.server.opened().len(), 1);
        assert_eq!(std::fs::read(&target.dest).unwrap(), b"v1");
    }

    fn trove_target(fx: &Fixture, name: &str, uploaded_at: &str) -> Target {
        Target {
            url: format!("https://dl/{name}"),
            locator: Locator::Trove {
                machine_name: format!("{name}_m"),
                file_name: name.to_string(),
            },
            dest: fx.dir.path().join("Humble Trove").join("G").join(name),
            cache_key: format!("trove:{name}"),
            uploaded_at: Some(uploaded_at.to_string()),
            md5: None,
        }
    }

    #[tokio::test]
    async fn trove_file_without_machine_name_fails() {
        let fx = Fixture::new(FileServer::default());
        let mut target = trove_target(&fx, "g.zip", "1700000000");
        target.locator = Locator::Trove {
            machine_name: String::new(),
            file_name: "g.zip".into(),
        };
        let recorder = Recorder::default();

        let stats = fx
            .downloader(DownloadConfig::new().with_workers(2))
            .download_all(&[target], &recorder, &CancellationToken::new())
            .await;

        assert_eq!(stats.failed, 1);
        assert!(!stats.aborted);
        assert_eq!(recorder.events(), vec!["fail:g.zip:missing_machine_name"]);
        assert!(fx.server.opened().is_empty());
    }

    #[tokio::test]
    async fn trove_update_skips_matching_upload_time() {
        let server =
            FileServer::default().serve("https://signed/g.zip_m/g.zip", Served::ok(b"new"));
        let fx = Fixture::new(server);
        let target = trove_target(&fx, "g.zip", "1700000000");
        std::fs::create_dir_all(target.dest.parent().unwrap()).unwrap();
        std::fs::write(&target.dest, b"old").unwrap();
        fx.cache
            .record(
                "trove:g.zip",
                CacheEntry {
                    uploaded_at: Some("1700000000".into()),
                    ..CacheEntry::default()
                },
            )
            .unwrap();
        let dl = fx.downloader(DownloadConfig::new().with_update(true));

        let stats = dl
            .download_all(&[target.clone()], &NoProgress, &CancellationToken::new())
            .await;
        assert_eq!(stats.skipped, 1);
        assert!(fx.server.opened().is_empty());

        let newer = trove_target(&fx, "g.zip", "1700100000");
        let stats = dl
            .download_all(&[newer.clone()], &NoProgress, &CancellationToken::new())
            .await;
        assert_eq!(stats.downloaded, 1);
        assert_eq!(fx.server.opened(), vec!["https://signed/g.zip_m/g.zip"]);
        assert_eq!(
            std::fs::read(newer.dest.with_file_name("g_2023-11-14.zip")).unwrap(),
            b"old"
        );
        assert_eq!(
            fx.cache.get("trove:g.zip").unwrap().uploaded_at.as_deref(),
            Some("1700100000")
        );
    }

    #[tokio::test]
    async fn trove_access_denied_aborts_pass() {
        let fx = Fixture::new(FileServer {
            deny_trove: true,
            ..FileServer::default()
        });
        let targets: Vec<Target> = ["a.zip", "b.zip", "c.zip"]
            .iter()
            .map(|n| trove_target(&fx, n, "1"))
            .collect();
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let stats = fx
            .downloader(DownloadConfig::new().with_workers(1))
            .download_all(&targets, &recorder, &cancel)
            .await;

        assert!(stats.aborted);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 2);
        assert!(!cancel.is_cancelled());
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("abort:"));
        assert_eq!(events[1], "fail:a.zip:request_failed");
    }

    #[tokio::test]
    async fn cancellation_stops_new_work() {
        let server = FileServer::default()
            .serve("https://dl/1.pdf", Served::ok(b"one"))
            .serve("https://dl/2.pdf", Served::ok(b"two"))
            .serve("https://dl/3.pdf", Served::ok(b"three"));
        let fx = Fixture::new(server);
        let targets = vec![fx.direct("1.pdf"), fx.direct("2.pdf"), fx.direct("3.pdf")];
        let cancel = CancellationToken::new();
        let recorder = Recorder {
            cancel_on_success: Some(cancel.clone()),
            ..Recorder::default()
        };

        let stats = fx
            .downloader(DownloadConfig::new().with_workers(1))
            .download_all(&targets, &recorder, &cancel)
            .await;

        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.cancelled, 2);
        assert_eq!(fx.server.opened(), vec!["https://dl/1.pdf"]);
        assert!(targets[0].dest.exists());
        assert!(!targets[1].dest.exists());
    }

    #[tokio::test]
    async fn pre_cancelled_pool_makes_no_requests() {
        let fx = Fixture::new(FileServer::default().serve("https://dl/1.pdf", Served::ok(b"1")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = fx
            .downloader(DownloadConfig::new().with_workers(8))
            .download_all(&[fx.direct("1.pdf"), fx.direct("2.pdf")], &NoProgress, &cancel)
            .await;
        assert_eq!(stats.cancelled, 2);
        assert!(fx.server.opened().is_empty());
    }

    /// A file system whose directory creation always fails.
    struct ReadOnlyFileSystem;

    #[async_trait]
    impl FileSystem for ReadOnlyFileSystem {
        async fn file_size(&self, _path: &Path) -> Option<u64> {
            None
        }

        async fn create_dir_all(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            ))
        }

        async fn create_file(&self, _path: &Path) -> std::io::Result<tokio::fs::File> {
            Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "mock"))
        }

        async fn rename_file(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            Ok(())
        }

        async fn remove_file(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn filesystem_errors_fail_the_target_only() {
        let server = FileServer::default()
            .serve("https://dl/1.pdf", Served::ok(b"1"))
            .serve("https://dl/2.pdf", Served::ok(b"2"));
        let fx = Fixture::new(server);
        let dl = Downloader::with_fs(
            Arc::clone(&fx.server) as Arc<dyn CatalogApi>,
            DownloadConfig::new().with_workers(2),
            Arc::clone(&fx.cache),
            ReadOnlyFileSystem,
        );
        let recorder = Recorder::default();
        let stats = dl
            .download_all(&[fx.direct("1.pdf"), fx.direct("2.pdf")], &recorder, &CancellationToken::new())
            .await;
        assert_eq!(stats.failed, 2);
        assert!(!stats.aborted);
        assert!(recorder.events().iter().all(|e| e.ends_with(":filesystem")));
    }
}
