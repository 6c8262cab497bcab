//! Asset records and the query types used against the store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Order id shared by every trove asset.
pub const TROVE_ORDER_ID: &str = "trove";

/// Bundle title (and top-level library folder) used for trove assets.
pub const TROVE_BUNDLE_TITLE: &str = "Humble Trove";

/// One downloadable file or activation key belonging to a purchase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Row id, `None` until stored.
    pub id: Option<i64>,
    pub order_id: String,
    pub bundle_title: String,
    pub product_title: String,
    pub platform: String,
    /// Primary category, always lowercase. `None` means "not yet classified".
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub file_name: String,
    /// Canonical (query-stripped) url; empty for stubs and key-only assets.
    pub url: String,
    pub download_urls: Vec<String>,
    pub ext: String,
    pub uploaded_at: Option<String>,
    pub md5: Option<String>,
    pub trove: bool,
    /// Trove download machine name, needed to sign a fresh url.
    pub machine_name: Option<String>,
    pub size_bytes: Option<u64>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub order_name: Option<String>,
    pub activation_key: Option<String>,
    pub download_error: Option<String>,
    pub added_ts: i64,
    pub downloaded: bool,
    pub download_path: Option<String>,
}

impl Asset {
    /// Returns true when this asset points at a fetchable file.
    #[must_use]
    pub fn has_url(&self) -> bool {
        !self.url.is_empty()
    }

    /// Key used in the skip-cache for this asset.
    #[must_use]
    pub fn cache_key(&self) -> String {
        if self.trove {
            format!("{TROVE_ORDER_ID}:{}", self.file_name)
        } else {
            format!("{}:{}", self.order_id, self.file_name)
        }
    }

    /// Deterministic destination of this asset under `library_root`.
    #[must_use]
    pub fn library_path(&self, library_root: &Path) -> PathBuf {
        library_path(
            library_root,
            self.trove,
            &self.bundle_title,
            &self.product_title,
            &self.file_name,
        )
    }

    /// Paths probed, in order, when deciding whether this asset is on disk.
    #[must_use]
    pub fn candidate_paths(&self, library_root: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(4);
        if let Some(p) = self.download_path.as_deref().filter(|p| !p.is_empty()) {
            paths.push(PathBuf::from(p));
        }
        if self.file_name.is_empty() {
            return paths;
        }
        if self.trove {
            paths.push(
                library_root
                    .join(TROVE_BUNDLE_TITLE)
                    .join(&self.product_title)
                    .join(&self.file_name),
            );
        }
        paths.push(
            library_root
                .join(&self.bundle_title)
                .join(&self.product_title)
                .join(&self.file_name),
        );
        paths.push(library_root.join(&self.file_name));
        paths
    }
}

/// Derives `<root>/<bundle>/<product>/<file>`, or
/// `<root>/Humble Trove/<product>/<file>` for trove assets.
#[must_use]
pub fn library_path(
    library_root: &Path,
    trove: bool,
    bundle_title: &str,
    product_title: &str,
    file_name: &str,
) -> PathBuf {
    let bundle = if trove { TROVE_BUNDLE_TITLE } else { bundle_title };
    library_root.join(bundle).join(product_title).join(file_name)
}

/// Makes a remote title safe to use as a path component.
#[must_use]
pub fn clean_name(dirty: &str) -> String {
    let replaced = dirty.replace('+', "_").replace(':', " -");
    let kept: String = replaced
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-' | '[' | ']'))
        .collect();
    kept.trim().trim_end_matches('.').to_string()
}

/// Strips the query string from a download url.
#[must_use]
pub fn canonical_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Last path segment of a (canonical) url.
#[must_use]
pub fn file_name_from_url(url: &str) -> &str {
    canonical_url(url).rsplit('/').next().unwrap_or_default()
}

/// Lowercased extension after the last dot, or empty.
#[must_use]
pub fn extension_of(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

/// Result ordering for [`AssetQuery`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Upload (or first-seen) time, newest first.
    #[default]
    Recent,
    /// Product then file name, case-insensitive.
    Alpha,
    /// Bundle then product, case-insensitive.
    Bundle,
}

impl SortOrder {
    /// Parses a sort name, falling back to [`SortOrder::Recent`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "alpha" => Self::Alpha,
            "bundle" => Self::Bundle,
            _ => Self::Recent,
        }
    }
}

/// Search and filter parameters for the asset store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetQuery {
    /// Whitespace-separated terms, all of which must match.
    pub query: Option<String>,
    pub order_id: Option<String>,
    pub platform: Option<String>,
    pub bundle: Option<String>,
    pub product: Option<String>,
    pub ext: Option<String>,
    /// Matches the primary category or any tag.
    pub category: Option<String>,
    pub trove: Option<bool>,
    pub downloaded: Option<bool>,
    pub sort: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for AssetQuery {
    fn default() -> Self {
        Self {
            query: None,
            order_id: None,
            platform: None,
            bundle: None,
            product: None,
            ext: None,
            category: None,
            trove: None,
            downloaded: None,
            sort: SortOrder::Recent,
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<Asset>,
    /// Total matches ignoring limit/offset.
    pub total: usize,
}

/// An asset plus what is actually on disk for it.
#[derive(Debug, Clone, Serialize)]
pub struct AssetDetail {
    #[serde(flatten)]
    pub asset: Asset,
    pub exists: bool,
    pub local_size: Option<u64>,
}

/// Aggregate library counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub total: usize,
    pub downloaded: usize,
    /// Files confirmed on disk, when a library root was supplied.
    pub downloaded_on_disk: Option<usize>,
    pub bundles: usize,
    pub products: usize,
}

/// Per-category asset counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: Option<String>,
    pub count: usize,
    pub downloaded: usize,
}

/// Most recent downloaded items of one category.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryHighlight {
    pub category: String,
    pub count: usize,
    pub items: Vec<Asset>,
}

/// Roll-up of one bundle (or one purchase when grouped by order).
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub key: String,
    pub bundle_title: String,
    pub assets: usize,
    pub downloaded: usize,
    pub total_bytes: u64,
    pub image_url: Option<String>,
}

/// Distinct values available for filtering.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Facets {
    pub categories: Vec<String>,
    pub platforms: Vec<String>,
    pub extensions: Vec<String>,
    pub bundles: Vec<String>,
}
