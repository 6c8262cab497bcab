//! Flattens the remote order tree (or the trove catalog) into [`Asset`] records.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogApi, FileEntry, Order, Subproduct, TroveProduct, value_to_string};
use crate::classify::{ClassifyRequest, Classifier};
use crate::config::FilterConfig;
use crate::error::Result;
use crate::model::{
    Asset, TROVE_BUNDLE_TITLE, TROVE_ORDER_ID, canonical_url, clean_name, extension_of,
    file_name_from_url, library_path,
};

/// Cover image and description of one product, used to enrich stored rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductMeta {
    pub bundle_title: String,
    pub product_title: String,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

/// Extracts per-product metadata from an order.
#[must_use]
pub fn product_meta(order: &Order) -> Vec<ProductMeta> {
    let bundle_title = clean_name(&order.product.human_name);
    order
        .subproducts
        .iter()
        .filter_map(|product| {
            let product_title = clean_name(&product.human_name);
            (!product_title.is_empty()).then(|| ProductMeta {
                bundle_title: bundle_title.clone(),
                product_title,
                image_url: product.image_url(),
                description: product.description(),
            })
        })
        .collect()
}

/// Maps each canonical web url in an order to its mirror list.
#[must_use]
pub fn file_mirrors(order: &Order) -> Vec<(String, Vec<String>)> {
    order
        .subproducts
        .iter()
        .flat_map(|p| &p.downloads)
        .flat_map(|d| &d.download_struct)
        .filter_map(|entry| {
            let web = entry.web_url()?;
            let mirrors = entry.url.as_ref()?.mirrors();
            Some((canonical_url(web).to_string(), mirrors))
        })
        .collect()
}

/// Maps each canonical web url in an order to the full url currently served
/// for it, query string included.
#[must_use]
pub fn signed_links(order: &Order) -> HashMap<String, String> {
    order
        .subproducts
        .iter()
        .flat_map(|p| &p.downloads)
        .flat_map(|d| &d.download_struct)
        .filter_map(FileEntry::web_url)
        .map(|web| (canonical_url(web).to_string(), web.to_string()))
        .collect()
}

/// Walks purchases or the trove and produces asset records.
pub struct Indexer {
    catalog: Arc<dyn CatalogApi>,
    classifier: Classifier,
    filters: FilterConfig,
    library_root: PathBuf,
}

impl Indexer {
    /// Creates a new indexer.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        classifier: Classifier,
        filters: FilterConfig,
        library_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            classifier,
            filters: filters.normalized(),
            library_root: library_root.into(),
        }
    }

    /// Returns the active filters.
    #[must_use]
    pub const fn filters(&self) -> &FilterConfig {
        &self.filters
    }

    /// Collects every asset for one pass.
    ///
    /// In trove mode the catalog is paginated until an empty page. Otherwise
    /// each purchase key (from `purchase_keys`, or the account when `None`) is
    /// fetched exactly once. Cancellation returns what was collected so far.
    ///
    /// # Errors
    ///
    /// Fails if the purchase keys cannot be listed, a trove page cannot be
    /// fetched, or an order fetch fails with a fatal error.
    pub async fn collect(
        &self,
        purchase_keys: Option<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Asset>> {
        if self.filters.trove {
            return self.collect_trove(cancel).await;
        }

        let keys = match purchase_keys.filter(|k| !k.is_empty()) {
            Some(keys) => keys,
            None => self.catalog.purchase_keys().await?,
        };
        log::info!("Indexing {} purchase keys", keys.len());

        let mut assets = Vec::new();
        for key in &keys {
            if cancel.is_cancelled() {
                log::info!("Indexing cancelled");
                break;
            }
            let order = match self.catalog.order(key).await {
                Ok(order) => order,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to fetch order {key}: {e}");
                    continue;
                }
            };
            assets.extend(self.order_assets(key, &order, cancel).await);
        }
        Ok(assets)
    }

    /// Assets of one order, in source order.
    async fn order_assets(
        &self,
        order_id: &str,
        order: &Order,
        cancel: &CancellationToken,
    ) -> Vec<Asset> {
        let bundle_title = clean_name(&order.product.human_name);
        log::info!("Checking bundle: {bundle_title} ({order_id})");

        let key_titles: Vec<String> = order
            .keys()
            .iter()
            .filter_map(|k| k.human_name.as_deref())
            .map(clean_name)
            .collect();

        // Single-product purchases come back without subproducts.
        let synthesized;
        let products: &[Subproduct] = if order.subproducts.is_empty() {
            synthesized = [Subproduct {
                human_name: order.product.human_name.clone(),
                machine_name: order.product.machine_name.clone(),
                ..Subproduct::default()
            }];
            &synthesized
        } else {
            &order.subproducts
        };

        let mut assets = Vec::new();
        for product in products {
            if cancel.is_cancelled() {
                return assets;
            }
            let product_title = clean_name(&product.human_name);
            let files = self
                .product_assets(order_id, &bundle_title, product, cancel)
                .await;
            let has_content = product
                .downloads
                .iter()
                .flat_map(|d| &d.download_struct)
                .any(|e| e.web_url().is_some());
            if !has_content && !key_titles.contains(&product_title) {
                assets.push(self.stub_asset(order_id, &bundle_title, product));
            }
            assets.extend(files);
        }

        for tpk in order.keys() {
            let Some(name) = tpk.human_name.as_deref().map(str::trim).filter(|n| !n.is_empty())
            else {
                continue;
            };
            assets.push(Asset {
                order_id: order_id.to_string(),
                bundle_title: bundle_title.clone(),
                product_title: clean_name(name),
                platform: "key".to_string(),
                category: Some("key".to_string()),
                tags: vec!["key".to_string()],
                file_name: name.to_string(),
                machine_name: tpk.machine_name.clone(),
                order_name: Some(bundle_title.clone()),
                activation_key: tpk.redeemed_key_val.clone(),
                added_ts: now(),
                ..Asset::default()
            });
        }
        assets
    }

    async fn product_assets(
        &self,
        order_id: &str,
        bundle_title: &str,
        product: &Subproduct,
        cancel: &CancellationToken,
    ) -> Vec<Asset> {
        let product_title = clean_name(&product.human_name);
        let image_url = product.image_url();
        let description = product.description();
        let mut assets = Vec::new();

        for variant in &product.downloads {
            if cancel.is_cancelled() {
                break;
            }
            let platform_hint = variant.platform.to_lowercase();
            if !self.filters.allows_platform(&platform_hint) {
                log::debug!("Skipping {platform_hint} for {product_title}");
                continue;
            }
            for entry in &variant.download_struct {
                let platform = entry
                    .platform
                    .as_deref()
                    .map_or_else(|| platform_hint.clone(), str::to_lowercase);
                if !self.filters.allows_platform(&platform) {
                    continue;
                }
                let Some(web) = entry.web_url() else {
                    if let Some(link) = &entry.external_link {
                        log::info!("External url found: {bundle_title}/{product_title}: {link}");
                    }
                    continue;
                };
                let file_name = file_name_from_url(web).to_string();
                if !self.filters.allows_file(&file_name) {
                    log::debug!("Skipping the file {file_name}");
                    continue;
                }

                let mut asset = self
                    .file_asset(
                        order_id,
                        bundle_title,
                        &product_title,
                        &platform,
                        &file_name,
                        false,
                    )
                    .await;
                asset.url = canonical_url(web).to_string();
                asset.download_urls = entry.url.as_ref().map(|u| u.mirrors()).unwrap_or_default();
                asset.md5 = entry.md5.clone();
                asset.size_bytes = entry.file_size;
                asset.uploaded_at = entry.uploaded_at();
                asset.machine_name = variant.machine_name.clone();
                asset.image_url.clone_from(&image_url);
                asset.description.clone_from(&description);
                asset.order_name = Some(bundle_title.to_string());
                assets.push(asset);
            }
        }
        assets
    }

    async fn collect_trove(&self, cancel: &CancellationToken) -> Result<Vec<Asset>> {
        let mut assets = Vec::new();
        let mut index = 0;
        loop {
            if cancel.is_cancelled() {
                log::info!("Trove indexing cancelled");
                break;
            }
            let page = self.catalog.trove_page(index).await?;
            if page.is_empty() {
                break;
            }
            log::debug!("Collected trove page {index} ({} products)", page.len());
            for product in &page {
                if cancel.is_cancelled() {
                    return Ok(assets);
                }
                assets.extend(self.trove_assets(product, cancel).await);
            }
            index += 1;
        }
        Ok(assets)
    }

    async fn trove_assets(&self, product: &TroveProduct, cancel: &CancellationToken) -> Vec<Asset> {
        let title = clean_name(&product.human_name);
        let image_url = product.image_url();
        let description = product.description();
        let mut assets = Vec::new();

        for (platform, download) in &product.downloads {
            if cancel.is_cancelled() {
                break;
            }
            if !self.filters.allows_platform(platform) {
                log::debug!("Skipping {platform} for {title}");
                continue;
            }
            let Some(web) = download.url.web.as_deref().filter(|w| !w.is_empty()) else {
                continue;
            };
            let file_name = file_name_from_url(web).to_string();
            if !self.filters.allows_file(&file_name) {
                continue;
            }

            let mut asset = self
                .file_asset(
                    TROVE_ORDER_ID,
                    TROVE_BUNDLE_TITLE,
                    &title,
                    &platform.to_lowercase(),
                    &file_name,
                    true,
                )
                .await;
            asset.url = canonical_url(web).to_string();
            asset.download_urls = download.url.mirrors();
            asset.md5 = download.md5.clone();
            asset.size_bytes = download.file_size;
            asset.uploaded_at = download
                .uploaded_at
                .as_ref()
                .and_then(value_to_string)
                .or_else(|| download.timestamp.as_ref().and_then(value_to_string))
                .or_else(|| product.date_added.as_ref().and_then(value_to_string));
            asset.machine_name = download.machine_name.clone();
            asset.image_url.clone_from(&image_url);
            asset.description.clone_from(&description);
            assets.push(asset);
        }
        assets
    }

    /// A classified asset with path fields filled in.
    async fn file_asset(
        &self,
        order_id: &str,
        bundle_title: &str,
        product_title: &str,
        platform: &str,
        file_name: &str,
        trove: bool,
    ) -> Asset {
        let classification = self
            .classifier
            .classify_with_suggestions(&ClassifyRequest {
                file_name,
                platform,
                bundle_title,
                product_title,
            })
            .await;
        let path = library_path(
            &self.library_root,
            trove,
            bundle_title,
            product_title,
            file_name,
        );
        Asset {
            order_id: order_id.to_string(),
            bundle_title: bundle_title.to_string(),
            product_title: product_title.to_string(),
            platform: platform.to_string(),
            tags: classification.all_tags(),
            category: Some(classification.primary),
            file_name: file_name.to_string(),
            ext: extension_of(file_name),
            trove,
            download_path: Some(path.to_string_lossy().into_owned()),
            added_ts: now(),
            ..Asset::default()
        }
    }

    fn stub_asset(&self, order_id: &str, bundle_title: &str, product: &Subproduct) -> Asset {
        Asset {
            order_id: order_id.to_string(),
            bundle_title: bundle_title.to_string(),
            product_title: clean_name(&product.human_name),
            category: Some("other".to_string()),
            tags: vec!["other".to_string()],
            machine_name: product.machine_name.clone(),
            image_url: product.image_url(),
            description: product.description(),
            order_name: Some(bundle_title.to_string()),
            added_ts: now(),
            ..Asset::default()
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
