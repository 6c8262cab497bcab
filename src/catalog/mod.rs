//! Remote catalog access: the order tree, the trove catalog and file streams.
//!
//! [`CatalogApi`] is the seam between the indexer/downloader and the network;
//! [`HumbleClient`] is the HTTP implementation.

mod client;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::Result;

pub use client::{DEFAULT_BASE_URL, HumbleClient};

/// Image-like fields on a product, checked in order.
const IMAGE_FIELDS: &[&str] = &[
    "tile_image",
    "icon",
    "image",
    "cover",
    "logo",
    "tile",
    "thumbnail",
    "thumb",
];

/// Treats an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One order's product tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Order {
    #[serde(default, deserialize_with = "null_as_default")]
    pub product: OrderProduct,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subproducts: Vec<Subproduct>,
    #[serde(default)]
    pub tpkd_dict: Option<TpkdDict>,
}

impl Order {
    /// Activation keys attached to the order.
    #[must_use]
    pub fn keys(&self) -> &[Tpk] {
        self.tpkd_dict.as_ref().map_or(&[], |d| d.all_tpks.as_slice())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderProduct {
    #[serde(default, deserialize_with = "null_as_default")]
    pub human_name: String,
    #[serde(default)]
    pub machine_name: Option<String>,
}

/// A product inside an order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Subproduct {
    #[serde(default, deserialize_with = "null_as_default")]
    pub human_name: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub downloads: Vec<DownloadVariant>,
    /// Everything else, scanned for images and descriptions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Subproduct {
    /// Cover image url, if the product carries one.
    #[must_use]
    pub fn image_url(&self) -> Option<String> {
        extract_image(&self.extra)
    }

    /// Description text, if the product carries one.
    #[must_use]
    pub fn description(&self) -> Option<String> {
        extract_description(&self.extra)
    }
}

/// One platform variant of a product.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadVariant {
    #[serde(default, deserialize_with = "null_as_default")]
    pub platform: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub download_struct: Vec<FileEntry>,
}

/// A single file (or external link) inside a download variant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub url: Option<FileUrls>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub uploaded_at: Option<Value>,
    #[serde(default)]
    pub external_link: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl FileEntry {
    /// Web download url, if any.
    #[must_use]
    pub fn web_url(&self) -> Option<&str> {
        self.url
            .as_ref()
            .and_then(|u| u.web.as_deref())
            .filter(|u| !u.is_empty())
    }

    /// Upload timestamp, preferring `timestamp` over `uploaded_at`.
    #[must_use]
    pub fn uploaded_at(&self) -> Option<String> {
        self.timestamp
            .as_ref()
            .and_then(value_to_string)
            .or_else(|| self.uploaded_at.as_ref().and_then(value_to_string))
    }
}

/// Alternate urls for one file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileUrls {
    #[serde(default)]
    pub web: Option<String>,
    #[serde(default)]
    pub bittorrent: Option<String>,
}

impl FileUrls {
    /// Canonical web url first, then the torrent url when present.
    #[must_use]
    pub fn mirrors(&self) -> Vec<String> {
        self.web
            .iter()
            .chain(self.bittorrent.iter())
            .filter(|u| !u.is_empty())
            .map(|u| crate::model::canonical_url(u).to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TpkdDict {
    #[serde(default, deserialize_with = "null_as_default")]
    pub all_tpks: Vec<Tpk>,
}

/// An activation key entitlement.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tpk {
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub redeemed_key_val: Option<String>,
}

/// A product from the flat trove catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TroveProduct {
    #[serde(rename = "human-name", default, deserialize_with = "null_as_default")]
    pub human_name: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub date_added: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub downloads: BTreeMap<String, TroveDownload>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TroveProduct {
    #[must_use]
    pub fn image_url(&self) -> Option<String> {
        extract_image(&self.extra)
    }

    #[must_use]
    pub fn description(&self) -> Option<String> {
        extract_description(&self.extra)
    }
}

/// One platform download of a trove product.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TroveDownload {
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: FileUrls,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub uploaded_at: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// An opened download stream.
pub struct RemoteFile {
    pub status: u16,
    pub content_length: Option<u64>,
    /// Raw `Last-Modified` header.
    pub last_modified: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

impl RemoteFile {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Operations against the remote storefront.
///
/// Implementations must be safe to share across download workers.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Enumerates the purchase keys of the authenticated account.
    async fn purchase_keys(&self) -> Result<Vec<String>>;

    /// Fetches one order's product tree.
    async fn order(&self, key: &str) -> Result<Order>;

    /// Fetches one zero-based page of the trove catalog; empty means done.
    async fn trove_page(&self, index: usize) -> Result<Vec<TroveProduct>>;

    /// Mints a signed, time-limited url for a trove file.
    ///
    /// Fails with [`crate::Error::TroveAccessDenied`] when the account has no
    /// trove access.
    async fn sign_trove_url(&self, machine_name: &str, file_name: &str) -> Result<String>;

    /// Opens a streaming GET for a file url.
    async fn open_download(&self, url: &str) -> Result<RemoteFile>;

    /// Returns true if the session credential is accepted.
    async fn session_valid(&self) -> bool {
        self.purchase_keys().await.is_ok()
    }
}

/// Renders a JSON scalar as a string; numbers keep their textual form.
#[must_use]
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_http(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| s.starts_with("http"))
}

/// First http(s) image found on a product.
///
/// Plain string fields win in [`IMAGE_FIELDS`] order; for object-valued fields
/// the lexicographically greatest http value is taken; `visuals` is a last resort.
#[must_use]
pub fn extract_image(fields: &Map<String, Value>) -> Option<String> {
    for key in IMAGE_FIELDS {
        match fields.get(*key) {
            Some(Value::String(s)) if s.starts_with("http") => return Some(s.clone()),
            Some(Value::Object(map)) => {
                let best = map.values().filter_map(is_http).max();
                if let Some(url) = best {
                    return Some(url.to_string());
                }
            }
            _ => {}
        }
    }
    if let Some(Value::Object(visuals)) = fields.get("visuals") {
        return visuals.values().find_map(is_http).map(str::to_string);
    }
    None
}

/// First non-empty description-like text on a product.
#[must_use]
pub fn extract_description(fields: &Map<String, Value>) -> Option<String> {
    let trimmed = |v: &Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    for key in ["description", "body", "blurb"] {
        if let Some(text) = fields.get(key).and_then(trimmed) {
            return Some(text);
        }
    }
    fields
        .iter()
        .filter(|(k, _)| k.contains("desc"))
        .find_map(|(_, v)| trimmed(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn image_prefers_plain_fields_in_order() {
        let f = fields(json!({
            "icon": "https://img/icon.png",
            "tile_image": "https://img/tile.png",
        }));
        assert_eq!(extract_image(&f).as_deref(), Some("https://img/tile.png"));
    }

    #[test]
    fn image_from_object_field_takes_greatest() {
        let f = fields(json!({
            "image": {"small": "https://img/a.png", "large": "https://img/b.png", "x": 3}
        }));
        assert_eq!(extract_image(&f).as_deref(), Some("https://img/b.png"));
    }

    #[test]
    fn image_falls_back_to_visuals() {
        let f = fields(json!({"icon": "/relative.png", "visuals": {"a": "https://img/v.png"}}));
        assert_eq!(extract_image(&f).as_deref(), Some("https://img/v.png"));
        assert_eq!(extract_image(&Map::new()), None);
    }

    #[test]
    fn description_scans_known_then_generic_fields() {
        let f = fields(json!({"blurb": "  ", "short_desc": " Nice game "}));
        assert_eq!(extract_description(&f).as_deref(), Some("Nice game"));
        let f = fields(json!({"body": "Body text", "short_desc": "other"}));
        assert_eq!(extract_description(&f).as_deref(), Some("Body text"));
    }

    #[test]
    fn order_parses_with_missing_sections() {
        let order: Order = serde_json::from_value(json!({
            "product": {"human_name": "Bundle"},
            "subproducts": [{
                "human_name": "Book",
                "icon": "https://img/book.png",
                "downloads": [{
                    "platform": "ebook",
                    "download_struct": [{
                        "url": {"web": "https://dl/book.pdf?t=1", "bittorrent": "https://dl/book.pdf.torrent?t=1"},
                        "md5": "abc",
                        "file_size": 1000,
                        "timestamp": 1_700_000_000
                    }]
                }]
            }]
        }))
        .unwrap();
        assert!(order.keys().is_empty());
        let product = &order.subproducts[0];
        assert_eq!(product.image_url().as_deref(), Some("https://img/book.png"));
        let entry = &product.downloads[0].download_struct[0];
        assert_eq!(entry.web_url(), Some("https://dl/book.pdf?t=1"));
        assert_eq!(entry.uploaded_at().as_deref(), Some("1700000000"));
        assert_eq!(
            entry.url.as_ref().unwrap().mirrors(),
            vec!["https://dl/book.pdf", "https://dl/book.pdf.torrent"]
        );
    }

    #[test]
    fn explicit_nulls_read_as_empty() {
        let order: Order = serde_json::from_value(json!({
            "product": {"human_name": null},
            "subproducts": [{
                "human_name": null,
                "downloads": [{"platform": null, "download_struct": null}]
            }, {
                "human_name": "Book",
                "downloads": null
            }],
            "tpkd_dict": {"all_tpks": null}
        }))
        .unwrap();
        assert_eq!(order.product.human_name, "");
        assert_eq!(order.subproducts.len(), 2);
        assert_eq!(order.subproducts[0].human_name, "");
        assert_eq!(order.subproducts[0].downloads[0].platform, "");
        assert!(order.subproducts[0].downloads[0].download_struct.is_empty());
        assert!(order.subproducts[1].downloads.is_empty());
        assert!(order.keys().is_empty());

        let product: TroveProduct =
            serde_json::from_value(json!({"human-name": null, "downloads": null})).unwrap();
        assert_eq!(product.human_name, "");
        assert!(product.downloads.is_empty());
    }

    #[test]
    fn trove_product_parses_hyphenated_name() {
        let product: TroveProduct = serde_json::from_value(json!({
            "human-name": "Space Game",
            "date_added": 1_600_000_000,
            "downloads": {
                "windows": {
                    "machine_name": "spacegame_windows",
                    "url": {"web": "spacegame.zip"},
                    "md5": "m"
                }
            }
        }))
        .unwrap();
        assert_eq!(product.human_name, "Space Game");
        assert_eq!(product.downloads["windows"].url.web.as_deref(), Some("spacegame.zip"));
    }
}
