//! SQLite-backed asset store with full-text search, tags and settings.
//!
//! The connection lives behind a [`Mutex`]; every method is synchronous, so
//! callers on the async runtime wrap long operations (a whole pass of upserts,
//! reconciliation) in `spawn_blocking`.

mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::error::Result;
use crate::model::{
    Asset, AssetDetail, AssetQuery, CategoryCount, CategoryHighlight, Facets, GroupSummary,
    LibraryStats, SearchPage, SortOrder, TROVE_ORDER_ID,
};

pub use schema::SCHEMA_VERSION;

/// Separator used when tags are aggregated in SQL.
const TAG_SEP: char = '\u{1f}';

const ASSET_COLUMNS: &str = "a.id, a.order_id, a.bundle_title, a.product_title, a.platform, \
     a.category, a.file_name, a.url, a.download_urls, a.ext, a.uploaded_at, a.md5, a.trove, \
     a.machine_name, a.size_bytes, a.image_url, a.description, a.order_name, a.activation_key, \
     a.download_error, a.added_ts, a.downloaded, a.download_path, \
     (SELECT group_concat(t.tag, char(31)) FROM asset_tags t WHERE t.asset_id = a.id) AS tags";

/// Persistent asset index.
pub struct AssetStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for AssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AssetStore {
    /// Opens (or creates) the database at `path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Writes from the indexer ──

    /// Inserts or merges assets, returning their row ids in input order.
    ///
    /// Rows with a url merge on it; url-less rows (stubs, keys) merge on
    /// `(order_id, product_title, file_name)`. Enrichment fields are only
    /// overwritten by non-empty values.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written then.
    pub fn upsert(&self, assets: &[Asset]) -> Result<Vec<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(assets.len());
        for asset in assets {
            ids.push(upsert_one(&tx, asset)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    // ── Download bookkeeping ──

    /// Marks the asset with `url` as downloaded to `path` and clears its error.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn mark_downloaded(&self, url: &str, path: &Path) -> Result<bool> {
        if url.is_empty() {
            return Ok(false);
        }
        let changed = self.lock().execute(
            "UPDATE assets SET downloaded = 1, download_path = ?1, download_error = NULL
             WHERE url = ?2",
            params![path.to_string_lossy(), url],
        )?;
        Ok(changed > 0)
    }

    /// Records the last failure reason for the asset with `url`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn mark_download_error(&self, url: &str, reason: &str) -> Result<bool> {
        if url.is_empty() {
            return Ok(false);
        }
        let changed = self.lock().execute(
            "UPDATE assets SET download_error = ?1 WHERE url = ?2",
            params![reason, url],
        )?;
        Ok(changed > 0)
    }

    /// Probes candidate paths for every file asset and marks those found.
    ///
    /// Returns the number of assets confirmed on disk.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn reconcile(&self, library_root: &Path) -> Result<usize> {
        let assets = self.query_assets("WHERE a.file_name <> ''", &[])?;
        let found: Vec<(i64, PathBuf)> = assets
            .iter()
            .filter_map(|a| Some((a.id?, first_present(a, library_root)?)))
            .collect();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (id, path) in &found {
            tx.execute(
                "UPDATE assets SET downloaded = 1, download_path = ?1 WHERE id = ?2",
                params![path.to_string_lossy(), id],
            )?;
        }
        tx.commit()?;
        log::info!("Reconciled {} assets present on disk", found.len());
        Ok(found.len())
    }

    /// Counts file assets present on disk without touching the database.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn count_on_disk(&self, library_root: &Path) -> Result<usize> {
        let assets = self.query_assets("WHERE a.file_name <> ''", &[])?;
        Ok(assets
            .iter()
            .filter(|a| first_present(a, library_root).is_some())
            .count())
    }

    /// Assets with a url that still need fetching.
    ///
    /// An asset flagged downloaded whose recorded file is gone counts as
    /// pending again.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn pending_downloads(&self, trove: Option<bool>) -> Result<Vec<Asset>> {
        let mut sql = String::from("WHERE a.url IS NOT NULL");
        let mut values = Vec::new();
        if let Some(trove) = trove {
            sql.push_str(" AND a.trove = ?");
            values.push(Value::Integer(i64::from(trove)));
        }
        sql.push_str(" ORDER BY a.id");
        let assets = self.query_assets(&sql, &values)?;
        Ok(assets
            .into_iter()
            .filter(|a| {
                !a.downloaded
                    || !a
                        .download_path
                        .as_deref()
                        .is_some_and(|p| file_has_content(Path::new(p)))
            })
            .collect())
    }

    // ── Reads ──

    /// Fetches one asset by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_asset(&self, id: i64) -> Result<Option<Asset>> {
        let conn = self.lock();
        let asset = conn
            .query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets a WHERE a.id = ?1"),
                params![id],
                row_to_asset,
            )
            .optional()?;
        Ok(asset)
    }

    /// Fetches one asset by canonical url.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_asset_by_url(&self, url: &str) -> Result<Option<Asset>> {
        let conn = self.lock();
        let asset = conn
            .query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets a WHERE a.url = ?1"),
                params![url],
                row_to_asset,
            )
            .optional()?;
        Ok(asset)
    }

    /// One asset plus whether its file exists and its actual size.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn asset_detail(&self, id: i64, library_root: Option<&Path>) -> Result<Option<AssetDetail>> {
        let Some(asset) = self.get_asset(id)? else {
            return Ok(None);
        };
        let present = match library_root {
            Some(root) => first_present(&asset, root),
            None => asset
                .download_path
                .as_deref()
                .map(PathBuf::from)
                .filter(|p| file_has_content(p)),
        };
        let local_size = present
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());
        Ok(Some(AssetDetail {
            exists: present.is_some(),
            local_size,
            asset,
        }))
    }

    /// Filtered, sorted, paginated search.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn search(&self, query: &AssetQuery) -> Result<SearchPage> {
        let mut join = "";
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(fts) = query.query.as_deref().and_then(fts_query) {
            join = "JOIN assets_fts f ON f.rowid = a.id";
            clauses.push("assets_fts MATCH ?");
            values.push(Value::Text(fts));
        }
        let exact = [
            ("a.order_id = ?", &query.order_id),
            ("a.platform = ?", &query.platform),
            ("a.bundle_title = ?", &query.bundle),
            ("a.product_title = ?", &query.product),
        ];
        for (clause, value) in exact {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                clauses.push(clause);
                values.push(Value::Text(v.to_string()));
            }
        }
        if let Some(ext) = query.ext.as_deref().filter(|v| !v.is_empty()) {
            clauses.push("a.ext = ?");
            values.push(Value::Text(ext.trim_start_matches('.').to_lowercase()));
        }
        if let Some(category) = query.category.as_deref().filter(|v| !v.is_empty()) {
            let category = category.to_lowercase();
            clauses.push(
                "(a.category = ? OR EXISTS (SELECT 1 FROM asset_tags t WHERE t.asset_id = a.id AND t.tag = ?))",
            );
            values.push(Value::Text(category.clone()));
            values.push(Value::Text(category));
        }
        if let Some(trove) = query.trove {
            clauses.push("a.trove = ?");
            values.push(Value::Integer(i64::from(trove)));
        }
        if let Some(downloaded) = query.downloaded {
            clauses.push("a.downloaded = ?");
            values.push(Value::Integer(i64::from(downloaded)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_sql = match query.sort {
            SortOrder::Alpha => {
                "ORDER BY a.product_title COLLATE NOCASE ASC, a.file_name COLLATE NOCASE ASC"
            }
            SortOrder::Bundle => {
                "ORDER BY a.bundle_title COLLATE NOCASE ASC, a.product_title COLLATE NOCASE ASC"
            }
            SortOrder::Recent => "ORDER BY COALESCE(a.uploaded_at, a.added_ts) DESC, a.id DESC",
        };

        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM assets a {join} {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values;
        page_values.push(Value::Integer(to_i64(query.limit)));
        page_values.push(Value::Integer(to_i64(query.offset)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets a {join} {where_sql} {order_sql} LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_values.iter()), row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(SearchPage {
            items,
            total: to_usize(total),
        })
    }

    /// Aggregate counts, optionally with an on-disk probe of `library_root`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn stats(&self, library_root: Option<&Path>) -> Result<LibraryStats> {
        let (total, downloaded, bundles, products) = {
            let conn = self.lock();
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(downloaded), 0),
                        COUNT(DISTINCT bundle_title), COUNT(DISTINCT product_title)
                 FROM assets",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?
        };
        let downloaded_on_disk = match library_root {
            Some(root) => Some(self.count_on_disk(root)?),
            None => None,
        };
        Ok(LibraryStats {
            total: to_usize(total),
            downloaded: to_usize(downloaded),
            downloaded_on_disk,
            bundles: to_usize(bundles),
            products: to_usize(products),
        })
    }

    /// Asset and downloaded counts per primary category, largest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn category_counts(&self, limit: usize) -> Result<Vec<CategoryCount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) AS cnt, COALESCE(SUM(downloaded), 0)
             FROM assets GROUP BY category ORDER BY cnt DESC, category LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![to_i64(limit)], |row| {
                Ok(CategoryCount {
                    category: row.get(0)?,
                    count: to_usize(row.get(1)?),
                    downloaded: to_usize(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent downloaded, still-present items for the top categories.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn highlights(
        &self,
        per_category: usize,
        max_categories: usize,
        library_root: Option<&Path>,
    ) -> Result<Vec<CategoryHighlight>> {
        let categories: Vec<(String, i64)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT category, COUNT(*) AS cnt FROM assets
                 WHERE category IS NOT NULL AND category <> '' AND downloaded = 1
                 GROUP BY category ORDER BY cnt DESC, category LIMIT ?1",
            )?;
            stmt.query_map(params![to_i64(max_categories)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut highlights = Vec::with_capacity(categories.len());
        for (category, count) in categories {
            let candidates = self.query_assets(
                "WHERE a.category = ? AND a.downloaded = 1
                 ORDER BY COALESCE(a.uploaded_at, a.added_ts) DESC, a.id DESC LIMIT ?",
                &[
                    Value::Text(category.clone()),
                    Value::Integer(to_i64(per_category * 2)),
                ],
            )?;
            let items = candidates
                .into_iter()
                .filter(|a| is_present(a, library_root))
                .take(per_category)
                .collect();
            highlights.push(CategoryHighlight {
                category,
                count: to_usize(count),
                items,
            });
        }
        Ok(highlights)
    }

    /// Per-bundle roll-ups, alphabetically.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn bundle_summaries(&self, limit: usize) -> Result<Vec<GroupSummary>> {
        self.group_summaries("bundle_title", limit)
    }

    /// Per-purchase roll-ups, alphabetically by bundle title.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn purchase_summaries(&self, limit: usize) -> Result<Vec<GroupSummary>> {
        self.group_summaries("order_id", limit)
    }

    fn group_summaries(&self, key_column: &str, limit: usize) -> Result<Vec<GroupSummary>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {key_column}, MAX(bundle_title), COUNT(*), COALESCE(SUM(downloaded), 0),
                    COALESCE(SUM(size_bytes), 0),
                    MAX(CASE WHEN image_url <> '' THEN image_url END)
             FROM assets GROUP BY {key_column}
             ORDER BY MAX(bundle_title) COLLATE NOCASE, {key_column} LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![to_i64(limit)], |row| {
                Ok(GroupSummary {
                    key: row.get(0)?,
                    bundle_title: row.get(1)?,
                    assets: to_usize(row.get(2)?),
                    downloaded: to_usize(row.get(3)?),
                    total_bytes: u64::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
                    image_url: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Distinct values usable as filters.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn facets(&self, downloaded_only: bool) -> Result<Facets> {
        let conn = self.lock();
        let filter = if downloaded_only { "AND downloaded = 1" } else { "" };
        let distinct = |column: &str| -> rusqlite::Result<Vec<String>> {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT {column} FROM assets
                 WHERE {column} IS NOT NULL AND {column} <> '' {filter}
                 ORDER BY {column} COLLATE NOCASE"
            ))?;
            stmt.query_map([], |row| row.get(0))?.collect()
        };
        Ok(Facets {
            categories: distinct("category")?,
            platforms: distinct("platform")?,
            extensions: distinct("ext")?,
            bundles: distinct("bundle_title")?,
        })
    }

    // ── Enrichment support ──

    /// Distinct order ids, optionally including the trove sentinel.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn distinct_order_ids(&self, include_trove: bool) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT order_id FROM assets
             WHERE order_id <> '' AND (?1 OR order_id <> ?2)
             GROUP BY order_id ORDER BY MIN(id)",
        )?;
        let ids = stmt
            .query_map(params![include_trove, TROVE_ORDER_ID], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Assets without a primary category.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_missing_category(&self, limit: usize) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE a.category IS NULL OR a.category = '' ORDER BY a.id LIMIT ?",
            &[Value::Integer(to_i64(limit))],
        )
    }

    /// Assets whose category is not among their tags.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_missing_category_tag(&self, limit: usize) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE a.category IS NOT NULL AND a.category <> ''
               AND NOT EXISTS (SELECT 1 FROM asset_tags t WHERE t.asset_id = a.id AND t.tag = a.category)
             ORDER BY a.id LIMIT ?",
            &[Value::Integer(to_i64(limit))],
        )
    }

    /// Purchase assets without a cover image.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_missing_image(&self, limit: usize) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE (a.image_url IS NULL OR a.image_url = '') AND a.order_id <> ?
             ORDER BY a.id LIMIT ?",
            &[
                Value::Text(TROVE_ORDER_ID.to_string()),
                Value::Integer(to_i64(limit)),
            ],
        )
    }

    /// Assets without a description.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_missing_description(&self, limit: usize) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE a.description IS NULL OR a.description = '' ORDER BY a.id LIMIT ?",
            &[Value::Integer(to_i64(limit))],
        )
    }

    /// Purchase (non-trove) assets, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_for_orders(&self, limit: usize) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE a.order_id <> '' AND a.order_id <> ? ORDER BY a.id LIMIT ?",
            &[
                Value::Text(TROVE_ORDER_ID.to_string()),
                Value::Integer(to_i64(limit)),
            ],
        )
    }

    /// The given assets, or every asset when `ids` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_for_reclassify(&self, ids: &[i64]) -> Result<Vec<Asset>> {
        if ids.is_empty() {
            return self.query_assets("ORDER BY a.id", &[]);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let values: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
        self.query_assets(
            &format!("WHERE a.id IN ({placeholders}) ORDER BY a.id"),
            &values,
        )
    }

    /// Assets whose primary category is `category`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn assets_by_category(&self, category: &str) -> Result<Vec<Asset>> {
        self.query_assets(
            "WHERE a.category = ? ORDER BY a.id",
            &[Value::Text(category.to_lowercase())],
        )
    }

    /// Sets the primary category and makes sure it is also a tag.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_category(&self, id: i64, category: &str) -> Result<()> {
        let category = category.trim().to_lowercase();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE assets SET category = ?1 WHERE id = ?2",
            params![category, id],
        )?;
        insert_tags(&tx, id, std::iter::once(category.as_str()))?;
        tx.commit()?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_description(&self, id: i64, description: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE assets SET description = ?1 WHERE id = ?2",
            params![description.trim(), id],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_image_url(&self, id: i64, image_url: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE assets SET image_url = ?1 WHERE id = ?2",
            params![image_url, id],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_download_urls(&self, id: i64, urls: &[String]) -> Result<()> {
        self.lock().execute(
            "UPDATE assets SET download_urls = ?1 WHERE id = ?2",
            params![encode_urls(urls), id],
        )?;
        Ok(())
    }

    // ── Tags ──

    /// Tags of one asset, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn tags(&self, id: i64) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT tag FROM asset_tags WHERE asset_id = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    /// Adds tags to an asset; existing tags are kept.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn add_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let conn = self.lock();
        insert_tags(&conn, id, tags.iter().map(String::as_str))?;
        Ok(())
    }

    /// Replaces an asset's tags; its category stays a tag.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_tags(&self, id: i64, tags: &[String]) -> Result<Vec<String>> {
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM asset_tags WHERE asset_id = ?1", params![id])?;
            let category: Option<String> = tx
                .query_row("SELECT category FROM assets WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            insert_tags(
                &tx,
                id,
                tags.iter().map(String::as_str).chain(category.as_deref()),
            )?;
            tx.commit()?;
        }
        self.tags(id)
    }

    // ── Settings ──

    /// All settings rows.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }

    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Upserts every pair in `values`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn set_settings(&self, values: &HashMap<String, String>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (key, value) in values {
            tx.execute(
                "INSERT INTO settings(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn clear_settings(&self) -> Result<()> {
        self.lock().execute("DELETE FROM settings", [])?;
        Ok(())
    }

    fn query_assets(&self, tail: &str, values: &[Value]) -> Result<Vec<Asset>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {ASSET_COLUMNS} FROM assets a {tail}"))?;
        let assets = stmt
            .query_map(params_from_iter(values.iter()), row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }
}

fn upsert_one(conn: &Connection, asset: &Asset) -> Result<i64> {
    let category = asset
        .category
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());
    let url = (!asset.url.is_empty()).then_some(asset.url.as_str());
    let size = asset.size_bytes.map(|s| i64::try_from(s).unwrap_or(i64::MAX));
    let download_urls = (!asset.download_urls.is_empty()).then(|| encode_urls(&asset.download_urls));

    let existing: Option<i64> = match url {
        Some(url) => conn
            .query_row("SELECT id FROM assets WHERE url = ?1", params![url], |row| row.get(0))
            .optional()?,
        None => conn
            .query_row(
                "SELECT id FROM assets WHERE url IS NULL
                   AND order_id = ?1 AND product_title = ?2 AND file_name = ?3",
                params![asset.order_id, asset.product_title, asset.file_name],
                |row| row.get(0),
            )
            .optional()?,
    };

    let id = if let Some(id) = existing {
        conn.execute(
            "UPDATE assets SET
                order_id = ?1, bundle_title = ?2, product_title = ?3, platform = ?4,
                category = COALESCE(?5, category),
                file_name = ?6, ext = ?7, uploaded_at = ?8, md5 = ?9, trove = ?10,
                size_bytes = ?11,
                download_urls = COALESCE(?12, download_urls),
                machine_name = COALESCE(?13, machine_name),
                image_url = COALESCE(NULLIF(?14, ''), image_url),
                description = COALESCE(NULLIF(?15, ''), description),
                order_name = COALESCE(?16, order_name),
                activation_key = COALESCE(?17, activation_key),
                download_error = COALESCE(?18, download_error),
                download_path = COALESCE(?19, download_path)
             WHERE id = ?20",
            params![
                asset.order_id,
                asset.bundle_title,
                asset.product_title,
                asset.platform,
                category,
                asset.file_name,
                asset.ext,
                asset.uploaded_at,
                asset.md5,
                asset.trove,
                size,
                download_urls,
                asset.machine_name,
                asset.image_url,
                asset.description,
                asset.order_name,
                asset.activation_key,
                asset.download_error,
                asset.download_path,
                id,
            ],
        )?;
        id
    } else {
        let added_ts = if asset.added_ts > 0 {
            asset.added_ts
        } else {
            chrono::Utc::now().timestamp()
        };
        conn.execute(
            "INSERT INTO assets (
                order_id, bundle_title, product_title, platform, category, file_name, url,
                download_urls, ext, uploaded_at, md5, trove, machine_name, size_bytes, image_url,
                description, order_name, activation_key, download_error, added_ts, downloaded,
                download_path
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       NULLIF(?15, ''), NULLIF(?16, ''), ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                asset.order_id,
                asset.bundle_title,
                asset.product_title,
                asset.platform,
                category,
                asset.file_name,
                url,
                download_urls,
                asset.ext,
                asset.uploaded_at,
                asset.md5,
                asset.trove,
                asset.machine_name,
                size,
                asset.image_url,
                asset.description,
                asset.order_name,
                asset.activation_key,
                asset.download_error,
                added_ts,
                asset.downloaded,
                asset.download_path,
            ],
        )?;
        conn.last_insert_rowid()
    };

    conn.execute("DELETE FROM assets_fts WHERE rowid = ?1", params![id])?;
    conn.execute(
        "INSERT INTO assets_fts(rowid, file_name, product_title, bundle_title)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, asset.file_name, asset.product_title, asset.bundle_title],
    )?;

    insert_tags(
        conn,
        id,
        asset.tags.iter().map(String::as_str).chain(category.as_deref()),
    )?;
    Ok(id)
}

fn insert_tags<'a>(
    conn: &Connection,
    id: i64,
    tags: impl IntoIterator<Item = &'a str>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO asset_tags(asset_id, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() {
            stmt.execute(params![id, tag])?;
        }
    }
    Ok(())
}

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let category: Option<String> = row.get(5)?;
    let tags_raw: Option<String> = row.get(23)?;
    let mut tags: Vec<String> = tags_raw
        .as_deref()
        .unwrap_or_default()
        .split(TAG_SEP)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    if let Some(cat) = category.as_deref()
        && let Some(pos) = tags.iter().position(|t| t == cat)
    {
        let primary = tags.remove(pos);
        tags.insert(0, primary);
    }

    Ok(Asset {
        id: row.get(0)?,
        order_id: row.get(1)?,
        bundle_title: row.get(2)?,
        product_title: row.get(3)?,
        platform: row.get(4)?,
        category,
        file_name: row.get(6)?,
        url: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        download_urls: decode_urls(row.get::<_, Option<String>>(8)?.as_deref()),
        ext: row.get(9)?,
        uploaded_at: row.get(10)?,
        md5: row.get(11)?,
        trove: row.get(12)?,
        machine_name: row.get(13)?,
        size_bytes: row
            .get::<_, Option<i64>>(14)?
            .and_then(|s| u64::try_from(s).ok()),
        image_url: row.get(15)?,
        description: row.get(16)?,
        order_name: row.get(17)?,
        activation_key: row.get(18)?,
        download_error: row.get(19)?,
        added_ts: row.get(20)?,
        downloaded: row.get(21)?,
        download_path: row.get(22)?,
        tags,
    })
}

fn encode_urls(urls: &[String]) -> String {
    serde_json::to_string(urls).unwrap_or_else(|_| "[]".to_string())
}

fn decode_urls(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Turns free text into an FTS5 expression: every term must prefix-match.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" AND "))
}

fn file_has_content(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

fn first_present(asset: &Asset, library_root: &Path) -> Option<PathBuf> {
    asset
        .candidate_paths(library_root)
        .into_iter()
        .find(|p| file_has_content(p))
}

fn is_present(asset: &Asset, library_root: Option<&Path>) -> bool {
    if asset
        .download_path
        .as_deref()
        .is_some_and(|p| file_has_content(Path::new(p)))
    {
        return true;
    }
    library_root.is_some_and(|root| first_present(asset, root).is_some())
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or_default()
}
