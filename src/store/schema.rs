//! Table definitions for the asset store.

use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const V1: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id        TEXT NOT NULL,
    bundle_title    TEXT NOT NULL DEFAULT '',
    product_title   TEXT NOT NULL DEFAULT '',
    platform        TEXT NOT NULL DEFAULT '',
    category        TEXT,
    file_name       TEXT NOT NULL DEFAULT '',
    url             TEXT UNIQUE,
    download_urls   TEXT,
    ext             TEXT NOT NULL DEFAULT '',
    uploaded_at     TEXT,
    md5             TEXT,
    trove           INTEGER NOT NULL DEFAULT 0,
    machine_name    TEXT,
    size_bytes      INTEGER,
    image_url       TEXT,
    description     TEXT,
    order_name      TEXT,
    activation_key  TEXT,
    download_error  TEXT,
    added_ts        INTEGER NOT NULL,
    downloaded      INTEGER NOT NULL DEFAULT 0,
    download_path   TEXT
);

CREATE INDEX IF NOT EXISTS idx_assets_platform ON assets(platform);
CREATE INDEX IF NOT EXISTS idx_assets_bundle ON assets(bundle_title);
CREATE INDEX IF NOT EXISTS idx_assets_product ON assets(product_title);
CREATE INDEX IF NOT EXISTS idx_assets_order ON assets(order_id);
CREATE INDEX IF NOT EXISTS idx_assets_category ON assets(category);

CREATE TABLE IF NOT EXISTS asset_tags (
    asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    tag      TEXT NOT NULL,
    UNIQUE(asset_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_asset_tags_tag ON asset_tags(tag);

CREATE VIRTUAL TABLE IF NOT EXISTS assets_fts
    USING fts5(file_name, product_title, bundle_title);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Brings the schema up to [`SCHEMA_VERSION`].
///
/// # Errors
///
/// Returns an error if a migration statement fails.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < 1 {
        conn.execute_batch(V1)?;
    }
    if version != SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        log::debug!("Asset schema migrated from v{version} to v{SCHEMA_VERSION}");
    }
    Ok(())
}
