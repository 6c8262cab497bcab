//! HTTP implementation of [`CatalogApi`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;

use super::{CatalogApi, Order, RemoteFile, TroveProduct};
use crate::error::{Error, Result};
use crate::model::canonical_url;

/// Storefront root used when no override is configured.
pub const DEFAULT_BASE_URL: &str = "https://www.humblebundle.com";

const SESSION_COOKIE: &str = "_simpleauth_sess";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct OrderRef {
    gamekey: String,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(default)]
    signed_url: Option<String>,
    #[serde(default, rename = "_errors")]
    errors: Option<serde_json::Value>,
}

/// Authenticated client for the storefront API.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HumbleClient {
    http: reqwest::Client,
    base_url: String,
}

impl HumbleClient {
    /// Builds a client that sends `session` with every request.
    ///
    /// The idle pool holds at least `2 * workers` connections per host.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(session: &str, workers: usize) -> Result<Self> {
        Self::with_base_url(session, workers, DEFAULT_BASE_URL)
    }

    /// Same as [`HumbleClient::new`] against a different storefront root.
    ///
    /// # Errors
    ///
    /// See [`HumbleClient::new`].
    pub fn with_base_url(session: &str, workers: usize, base_url: &str) -> Result<Self> {
        let session = session.trim();
        if session.is_empty() {
            return Err(Error::MissingSession);
        }
        let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session}"))
            .map_err(|e| Error::Config(format!("invalid session credential: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, cookie);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host((workers * 2).max(20))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: canonical_url(url).to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CatalogApi for HumbleClient {
    async fn purchase_keys(&self) -> Result<Vec<String>> {
        let orders: Vec<OrderRef> = self
            .get_json(&self.endpoint("/api/v1/user/order"))
            .await
            .map_err(|e| match e {
                Error::Status {
                    status: 401 | 403, ..
                } => Error::MissingSession,
                other => other,
            })?;
        Ok(orders.into_iter().map(|o| o.gamekey).collect())
    }

    async fn order(&self, key: &str) -> Result<Order> {
        self.get_json(&self.endpoint(&format!("/api/v1/order/{key}?all_tpkds=true")))
            .await
    }

    async fn trove_page(&self, index: usize) -> Result<Vec<TroveProduct>> {
        self.get_json(&self.endpoint(&format!("/client/catalog?index={index}")))
            .await
    }

    async fn sign_trove_url(&self, machine_name: &str, file_name: &str) -> Result<String> {
        let url = self.endpoint("/api/v1/user/download/sign");
        let response = self
            .http
            .post(&url)
            .form(&[("machine_name", machine_name), ("filename", file_name)])
            .send()
            .await?;
        let status = response.status();
        if matches!(status.as_u16(), 401 | 403) {
            return Err(Error::TroveAccessDenied);
        }
        if !status.is_success() {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body: SignResponse = response.json().await?;
        if body
            .errors
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .is_some_and(|e| e == "Unauthorized")
        {
            return Err(Error::TroveAccessDenied);
        }
        body.signed_url.ok_or_else(|| Error::Status {
            url,
            status: status.as_u16(),
        })
    }

    async fn open_download(&self, url: &str) -> Result<RemoteFile> {
        let response = self.http.get(url).send().await?;
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(RemoteFile {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            last_modified,
            body: response.bytes_stream().map_err(Error::from).boxed(),
        })
    }
}
