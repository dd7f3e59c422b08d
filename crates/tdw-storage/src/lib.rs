//! Stage access for TDW: partition resolution, document stores and warehouse secrets.

mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use secrets::{
    env_var_for_secret, ChainSecretProvider, EnvSecretProvider, FileSecretProvider, SecretError,
    SecretProvider, StaticSecretProvider, WarehouseSecret,
};

pub const CRATE_NAME: &str = "tdw-storage";

/// Top-level prefix under which partition documents are landed.
pub const STAGE_PREFIX: &str = "staging";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("missing logical partition date")]
    MissingPartitionInput,
    #[error("malformed logical partition date {0:?}, expected YYYY-MM-DD")]
    MalformedDate(String),
}

/// Where one partition's document lives and the date it is filtered by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLocator {
    pub date: NaiveDate,
    pub source_id: String,
    pub key: String,
}

impl PartitionLocator {
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Turn a logical `YYYY-MM-DD` date into the partition's storage key.
pub fn resolve_partition(
    logical_date: Option<&str>,
    source_id: &str,
) -> Result<PartitionLocator, PartitionError> {
    let raw = logical_date
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(PartitionError::MissingPartitionInput)?;
    let malformed = || PartitionError::MalformedDate(raw.to_string());

    let parts = raw.split('-').collect::<Vec<_>>();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(malformed());
    }
    let year: i32 = parts[0].parse().map_err(|_| malformed())?;
    let month: u32 = parts[1].parse().map_err(|_| malformed())?;
    let day: u32 = parts[2].parse().map_err(|_| malformed())?;
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(malformed)?;

    Ok(PartitionLocator {
        date,
        source_id: source_id.to_string(),
        key: partition_key(date, source_id),
    })
}

pub fn partition_key(date: NaiveDate, source_id: &str) -> String {
    format!(
        "{STAGE_PREFIX}/{}/{source_id}.json",
        date.format("yyyy=%Y/mm=%m/dd=%d")
    )
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub key: String,
    pub location: String,
    pub content_hash: String,
    pub bytes: Vec<u8>,
}

impl StoredDocument {
    fn new(key: &str, location: String, bytes: Vec<u8>) -> Self {
        Self {
            key: key.to_string(),
            location,
            content_hash: sha256_hex(&bytes),
            bytes,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid stage configuration: {0}")]
    Configuration(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Read access to landed partition documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self, key: &str) -> Result<StoredDocument, StoreError>;
}

/// Stage rooted in a local directory, laid out exactly like the object store.
#[derive(Debug, Clone)]
pub struct LocalDocumentStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LandedDocument {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty() && *segment != "..")
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    /// Land bytes under `key` with an atomic temp-file rename. Landing the
    /// same content twice leaves the file untouched.
    pub async fn land_bytes(&self, key: &str, bytes: &[u8]) -> Result<LandedDocument, StoreError> {
        let content_hash = sha256_hex(bytes);
        let absolute_path = self.path_for(key);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::io(&parent, err))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if sha256_hex(&existing) == content_hash {
                return Ok(LandedDocument {
                    content_hash,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&absolute_path, err));
        }

        Ok(LandedDocument {
            content_hash,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn fetch(&self, key: &str) -> Result<StoredDocument, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(StoredDocument::new(key, path.display().to_string(), bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Stage served over HTTP(S), e.g. a static website endpoint in front of the bucket.
#[derive(Debug)]
pub struct HttpDocumentStore {
    base_url: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpDocumentStore {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch(&self, key: &str) -> Result<StoredDocument, StoreError> {
        let url = self.url_for(key);
        let span = info_span!("stage_fetch", url = %url);
        self.fetch_with_retry(key, &url).instrument(span).await
    }
}

impl HttpDocumentStore {
    async fn fetch_with_retry(&self, key: &str, url: &str) -> Result<StoredDocument, StoreError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(StoredDocument::new(key, final_url, body));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(StoreError::NotFound(final_url));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying stage fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying stage fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }
}

/// Pick a store for `stage_root`: `http(s)://` URLs are fetched remotely,
/// anything else is a local directory.
pub fn open_document_store(
    stage_root: &str,
    http: HttpClientConfig,
) -> Result<Box<dyn DocumentStore>, StoreError> {
    let trimmed = stage_root.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Configuration("stage root is empty".into()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(Box::new(HttpDocumentStore::new(trimmed, http)?))
    } else {
        Ok(Box::new(LocalDocumentStore::new(trimmed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolves_partition_key_from_logical_date() {
        let locator = resolve_partition(Some("2025-02-05"), "telekom").unwrap();
        assert_eq!(locator.date, NaiveDate::from_ymd_opt(2025, 2, 5).unwrap());
        assert_eq!(locator.key, "staging/yyyy=2025/mm=02/dd=05/telekom.json");
        assert_eq!(locator.date_string(), "2025-02-05");
    }

    #[test]
    fn pads_unpadded_segments() {
        let locator = resolve_partition(Some("2025-2-5"), "telekom").unwrap();
        assert_eq!(locator.key, "staging/yyyy=2025/mm=02/dd=05/telekom.json");
    }

    #[test]
    fn missing_or_blank_date_is_rejected() {
        assert_eq!(
            resolve_partition(None, "telekom"),
            Err(PartitionError::MissingPartitionInput)
        );
        assert_eq!(
            resolve_partition(Some("  "), "telekom"),
            Err(PartitionError::MissingPartitionInput)
        );
    }

    #[test]
    fn malformed_dates_are_rejected() {
        for raw in ["2025/02/05", "2025-02", "2025-02-05-01", "2025-0x-05", "2025-02-30", "-02-05"] {
            assert!(
                matches!(resolve_partition(Some(raw), "telekom"), Err(PartitionError::MalformedDate(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn landed_documents_can_be_fetched_back() {
        let dir = tempdir().expect("tempdir");
        let store = LocalDocumentStore::new(dir.path());
        let key = "staging/yyyy=2025/mm=02/dd=05/telekom.json";

        let first = store.land_bytes(key, b"{}").await.expect("first land");
        let second = store.land_bytes(key, b"{}").await.expect("second land");
        assert!(!first.unchanged);
        assert!(second.unchanged);

        let doc = store.fetch(key).await.expect("fetch");
        assert_eq!(doc.bytes, b"{}");
        assert_eq!(doc.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn missing_local_document_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = LocalDocumentStore::new(dir.path());
        let err = store
            .fetch("staging/yyyy=2025/mm=02/dd=06/telekom.json")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn parent_segments_do_not_escape_the_root() {
        let store = LocalDocumentStore::new("/stage");
        assert_eq!(store.path_for("../etc/passwd"), PathBuf::from("/stage/etc/passwd"));
    }

    #[test]
    fn stage_root_selects_store_kind() {
        let local = open_document_store("./fixtures", HttpClientConfig::default()).unwrap();
        assert!(local.describe().starts_with("file://"));
        let remote =
            open_document_store("https://stage.example.com/", HttpClientConfig::default()).unwrap();
        assert_eq!(remote.describe(), "https://stage.example.com");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }
}
