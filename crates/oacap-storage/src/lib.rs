//! On-disk report cache + HTTP fetch utilities for the capacity report endpoint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use oacap_core::{GasDay, ISO_DATE_FORMAT};
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "oacap-storage";

pub const DEFAULT_BASE_URL: &str =
    "https://twtransfer.energytransfer.com/ipost/capacity/operationally-available";

/// Query parameters sent with every request, ahead of `gasDay` and `cycle`.
pub const BASE_QUERY: [(&str, &str); 7] = [
    ("f", "csv"),
    ("extension", "csv"),
    ("asset", "TW"),
    ("searchType", "NOM"),
    ("searchString", ""),
    ("locType", "ALL"),
    ("locZone", "ALL"),
];

const NO_DATA_MARKER: &str = "no data";
const CACHE_EXTENSION: &str = "csv";

/// Cache address of one report: the `(gas day, cycle)` it was published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub gas_day: GasDay,
    pub cycle: u8,
}

impl CacheKey {
    pub fn new(gas_day: GasDay, cycle: u8) -> Self {
        Self { gas_day, cycle }
    }

    pub fn file_name(&self) -> String {
        format!("{self}.{CACHE_EXTENSION}")
    }

    /// Inverse of [`CacheKey::file_name`]; `None` for anything this cache
    /// would not have written.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(CACHE_EXTENSION)?.strip_suffix('.')?;
        let (day, cycle) = stem.split_once("_cycle")?;
        let gas_day = NaiveDate::parse_from_str(day, ISO_DATE_FORMAT).ok()?;
        let cycle = cycle.parse::<u8>().ok().filter(|c| *c > 0)?;
        let key = Self::new(GasDay::new(gas_day), cycle);
        (key.file_name() == name).then_some(key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_cycle{}", self.gas_day.iso(), self.cycle)
    }
}

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReportCache {
    root: PathBuf,
}

impl ReportCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub async fn contains(&self, key: &CacheKey) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache entry {}", path.display()))
    }

    pub async fn read(&self, key: &CacheKey) -> anyhow::Result<Option<String>> {
        if !self.contains(key).await? {
            return Ok(None);
        }
        let path = self.path_for(key);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        Ok(Some(content))
    }

    /// Write a report through a temp file and atomic rename, replacing any
    /// previous entry for the same key.
    pub async fn write(&self, key: &CacheKey, content: &str) -> anyhow::Result<CachedEntry> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache directory {}", self.root.display()))?;

        let path = self.path_for(key);
        let bytes = content.as_bytes();
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp cache file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(CachedEntry {
            key: *key,
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
            written_at: Utc::now(),
        })
    }

    /// Returns whether an entry was removed.
    pub async fn evict(&self, key: &CacheKey) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(cache_key = %key, "evicted cache entry");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("removing cache entry {}", path.display()))
            }
        }
    }

    pub async fn evict_all(&self) -> anyhow::Result<usize> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading cache directory {}", self.root.display()))
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("listing cache directory {}", self.root.display()))?
        {
            let path = entry.path();
            let is_report = entry
                .file_name()
                .to_str()
                .and_then(CacheKey::from_file_name)
                .is_some();
            if !is_report {
                continue;
            }
            fs::remove_file(&path)
                .await
                .with_context(|| format!("removing cache entry {}", path.display()))?;
            removed += 1;
        }
        info!(removed, cache_dir = %self.root.display(), "cleared report cache");
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Csv,
    Html,
    Other,
}

pub fn classify_content_type(content_type: Option<&str>) -> ContentKind {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match essence.as_str() {
        "text/csv" | "application/csv" => ContentKind::Csv,
        "text/html" => ContentKind::Html,
        _ => ContentKind::Other,
    }
}

/// Fixed-delay bounded retry. `max_attempts` counts every request, the first included.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

/// Issues a single GET against the report endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Report content together with the cache key it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub key: CacheKey,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(RawPayload),
    Cached(RawPayload),
    /// The endpoint answered with its HTML "no data" page.
    NoData,
    Unexpected { content_type: Option<String> },
    Exhausted { attempts: usize },
}

impl FetchOutcome {
    pub fn into_payload(self) -> Option<RawPayload> {
        match self {
            Self::Fetched(payload) | Self::Cached(payload) => Some(payload),
            Self::NoData | Self::Unexpected { .. } | Self::Exhausted { .. } => None,
        }
    }

    pub fn is_network_fetch(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }
}

#[derive(Debug)]
pub struct ReportFetcher<T = ReqwestTransport> {
    transport: T,
    cache: ReportCache,
    base_url: String,
    retry: RetryPolicy,
}

impl ReportFetcher<ReqwestTransport> {
    pub fn from_config(config: FetcherConfig, cache: ReportCache) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::new(transport, cache, config))
    }
}

impl<T: Transport> ReportFetcher<T> {
    pub fn new(transport: T, cache: ReportCache, config: FetcherConfig) -> Self {
        Self {
            transport,
            cache,
            base_url: config.base_url,
            retry: config.retry,
        }
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn build_url(&self, gas_day: GasDay, cycle: u8) -> anyhow::Result<Url> {
        let gas_day = gas_day.url_format();
        let cycle = cycle.to_string();
        let mut params: Vec<(&str, &str)> = BASE_QUERY.to_vec();
        params.push(("gasDay", &gas_day));
        params.push(("cycle", &cycle));
        Url::parse_with_params(&self.base_url, params)
            .with_context(|| format!("building report url from {}", self.base_url))
    }

    /// Fetch the report for one key, replaying the cache when possible.
    ///
    /// Never fails: every way of not getting a report degrades to a
    /// non-payload outcome, logged here.
    pub async fn fetch(&self, gas_day: GasDay, cycle: u8) -> FetchOutcome {
        let key = CacheKey::new(gas_day, cycle);
        let span = info_span!("report_fetch", cache_key = %key);
        self.fetch_key(key).instrument(span).await
    }

    async fn fetch_key(&self, key: CacheKey) -> FetchOutcome {
        match self.cache.read(&key).await {
            Ok(Some(content)) => {
                info!(bytes = content.len(), "replaying cached report");
                return FetchOutcome::Cached(RawPayload { key, content });
            }
            Ok(None) => {}
            Err(err) => warn!(error = ?err, "cache lookup failed, fetching"),
        }

        let url = match self.build_url(key.gas_day, key.cycle) {
            Ok(url) => url,
            Err(err) => {
                error!(error = ?err, "cannot build report url");
                return FetchOutcome::Exhausted { attempts: 0 };
            }
        };

        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.get(&url).await {
                Ok(resp) if resp.is_success() => return self.classify(key, resp).await,
                Ok(resp) => warn!(attempt, attempts, status = resp.status, "non-success status"),
                Err(err) => warn!(attempt, attempts, error = %err, "report request failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        error!(attempts, %url, "giving up on report after retries");
        FetchOutcome::Exhausted { attempts }
    }

    async fn classify(&self, key: CacheKey, resp: TransportResponse) -> FetchOutcome {
        match classify_content_type(resp.content_type.as_deref()) {
            ContentKind::Csv => {
                match self.cache.write(&key, &resp.body).await {
                    Ok(entry) => info!(
                        bytes = entry.byte_size,
                        sha256 = %entry.content_hash,
                        path = %entry.path.display(),
                        "cached report"
                    ),
                    Err(err) => warn!(error = ?err, "failed to cache report"),
                }
                FetchOutcome::Fetched(RawPayload {
                    key,
                    content: resp.body,
                })
            }
            ContentKind::Html if resp.body.to_ascii_lowercase().contains(NO_DATA_MARKER) => {
                info!("endpoint reports no data");
                FetchOutcome::NoData
            }
            ContentKind::Html | ContentKind::Other => {
                warn!(
                    content_type = resp.content_type.as_deref().unwrap_or("<none>"),
                    "unexpected report response"
                );
                FetchOutcome::Unexpected {
                    content_type: resp.content_type,
                }
            }
        }
    }
}
