//! Ingestion collaborators: paginated API client, raw-payload staging and the
//! mapping-rule sheet source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use jobpulse_core::{RawPosting, RuleRow};
use jobpulse_warehouse::Warehouse;

pub const CRATE_NAME: &str = "jobpulse-ingest";

/// Envelope key whose contents are folded into the top level of each record.
pub const JSON_LD_KEY: &str = "jsonLD";

// ---------------------------------------------------------------------------
// Paginated API client
// ---------------------------------------------------------------------------

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

/// A posting API request: the URL template carries a `{request_type}` slot
/// filled with `search` or `count`.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url_template: String,
    pub queryparams: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn url_for(&self, request_type: &str) -> String {
        self.url_template.replace("{request_type}", request_type)
    }
}

/// Page range to crawl. Without an `end_page` the crawl must opt into
/// running until the first empty page.
#[derive(Debug, Clone, Copy)]
pub struct PageWindow {
    pub start_page: u32,
    pub end_page: Option<u32>,
    pub allow_no_end_page: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    InvalidWindow(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("count response missing 'totalCount': {body}")]
    MissingTotalCount { body: String },
    #[error("invalid json response for page {page}")]
    InvalidJson {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page: u32,
    pub body: Vec<u8>,
    pub records: Vec<JsonValue>,
}

pub struct PagedApiClient {
    client: reqwest::Client,
    delay: Duration,
    backoff: BackoffPolicy,
}

impl PagedApiClient {
    pub fn new(timeout: Duration, delay: Duration, backoff: BackoffPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            delay,
            backoff,
        })
    }

    /// Page count reported by the count endpoint: `ceil(totalCount / items_per_page)`.
    pub async fn count_pages(
        &self,
        request: &ApiRequest,
        items_per_page: u32,
    ) -> Result<u32, FetchError> {
        let url = request.url_for("count");
        let response = self.get_with_retry(&url, request, &[]).await?;
        let body: JsonValue = serde_json::from_slice(&response.body).unwrap_or(JsonValue::Null);
        let total = body
            .get("totalCount")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| FetchError::MissingTotalCount {
                body: String::from_utf8_lossy(&response.body).into_owned(),
            })?;
        let max_page = total.div_ceil(u64::from(items_per_page.max(1))) as u32;
        info!(total, max_page, "count endpoint resolved the page range");
        Ok(max_page)
    }

    /// Resolve the effective last page: a configured `end_page` of 1 is taken
    /// as-is (no count request), otherwise the count endpoint caps it.
    pub async fn resolve_end_page(
        &self,
        request: &ApiRequest,
        configured: Option<u32>,
        items_per_page: u32,
    ) -> Result<Option<u32>, FetchError> {
        if configured == Some(1) {
            return Ok(configured);
        }
        let max_page = self.count_pages(request, items_per_page).await?;
        Ok(Some(match configured {
            Some(end_page) => end_page.min(max_page),
            None => max_page,
        }))
    }

    /// Fetch pages in order with a fixed inter-request delay. An open-ended
    /// crawl stops at the first empty page.
    pub async fn fetch_pages(
        &self,
        request: &ApiRequest,
        window: &PageWindow,
    ) -> Result<Vec<FetchedPage>, FetchError> {
        validate_window(request, window)?;
        let url = request.url_for("search");
        let mut pages = Vec::new();
        let mut page = window.start_page;

        loop {
            if let Some(end_page) = window.end_page {
                if page > end_page {
                    info!(end_page, "last page received");
                    break;
                }
            }

            debug!(page, "requesting page");
            let page_param = [("page".to_string(), page.to_string())];
            let response = self.get_with_retry(&url, request, &page_param).await?;

            let body: JsonValue = serde_json::from_slice(&response.body)
                .map_err(|source| FetchError::InvalidJson { page, source })?;
            let records: Vec<JsonValue> = body
                .get("result")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            if records.is_empty() {
                info!(page, "empty page received, stopping crawl");
                break;
            }

            pages.push(FetchedPage {
                page,
                body: response.body,
                records,
            });
            page += 1;
            tokio::time::sleep(self.delay).await;
        }

        Ok(pages)
    }

    async fn get_with_retry(
        &self,
        url: &str,
        request: &ApiRequest,
        extra_params: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("api_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut builder = self.client.get(url).query(&request.queryparams);
            if !extra_params.is_empty() {
                builder = builder.query(extra_params);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let final_url = response.url().to_string();
                    if status.is_success() {
                        let body = response.bytes().await?.to_vec();
                        return Ok(FetchedResponse { body });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

struct FetchedResponse {
    body: Vec<u8>,
}

pub fn validate_window(request: &ApiRequest, window: &PageWindow) -> Result<(), FetchError> {
    if request
        .queryparams
        .iter()
        .any(|(name, _)| name == "page")
    {
        return Err(FetchError::InvalidWindow(
            "define page through the page window, not in queryparams".to_string(),
        ));
    }
    match window.end_page {
        None if !window.allow_no_end_page => Err(FetchError::InvalidWindow(
            "define end_page or set allow_no_end_page".to_string(),
        )),
        Some(end_page) if window.start_page > end_page => Err(FetchError::InvalidWindow(
            "start_page can not be greater than end_page".to_string(),
        )),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Raw payload staging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Local object-storage stand-in for raw page payloads. Writes are atomic
/// (temp file + rename) and a byte-identical re-upload is skipped.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    pub async fn store_bytes(
        &self,
        relative_path: &Path,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading artifact {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredArtifact {
                    content_hash,
                    relative_path: relative_path.to_path_buf(),
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("artifact path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

/// Storage path of one raw page payload, e.g.
/// `raw/jobs/2025_08/2025_08_04_page_3.json`.
pub fn page_artifact_path(storage_path: &str, file_name: &str, page: u32) -> PathBuf {
    PathBuf::from(storage_path).join(format!("{file_name}_{page}.json"))
}

// ---------------------------------------------------------------------------
// Record flattening and field extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("key '{key}' is not a JSON object and can not be flattened")]
    NotAnObject { key: String },
}

/// Fold selected nested objects into the top level of a record. Later keys
/// win collisions; the envelope key itself is removed. Absent keys are
/// skipped.
pub fn flatten_by_key(
    record: &Map<String, JsonValue>,
    keys: &[&str],
) -> Result<Map<String, JsonValue>, FlattenError> {
    let mut result = record.clone();
    for key in keys {
        let Some(nested) = record.get(*key) else {
            continue;
        };
        let JsonValue::Object(nested) = nested else {
            return Err(FlattenError::NotAnObject {
                key: (*key).to_string(),
            });
        };
        for (name, value) in nested {
            result.insert(name.clone(), value.clone());
        }
        result.remove(*key);
    }
    Ok(result)
}

fn text_field(record: &Map<String, JsonValue>, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(JsonValue::as_str)
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

fn parse_created_date(record: &Map<String, JsonValue>) -> Option<NaiveDate> {
    let raw = record.get("dateCreated").and_then(JsonValue::as_str)?;
    let date_part = raw.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Extract one raw posting from a flattened record. Returns `None` (with a
/// warning) when the creation date is missing or unparseable; the transform
/// stage can not order duplicates without it.
pub fn posting_from_record(record: &Map<String, JsonValue>, load_id: &str) -> Option<RawPosting> {
    let Some(date_created) = parse_created_date(record) else {
        warn!(
            title = text_field(record, "title").as_deref().unwrap_or("<unknown>"),
            "skipping record without a valid dateCreated"
        );
        return None;
    };
    let experience_months = record
        .get("experienceRequirements")
        .and_then(|value| value.get("monthsOfExperience"))
        .and_then(JsonValue::as_f64);

    Some(RawPosting {
        load_id: load_id.to_string(),
        source_row_id: Uuid::new_v4().to_string(),
        company: text_field(record, "company"),
        city: text_field(record, "city"),
        title: text_field(record, "title"),
        occupation: text_field(record, "occupation"),
        url: text_field(record, "url"),
        portal: text_field(record, "portal"),
        experience_months,
        date_created,
        description: text_field(record, "description"),
        locale: text_field(record, "locale"),
    })
}

/// Decimal Unix-timestamp load identifier, one per staged load.
pub fn new_load_id(now: DateTime<Utc>) -> String {
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

// ---------------------------------------------------------------------------
// Raw loader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub load_id: String,
    pub pages: usize,
    pub staged_artifacts: usize,
    pub rows: usize,
    pub skipped_rows: usize,
}

/// Fetches the page window, stages every raw payload, and appends the parsed
/// rows plus the load registration to the warehouse.
pub struct RawLoader<'a, W> {
    warehouse: &'a W,
    artifacts: &'a ArtifactStore,
}

impl<'a, W: Warehouse> RawLoader<'a, W> {
    pub fn new(warehouse: &'a W, artifacts: &'a ArtifactStore) -> Self {
        Self {
            warehouse,
            artifacts,
        }
    }

    pub async fn run(
        &self,
        client: &PagedApiClient,
        request: &ApiRequest,
        window: &PageWindow,
        storage_path: &str,
        file_name: &str,
    ) -> Result<LoadSummary> {
        let pages = client
            .fetch_pages(request, window)
            .await
            .context("fetching posting pages")?;

        let now = Utc::now();
        let load_id = new_load_id(now);
        let mut rows = Vec::new();
        let mut skipped_rows = 0usize;
        let mut staged_artifacts = 0usize;

        for page in &pages {
            let path = page_artifact_path(storage_path, file_name, page.page);
            let stored = self
                .artifacts
                .store_bytes(&path, &page.body)
                .await
                .with_context(|| format!("staging page {} payload", page.page))?;
            staged_artifacts += 1;
            debug!(
                page = page.page,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "staged raw payload"
            );

            for record in &page.records {
                let Some(record) = record.as_object() else {
                    warn!(page = page.page, "skipping non-object record");
                    skipped_rows += 1;
                    continue;
                };
                let flattened =
                    flatten_by_key(record, &[JSON_LD_KEY]).context("flattening record")?;
                match posting_from_record(&flattened, &load_id) {
                    Some(posting) => rows.push(posting),
                    None => skipped_rows += 1,
                }
            }
        }

        self.warehouse
            .append_raw_postings(&rows)
            .await
            .context("appending raw postings")?;
        self.warehouse
            .register_load(&load_id, now)
            .await
            .context("registering load")?;

        let summary = LoadSummary {
            load_id,
            pages: pages.len(),
            staged_artifacts,
            rows: rows.len(),
            skipped_rows,
        };
        info!(
            load_id = %summary.load_id,
            pages = summary.pages,
            rows = summary.rows,
            skipped = summary.skipped_rows,
            "load complete"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Mapping-rule sheet source
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RuleFeedError {
    #[error("fetching rule sheet: {0}")]
    Http(#[from] reqwest::Error),
    #[error("parsing rule sheet csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("rule sheet row {row}: invalid boolean '{value}' in column '{column}'")]
    InvalidBool {
        row: usize,
        column: &'static str,
        value: String,
    },
}

/// Rewrite a spreadsheet edit URL into its CSV export form.
pub fn csv_export_url(sheet_url: &str) -> String {
    sheet_url.replace("/edit?gid=", "/export?format=csv&gid=")
}

#[derive(Debug, Deserialize)]
struct SheetRow {
    keyword: Option<String>,
    result: Option<String>,
    case_sensitive: Option<String>,
    spaces_sensitive: Option<String>,
}

fn clean_cell(cell: Option<String>) -> Option<String> {
    cell.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool_cell(
    cell: Option<String>,
    row: usize,
    column: &'static str,
) -> Result<Option<bool>, RuleFeedError> {
    match clean_cell(cell) {
        None => Ok(None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(RuleFeedError::InvalidBool { row, column, value }),
        },
    }
}

/// Parse the exported sheet into raw rule rows. Empty cells become `None`;
/// presence validation happens in the rule-set factory.
pub fn parse_rule_rows(csv_text: &str) -> Result<Vec<RuleRow>, RuleFeedError> {
    let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize::<SheetRow>().enumerate() {
        let record = record?;
        rows.push(RuleRow {
            keyword: clean_cell(record.keyword),
            result: clean_cell(record.result),
            case_sensitive: parse_bool_cell(record.case_sensitive, idx, "case_sensitive")?,
            spaces_sensitive: parse_bool_cell(record.spaces_sensitive, idx, "spaces_sensitive")?,
        });
    }
    Ok(rows)
}

/// Fetches classification rule tables from their spreadsheet export URLs.
pub struct RuleSheetSource {
    client: reqwest::Client,
}

impl Default for RuleSheetSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSheetSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn fetch(&self, sheet_url: &str) -> Result<Vec<RuleRow>, RuleFeedError> {
        let url = csv_export_url(sheet_url);
        debug!(url = %url, "fetching rule sheet");
        let text = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_rule_rows(&text)
    }
}
