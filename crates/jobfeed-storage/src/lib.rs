//! Feed fetching + idempotent job persistence for jobfeed.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use jobfeed_core::{CanonicalRecord, FeedKey};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobfeed-storage";

/// Upper bound on `job_id` length, mirrored by the `jobs` table check constraint.
pub const MAX_JOB_ID_CHARS: usize = 512;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

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
    // The timeout budget covers the whole transfer; it is never renewed.
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Ceiling for one whole transfer, body included.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transfer aborted: {message}")]
    Transfer { timed_out: bool, message: String },
    #[error("timed out: fetch deadline of {timeout:?} exceeded for {url}")]
    DeadlineExceeded { url: String, timeout: Duration },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout(),
            FetchError::Transfer { timed_out, .. } => *timed_out,
            FetchError::DeadlineExceeded { .. } => true,
            FetchError::HttpStatus { .. } => false,
        }
    }
}

/// Raised by the response body while a feed is being streamed. Carried inside
/// `io::Error` through the decoder and parser so the pipeline can tell a
/// network failure apart from corrupt content.
#[derive(Debug, Error)]
#[error("feed body transfer failed: {0}")]
pub struct TransferError(#[source] pub reqwest::Error);

/// Recovers the fetch failure hidden inside an I/O error, if there is one.
pub fn transfer_failure(err: &io::Error) -> Option<FetchError> {
    let transfer = err.get_ref()?.downcast_ref::<TransferError>()?;
    let timed_out = transfer.0.is_timeout();
    let message = if timed_out {
        format!("timed out: {transfer}")
    } else {
        transfer.to_string()
    };
    Some(FetchError::Transfer { timed_out, message })
}

pub type FeedBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Async reader over a feed body; never holds more than one network chunk.
pub type FeedReader = StreamReader<FeedBody, Bytes>;

/// An open, not yet consumed feed response.
#[derive(Debug)]
pub struct FeedStream {
    pub status: StatusCode,
    pub final_url: String,
    pub content_length: Option<u64>,
    deadline: Instant,
    response: reqwest::Response,
}

impl FeedStream {
    /// Instant at which the whole transfer must be finished.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn into_reader(self) -> FeedReader {
        let body: FeedBody = Box::pin(
            self.response
                .bytes_stream()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, TransferError(err))),
        );
        StreamReader::new(body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    /// Opens a streaming response for a feed. Retries happen only before the
    /// body starts flowing, and every attempt plus the body share one deadline.
    /// Budget shared by connect, retries and the body transfer.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn open_stream(&self, feed: &FeedKey) -> Result<FeedStream, FetchError> {
        let span = info_span!("http_fetch", client_id = %feed.client_id, url = %feed.feed_url);
        let deadline = Instant::now() + self.timeout;
        self.open_with_retries(&feed.feed_url, deadline)
            .instrument(span)
            .await
    }

    /// Waits out the backoff delay unless it would cross the deadline.
    async fn backoff_within(&self, attempt: usize, deadline: Instant) -> bool {
        if attempt >= self.backoff.max_retries {
            return false;
        }
        let resume_at = Instant::now() + self.backoff.delay_for_attempt(attempt);
        if resume_at >= deadline {
            return false;
        }
        tokio::time::sleep_until(resume_at).await;
        true
    }

    async fn open_with_retries(&self, url: &str, deadline: Instant) -> Result<FeedStream, FetchError> {
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FetchError::DeadlineExceeded {
                    url: url.to_string(),
                    timeout: self.timeout,
                });
            }
            match self.client.get(url).timeout(remaining).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        debug!(%status, content_length = ?resp.content_length(), "feed stream opened");
                        return Ok(FeedStream {
                            status,
                            final_url,
                            content_length: resp.content_length(),
                            deadline,
                            response: resp,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable {
                        warn!(%status, attempt, "retryable feed status");
                        if self.backoff_within(attempt, deadline).await {
                            attempt += 1;
                            continue;
                        }
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        warn!(error = %err, attempt, "retryable feed request error");
                        if self.backoff_within(attempt, deadline).await {
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub job_id: String,
    pub reason: String,
}

/// Per-flush result. Rejected rows failed individually; the rest were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteResult {
    pub inserted: u64,
    pub updated: u64,
    pub rejected: Vec<RejectedRecord>,
}

/// Idempotent job persistence keyed on `(feed_id, job_id)`.
///
/// One call is one unordered bulk upsert: a row that violates the store's
/// constraints is reported in `rejected` without blocking the others. An
/// `Err` means nothing in the batch can be assumed written.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<BatchWriteResult, WriteError>;
}

/// Row constraints shared by every store, matching `migrations/0001_create_jobs.sql`.
pub fn validate_row(record: &CanonicalRecord) -> Result<(), String> {
    let len = record.job_id.chars().count();
    if len == 0 {
        return Err("job_id is empty".to_string());
    }
    if len > MAX_JOB_ID_CHARS {
        return Err(format!("job_id is {len} chars, limit is {MAX_JOB_ID_CHARS}"));
    }
    let has_nul = record.feed_id.contains('\0')
        || record.job_id.contains('\0')
        || record
            .fields
            .iter()
            .any(|(k, v)| k.contains('\0') || v.contains('\0'));
    if has_nul {
        return Err("NUL character in row".to_string());
    }
    Ok(())
}

/// Keeps the last occurrence of each key, preserving source order otherwise.
fn collapse_duplicates<'a>(records: &[&'a CanonicalRecord]) -> Vec<&'a CanonicalRecord> {
    let mut last: HashMap<(&str, &str), usize> = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        last.insert(record.key(), idx);
    }
    records
        .iter()
        .enumerate()
        .filter(|(idx, record)| last.get(&record.key()) == Some(idx))
        .map(|(_, record)| *record)
        .collect()
}

fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to job store")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running job store migrations")
    }

    /// Returns one flag per written row: `true` for an insert, `false` for an update.
    async fn upsert_rows(&self, rows: &[&CanonicalRecord]) -> Result<Vec<bool>, sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO jobs (feed_id, job_id, mapped_fields) ");
        builder.push_values(rows.iter().copied(), |mut b, row| {
            b.push_bind(&row.feed_id)
                .push_bind(&row.job_id)
                .push_bind(Json(&row.fields));
        });
        builder.push(
            " ON CONFLICT (feed_id, job_id) DO UPDATE \
             SET mapped_fields = EXCLUDED.mapped_fields, updated_at = now() \
             RETURNING (xmax = 0) AS inserted",
        );
        builder.build_query_scalar::<bool>().fetch_all(&self.pool).await
    }
}

fn tally(result: &mut BatchWriteResult, flags: &[bool]) {
    for inserted in flags {
        if *inserted {
            result.inserted += 1;
        } else {
            result.updated += 1;
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<BatchWriteResult, WriteError> {
        let mut result = BatchWriteResult::default();
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match validate_row(record) {
                Ok(()) => valid.push(record),
                Err(reason) => result.rejected.push(RejectedRecord {
                    job_id: record.job_id.clone(),
                    reason,
                }),
            }
        }

        let rows = collapse_duplicates(&valid);
        // Earlier duplicates are overwritten by the later row in the same batch.
        result.updated += (valid.len() - rows.len()) as u64;
        if rows.is_empty() {
            return Ok(result);
        }

        match self.upsert_rows(&rows).await {
            Ok(flags) => {
                tally(&mut result, &flags);
                Ok(result)
            }
            Err(err) if is_connectivity_error(&err) => Err(WriteError::Unavailable(err.to_string())),
            Err(err) => {
                warn!(batch_size = rows.len(), error = %err, "bulk upsert rejected; retrying rows individually");
                for (idx, row) in rows.iter().enumerate() {
                    match self.upsert_rows(&[*row]).await {
                        Ok(flags) => tally(&mut result, &flags),
                        Err(err) if is_connectivity_error(&err) => {
                            let reason = format!("job store unavailable: {err}");
                            result.rejected.extend(rows[idx..].iter().map(|r| RejectedRecord {
                                job_id: r.job_id.clone(),
                                reason: reason.clone(),
                            }));
                            break;
                        }
                        Err(err) => result.rejected.push(RejectedRecord {
                            job_id: row.job_id.clone(),
                            reason: err.to_string(),
                        }),
                    }
                }
                Ok(result)
            }
        }
    }
}

/// In-process store with the same key and row constraints as `jobs`.
/// Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<HashMap<(String, String), BTreeMap<String, String>>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn get(&self, feed_id: &str, job_id: &str) -> Option<BTreeMap<String, String>> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(feed_id.to_string(), job_id.to_string()))
            .cloned()
    }

    /// Rows for one feed, ordered by `job_id`.
    pub fn rows_for_feed(&self, feed_id: &str) -> Vec<CanonicalRecord> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<CanonicalRecord> = rows
            .iter()
            .filter(|((feed, _), _)| feed == feed_id)
            .map(|((feed, job), fields)| CanonicalRecord {
                feed_id: feed.clone(),
                job_id: job.clone(),
                fields: fields.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        out
    }

    /// Size of every batch received, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<BatchWriteResult, WriteError> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records.len());

        let mut result = BatchWriteResult::default();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            if let Err(reason) = validate_row(record) {
                result.rejected.push(RejectedRecord {
                    job_id: record.job_id.clone(),
                    reason,
                });
                continue;
            }
            let key = (record.feed_id.clone(), record.job_id.clone());
            if rows.insert(key, record.fields.clone()).is_some() {
                result.updated += 1;
            } else {
                result.inserted += 1;
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub received: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
    pub flushes: u64,
    /// Records still buffered when the stream was abandoned.
    pub discarded: u64,
}

/// Accumulates canonical records for one feed and flushes them as bulk upserts.
pub struct BatchUpsertWriter {
    store: Arc<dyn JobStore>,
    feed: FeedKey,
    batch_size: usize,
    buffer: Vec<CanonicalRecord>,
    summary: WriterSummary,
}

impl BatchUpsertWriter {
    pub fn new(store: Arc<dyn JobStore>, feed: FeedKey, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            feed,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            summary: WriterSummary::default(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn summary(&self) -> WriterSummary {
        self.summary
    }

    pub async fn push(&mut self, record: CanonicalRecord) {
        self.summary.received += 1;
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Writes the buffered records. Failures are counted, never raised, and
    /// the buffer is empty afterwards either way.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        self.summary.flushes += 1;

        match self.store.upsert_batch(&batch).await {
            Ok(result) => {
                self.summary.inserted += result.inserted;
                self.summary.updated += result.updated;
                self.summary.failed += result.rejected.len() as u64;
                if let Some(first) = result.rejected.first() {
                    warn!(
                        client_id = %self.feed.client_id,
                        feed_url = %self.feed.feed_url,
                        batch_size = batch.len(),
                        rejected = result.rejected.len(),
                        first_job_id = %first.job_id,
                        reason = %first.reason,
                        "rows rejected by job store"
                    );
                }
                debug!(
                    client_id = %self.feed.client_id,
                    batch_size = batch.len(),
                    inserted = result.inserted,
                    updated = result.updated,
                    "batch flushed"
                );
            }
            Err(err) => {
                self.summary.failed += batch.len() as u64;
                error!(
                    client_id = %self.feed.client_id,
                    feed_url = %self.feed.feed_url,
                    batch_size = batch.len(),
                    error = %err,
                    "batch upsert failed"
                );
            }
        }
    }

    /// Flushes the partial tail batch and returns the totals.
    pub async fn finish(mut self) -> WriterSummary {
        self.flush().await;
        self.summary
    }

    /// Drops whatever is buffered without writing it.
    pub fn discard(mut self) -> WriterSummary {
        self.summary.discarded = self.buffer.len() as u64;
        self.buffer.clear();
        self.summary
    }
}
