//! Dedup, idempotent bulk load and run orchestration for capacity reports.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use oacap_core::{GasDay, NaturalKey, Record};
use oacap_parse::RowParser;
use oacap_storage::{
    FetchOutcome, FetcherConfig, ReportCache, ReportFetcher, ReqwestTransport, RetryPolicy,
    Transport, DEFAULT_BASE_URL,
};
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oacap-sync";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_WINDOW_DAYS: u32 = 3;
pub const DEFAULT_CYCLES: [u8; 5] = [1, 2, 3, 4, 5];

/// Rows per INSERT statement; 12 binds each keeps a statement under the
/// Postgres limit of 65535 parameters.
const STATEMENT_ROWS: usize = 1000;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INSERT_PREFIX: &str = "INSERT INTO gas_shipments (loc, loc_zone, loc_name, loc_purpose, \
     measure_basis, oper_capacity, design_capacity, scheduled_qty, operationally_available, \
     total_scheduled, gas_day, cycle) ";

const UPSERT_SUFFIX: &str = " ON CONFLICT (loc, gas_day, cycle) DO UPDATE SET \
     loc_zone = EXCLUDED.loc_zone, \
     loc_name = EXCLUDED.loc_name, \
     loc_purpose = EXCLUDED.loc_purpose, \
     measure_basis = EXCLUDED.measure_basis, \
     oper_capacity = EXCLUDED.oper_capacity, \
     design_capacity = EXCLUDED.design_capacity, \
     scheduled_qty = EXCLUDED.scheduled_qty, \
     operationally_available = EXCLUDED.operationally_available, \
     total_scheduled = EXCLUDED.total_scheduled, \
     updated_at = NOW() \
     RETURNING id";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub keep_cache: bool,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub retry_delay_secs: u64,
    pub batch_size: Option<usize>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| {
                database_url_from_parts(
                    &env_or("DB_HOST", "localhost"),
                    &env_or("DB_PORT", "5432"),
                    &env_or("DB_NAME", "gas_shipments"),
                    &env_or("DB_USER", "postgres"),
                    &env_or("DB_PASSWORD", "postgres"),
                )
            }),
            cache_dir: std::env::var("OACAP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            keep_cache: std::env::var("OACAP_KEEP_CACHE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            base_url: env_or("OACAP_BASE_URL", DEFAULT_BASE_URL),
            user_agent: env_or("OACAP_USER_AGENT", "oacap/0.1"),
            http_timeout_secs: env_parse("OACAP_HTTP_TIMEOUT_SECS").unwrap_or(30),
            max_attempts: env_parse("OACAP_MAX_ATTEMPTS").unwrap_or(3),
            retry_delay_secs: env_parse("OACAP_RETRY_DELAY_SECS").unwrap_or(5),
            batch_size: env_parse("OACAP_BATCH_SIZE"),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.batch_size,
            keep_cache: self.keep_cache,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn database_url_from_parts(
    host: &str,
    port: &str,
    name: &str,
    user: &str,
    password: &str,
) -> String {
    format!("postgres://{user}:{password}@{host}:{port}/{name}")
}

/// Gas days ending yesterday, newest first.
pub fn gas_day_window(today: NaiveDate, days: u32) -> Vec<GasDay> {
    (1..=i64::from(days))
        .map(|offset| GasDay::new(today - TimeDelta::days(offset)))
        .collect()
}

/// Collapse records sharing a natural key; the last one seen wins.
///
/// Each winner sits at the position where its key first appeared.
pub fn dedupe(records: Vec<Record>) -> Vec<Record> {
    let mut slots: HashMap<NaturalKey, usize> = HashMap::with_capacity(records.len());
    let mut winners: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match slots.entry(record.natural_key()) {
            Entry::Occupied(slot) => winners[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(winners.len());
                winners.push(record);
            }
        }
    }
    winners
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait UpsertStore: Send {
    /// Insert-or-update one batch as a single atomic unit; returns rows affected.
    async fn upsert_batch(&mut self, batch: &[Record]) -> Result<u64, StoreError>;
}

/// `gas_shipments` table over one long-lived connection.
#[derive(Debug)]
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = PgConnection::connect(database_url).await?;
        info!("connected to database");
        Ok(Self { conn })
    }

    pub async fn migrate(&mut self) -> Result<(), StoreError> {
        MIGRATOR.run(&mut self.conn).await?;
        info!("database schema is up to date");
        Ok(())
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        info!("database connection closed");
        Ok(())
    }
}

async fn insert_chunks(conn: &mut PgConnection, batch: &[Record]) -> Result<u64, sqlx::Error> {
    let mut affected = 0u64;
    for chunk in batch.chunks(STATEMENT_ROWS) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_PREFIX);
        qb.push_values(chunk, |mut row, record| {
            row.push_bind(record.loc.as_str())
                .push_bind(record.loc_zone.as_deref())
                .push_bind(record.loc_name.as_deref())
                .push_bind(record.loc_purpose.as_deref())
                .push_bind(record.measure_basis.as_deref())
                .push_bind(record.oper_capacity)
                .push_bind(record.design_capacity)
                .push_bind(record.scheduled_qty)
                .push_bind(record.operationally_available)
                .push_bind(record.total_scheduled)
                .push_bind(record.gas_day.date())
                .push_bind(i32::from(record.cycle));
        });
        qb.push(UPSERT_SUFFIX);
        let ids = qb.build().fetch_all(&mut *conn).await?;
        affected += ids.len() as u64;
    }
    Ok(affected)
}

#[async_trait]
impl UpsertStore for PgStore {
    async fn upsert_batch(&mut self, batch: &[Record]) -> Result<u64, StoreError> {
        let mut tx = self.conn.begin().await?;
        match insert_chunks(&mut tx, batch).await {
            Ok(affected) => {
                tx.commit().await?;
                Ok(affected)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed upsert also failed");
                }
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub record: Record,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-process store with the same conflict rules as `gas_shipments`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: HashMap<NaturalKey, StoredRow>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.values()
    }
}

#[async_trait]
impl UpsertStore for MemoryStore {
    async fn upsert_batch(&mut self, batch: &[Record]) -> Result<u64, StoreError> {
        let now = Utc::now();
        for record in batch {
            match self.rows.entry(record.natural_key()) {
                Entry::Occupied(mut slot) => {
                    let row = slot.get_mut();
                    row.record = record.clone();
                    row.updated_at = now;
                }
                Entry::Vacant(slot) => {
                    self.next_id += 1;
                    slot.insert(StoredRow {
                        id: self.next_id,
                        record: record.clone(),
                        created_at: now,
                        updated_at: now,
                    });
                }
            }
        }
        Ok(batch.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub input: usize,
    pub deduplicated: usize,
    pub batches: usize,
    pub affected: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("batch {batch} of {batches} failed with {committed} rows already committed: {source}")]
    Batch {
        batch: usize,
        batches: usize,
        committed: u64,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    /// Rows durably written by batches before the failing one.
    pub fn committed(&self) -> u64 {
        match self {
            Self::Batch { committed, .. } => *committed,
        }
    }
}

#[derive(Debug)]
pub struct BulkLoader<S> {
    store: S,
}

impl<S: UpsertStore> BulkLoader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub async fn upsert(
        &mut self,
        records: Vec<Record>,
        batch_size: Option<usize>,
    ) -> Result<u64, LoadError> {
        Ok(self.upsert_report(records, batch_size).await?.affected)
    }

    /// Deduplicate, then write. `batch_size: None` writes everything in one
    /// transaction; `Some(n)` commits every `n` records on their own.
    pub async fn upsert_report(
        &mut self,
        records: Vec<Record>,
        batch_size: Option<usize>,
    ) -> Result<LoadReport, LoadError> {
        let input = records.len();
        if input == 0 {
            warn!("no records to upsert");
            return Ok(LoadReport::default());
        }

        let records = dedupe(records);
        let deduplicated = records.len();
        info!(input, deduplicated, "deduplicated records");

        let batch_len = batch_size.map(|n| n.max(1)).unwrap_or(deduplicated);
        let batches = deduplicated.div_ceil(batch_len);
        let mut committed = 0u64;

        for (i, batch) in records.chunks(batch_len).enumerate() {
            let batch_no = i + 1;
            match self.store.upsert_batch(batch).await {
                Ok(affected) => {
                    committed += affected;
                    info!(
                        batch = batch_no,
                        batches,
                        affected,
                        total = committed,
                        "committed batch"
                    );
                }
                Err(source) => {
                    error!(
                        batch = batch_no,
                        batches,
                        committed,
                        error = %source,
                        "batch rolled back"
                    );
                    return Err(LoadError::Batch {
                        batch: batch_no,
                        batches,
                        committed,
                        source,
                    });
                }
            }
        }

        Ok(LoadReport {
            input,
            deduplicated,
            batches,
            affected: committed,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub batch_size: Option<usize>,
    pub keep_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Network,
    Cache,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub gas_day: GasDay,
    pub cycle: u8,
    pub source: PayloadSource,
    pub rows_read: usize,
    pub parsed: usize,
    pub rejected: usize,
    pub deduplicated: usize,
    pub persisted: u64,
}

impl KeyReport {
    fn absent(gas_day: GasDay, cycle: u8) -> Self {
        Self {
            gas_day,
            cycle,
            source: PayloadSource::Absent,
            rows_read: 0,
            parsed: 0,
            rejected: 0,
            deduplicated: 0,
            persisted: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keys_attempted: usize,
    pub keys_without_data: usize,
    pub fetched: usize,
    pub replayed_from_cache: usize,
    pub parsed: usize,
    pub rejected_rows: usize,
    pub deduplicated: usize,
    pub persisted: u64,
    pub failed_keys: usize,
}

impl SyncRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            keys_attempted: 0,
            keys_without_data: 0,
            fetched: 0,
            replayed_from_cache: 0,
            parsed: 0,
            rejected_rows: 0,
            deduplicated: 0,
            persisted: 0,
            failed_keys: 0,
        }
    }

    fn absorb(&mut self, report: &KeyReport) {
        match report.source {
            PayloadSource::Network => self.fetched += 1,
            PayloadSource::Cache => self.replayed_from_cache += 1,
            PayloadSource::Absent => self.keys_without_data += 1,
        }
        self.parsed += report.parsed;
        self.rejected_rows += report.rejected;
        self.deduplicated += report.deduplicated;
        self.persisted += report.persisted;
    }
}

pub struct SyncPipeline<T = ReqwestTransport, S = PgStore> {
    fetcher: ReportFetcher<T>,
    parser: RowParser,
    loader: BulkLoader<S>,
    options: PipelineOptions,
}

impl SyncPipeline<ReqwestTransport, PgStore> {
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let fetcher = ReportFetcher::from_config(
            config.fetcher_config(),
            ReportCache::new(config.cache_dir.clone()),
        )?;
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        Ok(Self::new(
            fetcher,
            BulkLoader::new(store),
            config.pipeline_options(),
        ))
    }
}

impl<T: Transport, S: UpsertStore> SyncPipeline<T, S> {
    pub fn new(fetcher: ReportFetcher<T>, loader: BulkLoader<S>, options: PipelineOptions) -> Self {
        Self {
            fetcher,
            parser: RowParser::new(),
            loader,
            options,
        }
    }

    pub fn fetcher(&self) -> &ReportFetcher<T> {
        &self.fetcher
    }

    pub fn loader(&self) -> &BulkLoader<S> {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut BulkLoader<S> {
        &mut self.loader
    }

    pub fn into_loader(self) -> BulkLoader<S> {
        self.loader
    }

    /// Fetch, parse, stamp and persist one `(gas day, cycle)` report.
    ///
    /// Missing data is an `Ok` report with `PayloadSource::Absent`; only a
    /// storage failure is an error. The cache entry is evicted once its
    /// records are persisted, unless `keep_cache` is set.
    pub async fn process_key(&mut self, gas_day: GasDay, cycle: u8) -> Result<KeyReport, LoadError> {
        let span = info_span!("sync_key", %gas_day, cycle);
        self.process_key_inner(gas_day, cycle).instrument(span).await
    }

    async fn process_key_inner(&mut self, gas_day: GasDay, cycle: u8) -> Result<KeyReport, LoadError> {
        let mut report = KeyReport::absent(gas_day, cycle);
        let outcome = self.fetcher.fetch(gas_day, cycle).await;
        report.source = match &outcome {
            FetchOutcome::Fetched(_) => PayloadSource::Network,
            FetchOutcome::Cached(_) => PayloadSource::Cache,
            _ => PayloadSource::Absent,
        };
        let Some(payload) = outcome.into_payload() else {
            warn!("no data available");
            return Ok(report);
        };

        let parsed = self.parser.parse_report(&payload.content);
        report.rows_read = parsed.rows_read;
        report.parsed = parsed.drafts.len();
        report.rejected = parsed.rejected.len();
        if parsed.drafts.is_empty() {
            warn!(rows = parsed.rows_read, "no valid records in report");
            return Ok(report);
        }

        let records: Vec<Record> = parsed
            .drafts
            .into_iter()
            .map(|draft| draft.stamp(gas_day, cycle))
            .collect();
        let load = self
            .loader
            .upsert_report(records, self.options.batch_size)
            .await?;
        report.deduplicated = load.deduplicated;
        report.persisted = load.affected;
        info!(
            parsed = report.parsed,
            deduplicated = report.deduplicated,
            persisted = report.persisted,
            "persisted report"
        );

        if !self.options.keep_cache {
            if let Err(err) = self.fetcher.cache().evict(&payload.key).await {
                warn!(error = ?err, "failed to evict cache entry");
            }
        }
        Ok(report)
    }

    /// Process every `gas_days x cycles` key in order. A storage failure on
    /// one key is logged and counted; the run moves on to the next key.
    pub async fn run_window(&mut self, gas_days: &[GasDay], cycles: &[u8]) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let mut summary = SyncRunSummary::new(run_id, Utc::now());
        info!(
            %run_id,
            gas_days = ?gas_days.iter().map(GasDay::iso).collect::<Vec<_>>(),
            ?cycles,
            "starting sync run"
        );

        for &gas_day in gas_days {
            for &cycle in cycles {
                summary.keys_attempted += 1;
                match self.process_key(gas_day, cycle).await {
                    Ok(report) => summary.absorb(&report),
                    Err(err) => {
                        summary.failed_keys += 1;
                        summary.persisted += err.committed();
                        error!(%run_id, %gas_day, cycle, error = %err, "storage failure, continuing with next key");
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            keys = summary.keys_attempted,
            without_data = summary.keys_without_data,
            fetched = summary.fetched,
            cached = summary.replayed_from_cache,
            parsed = summary.parsed,
            rejected = summary.rejected_rows,
            deduplicated = summary.deduplicated,
            persisted = summary.persisted,
            failed = summary.failed_keys,
            "sync run complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use oacap_storage::{CacheKey, TransportError, TransportResponse, Url};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn day(d: u32) -> GasDay {
        GasDay::new(NaiveDate::from_ymd_opt(2026, 10, d).unwrap())
    }

    fn record(loc: &str, cycle: u8, qty: i64) -> Record {
        Record {
            loc: loc.to_string(),
            loc_zone: Some("West".into()),
            loc_name: None,
            loc_purpose: None,
            measure_basis: None,
            oper_capacity: Some(Decimal::from(qty)),
            design_capacity: None,
            scheduled_qty: None,
            operationally_available: None,
            total_scheduled: None,
            gas_day: day(13),
            cycle,
        }
    }

    /// Fails the listed (1-based) `upsert_batch` calls before touching any row.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_calls: Vec<usize>,
        calls: usize,
    }

    #[async_trait]
    impl UpsertStore for FlakyStore {
        async fn upsert_batch(&mut self, batch: &[Record]) -> Result<u64, StoreError> {
            self.calls += 1;
            if self.fail_calls.contains(&self.calls) {
                return Err(StoreError::Message("connection dropped".into()));
            }
            self.inner.upsert_batch(batch).await
        }
    }

    /// Serves CSV for the cycles it knows and the "no data" page otherwise.
    #[derive(Clone, Default)]
    struct CycleTransport {
        csv_by_cycle: HashMap<u8, String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CycleTransport {
        async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let cycle: u8 = url
                .query_pairs()
                .find(|(k, _)| k == "cycle")
                .and_then(|(_, v)| v.parse().ok())
                .ok_or_else(|| TransportError::Message("missing cycle".into()))?;
            Ok(match self.csv_by_cycle.get(&cycle) {
                Some(body) => TransportResponse {
                    status: 200,
                    content_type: Some("text/csv".into()),
                    body: body.clone(),
                },
                None => TransportResponse {
                    status: 200,
                    content_type: Some("text/html".into()),
                    body: "<p>No data available</p>".into(),
                },
            })
        }
    }

    const REPORT: &str = "Loc,Loc Name,Oper Capacity\n\
        500001,Blanco Hub,\"1,000\"\n\
        500002,Gallup,200\n\
        ,Orphan,5\n\
        500001,Blanco Hub,\"1,100\"\n";

    fn pipeline<S: UpsertStore>(
        transport: CycleTransport,
        cache_root: &std::path::Path,
        store: S,
        options: PipelineOptions,
    ) -> SyncPipeline<CycleTransport, S> {
        let fetcher = ReportFetcher::new(
            transport,
            ReportCache::new(cache_root),
            FetcherConfig {
                base_url: "http://capacity.test/oa".into(),
                retry: RetryPolicy {
                    max_attempts: 1,
                    delay: Duration::ZERO,
                },
                ..Default::default()
            },
        );
        SyncPipeline::new(fetcher, BulkLoader::new(store), options)
    }

    #[test]
    fn dedupe_keeps_the_last_record_per_key() {
        let out = dedupe(vec![record("A", 1, 1), record("A", 1, 2)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].oper_capacity, Some(Decimal::from(2)));
    }

    #[test]
    fn dedupe_separates_keys_and_keeps_first_seen_positions() {
        let out = dedupe(vec![
            record("A", 1, 1),
            record("B", 1, 1),
            record("A", 2, 1),
            record("A", 1, 9),
        ]);
        let keys: Vec<_> = out.iter().map(|r| (r.loc.as_str(), r.cycle)).collect();
        assert_eq!(keys, vec![("A", 1), ("B", 1), ("A", 2)]);
        assert_eq!(out[0].oper_capacity, Some(Decimal::from(9)));
        assert!(dedupe(Vec::new()).is_empty());
    }

    #[test]
    fn window_ends_yesterday() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        assert_eq!(gas_day_window(today, 3), vec![day(13), day(12), day(11)]);
        assert!(gas_day_window(today, 0).is_empty());
    }

    #[test]
    fn database_url_assembles_from_parts() {
        assert_eq!(
            database_url_from_parts("db", "5433", "gas", "etl", "s3cret"),
            "postgres://etl:s3cret@db:5433/gas"
        );
    }

    #[tokio::test]
    async fn second_upsert_of_a_key_overwrites_non_key_columns() {
        let mut loader = BulkLoader::new(MemoryStore::new());
        loader.upsert(vec![record("A", 1, 1)], None).await.unwrap();
        let mut second = record("A", 1, 2);
        second.loc_zone = None;
        loader.upsert(vec![second], None).await.unwrap();

        let store = loader.store();
        assert_eq!(store.len(), 1);
        let row = store.get(&record("A", 1, 0).natural_key()).unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.record.oper_capacity, Some(Decimal::from(2)));
        assert_eq!(row.record.loc_zone, None);
        assert!(row.updated_at >= row.created_at);
    }

    #[tokio::test]
    async fn loader_deduplicates_before_writing() {
        let mut loader = BulkLoader::new(MemoryStore::new());
        let report = loader
            .upsert_report(
                vec![record("A", 1, 1), record("B", 1, 1), record("A", 1, 3)],
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.input, 3);
        assert_eq!(report.deduplicated, 2);
        assert_eq!(report.batches, 1);
        assert_eq!(report.affected, 2);
        assert_eq!(loader.upsert(Vec::new(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batched_mode_affects_every_deduplicated_record() {
        let records: Vec<_> = (0..5).map(|i| record(&format!("L{i}"), 1, 1)).collect();
        let mut loader = BulkLoader::new(FlakyStore::default());
        let report = loader.upsert_report(records, Some(2)).await.unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.affected, 5);
        assert_eq!(loader.store().calls, 3);
    }

    #[tokio::test]
    async fn failed_middle_batch_keeps_earlier_commit_and_stops() {
        let records: Vec<_> = (0..6).map(|i| record(&format!("L{i}"), 1, 1)).collect();
        let mut loader = BulkLoader::new(FlakyStore {
            fail_calls: vec![2],
            ..Default::default()
        });

        let err = loader.upsert(records, Some(2)).await.unwrap_err();

        match &err {
            LoadError::Batch {
                batch,
                batches,
                committed,
                ..
            } => {
                assert_eq!((*batch, *batches, *committed), (2, 3, 2));
            }
        }
        assert_eq!(err.committed(), 2);
        let store = loader.into_store();
        assert_eq!(store.calls, 2);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn single_transaction_mode_writes_one_batch() {
        let records: Vec<_> = (0..4).map(|i| record(&format!("L{i}"), 1, 1)).collect();
        let mut loader = BulkLoader::new(FlakyStore::default());
        assert_eq!(loader.upsert(records, None).await.unwrap(), 4);
        assert_eq!(loader.store().calls, 1);
    }

    #[tokio::test]
    async fn process_key_persists_and_evicts_cache() {
        let dir = tempdir().expect("tempdir");
        let transport = CycleTransport {
            csv_by_cycle: HashMap::from([(1, REPORT.to_string())]),
            ..Default::default()
        };
        let mut p = pipeline(transport, dir.path(), MemoryStore::new(), PipelineOptions::default());

        let report = p.process_key(day(13), 1).await.unwrap();

        assert_eq!(report.source, PayloadSource::Network);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.parsed, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.deduplicated, 2);
        assert_eq!(report.persisted, 2);
        let store = p.loader().store();
        let blanco = store.get(&record("500001", 1, 0).natural_key()).unwrap();
        assert_eq!(blanco.record.oper_capacity, Some(Decimal::from(1100)));
        assert!(!p
            .fetcher()
            .cache()
            .contains(&CacheKey::new(day(13), 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn keep_cache_replays_without_network() {
        let dir = tempdir().expect("tempdir");
        let transport = CycleTransport {
            csv_by_cycle: HashMap::from([(2, REPORT.to_string())]),
            ..Default::default()
        };
        let calls = transport.calls.clone();
        let mut p = pipeline(
            transport,
            dir.path(),
            MemoryStore::new(),
            PipelineOptions {
                batch_size: Some(1),
                keep_cache: true,
            },
        );

        let first = p.process_key(day(13), 2).await.unwrap();
        let second = p.process_key(day(13), 2).await.unwrap();

        assert_eq!(first.source, PayloadSource::Network);
        assert_eq!(second.source, PayloadSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.persisted, 2);
        assert_eq!(p.loader().store().len(), 2);
    }

    #[tokio::test]
    async fn run_window_counts_and_survives_storage_failure() {
        let dir = tempdir().expect("tempdir");
        let transport = CycleTransport {
            csv_by_cycle: HashMap::from([(1, REPORT.to_string()), (2, REPORT.to_string())]),
            ..Default::default()
        };
        let store = FlakyStore {
            fail_calls: vec![1],
            ..Default::default()
        };
        let mut p = pipeline(transport, dir.path(), store, PipelineOptions::default());

        let summary = p.run_window(&[day(13)], &[1, 2, 3]).await;

        assert_eq!(summary.keys_attempted, 3);
        assert_eq!(summary.failed_keys, 1);
        assert_eq!(summary.keys_without_data, 1);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.persisted, 2);
        let cache = p.fetcher().cache();
        assert!(cache.contains(&CacheKey::new(day(13), 1)).await.unwrap());
        assert!(!cache.contains(&CacheKey::new(day(13), 2)).await.unwrap());
    }
}
