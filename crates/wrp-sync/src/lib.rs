//! Pipeline orchestration: partition processing, staging, and promotion.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;
use wrp_core::{DedupKey, Entry, EntryType, RawRecord, Site};
use wrp_resolve::{clean_numeric, clean_site, clean_text, cluster_names, resolve, ClusterParams};
use wrp_storage::{
    LoadResult, RetryPolicy, RpcClientConfig, RpcSqlClient, SqlExecutor, SqlValue, StagedLoader,
    StagedRow, TableSpec, DEFAULT_BATCH_SIZE,
};

pub const CRATE_NAME: &str = "wrp-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub api_key: String,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub year_start: i32,
    pub year_end: i32,
    pub dump_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SUPABASE_URL")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            api_key: std::env::var("SUPABASE_KEY").unwrap_or_default(),
            batch_size: env_parse("WRP_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            retry: RetryPolicy {
                max_attempts: env_parse("WRP_MAX_RETRIES", 3),
                delay: Duration::from_secs(env_parse("WRP_RETRY_DELAY_SECS", 2)),
            },
            http_timeout_secs: env_parse("WRP_HTTP_TIMEOUT_SECS", 30),
            year_start: env_parse("WRP_YEAR_START", 2005),
            year_end: env_parse("WRP_YEAR_END", 2024),
            dump_dir: std::env::var("WRP_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./failed")),
            reports_dir: std::env::var("WRP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The weigh-off categories tracked by the pipeline, loaded from
/// `categories.yaml` at the workspace root.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    pub code: String,
    pub display_name: String,
    pub enabled: bool,
}

impl CategoryRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("categories.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.categories.iter().filter(|c| c.enabled)
    }
}

/// Upstream partition fetch. Empty or absent data is `None`, not an error.
#[async_trait]
pub trait RawSource: Send + Sync {
    async fn fetch_partition(&self, category: &str, year: i32) -> Result<Option<Vec<RawRecord>>>;
}

/// Raw partition tables are named `<category>_<year>` inside the
/// `raw_data` schema.
pub fn raw_table_name(category: &str, year: i32) -> String {
    format!("{}_{}", category.to_lowercase(), year)
}

struct RpcRawSource {
    client: Arc<RpcSqlClient>,
    retry: RetryPolicy,
}

#[async_trait]
impl RawSource for RpcRawSource {
    async fn fetch_partition(&self, category: &str, year: i32) -> Result<Option<Vec<RawRecord>>> {
        let table = raw_table_name(category, year);
        let params = json!({ "table_name": table });
        let value = self
            .retry
            .run("fetch partition", || {
                self.client.rpc("select_from_raw_data", &params)
            })
            .await
            .with_context(|| format!("fetching raw_data.{table}"))?;

        let rows = match value {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Null => return Ok(None),
            other => anyhow::bail!("unexpected payload for raw_data.{table}: {other}"),
        };
        if rows.is_empty() {
            return Ok(None);
        }
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(
                serde_json::from_value(row)
                    .with_context(|| format!("decoding raw_data.{table} row"))?,
            );
        }
        Ok(Some(records))
    }
}

pub static ENTRIES_STAGING: TableSpec = TableSpec {
    schema: "staging",
    table: "entries_staging",
    columns: &[
        "category",
        "year",
        "place",
        "weight_lbs",
        "processed_grower_name",
        "original_grower_name",
        "city",
        "state_prov",
        "country",
        "gpc_site",
        "seed_mother",
        "pollinator_father",
        "ott",
        "est_weight",
        "entry_type",
    ],
};

pub static SITES_STAGING: TableSpec = TableSpec {
    schema: "staging",
    table: "sites_staging",
    columns: &["year", "gpc_site", "city", "state_prov", "country"],
};

#[derive(Serialize)]
struct EntryRow<'a>(&'a Entry);

impl StagedRow for EntryRow<'_> {
    fn table() -> &'static TableSpec {
        &ENTRIES_STAGING
    }

    fn to_sql_row(&self) -> Vec<SqlValue> {
        let e = self.0;
        vec![
            SqlValue::Text(e.category.clone()),
            SqlValue::Int(e.year as i64),
            SqlValue::Text(e.place.clone()),
            SqlValue::opt_real(e.weight_lbs),
            SqlValue::Text(e.processed_grower_name.clone()),
            SqlValue::Text(e.original_grower_name.clone()),
            SqlValue::Text(e.city.clone()),
            SqlValue::Text(e.state_prov.clone()),
            SqlValue::Text(e.country.clone()),
            SqlValue::Text(e.gpc_site.clone()),
            SqlValue::Text(e.seed_mother.clone()),
            SqlValue::Text(e.pollinator_father.clone()),
            SqlValue::opt_real(e.ott),
            SqlValue::opt_real(e.est_weight),
            SqlValue::Text(e.entry_type.as_str().to_string()),
        ]
    }
}

#[derive(Serialize)]
struct SiteRow<'a>(&'a Site);

impl StagedRow for SiteRow<'_> {
    fn table() -> &'static TableSpec {
        &SITES_STAGING
    }

    fn to_sql_row(&self) -> Vec<SqlValue> {
        let s = self.0;
        vec![
            SqlValue::Int(s.year as i64),
            SqlValue::Text(s.gpc_site.clone()),
            SqlValue::Text(s.city.clone()),
            SqlValue::Text(s.state_prov.clone()),
            SqlValue::Text(s.country.clone()),
        ]
    }
}

/// Entries and sites produced from one partition, plus audit counts.
#[derive(Debug, Clone)]
pub struct PartitionBuild {
    pub entries: Vec<Entry>,
    pub sites: Vec<Site>,
    pub duplicates_discarded: usize,
}

/// Resolve names, cluster identities, classify, and deduplicate one
/// partition's raw rows.
///
/// Pure: names are snapshotted and clustered before any entry is built, so
/// the rewrite cannot race the reads. Duplicate dedup-keys are discarded
/// silently and only counted.
pub fn build_partition(
    category: &str,
    year: i32,
    records: &[RawRecord],
    params: ClusterParams,
) -> PartitionBuild {
    let observations: Vec<(String, String)> = records
        .iter()
        .map(|r| {
            (
                resolve(r.grower_name.as_deref().unwrap_or_default()).render(),
                clean_text(r.state_prov.as_deref()),
            )
        })
        .collect();
    let mapping = cluster_names(&observations, params);

    let mut seen: HashSet<DedupKey> = HashSet::new();
    let mut entries = Vec::new();
    let mut sites: BTreeSet<Site> = BTreeSet::new();
    let mut duplicates_discarded = 0usize;

    for (record, (canonical, _)) in records.iter().zip(observations.iter()) {
        let processed = mapping
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.clone());
        let place_raw = record.place.as_deref().unwrap_or_default().trim();
        let entry = Entry {
            category: category.to_string(),
            year,
            place: clean_text(record.place.as_deref()),
            weight_lbs: clean_numeric(record.weight_lbs.as_deref()),
            processed_grower_name: processed,
            original_grower_name: clean_text(record.grower_name.as_deref()),
            city: clean_text(record.city.as_deref()),
            state_prov: clean_text(record.state_prov.as_deref()),
            country: clean_text(record.country.as_deref()),
            gpc_site: clean_site(record.gpc_site.as_deref()),
            seed_mother: clean_text(record.seed_mother.as_deref()),
            pollinator_father: clean_text(record.pollinator_father.as_deref()),
            ott: clean_numeric(record.ott.as_deref()),
            est_weight: clean_numeric(record.est_weight.as_deref()),
            entry_type: EntryType::classify(place_raw),
        };
        if !seen.insert(entry.dedup_key()) {
            duplicates_discarded += 1;
            continue;
        }
        sites.insert(Site {
            year,
            gpc_site: entry.gpc_site.clone(),
            city: entry.city.clone(),
            state_prov: entry.state_prov.clone(),
            country: entry.country.clone(),
        });
        entries.push(entry);
    }

    PartitionBuild {
        entries,
        sites: sites.into_iter().collect(),
        duplicates_discarded,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionStatus {
    Loaded,
    Empty,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub category: String,
    pub year: i32,
    pub status: PartitionStatus,
    pub fetched: usize,
    pub staged_entries: usize,
    pub staged_sites: usize,
    pub duplicates_discarded: usize,
    pub entries: Option<LoadResult>,
    pub sites: Option<LoadResult>,
    pub error: Option<String>,
}

impl PartitionReport {
    fn empty(category: &str, year: i32, status: PartitionStatus) -> Self {
        Self {
            category: category.to_string(),
            year,
            status,
            fetched: 0,
            staged_entries: 0,
            staged_sites: 0,
            duplicates_discarded: 0,
            entries: None,
            sites: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions: Vec<PartitionReport>,
    pub committed_entries: usize,
    pub committed_sites: usize,
    pub failed_batches: usize,
    pub duplicates_discarded: usize,
    pub report_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionReport {
    pub entries_promoted: bool,
    pub sites_promoted: bool,
    pub errors: Vec<String>,
}

impl PromotionReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

const PROMOTE_ENTRIES_SQL: &str = "\
INSERT INTO core.entries (category, year, place, weight_lbs, grower_name, original_grower_name, city, state_prov, country, gpc_site, seed_mother, pollinator_father, ott, est_weight, entry_type)
SELECT category, year, place, weight_lbs, processed_grower_name, original_grower_name, city, state_prov, country, gpc_site, seed_mother, pollinator_father, ott, est_weight, entry_type
FROM staging.entries_staging;";

const PROMOTE_SITES_SQL: &str = "\
INSERT INTO core.sites (year, gpc_site, city, state_prov, country)
SELECT year, gpc_site, city, state_prov, country
FROM staging.sites_staging;";

pub struct SyncPipeline {
    config: SyncConfig,
    executor: Arc<dyn SqlExecutor>,
    source: Box<dyn RawSource>,
    loader: StagedLoader,
    cluster_params: ClusterParams,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        anyhow::ensure!(!config.api_key.is_empty(), "SUPABASE_KEY must be set");
        let client = Arc::new(RpcSqlClient::new(RpcClientConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?);
        let source = Box::new(RpcRawSource {
            client: client.clone(),
            retry: config.retry,
        });
        Ok(Self::with_collaborators(config, client, source))
    }

    /// Wire the pipeline onto explicit collaborators (tests, embedding).
    pub fn with_collaborators(
        config: SyncConfig,
        executor: Arc<dyn SqlExecutor>,
        source: Box<dyn RawSource>,
    ) -> Self {
        let loader = StagedLoader::new(config.batch_size, config.retry, config.dump_dir.clone());
        Self {
            config,
            executor,
            source,
            loader,
            cluster_params: ClusterParams::default(),
        }
    }

    /// Process every enabled category across the configured year range,
    /// strictly sequentially. A partition failure is recorded and skipped;
    /// the run itself only fails if the initial access probe does.
    pub async fn run_once(&self, registry: &CategoryRegistry) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting sync run");
        self.verify_access().await?;

        let mut partitions = Vec::new();
        for category in registry.enabled() {
            for year in self.config.year_start..=self.config.year_end {
                let report = match self.process_partition(&category.code, year).await {
                    Ok(report) => report,
                    Err(err) => {
                        error!(
                            category = %category.code,
                            year,
                            error = format!("{err:#}"),
                            "partition failed"
                        );
                        let mut report =
                            PartitionReport::empty(&category.code, year, PartitionStatus::Failed);
                        report.error = Some(format!("{err:#}"));
                        report
                    }
                };
                partitions.push(report);
            }
        }

        let finished_at = Utc::now();
        let committed_entries = partitions
            .iter()
            .filter_map(|p| p.entries.as_ref())
            .map(|r| r.committed)
            .sum();
        let committed_sites = partitions
            .iter()
            .filter_map(|p| p.sites.as_ref())
            .map(|r| r.committed)
            .sum();
        let failed_batches = partitions
            .iter()
            .flat_map(|p| [&p.entries, &p.sites])
            .filter_map(|r| r.as_ref())
            .map(|r| r.failed_batches.len())
            .sum();
        let duplicates_discarded = partitions.iter().map(|p| p.duplicates_discarded).sum();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            partitions,
            committed_entries,
            committed_sites,
            failed_batches,
            duplicates_discarded,
            report_file: None,
        };

        let report_path = self.config.reports_dir.join(format!(
            "sync_report_{}.json",
            started_at.format("%Y%m%d_%H%M%S")
        ));
        match self.write_report(&report_path, &summary).await {
            Ok(()) => summary.report_file = Some(report_path),
            Err(err) => warn!(error = format!("{err:#}"), "could not write run report"),
        }

        info!(
            %run_id,
            committed_entries = summary.committed_entries,
            committed_sites = summary.committed_sites,
            failed_batches = summary.failed_batches,
            duplicates_discarded = summary.duplicates_discarded,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn verify_access(&self) -> Result<()> {
        self.config
            .retry
            .run("verify access", || self.executor.execute("SELECT 1;"))
            .await
            .context("verifying database access")?;
        info!("database access verified");
        Ok(())
    }

    async fn process_partition(&self, category: &str, year: i32) -> Result<PartitionReport> {
        info!(category, year, "processing partition");
        let Some(records) = self.source.fetch_partition(category, year).await? else {
            info!(category, year, "no data for partition");
            return Ok(PartitionReport::empty(category, year, PartitionStatus::Empty));
        };

        let build = build_partition(category, year, &records, self.cluster_params);
        info!(
            category,
            year,
            fetched = records.len(),
            staged = build.entries.len(),
            duplicates = build.duplicates_discarded,
            sites = build.sites.len(),
            "partition built"
        );

        let load_started_at = Utc::now();
        let entry_rows: Vec<EntryRow<'_>> = build.entries.iter().map(EntryRow).collect();
        let entries_result = self
            .loader
            .insert(self.executor.as_ref(), &entry_rows, load_started_at)
            .await;
        let site_rows: Vec<SiteRow<'_>> = build.sites.iter().map(SiteRow).collect();
        let sites_result = self
            .loader
            .insert(self.executor.as_ref(), &site_rows, load_started_at)
            .await;

        Ok(PartitionReport {
            category: category.to_string(),
            year,
            status: PartitionStatus::Loaded,
            fetched: records.len(),
            staged_entries: build.entries.len(),
            staged_sites: build.sites.len(),
            duplicates_discarded: build.duplicates_discarded,
            entries: Some(entries_result),
            sites: Some(sites_result),
            error: None,
        })
    }

    /// One bulk copy of everything currently staged into the core store.
    ///
    /// Idempotent only because staging is truncated and rebuilt each run by
    /// the schema-management collaborator; promoting twice without a rebuild
    /// duplicates core rows.
    pub async fn promote(&self) -> PromotionReport {
        let mut report = PromotionReport {
            entries_promoted: false,
            sites_promoted: false,
            errors: Vec::new(),
        };

        match self
            .config
            .retry
            .run("promote entries", || self.executor.execute(PROMOTE_ENTRIES_SQL))
            .await
        {
            Ok(()) => {
                info!("promoted staged entries into core.entries");
                report.entries_promoted = true;
            }
            Err(err) => {
                error!(error = %err, "entry promotion failed");
                report.errors.push(format!("entries: {err}"));
            }
        }

        match self
            .config
            .retry
            .run("promote sites", || self.executor.execute(PROMOTE_SITES_SQL))
            .await
        {
            Ok(()) => {
                info!("promoted staged sites into core.sites");
                report.sites_promoted = true;
            }
            Err(err) => {
                error!(error = %err, "site promotion failed");
                report.errors.push(format!("sites: {err}"));
            }
        }

        report
    }

    async fn write_report(&self, path: &Path, summary: &SyncRunSummary) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.reports_dir)
            .await
            .with_context(|| format!("creating {}", self.config.reports_dir.display()))?;
        let body = serde_json::to_vec_pretty(summary).context("serializing run report")?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = CategoryRegistry::load(&config.workspace_root).await?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(&registry).await
}

pub async fn promote_from_env() -> Result<PromotionReport> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.promote().await)
}
