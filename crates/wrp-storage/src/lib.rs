//! RPC-backed SQL execution, statement rendering, and the batched staged loader.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "wrp-storage";

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("rpc request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc status {status}: {body}")]
    HttpStatus { status: u16, body: String },
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

impl ExecError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ExecError::Transport(err) => classify_reqwest_error(err),
            ExecError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Fixed-delay retry policy shared by the fetch and insert paths.
/// `max_attempts` counts total attempts, not additional retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. One attempt is in flight at a time.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < max_attempts && err.disposition() == RetryDisposition::Retryable {
                        warn!(label, attempt, error = %err, "transient failure, retrying");
                        tokio::time::sleep(self.delay).await;
                        attempt += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// The narrow statement-execution interface the pipeline writes through.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<(), ExecError>;
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// PostgREST-style RPC client. Single-attempt by design; callers wrap calls
/// in [`RetryPolicy::run`].
#[derive(Debug)]
pub struct RpcSqlClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RpcSqlClient {
    pub fn new(config: RpcClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    /// Call an RPC function with a JSON parameter object and return the
    /// response body (`Null` when the function returns nothing).
    pub async fn rpc(&self, function: &str, params: &Value) -> Result<Value, ExecError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl SqlExecutor for RpcSqlClient {
    async fn execute(&self, statement: &str) -> Result<(), ExecError> {
        self.rpc("execute_sql", &json!({ "query": statement }))
            .await
            .map(|_| ())
    }
}

/// Double embedded single quotes. This is the only string-safety contract
/// offered when rendering statement text; every value reaching a statement
/// goes through here.
pub fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn sql_string_literal(value: &str) -> String {
    format!("'{}'", sql_escape(value))
}

/// A value rendered into statement text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Real(f64),
    Int(i64),
    Null,
}

impl SqlValue {
    pub fn opt_real(value: Option<f64>) -> Self {
        value.map(SqlValue::Real).unwrap_or(SqlValue::Null)
    }

    pub fn render(&self) -> String {
        match self {
            SqlValue::Text(s) => sql_string_literal(s),
            SqlValue::Real(v) if v.is_finite() => v.to_string(),
            SqlValue::Real(_) => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Null => "NULL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub schema: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

impl TableSpec {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// One multi-row insert statement for a batch.
pub fn render_insert(spec: &TableSpec, rows: &[Vec<SqlValue>]) -> String {
    let values = rows
        .iter()
        .map(|row| {
            format!(
                "({})",
                row.iter().map(SqlValue::render).collect::<Vec<_>>().join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "INSERT INTO {} ({})\nVALUES {};",
        spec.qualified(),
        spec.columns.join(", "),
        values
    )
}

/// A row that can be staged through the batched loader.
pub trait StagedRow: Serialize {
    fn table() -> &'static TableSpec;
    fn to_sql_row(&self) -> Vec<SqlValue>;
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub batch_index: usize,
    pub rows: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub table: String,
    pub committed: usize,
    pub failed_rows: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub dump_file: Option<PathBuf>,
}

impl LoadResult {
    pub fn all_committed(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

/// Batched, retrying loader for staging tables.
#[derive(Debug, Clone)]
pub struct StagedLoader {
    batch_size: usize,
    retry: RetryPolicy,
    dump_dir: PathBuf,
}

impl StagedLoader {
    pub fn new(batch_size: usize, retry: RetryPolicy, dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
            dump_dir: dump_dir.into(),
        }
    }

    /// Insert `rows` in fixed-size batches. Failures never propagate: a
    /// batch that exhausts its retries is recorded in the result, its
    /// contents are dumped to the side channel keyed by table name and
    /// `started_at`, and the loader moves on to the next batch.
    pub async fn insert<R: StagedRow>(
        &self,
        executor: &dyn SqlExecutor,
        rows: &[R],
        started_at: DateTime<Utc>,
    ) -> LoadResult {
        let spec = R::table();
        let mut result = LoadResult {
            table: spec.qualified(),
            committed: 0,
            failed_rows: 0,
            failed_batches: Vec::new(),
            dump_file: None,
        };
        if rows.is_empty() {
            warn!(table = %result.table, "no records to insert");
            return result;
        }

        let mut dump_records: Vec<Value> = Vec::new();
        for (batch_index, batch) in rows.chunks(self.batch_size).enumerate() {
            let rendered: Vec<Vec<SqlValue>> = batch.iter().map(StagedRow::to_sql_row).collect();
            let statement = render_insert(spec, &rendered);
            match self
                .retry
                .run("batch insert", || executor.execute(&statement))
                .await
            {
                Ok(()) => {
                    result.committed += batch.len();
                    info!(
                        table = %result.table,
                        batch_index,
                        rows = batch.len(),
                        "committed batch"
                    );
                }
                Err(err) => {
                    error!(
                        table = %result.table,
                        batch_index,
                        rows = batch.len(),
                        error = %err,
                        "batch failed after retries"
                    );
                    result.failed_rows += batch.len();
                    result.failed_batches.push(FailedBatch {
                        batch_index,
                        rows: batch.len(),
                        error: err.to_string(),
                    });
                    for record in batch {
                        dump_records.push(json!({
                            "batch_index": batch_index,
                            "record": record,
                        }));
                    }
                }
            }
        }

        if !dump_records.is_empty() {
            result.dump_file = self
                .write_failed_dump(&result.table, started_at, &dump_records)
                .await;
        }
        result
    }

    // Best effort: a dump that cannot be written is logged and dropped.
    async fn write_failed_dump(
        &self,
        table: &str,
        started_at: DateTime<Utc>,
        records: &[Value],
    ) -> Option<PathBuf> {
        let name = format!(
            "failed_records_{}_{}.json",
            table.replace('.', "_"),
            started_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.dump_dir.join(name);
        let write = async {
            tokio::fs::create_dir_all(&self.dump_dir)
                .await
                .with_context(|| format!("creating {}", self.dump_dir.display()))?;
            let body = serde_json::to_vec_pretty(records).context("serializing failed records")?;
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            anyhow::Ok(())
        };
        match write.await {
            Ok(()) => {
                info!(path = %path.display(), "saved failed records");
                Some(path)
            }
            Err(err) => {
                error!(error = %err, path = %path.display(), "could not save failed records");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn escaping_doubles_embedded_quotes() {
        assert_eq!(sql_escape("O'Brien"), "O''Brien");
        assert_eq!(sql_string_literal("O'Brien"), "'O''Brien'");
        assert_eq!(sql_string_literal("plain"), "'plain'");
    }

    #[test]
    fn escaping_neutralizes_injection_style_inputs() {
        for hostile in [
            "x'; DROP TABLE growers; --",
            "''; DELETE FROM staging.entries_staging; ''",
            "Ünïcödé ' quote",
            "semi;colons;everywhere",
        ] {
            let literal = sql_string_literal(hostile);
            // Interior quotes all come in pairs, so the literal cannot be
            // terminated early: total quote count stays even.
            assert_eq!(literal.matches('\'').count() % 2, 0, "literal {literal}");
            let interior = &literal[1..literal.len() - 1];
            assert!(!interior.replace("''", "").contains('\''), "literal {literal}");
        }
    }

    #[test]
    fn sql_values_render_expected_literals() {
        assert_eq!(SqlValue::Text("a'b".into()).render(), "'a''b'");
        assert_eq!(SqlValue::Real(1234.5).render(), "1234.5");
        assert_eq!(SqlValue::Real(f64::NAN).render(), "NULL");
        assert_eq!(SqlValue::Int(2023).render(), "2023");
        assert_eq!(SqlValue::Null.render(), "NULL");
        assert_eq!(SqlValue::opt_real(None).render(), "NULL");
    }

    static TEST_TABLE: TableSpec = TableSpec {
        schema: "staging",
        table: "test_rows",
        columns: &["name", "weight"],
    };

    #[derive(Debug, Clone, Serialize)]
    struct TestRow {
        name: String,
        weight: Option<f64>,
    }

    impl StagedRow for TestRow {
        fn table() -> &'static TableSpec {
            &TEST_TABLE
        }

        fn to_sql_row(&self) -> Vec<SqlValue> {
            vec![
                SqlValue::Text(self.name.clone()),
                SqlValue::opt_real(self.weight),
            ]
        }
    }

    fn mk_rows(n: usize) -> Vec<TestRow> {
        (0..n)
            .map(|i| TestRow {
                name: format!("row-{i}"),
                weight: Some(i as f64),
            })
            .collect()
    }

    #[test]
    fn insert_statement_renders_all_rows() {
        let rows = mk_rows(2);
        let rendered: Vec<Vec<SqlValue>> = rows.iter().map(StagedRow::to_sql_row).collect();
        let statement = render_insert(&TEST_TABLE, &rendered);
        assert!(statement.starts_with("INSERT INTO staging.test_rows (name, weight)"));
        assert!(statement.contains("('row-0', 0)"));
        assert!(statement.contains("('row-1', 1)"));
        assert!(statement.ends_with(';'));
    }

    /// Fails the first `fail_first` calls with a retryable 503, then
    /// succeeds, recording every statement it sees.
    struct ScriptedExecutor {
        fail_first: usize,
        calls: AtomicUsize,
        statements: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
                statements: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedExecutor {
        async fn execute(&self, statement: &str) -> Result<(), ExecError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.statements.lock().unwrap().push(statement.to_string());
            if call < self.fail_first {
                return Err(ExecError::HttpStatus {
                    status: 503,
                    body: "connection terminated".into(),
                });
            }
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retry_runner_recovers_from_transient_failures() {
        let exec = ScriptedExecutor::new(1);
        let result = fast_retry()
            .run("test", || exec.execute("SELECT 1;"))
            .await;
        assert!(result.is_ok());
        assert_eq!(exec.calls(), 2);
    }

    #[tokio::test]
    async fn retry_runner_fails_fast_on_non_retryable_errors() {
        struct BadRequest;

        #[async_trait]
        impl SqlExecutor for BadRequest {
            async fn execute(&self, _statement: &str) -> Result<(), ExecError> {
                Err(ExecError::HttpStatus {
                    status: 400,
                    body: "syntax error".into(),
                })
            }
        }

        let calls = AtomicUsize::new(0);
        let exec = BadRequest;
        let result = fast_retry()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                exec.execute("SELECT 1;")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_splits_rows_into_batches() {
        let dir = tempdir().expect("tempdir");
        let loader = StagedLoader::new(2, fast_retry(), dir.path());
        let exec = ScriptedExecutor::new(0);
        let result = loader.insert(&exec, &mk_rows(5), Utc::now()).await;

        assert_eq!(result.committed, 5);
        assert!(result.all_committed());
        assert_eq!(exec.calls(), 3);
        let statements = exec.statements.lock().unwrap();
        assert_eq!(statements.len(), 3);
        assert!(statements[2].contains("('row-4', 4)"));
    }

    #[tokio::test]
    async fn exhausted_batch_is_reported_and_dumped() {
        let dir = tempdir().expect("tempdir");
        let loader = StagedLoader::new(500, fast_retry(), dir.path());
        let exec = ScriptedExecutor::new(usize::MAX);
        let result = loader.insert(&exec, &mk_rows(3), Utc::now()).await;

        assert_eq!(result.committed, 0);
        assert_eq!(result.failed_rows, 3);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].batch_index, 0);
        assert_eq!(exec.calls(), 3);

        let dump = result.dump_file.expect("dump file written");
        assert!(dump
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("failed_records_staging_test_rows_"));
        let body = std::fs::read_to_string(&dump).expect("read dump");
        let records: Vec<Value> = serde_json::from_str(&body).expect("parse dump");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["batch_index"], 0);
        assert_eq!(records[0]["record"]["name"], "row-0");
    }

    #[tokio::test]
    async fn second_attempt_success_commits_without_a_dump() {
        let dir = tempdir().expect("tempdir");
        let loader = StagedLoader::new(500, fast_retry(), dir.path());
        let exec = ScriptedExecutor::new(1);
        let result = loader.insert(&exec, &mk_rows(2), Utc::now()).await;

        assert_eq!(result.committed, 2);
        assert!(result.all_committed());
        assert!(result.dump_file.is_none());
        assert_eq!(exec.calls(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn partial_failure_does_not_abort_the_load() {
        // First batch exhausts its retries, second batch goes through.
        let dir = tempdir().expect("tempdir");
        let loader = StagedLoader::new(2, fast_retry(), dir.path());
        let exec = ScriptedExecutor::new(3);
        let result = loader.insert(&exec, &mk_rows(4), Utc::now()).await;

        assert_eq!(result.committed, 2);
        assert_eq!(result.failed_rows, 2);
        assert_eq!(result.failed_batches.len(), 1);
        assert!(result.dump_file.is_some());
    }
}
