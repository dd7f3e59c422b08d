//! Partition load orchestration: resolve the partition, read its document,
//! flatten and dedup it, then merge everything in one warehouse transaction.

mod executor;
mod memory;
mod plan;
mod postgres;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tdw_adapters::{decode_documents, CandidateSet, DecodeError};
use tdw_storage::{
    open_document_store, resolve_partition, ChainSecretProvider, DocumentStore, HttpClientConfig,
    PartitionError, PartitionLocator, SecretError, SecretProvider, StaticSecretProvider,
    StoreError, WarehouseSecret,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use executor::{
    apply_candidates, apply_in_transaction, ExecutorError, KeyRegistry, MergeTransaction,
    QueryExecutor, StepReport, WarehouseSession,
};
pub use memory::{MemoryExecutor, MemoryTable, MemoryTables};
pub use plan::{ForeignKey, MergePlan, PlanError, WAREHOUSE_FOREIGN_KEYS};
pub use postgres::{connect_options, merge_sql, PgExecutor};

pub const CRATE_NAME: &str = "tdw-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub stage_root: String,
    pub source_id: String,
    pub secret_name: String,
    pub secrets_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            stage_root: std::env::var("TDW_STAGE_ROOT").unwrap_or_else(|_| "./fixtures".to_string()),
            source_id: std::env::var("TDW_SOURCE_ID").unwrap_or_else(|_| "telekom".to_string()),
            secret_name: std::env::var("TDW_WAREHOUSE_SECRET_NAME")
                .unwrap_or_else(|_| "tdw/warehouse".to_string()),
            secrets_dir: std::env::var("TDW_SECRETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./secrets")),
            scheduler_enabled: std::env::var("TDW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("TDW_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("TDW_USER_AGENT")
                .unwrap_or_else(|_| "tdw-loader/0.1".to_string()),
            http_timeout_secs: std::env::var("TDW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// Trigger payload. Only `LOGICAL_DATE` is read; it must be a `YYYY-MM-DD` string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(rename = "LOGICAL_DATE", default, skip_serializing_if = "Option::is_none")]
    pub logical_date: Option<serde_json::Value>,
}

impl TriggerEvent {
    pub fn for_date(date: impl Into<String>) -> Self {
        Self {
            logical_date: Some(serde_json::Value::String(date.into())),
        }
    }

    fn logical_date(&self) -> Result<Option<&str>, PartitionError> {
        match &self.logical_date {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(PartitionError::MalformedDate(other.to_string())),
        }
    }
}

/// Advisory lock key for a partition: the first eight bytes of
/// SHA-256(`<source>/<date>`).
pub fn partition_lock_key(locator: &PartitionLocator) -> i64 {
    let digest = Sha256::digest(format!("{}/{}", locator.source_id, locator.date_string()));
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Input,
    Document,
    Credential,
    Connection,
    MergeExecution,
}

impl FailureStage {
    fn public_message(self) -> &'static str {
        match self {
            FailureStage::Input => "invalid trigger input",
            FailureStage::Document => "partition document could not be read",
            FailureStage::Credential => "warehouse credentials unavailable",
            FailureStage::Connection => "warehouse connection failed",
            FailureStage::MergeExecution => "merge failed; no changes were committed",
        }
    }
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Input(#[from] PartitionError),
    #[error("partition document unavailable: {0}")]
    DocumentUnavailable(#[from] StoreError),
    #[error("partition document undecodable: {0}")]
    DocumentUndecodable(#[from] DecodeError),
    #[error("credential retrieval failed: {0}")]
    Credential(#[from] SecretError),
    #[error("warehouse connection failed: {0}")]
    Connection(#[source] ExecutorError),
    #[error("merge rolled back: {0}")]
    MergeExecution(#[source] ExecutorError),
}

impl InvocationError {
    pub fn stage(&self) -> FailureStage {
        match self {
            InvocationError::Input(_) => FailureStage::Input,
            InvocationError::DocumentUnavailable(_) | InvocationError::DocumentUndecodable(_) => {
                FailureStage::Document
            }
            InvocationError::Credential(_) => FailureStage::Credential,
            InvocationError::Connection(_) => FailureStage::Connection,
            InvocationError::MergeExecution(_) => FailureStage::MergeExecution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub partition: NaiveDate,
    pub document_key: String,
    pub document_hash: String,
    pub records: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
}

impl LoadSummary {
    pub fn inserted(&self) -> usize {
        self.steps.iter().map(|step| step.inserted).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFailure {
    pub run_id: Uuid,
    pub stage: FailureStage,
    /// Client-safe description; internals only go to the log.
    pub message: String,
}

/// Structured outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Succeeded(LoadSummary),
    Failed(LoadFailure),
}

impl InvocationResult {
    /// Input failure for a trigger whose payload could not be read at all.
    pub fn rejected_trigger(message: impl Into<String>) -> Self {
        let run_id = Uuid::new_v4();
        let message = message.into();
        warn!(%run_id, %message, "load trigger rejected");
        InvocationResult::Failed(LoadFailure {
            run_id,
            stage: FailureStage::Input,
            message,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Succeeded(_))
    }

    /// 400 for caller mistakes, 500 for everything else that went wrong.
    pub fn http_status(&self) -> u16 {
        match self {
            InvocationResult::Succeeded(_) => 200,
            InvocationResult::Failed(LoadFailure {
                stage: FailureStage::Input,
                ..
            }) => 400,
            InvocationResult::Failed(_) => 500,
        }
    }
}

pub struct LoadPipeline {
    source_id: String,
    secret_name: String,
    store: Box<dyn DocumentStore>,
    secrets: Box<dyn SecretProvider>,
    executor: Box<dyn QueryExecutor>,
    plan: MergePlan,
}

impl LoadPipeline {
    pub fn new(
        source_id: impl Into<String>,
        secret_name: impl Into<String>,
        store: Box<dyn DocumentStore>,
        secrets: Box<dyn SecretProvider>,
        executor: Box<dyn QueryExecutor>,
    ) -> Result<Self, PlanError> {
        Ok(Self {
            source_id: source_id.into(),
            secret_name: secret_name.into(),
            store,
            secrets,
            executor,
            plan: MergePlan::warehouse()?,
        })
    }

    /// Stage from `TDW_STAGE_ROOT`, secrets from env then `TDW_SECRETS_DIR`, Postgres warehouse.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = open_document_store(&config.stage_root, config.http_client_config())
            .with_context(|| format!("opening stage {}", config.stage_root))?;
        let secrets = ChainSecretProvider::env_then_dir(config.secrets_dir.clone());
        Ok(Self::new(
            config.source_id.clone(),
            config.secret_name.clone(),
            store,
            Box::new(secrets),
            Box::new(PgExecutor),
        )?)
    }

    /// Same stage, but merged into a throwaway in-memory warehouse.
    pub fn dry_run(config: &SyncConfig) -> Result<Self> {
        let store = open_document_store(&config.stage_root, config.http_client_config())
            .with_context(|| format!("opening stage {}", config.stage_root))?;
        let secret = WarehouseSecret {
            host: "memory".to_string(),
            port: 0,
            username: "dry-run".to_string(),
            password: String::new(),
            database: "dry-run".to_string(),
            schema: None,
        };
        Ok(Self::new(
            config.source_id.clone(),
            config.secret_name.clone(),
            store,
            Box::new(StaticSecretProvider(secret)),
            Box::new(MemoryExecutor::new()),
        )?)
    }

    /// Replace the merge plan after checking it against its foreign keys.
    pub fn with_plan(mut self, plan: MergePlan) -> Result<Self, PlanError> {
        plan.validate()?;
        self.plan = plan;
        Ok(self)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn plan(&self) -> &MergePlan {
        &self.plan
    }

    pub async fn handle_event(&self, event: &TriggerEvent) -> InvocationResult {
        match event.logical_date() {
            Ok(date) => self.run_partition(date).await,
            Err(err) => self.fail(Uuid::new_v4(), InvocationError::Input(err)),
        }
    }

    pub async fn run_partition(&self, logical_date: Option<&str>) -> InvocationResult {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "load_partition",
            %run_id,
            source = %self.source_id,
            partition = logical_date.unwrap_or("")
        );
        match self.try_run(run_id, logical_date).instrument(span.clone()).await {
            Ok(summary) => {
                span.in_scope(|| {
                    info!(inserted = summary.inserted(), "partition load committed");
                });
                InvocationResult::Succeeded(summary)
            }
            Err(err) => span.in_scope(|| self.fail(run_id, err)),
        }
    }

    fn fail(&self, run_id: Uuid, err: InvocationError) -> InvocationResult {
        let stage = err.stage();
        error!(?stage, error = %err, "partition load failed");
        let message = match &err {
            InvocationError::Input(input) => input.to_string(),
            _ => stage.public_message().to_string(),
        };
        InvocationResult::Failed(LoadFailure {
            run_id,
            stage,
            message,
        })
    }

    async fn try_run(
        &self,
        run_id: Uuid,
        logical_date: Option<&str>,
    ) -> Result<LoadSummary, InvocationError> {
        let started_at = Utc::now();
        let locator = resolve_partition(logical_date, &self.source_id)?;
        info!(key = %locator.key, stage = %self.store.describe(), "partition resolved");

        let document = self.store.fetch(&locator.key).await?;
        let records = decode_documents(&document.bytes)?;
        let candidates = CandidateSet::from_documents(&records, locator.date);
        info!(
            records = records.len(),
            hash = %document.content_hash,
            candidates = ?candidates.counts(),
            "partition document flattened"
        );

        let secret = self.secrets.fetch_secret(&self.secret_name).await?;
        let mut session = self
            .executor
            .connect(&secret)
            .await
            .map_err(InvocationError::Connection)?;

        let applied = apply_in_transaction(
            session.as_mut(),
            partition_lock_key(&locator),
            &self.plan,
            &candidates,
        )
        .await;

        if let Err(err) = session.close().await {
            warn!(error = %err, "warehouse session teardown failed");
        }
        let steps = applied.map_err(InvocationError::MergeExecution)?;

        Ok(LoadSummary {
            run_id,
            source_id: self.source_id.clone(),
            partition: locator.date,
            document_key: locator.key,
            document_hash: document.content_hash,
            records: records.len(),
            started_at,
            finished_at: Utc::now(),
            steps,
        })
    }
}

/// Scheduled runs load the partition for the day before the tick.
pub fn previous_partition_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive().pred_opt().unwrap_or(NaiveDate::MIN)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<LoadPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let date = previous_partition_date(Utc::now()).format("%Y-%m-%d").to_string();
            let result = pipeline.run_partition(Some(&date)).await;
            if !result.is_success() {
                warn!(partition = %date, "scheduled partition load did not succeed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_load_from_env(logical_date: &str, dry_run: bool) -> Result<InvocationResult> {
    let config = SyncConfig::from_env();
    let pipeline = if dry_run {
        LoadPipeline::dry_run(&config)?
    } else {
        LoadPipeline::from_config(&config)?
    };
    Ok(pipeline.run_partition(Some(logical_date)).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_reads_logical_date_string() {
        let event: TriggerEvent =
            serde_json::from_str(r#"{"LOGICAL_DATE":"2025-02-05","other":1}"#).unwrap();
        assert_eq!(event.logical_date().unwrap(), Some("2025-02-05"));
    }

    #[test]
    fn event_without_or_with_null_date_is_missing() {
        let empty: TriggerEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.logical_date().unwrap(), None);
        let null: TriggerEvent = serde_json::from_str(r#"{"LOGICAL_DATE":null}"#).unwrap();
        assert_eq!(null.logical_date().unwrap(), None);
    }

    #[test]
    fn non_string_date_is_malformed() {
        let event: TriggerEvent = serde_json::from_str(r#"{"LOGICAL_DATE":20250205}"#).unwrap();
        assert_eq!(
            event.logical_date(),
            Err(PartitionError::MalformedDate("20250205".into()))
        );
    }

    #[test]
    fn lock_key_is_stable_per_partition() {
        let a = resolve_partition(Some("2025-02-05"), "telekom").unwrap();
        let b = resolve_partition(Some("2025-2-5"), "telekom").unwrap();
        let c = resolve_partition(Some("2025-02-06"), "telekom").unwrap();
        assert_eq!(partition_lock_key(&a), partition_lock_key(&b));
        assert_ne!(partition_lock_key(&a), partition_lock_key(&c));
    }

    #[test]
    fn http_status_follows_failure_stage() {
        let failed = |stage| {
            InvocationResult::Failed(LoadFailure {
                run_id: Uuid::nil(),
                stage,
                message: String::new(),
            })
        };
        assert_eq!(failed(FailureStage::Input).http_status(), 400);
        assert_eq!(failed(FailureStage::Document).http_status(), 500);
        assert_eq!(failed(FailureStage::MergeExecution).http_status(), 500);
    }

    #[test]
    fn scheduled_partition_is_yesterday() {
        let now = DateTime::parse_from_rfc3339("2025-03-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            previous_partition_date(now),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
    }

    #[test]
    fn result_serializes_with_status_tag() {
        let result = InvocationResult::Failed(LoadFailure {
            run_id: Uuid::nil(),
            stage: FailureStage::Credential,
            message: "warehouse credentials unavailable".into(),
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "credential");
    }
}
