//! Warehouse execution seam and the transactional applier that drives it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tdw_adapters::CandidateSet;
use tdw_core::{
    AddressRow, BonusCandidate, BonusKey, BonusRecord, EntityKind, MergeOutcome, MergeRecord,
    OfferCandidate, OfferRecord, SurrogateId, TariffBonusLinkCandidate, TariffBonusLinkRecord,
    TariffCandidate, TariffRecord,
};
use tdw_storage::WarehouseSecret;
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::MergePlan;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("could not connect to the warehouse: {0}")]
    Connect(String),
    #[error("merge of {entity} failed: {message}")]
    Statement { entity: EntityKind, message: String },
    #[error("transaction control failed: {0}")]
    Transaction(String),
    #[error("session teardown failed: {0}")]
    Teardown(String),
}

/// Opens warehouse sessions from resolved credentials.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn connect(&self, secret: &WarehouseSecret)
        -> Result<Box<dyn WarehouseSession>, ExecutorError>;
}

/// One open warehouse connection. `close` is always called, whatever the
/// outcome of the transaction.
#[async_trait]
pub trait WarehouseSession: Send {
    async fn begin<'s>(&'s mut self) -> Result<Box<dyn MergeTransaction + 's>, ExecutorError>;
    async fn close(self: Box<Self>) -> Result<(), ExecutorError>;
}

/// Statements issued inside the single load transaction.
#[async_trait]
pub trait MergeTransaction: Send {
    /// Take the transaction-scoped lock that serializes loads of one partition.
    async fn lock_partition(&mut self, lock_key: i64) -> Result<(), ExecutorError>;
    /// Insert `record` unless a row with the same natural key exists.
    async fn merge(&mut self, record: &MergeRecord) -> Result<MergeOutcome, ExecutorError>;
    /// Look up an already stored bonus by natural key without inserting.
    async fn find_bonus(&mut self, key: &BonusKey) -> Result<Option<SurrogateId>, ExecutorError>;
    async fn commit(self: Box<Self>) -> Result<(), ExecutorError>;
    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError>;
}

/// Per-entity tally of one applied step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub entity: EntityKind,
    pub considered: usize,
    pub inserted: usize,
    /// Candidates skipped because a referenced row could not be resolved.
    pub unresolved: usize,
}

impl StepReport {
    fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            considered: 0,
            inserted: 0,
            unresolved: 0,
        }
    }
}

/// Surrogate keys learned so far in the running transaction, by natural key.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    addresses: BTreeMap<AddressRow, SurrogateId>,
    providers: BTreeMap<String, SurrogateId>,
    connectivity_types: BTreeMap<String, SurrogateId>,
    tariffs: BTreeMap<TariffCandidate, SurrogateId>,
    bonus_durations: BTreeMap<i32, SurrogateId>,
    bonuses: BTreeMap<BonusKey, SurrogateId>,
}

impl KeyRegistry {
    pub fn tariff_record(&self, candidate: &TariffCandidate) -> Option<MergeRecord> {
        Some(MergeRecord::Tariff(TariffRecord {
            provider_id: *self.providers.get(&candidate.provider_name)?,
            connectivity_id: *self.connectivity_types.get(&candidate.connectivity_name)?,
            tariff_name: candidate.tariff_name.clone(),
            terms: candidate.terms.clone(),
        }))
    }

    pub fn bonus_record(&self, candidate: &BonusCandidate) -> Option<MergeRecord> {
        Some(MergeRecord::Bonus(BonusRecord {
            bonus_name: candidate.bonus_name.clone(),
            bonus_value: candidate.bonus_value,
            bonus_duration_id: *self.bonus_durations.get(&candidate.bonus_duration)?,
        }))
    }

    pub fn link_record(&self, candidate: &TariffBonusLinkCandidate) -> Option<MergeRecord> {
        Some(MergeRecord::TariffBonusLink(TariffBonusLinkRecord {
            tariff_id: *self.tariffs.get(&candidate.tariff)?,
            bonus_id: *self.bonuses.get(&candidate.bonus)?,
        }))
    }

    pub fn offer_record(&self, candidate: &OfferCandidate) -> Option<MergeRecord> {
        Some(MergeRecord::Offer(OfferRecord {
            address_id: *self.addresses.get(&candidate.address)?,
            tariff_id: *self.tariffs.get(&candidate.tariff)?,
            date_collected: candidate.date_collected,
        }))
    }
}

/// A link's bonus not merged in this run resolves against stored bonuses by natural key.
async fn resolve_link_bonus(
    tx: &mut dyn MergeTransaction,
    keys: &mut KeyRegistry,
    missing: &mut BTreeSet<BonusKey>,
    bonus: &BonusKey,
) -> Result<(), ExecutorError> {
    if keys.bonuses.contains_key(bonus) || missing.contains(bonus) {
        return Ok(());
    }
    match tx.find_bonus(bonus).await? {
        Some(id) => {
            keys.bonuses.insert(bonus.clone(), id);
        }
        None => {
            missing.insert(bonus.clone());
        }
    }
    Ok(())
}

async fn merge_step(
    tx: &mut dyn MergeTransaction,
    report: &mut StepReport,
    record: Option<MergeRecord>,
) -> Result<Option<SurrogateId>, ExecutorError> {
    report.considered += 1;
    let Some(record) = record else {
        report.unresolved += 1;
        return Ok(None);
    };
    let outcome = tx.merge(&record).await?;
    if outcome.inserted {
        report.inserted += 1;
    }
    Ok(Some(outcome.id))
}

/// Run every step of `plan` against `tx`, threading surrogate keys from
/// parent steps into their children. Any statement failure aborts the whole
/// apply; the caller owns commit and rollback.
pub async fn apply_candidates(
    tx: &mut dyn MergeTransaction,
    plan: &MergePlan,
    candidates: &CandidateSet,
) -> Result<Vec<StepReport>, ExecutorError> {
    let mut keys = KeyRegistry::default();
    let mut reports = Vec::with_capacity(plan.steps().len());

    for &entity in plan.steps() {
        let mut report = StepReport::new(entity);
        match entity {
            EntityKind::Address => {
                for row in &candidates.addresses {
                    let record = Some(MergeRecord::Address(row.clone()));
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.addresses.insert(row.clone(), id);
                    }
                }
            }
            EntityKind::Provider => {
                for row in &candidates.providers {
                    let record = Some(MergeRecord::Provider(row.clone()));
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.providers.insert(row.provider_name.clone(), id);
                    }
                }
            }
            EntityKind::ConnectivityType => {
                for row in &candidates.connectivity_types {
                    let record = Some(MergeRecord::ConnectivityType(row.clone()));
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.connectivity_types.insert(row.connectivity_name.clone(), id);
                    }
                }
            }
            EntityKind::Tariff => {
                for candidate in &candidates.tariffs {
                    let record = keys.tariff_record(candidate);
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.tariffs.insert(candidate.clone(), id);
                    }
                }
            }
            EntityKind::BonusDuration => {
                for row in &candidates.bonus_durations {
                    let record = Some(MergeRecord::BonusDuration(row.clone()));
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.bonus_durations.insert(row.bonus_duration, id);
                    }
                }
            }
            EntityKind::Bonus => {
                for candidate in &candidates.bonuses {
                    let record = keys.bonus_record(candidate);
                    if let Some(id) = merge_step(tx, &mut report, record).await? {
                        keys.bonuses.insert(candidate.key(), id);
                    }
                }
            }
            EntityKind::TariffBonusLink => {
                let mut missing = BTreeSet::new();
                for candidate in &candidates.tariff_bonus_links {
                    resolve_link_bonus(tx, &mut keys, &mut missing, &candidate.bonus).await?;
                    let record = keys.link_record(candidate);
                    merge_step(tx, &mut report, record).await?;
                }
            }
            EntityKind::Offer => {
                for candidate in &candidates.offers {
                    let record = keys.offer_record(candidate);
                    merge_step(tx, &mut report, record).await?;
                }
            }
        }

        if report.unresolved > 0 {
            debug!(
                entity = %entity,
                unresolved = report.unresolved,
                "skipped candidates with unresolved references"
            );
        }
        info!(
            entity = %entity,
            considered = report.considered,
            inserted = report.inserted,
            "merge step applied"
        );
        reports.push(report);
    }

    Ok(reports)
}

/// Begin a transaction on `session`, lock the partition, apply the plan and
/// commit. On any failure the transaction is rolled back and the first error
/// is returned.
pub async fn apply_in_transaction(
    session: &mut dyn WarehouseSession,
    lock_key: i64,
    plan: &MergePlan,
    candidates: &CandidateSet,
) -> Result<Vec<StepReport>, ExecutorError> {
    let mut tx = session.begin().await?;
    let applied = match tx.lock_partition(lock_key).await {
        Ok(()) => apply_candidates(tx.as_mut(), plan, candidates).await,
        Err(err) => Err(err),
    };
    match applied {
        Ok(reports) => {
            tx.commit().await?;
            Ok(reports)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
