//! In-process warehouse used for dry runs and tests.
//!
//! Each transaction works on a copy of the committed tables and swaps it in
//! on commit, so a failed or rolled-back load leaves nothing behind.
//! Transactions on one executor are serialized from `begin` until commit or
//! rollback. That already covers what the partition lock guarantees in
//! Postgres, so `lock_partition` has nothing left to do.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tdw_core::{
    AddressRow, BonusDurationRow, BonusKey, BonusRecord, ConnectivityTypeRow, EntityKind, MergeOutcome,
    MergeRecord, OfferRecord, ProviderRow, SurrogateId, TariffBonusLinkRecord, TariffRecord,
};
use tdw_storage::WarehouseSecret;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::executor::{ExecutorError, MergeTransaction, QueryExecutor, WarehouseSession};

#[derive(Debug, Clone, Serialize)]
pub struct MemoryTable<R> {
    rows: Vec<(SurrogateId, R)>,
}

impl<R> Default for MemoryTable<R> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<R: Clone> MemoryTable<R> {
    fn insert_if_absent(&mut self, record: &R, same_key: impl Fn(&R, &R) -> bool) -> MergeOutcome {
        if let Some((id, _)) = self.rows.iter().find(|(_, existing)| same_key(existing, record)) {
            return MergeOutcome {
                id: *id,
                inserted: false,
            };
        }
        let id = self.rows.len() as SurrogateId + 1;
        self.rows.push((id, record.clone()));
        MergeOutcome { id, inserted: true }
    }

    pub fn rows(&self) -> &[(SurrogateId, R)] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: SurrogateId) -> Option<&R> {
        self.rows.iter().find(|(row_id, _)| *row_id == id).map(|(_, row)| row)
    }

    fn contains(&self, id: SurrogateId) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryTables {
    pub addresses: MemoryTable<AddressRow>,
    pub providers: MemoryTable<ProviderRow>,
    pub connectivity_types: MemoryTable<ConnectivityTypeRow>,
    pub tariffs: MemoryTable<TariffRecord>,
    pub bonus_durations: MemoryTable<BonusDurationRow>,
    pub bonuses: MemoryTable<BonusRecord>,
    pub tariff_bonus_links: MemoryTable<TariffBonusLinkRecord>,
    pub offers: MemoryTable<OfferRecord>,
}

impl MemoryTables {
    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Address => self.addresses.len(),
            EntityKind::Provider => self.providers.len(),
            EntityKind::ConnectivityType => self.connectivity_types.len(),
            EntityKind::Tariff => self.tariffs.len(),
            EntityKind::BonusDuration => self.bonus_durations.len(),
            EntityKind::Bonus => self.bonuses.len(),
            EntityKind::TariffBonusLink => self.tariff_bonus_links.len(),
            EntityKind::Offer => self.offers.len(),
        }
    }

    pub fn row_counts(&self) -> BTreeMap<EntityKind, usize> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, self.len_of(kind)))
            .collect()
    }

    pub fn find_bonus(&self, key: &BonusKey) -> Option<SurrogateId> {
        self.bonuses
            .rows()
            .iter()
            .find(|(_, row)| row.bonus_name == key.bonus_name && row.bonus_value == key.bonus_value)
            .map(|(id, _)| *id)
    }

    fn merge(&mut self, record: &MergeRecord) -> Result<MergeOutcome, ExecutorError> {
        let dangling = |what: &str, id: SurrogateId| ExecutorError::Statement {
            entity: record.kind(),
            message: format!("foreign key violation: no {what} with id {id}"),
        };

        let outcome = match record {
            MergeRecord::Address(row) => self.addresses.insert_if_absent(row, |a, b| a == b),
            MergeRecord::Provider(row) => self
                .providers
                .insert_if_absent(row, |a, b| a.provider_name == b.provider_name),
            MergeRecord::ConnectivityType(row) => self
                .connectivity_types
                .insert_if_absent(row, |a, b| a.connectivity_name == b.connectivity_name),
            MergeRecord::Tariff(row) => {
                if !self.providers.contains(row.provider_id) {
                    return Err(dangling("provider", row.provider_id));
                }
                if !self.connectivity_types.contains(row.connectivity_id) {
                    return Err(dangling("connectivity type", row.connectivity_id));
                }
                self.tariffs.insert_if_absent(row, |a, b| a == b)
            }
            MergeRecord::BonusDuration(row) => self
                .bonus_durations
                .insert_if_absent(row, |a, b| a.bonus_duration == b.bonus_duration),
            MergeRecord::Bonus(row) => {
                if !self.bonus_durations.contains(row.bonus_duration_id) {
                    return Err(dangling("bonus duration", row.bonus_duration_id));
                }
                self.bonuses.insert_if_absent(row, |a, b| {
                    a.bonus_name == b.bonus_name && a.bonus_value == b.bonus_value
                })
            }
            MergeRecord::TariffBonusLink(row) => {
                if !self.tariffs.contains(row.tariff_id) {
                    return Err(dangling("tariff", row.tariff_id));
                }
                if !self.bonuses.contains(row.bonus_id) {
                    return Err(dangling("bonus", row.bonus_id));
                }
                self.tariff_bonus_links.insert_if_absent(row, |a, b| a == b)
            }
            MergeRecord::Offer(row) => {
                if !self.addresses.contains(row.address_id) {
                    return Err(dangling("address", row.address_id));
                }
                if !self.tariffs.contains(row.tariff_id) {
                    return Err(dangling("tariff", row.tariff_id));
                }
                self.offers.insert_if_absent(row, |a, b| a == b)
            }
        };
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    connect: bool,
    close: bool,
    merge: Option<EntityKind>,
}

/// Executor backed by shared in-memory tables. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    tables: Arc<Mutex<MemoryTables>>,
    writer: Arc<Mutex<()>>,
    faults: Faults,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt.
    pub fn failing_connect(mut self) -> Self {
        self.faults.connect = true;
        self
    }

    /// Report an error when the session is closed.
    pub fn failing_close(mut self) -> Self {
        self.faults.close = true;
        self
    }

    /// Fail every merge of `kind`.
    pub fn failing_on(mut self, kind: EntityKind) -> Self {
        self.faults.merge = Some(kind);
        self
    }

    /// Committed state.
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn connect(
        &self,
        secret: &WarehouseSecret,
    ) -> Result<Box<dyn WarehouseSession>, ExecutorError> {
        if self.faults.connect {
            return Err(ExecutorError::Connect(format!(
                "{}:{} refused the connection",
                secret.host, secret.port
            )));
        }
        Ok(Box::new(MemorySession {
            tables: Arc::clone(&self.tables),
            writer: Arc::clone(&self.writer),
            faults: self.faults,
        }))
    }
}

struct MemorySession {
    tables: Arc<Mutex<MemoryTables>>,
    writer: Arc<Mutex<()>>,
    faults: Faults,
}

#[async_trait]
impl WarehouseSession for MemorySession {
    async fn begin<'s>(&'s mut self) -> Result<Box<dyn MergeTransaction + 's>, ExecutorError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let working = self.tables.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            working,
            tables: Arc::clone(&self.tables),
            fail_on: self.faults.merge,
            _writer: writer,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), ExecutorError> {
        if self.faults.close {
            return Err(ExecutorError::Teardown("connection reset during close".into()));
        }
        Ok(())
    }
}

struct MemoryTransaction {
    working: MemoryTables,
    tables: Arc<Mutex<MemoryTables>>,
    fail_on: Option<EntityKind>,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl MergeTransaction for MemoryTransaction {
    async fn lock_partition(&mut self, _lock_key: i64) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn merge(&mut self, record: &MergeRecord) -> Result<MergeOutcome, ExecutorError> {
        if self.fail_on == Some(record.kind()) {
            return Err(ExecutorError::Statement {
                entity: record.kind(),
                message: "injected failure".into(),
            });
        }
        self.working.merge(record)
    }

    async fn find_bonus(&mut self, key: &BonusKey) -> Result<Option<SurrogateId>, ExecutorError> {
        Ok(self.working.find_bonus(key))
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecutorError> {
        let this = *self;
        *this.tables.lock().await = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdw_core::TariffTerms;

    fn secret() -> WarehouseSecret {
        WarehouseSecret {
            host: "memory".into(),
            port: 5432,
            username: "tdw".into(),
            password: "pw".into(),
            database: "dds".into(),
            schema: None,
        }
    }

    #[tokio::test]
    async fn rollback_discards_and_commit_publishes() {
        let executor = MemoryExecutor::new();
        let mut session = executor.connect(&secret()).await.unwrap();

        let mut tx = session.begin().await.unwrap();
        tx.merge(&MergeRecord::ConnectivityType(ConnectivityTypeRow {
            connectivity_name: "dsl".into(),
        }))
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert!(executor.snapshot().await.connectivity_types.is_empty());

        let mut tx = session.begin().await.unwrap();
        let first = tx
            .merge(&MergeRecord::ConnectivityType(ConnectivityTypeRow {
                connectivity_name: "dsl".into(),
            }))
            .await
            .unwrap();
        let again = tx
            .merge(&MergeRecord::ConnectivityType(ConnectivityTypeRow {
                connectivity_name: "dsl".into(),
            }))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        session.close().await.unwrap();

        assert!(first.inserted);
        assert_eq!(again, MergeOutcome { id: first.id, inserted: false });
        assert_eq!(executor.snapshot().await.connectivity_types.len(), 1);
    }

    #[test]
    fn dangling_reference_is_a_statement_error() {
        let mut tables = MemoryTables::default();
        let err = tables
            .merge(&MergeRecord::Tariff(TariffRecord {
                provider_id: 7,
                connectivity_id: 1,
                tariff_name: "Basic".into(),
                terms: TariffTerms::default(),
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Statement {
                entity: EntityKind::Tariff,
                ..
            }
        ));
    }

    #[test]
    fn provider_match_ignores_source() {
        let mut tables = MemoryTables::default();
        let a = tables
            .merge(&MergeRecord::Provider(ProviderRow {
                provider_name: "Telekom".into(),
                provider_source: "www.telekom.de".into(),
            }))
            .unwrap();
        let b = tables
            .merge(&MergeRecord::Provider(ProviderRow {
                provider_name: "Telekom".into(),
                provider_source: "www.check24.de".into(),
            }))
            .unwrap();
        assert_eq!(a.id, b.id);
        assert!(!b.inserted);
        assert_eq!(
            tables.providers.get(a.id).map(|p| p.provider_source.as_str()),
            Some("www.telekom.de")
        );
    }

    #[tokio::test]
    async fn second_transaction_waits_for_the_first() {
        let executor = MemoryExecutor::new();
        let mut first_session = executor.connect(&secret()).await.unwrap();
        let mut second_session = executor.connect(&secret()).await.unwrap();

        let mut first = first_session.begin().await.unwrap();
        first
            .merge(&MergeRecord::ConnectivityType(ConnectivityTypeRow {
                connectivity_name: "dsl".into(),
            }))
            .await
            .unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            second_session.begin(),
        )
        .await;
        assert!(blocked.is_err());
        drop(blocked);

        first.commit().await.unwrap();
        let mut second = second_session.begin().await.unwrap();
        second
            .merge(&MergeRecord::ConnectivityType(ConnectivityTypeRow {
                connectivity_name: "fiber".into(),
            }))
            .await
            .unwrap();
        second.commit().await.unwrap();

        assert_eq!(executor.snapshot().await.connectivity_types.len(), 2);
    }

    #[test]
    fn bonus_lookup_matches_name_and_value() {
        let mut tables = MemoryTables::default();
        let duration = tables
            .merge(&MergeRecord::BonusDuration(BonusDurationRow { bonus_duration: 12 }))
            .unwrap();
        let stored = tables
            .merge(&MergeRecord::Bonus(BonusRecord {
                bonus_name: "Free Router".into(),
                bonus_value: Some(tdw_core::Amount(0.0)),
                bonus_duration_id: duration.id,
            }))
            .unwrap();
        let key = |value: f64| BonusKey {
            bonus_name: "Free Router".into(),
            bonus_value: Some(tdw_core::Amount(value)),
        };
        assert_eq!(tables.find_bonus(&key(0.0)), Some(stored.id));
        assert_eq!(tables.find_bonus(&key(5.0)), None);
    }

    #[tokio::test]
    async fn connect_and_close_faults_surface() {
        let err = MemoryExecutor::new()
            .failing_connect()
            .connect(&secret())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecutorError::Connect(_)));

        let session = MemoryExecutor::new()
            .failing_close()
            .connect(&secret())
            .await
            .unwrap();
        assert!(matches!(session.close().await, Err(ExecutorError::Teardown(_))));
    }
}
