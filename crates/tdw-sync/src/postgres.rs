//! Postgres-backed warehouse executor.
//!
//! Every merge is a single statement: look the row up by its natural key and
//! insert it only when absent, returning the surrogate key either way. Nullable
//! key columns are compared with `IS NOT DISTINCT FROM` so an absent value
//! matches an absent value.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, Row, Transaction};
use tdw_core::{Amount, BonusKey, EntityKind, MergeOutcome, MergeRecord, SurrogateId};
use tdw_storage::WarehouseSecret;
use tracing::debug;

use crate::executor::{ExecutorError, MergeTransaction, QueryExecutor, WarehouseSession};

const APPLICATION_NAME: &str = "tdw-loader";

const MERGE_ADDRESS: &str = r#"
WITH existing AS (
    SELECT address_id AS id FROM addresses
     WHERE street = $1 AND city = $2 AND zip = $3
), inserted AS (
    INSERT INTO addresses (street, city, zip)
    SELECT $1, $2, $3
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING address_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_PROVIDER: &str = r#"
WITH existing AS (
    SELECT provider_id AS id FROM providers
     WHERE provider_name = $1
), inserted AS (
    INSERT INTO providers (provider_name, provider_source)
    SELECT $1, $2
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING provider_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_CONNECTIVITY_TYPE: &str = r#"
WITH existing AS (
    SELECT connectivity_id AS id FROM connectivity_types
     WHERE connectivity_name = $1
), inserted AS (
    INSERT INTO connectivity_types (connectivity_name)
    SELECT $1
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING connectivity_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_TARIFF: &str = r#"
WITH existing AS (
    SELECT tariff_id AS id FROM tariffs
     WHERE provider_id = $1
       AND connectivity_id = $2
       AND tariff_name = $3
       AND nominal_price IS NOT DISTINCT FROM $4
       AND discounted_price IS NOT DISTINCT FROM $5
       AND contract_duration IS NOT DISTINCT FROM $6
       AND upload_rate IS NOT DISTINCT FROM $7
       AND download_rate IS NOT DISTINCT FROM $8
), inserted AS (
    INSERT INTO tariffs (provider_id, connectivity_id, tariff_name, nominal_price,
                         discounted_price, contract_duration, upload_rate, download_rate)
    SELECT $1, $2, $3, $4, $5, $6, $7, $8
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING tariff_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_BONUS_DURATION: &str = r#"
WITH existing AS (
    SELECT bonus_duration_id AS id FROM bonus_durations
     WHERE bonus_duration = $1
), inserted AS (
    INSERT INTO bonus_durations (bonus_duration)
    SELECT $1
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING bonus_duration_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_BONUS: &str = r#"
WITH existing AS (
    SELECT bonus_id AS id FROM bonuses
     WHERE bonus_name = $1
       AND bonus_value IS NOT DISTINCT FROM $2
), inserted AS (
    INSERT INTO bonuses (bonus_name, bonus_value, bonus_duration_id)
    SELECT $1, $2, $3
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING bonus_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_TARIFF_BONUS: &str = r#"
WITH existing AS (
    SELECT tariff_bonus_id AS id FROM tariff_bonuses
     WHERE tariff_id = $1 AND bonus_id = $2
), inserted AS (
    INSERT INTO tariff_bonuses (tariff_id, bonus_id)
    SELECT $1, $2
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING tariff_bonus_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const MERGE_OFFER: &str = r#"
WITH existing AS (
    SELECT offer_id AS id FROM offers
     WHERE address_id = $1 AND tariff_id = $2 AND date_collected = $3
), inserted AS (
    INSERT INTO offers (address_id, tariff_id, date_collected)
    SELECT $1, $2, $3
     WHERE NOT EXISTS (SELECT 1 FROM existing)
    ON CONFLICT DO NOTHING
    RETURNING offer_id AS id
)
SELECT id, TRUE AS inserted FROM inserted
UNION ALL
SELECT id, FALSE AS inserted FROM existing
"#;

const FIND_BONUS: &str = r#"
SELECT bonus_id AS id FROM bonuses
 WHERE bonus_name = $1
   AND bonus_value IS NOT DISTINCT FROM $2
"#;

pub fn merge_sql(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Address => MERGE_ADDRESS,
        EntityKind::Provider => MERGE_PROVIDER,
        EntityKind::ConnectivityType => MERGE_CONNECTIVITY_TYPE,
        EntityKind::Tariff => MERGE_TARIFF,
        EntityKind::BonusDuration => MERGE_BONUS_DURATION,
        EntityKind::Bonus => MERGE_BONUS,
        EntityKind::TariffBonusLink => MERGE_TARIFF_BONUS,
        EntityKind::Offer => MERGE_OFFER,
    }
}

fn amount(value: Option<Amount>) -> Option<f64> {
    value.map(Amount::value)
}

fn bind_record(record: &MergeRecord) -> Query<'_, Postgres, PgArguments> {
    let query = sqlx::query(merge_sql(record.kind()));
    match record {
        MergeRecord::Address(row) => query.bind(&row.street).bind(&row.city).bind(&row.zip),
        MergeRecord::Provider(row) => query.bind(&row.provider_name).bind(&row.provider_source),
        MergeRecord::ConnectivityType(row) => query.bind(&row.connectivity_name),
        MergeRecord::Tariff(row) => query
            .bind(row.provider_id)
            .bind(row.connectivity_id)
            .bind(&row.tariff_name)
            .bind(amount(row.terms.nominal_price))
            .bind(amount(row.terms.discounted_price))
            .bind(row.terms.contract_duration)
            .bind(amount(row.terms.upload_rate))
            .bind(amount(row.terms.download_rate)),
        MergeRecord::BonusDuration(row) => query.bind(row.bonus_duration),
        MergeRecord::Bonus(row) => query
            .bind(&row.bonus_name)
            .bind(amount(row.bonus_value))
            .bind(row.bonus_duration_id),
        MergeRecord::TariffBonusLink(row) => query.bind(row.tariff_id).bind(row.bonus_id),
        MergeRecord::Offer(row) => query
            .bind(row.address_id)
            .bind(row.tariff_id)
            .bind(row.date_collected),
    }
}

/// Connection options for `secret`; a configured schema becomes the session `search_path`.
pub fn connect_options(secret: &WarehouseSecret) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&secret.host)
        .port(secret.port)
        .username(&secret.username)
        .password(&secret.password)
        .database(&secret.database)
        .application_name(APPLICATION_NAME);
    match &secret.schema {
        Some(schema) => options.options([("search_path", schema.as_str())]),
        None => options,
    }
}

/// Opens one dedicated connection per load.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgExecutor;

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn connect(
        &self,
        secret: &WarehouseSecret,
    ) -> Result<Box<dyn WarehouseSession>, ExecutorError> {
        let conn = PgConnection::connect_with(&connect_options(secret))
            .await
            .map_err(|err| ExecutorError::Connect(err.to_string()))?;
        debug!(host = %secret.host, database = %secret.database, "warehouse connection opened");
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl WarehouseSession for PgSession {
    async fn begin<'s>(&'s mut self) -> Result<Box<dyn MergeTransaction + 's>, ExecutorError> {
        let tx = self
            .conn
            .begin()
            .await
            .map_err(|err| ExecutorError::Transaction(err.to_string()))?;
        Ok(Box::new(PgMergeTransaction { tx }))
    }

    async fn close(self: Box<Self>) -> Result<(), ExecutorError> {
        let session = *self;
        session
            .conn
            .close()
            .await
            .map_err(|err| ExecutorError::Teardown(err.to_string()))
    }
}

struct PgMergeTransaction<'c> {
    tx: Transaction<'c, Postgres>,
}

#[async_trait]
impl MergeTransaction for PgMergeTransaction<'_> {
    async fn lock_partition(&mut self, lock_key: i64) -> Result<(), ExecutorError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| ExecutorError::Transaction(err.to_string()))?;
        Ok(())
    }

    async fn merge(&mut self, record: &MergeRecord) -> Result<MergeOutcome, ExecutorError> {
        let statement_error = |err: sqlx::Error| ExecutorError::Statement {
            entity: record.kind(),
            message: err.to_string(),
        };

        // A concurrent insert of the same key makes the first attempt return
        // nothing; the second attempt sees the committed row.
        for _ in 0..2 {
            let row = bind_record(record)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(statement_error)?;
            if let Some(row) = row {
                return Ok(MergeOutcome {
                    id: row.try_get("id").map_err(statement_error)?,
                    inserted: row.try_get("inserted").map_err(statement_error)?,
                });
            }
        }
        Err(ExecutorError::Statement {
            entity: record.kind(),
            message: "row neither inserted nor found".into(),
        })
    }

    async fn find_bonus(&mut self, key: &BonusKey) -> Result<Option<SurrogateId>, ExecutorError> {
        let statement_error = |err: sqlx::Error| ExecutorError::Statement {
            entity: EntityKind::TariffBonusLink,
            message: err.to_string(),
        };
        let row = sqlx::query(FIND_BONUS)
            .bind(&key.bonus_name)
            .bind(amount(key.bonus_value))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(statement_error)?;
        row.map(|row| row.try_get("id")).transpose().map_err(statement_error)
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecutorError> {
        let this = *self;
        this.tx
            .commit()
            .await
            .map_err(|err| ExecutorError::Transaction(err.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecutorError> {
        let this = *self;
        this.tx
            .rollback()
            .await
            .map_err(|err| ExecutorError::Transaction(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entity_has_a_merge_statement_on_its_table() {
        for kind in EntityKind::ALL {
            let sql = merge_sql(kind);
            assert!(
                sql.contains(&format!("INSERT INTO {} ", kind.table_name())),
                "{kind}"
            );
            assert!(sql.contains("ON CONFLICT DO NOTHING"), "{kind}");
        }
    }

    #[test]
    fn nullable_tariff_terms_use_null_safe_comparison() {
        assert_eq!(MERGE_TARIFF.matches("IS NOT DISTINCT FROM").count(), 5);
        assert!(MERGE_BONUS.contains("bonus_value IS NOT DISTINCT FROM $2"));
        assert!(FIND_BONUS.contains("bonus_value IS NOT DISTINCT FROM $2"));
        assert!(!FIND_BONUS.contains("INSERT"));
    }
}
