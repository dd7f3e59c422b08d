use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, Row};
use tdw_storage::{LocalDocumentStore, StaticSecretProvider, WarehouseSecret};
use tdw_sync::{connect_options, InvocationResult, LoadPipeline, PgExecutor};
use uuid::Uuid;

const TABLES: [&str; 8] = [
    "addresses",
    "providers",
    "connectivity_types",
    "tariffs",
    "bonus_durations",
    "bonuses",
    "tariff_bonuses",
    "offers",
];

async fn row_counts(conn: &mut PgConnection) -> Result<Vec<i64>> {
    let mut counts = Vec::new();
    for table in TABLES {
        let row = sqlx::query(&format!("SELECT count(*) AS n FROM {table}"))
            .fetch_one(&mut *conn)
            .await?;
        counts.push(row.try_get("n")?);
    }
    Ok(counts)
}

fn summary_inserted(result: InvocationResult) -> Result<usize> {
    match result {
        InvocationResult::Succeeded(summary) => Ok(summary.inserted()),
        InvocationResult::Failed(failure) => anyhow::bail!("load failed: {failure:?}"),
    }
}

/// Needs `TDW_TEST_WAREHOUSE` holding a warehouse secret as JSON, e.g.
/// `{"host":"localhost","username":"tdw","password":"tdw","database":"tdw"}`.
#[tokio::test]
async fn loads_fixture_partitions_into_postgres() -> Result<()> {
    let raw = match env::var("TDW_TEST_WAREHOUSE") {
        Ok(raw) => raw,
        Err(_) => {
            eprintln!("Skipping postgres integration test because TDW_TEST_WAREHOUSE is not set");
            return Ok(());
        }
    };
    let mut secret: WarehouseSecret =
        serde_json::from_str(&raw).context("parsing TDW_TEST_WAREHOUSE")?;
    let schema = format!("tdw_test_{}", Uuid::new_v4().simple());
    secret.schema = Some(schema.clone());

    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let ddl = std::fs::read_to_string(workspace.join("sql/warehouse.sql"))?;

    let mut conn = PgConnection::connect_with(&connect_options(&secret)).await?;
    sqlx::raw_sql(&format!("CREATE SCHEMA {schema}; SET search_path TO {schema};"))
        .execute(&mut conn)
        .await?;
    sqlx::raw_sql(&ddl).execute(&mut conn).await?;

    let pipeline = LoadPipeline::new(
        "telekom",
        "tdw/warehouse",
        Box::new(LocalDocumentStore::new(workspace.join("fixtures"))),
        Box::new(StaticSecretProvider(secret)),
        Box::new(PgExecutor),
    )?;

    let outcome: Result<()> = async {
        assert_eq!(summary_inserted(pipeline.run_partition(Some("2025-02-05")).await)?, 8);
        assert_eq!(row_counts(&mut conn).await?, vec![1; 8]);

        assert_eq!(summary_inserted(pipeline.run_partition(Some("2025-02-05")).await)?, 0);
        assert_eq!(row_counts(&mut conn).await?, vec![1; 8]);

        summary_inserted(pipeline.run_partition(Some("2025-02-06")).await)?;
        assert_eq!(row_counts(&mut conn).await?, vec![2, 1, 2, 3, 2, 2, 4, 4]);

        let unresolved = sqlx::query("SELECT count(*) AS n FROM bonuses WHERE bonus_name = $1")
            .bind("Setup Fee Waived")
            .fetch_one(&mut conn)
            .await?
            .try_get::<i64, _>("n")?;
        assert_eq!(unresolved, 0);
        Ok(())
    }
    .await;

    sqlx::raw_sql(&format!("DROP SCHEMA {schema} CASCADE"))
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    outcome
}
