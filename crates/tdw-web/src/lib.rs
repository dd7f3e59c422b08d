//! Axum service for TDW: read-only warehouse lookups and the load trigger.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tdw_storage::{ChainSecretProvider, SecretProvider};
use tdw_sync::{connect_options, InvocationResult, LoadPipeline, SyncConfig, TriggerEvent};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tdw-web";

const DEFAULT_TARIFF_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    /// Warehouse pool for the lookup endpoints; `None` answers them with 503.
    pub pool: Option<PgPool>,
    pub pipeline: Arc<LoadPipeline>,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, pipeline: Arc<LoadPipeline>) -> Self {
        Self { pool, pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TariffsQuery {
    date_collected: Option<String>,
    provider_name: Option<String>,
    provider_source: Option<String>,
    connectivity_type: Option<String>,
    street: Option<String>,
    city: Option<String>,
    zip: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BonusesQuery {
    tariff_id: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffOfferRow {
    pub tariff_id: i64,
    pub tariff_name: String,
    pub provider_name: String,
    pub provider_source: String,
    pub connectivity_type: String,
    pub nominal_price: Option<f64>,
    pub discounted_price: Option<f64>,
    pub contract_duration: Option<i32>,
    pub upload_rate: Option<f64>,
    pub download_rate: Option<f64>,
    pub street: String,
    pub city: String,
    pub zip: String,
    pub date_collected: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffRow {
    pub tariff_id: i64,
    pub tariff_name: String,
    pub provider_id: i64,
    pub provider_name: String,
    pub connectivity_id: i64,
    pub connectivity_type: String,
    pub nominal_price: Option<f64>,
    pub discounted_price: Option<f64>,
    pub contract_duration: Option<i32>,
    pub upload_rate: Option<f64>,
    pub download_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffBonusRow {
    pub tariff_id: i64,
    pub tariff_name: String,
    pub bonus_name: String,
    pub bonus_value: Option<f64>,
    pub bonus_duration: i32,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/tariffs", get(tariffs_handler))
        .route("/tariffs/{tariff_id}", get(tariff_detail_handler))
        .route("/bonuses", get(bonuses_handler))
        .route("/loads", post(loads_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TDW_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(LoadPipeline::from_config(&config)?);
    let pool = connect_pool(&config).await;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, lookups = pool.is_some(), "tdw-web listening");
    axum::serve(listener, app(AppState::new(pool, pipeline))).await?;
    Ok(())
}

/// Lazily-connecting pool from the warehouse secret, if one can be resolved.
async fn connect_pool(config: &SyncConfig) -> Option<PgPool> {
    let secrets = ChainSecretProvider::env_then_dir(config.secrets_dir.clone());
    match secrets.fetch_secret(&config.secret_name).await {
        Ok(secret) => Some(
            PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy_with(connect_options(&secret)),
        ),
        Err(err) => {
            warn!(error = %err, "warehouse secret unavailable; lookup endpoints disabled");
            None
        }
    }
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "lookup query failed");
    message(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

fn unavailable() -> Response {
    message(StatusCode::SERVICE_UNAVAILABLE, "Warehouse not configured")
}

/// Blank means absent; anything else must be a positive integer.
fn parse_limit(raw: Option<&str>) -> Result<Option<i64>, Response> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => match s.parse::<i64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(message(StatusCode::BAD_REQUEST, "Invalid limit parameter")),
        },
    }
}

fn parse_tariff_id(raw: &str) -> Result<i64, Response> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| message(StatusCode::BAD_REQUEST, "Invalid tariff ID"))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

async fn tariffs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TariffsQuery>,
) -> Response {
    let limit = match parse_limit(query.limit.as_deref()) {
        Ok(limit) => limit.unwrap_or(DEFAULT_TARIFF_LIMIT),
        Err(resp) => return resp,
    };
    let date_collected = match non_blank(&query.date_collected) {
        None => None,
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => return message(StatusCode::BAD_REQUEST, "Invalid date_collected parameter"),
        },
    };
    let Some(pool) = &state.pool else {
        return unavailable();
    };

    match load_tariff_offers(pool, &query, date_collected, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn tariff_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(tariff_id): Path<String>,
) -> Response {
    let tariff_id = match parse_tariff_id(&tariff_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(pool) = &state.pool else {
        return unavailable();
    };

    match load_tariff(pool, tariff_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => message(StatusCode::NOT_FOUND, "Tariff not found"),
        Err(err) => server_error(err),
    }
}

async fn bonuses_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BonusesQuery>,
) -> Response {
    let tariff_id = match non_blank(&query.tariff_id).map(parse_tariff_id).transpose() {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let limit = match parse_limit(query.limit.as_deref()) {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    let Some(pool) = &state.pool else {
        return unavailable();
    };

    match load_tariff_bonuses(pool, tariff_id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn loads_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TriggerEvent>, JsonRejection>,
) -> Response {
    let result = match payload {
        Ok(Json(event)) => state.pipeline.handle_event(&event).await,
        Err(rejection) => InvocationResult::rejected_trigger(format!(
            "Invalid trigger payload: {}",
            rejection.body_text()
        )),
    };
    let status =
        StatusCode::from_u16(result.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(result)).into_response()
}

async fn load_tariff_offers(
    pool: &PgPool,
    query: &TariffsQuery,
    date_collected: Option<NaiveDate>,
    limit: i64,
) -> anyhow::Result<Vec<TariffOfferRow>> {
    let rows = sqlx::query(
        r#"
        SELECT t.tariff_id, t.tariff_name, p.provider_name, p.provider_source,
               c.connectivity_name, t.nominal_price, t.discounted_price,
               t.contract_duration, t.upload_rate, t.download_rate,
               a.street, a.city, a.zip, o.date_collected
          FROM offers o
          JOIN tariffs t ON t.tariff_id = o.tariff_id
          JOIN providers p ON p.provider_id = t.provider_id
          JOIN connectivity_types c ON c.connectivity_id = t.connectivity_id
          JOIN addresses a ON a.address_id = o.address_id
         WHERE ($1::date IS NULL OR o.date_collected = $1)
           AND ($2::text IS NULL OR p.provider_name = $2)
           AND ($3::text IS NULL OR p.provider_source = $3)
           AND ($4::text IS NULL OR c.connectivity_name = $4)
           AND ($5::text IS NULL OR a.street = $5)
           AND ($6::text IS NULL OR a.city = $6)
           AND ($7::text IS NULL OR a.zip = $7)
         ORDER BY t.tariff_id, o.date_collected, a.address_id
         LIMIT $8
        "#,
    )
    .bind(date_collected)
    .bind(non_blank(&query.provider_name))
    .bind(non_blank(&query.provider_source))
    .bind(non_blank(&query.connectivity_type))
    .bind(non_blank(&query.street))
    .bind(non_blank(&query.city))
    .bind(non_blank(&query.zip))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(TariffOfferRow {
            tariff_id: row.try_get("tariff_id")?,
            tariff_name: row.try_get("tariff_name")?,
            provider_name: row.try_get("provider_name")?,
            provider_source: row.try_get("provider_source")?,
            connectivity_type: row.try_get("connectivity_name")?,
            nominal_price: row.try_get("nominal_price")?,
            discounted_price: row.try_get("discounted_price")?,
            contract_duration: row.try_get("contract_duration")?,
            upload_rate: row.try_get("upload_rate")?,
            download_rate: row.try_get("download_rate")?,
            street: row.try_get("street")?,
            city: row.try_get("city")?,
            zip: row.try_get("zip")?,
            date_collected: row.try_get("date_collected")?,
        });
    }
    Ok(out)
}

async fn load_tariff(pool: &PgPool, tariff_id: i64) -> anyhow::Result<Option<TariffRow>> {
    let row = sqlx::query(
        r#"
        SELECT t.tariff_id, t.tariff_name, t.provider_id, p.provider_name,
               t.connectivity_id, c.connectivity_name, t.nominal_price,
               t.discounted_price, t.contract_duration, t.upload_rate, t.download_rate
          FROM tariffs t
          JOIN providers p ON p.provider_id = t.provider_id
          JOIN connectivity_types c ON c.connectivity_id = t.connectivity_id
         WHERE t.tariff_id = $1
        "#,
    )
    .bind(tariff_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(TariffRow {
        tariff_id: row.try_get("tariff_id")?,
        tariff_name: row.try_get("tariff_name")?,
        provider_id: row.try_get("provider_id")?,
        provider_name: row.try_get("provider_name")?,
        connectivity_id: row.try_get("connectivity_id")?,
        connectivity_type: row.try_get("connectivity_name")?,
        nominal_price: row.try_get("nominal_price")?,
        discounted_price: row.try_get("discounted_price")?,
        contract_duration: row.try_get("contract_duration")?,
        upload_rate: row.try_get("upload_rate")?,
        download_rate: row.try_get("download_rate")?,
    }))
}

async fn load_tariff_bonuses(
    pool: &PgPool,
    tariff_id: Option<i64>,
    limit: Option<i64>,
) -> anyhow::Result<Vec<TariffBonusRow>> {
    let rows = sqlx::query(
        r#"
        SELECT t.tariff_id, t.tariff_name, b.bonus_name, b.bonus_value, d.bonus_duration
          FROM tariffs t
          JOIN tariff_bonuses tb ON tb.tariff_id = t.tariff_id
          JOIN bonuses b ON b.bonus_id = tb.bonus_id
          JOIN bonus_durations d ON d.bonus_duration_id = b.bonus_duration_id
         WHERE ($1::bigint IS NULL OR t.tariff_id = $1)
         ORDER BY t.tariff_id, b.bonus_name
         LIMIT $2
        "#,
    )
    .bind(tariff_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(TariffBonusRow {
            tariff_id: row.try_get("tariff_id")?,
            tariff_name: row.try_get("tariff_name")?,
            bonus_name: row.try_get("bonus_name")?,
            bonus_value: row.try_get("bonus_value")?,
            bonus_duration: row.try_get("bonus_duration")?,
        });
    }
    Ok(out)
}
