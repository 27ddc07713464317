use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tally_core::models::SyncConflict;
use tally_core::{EngineConfig, PosService, Product, RecordId, Sale};

use crate::cli::Cli;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ProductListItem {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub price: String,
    pub stock: i64,
    pub sku: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaleListItem {
    pub id: String,
    pub total_cents: i64,
    pub total: String,
    pub payment_method: String,
    pub completed_at: i64,
    pub relative_time: String,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub kind: String,
    pub record_id: String,
    pub local_updated_at: i64,
    pub remote_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub resolution: String,
    pub reason: String,
}

/// Engine settings from the environment, with CLI flags applied on top.
pub fn resolve_config(cli: &Cli) -> Result<EngineConfig, CliError> {
    let mut config = EngineConfig::from_env()?;

    if let Some(data_dir) = cli.data_dir.clone() {
        config = config.with_data_dir(data_dir);
    } else if config.data_dir.is_none() {
        config = config.with_data_dir(default_data_dir()?);
    }
    if let Some(url) = cli.remote_url.clone() {
        let token = config.remote_token.clone();
        config = config.with_remote(url, token);
    }

    Ok(config)
}

pub fn default_data_dir() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("tally"))
        .ok_or_else(|| CliError::Config("failed to resolve a data directory; pass --data-dir".into()))
}

pub async fn open_service(config: &EngineConfig) -> Result<PosService, CliError> {
    Ok(PosService::open(config).await?)
}

pub fn ensure_sync_configured(service: &PosService) -> Result<(), CliError> {
    if service.orchestrator().remote().backend().is_configured() {
        Ok(())
    } else {
        Err(CliError::SyncNotConfigured)
    }
}

/// Resolve a full product ID or a unique prefix of one.
pub async fn resolve_product_id(query: &str, service: &PosService) -> Result<RecordId, CliError> {
    const PAGE_SIZE: usize = 500;

    let query = normalize_identifier(query)?;
    if let Ok(id) = query.parse::<RecordId>() {
        if service.get_product(&id).await?.is_some() {
            return Ok(id);
        }
    }

    let mut matching = Vec::new();
    let mut offset = 0usize;
    loop {
        let batch = service.list_products(PAGE_SIZE, offset).await?;
        let count = batch.len();
        matching.extend(
            batch
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| id.as_str().starts_with(&query)),
        );
        if count < PAGE_SIZE || matching.len() > 1 {
            break;
        }
        offset += count;
    }

    match matching.as_slice() {
        [] => Err(CliError::RecordNotFound {
            kind: "product",
            query,
        }),
        [id] => Ok(*id),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|id| short_id(*id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_name(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        Err(CliError::EmptyName)
    } else {
        Ok(collapsed)
    }
}

pub fn short_id(id: RecordId) -> String {
    id.as_str().chars().take(13).collect()
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn format_product_lines(products: &[(RecordId, Product)]) -> Vec<String> {
    products
        .iter()
        .map(|(id, product)| {
            let price = format_cents(product.price_cents);
            let line = format!(
                "{:<13}  {:<32}  {price:>9}  stock {:>4}",
                short_id(*id),
                product.name,
                product.stock
            );
            match product.sku.as_deref() {
                Some(sku) => format!("{line}  [{sku}]"),
                None => line,
            }
        })
        .collect()
}

pub fn product_to_list_item(id: RecordId, product: &Product) -> ProductListItem {
    ProductListItem {
        id: id.as_str(),
        name: product.name.clone(),
        price_cents: product.price_cents,
        price: format_cents(product.price_cents),
        stock: product.stock,
        sku: product.sku.clone(),
    }
}

pub fn format_sale_lines(sales: &[(RecordId, Sale)]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    sales
        .iter()
        .map(|(id, sale)| {
            let total = format_cents(sale.total_cents);
            let relative_time = format_relative_time(sale.completed_at, now_ms);
            let line = format!(
                "{:<13}  {total:>9}  {:<5}  {relative_time}",
                short_id(*id),
                payment_label(sale)
            );
            match sale.note.as_deref() {
                Some(note) => format!("{line}  {note}"),
                None => line,
            }
        })
        .collect()
}

pub fn sale_to_list_item(id: RecordId, sale: &Sale) -> SaleListItem {
    SaleListItem {
        id: id.as_str(),
        total_cents: sale.total_cents,
        total: format_cents(sale.total_cents),
        payment_method: payment_label(sale).to_string(),
        completed_at: sale.completed_at,
        relative_time: format_relative_time(sale.completed_at, Utc::now().timestamp_millis()),
        note: sale.note.clone(),
    }
}

fn payment_label(sale: &Sale) -> &'static str {
    match sale.payment_method {
        tally_core::PaymentMethod::Cash => "cash",
        tally_core::PaymentMethod::Card => "card",
        tally_core::PaymentMethod::Other => "other",
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        kind: conflict.kind.to_string(),
        record_id: conflict.record_id.clone(),
        local_updated_at: conflict.local_updated_at,
        remote_updated_at: conflict.remote_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        resolution: conflict.resolution.as_str().to_string(),
        reason: conflict.reason.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<11}  {} {}  local={} remote={}  ({})",
                format_sync_timestamp(conflict.resolved_at),
                conflict.resolution.as_str(),
                conflict.kind,
                conflict.record_id,
                conflict.local_updated_at,
                conflict.remote_updated_at,
                conflict.reason
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    if timestamp_ms <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
