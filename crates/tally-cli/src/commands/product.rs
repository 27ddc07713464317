use serde_json::{json, Map, Value};
use tally_core::{EngineConfig, Product};

use crate::commands::common::{
    format_product_lines, normalize_name, open_service, product_to_list_item, resolve_product_id,
};
use crate::error::CliError;

pub async fn run_product_add(
    name_parts: &[String],
    price_cents: i64,
    stock: i64,
    sku: Option<String>,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let name = normalize_name(name_parts)?;
    let mut product = Product::new(name, price_cents, stock);
    if let Some(sku) = tally_core::util::normalize_text_option(sku) {
        product = product.with_sku(sku);
    }

    let service = open_service(config).await?;
    let record = service.add_product(&product).await?;

    println!("{}", record.id);
    Ok(())
}

pub async fn run_product_list(
    limit: usize,
    as_json: bool,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let products = service.list_products(limit, 0).await?;

    if as_json {
        let items = products
            .iter()
            .map(|(id, product)| product_to_list_item(*id, product))
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if products.is_empty() {
        println!("No products yet. Add one with `tally product add`.");
    } else {
        for line in format_product_lines(&products) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Merge patch built from the fields the user passed.
pub fn product_patch(
    name: Option<String>,
    price_cents: Option<i64>,
    stock: Option<i64>,
    sku: Option<String>,
) -> Result<Value, CliError> {
    let mut patch = Map::new();
    if let Some(name) = name {
        patch.insert("name".into(), json!(normalize_name(&[name])?));
    }
    if let Some(price_cents) = price_cents {
        patch.insert("price_cents".into(), json!(price_cents));
    }
    if let Some(stock) = stock {
        patch.insert("stock".into(), json!(stock));
    }
    if let Some(sku) = sku {
        // an empty sku clears it
        patch.insert(
            "sku".into(),
            tally_core::util::normalize_text_option(Some(sku)).map_or(Value::Null, Value::String),
        );
    }

    if patch.is_empty() {
        return Err(CliError::EmptyEdit);
    }
    Ok(Value::Object(patch))
}

pub async fn run_product_edit(
    id: &str,
    patch: Value,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let product_id = resolve_product_id(id, &service).await?;
    let record = service.update_product(&product_id, &patch).await?;

    println!("{}", record.id);
    Ok(())
}

pub async fn run_product_delete(id: &str, config: &EngineConfig) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let product_id = resolve_product_id(id, &service).await?;
    service.delete_product(&product_id).await?;

    println!("Deleted product {product_id}");
    Ok(())
}
