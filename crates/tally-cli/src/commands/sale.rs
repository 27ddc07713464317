use tally_core::{EngineConfig, LineRequest, PaymentMethod};

use crate::commands::common::{
    format_cents, format_sale_lines, open_service, resolve_product_id, sale_to_list_item, short_id,
};
use crate::error::CliError;

pub async fn run_sale_record(
    items: &[(String, i64)],
    payment_method: PaymentMethod,
    note: Option<String>,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let service = open_service(config).await?;

    let mut lines = Vec::with_capacity(items.len());
    for (query, quantity) in items {
        lines.push(LineRequest {
            product_id: resolve_product_id(query, &service).await?,
            quantity: *quantity,
        });
    }

    let receipt = service.record_sale(&lines, payment_method, note).await?;
    for (_, item) in &receipt.items {
        println!(
            "  {:<13}  {:>3} x {:>9}  {:>9}",
            short_id(item.product_id),
            item.quantity,
            format_cents(item.unit_price_cents),
            format_cents(item.line_total_cents())
        );
    }
    println!("Total {}", format_cents(receipt.sale.total_cents));
    println!("{}", receipt.sale_id);
    Ok(())
}

pub async fn run_sale_list(
    limit: usize,
    as_json: bool,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let sales = service.list_sales(limit, 0).await?;

    if as_json {
        let items = sales
            .iter()
            .map(|(id, sale)| sale_to_list_item(*id, sale))
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if sales.is_empty() {
        println!("No sales recorded.");
    } else {
        for line in format_sale_lines(&sales) {
            println!("{line}");
        }
    }
    Ok(())
}
