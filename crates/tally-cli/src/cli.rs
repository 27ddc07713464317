use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tally_core::PaymentMethod;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Ring up sales offline and sync them when the network returns")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding the local store image
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Remote statement endpoint (overrides `TALLY_REMOTE_URL`)
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the product catalog
    Product {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// Record and list sales
    Sale {
        #[command(subcommand)]
        command: SaleCommands,
    },
    /// Reconcile the local store with the remote store
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Keep syncing in the background until interrupted
    Watch {
        /// Print scheduler events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ProductCommands {
    /// Add a product
    #[command(alias = "new")]
    Add {
        /// Product name
        name: Vec<String>,
        /// Unit price, e.g. 4.50
        #[arg(long, value_parser = parse_price_cents)]
        price: i64,
        /// Units on hand
        #[arg(long, default_value = "0")]
        stock: i64,
        /// Stock keeping unit
        #[arg(long)]
        sku: Option<String>,
    },
    /// List products
    List {
        /// Number of products to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a product
    Edit {
        /// Product ID or unique ID prefix
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_parser = parse_price_cents)]
        price: Option<i64>,
        #[arg(long)]
        stock: Option<i64>,
        #[arg(long)]
        sku: Option<String>,
    },
    /// Remove a product from the catalog
    Delete {
        /// Product ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SaleCommands {
    /// Record a completed sale
    Record {
        /// Sale line as `<product>:<quantity>`; repeat for more lines
        #[arg(short, long = "item", value_name = "PRODUCT:QTY", required = true, value_parser = parse_line_item)]
        items: Vec<(String, i64)>,
        #[arg(long, value_enum, default_value_t = PaymentArg::Cash)]
        payment: PaymentArg,
        /// Free-text note on the receipt
        #[arg(long)]
        note: Option<String>,
    },
    /// List recent sales
    List {
        /// Number of sales to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Pull every remote record, ignoring the watermark
    Full,
    /// Show the sync phase, watermark and pending changes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PaymentArg {
    Cash,
    Card,
    Other,
}

impl From<PaymentArg> for PaymentMethod {
    fn from(value: PaymentArg) -> Self {
        match value {
            PaymentArg::Cash => Self::Cash,
            PaymentArg::Card => Self::Card,
            PaymentArg::Other => Self::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

/// Parse a decimal amount such as `4.5` or `12.05` into cents.
pub fn parse_price_cents(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().trim_start_matches('$');
    if trimmed.starts_with('-') {
        return Err(format!("price cannot be negative: '{value}'"));
    }
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err("price cannot be empty".into());
    }
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid price '{value}': use at most two decimals"));
    }

    let whole = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<i64>()
            .map_err(|_| format!("invalid price '{value}'"))?
    };
    let fraction = format!("{fraction:0<2}")
        .parse::<i64>()
        .map_err(|_| format!("invalid price '{value}'"))?;

    whole
        .checked_mul(100)
        .and_then(|cents| cents.checked_add(fraction))
        .ok_or_else(|| format!("price too large: '{value}'"))
}

/// Parse `<product>:<quantity>`.
pub fn parse_line_item(value: &str) -> Result<(String, i64), String> {
    let (product, quantity) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected PRODUCT:QTY, got '{value}'"))?;
    let product = product.trim();
    if product.is_empty() {
        return Err("product id cannot be empty".into());
    }
    let quantity = quantity
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid quantity in '{value}'"))?;
    if quantity <= 0 {
        return Err(format!("quantity must be positive in '{value}'"));
    }
    Ok((product.to_string(), quantity))
}
