use clap::Parser;
use pretty_assertions::assert_eq;
use tally_core::models::{ConflictEntry, Resolution};
use tally_core::sync::{SyncMetadata, SyncPhase, SyncStatus};
use tally_core::{EngineConfig, EntityKind, PosService, Product, RecordId, SyncReport};

use crate::cli::{parse_line_item, parse_price_cents, Cli, Commands, CompletionShell, SaleCommands};
use crate::commands::common::{
    format_cents, format_relative_time, format_sync_timestamp, normalize_name, resolve_config,
    resolve_product_id, short_id,
};
use crate::commands::completions::render_completions;
use crate::commands::product::product_patch;
use crate::commands::sync::{format_report_lines, format_status_lines};
use crate::error::CliError;

#[test]
fn price_parser_accepts_common_forms() {
    assert_eq!(parse_price_cents("4.50"), Ok(450));
    assert_eq!(parse_price_cents("4.5"), Ok(450));
    assert_eq!(parse_price_cents("$12"), Ok(1200));
    assert_eq!(parse_price_cents(".99"), Ok(99));
    assert_eq!(parse_price_cents("0"), Ok(0));
}

#[test]
fn price_parser_rejects_bad_input() {
    for input in ["", "abc", "1.234", "-1", "1.x", "-0.50"] {
        assert!(parse_price_cents(input).is_err(), "accepted {input:?}");
    }
}

#[test]
fn line_item_parser_splits_on_last_colon() {
    assert_eq!(parse_line_item("0190a1b2:3"), Ok(("0190a1b2".to_string(), 3)));
    assert_eq!(parse_line_item(" abc : 1 "), Ok(("abc".to_string(), 1)));
    assert!(parse_line_item("abc").is_err());
    assert!(parse_line_item("abc:0").is_err());
    assert!(parse_line_item(":2").is_err());
}

#[test]
fn sale_record_requires_at_least_one_item() {
    let parsed = Cli::try_parse_from(["tally", "sale", "record", "--payment", "card"]);
    assert!(parsed.is_err());

    let cli = Cli::try_parse_from([
        "tally", "sale", "record", "-i", "abc:2", "--item", "def:1", "--payment", "card",
    ])
    .unwrap();
    let Commands::Sale {
        command: SaleCommands::Record { items, .. },
    } = cli.command
    else {
        panic!("expected sale record");
    };
    assert_eq!(items, vec![("abc".to_string(), 2), ("def".to_string(), 1)]);
}

#[test]
fn cents_are_formatted_with_two_decimals() {
    assert_eq!(format_cents(0), "0.00");
    assert_eq!(format_cents(5), "0.05");
    assert_eq!(format_cents(1250), "12.50");
    assert_eq!(format_cents(-99), "-0.99");
}

#[test]
fn relative_time_buckets() {
    let now = 10 * 24 * 60 * 60 * 1000;
    assert_eq!(format_relative_time(now - 5_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 3_600_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 2 * 86_400_000, now), "2d ago");
    assert_eq!(format_relative_time(0, now), "1w ago");
}

#[test]
fn zero_timestamp_reads_as_never() {
    assert_eq!(format_sync_timestamp(0), "never");
    assert_eq!(format_sync_timestamp(1_000), "1970-01-01 00:00:01 UTC");
}

#[test]
fn names_are_collapsed_and_required() {
    assert_eq!(
        normalize_name(&["  Flat".to_string(), "white ".to_string()]).unwrap(),
        "Flat white"
    );
    assert!(matches!(normalize_name(&[" ".to_string()]), Err(CliError::EmptyName)));
}

#[test]
fn product_patch_only_contains_given_fields() {
    let patch = product_patch(None, Some(500), None, Some(String::new())).unwrap();
    assert_eq!(patch, serde_json::json!({"price_cents": 500, "sku": null}));

    assert!(matches!(
        product_patch(None, None, None, None),
        Err(CliError::EmptyEdit)
    ));
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("tally"));
}

#[test]
fn cli_flags_override_environment_config() {
    let cli = Cli::try_parse_from([
        "tally",
        "--data-dir",
        "/tmp/tally-test",
        "--remote-url",
        "https://sync.example.com",
        "sync",
        "status",
    ])
    .unwrap();
    let config = resolve_config(&cli).unwrap();
    assert_eq!(
        config.data_dir.as_deref(),
        Some(std::path::Path::new("/tmp/tally-test"))
    );
    assert_eq!(config.remote_url.as_deref(), Some("https://sync.example.com"));
}

#[test]
fn report_lines_surface_errors() {
    let mut report = SyncReport::new();
    report.count_pushed(EntityKind::Product);
    report.conflicts.push(ConflictEntry {
        kind: EntityKind::Sale,
        id: RecordId::new(),
        resolution: Resolution::RemoteWins,
        reason: "remote timestamp newer".into(),
    });
    report.record_error(
        EntityKind::Product,
        &RecordId::new(),
        tally_core::Error::Remote("boom".into()),
    );

    let lines = format_report_lines(&report);
    assert_eq!(lines[0], "1 pushed, 0 pulled, 1 conflicts");
    assert!(lines[1].contains("remote_wins"));
    assert_eq!(lines[2], "Last attempt had 1 errors:");
    assert!(lines[3].contains("boom"));
}

#[test]
fn status_lines_show_pending_changes() {
    let status = SyncStatus {
        phase: SyncPhase::Idle,
        metadata: SyncMetadata::default(),
        pending_changes: 3,
    };
    let lines = format_status_lines(&status);
    assert_eq!(lines[1], "last sync:    never");
    assert_eq!(lines[3], "pending:      3");
}

#[tokio::test(flavor = "multi_thread")]
async fn product_ids_resolve_by_unique_prefix() {
    let service = PosService::open(&EngineConfig::default()).await.unwrap();
    let tea = service.add_product(&Product::new("Tea", 250, 1)).await.unwrap();
    service.add_product(&Product::new("Scone", 300, 1)).await.unwrap();

    let full = resolve_product_id(&tea.id.as_str(), &service).await.unwrap();
    assert_eq!(full, tea.id);

    let id = tea.id.as_str();
    let prefix = &id[..id.len() - 1];
    assert_eq!(resolve_product_id(prefix, &service).await.unwrap(), tea.id);

    assert!(matches!(
        resolve_product_id("ffffffff", &service).await,
        Err(CliError::RecordNotFound { .. })
    ));
    assert!(matches!(
        resolve_product_id(&short_id(tea.id)[..1], &service).await,
        Err(CliError::AmbiguousId(_))
    ));
}
