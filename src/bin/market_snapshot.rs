use market_snapshot::config::{Config, STORE_BATCH_HARD_CAP};
use market_snapshot::errors::{ErrorCategory, Result, SnapshotError};
use market_snapshot::models::record::{DateRange, SnapshotKey};
use market_snapshot::scrapers::{
    InstrumentFetcher, SpreadsheetFetcher, TefasFetcher, TradingViewFetcher, YahooFetcher, YahooGroup,
};
use market_snapshot::services::pipeline::{RunOutcome, SnapshotPipeline};
use market_snapshot::services::snapshot_writer::{HistoryKind, SnapshotWriter};
use market_snapshot::store::{ArrowStore, DocumentStore, MemoryStore};
use market_snapshot::util;

use anyhow::{bail, Context};
use clap::{App, Arg, ArgMatches, SubCommand};
use log::{error, info, warn};
use std::sync::Arc;

/// 退出码：0 写入成功，2 没有可写入的数据
const EXIT_NOOP: i32 = 2;

fn source_args<'a>(cmd: App<'a>) -> App<'a> {
    cmd.arg(
        Arg::with_name("source")
            .long("source")
            .value_name("SOURCE")
            .help("Data source (tefas, tradingview, yahoo, file)")
            .required(true)
            .takes_value(true),
    )
    .arg(
        Arg::with_name("market")
            .long("market")
            .value_name("MARKET")
            .help("TradingView scanner market (turkey, america, crypto)")
            .takes_value(true)
            .default_value("turkey"),
    )
    .arg(
        Arg::with_name("group")
            .long("group")
            .value_name("GROUP")
            .help("Yahoo ticker group (crypto, bist, us, fx)")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("file")
            .long("file")
            .value_name("FILE")
            .help("Spreadsheet export to read when --source file")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("codes")
            .short('c')
            .long("codes")
            .value_name("CODES")
            .help("Comma separated instrument codes to keep")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("limit")
            .long("limit")
            .value_name("LIMIT")
            .help("Maximum rows requested from the scanner")
            .takes_value(true)
            .default_value("1000"),
    )
    .arg(
        Arg::with_name("fund-type")
            .long("fund-type")
            .value_name("TYPE")
            .help("TEFAS fund type (YAT, EMK, BYF)")
            .takes_value(true)
            .default_value("YAT"),
    )
    .arg(
        Arg::with_name("date")
            .short('d')
            .long("date")
            .value_name("DATE")
            .help("Snapshot date (YYYY-MM-DD), defaults to today in the market timezone")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("dry-run")
            .long("dry-run")
            .help("Write into an in-memory store instead of the data directory")
            .takes_value(false),
    )
}

fn build_fetcher(matches: &ArgMatches, config: &Config) -> anyhow::Result<Arc<dyn InstrumentFetcher>> {
    let source = matches.value_of("source").unwrap_or_default().to_lowercase();
    let fetcher: Arc<dyn InstrumentFetcher> = match source.as_str() {
        "tefas" => {
            let fund_type = matches.value_of("fund-type").unwrap_or("YAT");
            Arc::new(TefasFetcher::new(config.request_timeout)?.with_fund_type(fund_type))
        }
        "tradingview" => {
            let market = matches.value_of("market").unwrap_or("turkey");
            let limit = matches
                .value_of("limit")
                .unwrap_or("1000")
                .parse::<usize>()
                .context("--limit must be a positive number")?;
            Arc::new(
                TradingViewFetcher::new(market, config.request_timeout)?
                    .with_limit(limit)
                    .with_market_cap_sort(true),
            )
        }
        "yahoo" => {
            let fetcher = match matches.value_of("group") {
                Some(raw) => YahooFetcher::for_group(YahooGroup::parse(raw)?, config.request_timeout)?,
                None => YahooFetcher::new("", config.request_timeout)?,
            };
            Arc::new(fetcher)
        }
        "file" => {
            let path = matches
                .value_of("file")
                .context("--source file needs --file <FILE>")?;
            Arc::new(SpreadsheetFetcher::new(path))
        }
        other => bail!("Unknown source: {}", other),
    };
    Ok(fetcher)
}

fn parse_codes(matches: &ArgMatches) -> Option<Vec<String>> {
    matches.value_of("codes").map(|raw| {
        raw.split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    })
}

fn open_store(matches: &ArgMatches, config: &Config) -> Result<Arc<dyn DocumentStore>> {
    if matches.is_present("dry-run") {
        info!("Dry run: nothing will be persisted");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(ArrowStore::open(&config.data_dir)?))
    }
}

fn report(outcome: &RunOutcome) -> i32 {
    for skipped in outcome.skipped() {
        warn!("skipped {:?}: [{}] {}", skipped.code, skipped.error.category(), skipped.error);
    }
    match outcome {
        RunOutcome::Written { report, skipped } => {
            info!(
                "{} records written to {} in {} chunks, {} skipped",
                report.written,
                report.target,
                report.chunks,
                skipped.len() + report.skipped
            );
            0
        }
        RunOutcome::NoOp { reason, .. } => {
            warn!("No snapshot written: {}", reason);
            EXIT_NOOP
        }
    }
}

fn to_config_error(e: anyhow::Error) -> SnapshotError {
    SnapshotError::ConfigError(format!("{:#}", e))
}

async fn run() -> Result<i32> {
    let app = App::new("market_snapshot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fetch market prices and upsert dated snapshots")
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory of the Arrow document store")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("chunk-size")
                .long("chunk-size")
                .value_name("N")
                .help("Writes per committed batch")
                .takes_value(true),
        );

    // 在开发模式下添加调试参数
    #[cfg(debug_assertions)]
    let app = app
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .help("Enable debug mode")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("debug-limit")
                .long("debug-limit")
                .help("Limit the number of rows to process in debug mode")
                .takes_value(true)
                .default_value("10"),
        );

    let app = app
        .subcommand(
            source_args(SubCommand::with_name("snapshot").about("Write today's price snapshot"))
                .arg(
                    Arg::with_name("intraday")
                        .long("intraday")
                        .help("Key the snapshot by the current HH:MM as well as the date")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("time")
                        .long("time")
                        .value_name("HH:MM")
                        .help("Explicit intraday time key")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("metadata")
                        .long("metadata")
                        .value_name("FILE")
                        .help("JSON file with name/size/holder_count per code")
                        .takes_value(true),
                ),
        )
        .subcommand(
            source_args(SubCommand::with_name("history").about("Write one year of closes per instrument"))
                .arg(
                    Arg::with_name("days")
                        .long("days")
                        .value_name("DAYS")
                        .help("Days of history to fetch")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("prefix")
                        .long("prefix")
                        .value_name("PREFIX")
                        .help("Document id prefix (FUND, BIST, US, CRYPTO, FX); defaults to the --group prefix")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("asset-type")
                        .long("asset-type")
                        .value_name("TYPE")
                        .help("Asset type stored with each document; defaults to the --group type")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("explore")
                .about("Print a stored snapshot")
                .arg(
                    Arg::with_name("date")
                        .short('d')
                        .long("date")
                        .value_name("DATE")
                        .help("Snapshot date (YYYY-MM-DD)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("time")
                        .long("time")
                        .value_name("HH:MM")
                        .help("Intraday snapshot time")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("code")
                        .short('s')
                        .long("code")
                        .value_name("CODE")
                        .help("Only show codes containing this text")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("limit")
                        .short('l')
                        .long("limit")
                        .value_name("LIMIT")
                        .help("Limit the number of records to display")
                        .takes_value(true)
                        .default_value("20"),
                ),
        );

    let matches = app.get_matches();

    let mut config = Config::from_env()?;
    if let Some(dir) = matches.value_of("data-dir") {
        config = config.with_data_dir(dir);
    }
    if let Some(size) = matches.value_of("chunk-size") {
        let size = size
            .parse::<usize>()
            .map_err(|e| SnapshotError::ConfigError(format!("--chunk-size: {}", e)))?;
        config = config.with_chunk_size(size);
    }

    #[cfg(debug_assertions)]
    {
        let limit = matches
            .value_of("debug-limit")
            .unwrap_or("10")
            .parse::<usize>()
            .unwrap_or(10);
        config = config
            .with_debug_mode(matches.is_present("debug"))
            .with_debug_record_limit(limit);
    }

    config.validate(STORE_BATCH_HARD_CAP)?;
    let (today, now_time) = util::local_date_time(chrono::Utc::now(), config.timezone);

    if let Some(matches) = matches.subcommand_matches("snapshot") {
        let date = match matches.value_of("date") {
            Some(raw) => util::parse_date_arg(raw)?,
            None => today,
        };
        let key = match matches.value_of("time") {
            Some(raw) => SnapshotKey::intraday(&config.snapshot_collection, &date, &util::parse_time_arg(raw)?),
            None if matches.is_present("intraday") => {
                SnapshotKey::intraday(&config.snapshot_collection, &date, &now_time)
            }
            None => SnapshotKey::daily(&config.snapshot_collection, &date),
        };
        let range = DateRange::lookback(date, config.lookback_days);
        let codes = parse_codes(matches);
        let fetcher = build_fetcher(matches, &config).map_err(to_config_error)?;
        let metadata = match matches.value_of("metadata") {
            Some(path) => util::load_metadata_file(std::path::Path::new(path))
                .map_err(|e| SnapshotError::ConfigError(format!("--metadata {}: {}", path, e)))?,
            None => Default::default(),
        };

        let store = open_store(matches, &config)?;
        let pipeline = SnapshotPipeline::new(config, fetcher, store)?.with_metadata(metadata);
        let outcome = pipeline.run_snapshot(key, &range, codes.as_deref()).await?;
        Ok(report(&outcome))
    } else if let Some(matches) = matches.subcommand_matches("history") {
        let end = match matches.value_of("date") {
            Some(raw) => util::parse_date_arg(raw)?,
            None => today,
        };
        let days = match matches.value_of("days") {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| SnapshotError::ConfigError(format!("--days: {}", e)))?,
            None => config.history_days,
        };
        let group = matches.value_of("group").map(YahooGroup::parse).transpose()?;
        let kind = HistoryKind::new(
            matches
                .value_of("prefix")
                .unwrap_or_else(|| group.map_or("FUND", |g| g.prefix())),
            matches
                .value_of("asset-type")
                .unwrap_or_else(|| group.map_or("fund", |g| g.asset_type())),
            &HistoryKind::period_label(days),
        );
        let range = DateRange::lookback(end, days);
        let codes = parse_codes(matches);
        let fetcher = build_fetcher(matches, &config).map_err(to_config_error)?;

        let store = open_store(matches, &config)?;
        let pipeline = SnapshotPipeline::new(config, fetcher, store)?;
        let outcome = pipeline.run_history(&kind, &range, codes.as_deref()).await?;
        Ok(report(&outcome))
    } else if let Some(matches) = matches.subcommand_matches("explore") {
        let date = match matches.value_of("date") {
            Some(raw) => util::parse_date_arg(raw)?,
            None => today,
        };
        let key = match matches.value_of("time") {
            Some(raw) => SnapshotKey::intraday(&config.snapshot_collection, &date, &util::parse_time_arg(raw)?),
            None => SnapshotKey::daily(&config.snapshot_collection, &date),
        };
        let limit = matches
            .value_of("limit")
            .unwrap_or("20")
            .parse::<usize>()
            .unwrap_or(20);
        let code_filter = matches.value_of("code").map(|c| c.to_uppercase());

        let store = ArrowStore::open(&config.data_dir)?;
        let docs = store.read_collection(&SnapshotWriter::records_collection(&key)?).await?;
        info!("Found {} records in {}", docs.len(), key);

        info!("{:<12} {:>14} {:>10} {:<40}", "Code", "Price", "Change%", "Name");
        info!("{:-<80}", "");
        let shown = docs
            .iter()
            .filter(|(id, _)| code_filter.as_ref().map_or(true, |f| id.contains(f.as_str())))
            .take(limit);
        for (id, doc) in shown {
            info!(
                "{:<12} {:>14.6} {:>10.2} {:<40}",
                id,
                doc.get("price").and_then(|v| v.as_f64()).unwrap_or_default(),
                doc.get("change_percent").and_then(|v| v.as_f64()).unwrap_or_default(),
                doc.get("name").and_then(|v| v.as_str()).unwrap_or_default()
            );
        }
        if docs.len() > limit {
            info!("... and {} more records", docs.len() - limit);
        }
        Ok(0)
    } else {
        info!("No command specified. Use --help for usage information.");
        Ok(0)
    }
}

#[tokio::main]
async fn main() {
    // Initialize logger
    env_logger::init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            let category: ErrorCategory = e.category();
            error!("[{}] {}", category, e);
            category.exit_code()
        }
    };
    std::process::exit(code);
}
