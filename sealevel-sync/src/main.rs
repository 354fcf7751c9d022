use std::sync::atomic::Ordering;
use std::time::Duration;

use sensorthings_core::{Backoff, ClientConfig, RetryPolicy, SensorThingsClient};

use sealevel_sync::config::SyncConfig;
use sealevel_sync::store::SensorStore;
use sealevel_sync::sync::engine::{StreamStatus, SyncEngine, SyncOptions};
use sealevel_sync::sync::timestamp::CanonicalTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliCommand {
    Check { stream_id: i64 },
    Sync { stream_id: i64 },
    SyncAll,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CliArgs {
    command: CliCommand,
    options: SyncOptions,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let command = match args.next().as_deref() {
        Some("check") => {
            let stream_id = parse_stream_id(args.next())?;
            CliCommand::Check { stream_id }
        }
        Some("sync") => {
            let stream_id = parse_stream_id(args.next())?;
            CliCommand::Sync { stream_id }
        }
        Some("sync-all") => CliCommand::SyncAll,
        Some("--help") | Some("-h") | None => CliCommand::Help,
        Some(other) => anyhow::bail!("unknown command: {other}"),
    };

    let mut options = SyncOptions::default();
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--start" => {
                let raw = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--start needs a timestamp"))?;
                options.start_time = Some(CanonicalTimestamp::parse(&raw)?);
            }
            "--max" => {
                let raw = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--max needs a number"))?;
                options.max_records = Some(raw.parse()?);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(CliArgs { command, options })
}

fn parse_stream_id(arg: Option<String>) -> anyhow::Result<i64> {
    let raw = arg.ok_or_else(|| anyhow::anyhow!("missing datastream id"))?;
    Ok(raw.parse()?)
}

fn print_usage() {
    println!("Usage: sealevel-sync <command> [options]");
    println!();
    println!("Commands:");
    println!("  check <id>      Compare a datastream's remote and local extent");
    println!("  sync <id>       Bring one datastream up to date");
    println!("  sync-all        Discover every datastream and sync each one");
    println!();
    println!("Options:");
    println!("  --start <ts>    Sync from this time (inclusive) instead of resuming");
    println!("  --max <n>       Stop after writing this many observations");
}

fn fmt_stamp(ts: Option<CanonicalTimestamp>) -> String {
    match ts {
        Some(ts) => ts.to_string(),
        None => "-".to_string(),
    }
}

fn print_status(stream_id: i64, status: &StreamStatus) {
    println!("datastream {stream_id}");
    println!(
        "  remote: {} .. {}",
        fmt_stamp(status.oldest_remote),
        fmt_stamp(status.newest_remote)
    );
    println!(
        "  local:  {} .. {}",
        fmt_stamp(status.oldest_local),
        fmt_stamp(status.newest_local)
    );
    if status.up_to_date {
        println!("  up to date");
    } else if status.new_count < 0 {
        println!("  behind, server will not say by how much");
    } else {
        println!("  behind by {} observations", status.new_count);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    if cli.command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let config = SyncConfig::from_env()?;
    let client = SensorThingsClient::with_config(
        &config.base_url,
        ClientConfig {
            timeout: config.http_timeout,
            retry: RetryPolicy::new(
                config.retry_attempts,
                Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
            ),
        },
    )?;
    let store = match &config.database_path {
        Some(path) => SensorStore::new_at(path).await?,
        None => SensorStore::new_default().await?,
    };
    let engine = SyncEngine::new(client, store)
        .with_page_size(config.page_size)
        .with_batch_size(config.batch_size);

    let stop = engine.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[sealevel-sync] interrupt received, finishing the current batch");
            stop.store(true, Ordering::Relaxed);
        }
    });

    match cli.command {
        CliCommand::Check { stream_id } => {
            let status = engine.check_stream(stream_id).await?;
            print_status(stream_id, &status);
        }
        CliCommand::Sync { stream_id } => {
            let written = engine.sync_stream(stream_id, &cli.options).await?;
            println!("datastream {stream_id}: {written} observations written");
        }
        CliCommand::SyncAll => {
            let outcomes = engine.sync_all(&cli.options).await?;
            let mut written = 0u64;
            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(count) => {
                        written += count;
                        println!("datastream {}: {count} written", outcome.datastream_id);
                    }
                    Err(err) => {
                        failed += 1;
                        println!("datastream {}: failed: {err}", outcome.datastream_id);
                    }
                }
            }
            println!(
                "{} streams, {written} observations written, {failed} failed",
                outcomes.len()
            );
        }
        CliCommand::Help => {}
    }
    Ok(())
}
