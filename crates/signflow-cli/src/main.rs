//! signflow operator CLI

mod simulate;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use signflow_core::{FilePurgeQueue, KeyManager, KeySweeper, PurgeQueue, SignflowConfig, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("signflow")
        .version(signflow_core::VERSION)
        .about("Document signing workflow engine")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("sweep")
                .about("Purge keys whose scheduled deletion is due")
                .arg(
                    Arg::new("queue")
                        .long("queue")
                        .value_parser(value_parser!(PathBuf))
                        .help("Purge queue file; defaults to keys.purge_queue_path and may be shared with a running engine"),
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Run a single sweep and exit"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded concurrent signing workload")
                .arg(
                    Arg::new("documents")
                        .long("documents")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Number of documents"),
                )
                .arg(
                    Arg::new("fields")
                        .long("fields")
                        .default_value("5")
                        .value_parser(value_parser!(u32).range(1..))
                        .help("Fields per document"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print the effective settings")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<SignflowConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => SignflowConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(SignflowConfig::default()),
    }
}

async fn sweep(config: &SignflowConfig, queue_path: &Path, once: bool) -> anyhow::Result<()> {
    let queue = Arc::new(
        FilePurgeQueue::open(queue_path)
            .with_context(|| format!("opening purge queue {}", queue_path.display()))?,
    );
    tracing::info!(path = %queue_path.display(), pending = queue.pending().len(), "purge queue opened");
    let keys = Arc::new(KeyManager::with_parts(queue.clone(), Arc::new(SystemClock)));

    if once {
        let report = keys.sweep();
        let summary = serde_json::json!({
            "purged": report.purged.len(),
            "orphaned": report.orphaned.len(),
            "deferred": report.deferred.len(),
            "pending": queue.pending().len(),
        });
        println!("{summary}");
        return Ok(());
    }

    let handle = KeySweeper::spawn(keys, config.sweep_interval());
    tracing::info!(interval_ms = config.keys.sweep_interval_ms, "sweeper running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let purged = handle.shutdown().await;
    tracing::info!(purged, remaining = queue.pending().len(), "sweeper stopped");
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = SignflowConfig::load(path)?;
    print!("{}", toml::to_string_pretty(&config).context("rendering config")?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("sweep", args)) => {
            let config = load_config(args)?;
            let queue_path = args
                .get_one::<PathBuf>("queue")
                .cloned()
                .or_else(|| config.keys.purge_queue_path.clone())
                .context("no purge queue: pass --queue or set keys.purge_queue_path")?;
            sweep(&config, &queue_path, args.get_flag("once")).await
        }
        Some(("simulate", args)) => {
            let config = load_config(args)?;
            let sim = simulate::Simulation {
                documents: *args.get_one::<usize>("documents").context("documents")?,
                fields: *args.get_one::<u32>("fields").context("fields")?,
                seed: *args.get_one::<u64>("seed").context("seed")?,
            };
            tracing::info!(?sim, "starting simulation");
            let report = simulate::run(sim, config).await?;
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            Ok(())
        }
        Some(("check-config", args)) => {
            let path = args.get_one::<PathBuf>("path").context("path")?;
            check_config(path)
        }
        _ => Ok(()),
    }
}
