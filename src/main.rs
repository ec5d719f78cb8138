//! Binary entrypoint for the syrupnet CLI.
//!
//! Commands:
//! - `start` - run the coordinator (discovery, health, ingestion, auto-dispatch) until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - registered devices, persisted transmission status and counters
//! - `scan [--prefix <a.b.c>]` - one discovery pass, printing every device that answered
//! - `register` / `forget` / `connect` / `disconnect` - manage identity bindings
//! - `ingest <file>` - parse one prescription file and print it as JSON
//! - `dispense <record-id> [--retry-failed] [--item <code>]...` - one-shot dispatch
//! - `send <address> <amount>` - manual dispense to one device
//! - `reset-status <record-id>`, `set-path <dir>`, `auto <on|off>` - state edits
//! - `backup`, `reset` - snapshot or wipe the state files
//!
//! See the library crate docs for module-level details: `syrupnet::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use syrupnet::config::Config;
use syrupnet::device::HttpTransport;
use syrupnet::fleet::Fleet;
use syrupnet::metrics;
use syrupnet::network::{connect_by_address, scan_subnet, SubnetPrefix};
use syrupnet::prescription::Ingestor;
use syrupnet::service::Coordinator;
use syrupnet::storage::backup::{BackupManager, BackupReason};
use syrupnet::storage::{Storage, TransmissionStatus};

#[derive(Parser)]
#[command(name = "syrupnet")]
#[command(about = "Coordinator for networked liquid-medicine dispensers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator loop
    Start,
    /// Write a default configuration file
    Init,
    /// Show devices, transmission status and counters
    Status,
    /// Run one discovery pass
    Scan {
        /// Subnet prefix to scan, e.g. 192.168.1 (defaults to config, then the local subnet)
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Bind a dispenser to an item code
    Register {
        /// Hardware address in any separator style
        address: String,
        nickname: String,
        item_code: String,
        /// Network address the device was last seen at
        #[arg(long)]
        network_address: Option<String>,
    },
    /// Remove a binding
    Forget { address: String },
    /// Probe a registered device at its last known address and clear a manual disconnect
    Connect { address: String },
    /// Keep discovery from reconnecting a device until it is connected again by hand
    Disconnect { address: String },
    /// Parse one prescription file and print it as JSON
    Ingest { file: PathBuf },
    /// Scan, then dispatch one record from the prescription directory
    Dispense {
        record_id: String,
        /// Only resend items currently marked failed
        #[arg(long, conflicts_with = "item")]
        retry_failed: bool,
        /// Resend these item codes regardless of their status
        #[arg(long = "item")]
        item: Vec<String>,
    },
    /// Send one manual dispense command
    Send { address: String, amount: u32 },
    /// Put a record and its items back to pending
    ResetStatus { record_id: String },
    /// Persist the watched prescription directory
    SetPath { dir: PathBuf },
    /// Toggle auto-dispatch and optionally change the per-item volume limit
    Auto {
        #[arg(value_enum)]
        state: Switch,
        #[arg(long)]
        max_volume: Option<u32>,
    },
    /// Snapshot the state files into a tar.gz archive
    Backup {
        #[arg(long)]
        name: Option<String>,
    },
    /// Back up, then delete every state file
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(config) => config,
        Err(e) if !Path::new(&cli.config).exists() => {
            init_logging(&None, cli.verbose);
            warn!("{}; using defaults", e);
            Config::default()
        }
        Err(e) => return Err(e),
    };
    init_logging(&Some(config.clone()), cli.verbose);
    config.validate()?;
    let storage = Storage::open(&config.storage.data_dir)?;

    match cli.command {
        Commands::Init => {}
        Commands::Start => {
            info!("Starting syrupnet v{}", env!("CARGO_PKG_VERSION"));
            let transport = http_transport(&config)?;
            let mut coordinator = Coordinator::new(config, storage, transport)?;
            coordinator.run().await?;
        }
        Commands::Status => show_status(&config, &storage)?,
        Commands::Scan { prefix } => {
            let prefix: SubnetPrefix = match prefix.as_deref().map(str::trim) {
                Some(p) if !p.is_empty() => p.parse().map_err(|e| anyhow!("{}", e))?,
                _ if !config.network.prefix.is_empty() => config
                    .network
                    .prefix
                    .parse()
                    .map_err(|e| anyhow!("network.prefix: {}", e))?,
                _ => SubnetPrefix::detect()
                    .ok_or_else(|| anyhow!("Could not determine the local subnet; pass --prefix"))?,
            };
            let transport = http_transport(&config)?;
            println!("Scanning {}.0/24 ...", prefix);
            let hits = scan_subnet(transport.as_ref(), &prefix).await;
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            let state = fleet.lock();
            for (address, hit) in &hits {
                let binding = state
                    .registry
                    .get(address)
                    .map(|d| format!("{} ({})", d.nickname, d.item_code))
                    .unwrap_or_else(|| "unregistered".to_string());
                println!("  {:<15} {}  {:<8} {}", hit.network_address, address, hit.status, binding);
            }
            println!("{} device(s) answered", hits.len());
        }
        Commands::Register {
            address,
            nickname,
            item_code,
            network_address,
        } => {
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            let identity = fleet.register(&address, &nickname, &item_code, network_address.as_deref())?;
            println!(
                "Registered {} as '{}' for item {}",
                identity.normalized_address, identity.nickname, identity.item_code
            );
        }
        Commands::Forget { address } => {
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            let identity = fleet.forget(&address)?;
            println!("Forgot {} ('{}')", identity.normalized_address, identity.nickname);
        }
        Commands::Connect { address } => {
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            let transport = http_transport(&config)?;
            let network_address = connect_by_address(&fleet, transport.as_ref(), &address, false).await?;
            println!("{} answered at {}", address, network_address);
        }
        Commands::Disconnect { address } => {
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            fleet.disconnect(&address);
            println!("{} will not be reconnected automatically", address);
        }
        Commands::Ingest { file } => {
            let mut ingestor = Ingestor::from_config(&config.ingest)?;
            let record = ingestor
                .ingest(&file)
                .await?
                .ok_or_else(|| anyhow!("{} was not ingested", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Dispense {
            record_id,
            retry_failed,
            item,
        } => {
            let transport = http_transport(&config)?;
            let mut coordinator = Coordinator::new(config, storage, transport)?;
            coordinator.startup().await;
            if coordinator.scan_once().await.is_none() {
                warn!("No subnet prefix available; dispatching to devices connected at startup only");
            }
            let report = if retry_failed || !item.is_empty() {
                let record = coordinator.load_record(&record_id).await?;
                if retry_failed {
                    coordinator.dispenser().retry_failed(&record).await
                } else {
                    coordinator.dispenser().retry_selected(&record, &item).await
                }
            } else {
                coordinator.dispense_record_id(&record_id).await?
            };
            print!("{}", report);
        }
        Commands::Send { address, amount } => {
            let transport = http_transport(&config)?;
            let coordinator = Coordinator::new(config, storage, transport)?;
            coordinator.startup().await;
            coordinator.dispenser().dispense_manual(&address, amount).await?;
            println!("Sent {} to {}", amount, address);
        }
        Commands::ResetStatus { record_id } => {
            let fleet = Fleet::load(&storage, config.network.max_reconnect_attempts)?;
            let mut ingestor = Ingestor::from_config(&config.ingest)?;
            let dir = ingest_dir(&config, &storage)?;
            let path = dir.join(format!("{}.{}", record_id, ingestor.format().extension()));
            let record = ingestor
                .ingest(&path)
                .await?
                .ok_or_else(|| anyhow!("{} was not ingested", path.display()))?;
            let mut state = fleet.lock();
            let registered: Vec<(String, bool)> = record
                .items
                .iter()
                .map(|i| (i.code.clone(), state.registry.is_item_registered(&i.code)))
                .collect();
            state
                .statuses
                .reset_record(&record_id, registered.iter().map(|(c, r)| (c.as_str(), *r)));
            println!("{} reset to {}", record_id, TransmissionStatus::Pending);
        }
        Commands::SetPath { dir } => {
            if !dir.is_dir() {
                return Err(anyhow!("{} is not a directory", dir.display()));
            }
            storage.save_ingest_path(&dir)?;
            println!("Watching {}", dir.display());
        }
        Commands::Auto { state, max_volume } => {
            let mut settings = storage.load_auto_dispense(config.dispense.max_volume)?;
            settings.enabled = matches!(state, Switch::On);
            if let Some(max) = max_volume {
                if max == 0 {
                    return Err(anyhow!("--max-volume must be greater than zero"));
                }
                settings.max_volume = max;
            }
            storage.save_auto_dispense(&settings)?;
            println!(
                "Auto-dispatch {} (max volume {})",
                if settings.enabled { "on" } else { "off" },
                settings.max_volume
            );
        }
        Commands::Backup { name } => {
            let mut manager = backup_manager(&config)?;
            let backup = manager.create_backup(name, BackupReason::Manual)?;
            let pruned = manager.prune()?;
            println!("Backup {} ({} file(s), {} bytes)", backup.id, backup.files.len(), backup.size_bytes);
            if !pruned.is_empty() {
                println!("Pruned {} old backup(s)", pruned.len());
            }
        }
        Commands::Reset => {
            let mut manager = backup_manager(&config)?;
            let backup = manager.create_backup(Some("pre-reset".to_string()), BackupReason::PreReset)?;
            let removed = storage.reset_state()?;
            println!("Backed up to {}; removed {} state file(s)", backup.id, removed.len());
        }
    }

    Ok(())
}

fn http_transport(config: &Config) -> Result<Arc<HttpTransport>> {
    Ok(Arc::new(HttpTransport::new(
        config.network.device_port,
        config.network.probe_timeout(),
        config.dispense.request_timeout(),
    )?))
}

fn backup_manager(config: &Config) -> Result<BackupManager> {
    Ok(BackupManager::new(
        PathBuf::from(&config.storage.data_dir),
        PathBuf::from(&config.storage.backup_dir),
        config.storage.max_backups,
    )?)
}

fn ingest_dir(config: &Config, storage: &Storage) -> Result<PathBuf> {
    storage
        .load_ingest_path()?
        .or_else(|| config.ingest.directory.as_ref().map(PathBuf::from))
        .ok_or_else(|| anyhow!("No prescription directory configured (see `syrupnet set-path`)"))
}

fn show_status(config: &Config, storage: &Storage) -> Result<()> {
    let fleet = Fleet::load(storage, config.network.max_reconnect_attempts)?;
    let state = fleet.lock();
    println!("Data directory: {}", storage.data_dir().display());
    match storage.load_ingest_path()? {
        Some(dir) => println!("Prescription directory: {}", dir.display()),
        None => println!("Prescription directory: {}", config.ingest.directory.as_deref().unwrap_or("(not set)")),
    }
    let auto = storage.load_auto_dispense(config.dispense.max_volume)?;
    println!(
        "Auto-dispatch: {} (max volume {})",
        if auto.enabled { "on" } else { "off" },
        auto.max_volume
    );

    println!("\nRegistered devices ({}):", state.registry.len());
    for device in state.registry.iter() {
        println!(
            "  {}  {:<16} {:<10} {}{}",
            device.normalized_address,
            device.nickname,
            device.item_code,
            device.last_known_network_address.as_deref().unwrap_or("-"),
            if state.registry.is_manually_disconnected(&device.normalized_address) {
                "  (disconnected by hand)"
            } else {
                ""
            }
        );
    }

    let records: Vec<_> = state.statuses.records().collect();
    println!("\nRecords ({}):", records.len());
    for (record_id, status) in records {
        println!("  {:<24} {}", record_id, status);
        if let Some(items) = state.statuses.items(record_id) {
            for (code, item) in items {
                print!("    {:<12} {}", code, item.status);
                if let Some(reason) = item.reason {
                    print!(" ({})", reason);
                }
                println!("  sends={}", item.sends);
            }
        }
    }

    let m = metrics::snapshot();
    println!("\nCounters since start: {:?}", m);
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity sets the floor; a more verbose configured level wins.
    let mut level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if let Some(configured) = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
    {
        level = level.max(configured);
    }
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only in the foreground.
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
