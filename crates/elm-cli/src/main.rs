//! elmctl: talk to a vehicle through a Wi-Fi ELM327 adapter.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use elm_obd::{
    AdapterSession, CommandCatalog, CommandKey, ContinuousPoller, DtcDatabase, PollCycle, Transport,
};
use elm_protocol::DtcKind;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use elm_cli::{CliConfig, TcpTransport};

#[derive(Parser)]
#[command(name = "elmctl")]
#[command(author, version, about = "ELM327 OBD-II diagnostics")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ELMCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Adapter address (host:port), overriding the config file
    #[arg(short, long, env = "ELMCTL_ADAPTER")]
    adapter: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and show the negotiated protocol, ECUs and supported PIDs
    Info,

    /// Send one command to the adapter as-is
    Raw {
        /// Command text, e.g. "ATRV" or "0100"
        command: String,
    },

    /// Read one or more commands, e.g. 010C 010D 22F40D
    Pid {
        #[arg(required = true)]
        keys: Vec<String>,

        /// Compose mode 01 PIDs into one request
        #[arg(long)]
        batch: bool,
    },

    /// Poll commands continuously until interrupted
    Watch {
        /// Commands to poll; defaults to the config file's list
        keys: Vec<String>,

        /// Base polling interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<usize>,
    },

    /// Read trouble codes
    Dtc {
        #[arg(long, value_enum, default_value = "stored")]
        kind: CodeList,
    },

    /// Clear trouble codes and reset monitors
    ClearDtc {
        /// Confirm the clear
        #[arg(long)]
        yes: bool,
    },

    /// Read the vehicle identification number
    Vin,
}

#[derive(Clone, Copy, ValueEnum)]
enum CodeList {
    Stored,
    Pending,
    Permanent,
}

impl From<CodeList> for DtcKind {
    fn from(value: CodeList) -> Self {
        match value {
            CodeList::Stored => DtcKind::Stored,
            CodeList::Pending => DtcKind::Pending,
            CodeList::Permanent => DtcKind::Permanent,
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

fn parse_keys(keys: &[String]) -> Result<Vec<CommandKey>> {
    keys.iter()
        .map(|k| k.parse::<CommandKey>().map_err(anyhow::Error::msg))
        .collect()
}

fn print_cycle(json: bool, cycle: &PollCycle) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(cycle)?);
        return Ok(());
    }
    let values: Vec<String> = cycle
        .values
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    println!(
        "{} {} (next in {}ms{})",
        cycle.timestamp.format("%H:%M:%S%.3f"),
        values.join(" "),
        cycle.next_interval.as_millis(),
        if cycle.is_clean() {
            String::new()
        } else {
            format!(", {} failed", cycle.failures.len())
        }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => CliConfig::from_file(path)?,
        None => CliConfig::default(),
    };
    let address = cli.adapter.clone().unwrap_or_else(|| config.adapter.address());
    let transport = Arc::new(TcpTransport::new(address, config.session.command_timeout()));

    if let Commands::Raw { command } = &cli.command {
        transport
            .connect(config.session.connect_timeout())
            .await
            .with_context(|| format!("failed to reach adapter at {}", transport.address()))?;
        let lines = transport.send(command).await?;
        transport.disconnect().await;
        return print(cli.json, &lines);
    }

    let catalog = Arc::new(CommandCatalog::with_vendor_pids(&config.vendor_pids));
    let mut session = AdapterSession::new(transport.clone(), config.session.clone()).with_catalog(catalog);
    if let Some(path) = &config.dtc_table {
        let table = DtcDatabase::from_file(path)
            .with_context(|| format!("failed to load trouble-code table {}", path.display()))?;
        session = session.with_dtc_database(Arc::new(table));
    }
    let session = Arc::new(session);
    session
        .establish()
        .await
        .with_context(|| format!("failed to connect through adapter at {}", transport.address()))?;

    let result = run_command(&cli, &config, &session).await;
    session.stop_connection().await;
    result
}

async fn run_command(cli: &Cli, config: &CliConfig, session: &Arc<AdapterSession>) -> Result<()> {
    match &cli.command {
        Commands::Raw { .. } => bail!("raw commands are sent without a vehicle session"),
        Commands::Info => {
            let vehicle = session.vehicle().context("no vehicle profile")?;
            print(cli.json, &vehicle)?;
            match session.send_raw("ATRV").await {
                Ok(lines) => println!("battery: {}", lines.join(" ")),
                Err(e) => tracing::warn!(error = %e, "battery voltage unavailable"),
            }
        }
        Commands::Pid { keys, batch } => {
            let keys = parse_keys(keys)?;
            if *batch {
                let pids = keys
                    .iter()
                    .map(|k| {
                        u8::try_from(k.pid)
                            .ok()
                            .filter(|_| k.service == 0x01)
                            .with_context(|| format!("{k} is not a mode 01 PID"))
                    })
                    .collect::<Result<Vec<u8>>>()?;
                for response in session.query_batch(&pids).await? {
                    print(cli.json, &response)?;
                }
            } else {
                for key in keys {
                    match session.query(key).await {
                        Ok(response) => print(cli.json, &response)?,
                        Err(e) => eprintln!("{key}: {e}"),
                    }
                }
            }
        }
        Commands::Watch {
            keys,
            interval_ms,
            cycles,
        } => {
            let mut poller_config = config.poller.clone();
            if !keys.is_empty() {
                poller_config.commands = parse_keys(keys)?;
            }
            if let Some(ms) = interval_ms {
                poller_config.base_interval_ms = *ms;
            }
            watch_loop(cli.json, session, poller_config, *cycles).await?;
        }
        Commands::Dtc { kind } => {
            let codes = session.read_trouble_codes((*kind).into()).await?;
            if cli.json {
                print(true, &codes)?;
            } else if codes.values().all(Vec::is_empty) {
                println!("no trouble codes");
            } else {
                for (ecu, list) in &codes {
                    for code in list {
                        let title = code.metadata.as_ref().map(|m| m.title.as_str()).unwrap_or("");
                        println!("0x{ecu:X} {} {:?} {title}", code.code, code.severity);
                    }
                }
            }
        }
        Commands::ClearDtc { yes } => {
            if !yes {
                bail!("clearing trouble codes also resets readiness monitors; pass --yes to confirm");
            }
            let ecus = session.clear_trouble_codes().await?;
            println!("cleared by {} ECU(s)", ecus.len());
        }
        Commands::Vin => {
            let vin = session.read_vin().await?;
            println!("{vin}");
        }
    }
    Ok(())
}

async fn watch_loop(
    json: bool,
    session: &Arc<AdapterSession>,
    config: elm_obd::PollerConfig,
    cycles: Option<usize>,
) -> Result<()> {
    let poller = Arc::new(ContinuousPoller::new(Arc::clone(session), config));
    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.run(tx, shutdown_rx).await })
    };

    let mut seen = 0usize;
    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(Ok(cycle)) => {
                        print_cycle(json, &cycle)?;
                        seen += 1;
                        if cycles.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(e.into());
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    // Poller may have exited on its own.
    let _ = shutdown_tx.send(true);
    drop(rx);
    task.await.context("poller task failed")?;
    Ok(())
}
