use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use port_ledger::monitor::{self, MonitorRequest};
use port_ledger::ports::PortRange;
use port_ledger::resolver::SystemResolver;
use port_ledger::scanner::Scanner;
use port_ledger::sink;
use port_ledger::clock;
use port_ledger::types::{ScanOutcome, ScanReport, ScanRequest};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// port-ledger — concurrent TCP connect scanner that keeps a CSV ledger of open ports.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-ledger",
    version,
    about = "Concurrent TCP connect scanner that keeps a CSV ledger of open ports.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Scan a port range on one host and append open ports to the store.
    Scan(ScanArgs),
    /// Poll a domain's address and record every change.
    Monitor(MonitorArgs),
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Hostname or literal IP address to scan.
    #[arg(env = "PORT_LEDGER_HOST")]
    host: String,

    /// Port or inclusive range, e.g. 22 or 1-1024.
    #[arg(long, env = "PORT_LEDGER_PORTS", default_value = "1-65535")]
    ports: PortRange,

    /// Max concurrent TCP connect attempts. 1 scans sequentially.
    #[arg(long, env = "PORT_LEDGER_CONCURRENCY", default_value_t = 100)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", env = "PORT_LEDGER_TIMEOUT_MS", default_value_t = 1000)]
    timeout_ms: u64,

    /// Stop the whole scan after this many seconds, keeping partial results.
    #[arg(long = "budget-secs", env = "PORT_LEDGER_BUDGET_SECS")]
    budget_secs: Option<u64>,

    /// CSV record store that open ports are appended to.
    #[arg(long, env = "PORT_LEDGER_STORE", default_value = "open_ports.csv")]
    store: PathBuf,

    /// Also write the report as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct MonitorArgs {
    /// Domain to watch.
    #[arg(env = "PORT_LEDGER_DOMAIN")]
    domain: String,

    /// Seconds between polls.
    #[arg(long = "interval-secs", env = "PORT_LEDGER_INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    /// Stop after this many polls (runs until Ctrl+C if omitted).
    #[arg(long = "max-polls")]
    max_polls: Option<u64>,

    /// CSV store that address changes are appended to.
    #[arg(long, env = "PORT_LEDGER_MONITOR_STORE", default_value = "ips_monitor.csv")]
    store: PathBuf,
}

fn main() -> Result<()> {
    // The local offset is only readable while the process is single-threaded.
    clock::init_local_offset();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Ctrl-C cancels whatever is running; partial results are still kept.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_ctrlc.cancel();
        }
    });

    match cli.command {
        Command::Scan(args) => run_scan(args, cancel).await,
        Command::Monitor(args) => run_monitor(args, cancel).await,
    }
}

async fn run_scan(args: ScanArgs, cancel: CancellationToken) -> Result<()> {
    let mut request = ScanRequest::new(
        args.host.as_str(),
        args.ports,
        args.concurrency,
        Duration::from_millis(args.timeout_ms),
    )?;
    if let Some(secs) = args.budget_secs {
        request = request.with_budget(Duration::from_secs(secs))?;
    }

    println!("port-ledger configuration:");
    println!("  host         : {}", request.host());
    println!("  ports        : {}", request.ports());
    println!("  concurrency  : {}", request.max_concurrency());
    println!("  timeout_ms   : {}", args.timeout_ms);
    println!(
        "  budget       : {}",
        request
            .budget()
            .map(|b| format!("{}s", b.as_secs()))
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  store        : {}", args.store.display());

    let (tx, mut rx) = mpsc::unbounded_channel::<ScanOutcome>();
    let printer = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            if outcome.is_open() {
                println!("open: {}", outcome.target);
            }
        }
    });

    let scanner = Scanner::new().with_events(tx);
    let report = scanner
        .scan_with_cancel(&request, cancel)
        .await
        .with_context(|| format!("scan of {} failed", request.host()))?;
    drop(scanner);
    let _ = printer.await;

    print_results_table(&report);

    if let Some(path) = args.output.as_deref() {
        if let Err(e) = write_results_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    let store = args.store.clone();
    let rows = tokio::task::spawn_blocking(move || sink::append(&report, &store))
        .await?
        .map_err(|e| {
            let stage = e.stage();
            anyhow::Error::new(e).context(format!(
                "scan finished but the {stage} stage failed for {}",
                args.store.display()
            ))
        })?;
    println!("Appended {} row(s) to {}", rows, args.store.display());
    Ok(())
}

async fn run_monitor(args: MonitorArgs, cancel: CancellationToken) -> Result<()> {
    let mut request = MonitorRequest::new(args.domain, Duration::from_secs(args.interval_secs))?;
    if let Some(polls) = args.max_polls {
        request = request.with_max_polls(polls);
    }
    println!(
        "Monitoring {} every {}s (store: {}, Ctrl+C to stop)",
        request.domain,
        args.interval_secs,
        args.store.display()
    );
    let summary = monitor::monitor(&SystemResolver, &request, &args.store, cancel)
        .await
        .with_context(|| format!("monitoring {} failed", request.domain))?;
    println!(
        "{}: {} poll(s), {} failed, {} record(s) written, last address {}",
        summary.domain, summary.polls, summary.failed_polls, summary.changes_recorded, summary.last_ip
    );
    Ok(())
}

fn print_results_table(report: &ScanReport) {
    let host_w = 4usize.max(report.host.len());
    let port_w = 5usize;
    let lat_w = "latency_ms".len();
    let seen_w = "observed_at".len().max(20);

    println!(
        "\nOpen ports: {} (scanned: {}/{}, closed: {}, errored: {}, {:?})",
        report.open_count(),
        report.scanned_done,
        report.scanned_total,
        report.closed_count,
        report.errored_count,
        report.termination
    );
    println!(
        "{:<host_w$}  {:>port_w$}  {:>lat_w$}  {:<seen_w$}",
        "host",
        "port",
        "latency_ms",
        "observed_at",
    );
    println!(
        "{:-<host_w$}  {:-<port_w$}  {:-<lat_w$}  {:-<seen_w$}",
        "", "", "", "",
    );
    for o in &report.open {
        println!(
            "{:<host_w$}  {:>port_w$}  {:>lat_w$}  {} {}",
            o.target.host(),
            o.port(),
            o.elapsed_ms,
            sink::format_date(o.observed_at),
            sink::format_time(o.observed_at),
        );
    }
}

fn write_results_json(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
