use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime, Time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use recon_sched::config::Config;
use recon_sched::materializer::{self, Horizon};
use recon_sched::seed::Seed;
use recon_sched::server::{self, AppState};
use recon_sched::store::{MemoryStore, ScheduleStore};
use recon_sched::scheduler;
use recon_sched::targets;
use recon_sched::types::ScheduledScan;

/// recon-sched: recurring nmap/masscan scan scheduler for a fleet of scan agents.
#[derive(Debug, Parser)]
#[command(
    name = "recon-sched",
    version,
    about = "Recurring nmap/masscan scan scheduler: materializes schedules and hands them out to scan agents.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent API and the materialize/stale-sweep loop.
    Serve {
        /// JSON config file. Defaults to ./recon-sched.json when present.
        #[arg(long, env = "RECON_SCHED_CONFIG")]
        config: Option<PathBuf>,

        /// Override the listen address from the config.
        #[arg(long)]
        bind: Option<String>,

        /// Override the seed file from the config.
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Validate and canonicalize a target expression.
    CheckTargets {
        /// Space-delimited IPs, CIDRs, IPv4 ranges and host names.
        targets: String,

        /// Targets to subtract.
        #[arg(long)]
        exclude: Option<String>,

        /// Reject loopback, link-local and RFC 1918 style addresses.
        #[arg(long = "deny-private", default_value_t = false)]
        deny_private: bool,

        /// Print the full extraction as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Load a seed file into memory and show what would be scheduled.
    Preview {
        seed: PathBuf,

        /// First UTC day of the preview. Defaults to today.
        #[arg(long, value_parser = parse_date)]
        from: Option<Date>,

        /// Number of days to materialize.
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Write the scheduled scans as pretty JSON to this path (optional).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_date(s: &str) -> std::result::Result<Date, String> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(s, format).map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, bind, seed } => serve(config.as_deref(), bind, seed).await,
        Command::CheckTargets {
            targets,
            exclude,
            deny_private,
            json,
        } => check_targets(&targets, exclude.as_deref(), !deny_private, json),
        Command::Preview {
            seed,
            from,
            days,
            output,
        } => preview(&seed, from, days, output.as_deref()),
    }
}

async fn serve(config: Option<&Path>, bind: Option<String>, seed: Option<PathBuf>) -> Result<()> {
    let mut cfg = Config::load(config)?;
    if let Some(bind) = bind {
        cfg.bind = bind;
    }
    if seed.is_some() {
        cfg.seed = seed;
    }

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = cfg.seed.as_deref() {
        Seed::from_path(path)?
            .apply(&*store, cfg.allow_private_ips)
            .with_context(|| format!("failed to load seed file: {}", path.display()))?;
    } else {
        warn!("no seed file configured; nothing will be scheduled");
    }

    let cfg = Arc::new(cfg);
    let store: Arc<dyn ScheduleStore> = store;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        ctrl_c.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;

    let loop_handle = tokio::spawn(scheduler::run(store.clone(), cfg.clone(), cancel.clone()));
    let served = server::serve(listener, AppState::new(store, cfg), cancel.clone()).await;

    cancel.cancel();
    loop_handle.await.context("scheduler task panicked")?;
    served
}

fn check_targets(expression: &str, exclude: Option<&str>, allow_private_ips: bool, json: bool) -> Result<()> {
    let extraction = targets::extract(expression, exclude, allow_private_ips);

    if json {
        println!("{}", serde_json::to_string_pretty(&extraction)?);
    } else {
        println!("targets      : {}", extraction.canonical);
        println!("excluded     : {}", extraction.excluded_canonical);
        println!("addresses    : {}", extraction.address_count());
        if !extraction.invalid.is_empty() {
            println!("invalid      : {}", extraction.invalid.join(","));
        }
        if !extraction.invalid_excluded.is_empty() {
            println!("invalid excl : {}", extraction.invalid_excluded.join(","));
        }
    }

    extraction.into_result()?;
    Ok(())
}

fn preview(seed: &Path, from: Option<Date>, days: u32, output: Option<&Path>) -> Result<()> {
    if days == 0 {
        bail!("--days must be at least 1");
    }
    let store = MemoryStore::new();
    let summary = Seed::from_path(seed)?.apply(&store, true)?;
    println!(
        "Loaded {} agents, {} scan commands, {} sites, {} scans",
        summary.agents, summary.scan_commands, summary.sites, summary.scans
    );

    let from = from.unwrap_or_else(|| OffsetDateTime::now_utc().date());
    let start = from.with_time(Time::MIDNIGHT).assume_utc();
    let horizon = Horizon::starting_at(start, Duration::days(days.into()))?;
    let report = materializer::materialize_all(&store, &horizon, true)?;

    let mut rows = report.created;
    rows.sort_by_key(|r| (r.start_datetime, r.id));
    print_schedule_table(&rows);
    for rejected in &report.rejected {
        eprintln!("rejected: scan {}: {}", rejected.scan_id, rejected.error);
    }

    if let Some(path) = output {
        write_json(path, &rows)?;
        println!("Wrote {} scheduled scans to {}", rows.len(), path.display());
    }
    Ok(())
}

fn print_schedule_table(rows: &[ScheduledScan]) {
    let starts: Vec<String> = rows
        .iter()
        .map(|r| {
            let t = r.start_datetime;
            format!("{} {:02}:{:02}", t.date(), t.hour(), t.minute())
        })
        .collect();
    let start_w = starts.iter().map(String::len).max().unwrap_or(0).max("start (utc)".len());
    let mut site_w = "site".len();
    let mut agent_w = "agent".len();
    let mut targets_w = "targets".len();
    for r in rows {
        site_w = site_w.max(r.snapshot.site_name().len());
        agent_w = agent_w.max(r.snapshot.agent_name().len());
        targets_w = targets_w.max(r.snapshot.targets().len().min(60));
    }
    let binary_w = "masscan".len();

    println!("\nScheduled scans: {}", rows.len());
    println!(
        "{:<start_w$}  {:<site_w$}  {:<agent_w$}  {:<binary_w$}  {:<targets_w$}",
        "start (utc)", "site", "agent", "binary", "targets",
    );
    println!(
        "{:-<start_w$}  {:-<site_w$}  {:-<agent_w$}  {:-<binary_w$}  {:-<targets_w$}",
        "", "", "", "", "",
    );
    for (r, start) in rows.iter().zip(&starts) {
        let mut targets = r.snapshot.targets().to_string();
        if targets.len() > 60 {
            targets.truncate(57);
            targets.push_str("...");
        }
        println!(
            "{:<start_w$}  {:<site_w$}  {:<agent_w$}  {:<binary_w$}  {:<targets_w$}",
            start,
            r.snapshot.site_name(),
            r.snapshot.agent_name(),
            r.snapshot.scan_binary().as_str(),
            targets,
        );
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
