//! Portwarden - per-process application firewall daemon
//!
//! Netfilter queues DNS responses and new connections to this process; each
//! packet is attributed to the process owning its socket and gets a verdict
//! from the rule set.

mod config;
mod conn;
mod dns;
mod firewall;
mod pipeline;
mod policy;
mod proc_parser;
mod process;
mod queue;
mod resolver;
mod rules;
mod shutdown;
mod whitelist;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use config::{Config, Fallback, Mode, CONFIG_PATH};
use dns::DnsCache;
use firewall::{FirewallController, Iptables};
use pipeline::{ingest, Pipeline, WorkerPool};
use policy::{Notifier, RulePolicy};
use process::{ProcMonitor, ProcessMonitor};
use queue::{NfQueue, Verdict};
use resolver::ConnectionResolver;
use rules::RuleSet;
use shutdown::Shutdown;

/// Per-process application firewall on top of Netfilter Queue.
///
/// Runs either as the long-lived verdict daemon or, with one of the
/// firewall flags, as a one-shot rule installer.
#[derive(Parser, Debug)]
#[command(name = "portwarden", version, about)]
struct Args {
    /// Install the iptables rules that feed the queue, then exit.
    #[arg(long, conflicts_with = "teardown_firewall")]
    setup_firewall: bool,

    /// Remove the iptables rules, then exit.
    #[arg(long)]
    teardown_firewall: bool,

    /// Netfilter queue number.
    #[arg(long, default_value_t = 0)]
    queue_num: u16,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,

    /// Disable debug logs.
    #[arg(long = "noDebug")]
    no_debug: bool,

    /// Configuration file (JSON).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the configured mode for unmatched connections.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.no_debug { "info" } else { "debug" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.setup_firewall || args.teardown_firewall {
        let enable = args.setup_firewall;
        info!("firewall {}", if enable { "up" } else { "down" });
        let controller = FirewallController::new(Iptables::default(), args.queue_num, config.drop_mark);
        return match controller.apply(enable) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run_daemon(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let explicit = args.config.is_some();
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let mut config = Config::load(&path, explicit)?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    Ok(config)
}

fn run_daemon(args: &Args, config: Config) -> Result<()> {
    // Before any thread exists, so every thread inherits the mask
    let signals =
        shutdown::block_termination_signals().context("failed to block termination signals")?;

    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root, binding the queue will likely fail");
    }

    let monitor: Arc<dyn ProcessMonitor> = Arc::new(ProcMonitor::new(config.monitor_refresh()));
    monitor.start().context("failed to start process monitor")?;

    let dns = Arc::new(DnsCache::new(config.dns_cache_capacity, config.dns_max_age()));
    let notifier = config.notifier.as_ref().map(Notifier::new);
    let policy = Arc::new(RulePolicy::new(
        RuleSet::load(config.rules_path.clone()),
        config.mode,
        config.drop_mark,
        notifier,
    ));
    let fallback = match config.fallback_verdict {
        Fallback::Allow => Verdict::Allow,
        Fallback::Deny => Verdict::Deny {
            mark: Some(config.drop_mark),
        },
    };
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&dns),
        ConnectionResolver::new(Arc::clone(&monitor), Arc::clone(&dns)),
        policy,
        config.policy_timeout(),
        fallback,
    ));

    debug!("Starting {} workers ...", args.workers);
    let (work_tx, work_rx) = bounded(config.channel_capacity);
    let workers = WorkerPool::start(usize::from(args.workers), work_rx, Arc::clone(&pipeline))
        .context("failed to start workers")?;

    let queue = NfQueue::open(args.queue_num)
        .with_context(|| format!("Error while creating queue #{}", args.queue_num))?;
    let closer = queue.closer();

    let shutdown = Arc::new(Shutdown::new());
    shutdown::spawn_signal_listener(signals, Arc::clone(&shutdown))
        .context("failed to start signal listener")?;

    info!(
        "Running on netfilter queue #{} in {:?} mode ...",
        queue.queue_num(),
        config.mode
    );
    let ingestion = thread::Builder::new()
        .name("ingest".into())
        .spawn(move || ingest(queue.packets(), work_tx))
        .context("failed to start ingestion thread")?;

    shutdown.wait();
    closer.close();
    match ingestion.join() {
        Ok(forwarded) => debug!("Ingestion stopped after {} packets", forwarded),
        Err(_) => warn!("Ingestion thread panicked"),
    }

    shutdown.finish(workers, monitor.as_ref(), config.drain_timeout());
    let released = closer.release_pending();
    if released > 0 {
        warn!("Accepted {} packets still waiting for a verdict", released);
    }
    info!("{}", pipeline.stats());
    debug!("{} DNS records cached", dns.len());
    info!("Firewall rules left in place, run with --teardown-firewall to remove them");
    Ok(())
}
