//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the R-Fleet daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use r_fleet_common::config::AppConfig;
use r_fleet_common::{encode_text, init_tracing, new_registry};
use r_fleet_launch::sim::{fast_config, SimulatedFleet, SIM_ACCOUNT, SIM_CLOUD, SIM_NETWORK};
use r_fleet_launch::{LaunchMetrics, NetworkService};
use r_fleet_model::{CloudRegion, LaunchRequest, NetLocation};
use r_fleet_progress::{ProgressTick, TickCatalog};
use tokio::signal;
use tracing::{info, warn};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(author, version, about = "R-Fleet node launch daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Validate the configuration and print the effective values")]
    CheckConfig,
    #[command(about = "Print the progress tick catalog")]
    Ticks,
    #[command(about = "Launch a node against the in-process simulated cloud")]
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 0, value_name = "N", help = "Refuse the first N install connections")]
    refused_installs: usize,

    #[arg(long, help = "Make the install script fail")]
    failing_install: bool,

    #[arg(long = "unavailable-region", value_name = "REGION", help = "Region reporting no capacity (repeatable)")]
    unavailable_regions: Vec<String>,

    #[arg(long, value_name = "REGION", help = "Launch only in this region")]
    exact_region: Option<String>,

    #[arg(long, help = "Restore from backup instead of a fresh start")]
    restore: bool,

    #[arg(long, default_value_t = 0, value_name = "MS", help = "Delay every allocation")]
    allocate_delay_ms: u64,

    #[arg(long, help = "Keep the configured timings instead of the fast simulation profile")]
    configured_timings: bool,

    #[arg(long, help = "Print the launch metrics when done")]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/r-fleetd.toml"));

    let (config, source) = match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        Err(err) if cli.config.is_none() => {
            eprintln!("{err:#}; continuing with built-in defaults");
            (AppConfig::default(), None)
        }
        Err(err) => return Err(err),
    };
    init_tracing("r-fleetd", &config.logging)?;
    info!(source = ?source.as_ref().map(|path| path.display().to_string()), "configuration loaded");

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Ticks => print_ticks(&config),
        Commands::Simulate(args) => simulate(config, args).await,
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

fn print_ticks(config: &AppConfig) -> Result<()> {
    let catalog = match &config.meter.install_ticks {
        Some(path) => TickCatalog::from_install_file(path)?,
        None => TickCatalog::embedded()?,
    };
    for (index, tick) in catalog.ticks().iter().enumerate() {
        let marker = if index == catalog.standard_len() { "--" } else { "  " };
        println!(
            "{marker}{index:>3} {:>3}% {:<44} {:?} {}",
            tick.percent(),
            tick.message_key(),
            tick.match_type(),
            tick.pattern()
        );
    }
    Ok(())
}

async fn simulate(config: AppConfig, args: SimulateArgs) -> Result<()> {
    let config = if args.configured_timings {
        config
    } else {
        let mut fast = fast_config();
        fast.logging = config.logging;
        fast.metrics = config.metrics;
        fast.meter.install_ticks = config.meter.install_ticks;
        fast.launch.roles = config.launch.roles;
        fast
    };

    let fleet = SimulatedFleet::new();
    fleet.executor.refuse_connections(args.refused_installs);
    fleet.executor.fail_fatally(args.failing_install);
    fleet.executor.set_line_delay(Duration::from_millis(20));
    fleet.compute.set_allocate_delay(Duration::from_millis(args.allocate_delay_ms));
    for region in &args.unavailable_regions {
        fleet.compute.mark_unavailable(region);
    }

    let registry = new_registry();
    let metrics = if config.metrics.enabled {
        Some(LaunchMetrics::new(registry.clone())?)
    } else {
        None
    };
    let service = fleet.service(&config, metrics)?;
    let location = args
        .exact_region
        .map(|region| NetLocation::exact(CloudRegion::new(SIM_CLOUD, region)));
    let request = if args.restore {
        service.restore_network(SIM_NETWORK, location)?
    } else {
        service.start_network(SIM_NETWORK, location, false)?
    };
    info!(launch = %request.id, host = %request.host, "simulated launch started; ctrl-c cancels");

    let mut watcher = {
        let service = service.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || watch(&service, &request))
    };
    let finished = tokio::select! {
        result = &mut watcher => Some(result?),
        _ = signal::ctrl_c() => None,
    };
    let last = match finished {
        Some(last) => last,
        None => {
            warn!("ctrl-c received; canceling launch");
            let canceler = service.clone();
            tokio::task::spawn_blocking(move || canceler.cancel_launch(SIM_NETWORK)).await?;
            watcher.await?
        }
    };

    match &last {
        Some(tick) => println!(
            "launch {} finished: {} at {}%{}",
            request.id,
            tick.message_key,
            tick.percent,
            tick.details
                .as_deref()
                .map(|details| format!(" ({details})"))
                .unwrap_or_default()
        ),
        None => println!("launch {} finished without a status", request.id),
    }
    if let Some(network) = fleet.network() {
        println!("network {}: {}", network.id, network.state);
    }
    for node in fleet.nodes() {
        println!(
            "node {} {} {}/{} {}",
            node.id,
            node.fqdn,
            node.cloud,
            node.region,
            node.state
        );
    }
    if args.print_metrics && config.metrics.enabled {
        print!("{}", encode_text(&registry)?);
    }
    service.shutdown();
    Ok(())
}

/// Print status changes until the launch worker leaves the supervisor.
fn watch(service: &NetworkService, request: &LaunchRequest) -> Option<ProgressTick> {
    let mut last: Option<ProgressTick> = None;
    loop {
        let running = service.supervisor().registered_launch(&request.network).as_deref()
            == Some(request.id.as_str());
        match service.get_launch_status(SIM_ACCOUNT, &request.id) {
            Ok(Some(tick)) => {
                let changed = last.as_ref().map_or(true, |seen| {
                    seen.message_key != tick.message_key || seen.percent != tick.percent
                });
                if changed {
                    println!("{:>3}% {}", tick.percent, tick.message_key);
                }
                last = Some(tick);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not read launch status"),
        }
        if !running {
            return last;
        }
        thread::sleep(WATCH_INTERVAL);
    }
}
