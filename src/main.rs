//! ==============================================================================
//! main.rs - sense hub entry point
//! ==============================================================================
//!
//! purpose:
//!     one binary for both ends of the home sensor network. the configured
//!     role decides what it does:
//!
//!     - hub:   listen on port 8888, greet satellites, ack and decode their
//!              messages into the field registry, serve a status page.
//!     - spoke: read the local 1-wire probes once, push the readings to the
//!              hub and exit. run it from cron or a systemd timer.
//!
//! architecture:
//!
//!     ┌──────────────┐   tcp :8888    ┌──────────────────────────────────┐
//!     │ spoke        │ ─────────────> │ hub                              │
//!     │ sensor.rs    │  "label - v:t" │  server.rs  ──updates──> registry│
//!     │ client.rs    │ <───────────── │  (task per connection)      │    │
//!     └──────────────┘     "OK..."    │  status.rs <──snapshot──────┘    │
//!                                     └──────────────────────────────────┘
//!
//! exit status:
//!     non-zero when the hub cannot bind, or a spoke cannot reach or
//!     connect to the hub. an unacknowledged reading is logged, not fatal.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use sense_hub::config::{HostConfig, Role};
use sense_hub::hal::{AssumeReachable, FixedSensor, LivenessProbe, PingProbe, SensorSource};
use sense_hub::{client, protocol, registry, sensor, server, status};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
sense-hub - TCP hub and sensor client for a home IoT network

USAGE:
  sense-hub [OPTIONS]

OPTIONS:
  -h, --help            Prints help information
  --config <path>       Config file (default: config/sense-hub.toml)
  --role <hub|spoke>    Override the configured role
";

struct AppArgs {
    config: Option<std::path::PathBuf>,
    role: Option<Role>,
}

fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let args = AppArgs {
        config: pargs.opt_value_from_str("--config")?,
        role: pargs.opt_value_from_str("--role")?,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // startup banner
    println!("===========================================================");
    println!("  Sense Hub - home sensor network");
    println!("===========================================================");

    // step 1: load configuration
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::load_or_default(),
    };
    if let Some(role) = args.role {
        config.cluster.role = role;
    }

    // step 2: logging, RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.print_summary();

    // step 3: run the role
    match config.cluster.role {
        Role::Hub => run_hub(&config).await,
        Role::Spoke => run_spoke(&config).await,
    }
}

// ==============================================================================
// hub
// ==============================================================================

async fn run_hub(config: &HostConfig) -> Result<()> {
    let registry = registry::FieldRegistry::spawn(config.hub.labels.clone());

    if config.status.enabled {
        let bind = config.status.bind.clone();
        let status_registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = status::run_server(&bind, status_registry).await {
                tracing::error!("status server error: {:#}", e);
            }
        });
    }

    let hub = server::HubServer::bind(&config.hub, registry).await?;
    hub.serve(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("could not listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    println!("\n*****end of program ******\n");
    Ok(())
}

// ==============================================================================
// spoke
// ==============================================================================

async fn run_spoke(config: &HostConfig) -> Result<()> {
    let spoke = &config.spoke;

    let sensors: Vec<(String, Arc<dyn SensorSource>)> = spoke
        .sensors
        .iter()
        .map(|entry| {
            let source: Arc<dyn SensorSource> = if entry.device_id == "mock" {
                Arc::new(FixedSensor::new(21.5))
            } else {
                Arc::new(sensor::W1Thermometer::new(&entry.device_id))
            };
            (entry.label.clone(), source)
        })
        .collect();

    let readings = collect_readings(&sensors).await;
    if readings.is_empty() {
        anyhow::bail!("no sensor produced a reading");
    }

    let target = format!("{}:{}", spoke.server_ip, spoke.port);
    let addr = tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("resolving {}", target))?
        .next()
        .with_context(|| format!("{} did not resolve", target))?;

    let probe: Arc<dyn LivenessProbe> = if spoke.ping_count == 0 {
        Arc::new(AssumeReachable)
    } else {
        Arc::new(PingProbe::new(spoke.ping_count, spoke.interface.clone()))
    };

    let client = client::SensorClient::new(&spoke.server_ip, addr, spoke.retry_policy(), probe);
    let report = client.send(&readings).await?;

    for label in &report.delivered {
        tracing::info!("{} delivered", label);
    }
    if !report.all_delivered() {
        tracing::warn!(
            "{} of {} readings were not acknowledged",
            report.abandoned.len(),
            readings.len()
        );
    }

    println!("\n*****end of program ******\n");
    Ok(())
}

/// one reading per sensor; probes that fail twice are left out
async fn collect_readings(sensors: &[(String, Arc<dyn SensorSource>)]) -> Vec<protocol::Reading> {
    let now = protocol::now_epoch();
    let mut readings = Vec::new();

    for (label, source) in sensors {
        let celsius = match read_with_retry(source.clone()).await {
            Ok((c, f)) => {
                println!("[{}] {} degC - {:.3} degF", label, sensor::format_celsius(c), f);
                c
            }
            Err(e) => {
                tracing::warn!("[{}] ⚠ Read error: {:#}", label, e);
                continue;
            }
        };

        match protocol::Reading::new(label.clone(), sensor::format_celsius(celsius), now) {
            Ok(r) => readings.push(r),
            Err(e) => tracing::warn!("[{}] {}", label, e),
        }
    }

    readings
}

async fn read_with_retry(source: Arc<dyn SensorSource>) -> Result<(f32, f32)> {
    let first = {
        let source = source.clone();
        tokio::task::spawn_blocking(move || source.read_temperature()).await?
    };
    match first {
        Ok(pair) => Ok(pair),
        Err(e) => {
            tracing::debug!("first read failed, retrying: {:#}", e);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tokio::task::spawn_blocking(move || source.read_temperature()).await?
        }
    }
}
