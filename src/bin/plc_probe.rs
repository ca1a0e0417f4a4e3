//! PLC commissioning probe
//!
//! Pulses or reads a single tag through the same client the daemon uses,
//! so coil maps can be checked against the field wiring before go-live.
//!
//! Usage:
//!   plc_probe --config config/site.toml pulse caster_5_new --ms 500
//!   plc_probe read gate1_state
//!   plc_probe tags

use anyhow::{bail, Result};
use castline::infra::Config;
use castline::io::create_plc;
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plc_probe", version, about = "Pulse or read single PLC tags")]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Drive a tag high for --ms milliseconds, then low
    Pulse {
        tag: String,
        /// Pulse width (default: plc.pulse_ms)
        #[arg(long)]
        ms: Option<u64>,
    },
    /// Read a boolean tag
    Read {
        tag: String,
        /// Keep reading every N milliseconds
        #[arg(long)]
        watch_ms: Option<u64>,
    },
    /// List configured roles and coil addresses
    Tags,
}

fn stamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| "-".to_string())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::from_file(&path)?;
    let plc_cfg = config.plc();

    if let Cmd::Tags = args.cmd {
        let mut roles: Vec<_> = plc_cfg.tags.iter().collect();
        roles.sort();
        for (role, tag) in roles {
            let coil = plc_cfg.modbus.coils.get(tag).map_or("-".to_string(), |c| c.to_string());
            println!("{role:<20} {tag:<24} coil={coil}");
        }
        return Ok(());
    }

    let plc = create_plc(plc_cfg)?;
    let result = match args.cmd {
        Cmd::Pulse { tag, ms } => {
            let width = ms.map(Duration::from_millis).unwrap_or_else(|| plc_cfg.pulse());
            let started = Instant::now();
            plc.pulse(&tag, width).map(|()| {
                println!(
                    "{} pulse tag={tag} width_ms={} took_ms={}",
                    stamp(),
                    width.as_millis(),
                    started.elapsed().as_millis()
                );
            })
        }
        Cmd::Read { tag, watch_ms } => match watch_ms {
            None => plc.read_bool(&tag).map(|v| println!("{} read tag={tag} value={v}", stamp())),
            Some(0) => bail!("--watch-ms must be positive"),
            Some(every) => loop {
                match plc.read_bool(&tag) {
                    Ok(v) => println!("{} read tag={tag} value={v}", stamp()),
                    Err(e) => break Err(e),
                }
                std::thread::sleep(Duration::from_millis(every));
            },
        },
        Cmd::Tags => Ok(()),
    };
    plc.close();
    result
}
